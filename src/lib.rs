//! Read-only last-traded-price service backed by a single exchange.
//!
//! Prices arrive over a streaming WebSocket feed when it is healthy and over
//! polled REST requests when it is not; a TTL cache sits between ingestion
//! and the HTTP surface.

pub mod api;
pub mod cache;
pub mod config;
pub mod error;
pub mod middleware;
pub mod pairs;
pub mod ratelimit;
pub mod service;
pub mod upstream;
