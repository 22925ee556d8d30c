//! Client-facing HTTP surface.

mod routes;

pub use routes::{router, AppState};
