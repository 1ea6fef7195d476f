#![warn(clippy::unwrap_used)]

pub mod computed_rest;
pub mod rest;
pub mod segments_rest;
pub mod server;

pub use rest::AppState;
pub use server::{router, ApiServer};
