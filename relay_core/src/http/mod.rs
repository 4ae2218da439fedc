//! HTTP surface of the relay
//!
//! Thin axum layer over the [`Coordinator`](crate::relay::Coordinator).

pub mod server;

pub use server::{create_router, serve, serve_listener};
