// ABOUTME: Library root for imagegw - exposes the gateway building blocks for testing.
// ABOUTME: The server binary is in main.rs.

pub mod api;
pub mod auth;
pub mod config;
pub mod dispatch;
pub mod error;
pub mod orchestrator;
pub mod record;
pub mod store;
pub mod types;
