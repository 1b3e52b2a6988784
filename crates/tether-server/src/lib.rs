//! # tether-server
//!
//! Axum server exposing registered modules over HTTP.
//!
//! - Convention-based routing: `getUser` answers `GET {prefix}/{module}/user`
//! - Role gate on bearer JWTs, guest identities, pluggable user store
//! - Per-call [`RequestContext`](rpc::RequestContext) reachable from any
//!   await point in the handler, with cancellation on client disconnect
//! - Generators become SSE streams; byte streams are passed through
//! - SSE push hub with one subscription per user and keep-alives
//! - Health, Prometheus metrics and graceful shutdown

#![deny(unsafe_code)]

pub mod auth;
pub mod config;
pub mod health;
pub mod hub;
pub mod metrics;
pub mod rpc;
pub mod server;
pub mod session;
pub mod shutdown;
pub mod users;

pub use config::ServerConfig;
pub use hub::{Hub, HubClient, SubscriptionHooks};
pub use rpc::{Args, Dispatcher, Module, Reply, RequestContext};
pub use server::{ServerHandle, TetherServer};
