//! # tether-client
//!
//! Client for tether servers.
//!
//! ```ignore
//! let client = RpcClient::new(ClientConfig::new("http://127.0.0.1:8080"))?;
//! let users = client.module("users");
//! let user = users.call("getUser", args![123, true]).await?.into_value()?;
//! ```

#![deny(unsafe_code)]

pub mod cancel;
pub mod client;
pub mod errors;
pub mod push;
pub mod response;

pub use cancel::{CallGuard, CancellationManager};
pub use client::{ClientConfig, ModuleProxy, RpcClient};
pub use errors::{ClientError, Result};
pub use push::{PushEvent, PushStream};
pub use response::{ByteStream, Response, ValueStream};
pub use tether_core::RichValue;
pub use tokio_util::sync::CancellationToken;
