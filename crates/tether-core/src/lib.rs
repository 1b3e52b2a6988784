//! # tether-core
//!
//! Foundation shared by the tether server and client:
//! - [`route`]: the method-name → (verb, path) convention both sides follow
//! - [`codec`]: [`RichValue`] and its JSON wire form (dates, bytes, maps, sets)
//! - [`errors`]: the [`RpcError`] taxonomy and its HTTP status mapping
//! - [`principal`]: caller identity
//! - [`protocol`]: header names, fixed endpoints and wire payloads
//! - [`logging`]: `tracing` subscriber bootstrap

#![deny(unsafe_code)]

pub mod codec;
pub mod errors;
pub mod logging;
pub mod principal;
pub mod protocol;
pub mod route;

pub use codec::{CodecError, RichValue};
pub use errors::RpcError;
pub use principal::Principal;
pub use route::{Verb, WireCall};
