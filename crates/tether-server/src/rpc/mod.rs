//! RPC dispatch: registry, call arguments, ambient context and response
//! materialization.

pub mod args;
pub mod context;
pub mod handler;
pub mod materialize;
pub mod registry;
pub mod reply;

pub use args::Args;
pub use context::RequestContext;
pub use registry::{Dispatcher, MethodHandler, Module, ModuleBuilder, RegistryError};
pub use reply::Reply;
