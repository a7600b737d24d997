//! Meridian Core - Shared data model for the RPC layer
//!
//! Holds the pieces every protocol agrees on: dynamic argument values,
//! compression codes, the per-call invocation context and the registry of
//! method descriptors that client stubs resolve against.

pub mod compress;
pub mod context;
pub mod error;
pub mod method;
pub mod value;

pub use compress::CompressType;
pub use context::InvocationContext;
pub use error::{Error, Result};
pub use method::{HeaderMeta, MethodDescriptor, MethodRegistry};
pub use value::Value;
