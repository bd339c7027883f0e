//! # hapax-core
//!
//! Shared vocabulary for the Hapax gateway: the unified error type, the
//! provider-neutral prompt format, and the per-request context that flows
//! through the middleware chain and into the provider manager.

pub mod context;
pub mod error;
pub mod message;
pub mod types;

pub use context::RequestContext;
pub use error::{HapaxError, Result};
pub use message::{Prompt, PromptMessage, Role};
pub use types::*;
