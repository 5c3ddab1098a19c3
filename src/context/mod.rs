//! Context building for conversation turns
//!
//! The window is derived from the session store on every turn and never
//! cached.

mod builder;

pub use builder::{ContextBuilder, ContextConfig, ContextWindow};
