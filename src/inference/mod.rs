//! LLM inference.
//!
//! - [`backend`]: The engine contract and its error types
//! - [`llama`]: llama.cpp-shaped engine
//! - [`model_loader`]: Weight file inspection
//! - [`scripted`]: Deterministic engine for tests and demos
//! - [`session`]: Model lifecycle, single-flight streaming generation
//! - [`template`]: Prompt formats

pub mod backend;
pub mod llama;
pub mod model_loader;
pub mod scripted;
pub mod session;
pub mod template;
