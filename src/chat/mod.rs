//! Conversation state and the verbs that drive it.
//!
//! - [`transcript`]: Turn, Transcript and the mutation rules for streamed text
//! - [`service`]: The chat task composing transcript and model session

pub mod service;
pub mod transcript;
