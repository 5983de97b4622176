//! safespace: conversation orchestration for a locally hosted language model.
//!
//! Downloads the model weights, owns the inference engine, and turns streamed
//! token output into a mutable chat transcript that a UI observes:
//!   download → model session → chat service → transcript + status snapshots

pub mod chat;
pub mod config;
pub mod download;
pub mod inference;
