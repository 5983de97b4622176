//! Model weight acquisition.
//!
//! - [`manager`]: Chunked, restartable download into local storage
//! - [`source`]: Transfer sources (HTTP, in-memory)

pub mod manager;
pub mod source;
