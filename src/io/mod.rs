//! I/O module
//!
//! Handles the JSON-lines request and reply streams.
//!
//! # Components
//!
//! - `request_reader` - Streaming reader of request lines with line numbers
//! - `reply_writer` - Writer of reply lines

pub mod reply_writer;
pub mod request_reader;

pub use reply_writer::ReplyWriter;
pub use request_reader::{ReadError, RequestReader};
