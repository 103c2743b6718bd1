//! Streaming `multipart/form-data` decoding.
//!
//! The decoder pulls from a byte stream and yields one field at a time without
//! holding the request body in memory. File parts are exposed as a stream that
//! borrows the decoder, so a field must be finished (or dropped) before the next
//! one is requested.

pub mod boundary;
pub mod decoder;

pub use decoder::{FieldBody, MultipartDecoder, MultipartField};

use std::io;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum MultipartError {
    #[error("not a multipart/form-data request")]
    NotMultipart,
    #[error("multipart boundary missing from content type")]
    MissingBoundary,
    #[error("multipart part has no field name")]
    MissingName,
    #[error("multipart part headers exceed {0} bytes")]
    HeadersTooLarge(usize),
    #[error("multipart field `{0}` exceeds the value size limit")]
    ValueTooLarge(String),
    #[error("malformed multipart body: {0}")]
    Malformed(&'static str),
    #[error("multipart body ended before the closing boundary")]
    UnexpectedEof,
    #[error(transparent)]
    Io(#[from] io::Error),
}
