//! Data carried across the upload endpoints.
//!
//! Listing entries keep the field names the file browser already consumes;
//! the response envelopes use camelCase.

pub mod entry;
pub mod upload;
