//! Command-line upload client for the service's own HTTP API.

pub mod orchestrator;

pub use orchestrator::UploadOrchestrator;
