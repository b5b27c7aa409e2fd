pub mod auth;
pub mod cli;
pub mod compactor;
pub mod files;
pub mod message_tracing;
pub mod models;
pub mod orchestrator;
pub mod providers;
pub mod router;
pub mod server;
pub mod transcoder;
