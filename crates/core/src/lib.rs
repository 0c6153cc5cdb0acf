//! Core crate for the snapscan upload and detection service.

pub mod config;
pub mod detection;
pub mod logging;
pub mod metadata;
pub mod notify;
pub mod pipeline;
pub mod server;
pub mod storage;
