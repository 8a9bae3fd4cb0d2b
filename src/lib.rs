#![forbid(unsafe_code)]

pub mod artifact_store;
pub mod browser;
pub mod challenge;
pub mod clean;
pub mod cli;
pub mod config;
pub mod extract;
pub mod fetch;
pub mod formats;
pub mod logging;
pub mod manifest;
pub mod pipeline;
pub mod render;
pub mod report;
pub mod retry;
pub mod sanitize;
pub mod scheduler;
pub mod stealth;
