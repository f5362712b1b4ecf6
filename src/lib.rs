pub mod config;
pub mod filters;
pub mod ingest;
pub mod lease;
pub mod logging;
pub mod maildir;
pub mod models;
pub mod parser;
pub mod providers;
pub mod removal;
pub mod storage;
pub mod sync;
pub mod threading;
pub mod watermark;
