pub mod aggregate;
pub mod cache;
pub mod config;
pub mod domain;
pub mod ingest;
pub mod jobs;
pub mod metrics;
pub mod pipeline;
pub mod snapshot;
pub mod storage;
