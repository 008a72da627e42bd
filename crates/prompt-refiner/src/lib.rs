pub mod app;
pub mod config;
pub mod prompts;
pub mod providers;
pub mod refine;
pub mod retrieval;
pub mod server;
pub mod storage;
pub mod telemetry;
