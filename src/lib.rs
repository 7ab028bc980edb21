pub mod app;
pub mod assign;
pub mod config;
pub mod gateway;
pub mod ingest;
pub mod notify;
pub mod realtime;
pub mod rules;
pub mod store;
pub mod types;
