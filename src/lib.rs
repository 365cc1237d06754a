pub mod adapters;
pub mod archive;
pub mod bridge;
pub mod config;
pub mod context;
pub mod core;
pub mod error;
pub mod logging;
pub mod rpc;
