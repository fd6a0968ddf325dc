pub mod config;
pub mod error;
pub mod executor;
pub mod row;
pub mod shutdown;
pub mod types;
