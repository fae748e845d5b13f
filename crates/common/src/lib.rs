pub mod config;
pub mod db;
pub mod error;
pub mod metrics;
pub mod redis_pool;
pub mod types;
