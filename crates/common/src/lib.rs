pub mod cache;
pub mod config;
pub mod db;
pub mod error;
pub mod explorer;
pub mod observability;
pub mod types;
