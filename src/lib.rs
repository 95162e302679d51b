pub mod api;
pub mod config;
pub mod error;
pub mod payload;
pub mod scheduler;
pub mod service;
pub mod shutdown;
pub mod worker;
