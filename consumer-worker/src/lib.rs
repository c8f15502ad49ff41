pub mod assignment;
pub mod config;
pub mod consumer;
pub mod error;
pub mod failure_counter;
pub mod strategy;
pub mod task;
pub mod worker;
pub mod worker_manager;
