pub mod coordinator;
pub mod fetch;
pub mod metrics;
pub mod offsets;
pub mod types;
