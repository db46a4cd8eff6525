pub mod config;
pub mod dashboard;
pub mod error;
pub mod grading;
pub mod journal;
pub mod node;
pub mod notify;
pub mod sandbox;
pub mod scheduler;
pub mod shutdown;
pub mod store;
pub mod worker;
