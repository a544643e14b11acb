pub mod aggregator;
pub mod backend;
pub mod classifier;
pub mod context;
pub mod filter;
pub mod manager;
pub mod scheduler;
pub mod worker;
