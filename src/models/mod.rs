pub mod config;
pub mod delta;
pub mod device;
pub mod state;
