//! Live traffic capture: frames are attributed to remote endpoints, folded
//! into per-remote flows, and reported as periodic deltas to subscribers.

pub mod api;
pub mod capture;
pub mod events;
pub mod geo;
pub mod models;
pub mod utils;
