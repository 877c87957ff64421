pub mod api;
pub mod config;
pub mod error;
pub mod estimation;
pub mod ratelimit;
pub mod state;
pub mod store;
pub mod traffic;
pub mod vote;
