pub mod breaker;
pub mod config;
pub mod digest;
pub mod download;
pub mod error;
pub mod manifest;
pub mod messages;
pub mod net;
pub mod peers;
pub mod splitter;
pub mod store;
pub mod swarm;
pub mod tracker;
