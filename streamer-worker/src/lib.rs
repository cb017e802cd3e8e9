//! Consume Redis streams as a member of a consumer group, handling entries concurrently.
pub mod cli;
pub mod config;
pub mod dispatch;
pub mod driver;
pub mod error;
pub mod group;
pub mod handler;
pub mod session;
pub mod signals;
pub mod unpack;
