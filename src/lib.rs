//! mailbridge: inbound email to AI reply pipeline.

pub mod auth;
pub mod config;
pub mod dispatch;
pub mod email;
pub mod error;
pub mod identity;
pub mod pipeline;
pub mod sender;
pub mod server;
pub mod store;
pub mod threads;
