pub mod auth;
pub mod config;
pub mod connection;
pub mod context;
pub mod error;
pub mod listener;
pub mod protocol;
pub mod registry;
pub mod reply_wait;
pub mod transport;

#[cfg(test)] pub mod test_util;
