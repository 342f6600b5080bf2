pub mod app;
pub mod chat;
pub mod config;
pub mod error;
pub mod handlers;
pub mod metering;
pub mod protocol;
pub mod registry;
pub mod upstream;
