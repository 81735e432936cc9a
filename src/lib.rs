pub mod app;
pub mod bundle;
pub mod channel;
pub mod config;
pub mod domain;
pub mod error;
pub mod handles;
pub mod manifest;
pub mod output;
pub mod sanitize;
pub mod store;
