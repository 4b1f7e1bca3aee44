//! Pigeon directory server: registry of username -> address bindings.

pub mod config;
pub mod eventlog;
pub mod server;

pub use config::Config;
pub use server::DirectoryServer;
