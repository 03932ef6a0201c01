pub mod app;
pub mod connection;
pub mod deploy;
pub mod executor;
pub mod log_tail;
pub mod manifest;
pub mod network;
pub mod robot;
pub mod settings;
pub mod shell;
pub mod status;
pub mod transfer;
pub mod writable;

#[cfg(feature = "impl-russh")]
pub mod ssh_russh;
