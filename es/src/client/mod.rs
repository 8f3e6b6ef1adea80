//! The client: control connection, command dispatch and transfer drivers.
//!
//! All state lives in an explicit [`context::ClientContext`] passed into
//! every command; there are no process-wide singletons.

pub mod commands;
pub mod connection;
pub mod context;
pub mod prompt;
pub mod rexec;
pub mod transfer;
