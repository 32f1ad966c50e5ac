//! Core domain model for icsync
//!
//! This crate defines the vocabulary shared by every other icsync crate:
//!
//! - [`domain`] - assets, albums and the closed error taxonomy
//! - [`config`] - the runtime configuration assembled by the CLI
//! - [`events`] - the typed lifecycle/warning event stream
//! - [`ports`] - the [`RemoteLibrary`](ports::RemoteLibrary) port the sync
//!   engine consumes, implemented by `icsync-icloud` and by test doubles

pub mod config;
pub mod domain;
pub mod events;
pub mod ports;
