//! Sandcastle library.
//!
//! Per-user sandboxed development environments on a single container host.
//! Each environment is a labelled Docker/Podman container with a persistent
//! workspace volume, no network except while packages install, and an audit
//! trail of every command and mutation.
//!
//! The binary (`sandcastle`) wires these modules together; the modules are
//! exposed here so other frontends and the integration tests can use them.

pub mod cleanup;
pub mod config;
pub mod container;
pub mod db;
pub mod environment;
pub mod error;
pub mod files;
pub mod packages;
pub mod sandbox;
pub mod security;

#[cfg(test)]
mod testing;
