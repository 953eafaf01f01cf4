//! lazydev - a scale-to-zero reverse proxy for local dev servers
//!
//! This library provides a daemon that:
//! - Routes HTTP traffic for `<name>.localhost` subdomains to registered projects
//! - Starts a project's dev server lazily on the first request
//! - Health-gates cold starts before any traffic is forwarded
//! - Bridges WebSocket upgrades and keeps socket-holding projects alive
//! - Stops servers that have been idle past a dynamically computed timeout
//! - Persists runtime state so orphaned servers survive daemon restarts
//! - Hot-reloads its YAML configuration without dropping the listener

pub mod config;
pub mod daemon;
pub mod error;
pub mod idle;
pub mod ports;
pub mod proxy;
pub mod store;
pub mod supervisor;
pub mod upstream;
pub mod watcher;
