//! reroute-core - regex routed development reverse proxy
//!
//! Compiles an ordered map of `pattern -> rule` into matchers and forwards
//! matching HTTP requests and upgrade handshakes to their upstream targets.
//!
//! The main components are organized into the following modules:
//! - `rule`: Rule definitions and the rule compiler
//! - `upstream`: Parsed upstream targets
//! - `dispatch`: Per-request matching and forward target resolution
//! - `forward`: The forwarding collaborator interface and header defaults
//! - `client`: hyper based forwarder
//! - `middleware`: Host request pipeline
//! - `upgrade`: Host upgrade event source
//! - `plugin`: Plugin hooks and the proxy plugin
//! - `service`: Per-connection host service
//! - `server`: Host HTTP server
//! - `tls`: Upstream and listener TLS configuration

pub mod client;
pub mod dispatch;
pub mod forward;
pub mod middleware;
pub mod plugin;
pub mod rule;
pub mod server;
pub mod service;
pub mod tls;
pub mod upgrade;
pub mod upstream;
pub mod utils;
pub use hyper;

pub use client::HyperForwarder;
pub use dispatch::Dispatcher;
pub use forward::{ForwardTarget, Forwarder};
pub use plugin::{Plugin, ProxyPlugin, ServerHandle};
pub use rule::{CompiledRule, HeaderOverride, ProxyOptions, RawRule, RuleError, compile};
pub use server::{Server, ServerMode};
