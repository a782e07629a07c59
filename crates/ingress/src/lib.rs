//! Faros ingress: expose local HTTP services publicly through a gateway.
//!
//! The gateway terminates public TLS traffic, resolves the request hostname to
//! a registered connection and proxies the request through a reverse-dialed
//! HTTP/2 tunnel to the connector next to the user's service. The management
//! API creates and deletes connections; gateway processes keep their in-memory
//! routing state in sync through the store's change stream.

pub mod api;
pub mod client;
pub mod config;
pub mod connector;
pub mod gateway;
pub mod http;
pub mod serve;
pub mod store;
pub mod types;

pub use config::{Config, ConnectorConfig};
