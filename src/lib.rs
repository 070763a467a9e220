//! An authenticating forwarding HTTP proxy.
//!
//! Serves clients over cleartext HTTP and over TLS (HTTP/1.1 and HTTP/2 via
//! ALPN), relays plain HTTP requests to origin servers, tunnels arbitrary TCP
//! traffic via CONNECT, and exposes a status page on its own virtual host.

pub mod auth;
pub mod config;
pub mod dispatch;
pub mod headers;
pub mod registry;
pub mod server;
pub mod status;
pub mod tls;
pub mod tunnel;
