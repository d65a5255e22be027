//! VLESS WebSocket Bridge
//!
//! Tunnels the VLESS handshake protocol over WebSocket: the first binary
//! message on a connection carries a handshake header with an identity token
//! and a destination, after which the connection relays raw TCP bytes to that
//! destination or forwards UDP/DNS datagrams to a DNS-over-HTTPS resolver.

pub mod config;
pub mod dns_relay;
pub mod protocol;
pub mod router;
pub mod session;

// Re-export commonly used types and functions
pub use config::{Config, ListenConfig, TunnelConfig, load_config};
pub use dns_relay::{DnsRelay, split_frames};
pub use protocol::{Address, Command, HandshakeHeader, ParseError, parse_handshake, response_prefix};
pub use router::{AppState, TUNNEL_PATH, build_router, parse_original_client_ip};
pub use session::BUFFER_SIZE;
