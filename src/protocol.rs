//! VLESS handshake header parsing and the response prefix.
//!
//! The handshake is the first binary message on a tunnel connection:
//!
//! ```text
//! +---------+----------+-------------+---------+---------+------+-----------+---------+
//! | Version | Identity | Options Len | Options | Command | Port | Addr Type | Address |
//! +---------+----------+-------------+---------+---------+------+-----------+---------+
//! |   1B    |   16B    |     1B      |   var   |   1B    |  2B  |    1B     |   var   |
//! +---------+----------+-------------+---------+---------+------+-----------+---------+
//! ```
//!
//! Option bytes are skipped, never decoded. Everything after the address
//! field is application payload and belongs to the selected relay.

use std::fmt;
use std::net::{Ipv4Addr, Ipv6Addr};

use thiserror::Error;
use uuid::Uuid;

/// Minimum handshake length: version + identity + options length + command
/// + port + address type + at least one address byte.
pub const MIN_HEADER_LEN: usize = 24;

/// Handshake parse failures. All of these are fatal to the connection.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ParseError {
    #[error("handshake header truncated: need {expected} bytes, got {actual}")]
    Truncated { expected: usize, actual: usize },

    #[error("authentication failed: identity token mismatch")]
    UnauthorizedIdentity,

    #[error("unsupported command: {0:#04x} (expected 0x01=TCP or 0x02=UDP)")]
    UnsupportedCommand(u8),

    #[error("unsupported address type: {0:#04x} (expected 0x01=IPv4, 0x02=domain, 0x03=IPv6)")]
    UnsupportedAddressType(u8),
}

/// Relay mode requested by the client.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command {
    Tcp,
    Udp,
}

impl Command {
    fn from_byte(byte: u8) -> Result<Self, ParseError> {
        match byte {
            0x01 => Ok(Self::Tcp),
            0x02 => Ok(Self::Udp),
            other => Err(ParseError::UnsupportedCommand(other)),
        }
    }
}

/// Decoded destination address.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Address {
    Ipv4(Ipv4Addr),
    Domain(String),
    Ipv6(Ipv6Addr),
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Ipv4(ip) => write!(f, "{ip}"),
            Self::Domain(name) => write!(f, "{name}"),
            Self::Ipv6(ip) => write!(f, "{ip}"),
        }
    }
}

/// Parsed handshake header. Immutable once parsed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HandshakeHeader {
    /// Protocol version byte, echoed back in the response prefix.
    pub version: u8,
    pub command: Command,
    pub address: Address,
    pub port: u16,
    /// Index into the handshake buffer where application payload begins.
    /// Always within bounds of the parsed buffer.
    pub payload_offset: usize,
}

impl HandshakeHeader {
    /// Destination in `host:port` form suitable for `TcpStream::connect`.
    #[must_use]
    pub fn socket_string(&self) -> String {
        match &self.address {
            Address::Ipv6(ip) => format!("[{ip}]:{}", self.port),
            other => format!("{other}:{}", self.port),
        }
    }
}

/// Parses a VLESS handshake header from the first tunnel message.
///
/// Pure function, no side effects. The identity token is checked as soon as
/// it is read, so a mismatch is reported regardless of how well-formed the
/// rest of the buffer is.
pub fn parse_handshake(
    buf: &[u8],
    expected_identity: &Uuid,
) -> Result<HandshakeHeader, ParseError> {
    ensure_len(buf, MIN_HEADER_LEN)?;

    let version = buf[0];

    let mut identity = [0u8; 16];
    identity.copy_from_slice(&buf[1..17]);
    if Uuid::from_bytes(identity) != *expected_identity {
        return Err(ParseError::UnauthorizedIdentity);
    }

    // Option bytes are skipped in length only; their content has no
    // defined semantics here.
    let options_len = usize::from(buf[17]);
    let command_at = 18 + options_len;
    ensure_len(buf, command_at + 4)?; // command + port + address type

    let command = Command::from_byte(buf[command_at])?;
    let port = u16::from_be_bytes([buf[command_at + 1], buf[command_at + 2]]);

    let address_at = command_at + 4;
    let (address, payload_offset) = match buf[command_at + 3] {
        0x01 => {
            ensure_len(buf, address_at + 4)?;
            let mut octets = [0u8; 4];
            octets.copy_from_slice(&buf[address_at..address_at + 4]);
            (Address::Ipv4(Ipv4Addr::from(octets)), address_at + 4)
        }
        0x02 => {
            ensure_len(buf, address_at + 1)?;
            let name_len = usize::from(buf[address_at]);
            let end = address_at + 1 + name_len;
            ensure_len(buf, end)?;
            let name = String::from_utf8_lossy(&buf[address_at + 1..end]).into_owned();
            (Address::Domain(name), end)
        }
        0x03 => {
            ensure_len(buf, address_at + 16)?;
            let mut octets = [0u8; 16];
            octets.copy_from_slice(&buf[address_at..address_at + 16]);
            (Address::Ipv6(Ipv6Addr::from(octets)), address_at + 16)
        }
        other => return Err(ParseError::UnsupportedAddressType(other)),
    };

    Ok(HandshakeHeader {
        version,
        command,
        address,
        port,
        payload_offset,
    })
}

/// Two-byte acknowledgement sent to the client exactly once per session,
/// ahead of the first relayed response: the echoed version byte followed by
/// a reserved zero.
#[must_use]
pub fn response_prefix(header: &HandshakeHeader) -> [u8; 2] {
    [header.version, 0]
}

fn ensure_len(buf: &[u8], needed: usize) -> Result<(), ParseError> {
    if buf.len() < needed {
        return Err(ParseError::Truncated {
            expected: needed,
            actual: buf.len(),
        });
    }
    Ok(())
}
