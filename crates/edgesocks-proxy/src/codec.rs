//! SOCKS5 wire codec (RFC 1928 subset).
//!
//! Reads the method-selection handshake and the client request from a live
//! stream. Every field is read with `read_exact`, so a message split across
//! any number of TCP segments decodes the same as one that arrives whole.
//!
//! # Handshake
//!
//! ```text
//! +----+----------+----------+        +----+--------+
//! |VER | NMETHODS | METHODS  |  --->  |VER | METHOD |
//! +----+----------+----------+        +----+--------+
//! | 1  |    1     | 1 to 255 |        | 1  |   1    |
//! +----+----------+----------+        +----+--------+
//! ```
//!
//! # Request
//!
//! ```text
//! +----+-----+-------+------+----------+----------+
//! |VER | CMD |  RSV  | ATYP | DST.ADDR | DST.PORT |
//! +----+-----+-------+------+----------+----------+
//! | 1  |  1  | X'00' |  1   | Variable |    2     |
//! +----+-----+-------+------+----------+----------+
//! ```
//!
//! The codec never writes the request reply; the dispatcher sends
//! [`DEFAULT_REPLY`] once a tunnel stream exists.

use crate::Result;
use std::fmt;
use std::net::{Ipv4Addr, Ipv6Addr};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Protocol version byte.
pub const VERSION: u8 = 0x05;

/// "No authentication required" method id.
pub const METHOD_NO_AUTH: u8 = 0x00;

/// Success status, used by both the method reply and the request reply.
pub const SUCCESS: u8 = 0x00;

pub const ATYP_IPV4: u8 = 0x01;
pub const ATYP_DOMAIN: u8 = 0x03;
pub const ATYP_IPV6: u8 = 0x04;

pub const CMD_CONNECT: u8 = 0x01;
pub const CMD_BIND: u8 = 0x02;
pub const CMD_UDP_ASSOCIATE: u8 = 0x03;

/// Reply sent after a tunnel stream is obtained.
///
/// The bound address and port are never filled in: `0.0.0.0:0`.
pub const DEFAULT_REPLY: [u8; 10] = [VERSION, SUCCESS, 0x00, ATYP_IPV4, 0, 0, 0, 0, 0, 0];

/// SOCKS5 reply codes.
pub mod reply {
    pub const SUCCEEDED: u8 = 0x00;
    pub const GENERAL_FAILURE: u8 = 0x01;
    pub const CONNECTION_NOT_ALLOWED: u8 = 0x02;
    pub const NETWORK_UNREACHABLE: u8 = 0x03;
    pub const HOST_UNREACHABLE: u8 = 0x04;
    pub const CONNECTION_REFUSED: u8 = 0x05;
    pub const TTL_EXPIRED: u8 = 0x06;
    pub const COMMAND_NOT_SUPPORTED: u8 = 0x07;
    pub const ADDRESS_TYPE_NOT_SUPPORTED: u8 = 0x08;
}

/// Malformed or unsupported handshake/request bytes.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ProtocolError {
    #[error("invalid version {0:#04x}")]
    InvalidVersion(u8),

    #[error("method length error: client offered no methods")]
    NoMethods,

    #[error("no acceptable method: only no-authentication is supported")]
    NoAcceptableMethod,

    #[error("unsupported address type {0:#04x}")]
    UnsupportedAddressType(u8),

    #[error("destination name is not valid UTF-8")]
    InvalidDomain,
}

/// Requested operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command {
    Connect,
    Bind,
    UdpAssociate,
    Unknown(u8),
}

impl From<u8> for Command {
    fn from(byte: u8) -> Self {
        match byte {
            CMD_CONNECT => Self::Connect,
            CMD_BIND => Self::Bind,
            CMD_UDP_ASSOCIATE => Self::UdpAssociate,
            other => Self::Unknown(other),
        }
    }
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Connect => f.write_str("CONNECT"),
            Self::Bind => f.write_str("BIND"),
            Self::UdpAssociate => f.write_str("UDP ASSOCIATE"),
            Self::Unknown(b) => write!(f, "{b:#04x}"),
        }
    }
}

/// Destination address encoding.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AddressType {
    Ipv4,
    Domain,
    Ipv6,
}

impl TryFrom<u8> for AddressType {
    type Error = ProtocolError;

    fn try_from(byte: u8) -> std::result::Result<Self, Self::Error> {
        match byte {
            ATYP_IPV4 => Ok(Self::Ipv4),
            ATYP_DOMAIN => Ok(Self::Domain),
            ATYP_IPV6 => Ok(Self::Ipv6),
            other => Err(ProtocolError::UnsupportedAddressType(other)),
        }
    }
}

/// One parsed client request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Request {
    pub version: u8,
    pub command: Command,
    /// Stored as read; never interpreted.
    pub reserved: u8,
    pub address_type: AddressType,
    /// Dotted IPv4, RFC 5952 IPv6, or the raw domain name.
    pub dst_addr: String,
    pub dst_port: u16,
}

/// Read the method-selection message and answer with no-authentication.
///
/// # Errors
/// * `ProtocolError::InvalidVersion` - first byte is not 5
/// * `ProtocolError::NoMethods` - method count is zero
/// * `ProtocolError::NoAcceptableMethod` - 0x00 not offered
/// * `ProxyError::Io` - read or write failure (including short streams)
pub async fn read_handshake<S>(stream: &mut S) -> Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let mut header = [0u8; 2];
    stream.read_exact(&mut header).await?;

    if header[0] != VERSION {
        return Err(ProtocolError::InvalidVersion(header[0]).into());
    }
    if header[1] == 0 {
        return Err(ProtocolError::NoMethods.into());
    }

    let mut methods = vec![0u8; usize::from(header[1])];
    stream.read_exact(&mut methods).await?;

    if !methods.contains(&METHOD_NO_AUTH) {
        return Err(ProtocolError::NoAcceptableMethod.into());
    }

    stream.write_all(&[VERSION, SUCCESS]).await?;
    stream.flush().await?;
    Ok(())
}

/// Read one request message.
///
/// # Errors
/// * `ProtocolError::InvalidVersion` - first byte is not 5
/// * `ProtocolError::UnsupportedAddressType` - ATYP not 1, 3 or 4
/// * `ProtocolError::InvalidDomain` - domain bytes are not UTF-8
/// * `ProxyError::Io` - read failure (including short streams)
pub async fn read_request<S>(stream: &mut S) -> Result<Request>
where
    S: AsyncRead + Unpin,
{
    let mut header = [0u8; 4];
    stream.read_exact(&mut header).await?;

    if header[0] != VERSION {
        return Err(ProtocolError::InvalidVersion(header[0]).into());
    }

    let address_type = AddressType::try_from(header[3])?;
    let dst_addr = match address_type {
        AddressType::Ipv4 => {
            let mut octets = [0u8; 4];
            stream.read_exact(&mut octets).await?;
            Ipv4Addr::from(octets).to_string()
        }
        AddressType::Ipv6 => {
            let mut octets = [0u8; 16];
            stream.read_exact(&mut octets).await?;
            Ipv6Addr::from(octets).to_string()
        }
        AddressType::Domain => {
            let len = stream.read_u8().await?;
            let mut name = vec![0u8; usize::from(len)];
            stream.read_exact(&mut name).await?;
            String::from_utf8(name).map_err(|_| ProtocolError::InvalidDomain)?
        }
    };

    let dst_port = stream.read_u16().await?;

    Ok(Request {
        version: header[0],
        command: Command::from(header[1]),
        reserved: header[2],
        address_type,
        dst_addr,
        dst_port,
    })
}

/// Failure reply with the given RFC 1928 code and a zero bound address.
pub fn failure_reply(code: u8) -> [u8; 10] {
    let mut out = DEFAULT_REPLY;
    out[1] = code;
    out
}
