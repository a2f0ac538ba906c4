use std::{fmt, str::FromStr};

use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Wire protocol version. Both peers must agree; there is no negotiation.
pub const PROTOCOL_VERSION: u8 = 0;

/// Size of the fixed request header: version(1) + action(1) + payload length(4, big-endian).
pub const FRAME_SIZE: usize = 6;

/// Upper bound for a forward payload (net type byte + `host:port`).
pub const MAX_FORWARD_PAYLOAD: usize = 64 * 1024;

// Routing metadata carried as handshake headers by the no-mux strategy.
pub const HEADER_MUXER_TYPE: &str = "x-edgeproxy-muxertype";
pub const HEADER_NETWORK: &str = "x-edgeproxy-network";
pub const HEADER_ACTION: &str = "x-edgeproxy-action";
pub const HEADER_DESTINATION: &str = "x-edgeproxy-dst";

#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("short read: expected {expected} bytes, got {got}")]
    ShortRead { expected: usize, got: usize },
    #[error("unsupported protocol version {0}")]
    UnsupportedVersion(u8),
    #[error("unsupported router action {0}")]
    UnsupportedAction(u8),
    #[error("unsupported network type {0}")]
    UnsupportedNetType(u8),
    #[error("empty forward payload")]
    EmptyPayload,
    #[error("payload too large: {0}")]
    PayloadTooLarge(usize),
    #[error("destination address is not valid utf-8")]
    InvalidDestination,
    #[error("io: {0}")]
    Io(#[from] std::io::Error),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum RouterAction {
    ConnectionForward = 0,
}

impl RouterAction {
    pub fn from_u8(v: u8) -> Result<Self, ProtocolError> {
        match v {
            0 => Ok(RouterAction::ConnectionForward),
            other => Err(ProtocolError::UnsupportedAction(other)),
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            RouterAction::ConnectionForward => "forward",
        }
    }
}

impl fmt::Display for RouterAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RouterAction {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim() {
            "forward" => Ok(RouterAction::ConnectionForward),
            other => Err(format!("unknown router action {other:?}")),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum NetType {
    Tcp = 0,
    Udp = 1,
}

impl NetType {
    pub fn from_u8(v: u8) -> Result<Self, ProtocolError> {
        match v {
            0 => Ok(NetType::Tcp),
            1 => Ok(NetType::Udp),
            other => Err(ProtocolError::UnsupportedNetType(other)),
        }
    }

    /// Maps a dial network name (`tcp`, `tcp4`, `udp6`, ...) to a net type.
    pub fn from_network(network: &str) -> Option<Self> {
        match network.trim().to_ascii_lowercase().as_str() {
            "tcp" | "tcp4" | "tcp6" => Some(NetType::Tcp),
            "udp" | "udp4" | "udp6" => Some(NetType::Udp),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            NetType::Tcp => "tcp",
            NetType::Udp => "udp",
        }
    }
}

impl fmt::Display for NetType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for NetType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        NetType::from_network(s).ok_or_else(|| format!("unknown network {s:?}"))
    }
}

/// Fixed-size header preceding every request on a logical stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Frame {
    pub version: u8,
    pub action: RouterAction,
    pub payload_len: u32,
}

impl Frame {
    pub fn forward(payload_len: u32) -> Self {
        Self {
            version: PROTOCOL_VERSION,
            action: RouterAction::ConnectionForward,
            payload_len,
        }
    }

    pub fn to_bytes(&self) -> [u8; FRAME_SIZE] {
        let len = self.payload_len.to_be_bytes();
        [
            self.version,
            self.action as u8,
            len[0],
            len[1],
            len[2],
            len[3],
        ]
    }

    pub fn from_bytes(b: [u8; FRAME_SIZE]) -> Result<Self, ProtocolError> {
        if b[0] != PROTOCOL_VERSION {
            return Err(ProtocolError::UnsupportedVersion(b[0]));
        }
        let action = RouterAction::from_u8(b[1])?;
        let payload_len = u32::from_be_bytes([b[2], b[3], b[4], b[5]]);
        Ok(Self {
            version: b[0],
            action,
            payload_len,
        })
    }
}

/// Payload of a `ConnectionForward` request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ForwardFrame {
    pub net_type: NetType,
    pub dst_addr: String,
}

impl ForwardFrame {
    pub fn encoded_len(&self) -> usize {
        1 + self.dst_addr.len()
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.encoded_len());
        out.push(self.net_type as u8);
        out.extend_from_slice(self.dst_addr.as_bytes());
        out
    }

    pub fn from_bytes(b: &[u8]) -> Result<Self, ProtocolError> {
        let (&nt, addr) = b.split_first().ok_or(ProtocolError::EmptyPayload)?;
        let net_type = NetType::from_u8(nt)?;
        let dst_addr = std::str::from_utf8(addr)
            .map_err(|_| ProtocolError::InvalidDestination)?
            .to_string();
        Ok(Self { net_type, dst_addr })
    }
}

/// Builds the header and payload for a forward request to `dst_addr`.
pub fn encode_forward(
    dst_addr: &str,
    net_type: NetType,
) -> Result<(Frame, ForwardFrame), ProtocolError> {
    let fwd = ForwardFrame {
        net_type,
        dst_addr: dst_addr.to_string(),
    };
    let len = fwd.encoded_len();
    if len > MAX_FORWARD_PAYLOAD {
        return Err(ProtocolError::PayloadTooLarge(len));
    }
    Ok((Frame::forward(len as u32), fwd))
}

async fn read_full<R: AsyncRead + Unpin>(r: &mut R, buf: &mut [u8]) -> Result<(), ProtocolError> {
    let mut got = 0;
    while got < buf.len() {
        let n = r.read(&mut buf[got..]).await?;
        if n == 0 {
            return Err(ProtocolError::ShortRead {
                expected: buf.len(),
                got,
            });
        }
        got += n;
    }
    Ok(())
}

pub async fn read_header<R: AsyncRead + Unpin>(r: &mut R) -> Result<Frame, ProtocolError> {
    let mut b = [0u8; FRAME_SIZE];
    read_full(r, &mut b).await?;
    Frame::from_bytes(b)
}

pub async fn read_payload<R: AsyncRead + Unpin>(
    r: &mut R,
    frame: &Frame,
) -> Result<ForwardFrame, ProtocolError> {
    let len = frame.payload_len as usize;
    if len > MAX_FORWARD_PAYLOAD {
        return Err(ProtocolError::PayloadTooLarge(len));
    }
    let mut buf = vec![0u8; len];
    read_full(r, &mut buf).await?;
    ForwardFrame::from_bytes(&buf)
}

/// Reads the request that opens every session-mux stream.
pub async fn read_request<R: AsyncRead + Unpin>(
    r: &mut R,
) -> Result<(Frame, ForwardFrame), ProtocolError> {
    let frame = read_header(r).await?;
    let fwd = read_payload(r, &frame).await?;
    Ok((frame, fwd))
}

pub async fn write_forward<W: AsyncWrite + Unpin>(
    w: &mut W,
    dst_addr: &str,
    net_type: NetType,
) -> Result<(), ProtocolError> {
    let (frame, fwd) = encode_forward(dst_addr, net_type)?;
    let mut buf = Vec::with_capacity(FRAME_SIZE + fwd.encoded_len());
    buf.extend_from_slice(&frame.to_bytes());
    buf.extend_from_slice(&fwd.to_bytes());
    w.write_all(&buf).await?;
    w.flush().await?;
    Ok(())
}
