use bytes::{BufMut, BytesMut};
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Session handshake magic, the first bytes of every control stream.
pub const MAGIC: &[u8; 4] = b"GRT1";

pub const MSG_REGISTER: u8 = 0x01;
pub const MSG_NEW_STREAM: u8 = 0x02;
pub const MSG_DATA: u8 = 0x03; // reserved
pub const MSG_CLOSE: u8 = 0x04; // reserved
pub const MSG_HEARTBEAT: u8 = 0x05;

pub const AUTH_TOKEN: u8 = 0x01;
pub const AUTH_MUTUAL_TLS: u8 = 0x02; // reserved

/// Every control-stream record (the handshake included) is prefixed with a
/// u16 length covering the record body, so message boundaries never depend
/// on how the multiplexer chunks reads. Data streams carry no such prefix:
/// the `NewStream` header is self-delimiting and TCP payload is opaque.
pub const MAX_RECORD_BYTES: usize = u16::MAX as usize;
pub const MAX_DATAGRAM_BYTES: usize = u16::MAX as usize;
pub const MAX_NAME_BYTES: usize = u8::MAX as usize;

#[derive(Debug, Error)]
pub enum CodecError {
    #[error("bad handshake magic")]
    BadMagic,
    #[error("handshake record too short")]
    ShortHandshake,
    #[error("empty control record")]
    EmptyRecord,
    #[error("truncated {0} message")]
    Truncated(&'static str),
    #[error("empty proxy name")]
    EmptyName,
    #[error("proxy name too long: {0} bytes")]
    NameTooLong(usize),
    #[error("unknown proxy kind tag {0:#04x}")]
    UnknownProxyKind(u8),
    #[error("expected NewStream header, got message type {0:#04x}")]
    UnexpectedMessage(u8),
    #[error("payload too large: {0} bytes")]
    PayloadTooLarge(usize),
    #[error("io: {0}")]
    Io(#[from] std::io::Error),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProxyKind {
    Tcp,
    Udp,
}

impl ProxyKind {
    pub fn tag(self) -> u8 {
        match self {
            ProxyKind::Tcp => 0x01,
            ProxyKind::Udp => 0x02,
        }
    }

    pub fn from_tag(tag: u8) -> Result<Self, CodecError> {
        match tag {
            0x01 => Ok(ProxyKind::Tcp),
            0x02 => Ok(ProxyKind::Udp),
            other => Err(CodecError::UnknownProxyKind(other)),
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "tcp" => Some(ProxyKind::Tcp),
            "udp" => Some(ProxyKind::Udp),
            _ => None,
        }
    }
}

impl std::fmt::Display for ProxyKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ProxyKind::Tcp => write!(f, "tcp"),
            ProxyKind::Udp => write!(f, "udp"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Handshake {
    pub auth_method: u8,
    pub auth_payload: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ControlMsg {
    Register {
        kind: ProxyKind,
        remote_port: u16,
        local_port: u16,
        name: String,
    },
    Heartbeat,
    /// Reserved (Data/Close) or unknown types; the session loop logs and skips these.
    Other(u8),
}

/// Header written by the server as the first bytes of every public-data stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamHeader {
    pub stream_id: u32,
    pub remote_port: u16,
    pub name: String,
}

async fn write_record<W: AsyncWrite + Unpin>(w: &mut W, body: &[u8]) -> Result<(), CodecError> {
    if body.len() > MAX_RECORD_BYTES {
        return Err(CodecError::PayloadTooLarge(body.len()));
    }
    let mut buf = BytesMut::with_capacity(2 + body.len());
    buf.put_u16(body.len() as u16);
    buf.put_slice(body);
    // One write call per record; writers to a stream must not interleave
    // partial messages.
    w.write_all(&buf).await?;
    w.flush().await?;
    Ok(())
}

/// Reads one length-prefixed record body from a control stream.
///
/// I/O errors (including EOF) are fatal for the session; the caller parses
/// the returned body separately so malformed records can be skipped.
pub async fn read_record<R: AsyncRead + Unpin>(r: &mut R) -> Result<Vec<u8>, CodecError> {
    let len = r.read_u16().await? as usize;
    let mut body = vec![0u8; len];
    r.read_exact(&mut body).await?;
    Ok(body)
}

pub async fn write_handshake<W: AsyncWrite + Unpin>(
    w: &mut W,
    auth_method: u8,
    auth_payload: &[u8],
) -> Result<(), CodecError> {
    let mut body = BytesMut::with_capacity(5 + auth_payload.len());
    body.put_slice(MAGIC);
    body.put_u8(auth_method);
    body.put_slice(auth_payload);
    write_record(w, &body).await
}

pub async fn read_handshake<R: AsyncRead + Unpin>(r: &mut R) -> Result<Handshake, CodecError> {
    let body = read_record(r).await?;
    parse_handshake(&body)
}

pub fn parse_handshake(body: &[u8]) -> Result<Handshake, CodecError> {
    if body.len() < 5 {
        return Err(CodecError::ShortHandshake);
    }
    if &body[..4] != MAGIC {
        return Err(CodecError::BadMagic);
    }
    Ok(Handshake {
        auth_method: body[4],
        auth_payload: body[5..].to_vec(),
    })
}

pub async fn write_register<W: AsyncWrite + Unpin>(
    w: &mut W,
    kind: ProxyKind,
    remote_port: u16,
    local_port: u16,
    name: &str,
) -> Result<(), CodecError> {
    let name = name.as_bytes();
    if name.is_empty() {
        return Err(CodecError::EmptyName);
    }
    let mut body = BytesMut::with_capacity(6 + name.len());
    body.put_u8(MSG_REGISTER);
    body.put_u8(kind.tag());
    body.put_u16(remote_port);
    body.put_u16(local_port);
    body.put_slice(name);
    write_record(w, &body).await
}

pub async fn write_heartbeat<W: AsyncWrite + Unpin>(w: &mut W) -> Result<(), CodecError> {
    write_record(w, &[MSG_HEARTBEAT]).await
}

pub fn parse_control(body: &[u8]) -> Result<ControlMsg, CodecError> {
    let Some((&msg_type, rest)) = body.split_first() else {
        return Err(CodecError::EmptyRecord);
    };
    match msg_type {
        MSG_REGISTER => {
            if rest.len() < 5 {
                return Err(CodecError::Truncated("register"));
            }
            let kind = ProxyKind::from_tag(rest[0])?;
            let remote_port = u16::from_be_bytes([rest[1], rest[2]]);
            let local_port = u16::from_be_bytes([rest[3], rest[4]]);
            let name = String::from_utf8_lossy(&rest[5..]).into_owned();
            if name.is_empty() {
                return Err(CodecError::EmptyName);
            }
            Ok(ControlMsg::Register {
                kind,
                remote_port,
                local_port,
                name,
            })
        }
        MSG_HEARTBEAT => Ok(ControlMsg::Heartbeat),
        other => Ok(ControlMsg::Other(other)),
    }
}

pub async fn write_stream_header<W: AsyncWrite + Unpin>(
    w: &mut W,
    stream_id: u32,
    remote_port: u16,
    name: &str,
) -> Result<(), CodecError> {
    let name = name.as_bytes();
    if name.len() > MAX_NAME_BYTES {
        return Err(CodecError::NameTooLong(name.len()));
    }
    let mut buf = BytesMut::with_capacity(8 + name.len());
    buf.put_u8(MSG_NEW_STREAM);
    buf.put_u32(stream_id);
    buf.put_u16(remote_port);
    buf.put_u8(name.len() as u8);
    buf.put_slice(name);
    w.write_all(&buf).await?;
    w.flush().await?;
    Ok(())
}

pub async fn read_stream_header<R: AsyncRead + Unpin>(
    r: &mut R,
) -> Result<StreamHeader, CodecError> {
    let msg_type = r.read_u8().await?;
    if msg_type != MSG_NEW_STREAM {
        return Err(CodecError::UnexpectedMessage(msg_type));
    }
    let stream_id = r.read_u32().await?;
    let remote_port = r.read_u16().await?;
    let name_len = r.read_u8().await? as usize;
    let mut name = vec![0u8; name_len];
    r.read_exact(&mut name).await?;
    Ok(StreamHeader {
        stream_id,
        remote_port,
        name: String::from_utf8_lossy(&name).into_owned(),
    })
}

/// Reads one `u16 length || bytes` datagram record, growing `buf` as needed.
/// Returns the payload length. Only UDP flows use this framing; it preserves
/// datagram boundaries that TCP splicing does not need.
pub async fn read_datagram<R: AsyncRead + Unpin>(
    r: &mut R,
    buf: &mut Vec<u8>,
) -> Result<usize, CodecError> {
    let len = r.read_u16().await? as usize;
    if len > buf.len() {
        buf.resize(len, 0);
    }
    r.read_exact(&mut buf[..len]).await?;
    Ok(len)
}

pub async fn write_datagram<W: AsyncWrite + Unpin>(
    w: &mut W,
    payload: &[u8],
) -> Result<(), CodecError> {
    if payload.len() > MAX_DATAGRAM_BYTES {
        return Err(CodecError::PayloadTooLarge(payload.len()));
    }
    let mut buf = BytesMut::with_capacity(2 + payload.len());
    buf.put_u16(payload.len() as u16);
    buf.put_slice(payload);
    w.write_all(&buf).await?;
    w.flush().await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn handshake_roundtrip() {
        let (mut a, mut b) = tokio::io::duplex(256);
        tokio::spawn(async move { write_handshake(&mut a, AUTH_TOKEN, b"s3cret").await });

        let hs = read_handshake(&mut b).await.unwrap();
        assert_eq!(hs.auth_method, AUTH_TOKEN);
        assert_eq!(hs.auth_payload, b"s3cret");
    }

    #[tokio::test]
    async fn handshake_accepts_empty_payload() {
        let (mut a, mut b) = tokio::io::duplex(64);
        tokio::spawn(async move { write_handshake(&mut a, AUTH_TOKEN, b"").await });

        let hs = read_handshake(&mut b).await.unwrap();
        assert_eq!(hs.auth_method, AUTH_TOKEN);
        assert!(hs.auth_payload.is_empty());
    }

    #[test]
    fn handshake_rejects_bad_magic() {
        let err = parse_handshake(b"GRT2\x01token").unwrap_err();
        assert!(matches!(err, CodecError::BadMagic));

        let err = parse_handshake(b"GRT").unwrap_err();
        assert!(matches!(err, CodecError::ShortHandshake));
    }

    #[tokio::test]
    async fn register_roundtrip() {
        let (mut a, mut b) = tokio::io::duplex(256);
        tokio::spawn(
            async move { write_register(&mut a, ProxyKind::Udp, 5353, 53, "dns").await },
        );

        let body = read_record(&mut b).await.unwrap();
        match parse_control(&body).unwrap() {
            ControlMsg::Register {
                kind,
                remote_port,
                local_port,
                name,
            } => {
                assert_eq!(kind, ProxyKind::Udp);
                assert_eq!(remote_port, 5353);
                assert_eq!(local_port, 53);
                assert_eq!(name, "dns");
            }
            other => panic!("unexpected message: {other:?}"),
        }
    }

    #[tokio::test]
    async fn back_to_back_records_keep_their_boundaries() {
        let (mut a, mut b) = tokio::io::duplex(1024);
        tokio::spawn(async move {
            write_register(&mut a, ProxyKind::Tcp, 8080, 3000, "web")
                .await
                .unwrap();
            write_heartbeat(&mut a).await.unwrap();
            write_register(&mut a, ProxyKind::Tcp, 8443, 3001, "api")
                .await
                .unwrap();
        });

        let first = parse_control(&read_record(&mut b).await.unwrap()).unwrap();
        let second = parse_control(&read_record(&mut b).await.unwrap()).unwrap();
        let third = parse_control(&read_record(&mut b).await.unwrap()).unwrap();

        assert!(matches!(first, ControlMsg::Register { ref name, .. } if name == "web"));
        assert_eq!(second, ControlMsg::Heartbeat);
        assert!(matches!(third, ControlMsg::Register { ref name, .. } if name == "api"));
    }

    #[test]
    fn reserved_and_unknown_types_are_skippable() {
        assert_eq!(parse_control(&[MSG_DATA, 0, 0, 0, 1]).unwrap(), ControlMsg::Other(MSG_DATA));
        assert_eq!(parse_control(&[MSG_CLOSE]).unwrap(), ControlMsg::Other(MSG_CLOSE));
        assert_eq!(parse_control(&[0x7f]).unwrap(), ControlMsg::Other(0x7f));
        assert!(matches!(parse_control(&[]), Err(CodecError::EmptyRecord)));
    }

    #[test]
    fn register_validation() {
        assert!(matches!(
            parse_control(&[MSG_REGISTER, 0x01, 0, 80]),
            Err(CodecError::Truncated("register"))
        ));
        assert!(matches!(
            parse_control(&[MSG_REGISTER, 0x09, 0, 80, 0, 80, b'x']),
            Err(CodecError::UnknownProxyKind(0x09))
        ));
        assert!(matches!(
            parse_control(&[MSG_REGISTER, 0x01, 0, 80, 0, 80]),
            Err(CodecError::EmptyName)
        ));
    }

    #[tokio::test]
    async fn stream_header_roundtrip() {
        let (mut a, mut b) = tokio::io::duplex(256);
        tokio::spawn(async move {
            write_stream_header(&mut a, 42, 8080, "web").await.unwrap();
            // Payload immediately follows the header on a data stream.
            a.write_all(b"payload").await.unwrap();
        });

        let hdr = read_stream_header(&mut b).await.unwrap();
        assert_eq!(hdr.stream_id, 42);
        assert_eq!(hdr.remote_port, 8080);
        assert_eq!(hdr.name, "web");

        let mut rest = [0u8; 7];
        b.read_exact(&mut rest).await.unwrap();
        assert_eq!(&rest, b"payload");
    }

    #[tokio::test]
    async fn stream_header_rejects_other_types() {
        let (mut a, mut b) = tokio::io::duplex(64);
        tokio::spawn(async move { a.write_all(&[MSG_DATA, 0, 0]).await });

        let err = read_stream_header(&mut b).await.unwrap_err();
        assert!(matches!(err, CodecError::UnexpectedMessage(t) if t == MSG_DATA));
    }

    #[tokio::test]
    async fn stream_header_name_too_long() {
        let (mut a, _b) = tokio::io::duplex(64);
        let name = "x".repeat(MAX_NAME_BYTES + 1);
        let err = write_stream_header(&mut a, 1, 1, &name).await.unwrap_err();
        assert!(matches!(err, CodecError::NameTooLong(_)));
    }

    #[tokio::test]
    async fn datagram_roundtrip() {
        let (mut a, mut b) = tokio::io::duplex(1024);
        tokio::spawn(async move {
            write_datagram(&mut a, b"ping").await.unwrap();
            write_datagram(&mut a, b"").await.unwrap();
            write_datagram(&mut a, b"pong").await.unwrap();
        });

        let mut buf = Vec::new();
        let n = read_datagram(&mut b, &mut buf).await.unwrap();
        assert_eq!(&buf[..n], b"ping");
        let n = read_datagram(&mut b, &mut buf).await.unwrap();
        assert_eq!(n, 0);
        let n = read_datagram(&mut b, &mut buf).await.unwrap();
        assert_eq!(&buf[..n], b"pong");
    }

    #[test]
    fn proxy_kind_parsing() {
        assert_eq!(ProxyKind::parse(" TCP "), Some(ProxyKind::Tcp));
        assert_eq!(ProxyKind::parse("udp"), Some(ProxyKind::Udp));
        assert_eq!(ProxyKind::parse("quic"), None);
        assert_eq!(ProxyKind::from_tag(0x01).unwrap(), ProxyKind::Tcp);
        assert!(ProxyKind::from_tag(0x03).is_err());
    }
}
