//! PROXY protocol (v1/v2) header parsing for the TCP, TLS, and WebSocket
//! listeners.
//!
//! A load balancer speaking the HAProxy PROXY protocol prepends a short
//! header to the TCP stream that carries the real client address instead of
//! the proxy's own. We peel it off the raw stream before anything else
//! touches it: before the TLS handshake, before the WebSocket upgrade, and
//! long before the MQTT CONNECT packet.

use std::fmt;
use std::net::{IpAddr, SocketAddr};

use ppp::{v1, v2, HeaderResult};
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::time::timeout;

use crate::config::ProxyProtocolConfig;

/// Parsed PROXY protocol header, carried alongside a connection for ACL
/// checks, logging, and recovering the real client address.
#[derive(Debug, Clone)]
pub struct ProxyInfo {
    /// The real client address reported by the proxy
    pub source: SocketAddr,
    /// The address the proxy itself accepted the connection on
    pub destination: SocketAddr,
    /// TLS details recovered from PROXY v2 TLVs, when the proxy terminated
    /// TLS on our behalf and `tls_termination` is enabled for the listener
    pub tls: Option<ProxyTlsInfo>,
}

/// TLS details carried in PROXY v2 TLVs (PP2_TYPE_SSL and friends)
#[derive(Debug, Clone, Default)]
pub struct ProxyTlsInfo {
    /// Server name indication, if the proxy recorded one (PP2_TYPE_AUTHORITY)
    pub sni: Option<String>,
    /// Client certificate common name, if the proxy verified one
    /// (PP2_SUBTYPE_SSL_CN)
    pub client_cert_cn: Option<String>,
}

/// Errors that can occur while reading a PROXY header off a fresh connection
#[derive(Debug)]
pub enum ProxyError {
    Io(std::io::Error),
    Timeout,
    Malformed(String),
    ConnectionClosed,
}

impl fmt::Display for ProxyError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ProxyError::Io(e) => write!(f, "IO error reading PROXY header: {}", e),
            ProxyError::Timeout => write!(f, "timed out waiting for PROXY header"),
            ProxyError::Malformed(msg) => write!(f, "malformed PROXY header: {}", msg),
            ProxyError::ConnectionClosed => write!(f, "connection closed before PROXY header"),
        }
    }
}

impl std::error::Error for ProxyError {}

impl From<std::io::Error> for ProxyError {
    fn from(e: std::io::Error) -> Self {
        ProxyError::Io(e)
    }
}

/// The v1 spec caps an entire header line, including its terminating CRLF,
/// at 107 bytes.
const V1_MAX_LINE: usize = 107;

/// Fixed-size prefix of a v2 header: 12-byte signature, ver_cmd, fam_proto,
/// and a big-endian u16 length for everything that follows (addresses + TLVs).
const V2_HEADER_PREFIX: usize = 16;

const V2_SIGNATURE: [u8; 12] = [
    0x0D, 0x0A, 0x0D, 0x0A, 0x00, 0x0D, 0x0A, b'Q', b'U', b'I', b'T', 0x0A,
];

/// PP2_TYPE_SSL TLV type and its PP2_SUBTYPE_SSL_CN sub-field
const PP2_TYPE_SSL: u8 = 0x20;
const PP2_SUBTYPE_SSL_CN: u8 = 0x21;
/// PP2_TYPE_AUTHORITY carries the SNI hostname the proxy saw in ClientHello
const PP2_TYPE_AUTHORITY: u8 = 0x02;

/// Read and parse a PROXY header off the front of `stream`, honoring the
/// listener's configured timeout. Returns `None` when PROXY protocol is
/// disabled for this listener, leaving the stream untouched.
pub async fn read_proxy_header<S>(
    stream: &mut S,
    config: &ProxyProtocolConfig,
) -> Result<Option<ProxyInfo>, ProxyError>
where
    S: AsyncRead + Unpin,
{
    if !config.enabled {
        return Ok(None);
    }

    let info = timeout(config.timeout, parse_header(stream, config.tls_termination))
        .await
        .map_err(|_| ProxyError::Timeout)??;

    Ok(Some(info))
}

async fn parse_header<S>(stream: &mut S, tls_termination: bool) -> Result<ProxyInfo, ProxyError>
where
    S: AsyncRead + Unpin,
{
    let mut buf = Vec::with_capacity(256);

    // v1 always starts with the literal "PROXY "; v2 starts with a fixed
    // 12-byte signature. Either way 12 bytes is enough to tell them apart.
    read_at_least(stream, &mut buf, 12).await?;

    if buf[..12] == V2_SIGNATURE {
        read_at_least(stream, &mut buf, V2_HEADER_PREFIX).await?;
        let len = u16::from_be_bytes([buf[14], buf[15]]) as usize;
        let total = V2_HEADER_PREFIX + len;
        read_at_least(stream, &mut buf, total).await?;
        return parse_v2(&buf[..total], tls_termination);
    }

    loop {
        if let Some(pos) = find_crlf(&buf) {
            return parse_v1(&buf[..pos + 2]);
        }
        if buf.len() >= V1_MAX_LINE {
            return Err(ProxyError::Malformed(
                "v1 header exceeds maximum line length".to_string(),
            ));
        }
        read_at_least(stream, &mut buf, buf.len() + 1).await?;
    }
}

fn find_crlf(buf: &[u8]) -> Option<usize> {
    buf.windows(2).position(|w| w == b"\r\n")
}

async fn read_at_least<S>(stream: &mut S, buf: &mut Vec<u8>, want: usize) -> Result<(), ProxyError>
where
    S: AsyncRead + Unpin,
{
    while buf.len() < want {
        let mut chunk = [0u8; 256];
        let n = stream.read(&mut chunk).await?;
        if n == 0 {
            return Err(ProxyError::ConnectionClosed);
        }
        buf.extend_from_slice(&chunk[..n]);
    }
    Ok(())
}

fn parse_v1(data: &[u8]) -> Result<ProxyInfo, ProxyError> {
    match HeaderResult::parse(data) {
        HeaderResult::V1(Ok(header)) => {
            let (source, destination) = v1_addresses(&header)?;
            Ok(ProxyInfo {
                source,
                destination,
                tls: None,
            })
        }
        HeaderResult::V1(Err(e)) => Err(ProxyError::Malformed(format!("{:?}", e))),
        HeaderResult::V2(_) => Err(ProxyError::Malformed("expected a v1 header".to_string())),
    }
}

fn parse_v2(data: &[u8], tls_termination: bool) -> Result<ProxyInfo, ProxyError> {
    match HeaderResult::parse(data) {
        HeaderResult::V2(Ok(header)) => {
            let (source, destination) = v2_addresses(&header)?;
            let tls = if tls_termination {
                extract_tls_tlvs(&header)
            } else {
                None
            };
            Ok(ProxyInfo {
                source,
                destination,
                tls,
            })
        }
        HeaderResult::V2(Err(e)) => Err(ProxyError::Malformed(format!("{:?}", e))),
        HeaderResult::V1(_) => Err(ProxyError::Malformed("expected a v2 header".to_string())),
    }
}

fn v1_addresses(header: &v1::Header<'_>) -> Result<(SocketAddr, SocketAddr), ProxyError> {
    match header.addresses {
        v1::Addresses::Tcp4 {
            source_address,
            source_port,
            destination_address,
            destination_port,
        } => Ok((
            SocketAddr::new(IpAddr::V4(source_address), source_port),
            SocketAddr::new(IpAddr::V4(destination_address), destination_port),
        )),
        v1::Addresses::Tcp6 {
            source_address,
            source_port,
            destination_address,
            destination_port,
        } => Ok((
            SocketAddr::new(IpAddr::V6(source_address), source_port),
            SocketAddr::new(IpAddr::V6(destination_address), destination_port),
        )),
        v1::Addresses::Unknown => Err(ProxyError::Malformed(
            "PROXY UNKNOWN protocol family".to_string(),
        )),
    }
}

fn v2_addresses(header: &v2::Header<'_>) -> Result<(SocketAddr, SocketAddr), ProxyError> {
    match header.addresses {
        v2::Addresses::IPv4 {
            source_address,
            source_port,
            destination_address,
            destination_port,
        } => Ok((
            SocketAddr::new(IpAddr::V4(source_address), source_port),
            SocketAddr::new(IpAddr::V4(destination_address), destination_port),
        )),
        v2::Addresses::IPv6 {
            source_address,
            source_port,
            destination_address,
            destination_port,
        } => Ok((
            SocketAddr::new(IpAddr::V6(source_address), source_port),
            SocketAddr::new(IpAddr::V6(destination_address), destination_port),
        )),
        v2::Addresses::Unix { .. } => Err(ProxyError::Malformed(
            "AF_UNIX PROXY addresses are not supported".to_string(),
        )),
        v2::Addresses::Unspecified => Err(ProxyError::Malformed(
            "PROXY header carried no address information".to_string(),
        )),
    }
}

/// Best-effort extraction of SNI/client-cert-CN from PROXY v2 TLVs. Absence
/// of a TLV, or one we don't understand, is not an error.
fn extract_tls_tlvs(header: &v2::Header<'_>) -> Option<ProxyTlsInfo> {
    let mut info = ProxyTlsInfo::default();
    let mut found = false;

    for tlv in header.tlvs().flatten() {
        match tlv.kind {
            PP2_TYPE_AUTHORITY => {
                if let Ok(sni) = std::str::from_utf8(tlv.value) {
                    info.sni = Some(sni.to_string());
                    found = true;
                }
            }
            PP2_TYPE_SSL => {
                // The SSL TLV's value is itself a client/verify byte
                // followed by nested sub-TLVs (type, len, value).
                let mut i = 5usize.min(tlv.value.len());
                while i + 3 <= tlv.value.len() {
                    let sub_type = tlv.value[i];
                    let sub_len = u16::from_be_bytes([tlv.value[i + 1], tlv.value[i + 2]]) as usize;
                    let start = i + 3;
                    let end = (start + sub_len).min(tlv.value.len());
                    if sub_type == PP2_SUBTYPE_SSL_CN {
                        if let Ok(cn) = std::str::from_utf8(&tlv.value[start..end]) {
                            info.client_cert_cn = Some(cn.to_string());
                            found = true;
                        }
                    }
                    i = end;
                }
            }
            _ => {}
        }
    }

    found.then_some(info)
}
