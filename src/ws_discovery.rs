use std::collections::HashSet;
use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};
use std::pin::Pin;
use std::time::Duration;

use chrono::Utc;
use futures_util::stream::{self, Stream};
use socket2::{Domain, Protocol, SockAddr, Socket, Type};
use tokio::net::UdpSocket;
use tokio::time::Instant;
use tracing::{debug, trace};
use uuid::Uuid;

use crate::errors::{ProtocolError, ProtocolResult};
use crate::models::DiscoveryCandidate;
use crate::soap;

pub const MULTICAST_ADDR: Ipv4Addr = Ipv4Addr::new(239, 255, 255, 250);
pub const MULTICAST_PORT: u16 = 3702;
const DEFAULT_ONVIF_PORT: u16 = 80;
const RECV_BUFFER_SIZE: usize = 65_535;

/// Lazy, finite, single-pass sequence of probe responders.
pub type CandidateStream = Pin<Box<dyn Stream<Item = DiscoveryCandidate> + Send>>;

pub fn probe_message(message_id: &Uuid) -> String {
    format!(
        "<?xml version=\"1.0\" encoding=\"UTF-8\"?>\n\
         <s:Envelope xmlns:s=\"http://www.w3.org/2003/05/soap-envelope\"\n\
          xmlns:a=\"http://schemas.xmlsoap.org/ws/2004/08/addressing\"\n\
          xmlns:d=\"http://schemas.xmlsoap.org/ws/2005/04/discovery\"\n\
          xmlns:dn=\"http://www.onvif.org/ver10/network/wsdl\">\n\
           <s:Header>\n\
             <a:Action s:mustUnderstand=\"1\">http://schemas.xmlsoap.org/ws/2005/04/discovery/Probe</a:Action>\n\
             <a:MessageID>urn:uuid:{}</a:MessageID>\n\
             <a:ReplyTo><a:Address>http://schemas.xmlsoap.org/ws/2004/08/addressing/role/anonymous</a:Address></a:ReplyTo>\n\
             <a:To s:mustUnderstand=\"1\">urn:schemas-xmlsoap-org:ws:2005:04:discovery</a:To>\n\
           </s:Header>\n\
           <s:Body>\n\
             <d:Probe><d:Types>dn:NetworkVideoTransmitter</d:Types></d:Probe>\n\
           </s:Body>\n\
         </s:Envelope>",
        message_id
    )
}

/// Management endpoint advertised by a ProbeMatch.
///
/// Uses the first http(s) entry of `XAddrs`; responders that omit it (or
/// advertise something unparsable) fall back to the UDP source address on
/// the default ONVIF port. Returns `None` when the payload is not a
/// ProbeMatches message at all.
pub fn parse_probe_match(payload: &str, source: SocketAddr) -> Option<(String, u16)> {
    if soap::element_inner(payload, "ProbeMatches").is_none() {
        return None;
    }

    let from_xaddr = soap::element_text(payload, "XAddrs").and_then(|xaddrs| {
        xaddrs
            .split_whitespace()
            .filter_map(|candidate| url::Url::parse(candidate).ok())
            .find(|url| url.scheme() == "http" || url.scheme() == "https")
            .and_then(|url| {
                let host = url.host_str()?.trim_matches(|c| c == '[' || c == ']').to_string();
                let port = url.port_or_known_default().unwrap_or(DEFAULT_ONVIF_PORT);
                Some((host, port))
            })
    });

    Some(from_xaddr.unwrap_or_else(|| (source.ip().to_string(), DEFAULT_ONVIF_PORT)))
}

fn multicast_socket() -> std::io::Result<UdpSocket> {
    let socket = Socket::new(Domain::IPV4, Type::DGRAM, Some(Protocol::UDP))?;
    socket.set_reuse_address(true)?;
    socket.set_multicast_ttl_v4(2)?;
    socket.set_nonblocking(true)?;
    let bind_addr = SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, 0);
    socket.bind(&SockAddr::from(bind_addr))?;
    UdpSocket::from_std(socket.into())
}

struct ProbeState {
    socket: UdpSocket,
    deadline: Instant,
    seen: HashSet<(String, u16)>,
    buf: Vec<u8>,
}

/// Sends one multicast Probe and yields each distinct responder until
/// `timeout` elapses.
pub async fn probe(timeout: Duration) -> ProtocolResult<CandidateStream> {
    let socket = multicast_socket()
        .map_err(|e| ProtocolError::unreachable(format!("WS-Discovery socket setup failed: {}", e)))?;

    let message_id = Uuid::new_v4();
    let target = SocketAddr::V4(SocketAddrV4::new(MULTICAST_ADDR, MULTICAST_PORT));
    socket
        .send_to(probe_message(&message_id).as_bytes(), target)
        .await
        .map_err(|e| ProtocolError::unreachable(format!("WS-Discovery probe send failed: {}", e)))?;
    debug!(target: "onvif", message_id = %message_id, timeout = ?timeout, "WS-Discovery probe sent");

    let state = ProbeState {
        socket,
        deadline: Instant::now() + timeout,
        seen: HashSet::new(),
        buf: vec![0u8; RECV_BUFFER_SIZE],
    };

    let candidates = stream::unfold(state, |mut state| async move {
        loop {
            let received = tokio::time::timeout_at(state.deadline, state.socket.recv_from(&mut state.buf)).await;
            let (len, source) = match received {
                Ok(Ok(datagram)) => datagram,
                Ok(Err(e)) => {
                    debug!(target: "onvif", error = %e, "WS-Discovery receive failed, ending probe");
                    return None;
                }
                Err(_) => return None,
            };

            let payload = String::from_utf8_lossy(&state.buf[..len]).into_owned();
            trace!(target: "onvif", source = %source, response = %payload, "WS-Discovery response");

            let Some((address, port)) = parse_probe_match(&payload, source) else {
                continue;
            };
            if !state.seen.insert((address.clone(), port)) {
                continue;
            }

            let candidate = DiscoveryCandidate {
                address,
                port,
                probe_response_raw: payload,
                discovered_at: Utc::now(),
            };
            return Some((candidate, state));
        }
    });

    Ok(Box::pin(candidates))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn source() -> SocketAddr {
        "192.168.1.64:3702".parse().unwrap()
    }

    #[test]
    fn test_probe_message_carries_message_id() {
        let id = Uuid::new_v4();
        let msg = probe_message(&id);
        assert!(msg.contains(&format!("urn:uuid:{}", id)));
        assert!(msg.contains("dn:NetworkVideoTransmitter"));
    }

    #[test]
    fn test_parse_xaddr_with_port() {
        let payload = r#"<e:Envelope><e:Body><d:ProbeMatches><d:ProbeMatch>
            <d:XAddrs>http://10.0.0.5:8080/onvif/device_service http://[fe80::1]/onvif/device_service</d:XAddrs>
            </d:ProbeMatch></d:ProbeMatches></e:Body></e:Envelope>"#;
        assert_eq!(parse_probe_match(payload, source()), Some(("10.0.0.5".to_string(), 8080)));
    }

    #[test]
    fn test_parse_xaddr_default_port() {
        let payload = "<d:ProbeMatches><d:ProbeMatch><d:XAddrs>http://10.0.0.6/onvif/device_service</d:XAddrs></d:ProbeMatch></d:ProbeMatches>";
        assert_eq!(parse_probe_match(payload, source()), Some(("10.0.0.6".to_string(), 80)));
    }

    #[test]
    fn test_missing_xaddr_falls_back_to_source() {
        let payload = "<d:ProbeMatches><d:ProbeMatch><d:Scopes>onvif://www.onvif.org/name/cam</d:Scopes></d:ProbeMatch></d:ProbeMatches>";
        assert_eq!(parse_probe_match(payload, source()), Some(("192.168.1.64".to_string(), 80)));
    }

    #[test]
    fn test_non_probe_match_is_ignored() {
        assert_eq!(parse_probe_match("<d:Hello/>", source()), None);
        assert_eq!(parse_probe_match("garbage", source()), None);
    }
}
