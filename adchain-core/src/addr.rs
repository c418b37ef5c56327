//! Publisher addressing
//!
//! An advertisement publisher is identified by a peer ID plus one or more
//! multiaddrs. Addresses may point at a plain HTTP(S) endpoint, an HTTP
//! endpoint with a path prefix (`http-path`), or a libp2p stream endpoint.

use std::fmt;
use std::str::FromStr;

use libp2p::multiaddr::Protocol;
use libp2p::{Multiaddr, PeerId};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum AddrError {
    #[error("bad publisher address: {0}")]
    BadPublisherAddress(String),

    #[error("address has no peer ID component")]
    MissingPeerId,

    #[error("address is not HTTP-capable")]
    NotHttp,
}

/// A publisher endpoint: peer identity plus transport addresses.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AddrInfo {
    pub peer_id: PeerId,
    pub addrs: Vec<Multiaddr>,
}

impl AddrInfo {
    pub fn new(peer_id: PeerId, addrs: Vec<Multiaddr>) -> Self {
        Self { peer_id, addrs }
    }

    /// Parses one or more fully-qualified multiaddrs (`…/p2p/<peer-id>`).
    /// All addresses must name the same peer.
    pub fn from_strings<I, S>(addrs: I) -> Result<Self, AddrError>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut peer_id: Option<PeerId> = None;
        let mut transport_addrs = Vec::new();

        for s in addrs {
            let s = s.as_ref();
            let full: Multiaddr = s
                .parse()
                .map_err(|e| AddrError::BadPublisherAddress(format!("{s}: {e}")))?;

            let mut transport = Multiaddr::empty();
            let mut found: Option<PeerId> = None;
            for proto in full.iter() {
                match proto {
                    Protocol::P2p(pid) => found = Some(pid),
                    other => transport.push(other),
                }
            }

            let pid = found.ok_or(AddrError::MissingPeerId)?;
            match peer_id {
                None => peer_id = Some(pid),
                Some(existing) if existing != pid => {
                    return Err(AddrError::BadPublisherAddress(format!(
                        "conflicting peer IDs {existing} and {pid}"
                    )));
                }
                Some(_) => {}
            }
            transport_addrs.push(transport);
        }

        let peer_id = peer_id.ok_or(AddrError::MissingPeerId)?;
        if transport_addrs.is_empty() {
            return Err(AddrError::BadPublisherAddress("no addresses".into()));
        }
        Ok(Self {
            peer_id,
            addrs: transport_addrs,
        })
    }

    /// The first HTTP-capable address converted to a base URL, if any.
    pub fn http_base_url(&self) -> Option<String> {
        self.addrs.iter().find_map(|a| http_base_url(a).ok())
    }

    /// Addresses that are not HTTP-capable, i.e. candidates for libp2p dialing.
    pub fn stream_addrs(&self) -> Vec<Multiaddr> {
        self.addrs
            .iter()
            .filter(|a| !is_http_addr(a))
            .cloned()
            .collect()
    }
}

impl FromStr for AddrInfo {
    type Err = AddrError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::from_strings([s])
    }
}

impl fmt::Display for AddrInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{{{}:", self.peer_id)?;
        for a in &self.addrs {
            write!(f, " {a}")?;
        }
        write!(f, "}}")
    }
}

/// True when the multiaddr carries an `http` or `https` component.
pub fn is_http_addr(addr: &Multiaddr) -> bool {
    addr.iter()
        .any(|p| matches!(p, Protocol::Http | Protocol::Https))
}

/// Converts an HTTP-capable multiaddr into a base URL.
///
/// Understands `ip4`/`ip6`/`dns*` hosts, an optional `tcp` port, `http`,
/// `https` (including `tls/http`), and a trailing `http-path` whose value is
/// percent-escaped in the multiaddr string form.
pub fn http_base_url(addr: &Multiaddr) -> Result<String, AddrError> {
    let mut host: Option<String> = None;
    let mut port: Option<u16> = None;
    let mut scheme: Option<&str> = None;
    let mut tls = false;

    for proto in addr.iter() {
        match proto {
            Protocol::Ip4(ip) => host = Some(ip.to_string()),
            Protocol::Ip6(ip) => host = Some(format!("[{ip}]")),
            Protocol::Dns(h) | Protocol::Dns4(h) | Protocol::Dns6(h) | Protocol::Dnsaddr(h) => {
                host = Some(h.to_string())
            }
            Protocol::Tcp(p) => port = Some(p),
            Protocol::Tls => tls = true,
            Protocol::Http => scheme = Some(if tls { "https" } else { "http" }),
            Protocol::Https => scheme = Some("https"),
            _ => {}
        }
    }

    let host = host.ok_or(AddrError::NotHttp)?;
    let scheme = scheme.ok_or(AddrError::NotHttp)?;

    let mut url = match port {
        Some(p) => format!("{scheme}://{host}:{p}"),
        None => format!("{scheme}://{host}"),
    };
    if let Some(path) = http_path(addr) {
        if !path.starts_with('/') {
            url.push('/');
        }
        url.push_str(&path);
    }
    Ok(url)
}

/// Extracts the percent-decoded `http-path` component, if present.
///
/// The value's own `/` characters appear percent-escaped in the multiaddr
/// string form, so this works from that form rather than the protocol enum.
fn http_path(addr: &Multiaddr) -> Option<String> {
    let text = addr.to_string();
    let mut parts = text.split('/');
    while let Some(part) = parts.next() {
        if part == "http-path" {
            return parts.next().map(percent_decode);
        }
    }
    None
}

fn percent_decode(s: &str) -> String {
    let bytes = s.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'%' {
            if let (Some(hi), Some(lo)) = (
                bytes.get(i + 1).copied().and_then(hex_val),
                bytes.get(i + 2).copied().and_then(hex_val),
            ) {
                out.push(hi << 4 | lo);
                i += 3;
                continue;
            }
        }
        out.push(bytes[i]);
        i += 1;
    }
    String::from_utf8_lossy(&out).into_owned()
}

fn hex_val(b: u8) -> Option<u8> {
    match b {
        b'0'..=b'9' => Some(b - b'0'),
        b'a'..=b'f' => Some(b - b'a' + 10),
        b'A'..=b'F' => Some(b - b'A' + 10),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const PID: &str = "12D3KooWBckWLKiYoUX4k3HTrbrSe4DD5SPNTKgP6vKTva1NaRkJ";

    #[test]
    fn parse_full_addr() {
        let ai: AddrInfo = format!("/ip4/127.0.0.1/tcp/3104/p2p/{PID}")
            .parse()
            .unwrap();
        assert_eq!(ai.peer_id.to_string(), PID);
        assert_eq!(ai.addrs.len(), 1);
        assert_eq!(ai.addrs[0].to_string(), "/ip4/127.0.0.1/tcp/3104");
    }

    #[test]
    fn missing_peer_id_rejected() {
        let err = "/ip4/127.0.0.1/tcp/3104".parse::<AddrInfo>().unwrap_err();
        assert!(matches!(err, AddrError::MissingPeerId));
    }

    #[test]
    fn garbage_rejected() {
        let err = "not-a-multiaddr".parse::<AddrInfo>().unwrap_err();
        assert!(matches!(err, AddrError::BadPublisherAddress(_)));
    }

    #[test]
    fn http_url_from_dns_addr() {
        let addr: Multiaddr = "/dns/ads.example.com/tcp/8080/http".parse().unwrap();
        assert!(is_http_addr(&addr));
        assert_eq!(http_base_url(&addr).unwrap(), "http://ads.example.com:8080");
    }

    #[test]
    fn https_via_tls_http() {
        let addr: Multiaddr = "/dns/ads.example.com/tls/http".parse().unwrap();
        assert_eq!(http_base_url(&addr).unwrap(), "https://ads.example.com");
    }

    #[test]
    fn stream_addr_is_not_http() {
        let addr: Multiaddr = "/ip4/10.0.0.1/tcp/3104".parse().unwrap();
        assert!(!is_http_addr(&addr));
        assert!(http_base_url(&addr).is_err());
    }

    #[test]
    fn percent_decoding() {
        assert_eq!(percent_decode("ipni%2Fsub"), "ipni/sub");
        assert_eq!(percent_decode("plain"), "plain");
        assert_eq!(percent_decode("bad%zz"), "bad%zz");
    }
}
