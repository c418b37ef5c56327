//! libp2p stream transport
//!
//! Publishers that predate HTTP serving are reached over a libp2p stream.
//! The wire shape is the same as the HTTP transport: an HTTP/1.1 GET of an
//! `/ipni/v1/ad/…` path, framed directly on a negotiated stream. The swarm
//! runs on a background task; callers talk to it through [`P2pHost`].

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use cid::Cid;
use futures::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use futures::StreamExt;
use libp2p::request_response::{self, OutboundRequestId, ProtocolSupport};
use libp2p::swarm::SwarmEvent;
use libp2p::{noise, tcp, yamux, Multiaddr, PeerId, StreamProtocol};
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, warn};

use crate::fetch::{self, FetchError, Fetcher};

/// Stream protocol for publisher sync.
pub const SYNC_PROTOCOL: &str = "/ipni-sync/1";

#[derive(Debug, Error)]
pub enum P2pError {
    #[error("transport: {0}")]
    Transport(String),

    #[error("swarm: {0}")]
    Swarm(String),
}

#[derive(Debug, Clone)]
pub struct HttpRequest {
    pub path: String,
}

#[derive(Debug, Clone)]
pub struct HttpResponse {
    pub status: u16,
    pub body: Vec<u8>,
}

/// Minimal HTTP/1.1 framing over a libp2p stream.
#[derive(Clone, Default)]
pub struct HttpCodec;

#[async_trait]
impl request_response::Codec for HttpCodec {
    type Protocol = StreamProtocol;
    type Request = HttpRequest;
    type Response = HttpResponse;

    async fn read_request<T>(
        &mut self,
        _: &StreamProtocol,
        io: &mut T,
    ) -> std::io::Result<HttpRequest>
    where
        T: AsyncRead + Unpin + Send,
    {
        let mut buf = Vec::new();
        io.read_to_end(&mut buf).await?;
        let text = String::from_utf8_lossy(&buf);
        let line = text.lines().next().unwrap_or_default();
        let mut parts = line.split_whitespace();
        match (parts.next(), parts.next()) {
            (Some("GET"), Some(path)) => Ok(HttpRequest { path: path.to_string() }),
            _ => Err(invalid_data(format!("bad request line: {line:.80}"))),
        }
    }

    async fn read_response<T>(
        &mut self,
        _: &StreamProtocol,
        io: &mut T,
    ) -> std::io::Result<HttpResponse>
    where
        T: AsyncRead + Unpin + Send,
    {
        let mut buf = Vec::new();
        io.read_to_end(&mut buf).await?;
        parse_response(&buf)
    }

    async fn write_request<T>(
        &mut self,
        _: &StreamProtocol,
        io: &mut T,
        req: HttpRequest,
    ) -> std::io::Result<()>
    where
        T: AsyncWrite + Unpin + Send,
    {
        let head = format!(
            "GET {} HTTP/1.1\r\nHost: ipni\r\nConnection: close\r\n\r\n",
            req.path
        );
        io.write_all(head.as_bytes()).await
    }

    async fn write_response<T>(
        &mut self,
        _: &StreamProtocol,
        io: &mut T,
        resp: HttpResponse,
    ) -> std::io::Result<()>
    where
        T: AsyncWrite + Unpin + Send,
    {
        let head = format!(
            "HTTP/1.1 {} {}\r\nContent-Length: {}\r\nConnection: close\r\n\r\n",
            resp.status,
            reason(resp.status),
            resp.body.len()
        );
        io.write_all(head.as_bytes()).await?;
        io.write_all(&resp.body).await
    }
}

fn invalid_data(msg: String) -> std::io::Error {
    std::io::Error::new(std::io::ErrorKind::InvalidData, msg)
}

fn reason(status: u16) -> &'static str {
    match status {
        200 => "OK",
        404 => "Not Found",
        _ => "",
    }
}

fn parse_response(buf: &[u8]) -> std::io::Result<HttpResponse> {
    let sep = buf
        .windows(4)
        .position(|w| w == b"\r\n\r\n")
        .ok_or_else(|| invalid_data("missing header terminator".into()))?;
    let head = String::from_utf8_lossy(&buf[..sep]);
    let status_line = head.lines().next().unwrap_or_default();
    let status: u16 = status_line
        .split_whitespace()
        .nth(1)
        .and_then(|s| s.parse().ok())
        .ok_or_else(|| invalid_data(format!("bad status line: {status_line:.80}")))?;

    let mut body = buf[sep + 4..].to_vec();
    // Honor Content-Length when the responder sent one.
    for line in head.lines().skip(1) {
        if let Some((name, value)) = line.split_once(':') {
            if name.eq_ignore_ascii_case("content-length") {
                if let Ok(len) = value.trim().parse::<usize>() {
                    body.truncate(len);
                }
            }
        }
    }
    Ok(HttpResponse { status, body })
}

type Behaviour = request_response::Behaviour<HttpCodec>;

enum Command {
    Fetch {
        peer: PeerId,
        addrs: Vec<Multiaddr>,
        path: String,
        reply: oneshot::Sender<Result<HttpResponse, FetchError>>,
    },
    Listen {
        addr: Multiaddr,
        reply: oneshot::Sender<Result<Multiaddr, P2pError>>,
    },
    Shutdown,
}

/// Handle to a background-driven libp2p host used for publisher sync.
///
/// May be shared across clients; a client only closes a host it created.
pub struct P2pHost {
    cmd_tx: mpsc::Sender<Command>,
    local_peer_id: PeerId,
}

impl P2pHost {
    /// Creates the swarm and spawns its event loop.
    pub fn spawn(request_timeout: Duration) -> Result<Self, P2pError> {
        let swarm = libp2p::SwarmBuilder::with_new_identity()
            .with_tokio()
            .with_tcp(
                tcp::Config::default().nodelay(true),
                noise::Config::new,
                yamux::Config::default,
            )
            .map_err(|e| P2pError::Transport(e.to_string()))?
            .with_behaviour(|_| {
                request_response::Behaviour::with_codec(
                    HttpCodec,
                    std::iter::once((
                        StreamProtocol::new(SYNC_PROTOCOL),
                        ProtocolSupport::Full,
                    )),
                    request_response::Config::default().with_request_timeout(request_timeout),
                )
            })
            .map_err(|e| P2pError::Swarm(e.to_string()))?
            .with_swarm_config(|c| c.with_idle_connection_timeout(Duration::from_secs(60)))
            .build();

        let local_peer_id = *swarm.local_peer_id();
        debug!(%local_peer_id, "sync host started");

        let (cmd_tx, cmd_rx) = mpsc::channel(16);
        tokio::spawn(drive(swarm, cmd_rx));

        Ok(Self {
            cmd_tx,
            local_peer_id,
        })
    }

    pub fn local_peer_id(&self) -> PeerId {
        self.local_peer_id
    }

    /// Performs one GET against a peer, dialing it if necessary.
    pub async fn fetch(
        &self,
        peer: PeerId,
        addrs: Vec<Multiaddr>,
        path: String,
    ) -> Result<HttpResponse, FetchError> {
        let (reply, rx) = oneshot::channel();
        self.cmd_tx
            .send(Command::Fetch {
                peer,
                addrs,
                path,
                reply,
            })
            .await
            .map_err(|_| FetchError::Transport("sync host closed".into()))?;
        rx.await
            .map_err(|_| FetchError::Transport("sync host closed".into()))?
    }

    /// Starts listening, returning the first bound address. Only needed by
    /// tests and tools that accept inbound dials.
    pub async fn listen(&self, addr: Multiaddr) -> Result<Multiaddr, P2pError> {
        let (reply, rx) = oneshot::channel();
        self.cmd_tx
            .send(Command::Listen { addr, reply })
            .await
            .map_err(|_| P2pError::Swarm("sync host closed".into()))?;
        rx.await
            .map_err(|_| P2pError::Swarm("sync host closed".into()))?
    }

    /// Stops the event loop; idempotent.
    pub async fn close(&self) {
        let _ = self.cmd_tx.send(Command::Shutdown).await;
    }
}

async fn drive(mut swarm: libp2p::Swarm<Behaviour>, mut cmd_rx: mpsc::Receiver<Command>) {
    let mut pending: HashMap<OutboundRequestId, oneshot::Sender<Result<HttpResponse, FetchError>>> =
        HashMap::new();
    let mut pending_listen: Option<oneshot::Sender<Result<Multiaddr, P2pError>>> = None;

    loop {
        tokio::select! {
            cmd = cmd_rx.recv() => match cmd {
                Some(Command::Fetch { peer, addrs, path, reply }) => {
                    for addr in addrs {
                        swarm.add_peer_address(peer, addr);
                    }
                    let id = swarm
                        .behaviour_mut()
                        .send_request(&peer, HttpRequest { path });
                    pending.insert(id, reply);
                }
                Some(Command::Listen { addr, reply }) => {
                    match swarm.listen_on(addr) {
                        Ok(_) => pending_listen = Some(reply),
                        Err(e) => {
                            let _ = reply.send(Err(P2pError::Transport(e.to_string())));
                        }
                    }
                }
                Some(Command::Shutdown) | None => break,
            },
            event = swarm.select_next_some() => match event {
                SwarmEvent::Behaviour(request_response::Event::Message { message, .. }) => {
                    match message {
                        request_response::Message::Response { request_id, response } => {
                            if let Some(tx) = pending.remove(&request_id) {
                                let _ = tx.send(Ok(response));
                            }
                        }
                        request_response::Message::Request { channel, request, .. } => {
                            // This host only consumes; answer politely.
                            debug!(path = %request.path, "unexpected inbound sync request");
                            let _ = swarm.behaviour_mut().send_response(
                                channel,
                                HttpResponse { status: 404, body: Vec::new() },
                            );
                        }
                    }
                }
                SwarmEvent::Behaviour(request_response::Event::OutboundFailure {
                    request_id, error, ..
                }) => {
                    if let Some(tx) = pending.remove(&request_id) {
                        let _ = tx.send(Err(FetchError::Transport(error.to_string())));
                    }
                }
                SwarmEvent::NewListenAddr { address, .. } => {
                    if let Some(tx) = pending_listen.take() {
                        let _ = tx.send(Ok(address));
                    }
                }
                SwarmEvent::OutgoingConnectionError { peer_id, error, .. } => {
                    warn!(?peer_id, %error, "outgoing connection error");
                }
                _ => {}
            }
        }
    }
    debug!("sync host stopped");
}

/// [`Fetcher`] over a shared [`P2pHost`], bound to one publisher.
pub struct P2pFetcher {
    host: std::sync::Arc<P2pHost>,
    peer: PeerId,
    addrs: Vec<Multiaddr>,
}

impl P2pFetcher {
    pub fn new(host: std::sync::Arc<P2pHost>, peer: PeerId, addrs: Vec<Multiaddr>) -> Self {
        Self { host, peer, addrs }
    }

    async fn get(&self, path: String) -> Result<Vec<u8>, FetchError> {
        let resp = self
            .host
            .fetch(self.peer, self.addrs.clone(), path)
            .await?;
        match resp.status {
            200 => Ok(resp.body),
            404 => Err(FetchError::NotFound),
            other => Err(FetchError::Status(other)),
        }
    }
}

#[async_trait]
impl Fetcher for P2pFetcher {
    async fn head(&self) -> Result<Cid, FetchError> {
        let body = self.get(fetch::HEAD_PATH.to_string()).await?;
        fetch::parse_head_body(&body)
    }

    async fn block(&self, cid: &Cid) -> Result<Vec<u8>, FetchError> {
        self.get(format!("{}{cid}", fetch::AD_PATH_PREFIX)).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn response_parsing() {
        let raw = b"HTTP/1.1 200 OK\r\nContent-Length: 4\r\n\r\nbody";
        let resp = parse_response(raw).unwrap();
        assert_eq!(resp.status, 200);
        assert_eq!(resp.body, b"body");

        let raw = b"HTTP/1.1 404 Not Found\r\n\r\n";
        let resp = parse_response(raw).unwrap();
        assert_eq!(resp.status, 404);
        assert!(resp.body.is_empty());

        assert!(parse_response(b"garbage").is_err());
    }

    #[tokio::test]
    async fn fetch_between_two_hosts() {
        // A host answers inbound requests with 404, which is enough to
        // exercise both directions of the codec end to end.
        let server = P2pHost::spawn(Duration::from_secs(5)).unwrap();
        let client = P2pHost::spawn(Duration::from_secs(5)).unwrap();

        let addr = server
            .listen("/ip4/127.0.0.1/tcp/0".parse().unwrap())
            .await
            .unwrap();

        let resp = client
            .fetch(
                server.local_peer_id(),
                vec![addr],
                fetch::HEAD_PATH.to_string(),
            )
            .await
            .unwrap();
        assert_eq!(resp.status, 404);

        server.close().await;
        client.close().await;
    }

    #[tokio::test]
    async fn fetch_unreachable_peer_fails() {
        let client = P2pHost::spawn(Duration::from_secs(2)).unwrap();
        let other = P2pHost::spawn(Duration::from_secs(2)).unwrap();
        let resp = client
            .fetch(
                other.local_peer_id(),
                vec!["/ip4/127.0.0.1/tcp/1".parse().unwrap()],
                fetch::HEAD_PATH.to_string(),
            )
            .await;
        assert!(matches!(resp, Err(FetchError::Transport(_))));
        client.close().await;
        other.close().await;
    }
}
