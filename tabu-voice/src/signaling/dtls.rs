//! Direct link backend over DTLS
//!
//! Each link binds its own UDP socket and advertises it as a host
//! candidate. Once the remote candidate is known the socket is connected
//! and a DTLS session runs over it: the offerer is the DTLS client and the
//! answerer the DTLS server. Both sides use a self-signed certificate; peer
//! identity comes from the authenticated messaging channel.

use std::any::Any;
use std::collections::HashMap;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use dtls::config::Config as DtlsConfig;
use dtls::conn::DTLSConn;
use dtls::crypto::Certificate;
use tokio::net::UdpSocket;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use uuid::Uuid;
use webrtc_util::Conn;

use tabu_common::protocol::{IceCandidate, SdpType, SessionDescription};
use tabu_common::voice::{CodecKind, FramePacket};

use crate::signaling::backend::{LinkBackend, LinkEvent};

// =============================================================================
// Constants
// =============================================================================

/// Buffer size for receiving datagrams
const RECV_BUFFER_SIZE: usize = 16 * 1024;

/// Timeout for the DTLS handshake
const HANDSHAKE_TIMEOUT_SECS: u64 = 10;

/// Keepalive interval on an established link
const KEEPALIVE_INTERVAL_SECS: u64 = 5;

/// Host candidate priority (type preference 126, component 1)
const HOST_PRIORITY: u32 = 2_130_706_431;

/// Media section identifier used in candidates
const SDP_MID: &str = "0";

// =============================================================================
// Session Descriptions and Candidates
// =============================================================================

/// Which side of the DTLS handshake a link plays
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Role {
    Client,
    Server,
}

/// Build the descriptor text for a local session
fn describe_session(kind: SdpType, ufrag: &str) -> SessionDescription {
    let setup = match kind {
        SdpType::Offer => "actpass",
        SdpType::Answer => "passive",
    };
    let sdp = format!(
        "v=0\r\no=tabu {} 0 IN IP4 0.0.0.0\r\ns=-\r\nt=0 0\r\nm=application 9 UDP/DTLS 0\r\na=mid:{SDP_MID}\r\na=ice-ufrag:{ufrag}\r\na=setup:{setup}\r\n",
        Uuid::new_v4().as_u128() as u64,
    );
    SessionDescription { kind, sdp }
}

/// Extract the ICE username fragment from descriptor text
fn parse_ufrag(sdp: &str) -> Result<String, String> {
    sdp.lines()
        .find_map(|line| line.trim().strip_prefix("a=ice-ufrag:"))
        .map(str::to_string)
        .filter(|ufrag| !ufrag.is_empty())
        .ok_or_else(|| "descriptor has no ice-ufrag".to_string())
}

/// Format a host candidate for `addr`
fn host_candidate(addr: SocketAddr, ufrag: &str) -> IceCandidate {
    IceCandidate {
        candidate: format!(
            "candidate:1 1 udp {HOST_PRIORITY} {} {} typ host",
            addr.ip(),
            addr.port()
        ),
        sdp_mid: Some(SDP_MID.to_string()),
        sdp_m_line_index: Some(0),
        username_fragment: Some(ufrag.to_string()),
    }
}

/// Parse the transport address out of a candidate line
///
/// Only UDP candidates are supported.
fn parse_candidate_addr(candidate: &str) -> Result<SocketAddr, String> {
    let line = candidate.trim().trim_start_matches("a=");
    let fields: Vec<&str> = line.split_whitespace().collect();
    if fields.len() < 8 || !fields[0].starts_with("candidate:") {
        return Err(format!("malformed candidate: {candidate}"));
    }
    if !fields[2].eq_ignore_ascii_case("udp") {
        return Err(format!("unsupported candidate transport: {}", fields[2]));
    }
    let ip: IpAddr = fields[4]
        .parse()
        .map_err(|_| format!("invalid candidate address: {}", fields[4]))?;
    let port: u16 = fields[5]
        .parse()
        .map_err(|_| format!("invalid candidate port: {}", fields[5]))?;
    Ok(SocketAddr::new(ip, port))
}

/// Address other hosts can reach when bound to an unspecified address
///
/// Connecting a UDP socket sends nothing; it only selects the route.
fn routable_ip(bind_ip: IpAddr) -> IpAddr {
    if !bind_ip.is_unspecified() {
        return bind_ip;
    }
    std::net::UdpSocket::bind((bind_ip, 0))
        .and_then(|probe| {
            probe.connect(("8.8.8.8", 80))?;
            probe.local_addr()
        })
        .map(|addr| addr.ip())
        .unwrap_or(IpAddr::V4(Ipv4Addr::LOCALHOST))
}

// =============================================================================
// DTLS Backend
// =============================================================================

struct LinkSession {
    role: Role,
    local_ufrag: String,
    remote_ufrag: Option<String>,
    /// Bound socket, handed to the link task once the remote is known
    socket: Option<UdpSocket>,
    outbound: Option<mpsc::UnboundedSender<Vec<u8>>>,
    task: Option<JoinHandle<()>>,
}

impl Drop for LinkSession {
    fn drop(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}

/// Link backend running one DTLS session per remote
///
/// Must be used from within a tokio runtime.
pub struct DtlsBackend {
    local: String,
    bind_ip: IpAddr,
    certificate: Certificate,
    events: mpsc::UnboundedSender<LinkEvent>,
    sessions: HashMap<String, LinkSession>,
}

impl DtlsBackend {
    /// Create a backend
    ///
    /// # Arguments
    /// * `local` - Local identity (stamped on keepalives)
    /// * `bind_ip` - Address link sockets bind to
    /// * `events` - Where link events are reported
    pub fn new(
        local: impl Into<String>,
        bind_ip: IpAddr,
        events: mpsc::UnboundedSender<LinkEvent>,
    ) -> Result<Self, String> {
        let local = local.into();
        let certificate = Certificate::generate_self_signed(vec![local.clone()])
            .map_err(|e| format!("failed to generate link certificate: {e}"))?;
        Ok(Self {
            local,
            bind_ip,
            certificate,
            events,
            sessions: HashMap::new(),
        })
    }

    /// Bind a socket for a new session and advertise it
    fn open_session(&mut self, remote: &str, role: Role) -> Result<String, String> {
        self.close(remote);

        let std_socket = std::net::UdpSocket::bind((self.bind_ip, 0))
            .map_err(|e| format!("failed to bind link socket: {e}"))?;
        std_socket
            .set_nonblocking(true)
            .map_err(|e| format!("failed to configure link socket: {e}"))?;
        let port = std_socket
            .local_addr()
            .map_err(|e| format!("failed to read link socket address: {e}"))?
            .port();
        let socket = UdpSocket::from_std(std_socket)
            .map_err(|e| format!("failed to register link socket: {e}"))?;

        let ufrag = Uuid::new_v4().simple().to_string()[..8].to_string();
        let advertised = SocketAddr::new(routable_ip(self.bind_ip), port);
        tracing::debug!(remote, %advertised, ?role, "link socket bound");

        self.sessions.insert(
            remote.to_string(),
            LinkSession {
                role,
                local_ufrag: ufrag.clone(),
                remote_ufrag: None,
                socket: Some(socket),
                outbound: None,
                task: None,
            },
        );
        let _ = self.events.send(LinkEvent::LocalCandidate {
            remote: remote.to_string(),
            candidate: host_candidate(advertised, &ufrag),
        });
        Ok(ufrag)
    }
}

impl LinkBackend for DtlsBackend {
    fn create_offer(
        &mut self,
        remote: &str,
        ice_restart: bool,
    ) -> Result<SessionDescription, String> {
        if ice_restart {
            tracing::debug!(remote, "restarting link session");
        }
        let ufrag = self.open_session(remote, Role::Client)?;
        Ok(describe_session(SdpType::Offer, &ufrag))
    }

    fn create_answer(
        &mut self,
        remote: &str,
        offer: &SessionDescription,
    ) -> Result<SessionDescription, String> {
        let remote_ufrag = parse_ufrag(&offer.sdp)?;
        let ufrag = self.open_session(remote, Role::Server)?;
        if let Some(session) = self.sessions.get_mut(remote) {
            session.remote_ufrag = Some(remote_ufrag);
        }
        Ok(describe_session(SdpType::Answer, &ufrag))
    }

    fn set_remote_answer(
        &mut self,
        remote: &str,
        answer: &SessionDescription,
    ) -> Result<(), String> {
        let remote_ufrag = parse_ufrag(&answer.sdp)?;
        let session = self
            .sessions
            .get_mut(remote)
            .ok_or_else(|| format!("no session for {remote}"))?;
        if session.role != Role::Client {
            return Err("answer applied to an answering session".to_string());
        }
        session.remote_ufrag = Some(remote_ufrag);
        Ok(())
    }

    fn add_remote_candidate(
        &mut self,
        remote: &str,
        candidate: &IceCandidate,
    ) -> Result<(), String> {
        let addr = parse_candidate_addr(&candidate.candidate)?;
        let session = self
            .sessions
            .get_mut(remote)
            .ok_or_else(|| format!("no session for {remote}"))?;

        if let (Some(expected), Some(got)) = (&session.remote_ufrag, &candidate.username_fragment)
            && expected != got
        {
            tracing::debug!(remote, "ignoring candidate from a previous session");
            return Ok(());
        }
        let Some(socket) = session.socket.take() else {
            // Already connecting to an earlier candidate
            return Ok(());
        };

        let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
        let link = LinkTask {
            local: self.local.clone(),
            remote: remote.to_string(),
            role: session.role,
            certificate: self.certificate.clone(),
            events: self.events.clone(),
        };
        tracing::debug!(remote, %addr, "connecting link");
        session.outbound = Some(outbound_tx);
        session.task = Some(tokio::spawn(link.run(socket, addr, outbound_rx)));
        Ok(())
    }

    fn send(&mut self, remote: &str, datagram: &[u8]) -> Result<(), String> {
        let outbound = self
            .sessions
            .get(remote)
            .and_then(|s| s.outbound.as_ref())
            .ok_or_else(|| format!("no open link to {remote}"))?;
        outbound
            .send(datagram.to_vec())
            .map_err(|_| format!("link to {remote} closed"))
    }

    fn close(&mut self, remote: &str) {
        if let Some(session) = self.sessions.remove(remote) {
            tracing::debug!(remote, ufrag = %session.local_ufrag, "closing link session");
        }
    }
}

// =============================================================================
// Link Task
// =============================================================================

struct LinkTask {
    local: String,
    remote: String,
    role: Role,
    certificate: Certificate,
    events: mpsc::UnboundedSender<LinkEvent>,
}

impl LinkTask {
    async fn run(
        self,
        socket: UdpSocket,
        addr: SocketAddr,
        outbound: mpsc::UnboundedReceiver<Vec<u8>>,
    ) {
        if let Err(reason) = self.serve(socket, addr, outbound).await {
            let _ = self.events.send(LinkEvent::Failed {
                remote: self.remote.clone(),
                reason,
            });
        }
    }

    async fn serve(
        &self,
        socket: UdpSocket,
        addr: SocketAddr,
        mut outbound: mpsc::UnboundedReceiver<Vec<u8>>,
    ) -> Result<(), String> {
        socket
            .connect(addr)
            .await
            .map_err(|e| format!("failed to connect link socket: {e}"))?;
        let udp_conn = Arc::new(TokioUdpConn {
            socket: Arc::new(socket),
        });

        let config = DtlsConfig {
            certificates: vec![self.certificate.clone()],
            insecure_skip_verify: true,
            ..Default::default()
        };
        let dtls_conn = tokio::time::timeout(
            Duration::from_secs(HANDSHAKE_TIMEOUT_SECS),
            DTLSConn::new(udp_conn, config, self.role == Role::Client, None),
        )
        .await
        .map_err(|_| "DTLS handshake timeout".to_string())?
        .map_err(|e| format!("DTLS handshake failed: {e}"))?;
        let conn: Arc<dyn Conn + Send + Sync> = Arc::new(dtls_conn);

        if self
            .events
            .send(LinkEvent::Connected {
                remote: self.remote.clone(),
            })
            .is_err()
        {
            return Ok(());
        }

        let keepalive = FramePacket::keepalive(&self.local, CodecKind::Pcm16).to_bytes();
        let mut keepalive_interval =
            tokio::time::interval(Duration::from_secs(KEEPALIVE_INTERVAL_SECS));
        let mut buf = vec![0u8; RECV_BUFFER_SIZE];

        loop {
            tokio::select! {
                datagram = outbound.recv() => {
                    let Some(datagram) = datagram else {
                        let _ = conn.close().await;
                        return Ok(());
                    };
                    conn.send(&datagram)
                        .await
                        .map_err(|e| format!("failed to send datagram: {e}"))?;
                }

                result = conn.recv(&mut buf) => {
                    let len = result.map_err(|e| format!("link receive failed: {e}"))?;
                    if len == 0 {
                        return Err("link closed by remote".to_string());
                    }
                    let event = LinkEvent::Datagram {
                        remote: self.remote.clone(),
                        bytes: buf[..len].to_vec(),
                    };
                    if self.events.send(event).is_err() {
                        return Ok(());
                    }
                }

                _ = keepalive_interval.tick() => {
                    conn.send(&keepalive)
                        .await
                        .map_err(|e| format!("failed to send keepalive: {e}"))?;
                }
            }
        }
    }
}

// =============================================================================
// Tokio UDP Connection Wrapper
// =============================================================================

/// Wrapper for tokio UdpSocket to implement webrtc_util::Conn trait
struct TokioUdpConn {
    socket: Arc<UdpSocket>,
}

#[async_trait::async_trait]
impl webrtc_util::Conn for TokioUdpConn {
    async fn connect(&self, addr: SocketAddr) -> webrtc_util::Result<()> {
        self.socket
            .connect(addr)
            .await
            .map_err(|e| webrtc_util::Error::Other(e.to_string()))
    }

    async fn recv(&self, buf: &mut [u8]) -> webrtc_util::Result<usize> {
        self.socket
            .recv(buf)
            .await
            .map_err(|e| webrtc_util::Error::Other(e.to_string()))
    }

    async fn recv_from(&self, buf: &mut [u8]) -> webrtc_util::Result<(usize, SocketAddr)> {
        self.socket
            .recv_from(buf)
            .await
            .map_err(|e| webrtc_util::Error::Other(e.to_string()))
    }

    async fn send(&self, buf: &[u8]) -> webrtc_util::Result<usize> {
        self.socket
            .send(buf)
            .await
            .map_err(|e| webrtc_util::Error::Other(e.to_string()))
    }

    async fn send_to(&self, buf: &[u8], target: SocketAddr) -> webrtc_util::Result<usize> {
        self.socket
            .send_to(buf, target)
            .await
            .map_err(|e| webrtc_util::Error::Other(e.to_string()))
    }

    fn local_addr(&self) -> webrtc_util::Result<SocketAddr> {
        self.socket
            .local_addr()
            .map_err(|e| webrtc_util::Error::Other(e.to_string()))
    }

    fn remote_addr(&self) -> Option<SocketAddr> {
        self.socket.peer_addr().ok()
    }

    async fn close(&self) -> webrtc_util::Result<()> {
        Ok(())
    }

    fn as_any(&self) -> &(dyn Any + Send + Sync) {
        self
    }
}

// =============================================================================
// Tests
// =============================================================================
