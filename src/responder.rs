//! UDP echo responder.
//!
//! Reflects every datagram back to its sender. Convergence probes get a
//! `:S<n>` suffix carrying the session's running echo count, which the
//! probe uses to split loss into the outbound and return legs.

use parking_lot::Mutex;
use std::collections::HashMap;
use std::net::{SocketAddr, UdpSocket};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::error::{ProbeError, Result};
use crate::probe::is_timeout;
use crate::probe::payload::CONVERGENCE_TAG;
use crate::probe::socket::create_udp_socket;

/// Largest datagram echoed
const MAX_DATAGRAM: usize = 9000;

/// Responder settings
#[derive(Debug, Clone)]
pub struct ResponderConfig {
    /// Idle time after which a session is forgotten
    pub session_timeout: Duration,
    /// Socket read timeout (also the expiry sweep cadence)
    pub read_timeout: Duration,
}

impl Default for ResponderConfig {
    fn default() -> Self {
        Self {
            session_timeout: Duration::from_secs(60),
            read_timeout: Duration::from_secs(1),
        }
    }
}

/// How a session is identified
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum SessionKey {
    /// Convergence probes, by probe id (survives source address changes)
    Probe(String),
    /// Voice streams, by source address
    Peer(SocketAddr),
}

#[derive(Debug)]
struct Session {
    count: u64,
    started: Instant,
    last_seen: Instant,
    last_addr: SocketAddr,
    port: u16,
}

#[derive(Debug)]
struct Shared {
    config: ResponderConfig,
    sessions: Mutex<HashMap<SessionKey, Session>>,
    last_sweep: Mutex<Instant>,
}

impl Shared {
    /// Account one datagram and build the reply
    fn respond(&self, data: &[u8], from: SocketAddr, port: u16, now: Instant) -> Vec<u8> {
        let probe_id = convergence_id(data);
        let key = match probe_id {
            Some(id) => SessionKey::Probe(id.to_string()),
            None => SessionKey::Peer(from),
        };

        let count = {
            let mut sessions = self.sessions.lock();
            let session = sessions.entry(key.clone()).or_insert_with(|| {
                debug!(?key, %from, port, "new session");
                Session {
                    count: 0,
                    started: now,
                    last_seen: now,
                    last_addr: from,
                    port,
                }
            });
            session.count += 1;
            session.last_seen = now;
            session.last_addr = from;
            session.count
        };

        let mut reply = data.to_vec();
        if probe_id.is_some() {
            reply.extend_from_slice(format!(":S{}", count).as_bytes());
        }
        reply
    }

    /// Drop sessions idle longer than the timeout
    fn expire(&self, now: Instant) -> usize {
        let timeout = self.config.session_timeout;
        let mut sessions = self.sessions.lock();
        let before = sessions.len();
        sessions.retain(|key, s| {
            let idle = now.saturating_duration_since(s.last_seen);
            let keep = idle <= timeout;
            if !keep {
                debug!(
                    ?key,
                    port = s.port,
                    last_addr = %s.last_addr,
                    packets = s.count,
                    duration_s = s.last_seen.saturating_duration_since(s.started).as_secs(),
                    "session completed"
                );
            }
            keep
        });
        before - sessions.len()
    }

    fn maybe_expire(&self, now: Instant) {
        {
            let mut last = self.last_sweep.lock();
            if now.saturating_duration_since(*last) < self.config.read_timeout {
                return;
            }
            *last = now;
        }
        self.expire(now);
    }
}

/// Probe id of a convergence payload (`CONV:ID:...`)
fn convergence_id(data: &[u8]) -> Option<&str> {
    let text = std::str::from_utf8(data).ok()?;
    let mut parts = text.split(':');
    if parts.next()? != CONVERGENCE_TAG {
        return None;
    }
    parts.next().filter(|id| !id.is_empty())
}

/// Cloneable control surface of a running responder
#[derive(Debug, Clone)]
pub struct ResponderHandle {
    shared: Arc<Shared>,
    cancel: CancellationToken,
}

impl ResponderHandle {
    /// Forget a convergence session, as if the responder had restarted
    pub fn reset_session(&self, probe_id: &str) -> bool {
        let removed = self
            .shared
            .sessions
            .lock()
            .remove(&SessionKey::Probe(probe_id.to_string()))
            .is_some();
        if removed {
            info!(probe_id, "session counter reset");
        }
        removed
    }

    /// Echoes sent so far for a convergence session
    pub fn echo_count(&self, probe_id: &str) -> Option<u64> {
        self.shared
            .sessions
            .lock()
            .get(&SessionKey::Probe(probe_id.to_string()))
            .map(|s| s.count)
    }

    pub fn session_count(&self) -> usize {
        self.shared.sessions.lock().len()
    }

    pub fn shutdown(&self) {
        self.cancel.cancel();
    }
}

/// A bound echo responder, one socket per port
pub struct Responder {
    sockets: Vec<UdpSocket>,
    handle: ResponderHandle,
}

impl Responder {
    /// Bind every address up front so port conflicts fail before serving
    pub fn bind(addrs: &[SocketAddr], config: ResponderConfig) -> Result<Self> {
        if addrs.is_empty() {
            return Err(ProbeError::Config("no listen address".to_string()));
        }
        let sockets = addrs
            .iter()
            .map(|addr| create_udp_socket(*addr, config.read_timeout))
            .collect::<Result<Vec<_>>>()?;

        Ok(Self {
            sockets,
            handle: ResponderHandle {
                shared: Arc::new(Shared {
                    config,
                    sessions: Mutex::new(HashMap::new()),
                    last_sweep: Mutex::new(Instant::now()),
                }),
                cancel: CancellationToken::new(),
            },
        })
    }

    pub fn local_addrs(&self) -> Vec<SocketAddr> {
        self.sockets.iter().filter_map(|s| s.local_addr().ok()).collect()
    }

    pub fn handle(&self) -> ResponderHandle {
        self.handle.clone()
    }

    /// Serve every port on its own thread until shut down
    pub fn spawn(self) -> Vec<JoinHandle<Result<()>>> {
        self.sockets
            .into_iter()
            .map(|socket| {
                let handle = self.handle.clone();
                std::thread::spawn(move || serve(socket, handle))
            })
            .collect()
    }
}

fn serve(socket: UdpSocket, handle: ResponderHandle) -> Result<()> {
    let port = socket.local_addr().map_err(ProbeError::Socket)?.port();
    info!(port, "echo responder listening");
    let mut buffer = vec![0u8; MAX_DATAGRAM];

    while !handle.cancel.is_cancelled() {
        match socket.recv_from(&mut buffer) {
            Ok((len, from)) => {
                let now = Instant::now();
                let reply = handle.shared.respond(&buffer[..len], from, port, now);
                if let Err(e) = socket.send_to(&reply, from) {
                    debug!(%from, error = %e, "echo send failed");
                }
                handle.shared.maybe_expire(now);
            }
            Err(e) if is_timeout(&e) => handle.shared.maybe_expire(Instant::now()),
            Err(e) => {
                warn!(port, error = %e, "responder receive error");
            }
        }
    }

    debug!(port, "echo responder stopped");
    Ok(())
}
