use socket2::{Domain, Protocol, SockAddr, Socket, Type};
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr, UdpSocket};
use std::time::Duration;
use tracing::{debug, warn};

use crate::config::{Config, ProbeMode};
use crate::error::{ProbeError, Result};

/// Base of the deterministic source port range for voice probes (CALL-n)
pub const VOICE_PORT_BASE: u16 = 31000;
/// Base of the deterministic source port range for convergence probes (CONV-n)
pub const CONVERGENCE_PORT_BASE: u16 = 32000;

/// Receive buffer large enough for a few seconds of echoes at high rate
const RECV_BUFFER_SIZE: usize = 1024 * 1024;

/// Derive a stable source port from the numeric suffix of a probe id
///
/// Stable ports keep per-flow policies (and NAT bindings) pinned to one
/// probe across restarts. Ids without a numeric suffix get None (ephemeral).
pub fn derive_source_port(id: &str, mode: ProbeMode) -> Option<u16> {
    let digits: String = id
        .chars()
        .rev()
        .take_while(|c| c.is_ascii_digit())
        .collect::<Vec<_>>()
        .into_iter()
        .rev()
        .collect();
    if digits.is_empty() {
        return None;
    }
    let n: u32 = digits.parse().ok()?;

    let base = match mode {
        ProbeMode::Voice => VOICE_PORT_BASE,
        ProbeMode::Convergence => CONVERGENCE_PORT_BASE,
    } as u32;
    Some((base + n).min(u16::MAX as u32) as u16)
}

fn unspecified(target: &SocketAddr, port: u16) -> SocketAddr {
    let ip = match target.ip() {
        IpAddr::V4(_) => IpAddr::V4(Ipv4Addr::UNSPECIFIED),
        IpAddr::V6(_) => IpAddr::V6(Ipv6Addr::UNSPECIFIED),
    };
    SocketAddr::new(ip, port)
}

/// Create a UDP socket bound to `local` with a receive timeout
pub fn create_udp_socket(local: SocketAddr, read_timeout: Duration) -> Result<UdpSocket> {
    let domain = if local.is_ipv6() { Domain::IPV6 } else { Domain::IPV4 };
    let socket =
        Socket::new(domain, Type::DGRAM, Some(Protocol::UDP)).map_err(ProbeError::Socket)?;

    socket.set_nonblocking(false).map_err(ProbeError::Socket)?;
    socket
        .set_read_timeout(Some(read_timeout))
        .map_err(ProbeError::Socket)?;
    if let Err(e) = socket.set_recv_buffer_size(RECV_BUFFER_SIZE) {
        debug!(error = %e, "could not enlarge receive buffer");
    }

    socket
        .bind(&SockAddr::from(local))
        .map_err(|source| ProbeError::Bind { addr: local, source })?;

    Ok(socket.into())
}

/// Create the probe socket for a run
///
/// Uses the configured source port, else one derived from the probe id.
/// If that port is taken the socket falls back to an ephemeral port.
pub fn create_probe_socket(config: &Config) -> Result<UdpSocket> {
    let port = config
        .source_port
        .or_else(|| derive_source_port(&config.id, config.mode))
        .unwrap_or(0);
    let local = unspecified(&config.target, port);

    match create_udp_socket(local, config.recv_timeout) {
        Ok(socket) => Ok(socket),
        Err(e) if port != 0 && e.is_addr_in_use() => {
            warn!(port, "source port in use, falling back to an ephemeral port");
            create_udp_socket(unspecified(&config.target, 0), config.recv_timeout)
        }
        Err(e) => Err(e),
    }
}

/// True for the errors a read timeout produces
pub fn is_timeout(e: &std::io::Error) -> bool {
    matches!(
        e.kind(),
        std::io::ErrorKind::WouldBlock | std::io::ErrorKind::TimedOut
    )
}
