//! Ping probe implementation with native ICMP (high-precision) and command fallback.
//!
//! Uses blocking sockets in spawn_blocking for sub-millisecond timing precision.
//! Echo identifiers are leased from a bounded [`SessionPool`] so concurrent
//! pings never share an identifier.

use std::mem::MaybeUninit;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::process::Stdio;
use std::sync::atomic::{AtomicU16, Ordering};
use std::sync::{Arc, Mutex, OnceLock};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use regex::Regex;
use socket2::{Domain, Protocol, Socket, Type};
use tokio::process::Command;

use super::ProbeError;

/// Number of echo identifiers available for concurrent pings.
pub const SESSION_POOL_SIZE: usize = 1024;

/// ICMP capability state
#[derive(Debug, Clone, Copy, PartialEq)]
enum IcmpCapability {
    /// Native ICMP sockets are available
    Native,
    /// Only command fallback is available
    CommandOnly,
}

static ICMP_CAPABILITY: OnceLock<IcmpCapability> = OnceLock::new();

/// Ping sequence counter
static PING_SEQUENCE: AtomicU16 = AtomicU16::new(0);

/// Free-list of ICMP echo identifiers.
pub struct SessionPool {
    free: Mutex<Vec<u16>>,
}

impl SessionPool {
    /// Pool of `size` consecutive identifiers starting at a random base, so
    /// two agents on one host are unlikely to overlap.
    pub fn new(size: usize) -> Arc<Self> {
        let base: u16 = rand::random();
        let free = (0..size.min(u16::MAX as usize + 1))
            .map(|i| base.wrapping_add(i as u16))
            .collect();
        Arc::new(Self {
            free: Mutex::new(free),
        })
    }

    /// Take an identifier, or `None` when all are in use.
    pub fn acquire(self: &Arc<Self>) -> Option<SessionLease> {
        let id = self.free.lock().unwrap_or_else(|e| e.into_inner()).pop()?;
        Some(SessionLease {
            id,
            pool: self.clone(),
        })
    }

    #[cfg(test)]
    pub fn available(&self) -> usize {
        self.free.lock().unwrap_or_else(|e| e.into_inner()).len()
    }
}

/// An identifier on loan from a [`SessionPool`], returned on drop.
pub struct SessionLease {
    id: u16,
    pool: Arc<SessionPool>,
}

impl SessionLease {
    pub fn id(&self) -> u16 {
        self.id
    }
}

impl Drop for SessionLease {
    fn drop(&mut self) {
        self.pool
            .free
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(self.id);
    }
}

/// Sends a single echo request to an address.
#[async_trait]
pub trait Pinger: Send + Sync {
    /// Round-trip time in milliseconds.
    async fn ping(&self, ip: IpAddr, timeout: Duration) -> Result<f64, ProbeError>;
}

/// Native ICMP pinger backed by a session pool.
pub struct IcmpPinger {
    sessions: Arc<SessionPool>,
}

impl IcmpPinger {
    pub fn new(sessions: Arc<SessionPool>) -> Self {
        Self { sessions }
    }
}

#[async_trait]
impl Pinger for IcmpPinger {
    async fn ping(&self, ip: IpAddr, timeout: Duration) -> Result<f64, ProbeError> {
        let lease = self
            .sessions
            .acquire()
            .ok_or_else(|| ProbeError::Network("no free ICMP session id".to_string()))?;
        run_ping_probe(ip, lease, timeout).await
    }
}

/// Detect ICMP capability by attempting to create a socket.
fn detect_icmp_capability() -> IcmpCapability {
    // Try RAW socket first (requires CAP_NET_RAW or root)
    if Socket::new(Domain::IPV4, Type::RAW, Some(Protocol::ICMPV4)).is_ok() {
        tracing::info!("Ping probe: using native ICMP (RAW socket, privileged)");
        return IcmpCapability::Native;
    }

    // Try DGRAM (unprivileged on Linux with ping_group_range set, or macOS)
    if Socket::new(Domain::IPV4, Type::DGRAM, Some(Protocol::ICMPV4)).is_ok() {
        tracing::info!("Ping probe: using native ICMP (DGRAM socket, unprivileged)");
        return IcmpCapability::Native;
    }

    tracing::info!("Ping probe: native ICMP unavailable, using command fallback");
    IcmpCapability::CommandOnly
}

/// Ping an address once, holding `lease` for the duration of the exchange.
///
/// Returns latency in milliseconds. No retries: a lost echo is an error.
pub async fn run_ping_probe(ip: IpAddr, lease: SessionLease, timeout: Duration) -> Result<f64, ProbeError> {
    let capability = *ICMP_CAPABILITY.get_or_init(detect_icmp_capability);

    if capability == IcmpCapability::Native {
        let identifier = lease.id();

        // Run blocking ICMP in dedicated thread for precise timing
        let result = tokio::task::spawn_blocking(move || run_blocking_ping(ip, identifier, timeout))
            .await
            .map_err(|e| ProbeError::Network(format!("spawn_blocking failed: {}", e)))?;
        drop(lease);

        match result {
            Ok(latency) => return Ok(latency),
            Err(ProbeError::Network(msg))
                if msg.contains("Permission")
                    || msg.contains("Operation not permitted")
                    || msg.contains("denied") =>
            {
                tracing::warn!(
                    "Native ping failed with permission error for {}, falling back to command: {}",
                    ip,
                    msg
                );
                return run_ping_command(ip, timeout).await;
            }
            Err(e) => return Err(e),
        }
    }

    drop(lease);
    run_ping_command(ip, timeout).await
}

fn run_blocking_ping(ip: IpAddr, identifier: u16, timeout: Duration) -> Result<f64, ProbeError> {
    match ip {
        IpAddr::V4(v4) => run_blocking_ping_v4(v4, identifier, timeout),
        IpAddr::V6(v6) => run_blocking_ping_v6(v6, identifier, timeout),
    }
}

fn open_socket(domain: Domain, protocol: Protocol, dest: SocketAddr, timeout: Duration) -> Result<Socket, ProbeError> {
    // Try RAW first (privileged), then DGRAM (unprivileged)
    let socket = Socket::new(domain, Type::RAW, Some(protocol))
        .or_else(|_| Socket::new(domain, Type::DGRAM, Some(protocol)))
        .map_err(|e| ProbeError::Network(format!("Failed to create ICMP socket: {}", e)))?;

    socket
        .set_read_timeout(Some(timeout))
        .map_err(|e| ProbeError::Network(format!("Failed to set timeout: {}", e)))?;
    socket
        .set_write_timeout(Some(timeout))
        .map_err(|e| ProbeError::Network(format!("Failed to set timeout: {}", e)))?;
    socket
        .connect(&dest.into())
        .map_err(|e| ProbeError::Network(format!("Failed to connect: {}", e)))?;

    Ok(socket)
}

fn send_packet(socket: &Socket, packet: &[u8]) -> Result<(), ProbeError> {
    socket.send(packet).map(|_| ()).map_err(|e| {
        if e.kind() == std::io::ErrorKind::PermissionDenied {
            ProbeError::Network(format!("Permission denied: {}", e))
        } else {
            ProbeError::Network(format!("Failed to send: {}", e))
        }
    })
}

/// Receive until our echo reply shows up or the timeout elapses.
///
/// `matches` inspects a received datagram and reports whether it is the reply.
fn await_reply<F>(socket: &Socket, start: Instant, timeout: Duration, matches: F) -> Result<f64, ProbeError>
where
    F: Fn(&[u8]) -> bool,
{
    loop {
        let mut buf = [MaybeUninit::<u8>::uninit(); 1500];
        let len = socket.recv(&mut buf).map_err(|e| {
            if e.kind() == std::io::ErrorKind::WouldBlock || e.kind() == std::io::ErrorKind::TimedOut {
                ProbeError::Timeout(timeout)
            } else {
                ProbeError::Network(format!("Failed to receive: {}", e))
            }
        })?;
        // SAFETY: recv initialized `len` bytes
        let buf: &[u8] = unsafe { std::slice::from_raw_parts(buf.as_ptr() as *const u8, len) };

        // Stop timing immediately after receive
        let elapsed = start.elapsed();
        if elapsed >= timeout {
            return Err(ProbeError::Timeout(timeout));
        }

        if matches(buf) {
            return Ok(elapsed.as_secs_f64() * 1000.0);
        }
        // Received something else, keep waiting
    }
}

/// ICMP Echo Request for IPv4
fn run_blocking_ping_v4(ip: Ipv4Addr, identifier: u16, timeout: Duration) -> Result<f64, ProbeError> {
    let socket = open_socket(
        Domain::IPV4,
        Protocol::ICMPV4,
        SocketAddr::new(IpAddr::V4(ip), 0),
        timeout,
    )?;

    let sequence = PING_SEQUENCE.fetch_add(1, Ordering::Relaxed);
    let packet = build_icmp_echo_request(identifier, sequence);

    let start = Instant::now();
    send_packet(&socket, &packet)?;

    await_reply(&socket, start, timeout, |buf| {
        is_echo_reply(buf, ipv4_header_len(buf), 0, identifier, sequence)
    })
}

/// Length of the IPv4 header in front of the ICMP message.
///
/// DGRAM sockets deliver the bare ICMP message, RAW sockets include the IP
/// header, options included.
fn ipv4_header_len(buf: &[u8]) -> usize {
    match buf.first() {
        Some(&b) if b >> 4 == 4 => usize::from(b & 0x0f) * 4,
        _ => 0,
    }
}

/// ICMP Echo Request for IPv6
fn run_blocking_ping_v6(ip: Ipv6Addr, identifier: u16, timeout: Duration) -> Result<f64, ProbeError> {
    let socket = open_socket(
        Domain::IPV6,
        Protocol::ICMPV6,
        SocketAddr::new(IpAddr::V6(ip), 0),
        timeout,
    )?;

    let sequence = PING_SEQUENCE.fetch_add(1, Ordering::Relaxed);
    let packet = build_icmpv6_echo_request(identifier, sequence);

    let start = Instant::now();
    send_packet(&socket, &packet)?;

    await_reply(&socket, start, timeout, |buf| is_echo_reply(buf, 0, 129, identifier, sequence))
}

/// Check whether the ICMP message at `offset` is the echo reply we are waiting for.
///
/// DGRAM sockets on Linux rewrite the identifier to the socket port, so only the
/// sequence is compared when the identifier differs.
fn is_echo_reply(buf: &[u8], offset: usize, reply_type: u8, identifier: u16, sequence: u16) -> bool {
    if buf.len() < offset + 8 {
        return false;
    }
    let kind = buf[offset];
    let reply_id = u16::from_be_bytes([buf[offset + 4], buf[offset + 5]]);
    let reply_seq = u16::from_be_bytes([buf[offset + 6], buf[offset + 7]]);
    kind == reply_type && reply_seq == sequence && (reply_id == identifier || offset == 0)
}

fn timestamp_payload(packet: &mut [u8]) {
    let timestamp = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_nanos() as u64;
    packet[8..16].copy_from_slice(&timestamp.to_be_bytes());
}

/// Build an ICMP Echo Request packet (type 8, code 0).
fn build_icmp_echo_request(identifier: u16, sequence: u16) -> Vec<u8> {
    let mut packet = vec![0u8; 64]; // 8 byte header + 56 byte payload

    packet[0] = 8; // Type: Echo Request
    packet[1] = 0; // Code: 0
    packet[4..6].copy_from_slice(&identifier.to_be_bytes());
    packet[6..8].copy_from_slice(&sequence.to_be_bytes());
    timestamp_payload(&mut packet);

    let checksum = icmp_checksum(&packet);
    packet[2..4].copy_from_slice(&checksum.to_be_bytes());

    packet
}

/// Build an ICMPv6 Echo Request packet (type 128, code 0).
///
/// The kernel fills in the ICMPv6 checksum.
fn build_icmpv6_echo_request(identifier: u16, sequence: u16) -> Vec<u8> {
    let mut packet = vec![0u8; 64];

    packet[0] = 128; // Type: Echo Request
    packet[1] = 0; // Code: 0
    packet[4..6].copy_from_slice(&identifier.to_be_bytes());
    packet[6..8].copy_from_slice(&sequence.to_be_bytes());
    timestamp_payload(&mut packet);

    packet
}

/// Compute ICMP checksum (RFC 1071).
fn icmp_checksum(data: &[u8]) -> u16 {
    let mut sum: u32 = 0;
    let mut chunks = data.chunks_exact(2);

    for pair in &mut chunks {
        sum += u16::from_be_bytes([pair[0], pair[1]]) as u32;
    }

    // Handle odd byte
    if let [last] = chunks.remainder() {
        sum += (*last as u32) << 8;
    }

    // Fold 32-bit sum to 16 bits
    while sum >> 16 != 0 {
        sum = (sum & 0xFFFF) + (sum >> 16);
    }

    !sum as u16
}

/// Run ping via command execution (fallback).
async fn run_ping_command(ip: IpAddr, timeout: Duration) -> Result<f64, ProbeError> {
    let timeout_secs = timeout.as_secs().max(1);

    let output = Command::new("ping")
        .args(["-c", "1", "-W", &timeout_secs.to_string(), &ip.to_string()])
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .output()
        .await
        .map_err(|e| ProbeError::Command(format!("failed to execute ping: {}", e)))?;

    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        let stdout = String::from_utf8_lossy(&output.stdout);
        if stderr.contains("timeout")
            || stdout.contains("100% packet loss")
            || stdout.contains("100.0% packet loss")
        {
            return Err(ProbeError::Timeout(timeout));
        }
        return Err(ProbeError::Command(format!("ping failed: {}", stdout)));
    }

    let stdout = String::from_utf8_lossy(&output.stdout);
    parse_ping_output(&stdout)
}

/// Parse ping command output for latency in milliseconds.
fn parse_ping_output(output: &str) -> Result<f64, ProbeError> {
    static PATTERNS: OnceLock<Vec<(Regex, usize)>> = OnceLock::new();
    let patterns = PATTERNS.get_or_init(|| {
        [
            // Per-packet response "time=X.XXX ms" (Linux, some macOS)
            (r"time[=<]([0-9.]+)\s*ms", 1),
            // Summary line "round-trip min/avg/max/stddev = X/X/X/X ms" (macOS), average
            (r"round-trip\s+min/avg/max/stddev\s*=\s*([0-9.]+)/([0-9.]+)/([0-9.]+)", 2),
            // Summary line "rtt min/avg/max/mdev = X/X/X/X ms" (Linux), average
            (r"rtt\s+min/avg/max/mdev\s*=\s*([0-9.]+)/([0-9.]+)/([0-9.]+)", 2),
        ]
        .into_iter()
        .filter_map(|(pattern, group)| Regex::new(pattern).ok().map(|re| (re, group)))
        .collect()
    });

    patterns
        .iter()
        .find_map(|(re, group)| {
            re.captures(output)
                .and_then(|caps| caps.get(*group))
                .and_then(|m| m.as_str().parse::<f64>().ok())
        })
        .ok_or_else(|| ProbeError::Command(format!("failed to parse ping output: {}", output)))
}
