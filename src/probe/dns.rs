//! SRV record lookup using raw UDP packets.
//!
//! Only what game service discovery needs: one SRV question, answers parsed
//! with name compression support.

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::time::Duration;

use tokio::net::UdpSocket;

use super::ProbeError;

const TYPE_SRV: u16 = 33;
const CLASS_IN: u16 = 1;
const RCODE_NXDOMAIN: u8 = 3;

/// A service location record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SrvRecord {
    pub priority: u16,
    pub weight: u16,
    pub port: u16,
    pub target: String,
}

/// First `nameserver` from /etc/resolv.conf, or the local stub resolver.
pub fn system_nameserver() -> SocketAddr {
    std::fs::read_to_string("/etc/resolv.conf")
        .ok()
        .and_then(|conf| parse_resolv_conf(&conf))
        .unwrap_or_else(|| SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), 53))
}

fn parse_resolv_conf(conf: &str) -> Option<SocketAddr> {
    conf.lines()
        .filter_map(|line| line.trim().strip_prefix("nameserver"))
        .filter_map(|rest| rest.trim().parse::<IpAddr>().ok())
        .map(|ip| SocketAddr::new(ip, 53))
        .next()
}

/// Query `name` for SRV records and return the preferred one.
///
/// `Ok(None)` when the name does not exist or carries no SRV answer.
pub async fn lookup_srv(name: &str, server: SocketAddr, timeout: Duration) -> Result<Option<SrvRecord>, ProbeError> {
    let tx_id: u16 = rand::random();
    let packet = build_srv_query(tx_id, name)?;

    let bind: SocketAddr = if server.is_ipv6() {
        "[::]:0".parse().map_err(|_| ProbeError::Config("bad bind address".to_string()))?
    } else {
        SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), 0)
    };

    let socket = UdpSocket::bind(bind)
        .await
        .map_err(|e| ProbeError::Network(format!("failed to bind socket: {}", e)))?;
    socket
        .connect(server)
        .await
        .map_err(|e| ProbeError::Network(format!("failed to connect: {}", e)))?;
    socket
        .send(&packet)
        .await
        .map_err(|e| ProbeError::Network(format!("failed to send: {}", e)))?;

    let mut response = [0u8; 1500];
    let n = tokio::time::timeout(timeout, socket.recv(&mut response))
        .await
        .map_err(|_| ProbeError::Timeout(timeout))?
        .map_err(|e| ProbeError::Network(format!("failed to recv: {}", e)))?;

    let mut records = parse_srv_response(tx_id, &response[..n])?;
    records.sort_by(|a, b| a.priority.cmp(&b.priority).then(b.weight.cmp(&a.weight)));
    Ok(records.into_iter().next())
}

/// Build a recursive SRV query packet.
fn build_srv_query(tx_id: u16, name: &str) -> Result<Vec<u8>, ProbeError> {
    let flags: u16 = 0x0100; // Standard query, recursion desired

    let mut packet = Vec::with_capacity(64);
    packet.extend_from_slice(&tx_id.to_be_bytes());
    packet.extend_from_slice(&flags.to_be_bytes());
    packet.extend_from_slice(&1u16.to_be_bytes()); // QDCOUNT
    packet.extend_from_slice(&[0, 0, 0, 0, 0, 0]); // AN/NS/AR counts

    for label in name.trim_end_matches('.').split('.') {
        if label.is_empty() || label.len() > 63 {
            return Err(ProbeError::Config(format!("invalid DNS name: {}", name)));
        }
        packet.push(label.len() as u8);
        packet.extend_from_slice(label.as_bytes());
    }
    packet.push(0);

    packet.extend_from_slice(&TYPE_SRV.to_be_bytes());
    packet.extend_from_slice(&CLASS_IN.to_be_bytes());

    Ok(packet)
}

fn read_u16(msg: &[u8], pos: usize) -> Result<u16, ProbeError> {
    msg.get(pos..pos + 2)
        .map(|b| u16::from_be_bytes([b[0], b[1]]))
        .ok_or_else(|| ProbeError::Network("truncated DNS response".to_string()))
}

/// Read a possibly compressed name at `pos`. Returns the name and the
/// position right after it in the enclosing record.
fn read_name(msg: &[u8], mut pos: usize) -> Result<(String, usize), ProbeError> {
    let truncated = || ProbeError::Network("truncated DNS response".to_string());
    let mut labels: Vec<String> = Vec::new();
    let mut end = None;
    let mut jumps = 0;

    loop {
        let len = *msg.get(pos).ok_or_else(truncated)?;
        if len & 0xC0 == 0xC0 {
            let low = *msg.get(pos + 1).ok_or_else(truncated)?;
            end.get_or_insert(pos + 2);
            jumps += 1;
            if jumps > 16 {
                return Err(ProbeError::Network("DNS name compression loop".to_string()));
            }
            pos = (((len & 0x3F) as usize) << 8) | low as usize;
            continue;
        }
        if len == 0 {
            pos += 1;
            break;
        }
        let label = msg.get(pos + 1..pos + 1 + len as usize).ok_or_else(truncated)?;
        labels.push(String::from_utf8_lossy(label).into_owned());
        pos += 1 + len as usize;
    }

    Ok((labels.join("."), end.unwrap_or(pos)))
}

fn parse_srv_response(tx_id: u16, msg: &[u8]) -> Result<Vec<SrvRecord>, ProbeError> {
    if msg.len() < 12 {
        return Err(ProbeError::Network(format!("response too short: {} bytes", msg.len())));
    }

    let resp_tx_id = read_u16(msg, 0)?;
    if resp_tx_id != tx_id {
        return Err(ProbeError::Network(format!(
            "transaction ID mismatch: got {}, expected {}",
            resp_tx_id, tx_id
        )));
    }

    // Check RCODE (lower 4 bits of byte 3)
    let rcode = msg[3] & 0x0F;
    if rcode == RCODE_NXDOMAIN {
        return Ok(Vec::new());
    }
    if rcode != 0 {
        return Err(ProbeError::Network(format!("DNS error RCODE: {}", rcode)));
    }

    let qd_count = read_u16(msg, 4)?;
    let an_count = read_u16(msg, 6)?;

    let mut pos = 12;
    for _ in 0..qd_count {
        let (_, next) = read_name(msg, pos)?;
        pos = next + 4;
    }

    let mut records = Vec::new();
    for _ in 0..an_count {
        let (_, next) = read_name(msg, pos)?;
        let rtype = read_u16(msg, next)?;
        let rdlength = read_u16(msg, next + 8)? as usize;
        let rdata = next + 10;

        if rtype == TYPE_SRV {
            let (target, _) = read_name(msg, rdata + 6)?;
            records.push(SrvRecord {
                priority: read_u16(msg, rdata)?,
                weight: read_u16(msg, rdata + 2)?,
                port: read_u16(msg, rdata + 4)?,
                target,
            });
        }
        pos = rdata + rdlength;
    }

    Ok(records)
}
