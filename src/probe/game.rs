//! Minecraft server list ping probe.
//!
//! Packets are framed as `[length: VarInt][id: VarInt][data]`. The check
//! performs the status handshake, validates the status JSON and times one
//! ping/pong exchange.

use std::net::{IpAddr, SocketAddr};
use std::time::{Duration, Instant};

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use unsigned_varint::{decode as varint_decode, encode as varint_encode};

use super::ProbeError;

/// Default Minecraft port.
pub const DEFAULT_PORT: u16 = 25565;

const PROTOCOL_VERSION: u32 = 767;
const NEXT_STATE_STATUS: u32 = 1;
const MAX_PACKET_LEN: u32 = 2 * 1024 * 1024;

/// Split `host[:port]` into host and port.
pub fn split_host_port(host: &str) -> (&str, u16) {
    match host.split_once(':') {
        Some((name, port)) => (name, port.parse().unwrap_or(DEFAULT_PORT)),
        None => (host, DEFAULT_PORT),
    }
}

/// Ping a game server at `ip`, announcing `host` in the handshake.
///
/// Returns the ping/pong round trip in milliseconds.
pub async fn check_game(host: &str, ip: IpAddr, timeout: Duration) -> Result<f64, ProbeError> {
    let (name, port) = split_host_port(host);
    tokio::time::timeout(timeout, exchange(name, port, ip))
        .await
        .map_err(|_| ProbeError::Timeout(timeout))?
}

async fn exchange(name: &str, port: u16, ip: IpAddr) -> Result<f64, ProbeError> {
    let mut stream = TcpStream::connect(SocketAddr::new(ip, port))
        .await
        .map_err(|e| ProbeError::Network(format!("failed to connect: {}", e)))?;

    let mut request = handshake_packet(name, port);
    request.extend_from_slice(&frame(0x00, &[]));
    write(&mut stream, &request).await?;

    let (id, status) = read_packet(&mut stream).await?;
    if id != 0x00 {
        return Err(ProbeError::Handshake(format!("unexpected status packet id {}", id)));
    }
    parse_status(&status)?;

    let payload: i64 = rand::random();
    let start = Instant::now();
    write(&mut stream, &frame(0x01, &payload.to_be_bytes())).await?;

    let (id, pong) = read_packet(&mut stream).await?;
    let elapsed = start.elapsed();

    if id != 0x01 || pong[..] != payload.to_be_bytes()[..] {
        return Err(ProbeError::Handshake("invalid pong".to_string()));
    }

    Ok(elapsed.as_secs_f64() * 1000.0)
}

async fn write(stream: &mut TcpStream, bytes: &[u8]) -> Result<(), ProbeError> {
    stream
        .write_all(bytes)
        .await
        .map_err(|e| ProbeError::Network(format!("failed to send: {}", e)))
}

fn push_varint(buf: &mut Vec<u8>, value: u32) {
    let mut scratch = varint_encode::u32_buffer();
    buf.extend_from_slice(varint_encode::u32(value, &mut scratch));
}

fn frame(id: u32, data: &[u8]) -> Vec<u8> {
    let mut body = Vec::with_capacity(data.len() + 5);
    push_varint(&mut body, id);
    body.extend_from_slice(data);

    let mut packet = Vec::with_capacity(body.len() + 5);
    push_varint(&mut packet, body.len() as u32);
    packet.extend_from_slice(&body);
    packet
}

fn handshake_packet(name: &str, port: u16) -> Vec<u8> {
    let mut data = Vec::with_capacity(name.len() + 16);
    push_varint(&mut data, PROTOCOL_VERSION);
    push_varint(&mut data, name.len() as u32);
    data.extend_from_slice(name.as_bytes());
    data.extend_from_slice(&port.to_be_bytes());
    push_varint(&mut data, NEXT_STATE_STATUS);
    frame(0x00, &data)
}

async fn read_varint<R: AsyncRead + Unpin>(reader: &mut R) -> Result<u32, ProbeError> {
    let mut bytes = Vec::with_capacity(5);
    loop {
        let byte = reader
            .read_u8()
            .await
            .map_err(|e| ProbeError::Network(format!("failed to recv: {}", e)))?;
        bytes.push(byte);
        if byte & 0x80 == 0 {
            break;
        }
        if bytes.len() == 5 {
            return Err(ProbeError::Handshake("VarInt too long".to_string()));
        }
    }
    varint_decode::u32(&bytes)
        .map(|(value, _)| value)
        .map_err(|e| ProbeError::Handshake(format!("bad VarInt: {}", e)))
}

/// Read one framed packet, returning its id and payload.
async fn read_packet<R: AsyncRead + Unpin>(reader: &mut R) -> Result<(u32, Vec<u8>), ProbeError> {
    let len = read_varint(reader).await?;
    if len == 0 || len > MAX_PACKET_LEN {
        return Err(ProbeError::Handshake(format!("invalid packet length {}", len)));
    }

    let mut body = vec![0u8; len as usize];
    reader
        .read_exact(&mut body)
        .await
        .map_err(|e| ProbeError::Network(format!("failed to recv: {}", e)))?;

    let (id, rest) = varint_decode::u32(&body).map_err(|e| ProbeError::Handshake(format!("bad packet id: {}", e)))?;
    Ok((id, rest.to_vec()))
}

/// Validate a status response payload (a VarInt-prefixed JSON string).
fn parse_status(data: &[u8]) -> Result<serde_json::Value, ProbeError> {
    let (len, rest) = varint_decode::u32(data).map_err(|_| ProbeError::Payload("Invalid status".to_string()))?;
    let json = rest
        .get(..len as usize)
        .ok_or_else(|| ProbeError::Payload("Invalid status".to_string()))?;
    serde_json::from_slice(json).map_err(|_| ProbeError::Payload("Invalid JSON".to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;

    fn status_packet(json: &str) -> Vec<u8> {
        let mut data = Vec::new();
        push_varint(&mut data, json.len() as u32);
        data.extend_from_slice(json.as_bytes());
        frame(0x00, &data)
    }

    #[test]
    fn test_split_host_port() {
        assert_eq!(split_host_port("mc.example.com"), ("mc.example.com", 25565));
        assert_eq!(split_host_port("mc.example.com:25570"), ("mc.example.com", 25570));
        assert_eq!(split_host_port("mc.example.com:x"), ("mc.example.com", 25565));
    }

    #[test]
    fn test_handshake_packet_layout() {
        let packet = handshake_packet("mc", 25565);
        // len, id 0, version 767 (0xff 0x05), "mc", port, next state 1
        assert_eq!(packet, vec![9, 0x00, 0xff, 0x05, 2, b'm', b'c', 0x63, 0xdd, 1]);
    }

    #[tokio::test]
    async fn test_read_status_packet() {
        let bytes = status_packet(r#"{"version":{"name":"1.21"}}"#);
        let mut reader = bytes.as_slice();
        let (id, data) = read_packet(&mut reader).await.unwrap();
        assert_eq!(id, 0);
        assert_eq!(parse_status(&data).unwrap()["version"]["name"], "1.21");
    }

    #[tokio::test]
    async fn test_invalid_status_json() {
        let bytes = status_packet("not json");
        let (_, data) = read_packet(&mut bytes.as_slice()).await.unwrap();
        assert!(matches!(parse_status(&data), Err(ProbeError::Payload(_))));
    }

    #[tokio::test]
    async fn test_check_against_local_server() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();

        tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let (id, _) = read_packet(&mut socket).await.unwrap(); // handshake
            assert_eq!(id, 0);
            let (id, _) = read_packet(&mut socket).await.unwrap(); // status request
            assert_eq!(id, 0);
            socket.write_all(&status_packet(r#"{"players":{"online":3}}"#)).await.unwrap();
            let (id, payload) = read_packet(&mut socket).await.unwrap();
            assert_eq!(id, 1);
            socket.write_all(&frame(0x01, &payload)).await.unwrap();
        });

        let latency = check_game(
            &format!("localhost:{}", port),
            "127.0.0.1".parse().unwrap(),
            Duration::from_secs(2),
        )
        .await
        .unwrap();
        assert!(latency >= 0.0);
    }
}
