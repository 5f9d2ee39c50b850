//! WebSocket gateway probe.
//!
//! Opens the socket on the resolved address, sends an empty text frame and
//! times how long the gateway takes to close the connection on us. The URL
//! host still drives TLS server name and the `Host` header.

use std::net::{IpAddr, SocketAddr};
use std::time::{Duration, Instant};

use futures::{SinkExt, StreamExt};
use reqwest::Url;
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::{Error as WsError, Message};

use super::ProbeError;

/// Socket address a gateway URL is dialled on when pinned to `ip`.
pub fn gateway_endpoint(address: &str, ip: IpAddr) -> Result<SocketAddr, ProbeError> {
    let url = Url::parse(address).map_err(|e| ProbeError::Handshake(e.to_string()))?;
    let port = match url.scheme() {
        "ws" | "wss" => url.port_or_known_default(),
        other => return Err(ProbeError::Handshake(format!("unsupported scheme {:?}", other))),
    };
    let port = port.ok_or_else(|| ProbeError::Handshake(format!("no port for {}", address)))?;
    Ok(SocketAddr::new(ip, port))
}

/// Check a WebSocket gateway. Returns open-to-close time in milliseconds.
pub async fn check_gateway(address: &str, ip: IpAddr, timeout: Duration) -> Result<f64, ProbeError> {
    let endpoint = gateway_endpoint(address, ip)?;
    tokio::time::timeout(timeout, exchange(address, endpoint))
        .await
        .map_err(|_| ProbeError::Timeout(timeout))?
}

async fn exchange(address: &str, endpoint: SocketAddr) -> Result<f64, ProbeError> {
    let stream = TcpStream::connect(endpoint)
        .await
        .map_err(|e| ProbeError::Network(format!("failed to connect to {}: {}", endpoint, e)))?;

    let (mut ws, _response) = tokio_tungstenite::client_async_tls(address, stream)
        .await
        .map_err(|e| ProbeError::Handshake(e.to_string()))?;

    let opened = Instant::now();

    ws.send(Message::Text(String::new()))
        .await
        .map_err(|e| ProbeError::Handshake(e.to_string()))?;

    while let Some(frame) = ws.next().await {
        match frame {
            Ok(Message::Close(_)) => break,
            Ok(_) => continue,
            Err(WsError::ConnectionClosed) | Err(WsError::AlreadyClosed) => break,
            Err(e) => return Err(ProbeError::Handshake(e.to_string())),
        }
    }

    Ok(opened.elapsed().as_secs_f64() * 1000.0)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ip() -> IpAddr {
        "192.0.2.7".parse().unwrap()
    }

    #[test]
    fn test_gateway_endpoint_is_pinned() {
        assert_eq!(gateway_endpoint("wss://gateway.example.com/?v=10", ip()).unwrap(), "192.0.2.7:443".parse().unwrap());
        assert_eq!(gateway_endpoint("ws://gateway.example.com:8080/ws", ip()).unwrap(), "192.0.2.7:8080".parse().unwrap());

        let v6: IpAddr = "2001:db8::7".parse().unwrap();
        assert_eq!(gateway_endpoint("ws://[2001:db8::7]/", v6).unwrap(), "[2001:db8::7]:80".parse().unwrap());
    }

    #[test]
    fn test_gateway_endpoint_rejects_other_schemes() {
        assert!(matches!(gateway_endpoint("https://gateway.example.com", ip()), Err(ProbeError::Handshake(_))));
    }

    #[tokio::test]
    async fn test_gateway_invalid_url() {
        let result = check_gateway("definitely not a url", ip(), Duration::from_millis(200)).await;
        assert!(matches!(result, Err(ProbeError::Handshake(_))));
    }
}
