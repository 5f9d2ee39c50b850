//! Probe module for service checks.
//!
//! One wire probe per service kind: HTTP for websites and APIs, WebSocket
//! for gateways, server list ping for game servers and ICMP for raw hosts.

mod dns;
mod game;
mod http;
mod ping;
mod ws;

pub use dns::*;
pub use game::*;
pub use http::*;
pub use ping::*;
pub use ws::*;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;

use crate::db::ServiceKind;
use crate::resolver::ResolvedService;

/// Probe error types.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ProbeError {
    #[error("probe timed out after {0:?}")]
    Timeout(Duration),
    #[error("status code ({0}) is not 200")]
    Status(u16),
    #[error("{0}")]
    Payload(String),
    #[error("network error: {0}")]
    Network(String),
    #[error("handshake failed: {0}")]
    Handshake(String),
    #[error("command failed: {0}")]
    Command(String),
    #[error("invalid configuration: {0}")]
    Config(String),
}

/// Runs the protocol check for one resolved service.
#[async_trait]
pub trait Prober: Send + Sync {
    /// Returns the measured latency in milliseconds.
    async fn probe(&self, target: &ResolvedService, timeout: Duration) -> Result<f64, ProbeError>;
}

/// Prober backed by the real network clients.
pub struct NetworkProber {
    pinger: Arc<dyn Pinger>,
}

impl NetworkProber {
    pub fn new(pinger: Arc<dyn Pinger>) -> Self {
        Self { pinger }
    }
}

#[async_trait]
impl Prober for NetworkProber {
    async fn probe(&self, target: &ResolvedService, timeout: Duration) -> Result<f64, ProbeError> {
        let service = &target.service;
        let ip = target
            .ip
            .ok_or_else(|| ProbeError::Config(format!("{} has no resolved address", service.host)))?;

        match service.kind {
            ServiceKind::Website => check_website(&service.host, ip, timeout).await,
            ServiceKind::Api => check_api(&service.host, ip, timeout).await,
            ServiceKind::Gateway => check_gateway(&service.host, ip, timeout).await,
            ServiceKind::Game => check_game(&service.host, ip, timeout).await,
            ServiceKind::RawHost => self.pinger.ping(ip, timeout).await,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::Service;
    use std::net::IpAddr;
    use std::sync::Mutex;

    #[derive(Default)]
    struct RecordingPinger {
        calls: Mutex<Vec<(IpAddr, Duration)>>,
    }

    #[async_trait]
    impl Pinger for RecordingPinger {
        async fn ping(&self, ip: IpAddr, timeout: Duration) -> Result<f64, ProbeError> {
            self.calls.lock().unwrap().push((ip, timeout));
            Ok(12.5)
        }
    }

    fn target(kind: ServiceKind, host: &str, ip: Option<IpAddr>) -> ResolvedService {
        ResolvedService {
            service: Service { id: 1, name: "svc".to_string(), kind, host: host.to_string(), ..Default::default() },
            ipv4: None,
            ipv6: None,
            ip,
            error: None,
        }
    }

    #[tokio::test]
    async fn test_raw_host_uses_pinger() {
        let pinger = Arc::new(RecordingPinger::default());
        let prober = NetworkProber::new(pinger.clone());
        let ip: IpAddr = "192.0.2.7".parse().unwrap();

        let latency = prober
            .probe(&target(ServiceKind::RawHost, "192.0.2.7", Some(ip)), Duration::from_secs(10))
            .await
            .unwrap();

        assert_eq!(latency, 12.5);
        assert_eq!(pinger.calls.lock().unwrap().as_slice(), &[(ip, Duration::from_secs(10))]);
    }

    #[tokio::test]
    async fn test_unresolved_target_is_rejected() {
        let prober = NetworkProber::new(Arc::new(RecordingPinger::default()));
        let result = prober
            .probe(&target(ServiceKind::Website, "https://example.com", None), Duration::from_secs(1))
            .await;
        assert!(matches!(result, Err(ProbeError::Config(_))));
    }

    #[test]
    fn test_error_messages() {
        assert_eq!(ProbeError::Status(503).to_string(), "status code (503) is not 200");
        assert_eq!(ProbeError::Payload("Invalid JSON".to_string()).to_string(), "Invalid JSON");
    }
}
