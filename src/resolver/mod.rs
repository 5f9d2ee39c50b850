//! Target resolver.
//!
//! Turns service rows into concrete endpoints: derives the bare host,
//! resolves it for the requested IP family and groups services sharing an
//! address. The result is published as an immutable snapshot that rounds
//! pick up by reference; a refresh swaps the whole snapshot.

use std::fmt;
use std::net::{IpAddr, SocketAddr};
use std::sync::{Arc, RwLock};
use std::time::Duration;

use async_trait::async_trait;
use reqwest::Url;
use thiserror::Error;
use tokio::sync::broadcast;

use crate::db::{DbError, Service, ServiceKind, Store};
use crate::probe::{lookup_srv, system_nameserver};

/// How often the service list is reloaded and re-resolved.
pub const RESOLVE_INTERVAL: Duration = Duration::from_secs(60);

const SRV_TIMEOUT: Duration = Duration::from_secs(5);

/// IP address family.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Family {
    V4,
    V6,
}

impl Family {
    fn of(ip: &IpAddr) -> Self {
        match ip {
            IpAddr::V4(_) => Family::V4,
            IpAddr::V6(_) => Family::V6,
        }
    }
}

impl fmt::Display for Family {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Family::V4 => f.write_str("IPv4"),
            Family::V6 => f.write_str("IPv6"),
        }
    }
}

/// Why a service has no usable address.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ResolveError {
    #[error("Invalid protocol {0}")]
    InvalidFamily(i64),
    #[error("{address} address provided for {requested} protocol")]
    FamilyMismatch { address: Family, requested: Family },
    #[error("lookup failed for {host}: {reason}")]
    Lookup { host: String, reason: String },
    #[error("no {family} address for {host}")]
    NoAddress { host: String, family: Family },
    #[error("{}", join_causes(.0))]
    Multiple(Vec<ResolveError>),
}

impl ResolveError {
    /// Individual causes; a single error is its own only cause.
    pub fn causes(&self) -> Vec<String> {
        match self {
            ResolveError::Multiple(errors) => errors.iter().map(|e| e.to_string()).collect(),
            other => vec![other.to_string()],
        }
    }
}

fn join_causes(errors: &[ResolveError]) -> String {
    errors.iter().map(|e| e.to_string()).collect::<Vec<_>>().join(" - ")
}

/// Name resolution used by the resolver.
#[async_trait]
pub trait Dns: Send + Sync {
    /// Resolve `host` to one address of `family`.
    async fn lookup(&self, host: &str, family: Family) -> Result<IpAddr, ResolveError>;

    /// Game server SRV target for `host`, if one is published.
    async fn resolve_service_location(&self, host: &str) -> Option<String>;
}

/// Resolver backed by the system resolver and a raw SRV query.
pub struct SystemDns {
    nameserver: SocketAddr,
}

impl SystemDns {
    pub fn new() -> Self {
        Self { nameserver: system_nameserver() }
    }
}

impl Default for SystemDns {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Dns for SystemDns {
    async fn lookup(&self, host: &str, family: Family) -> Result<IpAddr, ResolveError> {
        let addrs = tokio::net::lookup_host((host, 0)).await.map_err(|e| ResolveError::Lookup {
            host: host.to_string(),
            reason: e.to_string(),
        })?;

        addrs
            .map(|addr| addr.ip())
            .find(|ip| Family::of(ip) == family)
            .ok_or_else(|| ResolveError::NoAddress { host: host.to_string(), family })
    }

    async fn resolve_service_location(&self, host: &str) -> Option<String> {
        let name = format!("_minecraft._tcp.{}", host);
        match lookup_srv(&name, self.nameserver, SRV_TIMEOUT).await {
            Ok(record) => record.map(|r| r.target),
            Err(e) => {
                tracing::debug!("Resolver: SRV lookup for {} failed: {}", name, e);
                None
            }
        }
    }
}

/// A service with its resolution outcome.
#[derive(Debug, Clone, PartialEq)]
pub struct ResolvedService {
    pub service: Service,
    pub ipv4: Option<IpAddr>,
    pub ipv6: Option<IpAddr>,
    /// Address probes connect to.
    pub ip: Option<IpAddr>,
    pub error: Option<ResolveError>,
}

impl ResolvedService {
    fn failed(service: Service, error: ResolveError) -> Self {
        Self { service, ipv4: None, ipv6: None, ip: None, error: Some(error) }
    }
}

/// Services resolving to the same address.
#[derive(Debug, Clone, PartialEq)]
pub struct ServerGroup {
    pub ip: IpAddr,
    pub services: Vec<ResolvedService>,
}

/// One resolution pass: every service plus its server groups.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ResolvedTargets {
    pub services: Vec<ResolvedService>,
    pub groups: Vec<ServerGroup>,
}

impl ResolvedTargets {
    pub fn new(services: Vec<ResolvedService>) -> Self {
        let groups = build_groups(&services);
        Self { services, groups }
    }

    /// Raw hosts that the latency sampler tracks.
    pub fn smokeping_targets(&self) -> Vec<(i64, IpAddr)> {
        self.services
            .iter()
            .filter(|r| r.service.kind == ServiceKind::RawHost && !r.service.disabled)
            .filter_map(|r| r.ip.map(|ip| (r.service.id, ip)))
            .collect()
    }
}

/// The bare host a service resolves, without scheme, port or brackets.
pub fn derive_host(service: &Service) -> Result<String, ResolveError> {
    match service.kind {
        ServiceKind::RawHost => Ok(service.host.clone()),
        ServiceKind::Game => Ok(service.host.split(':').next().unwrap_or_default().to_string()),
        ServiceKind::Website | ServiceKind::Api | ServiceKind::Gateway => {
            let invalid = |reason: String| ResolveError::Lookup { host: service.host.clone(), reason };
            let url = Url::parse(&service.host).map_err(|e| invalid(e.to_string()))?;
            let host = url.host_str().ok_or_else(|| invalid("URL has no host".to_string()))?;
            Ok(host.trim_start_matches('[').trim_end_matches(']').to_string())
        }
    }
}

fn requested_family(protocol: i64) -> Result<Option<Family>, ResolveError> {
    match protocol {
        0 => Ok(None),
        4 => Ok(Some(Family::V4)),
        6 => Ok(Some(Family::V6)),
        other => Err(ResolveError::InvalidFamily(other)),
    }
}

/// Resolve one service. Failures end up in the `error` field.
pub async fn resolve_service(service: Service, dns: &dyn Dns) -> ResolvedService {
    let requested = match requested_family(service.protocol) {
        Ok(family) => family,
        Err(e) => return ResolvedService::failed(service, e),
    };
    let mut host = match derive_host(&service) {
        Ok(host) => host,
        Err(e) => return ResolvedService::failed(service, e),
    };

    if let Ok(ip) = host.parse::<IpAddr>() {
        let address = Family::of(&ip);
        if let Some(requested) = requested.filter(|r| *r != address) {
            return ResolvedService::failed(service, ResolveError::FamilyMismatch { address, requested });
        }
        let (ipv4, ipv6) = match address {
            Family::V4 => (Some(ip), None),
            Family::V6 => (None, Some(ip)),
        };
        return ResolvedService { service, ipv4, ipv6, ip: Some(ip), error: None };
    }

    if service.kind == ServiceKind::Game {
        if let Some(target) = dns.resolve_service_location(&host).await {
            host = target;
        }
    }

    let v6 = dns.lookup(&host, Family::V6).await;
    let v4 = dns.lookup(&host, Family::V4).await;
    let (ipv6, ipv4) = (v6.as_ref().ok().copied(), v4.as_ref().ok().copied());

    let chosen = match requested {
        Some(Family::V4) => v4,
        Some(Family::V6) => v6,
        None => match (v6, v4) {
            (Ok(ip), _) | (_, Ok(ip)) => Ok(ip),
            (Err(e6), Err(e4)) => Err(ResolveError::Multiple(vec![e6, e4])),
        },
    };

    match chosen {
        Ok(ip) => ResolvedService { service, ipv4, ipv6, ip: Some(ip), error: None },
        Err(e) => ResolvedService::failed(service, e),
    }
}

/// Resolve every service, keeping input order.
pub async fn resolve(services: Vec<Service>, dns: &dyn Dns) -> Vec<ResolvedService> {
    futures::future::join_all(services.into_iter().map(|s| resolve_service(s, dns))).await
}

/// Group resolved services by address in first-seen order.
pub fn build_groups(services: &[ResolvedService]) -> Vec<ServerGroup> {
    let mut groups: Vec<ServerGroup> = Vec::new();
    for resolved in services {
        let Some(ip) = resolved.ip else { continue };
        match groups.iter_mut().find(|g| g.ip == ip) {
            Some(group) => group.services.push(resolved.clone()),
            None => groups.push(ServerGroup { ip, services: vec![resolved.clone()] }),
        }
    }
    groups
}

/// Holder for the current snapshot.
#[derive(Default)]
pub struct Targets {
    current: RwLock<Arc<ResolvedTargets>>,
}

impl Targets {
    pub fn new() -> Self {
        Self::default()
    }

    /// The snapshot in effect right now.
    pub fn current(&self) -> Arc<ResolvedTargets> {
        self.current.read().unwrap_or_else(|e| e.into_inner()).clone()
    }

    pub fn replace(&self, targets: ResolvedTargets) {
        *self.current.write().unwrap_or_else(|e| e.into_inner()) = Arc::new(targets);
    }
}

/// Periodically reloads services from the store and re-resolves them.
pub struct ResolverManager {
    store: Arc<Store>,
    dns: Arc<dyn Dns>,
    targets: Arc<Targets>,
    checker_id: i64,
    stop: broadcast::Sender<()>,
}

impl ResolverManager {
    pub fn new(store: Arc<Store>, dns: Arc<dyn Dns>, targets: Arc<Targets>, checker_id: i64) -> Self {
        let (stop, _) = broadcast::channel(1);
        Self { store, dns, targets, checker_id, stop }
    }

    /// Reload and re-resolve once. On a store error the previous snapshot
    /// stays in place.
    pub async fn refresh(&self) -> Result<usize, DbError> {
        let services = self.store.get_checker_services(self.checker_id)?;
        let resolved = resolve(services, self.dns.as_ref()).await;

        for failed in resolved.iter().filter(|r| r.error.is_some()) {
            if let Some(e) = &failed.error {
                tracing::debug!("Resolver: {} unresolved: {}", failed.service.name, e);
            }
        }

        let count = resolved.len();
        self.targets.replace(ResolvedTargets::new(resolved));
        Ok(count)
    }

    /// Start the periodic refresh task. The first refresh happens one
    /// interval from now; call [`refresh`](Self::refresh) for an initial one.
    pub fn start(self: &Arc<Self>) {
        let manager = self.clone();
        let mut rx = self.stop.subscribe();

        tokio::spawn(async move {
            let start = tokio::time::Instant::now() + RESOLVE_INTERVAL;
            let mut interval = tokio::time::interval_at(start, RESOLVE_INTERVAL);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

            loop {
                tokio::select! {
                    _ = rx.recv() => break,
                    _ = interval.tick() => {
                        match manager.refresh().await {
                            Ok(count) => tracing::debug!("Resolver: resolved {} services", count),
                            Err(e) => tracing::error!("Resolver: Failed to load services: {}", e),
                        }
                    }
                }
            }
        });
    }

    /// Stop the refresh task.
    pub fn stop(&self) {
        let _ = self.stop.send(());
    }
}
