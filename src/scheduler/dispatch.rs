//! Probe dispatch for one round.
//!
//! Groups probe in parallel. Inside a group at most [`GROUP_CONCURRENCY`]
//! probes are in flight and member `i` starts no earlier than
//! `i * STAGGER`.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use futures::future::join_all;
use tokio::sync::Semaphore;

use crate::probe::{ProbeError, Prober};
use crate::resolver::{ResolveError, ResolvedService, ResolvedTargets, ServerGroup};

/// Upper bound for one protocol check.
pub const PROBE_TIMEOUT: Duration = Duration::from_secs(10);
/// Simultaneous probes against one address.
pub const GROUP_CONCURRENCY: usize = 5;
/// Start offset between consecutive members of a group.
pub const STAGGER: Duration = Duration::from_millis(100);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureKind {
    Resolution,
    Timeout,
    Probe,
}

/// Why a check failed, kept structured until it is rendered into an alert.
#[derive(Debug, Clone, PartialEq)]
pub struct CheckFailure {
    pub kind: FailureKind,
    pub message: String,
    pub causes: Vec<String>,
}

impl CheckFailure {
    pub fn resolution(error: &ResolveError) -> Self {
        let causes = match error {
            ResolveError::Multiple(_) => error.causes(),
            _ => Vec::new(),
        };
        Self { kind: FailureKind::Resolution, message: error.to_string(), causes }
    }

    pub fn probe(error: &ProbeError) -> Self {
        let kind = match error {
            ProbeError::Timeout(_) => FailureKind::Timeout,
            _ => FailureKind::Probe,
        };
        Self { kind, message: error.to_string(), causes: Vec::new() }
    }

    /// Text shown to humans: the causes joined, or the message.
    pub fn render(&self) -> String {
        if self.causes.is_empty() {
            self.message.clone()
        } else {
            self.causes.join(" - ")
        }
    }
}

/// Outcome of checking one service.
#[derive(Debug, Clone, PartialEq)]
pub struct CheckResult {
    pub service_id: i64,
    pub online: bool,
    pub response_time: Option<f64>,
    pub error: Option<CheckFailure>,
}

impl CheckResult {
    fn offline(service_id: i64, error: CheckFailure) -> Self {
        Self { service_id, online: false, response_time: None, error: Some(error) }
    }
}

/// Round latencies to 0.1 ms.
pub fn round_ms(ms: f64) -> f64 {
    (ms * 10.0).round() / 10.0
}

/// Runs the probes of a round.
pub struct Dispatcher {
    prober: Arc<dyn Prober>,
    timeout: Duration,
    concurrency: usize,
    stagger: Duration,
}

impl Dispatcher {
    pub fn new(prober: Arc<dyn Prober>) -> Self {
        Self::with_limits(prober, PROBE_TIMEOUT, GROUP_CONCURRENCY, STAGGER)
    }

    pub fn with_limits(prober: Arc<dyn Prober>, timeout: Duration, concurrency: usize, stagger: Duration) -> Self {
        Self { prober, timeout, concurrency: concurrency.max(1), stagger }
    }

    /// Check every service of the snapshot. Returns exactly one result per
    /// service, in snapshot order.
    pub async fn run_round(&self, targets: &ResolvedTargets) -> Vec<CheckResult> {
        let mut by_id: HashMap<i64, CheckResult> = join_all(targets.groups.iter().map(|g| self.run_group(g)))
            .await
            .into_iter()
            .flatten()
            .map(|r| (r.service_id, r))
            .collect();

        targets
            .services
            .iter()
            .map(|resolved| {
                by_id
                    .remove(&resolved.service.id)
                    .unwrap_or_else(|| unresolved_result(resolved))
            })
            .collect()
    }

    async fn run_group(&self, group: &ServerGroup) -> Vec<CheckResult> {
        let limit = Semaphore::new(self.concurrency);
        let limit = &limit;

        join_all(group.services.iter().enumerate().map(|(i, target)| async move {
            tokio::time::sleep(self.stagger * i as u32).await;
            let _permit = limit.acquire().await.ok();
            self.check(target).await
        }))
        .await
    }

    async fn check(&self, target: &ResolvedService) -> CheckResult {
        let service_id = target.service.id;
        let outcome = tokio::time::timeout(self.timeout, self.prober.probe(target, self.timeout))
            .await
            .unwrap_or(Err(ProbeError::Timeout(self.timeout)));

        match outcome {
            Ok(ms) => CheckResult { service_id, online: true, response_time: Some(round_ms(ms)), error: None },
            Err(e) => {
                tracing::debug!("Scheduler: {} failed: {}", target.service.name, e);
                CheckResult::offline(service_id, CheckFailure::probe(&e))
            }
        }
    }
}

fn unresolved_result(resolved: &ResolvedService) -> CheckResult {
    let failure = match &resolved.error {
        Some(e) => CheckFailure::resolution(e),
        None => CheckFailure {
            kind: FailureKind::Resolution,
            message: "no resolved address".to_string(),
            causes: Vec::new(),
        },
    };
    CheckResult::offline(resolved.service.id, failure)
}
