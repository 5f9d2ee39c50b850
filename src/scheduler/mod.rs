//! Scheduler module for the minute-aligned probing round.

mod cleanup;
mod dispatch;
mod rollup;
mod status;

pub use cleanup::*;
pub use dispatch::*;
pub use rollup::*;
pub use status::apply;

use crate::alert::{build_notifications, AlertTransport, Notifier, RoundOutcome};
use crate::db::{Checker, Store};
use crate::probe::Prober;
use crate::resolver::Targets;

use chrono::{DateTime, Timelike, Utc};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::broadcast;

/// How often the wall clock is compared with the trigger second.
pub const TRIGGER_TICK: Duration = Duration::from_millis(500);

/// Reject a checker whose trigger second can never be reached.
pub fn validate_checker(checker: &Checker) -> Result<(), String> {
    if checker.check_second >= 60 {
        return Err(format!(
            "check second {} of checker {} must be below 60",
            checker.check_second, checker.id
        ));
    }
    Ok(())
}

/// Fires at most once per minute, on the first tick at or after the
/// checker's trigger second.
#[derive(Debug)]
pub struct MinuteTrigger {
    check_second: u32,
    last_minute: Option<i64>,
}

impl MinuteTrigger {
    pub fn new(check_second: u32) -> Self {
        Self { check_second, last_minute: None }
    }

    pub fn should_fire(&mut self, now: DateTime<Utc>) -> bool {
        let minute = now.timestamp().div_euclid(60);
        if now.second() < self.check_second || self.last_minute == Some(minute) {
            return false;
        }
        self.last_minute = Some(minute);
        true
    }
}

/// The main scheduler that runs one probing round per minute.
pub struct Scheduler {
    store: Arc<Store>,
    checker: Checker,
    targets: Arc<Targets>,
    dispatcher: Dispatcher,
    notifier: Notifier,
    cleanup: CleanupManager,
    stop: broadcast::Sender<()>,
}

impl Scheduler {
    pub fn new(
        store: Arc<Store>,
        checker: Checker,
        targets: Arc<Targets>,
        prober: Arc<dyn Prober>,
        transport: Arc<dyn AlertTransport>,
    ) -> Self {
        let (stop, _) = broadcast::channel(1);
        Self {
            cleanup: CleanupManager::new(store.clone()),
            dispatcher: Dispatcher::new(prober),
            notifier: Notifier::new(transport),
            store,
            checker,
            targets,
            stop,
        }
    }

    /// Start the minute trigger and the cleanup manager.
    pub fn start(self: &Arc<Self>) {
        tracing::info!(
            "Scheduler: Checking services at second {} of every minute as {} {}",
            self.checker.check_second,
            self.checker.name,
            self.checker.location
        );

        self.cleanup.start();

        let scheduler = self.clone();
        let mut rx = self.stop.subscribe();

        tokio::spawn(async move {
            let mut trigger = MinuteTrigger::new(scheduler.checker.check_second);
            let mut interval = tokio::time::interval(TRIGGER_TICK);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

            loop {
                tokio::select! {
                    _ = rx.recv() => break,
                    _ = interval.tick() => {
                        let now = Utc::now();
                        if trigger.should_fire(now) {
                            let scheduler = scheduler.clone();
                            tokio::spawn(async move {
                                scheduler.run_round(now).await;
                            });
                        }
                    }
                }
            }
        });
    }

    /// Stop triggering rounds. A round in flight runs to completion.
    pub fn stop(&self) {
        let _ = self.stop.send(());
        self.cleanup.stop();
    }

    /// Run one probing round for the minute containing `now`.
    pub async fn run_round(&self, now: DateTime<Utc>) -> RoundOutcome {
        let started = Instant::now();
        let minute = now.timestamp().div_euclid(60);
        let targets = self.targets.current();

        tracing::debug!("Scheduler: Checking {} services", targets.services.len());

        let results = self.dispatcher.run_round(&targets).await;
        let mut outcome = RoundOutcome::default();

        for (resolved, result) in targets.services.iter().zip(&results) {
            let service = &resolved.service;

            let was_online = match apply(&self.store, self.checker.id, service, result, minute) {
                Ok(was_online) => was_online,
                Err(e) => {
                    tracing::error!("Scheduler: Skipping {} this round, cannot read last event: {}", service.name, e);
                    continue;
                }
            };

            if result.online && !was_online {
                outcome.online.push(service.clone());
            } else if !result.online {
                if was_online {
                    let error = result.error.as_ref().map(|e| e.render()).unwrap_or_default();
                    outcome.offline.push((service.clone(), error));
                }
                if !service.disabled {
                    outcome.still_down.push(service.clone());
                }
            }

            if let Err(e) = rollup_if_due(&self.store, self.checker.id, service, now) {
                tracing::error!("Scheduler: Daily rollup failed for {}: {}", service.name, e);
            }
        }

        let took = started.elapsed();
        tracing::info!("Scheduler: Services statuses checked in {:.1}s", took.as_secs_f64());

        let notifications = build_notifications(&self.checker, &outcome, took, minute);
        self.notifier.send(&notifications).await;

        outcome
    }
}
