//! Alert notifier.
//!
//! Builds the offline/online notifications of a round and hands them to an
//! [`AlertTransport`]. A notification is one content message followed by one
//! message per embed; long descriptions are split on line boundaries.

mod webhook;

pub use webhook::*;

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::db::{Checker, Service};

/// Maximum characters in one embed description.
pub const DESCRIPTION_LIMIT: usize = 4096;

const COLOR_OFFLINE: u32 = 0xff0000;
const COLOR_ONLINE: u32 = 0x00ff00;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct EmbedFooter {
    pub text: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Embed {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    pub description: String,
    pub color: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub footer: Option<EmbedFooter>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<DateTime<Utc>>,
}

/// One webhook payload.
#[derive(Debug, Clone, PartialEq, Default, Serialize)]
pub struct AlertMessage {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub content: Option<String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub embeds: Vec<Embed>,
}

impl AlertMessage {
    pub fn content(text: impl Into<String>) -> Self {
        Self { content: Some(text.into()), embeds: Vec::new() }
    }

    pub fn embed(embed: Embed) -> Self {
        Self { content: None, embeds: vec![embed] }
    }
}

/// State changes observed in one round.
#[derive(Debug, Clone, Default)]
pub struct RoundOutcome {
    /// Services that went offline, with the rendered failure.
    pub offline: Vec<(Service, String)>,
    pub online: Vec<Service>,
    /// Enabled services observed offline this round.
    pub still_down: Vec<Service>,
}

/// First `limit` characters of `line`.
fn truncate_chars(line: &str, limit: usize) -> &str {
    match line.char_indices().nth(limit) {
        Some((end, _)) => &line[..end],
        None => line,
    }
}

/// Split a description into chunks of at most `limit` characters, never
/// breaking a line. A line longer than `limit` is truncated.
pub fn split_description(description: &str, limit: usize) -> Vec<String> {
    let mut chunks = Vec::new();
    let mut current: Option<(String, usize)> = None;

    for line in description.split('\n') {
        let line = truncate_chars(line, limit);
        let len = line.chars().count();

        current = match current.take() {
            Some((mut text, used)) if used + 1 + len <= limit => {
                text.push('\n');
                text.push_str(line);
                Some((text, used + 1 + len))
            }
            Some((text, _)) => {
                chunks.push(text);
                Some((line.to_string(), len))
            }
            None => Some((line.to_string(), len)),
        };
    }

    chunks.extend(current.map(|(text, _)| text));
    chunks
}

/// Build the embeds of one notification: title on the first, footer and
/// timestamp on the last.
pub fn split_embed(
    title: String,
    description: &str,
    footer: String,
    timestamp: DateTime<Utc>,
    color: u32,
) -> Vec<Embed> {
    let chunks = split_description(description, DESCRIPTION_LIMIT);
    let last = chunks.len().saturating_sub(1);

    chunks
        .into_iter()
        .enumerate()
        .map(|(i, description)| Embed {
            title: (i == 0).then(|| title.clone()),
            description,
            color,
            footer: (i == last).then(|| EmbedFooter { text: footer.clone() }),
            timestamp: (i == last).then_some(timestamp),
        })
        .collect()
}

fn headline(services: &[&Service], state: &str, checker: &Checker) -> String {
    let everyone = if services.iter().any(|s| s.alert) { "@everyone " } else { "" };
    let plural = if services.len() > 1 { "s" } else { "" };
    format!(
        "{}**{} Service{} {}** for {} {}",
        everyone,
        services.len(),
        plural,
        state,
        checker.name,
        checker.location
    )
}

fn notification(content: String, embeds: Vec<Embed>) -> Vec<AlertMessage> {
    std::iter::once(AlertMessage::content(content))
        .chain(embeds.into_iter().map(AlertMessage::embed))
        .collect()
}

/// Turn a round outcome into notifications, offline first.
pub fn build_notifications(checker: &Checker, outcome: &RoundOutcome, took: Duration, minute: i64) -> Vec<Vec<AlertMessage>> {
    let footer = format!("Services checked in {:.1}s", took.as_secs_f64());
    let timestamp = DateTime::from_timestamp(minute * 60, 0).unwrap_or_default();
    let mut notifications = Vec::new();

    if !outcome.offline.is_empty() {
        let services: Vec<&Service> = outcome.offline.iter().map(|(s, _)| s).collect();
        let description = outcome
            .offline
            .iter()
            .map(|(s, error)| format!(":warning: **Service **`{}`** is offline.**\n{}", s.name, error))
            .collect::<Vec<_>>()
            .join("\n");
        let embeds = split_embed(
            format!("Services offline for {} {}", checker.name, checker.location),
            &description,
            footer.clone(),
            timestamp,
            COLOR_OFFLINE,
        );
        notifications.push(notification(headline(&services, "offline", checker), embeds));
    }

    if !outcome.online.is_empty() {
        let services: Vec<&Service> = outcome.online.iter().collect();
        let mut lines: Vec<String> = services
            .iter()
            .map(|s| format!(":warning: **Service **`{}`** is back online.**", s.name))
            .collect();
        if !outcome.still_down.is_empty() {
            let names: Vec<String> = outcome.still_down.iter().map(|s| format!("**`{}`**", s.name)).collect();
            lines.push(format!("**Services still offline: {}.**", names.join(", ")));
        }
        let embeds = split_embed(
            format!("Services online for {} {}", checker.name, checker.location),
            &lines.join("\n"),
            footer,
            timestamp,
            COLOR_ONLINE,
        );
        notifications.push(notification(headline(&services, "online", checker), embeds));
    }

    notifications
}

/// Best-effort delivery of notifications.
pub struct Notifier {
    transport: Arc<dyn AlertTransport>,
}

impl Notifier {
    pub fn new(transport: Arc<dyn AlertTransport>) -> Self {
        Self { transport }
    }

    /// Deliver each notification in order. A failure is logged and ends that
    /// notification; nothing is retried.
    pub async fn send(&self, notifications: &[Vec<AlertMessage>]) {
        for messages in notifications {
            for message in messages {
                if let Err(e) = self.transport.deliver(message).await {
                    tracing::error!("Alert: Cannot send alert: {}", e);
                    break;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::sync::Mutex;

    fn checker() -> Checker {
        Checker { id: 1, name: "Checker".to_string(), location: "Paris".to_string(), check_second: 0 }
    }

    fn service(name: &str, alert: bool) -> Service {
        Service { name: name.to_string(), alert, ..Default::default() }
    }

    #[test]
    fn test_split_description_respects_limit() {
        let lines: Vec<String> = (0..10).map(|i| format!("line {:02} {}", i, "x".repeat(12))).collect();
        let description = lines.join("\n");

        let chunks = split_description(&description, 50);

        assert!(chunks.len() > 1);
        assert!(chunks.iter().all(|c| c.chars().count() <= 50));
        // No line was cut in two.
        let rejoined: Vec<&str> = chunks.iter().flat_map(|c| c.split('\n')).collect();
        assert_eq!(rejoined, lines.iter().map(String::as_str).collect::<Vec<_>>());
    }

    #[test]
    fn test_split_description_truncates_overlong_line() {
        let chunks = split_description(&format!("short\n{}\ntail", "é".repeat(30)), 10);
        assert_eq!(chunks, vec!["short".to_string(), "é".repeat(10), "tail".to_string()]);
    }

    #[test]
    fn test_split_embed_title_and_footer_placement() {
        let description = vec!["a".repeat(3000), "b".repeat(3000), "c".repeat(3000)].join("\n");
        let embeds = split_embed("T".to_string(), &description, "F".to_string(), Utc::now(), COLOR_ONLINE);

        assert_eq!(embeds.len(), 3);
        assert_eq!(embeds[0].title.as_deref(), Some("T"));
        assert!(embeds[1..].iter().all(|e| e.title.is_none()));
        assert!(embeds[..2].iter().all(|e| e.footer.is_none() && e.timestamp.is_none()));
        assert!(embeds[2].footer.is_some() && embeds[2].timestamp.is_some());
    }

    #[test]
    fn test_offline_notification() {
        let outcome = RoundOutcome {
            offline: vec![
                (service("web", false), "status code (503) is not 200".to_string()),
                (service("db", true), "probe timed out after 10s".to_string()),
            ],
            ..Default::default()
        };

        let notifications = build_notifications(&checker(), &outcome, Duration::from_millis(2340), 60);
        assert_eq!(notifications.len(), 1);

        let messages = &notifications[0];
        assert_eq!(
            messages[0].content.as_deref(),
            Some("@everyone **2 Services offline** for Checker Paris")
        );
        let embed = &messages[1].embeds[0];
        assert_eq!(embed.title.as_deref(), Some("Services offline for Checker Paris"));
        assert!(embed.description.starts_with(":warning: **Service **`web`** is offline.**\nstatus code (503)"));
        assert_eq!(embed.footer.as_ref().unwrap().text, "Services checked in 2.3s");
        assert_eq!(embed.timestamp.unwrap().timestamp(), 3600);
    }

    #[test]
    fn test_online_notification_lists_still_down() {
        let outcome = RoundOutcome {
            online: vec![service("web", false)],
            still_down: vec![service("db", false), service("mc", false)],
            ..Default::default()
        };

        let notifications = build_notifications(&checker(), &outcome, Duration::from_secs(1), 0);
        let messages = &notifications[0];

        assert_eq!(messages[0].content.as_deref(), Some("**1 Service online** for Checker Paris"));
        assert_eq!(
            messages[1].embeds[0].description,
            ":warning: **Service **`web`** is back online.**\n**Services still offline: **`db`**, **`mc`**.**"
        );
    }

    #[test]
    fn test_message_json_shape() {
        let json = serde_json::to_value(AlertMessage::content("hi")).unwrap();
        assert_eq!(json, serde_json::json!({"content": "hi"}));
    }

    struct FlakyTransport {
        delivered: Mutex<Vec<AlertMessage>>,
        fail_on: usize,
    }

    #[async_trait]
    impl AlertTransport for FlakyTransport {
        async fn deliver(&self, message: &AlertMessage) -> Result<(), AlertError> {
            let mut delivered = self.delivered.lock().unwrap();
            if delivered.len() == self.fail_on {
                delivered.push(AlertMessage::default());
                return Err(AlertError::Status(500));
            }
            delivered.push(message.clone());
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_failed_delivery_ends_notification() {
        let transport = Arc::new(FlakyTransport { delivered: Mutex::new(Vec::new()), fail_on: 0 });
        let notifier = Notifier::new(transport.clone());

        let first = vec![AlertMessage::content("a"), AlertMessage::content("b")];
        let second = vec![AlertMessage::content("c")];
        notifier.send(&[first, second]).await;

        let delivered = transport.delivered.lock().unwrap();
        // "a" failed, "b" was skipped, "c" went through.
        assert_eq!(delivered.len(), 2);
        assert_eq!(delivered[1].content.as_deref(), Some("c"));
    }
}
