//! Configuration module for uptrail.
//!
//! Loads configuration from environment variables with sensible defaults.

use std::env;

/// Checker configuration loaded from environment variables.
#[derive(Debug, Clone, PartialEq)]
pub struct CheckerConfig {
    /// Identity of this checker in the `checkers` table (default: 1)
    pub checker_id: i64,
    /// Path to the primary SQLite database (default: "uptrail.db")
    pub db_path: String,
    /// Path to the local overflow buffer (default: "uptrail-buffer.db")
    pub buffer_path: String,
    /// Webhook receiving alerts; alerts are only logged when unset
    pub alert_webhook_url: Option<String>,
}

impl Default for CheckerConfig {
    fn default() -> Self {
        Self {
            checker_id: 1,
            db_path: "uptrail.db".to_string(),
            buffer_path: "uptrail-buffer.db".to_string(),
            alert_webhook_url: None,
        }
    }
}

impl CheckerConfig {
    /// Load configuration from environment variables.
    ///
    /// Environment variables:
    /// - `UPTRAIL_CHECKER_ID`: checker identity (default: 1)
    /// - `UPTRAIL_DB_PATH`: primary database path (default: "uptrail.db")
    /// - `UPTRAIL_BUFFER_PATH`: overflow buffer path (default: "uptrail-buffer.db")
    /// - `UPTRAIL_ALERT_WEBHOOK_URL`: alert webhook (default: none)
    pub fn load() -> Self {
        Self::from_lookup(|key| env::var(key).ok())
    }

    fn from_lookup<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut cfg = Self::default();

        if let Some(id_str) = lookup("UPTRAIL_CHECKER_ID") {
            if let Ok(id) = id_str.trim().parse() {
                cfg.checker_id = id;
            }
        }

        if let Some(db_path) = lookup("UPTRAIL_DB_PATH") {
            cfg.db_path = db_path;
        }

        if let Some(buffer_path) = lookup("UPTRAIL_BUFFER_PATH") {
            cfg.buffer_path = buffer_path;
        }

        cfg.alert_webhook_url = lookup("UPTRAIL_ALERT_WEBHOOK_URL").filter(|url| !url.trim().is_empty());

        cfg
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn test_default_config() {
        let cfg = CheckerConfig::default();
        assert_eq!(cfg.checker_id, 1);
        assert_eq!(cfg.db_path, "uptrail.db");
        assert_eq!(cfg.buffer_path, "uptrail-buffer.db");
        assert!(cfg.alert_webhook_url.is_none());
    }

    #[test]
    fn test_env_overrides() {
        let vars: HashMap<&str, &str> = HashMap::from([
            ("UPTRAIL_CHECKER_ID", "7"),
            ("UPTRAIL_DB_PATH", "/var/lib/uptrail/main.db"),
            ("UPTRAIL_ALERT_WEBHOOK_URL", "https://hooks.example.com/abc"),
        ]);
        let cfg = CheckerConfig::from_lookup(|key| vars.get(key).map(|v| v.to_string()));

        assert_eq!(cfg.checker_id, 7);
        assert_eq!(cfg.db_path, "/var/lib/uptrail/main.db");
        assert_eq!(cfg.buffer_path, "uptrail-buffer.db");
        assert_eq!(cfg.alert_webhook_url.as_deref(), Some("https://hooks.example.com/abc"));
    }

    #[test]
    fn test_invalid_values_fall_back() {
        let cfg = CheckerConfig::from_lookup(|key| match key {
            "UPTRAIL_CHECKER_ID" => Some("not-a-number".to_string()),
            "UPTRAIL_ALERT_WEBHOOK_URL" => Some("  ".to_string()),
            _ => None,
        });
        assert_eq!(cfg.checker_id, 1);
        assert!(cfg.alert_webhook_url.is_none());
    }
}
