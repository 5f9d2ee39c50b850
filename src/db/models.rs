//! Database model types.

/// Protocol a service is checked with.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ServiceKind {
    Website,
    Api,
    Gateway,
    Game,
    RawHost,
}

impl ServiceKind {
    /// Parse the `type` column. Unknown types yield `None`.
    pub fn from_db(value: &str) -> Option<Self> {
        match value {
            "website" => Some(Self::Website),
            "api" => Some(Self::Api),
            "gateway" => Some(Self::Gateway),
            "minecraft" => Some(Self::Game),
            "server" => Some(Self::RawHost),
            _ => None,
        }
    }

    pub fn as_db(&self) -> &'static str {
        match self {
            Self::Website => "website",
            Self::Api => "api",
            Self::Gateway => "gateway",
            Self::Game => "minecraft",
            Self::RawHost => "server",
        }
    }
}

/// A monitored service.
#[derive(Debug, Clone, PartialEq)]
pub struct Service {
    pub id: i64,
    pub name: String,
    pub kind: ServiceKind,
    pub host: String,
    /// IP family preference: 0 (any), 4 or 6.
    pub protocol: i64,
    /// Disabled services keep their event log but record no samples.
    pub disabled: bool,
    /// Offline/online alerts for this service mention everyone.
    pub alert: bool,
}

impl Default for Service {
    fn default() -> Self {
        Self {
            id: 0,
            name: String::new(),
            kind: ServiceKind::Website,
            host: String::new(),
            protocol: 0,
            disabled: false,
            alert: false,
        }
    }
}

/// The probing agent this process runs as.
#[derive(Debug, Clone, PartialEq)]
pub struct Checker {
    pub id: i64,
    pub name: String,
    pub location: String,
    /// Second of each minute at which the probing round fires.
    pub check_second: u32,
}

/// An online/offline transition.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct StatusEvent {
    pub service_id: i64,
    pub checker_id: i64,
    pub minute: i64,
    pub online: bool,
}

/// One per-minute observation of an enabled service.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct StatusSample {
    pub service_id: i64,
    pub checker_id: i64,
    pub minute: i64,
    pub online: bool,
    /// Milliseconds, only present when online and measured.
    pub response_time: Option<f64>,
}

/// Daily summary of status samples.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DailyStatus {
    pub service_id: i64,
    pub checker_id: i64,
    pub day: i64,
    pub statuses_amount: i64,
    /// Percentage of online samples.
    pub uptime: f64,
    pub response_time: Option<f64>,
}

/// Latency/loss summary for one time window at one resolution tier.
///
/// `start_time` and `duration` are expressed in 10-second units.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SmokepingBucket {
    pub service_id: i64,
    pub checker_id: i64,
    pub start_time: i64,
    pub duration: i64,
    pub sent: i64,
    pub lost: Option<i64>,
    pub downs: Option<i64>,
    pub med_response_time: Option<f64>,
    pub min_response_time: Option<f64>,
    pub max_response_time: Option<f64>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_service_kind_db_names() {
        for kind in [
            ServiceKind::Website,
            ServiceKind::Api,
            ServiceKind::Gateway,
            ServiceKind::Game,
            ServiceKind::RawHost,
        ] {
            assert_eq!(ServiceKind::from_db(kind.as_db()), Some(kind));
        }
        assert_eq!(ServiceKind::from_db("bot"), None);
    }
}
