use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// The two classes of inference backend the fleet routes between.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendId {
    /// Low-latency, single-request backend for small models.
    Fast,
    /// Higher-capacity backend able to serve larger models.
    Batch,
}

impl BackendId {
    /// All backends, in their default fallback order.
    pub const ALL: [BackendId; 2] = [BackendId::Fast, BackendId::Batch];

    /// Stable lowercase name used in config and logs.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Fast => "fast",
            Self::Batch => "batch",
        }
    }
}

impl fmt::Display for BackendId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for BackendId {
    type Err = crate::FleetError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "fast" => Ok(Self::Fast),
            "batch" => Ok(Self::Batch),
            other => Err(crate::FleetError::Config(format!(
                "unknown backend '{other}' (expected 'fast' or 'batch')"
            ))),
        }
    }
}

/// Request priority inside an admission queue. Lower value wins.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default, Serialize, Deserialize,
)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    /// Interactive requests (chat).
    High = 1,
    /// Task execution and decomposition.
    #[default]
    Medium = 2,
    /// Background work.
    Low = 3,
}

impl Priority {
    /// Numeric rank, 1 is served first.
    pub fn rank(self) -> u8 {
        self as u8
    }

    /// Maps a numeric rank back to a priority, clamping out-of-range values.
    pub fn from_rank(rank: u8) -> Self {
        match rank {
            0 | 1 => Self::High,
            2 => Self::Medium,
            _ => Self::Low,
        }
    }
}

impl fmt::Display for Priority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::High => write!(f, "high"),
            Self::Medium => write!(f, "medium"),
            Self::Low => write!(f, "low"),
        }
    }
}

/// Circuit breaker state for one backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    /// Calls pass through.
    Closed,
    /// Calls fail immediately until the cooldown elapses.
    Open,
    /// A single probe call is allowed.
    HalfOpen,
}

impl fmt::Display for CircuitState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Closed => write!(f, "closed"),
            Self::Open => write!(f, "open"),
            Self::HalfOpen => write!(f, "half_open"),
        }
    }
}

/// A model served by one backend, as last seen by the model registry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelDescriptor {
    /// Backend serving the model.
    pub backend: BackendId,
    /// Model name as reported by the backend.
    pub name: String,
    /// Categories whose preference list names this model.
    pub categories: Vec<String>,
    /// Whether the model was listed by the last successful scan.
    pub available: bool,
    /// Approximate resource cost (billions of parameters when known).
    pub cost: f64,
}

impl ModelDescriptor {
    /// Whether the model is listed under `category`.
    pub fn serves(&self, category: &str) -> bool {
        self.categories.iter().any(|c| c == category)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn test_priority_ordering() {
        assert!(Priority::High < Priority::Medium);
        assert!(Priority::Medium < Priority::Low);
        assert_eq!(Priority::from_rank(1), Priority::High);
        assert_eq!(Priority::from_rank(9), Priority::Low);
        assert_eq!(Priority::Low.rank(), 3);
    }

    #[test]
    fn test_backend_parse() {
        assert_eq!("Fast".parse::<BackendId>().unwrap(), BackendId::Fast);
        assert_eq!(" batch ".parse::<BackendId>().unwrap(), BackendId::Batch);
        assert!("gpu".parse::<BackendId>().is_err());
    }

    #[test]
    fn test_serde_names() {
        let json = serde_json::to_string(&CircuitState::HalfOpen).unwrap();
        assert_eq!(json, "\"half_open\"");
        let json = serde_json::to_string(&BackendId::Batch).unwrap();
        assert_eq!(json, "\"batch\"");
    }
}
