//! Process-wide evaluation settings.

use serde::{Deserialize, Serialize};

/// Which language dialect is being evaluated.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Dialect {
    #[default]
    Plain,
    RealTime,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub dialect: Dialect,
    /// Rewrite fatal errors into `exit mk_(code, message)` so that
    /// trap/tixe can intercept them.
    pub exceptions: bool,
    pub pre_checks: bool,
    /// Check class invariants after every operation on an object.
    pub inv_checks: bool,
    pub log_instance_changes: bool,
    /// Virtual time (nanoseconds) after which periodic threads stop. Without
    /// one, starting a periodic or sporadic thread is an error.
    pub time_limit: Option<u64>,
    /// Clock rate of the default virtual CPU.
    pub default_cpu_hz: u64,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            dialect: Dialect::Plain,
            exceptions: false,
            pre_checks: true,
            inv_checks: true,
            log_instance_changes: false,
            time_limit: None,
            default_cpu_hz: 1_000_000_000,
        }
    }
}

impl Settings {
    pub fn real_time() -> Self {
        Self {
            dialect: Dialect::RealTime,
            ..Self::default()
        }
    }

    pub fn from_json(json: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(json)
    }

    pub fn is_real_time(&self) -> bool {
        self.dialect == Dialect::RealTime
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_partial_json_uses_defaults() {
        let s = Settings::from_json(r#"{ "dialect": "real_time", "exceptions": true }"#).unwrap();
        assert!(s.is_real_time());
        assert!(s.exceptions);
        assert!(s.pre_checks);
        assert!(s.inv_checks);
        assert_eq!(s.default_cpu_hz, 1_000_000_000);
    }

    #[test]
    fn test_empty_json() {
        assert_eq!(Settings::from_json("{}").unwrap(), Settings::default());
    }

    #[test]
    fn test_unknown_dialect_rejected() {
        assert!(Settings::from_json(r#"{ "dialect": "quantum" }"#).is_err());
    }
}
