//! Engine configuration.

/// Tunables for the fulfillment engine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EngineConfig {
    /// "Expiring soon" horizon for the advisory expiry classification.
    pub expiring_soon_window_days: u32,
    /// How many times a mutating operation re-reads and re-validates after
    /// an optimistic concurrency conflict before giving up.
    pub max_conflict_retries: u32,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            expiring_soon_window_days: 30,
            max_conflict_retries: 4,
        }
    }
}

impl EngineConfig {
    /// Load configuration from the environment, falling back to defaults.
    ///
    /// Recognized variables: `MEDSUPPLY_EXPIRY_WINDOW_DAYS`,
    /// `MEDSUPPLY_MAX_CONFLICT_RETRIES`. Unparseable values fall back to the
    /// default rather than failing startup.
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            expiring_soon_window_days: env_u32("MEDSUPPLY_EXPIRY_WINDOW_DAYS")
                .unwrap_or(defaults.expiring_soon_window_days),
            max_conflict_retries: env_u32("MEDSUPPLY_MAX_CONFLICT_RETRIES")
                .unwrap_or(defaults.max_conflict_retries),
        }
    }
}

fn env_u32(key: &str) -> Option<u32> {
    match std::env::var(key) {
        Ok(raw) => match raw.trim().parse() {
            Ok(value) => Some(value),
            Err(_) => {
                tracing::warn!(key, raw, "unparseable config value, using default");
                None
            }
        },
        Err(_) => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_documented_values() {
        let config = EngineConfig::default();
        assert_eq!(config.expiring_soon_window_days, 30);
        assert!(config.max_conflict_retries >= 1);
    }
}
