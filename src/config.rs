//! Policy store configuration

use crate::error::{Result, TransitError};

/// Default number of trailing key versions kept in the primary policy record
pub const DEFAULT_RESIDENT_VERSIONS: u32 = 16;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoreConfig {
    /// Keep loaded policies in memory between operations
    pub cache_enabled: bool,
    /// Trailing window of key versions kept resident; older ones live only
    /// in the archive
    pub resident_versions: u32,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            cache_enabled: true,
            resident_versions: DEFAULT_RESIDENT_VERSIONS,
        }
    }
}

impl StoreConfig {
    /// Load from `TRANSIT_CACHE_DISABLED` and `TRANSIT_RESIDENT_VERSIONS`,
    /// falling back to defaults for unset variables
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let mut config = Self::default();

        if let Some(raw) = lookup("TRANSIT_CACHE_DISABLED") {
            config.cache_enabled = match raw.trim().to_ascii_lowercase().as_str() {
                "1" | "true" | "yes" => false,
                "0" | "false" | "no" | "" => true,
                other => {
                    return Err(TransitError::Config(format!(
                        "TRANSIT_CACHE_DISABLED must be a boolean, got '{}'",
                        other
                    )))
                }
            };
        }

        if let Some(raw) = lookup("TRANSIT_RESIDENT_VERSIONS") {
            config.resident_versions = raw.trim().parse().map_err(|e| {
                TransitError::Config(format!("invalid TRANSIT_RESIDENT_VERSIONS: {}", e))
            })?;
        }

        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.resident_versions == 0 {
            return Err(TransitError::Config(
                "resident_versions must be at least 1".into(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |name| map.get(name).cloned()
    }

    #[test]
    fn test_defaults_when_unset() {
        assert_eq!(StoreConfig::from_lookup(lookup(&[])).unwrap(), StoreConfig::default());
    }

    #[test]
    fn test_reads_variables() {
        let config = StoreConfig::from_lookup(lookup(&[
            ("TRANSIT_CACHE_DISABLED", "true"),
            ("TRANSIT_RESIDENT_VERSIONS", "4"),
        ]))
        .unwrap();
        assert!(!config.cache_enabled);
        assert_eq!(config.resident_versions, 4);
    }

    #[test]
    fn test_rejects_bad_values() {
        assert!(StoreConfig::from_lookup(lookup(&[("TRANSIT_CACHE_DISABLED", "maybe")])).is_err());
        assert!(StoreConfig::from_lookup(lookup(&[("TRANSIT_RESIDENT_VERSIONS", "0")])).is_err());
        let garbage = lookup(&[("TRANSIT_RESIDENT_VERSIONS", "lots")]);
        assert!(StoreConfig::from_lookup(garbage).is_err());
    }
}
