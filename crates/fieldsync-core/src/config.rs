use serde::{Deserialize, Serialize};

use crate::CoreError;

/// Naming and retry settings shared by the resolver, the merger and the store.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct SyncConfig {
    /// Suffix appended to a synced table name to form its local counterpart.
    pub local_suffix: String,
    pub synced_tag: String,
    pub local_tag: String,
    /// Suffix of the persisted union views created by migrations.
    pub union_view_suffix: String,
    pub busy_timeout_ms: u32,
    /// How many times `append_version` retries after losing a chain race.
    pub append_retry_limit: u32,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            local_suffix: "_local".to_string(),
            synced_tag: "synced".to_string(),
            local_tag: "local".to_string(),
            union_view_suffix: "_union".to_string(),
            busy_timeout_ms: 5000,
            append_retry_limit: 3,
        }
    }
}

impl SyncConfig {
    /// Check naming settings before any SQL is generated from them.
    ///
    /// # Errors
    /// Returns [`CoreError::Validation`] for empty suffixes, clashing or
    /// unquotable tags, and a zero retry limit.
    pub fn validate(&self) -> Result<(), CoreError> {
        if !is_identifier_fragment(&self.local_suffix) {
            return Err(CoreError::Validation(format!(
                "local_suffix MUST be a non-empty identifier fragment, got {:?}",
                self.local_suffix
            )));
        }
        if !is_identifier_fragment(&self.union_view_suffix) {
            return Err(CoreError::Validation(format!(
                "union_view_suffix MUST be a non-empty identifier fragment, got {:?}",
                self.union_view_suffix
            )));
        }
        if self.local_suffix == self.union_view_suffix {
            return Err(CoreError::Validation(
                "local_suffix and union_view_suffix MUST differ".to_string(),
            ));
        }
        for tag in [&self.synced_tag, &self.local_tag] {
            if tag.is_empty() || tag.contains(['\'', '"']) {
                return Err(CoreError::Validation(format!(
                    "source tags MUST be non-empty and quote free, got {tag:?}"
                )));
            }
        }
        if self.synced_tag == self.local_tag {
            return Err(CoreError::Validation("source tags MUST be distinct".to_string()));
        }
        if self.append_retry_limit == 0 {
            return Err(CoreError::Validation("append_retry_limit MUST be >= 1".to_string()));
        }
        Ok(())
    }
}

fn is_identifier_fragment(value: &str) -> bool {
    !value.is_empty() && value.chars().all(|c| c.is_ascii_alphanumeric() || c == '_')
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_is_valid() {
        assert_eq!(SyncConfig::default().validate(), Ok(()));
    }

    #[test]
    fn rejects_identical_tags() {
        let config = SyncConfig { local_tag: "synced".to_string(), ..SyncConfig::default() };
        assert!(config.validate().is_err());
    }

    #[test]
    fn rejects_quoted_tag_and_bad_suffix() {
        let quoted = SyncConfig { synced_tag: "sy'nced".to_string(), ..SyncConfig::default() };
        assert!(quoted.validate().is_err());

        let suffix = SyncConfig { local_suffix: "-local".to_string(), ..SyncConfig::default() };
        assert!(suffix.validate().is_err());
    }

    #[test]
    fn partial_yaml_style_input_keeps_defaults() -> Result<(), serde_json::Error> {
        let config: SyncConfig = serde_json::from_str(r#"{"local_tag":"draft"}"#)?;
        assert_eq!(config.local_tag, "draft");
        assert_eq!(config.local_suffix, "_local");
        assert_eq!(config.append_retry_limit, 3);
        Ok(())
    }
}
