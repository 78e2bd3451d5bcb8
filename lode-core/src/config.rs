use std::time::Duration;

/// What `connect` does when a physical store differs from the desired one
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ConflictPolicy {
    /// Rebuild the physical store. When only indexes changed the records are
    /// kept and re-indexed; a changed key path or key generator drops them.
    #[default]
    DropAndRecreate,
    /// Fail `connect` with `SchemaConflict` and leave the data untouched
    Reject,
}

/// Connector configuration for schema reconciliation and cursor behavior
#[derive(Debug, Clone)]
pub struct ConnectorConfig {
    /// Drop physical stores the desired schema does not declare. When false
    /// (editable-schema mode) such stores are adopted into the effective schema.
    pub strict_schema: bool,

    /// Policy for stores whose structure changed
    pub on_schema_conflict: ConflictPolicy,

    /// Entries a cursor requests per engine round trip
    pub cursor_prefetch: usize,

    /// How long a SQLite connection waits on a locked database
    pub busy_timeout: Duration,

    /// Open SQLite files read-only
    pub read_only: bool,
}

impl Default for ConnectorConfig {
    fn default() -> Self {
        Self {
            strict_schema: true,
            on_schema_conflict: ConflictPolicy::DropAndRecreate,
            cursor_prefetch: 32,
            busy_timeout: Duration::from_secs(5),
            read_only: false,
        }
    }
}

impl ConnectorConfig {
    /// Create a new configuration with default values
    pub fn new() -> Self {
        Self::default()
    }

    /// Keep physical stores that the desired schema does not declare
    pub fn editable(mut self) -> Self {
        self.strict_schema = false;
        self
    }

    /// Set the policy for structurally changed stores
    pub fn with_conflict_policy(mut self, policy: ConflictPolicy) -> Self {
        self.on_schema_conflict = policy;
        self
    }

    /// Set cursor prefetch size
    pub fn with_cursor_prefetch(mut self, entries: usize) -> Self {
        self.cursor_prefetch = entries;
        self
    }

    /// Set the SQLite busy timeout
    pub fn with_busy_timeout(mut self, timeout: Duration) -> Self {
        self.busy_timeout = timeout;
        self
    }

    /// Open the database read-only
    pub fn read_only(mut self) -> Self {
        self.read_only = true;
        self
    }

    /// Validate configuration values
    pub fn validate(&self) -> Result<(), String> {
        if self.cursor_prefetch == 0 {
            return Err("cursor_prefetch must be greater than 0".to_string());
        }

        // A strict connect may need to drop stores.
        if self.read_only && self.strict_schema {
            return Err("read_only requires editable schema mode".to_string());
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = ConnectorConfig::default();
        assert!(config.strict_schema);
        assert_eq!(config.on_schema_conflict, ConflictPolicy::DropAndRecreate);
        assert_eq!(config.cursor_prefetch, 32);
        assert!(!config.read_only);
    }

    #[test]
    fn test_builder_methods() {
        let config = ConnectorConfig::new()
            .editable()
            .with_conflict_policy(ConflictPolicy::Reject)
            .with_cursor_prefetch(1)
            .with_busy_timeout(Duration::from_millis(250));

        assert!(!config.strict_schema);
        assert_eq!(config.on_schema_conflict, ConflictPolicy::Reject);
        assert_eq!(config.cursor_prefetch, 1);
        assert_eq!(config.busy_timeout, Duration::from_millis(250));
    }

    #[test]
    fn test_validate_success() {
        assert!(ConnectorConfig::default().validate().is_ok());
        assert!(ConnectorConfig::new().editable().read_only().validate().is_ok());
    }

    #[test]
    fn test_validate_zero_prefetch() {
        let config = ConnectorConfig::new().with_cursor_prefetch(0);
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validate_read_only_strict() {
        let config = ConnectorConfig::new().read_only();
        assert!(config.validate().is_err());
    }
}
