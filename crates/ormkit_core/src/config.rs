//! Session, domain and disconnected-state configuration.

use crate::disconnected::MergeMode;
use crate::operation::{Operation, OperationLogType};
use crate::transaction::IsolationLevel;
use ormkit_types::Key;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

/// Configuration for a session.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Pending changes that trigger an eager flush before the next registration.
    pub entity_change_registry_size: usize,

    /// Generate temporary keys and resolve them at flush time.
    pub lazy_key_generation: bool,

    /// Allow entity changes outside of a transaction.
    pub non_transactional_entity_states: bool,

    /// Keep cached states valid after the outermost commit.
    pub non_transactional_reads: bool,

    /// Log secondary rollback failures instead of returning them.
    pub suppress_rollback_exceptions: bool,

    /// Isolation level for new outermost transactions.
    pub default_isolation_level: IsolationLevel,

    /// Timeout for new outermost transactions (`None` = no timeout).
    pub default_timeout: Option<Duration>,

    /// Run field validation before the outermost commit.
    pub validate_on_commit: bool,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            entity_change_registry_size: 250,
            lazy_key_generation: false,
            non_transactional_entity_states: false,
            non_transactional_reads: true,
            suppress_rollback_exceptions: false,
            default_isolation_level: IsolationLevel::ReadCommitted,
            default_timeout: None,
            validate_on_commit: true,
        }
    }
}

impl SessionConfig {
    /// Creates a new configuration with default values.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the change registry size limit.
    #[must_use]
    pub const fn entity_change_registry_size(mut self, size: usize) -> Self {
        self.entity_change_registry_size = size;
        self
    }

    /// Sets whether keys are generated lazily.
    #[must_use]
    pub const fn lazy_key_generation(mut self, value: bool) -> Self {
        self.lazy_key_generation = value;
        self
    }

    /// Sets whether entity changes are allowed outside transactions.
    #[must_use]
    pub const fn non_transactional_entity_states(mut self, value: bool) -> Self {
        self.non_transactional_entity_states = value;
        self
    }

    /// Sets whether cached states survive the outermost commit.
    #[must_use]
    pub const fn non_transactional_reads(mut self, value: bool) -> Self {
        self.non_transactional_reads = value;
        self
    }

    /// Sets whether secondary rollback failures are only logged.
    #[must_use]
    pub const fn suppress_rollback_exceptions(mut self, value: bool) -> Self {
        self.suppress_rollback_exceptions = value;
        self
    }

    /// Sets the default isolation level.
    #[must_use]
    pub const fn default_isolation_level(mut self, level: IsolationLevel) -> Self {
        self.default_isolation_level = level;
        self
    }

    /// Sets the default transaction timeout.
    #[must_use]
    pub const fn default_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.default_timeout = timeout;
        self
    }

    /// Sets whether entities are validated on commit.
    #[must_use]
    pub const fn validate_on_commit(mut self, value: bool) -> Self {
        self.validate_on_commit = value;
        self
    }
}

/// Configuration for the process-wide domain.
#[derive(Debug, Clone)]
pub struct DomainConfig {
    /// Capacity of the resolved-key cache.
    pub key_cache_size: usize,

    /// Capacity of the compiled-query cache.
    pub query_cache_size: usize,
}

impl Default for DomainConfig {
    fn default() -> Self {
        Self {
            key_cache_size: 16 * 1024,
            query_cache_size: 1024,
        }
    }
}

impl DomainConfig {
    /// Creates a new configuration with default values.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the key cache capacity.
    #[must_use]
    pub const fn key_cache_size(mut self, size: usize) -> Self {
        self.key_cache_size = size;
        self
    }

    /// Sets the query cache capacity.
    #[must_use]
    pub const fn query_cache_size(mut self, size: usize) -> Self {
        self.query_cache_size = size;
        self
    }
}

/// How a disconnected state uses recorded versions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct VersionsUsage {
    /// Check recorded versions before registration and apply.
    pub validate: bool,
    /// Refresh recorded versions after registration and apply.
    pub update: bool,
}

impl Default for VersionsUsage {
    fn default() -> Self {
        Self {
            validate: true,
            update: true,
        }
    }
}

/// Filter over operations replayed by `apply_changes`.
pub type OperationFilter = Arc<dyn Fn(&Operation) -> bool + Send + Sync>;

/// Filter over keys whose versions are refreshed by `apply_changes`.
pub type VersionFilter = Arc<dyn Fn(&Key) -> bool + Send + Sync>;

/// Configuration for a disconnected state.
#[derive(Clone, Default)]
pub struct DisconnectedConfig {
    /// Conflict policy used by registration.
    pub merge_mode: MergeMode,

    /// Version validation and refresh switches.
    pub versions_usage: VersionsUsage,

    /// Which operations are recorded while attached.
    pub operation_log_type: OperationLogType,

    /// Operations to replay on apply (`None` = all).
    pub operation_filter: Option<OperationFilter>,

    /// Keys whose versions are refreshed on apply (`None` = all touched).
    pub version_filter: Option<VersionFilter>,
}

impl fmt::Debug for DisconnectedConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DisconnectedConfig")
            .field("merge_mode", &self.merge_mode)
            .field("versions_usage", &self.versions_usage)
            .field("operation_log_type", &self.operation_log_type)
            .field("operation_filter", &self.operation_filter.is_some())
            .field("version_filter", &self.version_filter.is_some())
            .finish()
    }
}

impl DisconnectedConfig {
    /// Creates a new configuration with default values.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the merge mode.
    #[must_use]
    pub fn merge_mode(mut self, mode: MergeMode) -> Self {
        self.merge_mode = mode;
        self
    }

    /// Sets the versions usage.
    #[must_use]
    pub fn versions_usage(mut self, usage: VersionsUsage) -> Self {
        self.versions_usage = usage;
        self
    }

    /// Sets the operation log type.
    #[must_use]
    pub fn operation_log_type(mut self, log_type: OperationLogType) -> Self {
        self.operation_log_type = log_type;
        self
    }

    /// Sets the replay filter.
    #[must_use]
    pub fn operation_filter(mut self, filter: impl Fn(&Operation) -> bool + Send + Sync + 'static) -> Self {
        self.operation_filter = Some(Arc::new(filter));
        self
    }

    /// Sets the version refresh filter.
    #[must_use]
    pub fn version_filter(mut self, filter: impl Fn(&Key) -> bool + Send + Sync + 'static) -> Self {
        self.version_filter = Some(Arc::new(filter));
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn session_defaults() {
        let config = SessionConfig::default();
        assert_eq!(config.entity_change_registry_size, 250);
        assert!(config.non_transactional_reads);
        assert!(config.validate_on_commit);
        assert!(!config.lazy_key_generation);
    }

    #[test]
    fn session_builder() {
        let config = SessionConfig::new()
            .entity_change_registry_size(10)
            .lazy_key_generation(true)
            .default_timeout(Some(Duration::from_secs(5)));
        assert_eq!(config.entity_change_registry_size, 10);
        assert!(config.lazy_key_generation);
        assert_eq!(config.default_timeout, Some(Duration::from_secs(5)));
    }

    #[test]
    fn disconnected_builder() {
        let config = DisconnectedConfig::new()
            .merge_mode(MergeMode::PreferNew)
            .operation_log_type(OperationLogType::SystemOperationLog)
            .operation_filter(|op| !matches!(op, Operation::IdentifierAssign { .. }));
        assert_eq!(config.merge_mode, MergeMode::PreferNew);
        assert!(config.operation_filter.is_some());
        assert!(format!("{config:?}").contains("PreferNew"));
    }
}
