//! # Configuration
//!
//! One setting: which propagation backend to use. It comes from the
//! `DD_TRACE_SCOPE` environment variable or from a host's own configuration
//! file, since [`ScopeConfig`] is serde-compatible.
//!
//! ```text
//! DD_TRACE_SCOPE=async_local_storage   # force the native backend
//! DD_TRACE_SCOPE=                      # unset: probe the runtime
//! ```

use crate::error::ScopeError;
use crate::storage::BackendKind;
use serde::{Deserialize, Serialize};

/// Backend selection for [`crate::lifecycle::init`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ScopeConfig {
    /// Explicit backend; `None` probes the runtime for the best one.
    pub backend: Option<BackendKind>,
}

impl ScopeConfig {
    /// Environment variable naming the backend.
    pub const ENV_VAR: &'static str = "DD_TRACE_SCOPE";

    pub fn with_backend(backend: BackendKind) -> Self {
        Self {
            backend: Some(backend),
        }
    }

    /// Reads the configuration from the process environment.
    pub fn from_env() -> Result<Self, ScopeError> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Reads the configuration through `lookup`, which maps a variable name to
    /// its value.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ScopeError> {
        let backend = match lookup(Self::ENV_VAR) {
            Some(value) if !value.trim().is_empty() => Some(value.parse::<BackendKind>().map_err(
                |_| {
                    ScopeError::InvalidConfig(format!(
                        "{}={:?} is not one of sync, async_hooks, async_local_storage, zone, noop",
                        Self::ENV_VAR,
                        value
                    ))
                },
            )?),
            _ => None,
        };
        Ok(Self { backend })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn lookup(value: &'static str) -> impl Fn(&str) -> Option<String> {
        move |name| (name == ScopeConfig::ENV_VAR).then(|| value.to_string())
    }

    #[test]
    fn reads_backend_from_the_variable() {
        let config = ScopeConfig::from_lookup(lookup("ZONE")).unwrap();
        assert_eq!(config.backend, Some(BackendKind::Zone));
    }

    #[test]
    fn missing_or_empty_means_probe() {
        assert_eq!(ScopeConfig::from_lookup(|_| None).unwrap(), ScopeConfig::default());
        assert_eq!(ScopeConfig::from_lookup(lookup("  ")).unwrap().backend, None);
    }

    #[test]
    fn unknown_values_are_rejected() {
        let error = ScopeConfig::from_lookup(lookup("fibers")).unwrap_err();
        assert!(matches!(error, ScopeError::InvalidConfig(message) if message.contains("fibers")));
    }

    #[test]
    fn embeds_in_host_configuration() {
        let config: ScopeConfig = serde_json::from_str(r#"{"backend":"async_hooks"}"#).unwrap();
        assert_eq!(config, ScopeConfig::with_backend(BackendKind::AsyncHooks));

        let empty: ScopeConfig = serde_json::from_str("{}").unwrap();
        assert_eq!(empty.backend, None);
        assert_eq!(
            serde_json::to_string(&ScopeConfig::with_backend(BackendKind::SyncStack)).unwrap(),
            r#"{"backend":"sync"}"#
        );
    }
}
