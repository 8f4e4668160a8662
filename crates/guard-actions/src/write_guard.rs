use std::collections::BTreeSet;

use serde::Serialize;

use crate::config::WriteGuardConfig;
use crate::error::PolicyError;

/// Default-deny gate in front of every remote write.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct WriteGuard {
    pub enforced: bool,
    pub allow_direct_write: bool,
    pub allowed_contexts: BTreeSet<String>,
}

impl WriteGuard {
    pub fn from_config(config: &WriteGuardConfig) -> Self {
        Self {
            enforced: config.enforced,
            allow_direct_write: config.allow_direct_write,
            allowed_contexts: config
                .allowed_contexts
                .iter()
                .map(|context| context.trim().to_lowercase())
                .filter(|context| !context.is_empty())
                .collect(),
        }
    }

    pub fn is_allowed(&self, context: Option<&str>) -> bool {
        if !self.enforced || self.allow_direct_write {
            return true;
        }
        context
            .map(|context| context.trim().to_lowercase())
            .is_some_and(|context| self.allowed_contexts.contains(&context))
    }

    /// Errors with `WriteBlocked` when `operation` may not run from `context`.
    pub fn authorize(&self, context: Option<&str>, operation: &str) -> Result<(), PolicyError> {
        if self.is_allowed(context) {
            return Ok(());
        }
        tracing::warn!(operation, context = context.unwrap_or(""), "direct write blocked");
        Err(PolicyError::WriteBlocked {
            operation: operation.to_string(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::WriteGuard;
    use crate::config::{WriteGuardConfig, ACTIONS_WRITE_CONTEXT};

    #[test]
    fn unit_default_guard_only_admits_the_actions_context() {
        let guard = WriteGuard::from_config(&WriteGuardConfig::default());
        guard
            .authorize(Some(ACTIONS_WRITE_CONTEXT), "send_message")
            .expect("engine context");
        guard
            .authorize(Some(" Actions "), "send_message")
            .expect("normalized context");
        assert_eq!(
            guard
                .authorize(Some("read_only"), "send_message")
                .expect_err("blocked")
                .reason_code(),
            "write_blocked"
        );
        assert!(!guard.is_allowed(None));
    }

    #[test]
    fn unit_disabled_guard_admits_everything() {
        let guard = WriteGuard::from_config(&WriteGuardConfig {
            enforced: false,
            ..WriteGuardConfig::default()
        });
        assert!(guard.is_allowed(None));
    }
}
