use std::path::Path;

use anyhow::{bail, Context, Result};
use guard_limiter::{QuotaCounter, QuotaRequest};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::config::ActionPolicyConfig;
use crate::error::PolicyError;

/// Canonical form of a target identifier: trimmed, without a leading `@`,
/// lowercased.
pub fn normalize_target(raw: &str) -> String {
    let trimmed = raw.trim();
    trimmed
        .strip_prefix('@')
        .unwrap_or(trimmed)
        .trim()
        .to_lowercase()
}

/// Operation-specific content of a write action.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum ActionPayload {
    SendMessage {
        text: String,
    },
    SendDirectMessage {
        text: String,
    },
    SendFile {
        path: String,
        size_bytes: u64,
        modified_unix_ns: u64,
        #[serde(default)]
        caption: String,
    },
    AddMember {
        user: String,
    },
    RemoveMember {
        user: String,
    },
}

impl ActionPayload {
    /// Builds a file payload from the file on disk; the hash then changes
    /// whenever the file is replaced or edited.
    pub fn send_file(path: &Path, caption: &str) -> Result<Self> {
        let metadata = std::fs::metadata(path)
            .with_context(|| format!("file_path does not exist: {}", path.display()))?;
        if !metadata.is_file() {
            bail!("file_path is not a file: {}", path.display());
        }
        let absolute = std::path::absolute(path)
            .with_context(|| format!("failed to resolve {}", path.display()))?;
        let modified_unix_ns = metadata
            .modified()
            .ok()
            .and_then(|modified| modified.duration_since(std::time::UNIX_EPOCH).ok())
            .map(|elapsed| u64::try_from(elapsed.as_nanos()).unwrap_or(u64::MAX))
            .unwrap_or(0);
        Ok(Self::SendFile {
            path: absolute.display().to_string(),
            size_bytes: metadata.len(),
            modified_unix_ns,
            caption: caption.to_string(),
        })
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Self::SendMessage { .. } => "send_message",
            Self::SendDirectMessage { .. } => "send_direct_message",
            Self::SendFile { .. } => "send_file",
            Self::AddMember { .. } => "add_member",
            Self::RemoveMember { .. } => "remove_member",
        }
    }

    pub fn quota_counter(&self) -> QuotaCounter {
        match self {
            Self::SendDirectMessage { .. } => QuotaCounter::DirectMessages,
            Self::SendMessage { .. } | Self::SendFile { .. } => QuotaCounter::GroupMessages,
            Self::AddMember { .. } | Self::RemoveMember { .. } => QuotaCounter::MembershipChanges,
        }
    }

    fn normalized(self) -> Self {
        match self {
            Self::SendMessage { text } => Self::SendMessage {
                text: text.trim().to_string(),
            },
            Self::SendDirectMessage { text } => Self::SendDirectMessage {
                text: text.trim().to_string(),
            },
            Self::SendFile {
                path,
                size_bytes,
                modified_unix_ns,
                caption,
            } => Self::SendFile {
                path: path.trim().to_string(),
                size_bytes,
                modified_unix_ns,
                caption: caption.trim().to_string(),
            },
            Self::AddMember { user } => Self::AddMember {
                user: normalize_target(&user),
            },
            Self::RemoveMember { user } => Self::RemoveMember {
                user: normalize_target(&user),
            },
        }
    }
}

/// A single outbound write against one target.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WriteAction {
    pub target: String,
    #[serde(flatten)]
    pub payload: ActionPayload,
}

impl WriteAction {
    pub fn new(target: &str, payload: ActionPayload) -> Self {
        Self {
            target: normalize_target(target),
            payload: payload.normalized(),
        }
    }

    /// Hex SHA-256 of the canonical JSON of the action (sorted keys, compact).
    pub fn action_hash(&self) -> String {
        // serde_json maps are ordered, so the encoding is canonical.
        let canonical = serde_json::to_value(self)
            .map(|value| value.to_string())
            .unwrap_or_default();
        format!("{:x}", Sha256::digest(canonical.as_bytes()))
    }

    pub fn quota_request(&self) -> QuotaRequest {
        QuotaRequest::for_target(self.payload.quota_counter(), self.target.clone())
    }

    /// Shape checks that do not depend on policy state.
    pub fn validate(&self, config: &ActionPolicyConfig) -> Result<(), PolicyError> {
        if self.target.is_empty() {
            return Err(PolicyError::InvalidPayload("target is empty".to_string()));
        }
        match &self.payload {
            ActionPayload::SendMessage { text } | ActionPayload::SendDirectMessage { text } => {
                if text.is_empty() {
                    return Err(PolicyError::InvalidPayload(
                        "message_text is empty".to_string(),
                    ));
                }
                let length = text.chars().count();
                if length > config.max_message_len {
                    return Err(PolicyError::InvalidPayload(format!(
                        "message_text is too long ({length} > {})",
                        config.max_message_len
                    )));
                }
            }
            ActionPayload::SendFile {
                path,
                size_bytes,
                caption,
                ..
            } => {
                if path.is_empty() {
                    return Err(PolicyError::InvalidPayload("file_path is empty".to_string()));
                }
                if *size_bytes > config.max_file_bytes() {
                    return Err(PolicyError::InvalidPayload(format!(
                        "file is too large ({:.2} MB > {} MB)",
                        *size_bytes as f64 / (1024.0 * 1024.0),
                        config.max_file_mb
                    )));
                }
                let length = caption.chars().count();
                if length > config.max_message_len {
                    return Err(PolicyError::InvalidPayload(format!(
                        "caption is too long ({length} > {})",
                        config.max_message_len
                    )));
                }
            }
            ActionPayload::AddMember { user } | ActionPayload::RemoveMember { user } => {
                if user.is_empty() {
                    return Err(PolicyError::InvalidPayload("user is empty".to_string()));
                }
            }
        }
        Ok(())
    }
}
