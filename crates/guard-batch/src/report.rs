//! Run reports: written by batch runs and read back to build follow-up batches.

use std::path::Path;

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use serde_json::Value;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReportItemResult {
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason_code: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReportItem {
    #[serde(alias = "chat_id")]
    pub target: Value,
    #[serde(default)]
    pub result: Option<ReportItemResult>,
}

impl ReportItem {
    pub fn target_string(&self) -> Option<String> {
        match &self.target {
            Value::String(target) => Some(target.trim().to_string()),
            Value::Number(number) => Some(number.to_string()),
            _ => None,
        }
        .filter(|target| !target.is_empty())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunReport {
    pub items: Vec<ReportItem>,
}

impl RunReport {
    pub fn load(path: &Path) -> Result<Self> {
        if !path.is_file() {
            bail!("report_path is not a file: {}", path.display());
        }
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read report {}", path.display()))?;
        serde_json::from_str(&raw)
            .with_context(|| format!("failed to parse report {}", path.display()))
    }

    /// Targets of failed items whose error or reason code contains `needle`
    /// (case-insensitive; an empty needle matches every failure).
    pub fn failed_targets(&self, needle: &str) -> Vec<String> {
        let needle = needle.trim().to_lowercase();
        self.items
            .iter()
            .filter(|item| {
                item.result.as_ref().is_some_and(|result| {
                    !result.success
                        && (needle.is_empty()
                            || [result.error.as_deref(), result.reason_code.as_deref()]
                                .into_iter()
                                .flatten()
                                .any(|text| text.to_lowercase().contains(&needle)))
                })
            })
            .filter_map(ReportItem::target_string)
            .collect()
    }
}
