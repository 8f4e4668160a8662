use guard_actions::PolicyError;
use guard_batch::BatchError;
use guard_limiter::LimiterError;
use serde::Serialize;

/// Machine-readable rejection handed to the tool layer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Rejection {
    pub reason_code: String,
    pub error: String,
    pub next_step: Option<String>,
    pub retry_after_secs: Option<u64>,
}

impl From<&PolicyError> for Rejection {
    fn from(error: &PolicyError) -> Self {
        let retry_after_secs = match error {
            PolicyError::ApprovalTooFresh { retry_after_secs }
            | PolicyError::DuplicateAction {
                retry_after_secs, ..
            } => Some(*retry_after_secs),
            PolicyError::Limiter(limiter) => limiter.retry_after_secs(),
            _ => None,
        };
        Self {
            reason_code: error.reason_code().to_string(),
            error: error.to_string(),
            next_step: error.next_step(),
            retry_after_secs,
        }
    }
}

impl From<&BatchError> for Rejection {
    fn from(error: &BatchError) -> Self {
        if let BatchError::Policy(policy) = error {
            return Self::from(policy);
        }
        let retry_after_secs = match error {
            BatchError::BatchBusy {
                retry_after_secs, ..
            } => Some(*retry_after_secs),
            _ => None,
        };
        Self {
            reason_code: error.reason_code().to_string(),
            error: error.to_string(),
            next_step: error.next_step(),
            retry_after_secs,
        }
    }
}

impl From<&LimiterError> for Rejection {
    fn from(error: &LimiterError) -> Self {
        Self {
            reason_code: error.reason_code().to_string(),
            error: error.to_string(),
            next_step: None,
            retry_after_secs: error.retry_after_secs(),
        }
    }
}
