use async_trait::async_trait;
use guard_limiter::GatewayError;
use serde_json::Value;

use crate::action::WriteAction;

/// Transport to the remote messaging service.
///
/// Implementations perform exactly one remote write per call and report
/// server-side throttling as [`GatewayError::Throttled`]. `write_context`
/// names the caller so implementations can consult a
/// [`WriteGuard`](crate::WriteGuard) themselves.
#[async_trait]
pub trait RemoteGateway: Send + Sync {
    async fn perform(&self, action: &WriteAction, write_context: &str) -> Result<Value, GatewayError>;
}
