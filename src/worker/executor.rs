use std::time::Duration;

use crate::unit::Unit;

/// What one delegated call resolved to.
///
/// Execution never raises: transport errors, timeouts, and non-2xx replies
/// all fold into `Failure` with a human-readable description.
#[derive(Debug, Clone, PartialEq)]
pub enum ExecutionOutcome {
    Success(serde_json::Value),
    Failure(String),
}

/// Invokes a unit's delegate endpoint over HTTP.
#[derive(Debug, Clone)]
pub struct DelegateExecutor {
    client: reqwest::Client,
}

impl DelegateExecutor {
    /// Build a client whose requests all carry the configured hard timeout.
    pub fn new(request_timeout: Duration) -> reqwest::Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(request_timeout)
            .build()?;
        Ok(Self { client })
    }

    /// POST the unit's body to its endpoint and fold the reply into an
    /// outcome. A 2xx body is the success result, parsed as JSON when it is
    /// JSON and carried as a string otherwise.
    pub async fn execute(&self, unit: &Unit) -> ExecutionOutcome {
        tracing::debug!(unit_id = %unit.id, url = %unit.url, "executing unit");

        let response = match self.client.post(&unit.url).json(&unit.body).send().await {
            Ok(response) => response,
            Err(e) => {
                return ExecutionOutcome::Failure(format!("request to {} failed: {e}", unit.url));
            }
        };

        let status = response.status();
        let text = match response.text().await {
            Ok(text) => text,
            Err(e) => {
                return ExecutionOutcome::Failure(format!("reading response body failed: {e}"));
            }
        };

        if status.is_success() {
            let result = serde_json::from_str(&text)
                .unwrap_or_else(|_| serde_json::Value::String(text));
            ExecutionOutcome::Success(result)
        } else {
            ExecutionOutcome::Failure(format!("delegate returned {status}: {text}"))
        }
    }
}
