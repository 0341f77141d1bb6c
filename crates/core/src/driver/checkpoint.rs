//! Point balance checks.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::json;

use super::{AccountDriver, DriverError, TaskContext};
use crate::batch::BatchMode;
use crate::events::{EventKind, EventLevel};
use crate::store::AccountCredential;
use crate::task::{Outcome, TaskPayload};

/// The `[checkpoint]` config section.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CheckpointConfig {
    /// Account endpoint returning the point summary as JSON.
    pub account_api_url: String,

    /// Page fetched once before the account call, when the site needs it.
    #[serde(default)]
    pub home_url: Option<String>,

    #[serde(default = "default_user_agent")]
    pub user_agent: String,

    #[serde(default = "default_request_timeout")]
    pub request_timeout_secs: u64,

    /// Pause after each account to stay under the site's rate limits.
    #[serde(default = "default_inter_account_delay")]
    pub inter_account_delay_ms: u64,
}

pub(super) fn default_user_agent() -> String {
    "Mozilla/5.0 (X11; Linux x86_64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/124.0 Safari/537.36"
        .to_string()
}

fn default_request_timeout() -> u64 {
    15
}

fn default_inter_account_delay() -> u64 {
    3000
}

impl CheckpointConfig {
    pub fn new(account_api_url: impl Into<String>) -> Self {
        Self {
            account_api_url: account_api_url.into(),
            home_url: None,
            user_agent: default_user_agent(),
            request_timeout_secs: default_request_timeout(),
            inter_account_delay_ms: default_inter_account_delay(),
        }
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    pub fn inter_account_delay(&self) -> Duration {
        Duration::from_millis(self.inter_account_delay_ms)
    }
}

/// Points and tier read from an account.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AccountSnapshot {
    pub points: f64,
    pub tier: Option<String>,
}

/// Remote account lookup used by checkpoint batches.
#[async_trait]
pub trait AccountApi: Send + Sync {
    async fn fetch_account(
        &self,
        credential: &AccountCredential,
    ) -> Result<AccountSnapshot, DriverError>;
}

/// Reads one account's point balance per task.
pub struct CheckpointDriver {
    api: Arc<dyn AccountApi>,
    delay: Duration,
}

impl CheckpointDriver {
    pub fn new(api: Arc<dyn AccountApi>, delay: Duration) -> Self {
        Self { api, delay }
    }
}

#[async_trait]
impl AccountDriver for CheckpointDriver {
    fn mode(&self) -> BatchMode {
        BatchMode::Checkpoint
    }

    async fn run(&self, ctx: &TaskContext) -> Outcome {
        let outcome = match self.api.fetch_account(&ctx.credential).await {
            Ok(snapshot) => {
                let tier = snapshot.tier.as_deref().unwrap_or("unknown");
                ctx.events.emit(
                    ctx.events
                        .event(
                            EventLevel::Info,
                            EventKind::Log,
                            format!(
                                "Account {}: {} points ({})",
                                ctx.account_id, snapshot.points, tier
                            ),
                        )
                        .with_metadata(json!({
                            "account_id": ctx.account_id,
                            "points": snapshot.points,
                            "tier": snapshot.tier,
                        })),
                );
                Outcome::success(TaskPayload::Checkpoint {
                    points: snapshot.points,
                    tier: snapshot.tier,
                })
            }
            Err(e) => e.into_outcome(),
        };

        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        outcome
    }
}
