//! Account API over HTTP.

use std::time::Instant;

use async_trait::async_trait;
use reqwest::header::{ACCEPT, COOKIE};
use reqwest::{redirect, Client};
use serde::Deserialize;
use tracing::{debug, warn};

use super::{AccountApi, AccountSnapshot, CheckpointConfig, DriverError};
use crate::metrics;
use crate::store::AccountCredential;

/// Calls the account endpoint with the stored session cookies.
pub struct HttpAccountApi {
    client: Client,
    config: CheckpointConfig,
}

impl HttpAccountApi {
    pub fn new(config: CheckpointConfig) -> Result<Self, DriverError> {
        // Redirects stay visible: a 302 to the login page means the session is gone
        let client = Client::builder()
            .timeout(config.request_timeout())
            .redirect(redirect::Policy::none())
            .user_agent(config.user_agent.clone())
            .build()
            .map_err(|e| DriverError::Setup(e.to_string()))?;

        Ok(Self { client, config })
    }

    async fn warm_up(&self, url: &str, cookie: &str) {
        if let Err(e) = self.client.get(url).header(COOKIE, cookie).send().await {
            debug!(url, error = %e, "Home page warm-up failed");
        }
    }
}

fn map_request_error(e: reqwest::Error) -> DriverError {
    if e.is_timeout() {
        DriverError::Transient("account API request timed out".to_string())
    } else if e.is_connect() {
        DriverError::Transient(format!("connection failed: {}", e))
    } else {
        DriverError::Transient(e.to_string())
    }
}

#[async_trait]
impl AccountApi for HttpAccountApi {
    async fn fetch_account(
        &self,
        credential: &AccountCredential,
    ) -> Result<AccountSnapshot, DriverError> {
        let cookie = credential.cookie_header();
        if let Some(home) = &self.config.home_url {
            self.warm_up(home, &cookie).await;
        }

        let started = Instant::now();
        let result = async {
            let response = self
                .client
                .get(&self.config.account_api_url)
                .header(COOKIE, &cookie)
                .header(ACCEPT, "application/json")
                .send()
                .await
                .map_err(map_request_error)?;

            let status = response.status().as_u16();
            let body = response.text().await.map_err(map_request_error)?;
            parse_account_response(status, &body)
        }
        .await;

        metrics::ACCOUNT_API_DURATION
            .with_label_values(&[])
            .observe(started.elapsed().as_secs_f64());
        let label = match &result {
            Ok(_) => "success",
            Err(DriverError::SessionExpired(_)) => "session_expired",
            Err(_) => "error",
        };
        metrics::ACCOUNT_API_REQUESTS.with_label_values(&[label]).inc();

        if let Err(e) = &result {
            warn!(account_id = credential.account_id, error = %e, "Account lookup failed");
        }
        result
    }
}

#[derive(Debug, Deserialize)]
struct AccountResponse {
    #[serde(default)]
    success: bool,
    #[serde(default)]
    message: Option<String>,
    #[serde(default)]
    data: Option<AccountData>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct AccountData {
    #[serde(default)]
    point_summary: Option<PointSummary>,
    #[serde(default)]
    user_tier: Option<UserTier>,
}

#[derive(Debug, Deserialize)]
struct PointSummary {
    #[serde(default)]
    available: Option<f64>,
}

#[derive(Debug, Deserialize)]
struct UserTier {
    #[serde(default)]
    name: Option<String>,
}

/// Map an account API response to a snapshot.
///
/// 401, 403 and 302 mean the session is no longer accepted. Any other
/// non-2xx status is transient. A 2xx body must be JSON with
/// `success: true` and `data.pointSummary.available`.
pub fn parse_account_response(status: u16, body: &str) -> Result<AccountSnapshot, DriverError> {
    match status {
        401 | 403 | 302 => {
            return Err(DriverError::SessionExpired(format!(
                "account API returned HTTP {}",
                status
            )))
        }
        200..=299 => {}
        _ => {
            return Err(DriverError::Transient(format!(
                "account API returned HTTP {}",
                status
            )))
        }
    }

    let response: AccountResponse = serde_json::from_str(body)
        .map_err(|e| DriverError::InvalidResponse(format!("malformed JSON: {}", e)))?;

    if !response.success {
        return Err(DriverError::Rejected(
            response
                .message
                .unwrap_or_else(|| "account API reported failure".to_string()),
        ));
    }

    let data = response
        .data
        .ok_or_else(|| DriverError::InvalidResponse("missing data".to_string()))?;
    let points = data
        .point_summary
        .and_then(|p| p.available)
        .ok_or_else(|| DriverError::InvalidResponse("missing point balance".to_string()))?;
    let tier = data.user_tier.and_then(|t| t.name);

    Ok(AccountSnapshot { points, tier })
}
