// ABOUTME: E2B provisioner backed by the E2B REST API
// ABOUTME: Creates, looks up and kills sandboxes; maps HTTP failures to provisioning errors

use async_trait::async_trait;
use reqwest::{Client, Response, StatusCode};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::{debug, info};

use super::{ProvisionedSandbox, ProvisioningError, Result, SandboxHandle, SandboxProvisioner};
use crate::types::RunLimits;
use sandkeep_config::E2bSettings;

const DEFAULT_SANDBOX_TIMEOUT_SECS: i64 = 300;
const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, Serialize)]
struct CreateSandboxBody<'a> {
    #[serde(rename = "templateID")]
    template_id: &'a str,
    timeout: i64,
}

#[derive(Debug, Deserialize)]
struct SandboxResponse {
    #[serde(rename = "sandboxID")]
    sandbox_id: String,
}

pub struct E2bProvisioner {
    client: Client,
    api_key: String,
    api_endpoint: String,
}

impl E2bProvisioner {
    pub fn new(api_key: String, api_endpoint: Option<String>) -> Result<Self> {
        if api_key.trim().is_empty() {
            return Err(ProvisioningError::PermissionDenied(
                "E2B API key is required".to_string(),
            ));
        }

        let client = Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .map_err(|e| ProvisioningError::Other(e.to_string()))?;

        Ok(Self {
            client,
            api_key,
            api_endpoint: api_endpoint
                .unwrap_or_else(|| "https://api.e2b.dev".to_string())
                .trim_end_matches('/')
                .to_string(),
        })
    }

    pub fn from_settings(settings: &E2bSettings) -> Result<Self> {
        Self::new(settings.api_key.clone(), Some(settings.api_url.clone()))
    }

    fn sandbox_url(&self, external_id: &str) -> String {
        format!("{}/sandboxes/{}", self.api_endpoint, external_id)
    }
}

/// Sandbox lifetime requested from E2B: the run's max duration, or the default
fn sandbox_timeout_secs(limits: &RunLimits) -> i64 {
    limits
        .max_duration_ms
        .map(|ms| (ms / 1000).max(1))
        .unwrap_or(DEFAULT_SANDBOX_TIMEOUT_SECS)
}

fn transport_error(err: reqwest::Error) -> ProvisioningError {
    if err.is_timeout() {
        ProvisioningError::Timeout(err.to_string())
    } else {
        ProvisioningError::Other(err.to_string())
    }
}

async fn status_error(response: Response) -> ProvisioningError {
    let status = response.status();
    let body = response.text().await.unwrap_or_default();
    let message = if body.is_empty() {
        format!("E2B returned {}", status)
    } else {
        format!("E2B returned {}: {}", status, body)
    };

    match status {
        StatusCode::NOT_FOUND => ProvisioningError::NotFound(message),
        StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => {
            ProvisioningError::PermissionDenied(message)
        }
        StatusCode::TOO_MANY_REQUESTS | StatusCode::PAYMENT_REQUIRED => {
            ProvisioningError::QuotaExceeded(message)
        }
        StatusCode::REQUEST_TIMEOUT | StatusCode::GATEWAY_TIMEOUT => {
            ProvisioningError::Timeout(message)
        }
        _ => ProvisioningError::classify(message),
    }
}

#[async_trait]
impl SandboxProvisioner for E2bProvisioner {
    async fn create(&self, template_id: &str, limits: &RunLimits) -> Result<ProvisionedSandbox> {
        let body = CreateSandboxBody {
            template_id,
            timeout: sandbox_timeout_secs(limits),
        };

        let response = self
            .client
            .post(format!("{}/sandboxes", self.api_endpoint))
            .header("X-API-Key", &self.api_key)
            .json(&body)
            .send()
            .await
            .map_err(transport_error)?;

        if !response.status().is_success() {
            return Err(status_error(response).await);
        }

        let sandbox: SandboxResponse = response
            .json()
            .await
            .map_err(|e| ProvisioningError::Other(format!("Invalid E2B response: {}", e)))?;

        info!(
            "Created E2B sandbox {} from template {}",
            sandbox.sandbox_id, template_id
        );

        Ok(ProvisionedSandbox {
            external_id: sandbox.sandbox_id,
        })
    }

    async fn connect(&self, external_id: &str) -> Result<SandboxHandle> {
        let response = self
            .client
            .get(self.sandbox_url(external_id))
            .header("X-API-Key", &self.api_key)
            .send()
            .await
            .map_err(transport_error)?;

        if !response.status().is_success() {
            return Err(status_error(response).await);
        }

        Ok(SandboxHandle {
            external_id: external_id.to_string(),
        })
    }

    async fn kill(&self, handle: &SandboxHandle) -> Result<()> {
        let response = self
            .client
            .delete(self.sandbox_url(&handle.external_id))
            .header("X-API-Key", &self.api_key)
            .send()
            .await
            .map_err(transport_error)?;

        if response.status() == StatusCode::NOT_FOUND {
            debug!("E2B sandbox {} already gone", handle.external_id);
            return Ok(());
        }

        if !response.status().is_success() {
            return Err(status_error(response).await);
        }

        info!("Killed E2B sandbox {}", handle.external_id);
        Ok(())
    }
}
