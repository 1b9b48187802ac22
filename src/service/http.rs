//! HTTP client for Stable Diffusion WebUI compatible services (Forge, A1111).

use crate::config::ServiceConfig;
use crate::error::{ApiError, ServiceError};
use crate::service::wire;
use crate::service::{GenerationService, RawImageSet, ServiceEndpointConfig, ServicePayload};
use async_trait::async_trait;
use chrono::Utc;
use reqwest::Client;
use serde::de::DeserializeOwned;
use std::time::{Duration, Instant};
use tracing::{debug, warn};

fn map_http_error(error: reqwest::Error) -> ServiceError {
    if error.is_timeout() {
        ServiceError::Timeout(format!("Request timeout: {}", error))
    } else if error.is_connect() {
        ServiceError::Unreachable(format!("Connection error: {}", error))
    } else if error.is_decode() || error.is_body() {
        ServiceError::MalformedResponse(format!("Failed to read response: {}", error))
    } else {
        ServiceError::Unreachable(format!("HTTP error: {}", error))
    }
}

fn build_http_client(config: &ServiceConfig) -> Result<Client, ApiError> {
    Client::builder()
        .no_proxy()
        .connect_timeout(config.connect_timeout())
        .timeout(config.request_timeout())
        .build()
        .map_err(|e| ApiError::ConfigError(format!("Failed to create HTTP client: {}", e)))
}

/// Generation service client speaking the `/sdapi/v1` protocol.
pub struct ForgeClient {
    client: Client,
    base_url: String,
    probe_timeout: Duration,
}

impl ForgeClient {
    pub fn new(config: &ServiceConfig) -> Result<Self, ApiError> {
        Ok(Self {
            client: build_http_client(config)?,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            probe_timeout: config.probe_timeout(),
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    async fn probe_json<T: DeserializeOwned>(&self, path: &str) -> Result<T, ServiceError> {
        let response = self
            .client
            .get(self.url(path))
            .timeout(self.probe_timeout)
            .send()
            .await
            .map_err(map_http_error)?;

        let status = response.status();
        let body = response.text().await.map_err(map_http_error)?;
        if !status.is_success() {
            return Err(ServiceError::Rejected(wire::rejection_reason(
                status.as_u16(),
                &body,
            )));
        }
        serde_json::from_str(&body).map_err(|e| {
            ServiceError::MalformedResponse(format!("Failed to parse {} response: {}", path, e))
        })
    }
}

#[async_trait]
impl GenerationService for ForgeClient {
    async fn generate(&self, payload: &ServicePayload) -> Result<RawImageSet, ServiceError> {
        let body = wire::txt2img_body(payload);
        let started = Instant::now();
        debug!(
            url = %self.url(wire::TXT2IMG_PATH),
            width = payload.sampling.width,
            height = payload.sampling.height,
            steps = payload.sampling.steps,
            adapter = payload.feature_adapter.is_some(),
            pose = payload.pose.is_some(),
            regions = payload.regions.as_ref().map(|r| r.region_prompts.len()).unwrap_or(0),
            "Sending txt2img request"
        );

        let response = self
            .client
            .post(self.url(wire::TXT2IMG_PATH))
            .header("Accept", "application/json")
            .json(&body)
            .send()
            .await
            .map_err(map_http_error)?;

        let status = response.status();
        let text = response.text().await.map_err(map_http_error)?;
        if !status.is_success() {
            let reason = wire::rejection_reason(status.as_u16(), &text);
            warn!(status = status.as_u16(), reason = %reason, "txt2img rejected");
            return Err(ServiceError::Rejected(reason));
        }

        let images = wire::decode_txt2img(&text)?;
        debug!(
            images = images.images.len(),
            elapsed_ms = started.elapsed().as_millis() as u64,
            "txt2img completed"
        );
        Ok(images)
    }

    async fn check_availability(&self) -> Result<ServiceEndpointConfig, ServiceError> {
        // Reachability first; the remaining probes only refine capabilities.
        let _: serde_json::Value = self.probe_json(wire::PROGRESS_PATH).await?;

        let scripts: wire::ScriptList = match self.probe_json(wire::SCRIPTS_PATH).await {
            Ok(scripts) => scripts,
            Err(err) => {
                warn!(error = %err, "Script listing unavailable; assuming no extensions");
                wire::ScriptList::default()
            }
        };
        let models: wire::ModelList = match self.probe_json(wire::CONTROLNET_MODELS_PATH).await
        {
            Ok(models) => models,
            Err(err) => {
                debug!(error = %err, "ControlNet model list unavailable");
                wire::ModelList::default()
            }
        };
        let model = match self.probe_json::<wire::Options>(wire::OPTIONS_PATH).await {
            Ok(options) => options.sd_model_checkpoint.filter(|m| !m.is_empty()),
            Err(err) => {
                warn!(error = %err, "Options unavailable; model state unknown");
                None
            }
        };

        Ok(ServiceEndpointConfig {
            base_url: self.base_url.clone(),
            available: true,
            model,
            capabilities: wire::capabilities_from(&scripts, &models),
            checked_at: Utc::now(),
        })
    }

    fn endpoint_label(&self) -> &str {
        &self.base_url
    }
}
