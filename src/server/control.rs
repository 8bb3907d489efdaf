//! HTTP client for the engine's management endpoints.
//!
//! The engine exposes `/health` for readiness, `/models` for per-model
//! status, `/props` for runtime properties, and `/models/load` +
//! `/models/unload` for switching what is resident.

use std::collections::HashMap;
use std::time::Duration;

use serde::Deserialize;
use serde_json::Value;
use tracing::debug;

use crate::error::{KeepError, Result};
use crate::server::ModelStatus;

#[derive(Debug, Deserialize)]
struct ModelsResponse {
    #[serde(default)]
    data: Vec<ModelEntry>,
}

#[derive(Debug, Deserialize)]
struct ModelEntry {
    id: String,
    #[serde(default)]
    status: Option<StatusField>,
}

#[derive(Debug, Deserialize)]
struct StatusField {
    value: String,
}

/// Client for one engine instance. Cheap to clone.
#[derive(Debug, Clone)]
pub struct ControlPlaneClient {
    base_url: String,
    client: reqwest::Client,
}

impl ControlPlaneClient {
    /// Client for an engine on the local loopback.
    pub fn new(port: u16) -> Result<Self> {
        Self::with_base_url(format!("http://127.0.0.1:{port}"))
    }

    /// Client for an explicit base URL. Used directly by tests.
    pub fn with_base_url(base_url: String) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(3))
            .build()
            .map_err(|e| KeepError::ControlPlane(format!("cannot build HTTP client: {e}")))?;
        Ok(Self { base_url, client })
    }

    /// Readiness probe. Any transport error or non-200 means "not ready".
    pub async fn health(&self) -> bool {
        match self.client.get(format!("{}/health", self.base_url)).send().await {
            Ok(resp) => resp.status().is_success(),
            Err(_) => false,
        }
    }

    /// Per-model status map from `/models`.
    pub async fn models(&self) -> Result<HashMap<String, ModelStatus>> {
        let resp = self
            .client
            .get(format!("{}/models", self.base_url))
            .send()
            .await
            .map_err(|e| KeepError::ControlPlane(format!("GET /models failed: {e}")))?;
        if !resp.status().is_success() {
            return Err(KeepError::ControlPlane(format!(
                "GET /models returned {}",
                resp.status()
            )));
        }
        let body: ModelsResponse = resp
            .json()
            .await
            .map_err(|e| KeepError::ControlPlane(format!("invalid /models response: {e}")))?;

        Ok(body
            .data
            .into_iter()
            .map(|entry| {
                let status = entry
                    .status
                    .map_or(ModelStatus::Unloaded, |s| ModelStatus::from_value(&s.value));
                (entry.id, status)
            })
            .collect())
    }

    /// Whether a loaded model has been put to sleep by the engine's idle
    /// timer. The flag appears at the top level on newer engines and under
    /// `default_generation_settings` on older ones.
    pub async fn is_sleeping(&self, model: &str) -> Result<bool> {
        let resp = self
            .client
            .get(format!("{}/props", self.base_url))
            .query(&[("model", model)])
            .send()
            .await
            .map_err(|e| KeepError::ControlPlane(format!("GET /props failed: {e}")))?;
        if !resp.status().is_success() {
            return Err(KeepError::ControlPlane(format!(
                "GET /props returned {}",
                resp.status()
            )));
        }
        let body: Value = resp
            .json()
            .await
            .map_err(|e| KeepError::ControlPlane(format!("invalid /props response: {e}")))?;

        let flag = body
            .get("is_sleeping")
            .or_else(|| {
                body.get("default_generation_settings")
                    .and_then(|settings| settings.get("is_sleeping"))
            })
            .and_then(Value::as_bool)
            .unwrap_or(false);
        Ok(flag)
    }

    /// Ask the engine to load a model. Completion is observed via `/models`.
    pub async fn load(&self, model: &str) -> Result<()> {
        debug!("requesting load of {model}");
        self.post_model_action("load", model).await
    }

    /// Ask the engine to release a model.
    pub async fn unload(&self, model: &str) -> Result<()> {
        debug!("requesting unload of {model}");
        self.post_model_action("unload", model).await
    }

    async fn post_model_action(&self, action: &str, model: &str) -> Result<()> {
        let resp = self
            .client
            .post(format!("{}/models/{action}", self.base_url))
            .json(&serde_json::json!({ "model": model }))
            .send()
            .await
            .map_err(|e| KeepError::ControlPlane(format!("POST /models/{action} failed: {e}")))?;
        if !resp.status().is_success() {
            return Err(KeepError::ControlPlane(format!(
                "POST /models/{action} returned {}",
                resp.status()
            )));
        }
        Ok(())
    }
}
