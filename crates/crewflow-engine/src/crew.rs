use std::sync::Arc;
use std::time::Duration;

use futures::future::BoxFuture;
use reqwest::Client;
use serde_json::{json, Map, Value};
use tracing::debug;

use crewflow_core::config::CrewConfig;
use crewflow_core::error::{CrewflowError, Result};
use crewflow_core::traits::CrewRunner;
use crewflow_core::types::CrewOutput;

/// Crew runner backed by a remote crew service.
///
/// `POST {endpoint}/crews/{crew_id}/run` with `{"inputs": {...}}`; the
/// response body is a [`CrewOutput`].
pub struct HttpCrewRunner {
    http: Client,
    endpoint: String,
    api_key: Option<String>,
}

impl HttpCrewRunner {
    pub fn new(endpoint: &str, timeout: Duration, api_key: Option<String>) -> Result<Self> {
        let http = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| CrewflowError::Config(format!("crew http client: {}", e)))?;
        Ok(Self {
            http,
            endpoint: endpoint.trim_end_matches('/').to_string(),
            api_key,
        })
    }

    pub fn run_url(&self, crew_id: &str) -> String {
        format!("{}/crews/{}/run", self.endpoint, crew_id)
    }
}

impl CrewRunner for HttpCrewRunner {
    fn run_crew(
        &self,
        crew_id: &str,
        inputs: Map<String, Value>,
    ) -> BoxFuture<'_, Result<CrewOutput>> {
        let url = self.run_url(crew_id);
        let crew_id = crew_id.to_string();

        Box::pin(async move {
            debug!(crew_id = %crew_id, url = %url, "Calling crew service");

            let mut request = self
                .http
                .post(&url)
                .header("content-type", "application/json")
                .json(&json!({ "inputs": inputs }));
            if let Some(key) = &self.api_key {
                request = request.bearer_auth(key);
            }

            let response = request
                .send()
                .await
                .map_err(|e| CrewflowError::CrewExecution(format!("{}: {}", crew_id, e)))?;

            if !response.status().is_success() {
                let status = response.status();
                let body = response
                    .text()
                    .await
                    .unwrap_or_else(|_| "unknown".to_string());
                return Err(CrewflowError::CrewExecution(format!(
                    "{}: HTTP {}: {}",
                    crew_id, status, body
                )));
            }

            response
                .json::<CrewOutput>()
                .await
                .map_err(|e| CrewflowError::CrewExecution(format!("{}: bad response: {}", crew_id, e)))
        })
    }
}

/// Used when no crew service is configured; every call fails.
pub struct UnconfiguredCrewRunner;

impl CrewRunner for UnconfiguredCrewRunner {
    fn run_crew(
        &self,
        crew_id: &str,
        _inputs: Map<String, Value>,
    ) -> BoxFuture<'_, Result<CrewOutput>> {
        let crew_id = crew_id.to_string();
        Box::pin(async move {
            Err(CrewflowError::CrewExecution(format!(
                "{}: no crew endpoint configured",
                crew_id
            )))
        })
    }
}

/// Crew runner for the `[crew]` config section.
pub fn crew_runner_from_config(config: &CrewConfig) -> Result<Arc<dyn CrewRunner>> {
    match config.endpoint.as_deref() {
        Some(endpoint) if !endpoint.trim().is_empty() => Ok(Arc::new(HttpCrewRunner::new(
            endpoint,
            Duration::from_secs(config.timeout_secs.max(1)),
            config.api_key.clone(),
        )?)),
        _ => Ok(Arc::new(UnconfiguredCrewRunner)),
    }
}
