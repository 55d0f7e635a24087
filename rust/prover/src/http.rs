use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use serde::Deserialize;
use tracing::{debug, info};
use url::Url;

use crate::circuit::Circuit;
use crate::error::ProverError;
use crate::inputs::ProofRequest;
use crate::response::ProofResponse;

const PROVER_TIMEOUT_SECS: u64 = 300;

/// A stateless proving backend. Implementations must not retry: the same inputs always
/// produce the same outcome.
#[async_trait]
pub trait ProverService: Send + Sync {
    async fn prove(&self, request: &ProofRequest) -> Result<ProofResponse, ProverError>;
}

#[async_trait]
impl<T: ProverService + ?Sized> ProverService for Arc<T> {
    async fn prove(&self, request: &ProofRequest) -> Result<ProofResponse, ProverError> {
        (**self).prove(request).await
    }
}

#[derive(Debug, Deserialize)]
struct ErrorBody {
    error: String,
}

pub fn prover_timeout() -> Result<Duration, ProverError> {
    if let Ok(value) = std::env::var("ZYLITH_PROVER_TIMEOUT_SECS") {
        let secs = value.parse::<u64>().map_err(|_| {
            ProverError::InvalidInput("invalid ZYLITH_PROVER_TIMEOUT_SECS".to_string())
        })?;
        if secs == 0 {
            return Err(ProverError::InvalidInput(
                "ZYLITH_PROVER_TIMEOUT_SECS must be > 0".to_string(),
            ));
        }
        Ok(Duration::from_secs(secs))
    } else {
        Ok(Duration::from_secs(PROVER_TIMEOUT_SECS))
    }
}

#[derive(Debug, Clone)]
pub struct HttpProver {
    base_url: Url,
    client: reqwest::Client,
}

impl HttpProver {
    pub fn new(base_url: &str) -> Result<Self, ProverError> {
        Self::with_timeout(base_url, prover_timeout()?)
    }

    pub fn with_timeout(base_url: &str, timeout: Duration) -> Result<Self, ProverError> {
        let base_url = Url::parse(base_url)
            .map_err(|err| ProverError::InvalidInput(format!("prover url: {err}")))?;
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|err| ProverError::Transport(err.to_string()))?;
        Ok(Self { base_url, client })
    }

    pub fn endpoint(&self, circuit: Circuit) -> Result<Url, ProverError> {
        let url = format!(
            "{}/api/proof/{}",
            self.base_url.as_str().trim_end_matches('/'),
            circuit.id()
        );
        Url::parse(&url).map_err(|err| ProverError::InvalidInput(err.to_string()))
    }
}

#[async_trait]
impl ProverService for HttpProver {
    async fn prove(&self, request: &ProofRequest) -> Result<ProofResponse, ProverError> {
        let url = self.endpoint(request.circuit)?;
        debug!(circuit = %request.circuit, fields = request.inputs.len(), "dispatching proof request");
        let started = Instant::now();
        let response = self
            .client
            .post(url)
            .json(&request.inputs.to_json())
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(ProverError::Rejected {
                status: status.as_u16(),
                message: error_message(&body),
            });
        }
        let body: ProofResponse = response.json().await?;
        info!(
            circuit = %request.circuit,
            elapsed_ms = started.elapsed().as_millis() as u64,
            proof_len = body.proof.len(),
            public_inputs = body.public_inputs.len(),
            "proof received"
        );
        Ok(body)
    }
}

fn error_message(body: &str) -> String {
    if let Ok(parsed) = serde_json::from_str::<ErrorBody>(body) {
        return parsed.error;
    }
    let trimmed = body.trim();
    if trimmed.is_empty() {
        "empty response body".to_string()
    } else {
        trimmed.to_string()
    }
}
