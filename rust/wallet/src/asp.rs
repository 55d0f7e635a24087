//! Association Set Provider client, spoken to through the gateway's forward-only `/asp` proxy.
//!
//! The ASP keeps two trees: the deposit tree every shielded note lands in, and the associated
//! set, an operator-curated subset used for compliance membership.

use std::time::Duration;

use serde::Deserialize;
use starknet::core::types::Felt;
use tracing::{debug, info};
use url::Url;

use crate::codec::{felt_to_hex, parse_felt};
use crate::config::{timeout_from_env, with_retry, RetryConfig, ASP_TIMEOUT_ENV};
use crate::error::ClientError;
use crate::merkle::MerkleProof;

const ASP_TIMEOUT_SECS: u64 = 60;

fn asp_client(timeout: Duration) -> Result<reqwest::Client, ClientError> {
    reqwest::Client::builder()
        .timeout(timeout)
        .build()
        .map_err(|err| ClientError::Transport(err.to_string()))
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum WireBit {
    Bool(bool),
    Number(u8),
}

impl WireBit {
    fn to_bool(&self) -> Result<bool, ClientError> {
        match self {
            WireBit::Bool(bit) => Ok(*bit),
            WireBit::Number(0) => Ok(false),
            WireBit::Number(1) => Ok(true),
            WireBit::Number(other) => Err(ClientError::Encoding(format!(
                "path index must be 0 or 1, got {other}"
            ))),
        }
    }
}

#[derive(Debug, Deserialize)]
struct WireProof {
    leaf: String,
    path: Vec<String>,
    path_indices: Vec<WireBit>,
    root: String,
}

/// Root, leaf count and depth of the associated set tree.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct TreeInfo {
    #[serde(deserialize_with = "felt_from_str")]
    pub root: Felt,
    pub leaf_count: u64,
    pub depth: usize,
}

fn felt_from_str<'de, D: serde::Deserializer<'de>>(deserializer: D) -> Result<Felt, D::Error> {
    let raw = String::deserialize(deserializer)?;
    parse_felt(&raw).map_err(serde::de::Error::custom)
}

#[derive(Debug, Deserialize)]
struct IndexResponse {
    found: bool,
    #[serde(default)]
    index: Option<u64>,
}

#[derive(Debug, Clone)]
pub struct AspClient {
    base_url: Url,
    client: reqwest::Client,
    pub retry: RetryConfig,
}

impl AspClient {
    /// Timeout from `ZYLITH_ASP_TIMEOUT_SECS`, 60 seconds by default.
    pub fn new(base_url: Url) -> Result<Self, ClientError> {
        Self::with_timeout(base_url, timeout_from_env(ASP_TIMEOUT_ENV, ASP_TIMEOUT_SECS)?)
    }

    pub fn with_timeout(base_url: Url, timeout: Duration) -> Result<Self, ClientError> {
        Ok(Self {
            base_url,
            client: asp_client(timeout)?,
            retry: RetryConfig::default(),
        })
    }

    pub fn with_retry(mut self, retry: RetryConfig) -> Self {
        self.retry = retry;
        self
    }

    pub fn base_url(&self) -> &Url {
        &self.base_url
    }

    /// Membership proof for the leaf at `index` in the deposit tree.
    pub async fn merkle_proof(&self, index: u64) -> Result<MerkleProof, ClientError> {
        self.fetch_proof("deposit", index).await
    }

    /// Membership proof for the leaf at `index` in the associated set.
    pub async fn associated_proof(&self, index: u64) -> Result<MerkleProof, ClientError> {
        self.fetch_proof("associated", index).await
    }

    async fn fetch_proof(&self, tree: &str, index: u64) -> Result<MerkleProof, ClientError> {
        let url = &self.endpoint(&format!("{tree}/proof/{index}"));
        let wire: WireProof = with_retry(self.retry.clone(), move || self.get_json(url.clone())).await?;
        let path = wire
            .path
            .iter()
            .map(|value| parse_felt(value))
            .collect::<Result<Vec<_>, _>>()?;
        let path_indices = wire
            .path_indices
            .iter()
            .map(WireBit::to_bool)
            .collect::<Result<Vec<_>, _>>()?;
        let proof = MerkleProof {
            leaf: parse_felt(&wire.leaf)?,
            path,
            path_indices,
            root: parse_felt(&wire.root)?,
            leaf_index: Some(index),
        };
        debug!(tree, index, root = %felt_to_hex(&proof.root), levels = proof.path.len(), "merkle proof fetched");
        Ok(proof)
    }

    /// Leaf index of a published commitment, `None` while the ASP has not seen it.
    pub async fn deposit_index(&self, commitment: Felt) -> Result<Option<u64>, ClientError> {
        let url = &self.endpoint(&format!("deposit/index/{}", felt_to_hex(&commitment)));
        let body: IndexResponse = with_retry(self.retry.clone(), move || self.get_json(url.clone())).await?;
        if !body.found {
            return Ok(None);
        }
        let index = body
            .index
            .ok_or_else(|| ClientError::Encoding("asp reported found without an index".to_string()))?;
        info!(commitment = %felt_to_hex(&commitment), index, "commitment indexed");
        Ok(Some(index))
    }

    pub async fn root(&self) -> Result<Felt, ClientError> {
        self.fetch_root("deposit/root").await
    }

    pub async fn associated_root(&self) -> Result<Felt, ClientError> {
        self.fetch_root("associated/root").await
    }

    pub async fn associated_info(&self) -> Result<TreeInfo, ClientError> {
        let url = &self.endpoint("associated/info");
        with_retry(self.retry.clone(), move || self.get_json(url.clone())).await
    }

    async fn fetch_root(&self, path: &str) -> Result<Felt, ClientError> {
        let url = &self.endpoint(path);
        let root: String = with_retry(self.retry.clone(), move || self.get_json(url.clone())).await?;
        parse_felt(&root)
    }

    fn endpoint(&self, path: &str) -> String {
        format!("{}/{}", self.base_url.as_str().trim_end_matches('/'), path)
    }

    async fn get_json<T: serde::de::DeserializeOwned>(&self, url: String) -> Result<T, ClientError> {
        let response = self.client.get(&url).send().await?;
        let status = response.status();
        if !status.is_success() {
            let detail = response.text().await.unwrap_or_default();
            return Err(ClientError::Upstream {
                status: status.as_u16(),
                detail,
            });
        }
        Ok(response.json().await?)
    }
}
