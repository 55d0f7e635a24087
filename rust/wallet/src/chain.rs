//! Read-only ledger calls through the gateway's `/rpc` proxy.

use starknet::core::types::{
    BlockId, BlockTag, ExecutionResult, Felt, FunctionCall, StarknetError,
};
use starknet::core::utils::get_selector_from_name;
use starknet::providers::jsonrpc::{HttpTransport, JsonRpcClient};
use starknet::providers::{Provider, ProviderError};
use tracing::debug;
use url::Url;

use crate::codec::{felt_to_bool, felt_to_hex, felt_to_i32, felt_to_u128, U256Words};
use crate::config::{with_retry, RetryConfig};
use crate::error::ClientError;
use crate::history::TxStatus;
use crate::notes::Address;
use crate::sync::PoolUpdate;

const POOL_STATE_LEN: usize = 8;

pub struct ChainClient<P> {
    provider: P,
    pool_address: Address,
    pub retry: RetryConfig,
}

impl ChainClient<JsonRpcClient<HttpTransport>> {
    pub fn connect(rpc_url: Url, pool_address: Address) -> Self {
        Self::new(JsonRpcClient::new(HttpTransport::new(rpc_url)), pool_address)
    }
}

impl<P: Provider + Send + Sync> ChainClient<P> {
    pub fn new(provider: P, pool_address: Address) -> Self {
        Self {
            provider,
            pool_address,
            retry: RetryConfig::default(),
        }
    }

    pub fn with_retry(mut self, retry: RetryConfig) -> Self {
        self.retry = retry;
        self
    }

    pub fn pool_address(&self) -> Address {
        self.pool_address
    }

    /// Full pool observation stamped with the latest block number.
    pub async fn fetch_pool_state(&self) -> Result<PoolUpdate, ClientError> {
        let provider = &self.provider;
        let block = with_retry(self.retry.clone(), move || async move {
            provider
                .block_number()
                .await
                .map_err(|err| ClientError::Rpc(err.to_string()))
        })
        .await?;
        let result = self.call(self.pool_address, "get_pool_state", Vec::new()).await?;
        if result.len() < POOL_STATE_LEN {
            return Err(ClientError::Rpc(format!(
                "invalid pool state: expected {POOL_STATE_LEN} values, got {}",
                result.len()
            )));
        }
        let words = |at: usize| -> Result<U256Words, ClientError> {
            Ok(U256Words::new(felt_to_u128(&result[at])?, felt_to_u128(&result[at + 1])?))
        };
        let update = PoolUpdate {
            block,
            sqrt_price_x128: Some(words(0)?),
            tick: Some(felt_to_i32(&result[2])?),
            liquidity: Some(felt_to_u128(&result[3])?),
            fee_growth_global0: Some(words(4)?),
            fee_growth_global1: Some(words(6)?),
        };
        debug!(block, tick = ?update.tick, "pool state fetched");
        Ok(update)
    }

    pub async fn merkle_root(&self) -> Result<Felt, ClientError> {
        let result = self.call(self.pool_address, "get_merkle_root", Vec::new()).await?;
        first(&result, "get_merkle_root")
    }

    pub async fn is_root_known(&self, root: Felt) -> Result<bool, ClientError> {
        let result = self.call(self.pool_address, "is_root_known", vec![root]).await?;
        felt_to_bool(&first(&result, "is_root_known")?)
    }

    pub async fn is_nullifier_spent(&self, nullifier: Felt) -> Result<bool, ClientError> {
        let result = self
            .call(self.pool_address, "is_nullifier_spent", vec![nullifier])
            .await?;
        felt_to_bool(&first(&result, "is_nullifier_spent")?)
    }

    pub async fn token_balance(&self, token: Address, owner: Address) -> Result<U256Words, ClientError> {
        let result = self.call(token, "balance_of", vec![owner]).await?;
        u256_result(&result, "balance_of")
    }

    pub async fn allowance(
        &self,
        token: Address,
        owner: Address,
        spender: Address,
    ) -> Result<U256Words, ClientError> {
        let result = self.call(token, "allowance", vec![owner, spender]).await?;
        u256_result(&result, "allowance")
    }

    /// Receipt-based status; a hash the node has not seen yet is still pending.
    pub async fn transaction_status(&self, hash: Felt) -> Result<TxStatus, ClientError> {
        let provider = &self.provider;
        let receipt = with_retry(self.retry.clone(), move || async move {
            match provider.get_transaction_receipt(hash).await {
                Ok(receipt) => Ok(Some(receipt)),
                Err(ProviderError::StarknetError(StarknetError::TransactionHashNotFound)) => Ok(None),
                Err(err) => Err(ClientError::Rpc(err.to_string())),
            }
        })
        .await?;
        let status = match receipt {
            None => TxStatus::Pending,
            Some(receipt) => match receipt.receipt.execution_result() {
                ExecutionResult::Succeeded => TxStatus::Success,
                ExecutionResult::Reverted { .. } => TxStatus::Failed,
            },
        };
        debug!(hash = %felt_to_hex(&hash), ?status, "transaction status fetched");
        Ok(status)
    }

    async fn call(
        &self,
        contract_address: Address,
        entry_point: &str,
        calldata: Vec<Felt>,
    ) -> Result<Vec<Felt>, ClientError> {
        let selector = get_selector_from_name(entry_point)
            .map_err(|err| ClientError::Validation(err.to_string()))?;
        let call = &FunctionCall {
            contract_address,
            entry_point_selector: selector,
            calldata,
        };
        let provider = &self.provider;
        with_retry(self.retry.clone(), move || async move {
            provider
                .call(call.clone(), BlockId::Tag(BlockTag::Latest))
                .await
                .map_err(|err| ClientError::Rpc(err.to_string()))
        })
        .await
    }
}

fn first(result: &[Felt], entry_point: &str) -> Result<Felt, ClientError> {
    result
        .first()
        .copied()
        .ok_or_else(|| ClientError::Rpc(format!("{entry_point} returned no values")))
}

fn u256_result(result: &[Felt], entry_point: &str) -> Result<U256Words, ClientError> {
    if result.len() < 2 {
        return Err(ClientError::Rpc(format!(
            "{entry_point} returned {} values, expected a u256",
            result.len()
        )));
    }
    Ok(U256Words::new(felt_to_u128(&result[0])?, felt_to_u128(&result[1])?))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::i32_to_felt;
    use axum::routing::post;
    use axum::{Json, Router};
    use serde_json::{json, Value};

    fn selector_hex(name: &str) -> String {
        felt_to_hex(&get_selector_from_name(name).expect("selector"))
    }

    async fn node() -> Url {
        let app = Router::new().route(
            "/rpc",
            post(|Json(body): Json<Value>| async move {
                let id = body.get("id").cloned().unwrap_or(Value::Null);
                let method = body.get("method").and_then(Value::as_str).unwrap_or_default();
                let text = body.to_string();
                let result = match method {
                    "starknet_blockNumber" => json!(42),
                    "starknet_call" if text.contains(&selector_hex("get_pool_state")) => json!([
                        "0x0",
                        "0x1",
                        felt_to_hex(&i32_to_felt(-5)),
                        "0x3e8",
                        "0x7",
                        "0x0",
                        "0x9",
                        "0x0"
                    ]),
                    "starknet_call" if text.contains(&selector_hex("is_nullifier_spent")) => json!(["0x1"]),
                    "starknet_call" if text.contains(&selector_hex("balance_of")) => json!(["0x64", "0x2"]),
                    "starknet_getTransactionReceipt" => {
                        return Json(json!({
                            "jsonrpc": "2.0",
                            "id": id,
                            "error": { "code": 29, "message": "Transaction hash not found" }
                        }));
                    }
                    _ => json!([]),
                };
                Json(json!({ "jsonrpc": "2.0", "id": id, "result": result }))
            }),
        );
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
            .await
            .expect("bind");
        let addr = listener.local_addr().expect("addr");
        tokio::spawn(async move {
            axum::serve(listener, app).await.expect("serve");
        });
        Url::parse(&format!("http://{addr}/rpc")).expect("url")
    }

    fn fast_retry() -> RetryConfig {
        RetryConfig {
            max_attempts: 1,
            delay_ms: 1,
        }
    }

    #[tokio::test]
    async fn decodes_pool_state() {
        let client = ChainClient::connect(node().await, Felt::from(0x123u32)).with_retry(fast_retry());
        let update = client.fetch_pool_state().await.expect("pool state");
        assert_eq!(update.block, 42);
        assert_eq!(update.sqrt_price_x128, Some(U256Words::new(0, 1)));
        assert_eq!(update.tick, Some(-5));
        assert_eq!(update.liquidity, Some(1000));
        assert_eq!(update.fee_growth_global0, Some(U256Words::new(7, 0)));
        assert_eq!(update.fee_growth_global1, Some(U256Words::new(9, 0)));
    }

    #[tokio::test]
    async fn reads_flags_and_balances() {
        let client = ChainClient::connect(node().await, Felt::from(0x123u32)).with_retry(fast_retry());
        assert!(client.is_nullifier_spent(Felt::from(5u8)).await.expect("spent"));
        let balance = client
            .token_balance(Felt::ONE, Felt::TWO)
            .await
            .expect("balance");
        assert_eq!(balance, U256Words::new(100, 2));
    }

    #[tokio::test]
    async fn unknown_transaction_is_pending() {
        let client = ChainClient::connect(node().await, Felt::from(0x123u32)).with_retry(fast_retry());
        let status = client
            .transaction_status(Felt::from(0xdeadu32))
            .await
            .expect("status");
        assert_eq!(status, TxStatus::Pending);
    }

    #[tokio::test]
    async fn short_results_are_rpc_errors() {
        let client = ChainClient::connect(node().await, Felt::from(0x123u32)).with_retry(fast_retry());
        let err = client.merkle_root().await.expect_err("empty result");
        assert_eq!(err.kind(), "rpc");
    }
}
