use std::env;
use std::time::Duration;

use starknet::accounts::{ExecutionEncoding, SingleOwnerAccount};
use starknet::core::types::{BlockId, BlockTag, Felt};
use starknet::providers::jsonrpc::{HttpTransport, JsonRpcClient};
use starknet::providers::Provider;
use starknet::signers::{LocalWallet, SigningKey};
use tokio::time::sleep;
use url::Url;

use zylith_prover::HttpProver;
use zylith_wallet::{
    felt_to_hex, parse_felt, AccountSubmitter, ChainClient, Session, SwapIntent, TxStatus, WalletConfig,
};

type Account = SingleOwnerAccount<JsonRpcClient<HttpTransport>, LocalWallet>;

#[tokio::test]
async fn e2e_flow() -> Result<(), Box<dyn std::error::Error>> {
    if env::var("E2E").ok().as_deref() != Some("1") {
        return Ok(());
    }

    let gateway = env::var("GATEWAY_URL").unwrap_or_else(|_| "http://127.0.0.1:8080".to_string());
    let prover_url = env::var("PROVER_URL").unwrap_or_else(|_| "http://127.0.0.1:9000".to_string());
    let account_address = required_felt("ACCOUNT_ADDRESS")?;
    let private_key = required_felt("PRIVATE_KEY")?;
    let pool_address = env::var("POOL_ADDRESS")?;
    let token0 = env::var("TOKEN0").unwrap_or_else(|_| {
        "0x04718f5a0fc34cc1af16a1cdee98ffb20c31f5cd61d6ab07201858f4287c938d".to_string()
    });
    let token1 = env::var("TOKEN1").unwrap_or_else(|_| {
        "0x049d36570d4e46f48e99674bd3fcc84644ddd6b96f7c741b1562b82f9e004dc7".to_string()
    });

    let data_dir = tempfile::tempdir()?;
    let config = WalletConfig::from_toml(
        &format!(
            r#"
asp_url = "{gateway}/asp"
rpc_url = "{gateway}/rpc"
prover_url = "{prover_url}"
pool_address = "{pool_address}"
token0 = "{token0}"
token1 = "{token1}"
"#
        ),
        data_dir.path(),
    )?;
    if env::var("ZYLITH_VAULT_KEY").is_err() {
        env::set_var("ZYLITH_VAULT_KEY", "11".repeat(32));
    }

    let prover = HttpProver::with_timeout(config.prover_url.as_str(), config.prover_timeout)?;
    let session = Session::open(&config, prover)?;
    let chain = ChainClient::connect(config.rpc_url.clone(), config.pool_address);
    let submitter = AccountSubmitter::new(build_account(&config.rpc_url, account_address, private_key).await?);

    let pool = session.sync_pool(&chain).await?;
    if !pool.is_initialized() {
        let pending = session.initialize(None, None, None)?;
        let record = session.submit(pending, &submitter).await?;
        wait_for_success(&session, &chain, record.hash).await?;
        session.sync_pool(&chain).await?;
    }

    let token0 = config.token0;
    let pending = session.deposit(token0, 1_000_000)?;
    let record = session.submit(pending, &submitter).await?;
    wait_for_success(&session, &chain, record.hash).await?;
    wait_for_confirmations(&session).await?;
    assert_eq!(session.balance(token0)?, 1_000_000);

    let pending = session
        .swap(SwapIntent {
            zero_for_one: true,
            amount_specified: 500_000,
            sqrt_price_limit: None,
        })
        .await?;
    let quote = pending.quote.clone().ok_or("swap without quote")?;
    assert_eq!(quote.amount0_delta, -500_000);
    let record = session.submit(pending, &submitter).await?;
    wait_for_success(&session, &chain, record.hash).await?;
    wait_for_confirmations(&session).await?;
    assert_eq!(session.notes().unspent(Some(token0)).len(), 1);

    let pending = session
        .withdraw(token0, 200_000, account_address, Some(account_address))
        .await?;
    let record = session.submit(pending, &submitter).await?;
    wait_for_success(&session, &chain, record.hash).await?;
    Ok(())
}

async fn wait_for_success(
    session: &Session<HttpProver>,
    chain: &ChainClient<JsonRpcClient<HttpTransport>>,
    hash: Felt,
) -> Result<(), Box<dyn std::error::Error>> {
    for _ in 0..60 {
        session.poll_status(chain).await?;
        match session.history().get(&hash).map(|record| record.status) {
            Some(TxStatus::Success) => return Ok(()),
            Some(TxStatus::Failed) => return Err(format!("transaction {} reverted", felt_to_hex(&hash)).into()),
            _ => sleep(Duration::from_secs(2)).await,
        }
    }
    Err(format!("transaction {} still pending", felt_to_hex(&hash)).into())
}

async fn wait_for_confirmations(session: &Session<HttpProver>) -> Result<(), Box<dyn std::error::Error>> {
    for _ in 0..30 {
        session.refresh_notes().await?;
        let waiting = session
            .notes()
            .list()
            .iter()
            .any(|record| record.status == zylith_wallet::NoteStatus::Unconfirmed);
        if !waiting {
            return Ok(());
        }
        sleep(Duration::from_secs(2)).await;
    }
    Err("asp did not index the new notes".into())
}

async fn build_account(
    rpc_url: &Url,
    account_address: Felt,
    private_key: Felt,
) -> Result<Account, Box<dyn std::error::Error>> {
    let provider = JsonRpcClient::new(HttpTransport::new(rpc_url.clone()));
    let chain_id = provider.chain_id().await?;
    let signer = SigningKey::from_secret_scalar(private_key);
    let mut account = SingleOwnerAccount::new(
        provider,
        LocalWallet::from(signer),
        account_address,
        chain_id,
        ExecutionEncoding::New,
    );
    account.set_block_id(BlockId::Tag(BlockTag::Latest));
    Ok(account)
}

fn required_felt(key: &str) -> Result<Felt, Box<dyn std::error::Error>> {
    let value = env::var(key).map_err(|_| format!("missing {key}"))?;
    Ok(parse_felt(&value)?)
}
