use std::path::PathBuf;

use clap::{Args, Parser, Subcommand};
use serde_json::{json, Value};
use starknet::accounts::{ExecutionEncoding, SingleOwnerAccount};
use starknet::core::types::{BlockId, BlockTag, Felt};
use starknet::providers::jsonrpc::{HttpTransport, JsonRpcClient};
use starknet::providers::Provider;
use starknet::signers::{LocalWallet, SigningKey};
use tracing_subscriber::EnvFilter;
use url::Url;

use zylith_prover::HttpProver;
use zylith_wallet::codec::{parse_u256, U256Words};
use zylith_wallet::notes::compute_commitment;
use zylith_wallet::{
    felt_to_hex, parse_felt, AccountSubmitter, ChainClient, MintIntent, Note, PendingTransaction,
    Session, SwapIntent, WalletConfig,
};

#[derive(Parser)]
#[command(name = "zylith-cli")]
#[command(about = "zylith cli for local dev flows", long_about = None)]
struct Cli {
    /// Wallet config; defaults to `ZYLITH_WALLET_CONFIG` or `wallet.toml`.
    #[arg(long, global = true)]
    config: Option<PathBuf>,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    NoteNew {
        #[arg(long)]
        amount: u128,
        #[arg(long)]
        token: String,
    },
    Commitment {
        #[arg(long)]
        secret: String,
        #[arg(long)]
        nullifier: String,
        #[arg(long)]
        amount: u128,
    },
    Balance {
        #[arg(long)]
        token: Option<String>,
    },
    Notes {
        /// Include spent notes.
        #[arg(long)]
        all: bool,
    },
    History {
        #[arg(long)]
        pending: bool,
    },
    QuoteSwap {
        #[arg(long)]
        amount: u128,
        #[arg(long)]
        zero_for_one: bool,
    },
    Deposit {
        #[arg(long)]
        token: String,
        #[arg(long)]
        amount: u128,
        #[command(flatten)]
        account: AccountArgs,
    },
    Swap {
        #[arg(long)]
        amount: u128,
        #[arg(long)]
        zero_for_one: bool,
        #[arg(long)]
        sqrt_price_limit: Option<String>,
        #[command(flatten)]
        account: AccountArgs,
    },
    Withdraw {
        #[arg(long)]
        token: String,
        #[arg(long)]
        amount: u128,
        #[arg(long)]
        recipient: String,
        /// Receives the excess of a partly used note before it is re-deposited.
        /// Defaults to the account address.
        #[arg(long)]
        change_to: Option<String>,
        #[command(flatten)]
        account: AccountArgs,
    },
    Mint {
        #[arg(long, allow_hyphen_values = true)]
        tick_lower: i32,
        #[arg(long, allow_hyphen_values = true)]
        tick_upper: i32,
        #[arg(long)]
        liquidity: u128,
        #[command(flatten)]
        account: AccountArgs,
    },
    Burn {
        #[arg(long)]
        position: String,
        #[command(flatten)]
        account: AccountArgs,
    },
    Initialize {
        #[arg(long)]
        fee: Option<u128>,
        #[arg(long)]
        tick_spacing: Option<u32>,
        #[arg(long)]
        sqrt_price: Option<String>,
        #[command(flatten)]
        account: AccountArgs,
    },
    /// Checks a commitment's membership in the ASP associated set.
    Associated {
        #[arg(long)]
        commitment: String,
        #[arg(long)]
        index: u64,
    },
    RefreshNotes,
    SyncPool,
    PollStatus,
}

/// Without an account the prepared calls are printed and nothing is recorded.
#[derive(Args, Clone)]
struct AccountArgs {
    #[arg(long)]
    account_address: Option<String>,
    #[arg(long)]
    private_key: Option<String>,
    #[arg(long)]
    chain_id: Option<String>,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    match cli.command {
        Commands::NoteNew { amount, token } => {
            let note = Note::random(amount, parse_felt(&token)?)?;
            print_json(&serde_json::to_value(&note)?)?;
        }
        Commands::Commitment {
            secret,
            nullifier,
            amount,
        } => {
            let commitment = compute_commitment(parse_felt(&secret)?, parse_felt(&nullifier)?, amount)?;
            println!("{}", felt_to_hex(&commitment));
        }
        command => {
            let config = match &cli.config {
                Some(path) => WalletConfig::from_path(path)?,
                None => WalletConfig::load()?,
            };
            let prover = HttpProver::with_timeout(config.prover_url.as_str(), config.prover_timeout)?;
            let session = Session::open(&config, prover)?;
            run(command, &config, &session).await?;
        }
    }
    Ok(())
}

async fn run(
    command: Commands,
    config: &WalletConfig,
    session: &Session<HttpProver>,
) -> Result<(), Box<dyn std::error::Error>> {
    match command {
        Commands::NoteNew { .. } | Commands::Commitment { .. } => {}
        Commands::Balance { token } => {
            let tokens = match token {
                Some(token) => vec![parse_felt(&token)?],
                None => vec![config.token0, config.token1],
            };
            let mut rows = Vec::new();
            for token in tokens {
                rows.push(json!({
                    "token": felt_to_hex(&token),
                    "total": session.notes().total_balance(token)?.to_string(),
                    "spendable": session.notes().spendable_balance(token)?.to_string(),
                }));
            }
            print_json(&Value::Array(rows))?;
        }
        Commands::Notes { all } => {
            let records = if all {
                session.notes().list()
            } else {
                session.notes().unspent(None)
            };
            print_json(&serde_json::to_value(records)?)?;
        }
        Commands::History { pending } => {
            let records = if pending {
                session.history().pending()
            } else {
                session.history().list()
            };
            print_json(&serde_json::to_value(records)?)?;
        }
        Commands::QuoteSwap {
            amount,
            zero_for_one,
        } => {
            let quote = session.quote_swap(zero_for_one, amount)?;
            print_json(&json!({
                "amount0_delta": quote.amount0_delta.to_string(),
                "amount1_delta": quote.amount1_delta.to_string(),
                "amount_out": quote.amount_out.to_string(),
                "fee_amount": quote.fee_amount.to_string(),
                "sqrt_price_after": quote.sqrt_price_after,
                "tick_after": quote.tick_after,
                "price_impact_bps": quote.price_impact_bps.to_string(),
            }))?;
        }
        Commands::Deposit {
            token,
            amount,
            account,
        } => {
            let pending = session.deposit(parse_felt(&token)?, amount)?;
            finish(session, config, pending, &account).await?;
        }
        Commands::Swap {
            amount,
            zero_for_one,
            sqrt_price_limit,
            account,
        } => {
            let sqrt_price_limit = sqrt_price_limit.as_deref().map(parse_u256).transpose()?;
            let pending = session
                .swap(SwapIntent {
                    zero_for_one,
                    amount_specified: amount,
                    sqrt_price_limit,
                })
                .await?;
            finish(session, config, pending, &account).await?;
        }
        Commands::Withdraw {
            token,
            amount,
            recipient,
            change_to,
            account,
        } => {
            let change_to = change_to
                .as_deref()
                .or(account.account_address.as_deref())
                .map(parse_felt)
                .transpose()?;
            let pending = session
                .withdraw(parse_felt(&token)?, amount, parse_felt(&recipient)?, change_to)
                .await?;
            finish(session, config, pending, &account).await?;
        }
        Commands::Mint {
            tick_lower,
            tick_upper,
            liquidity,
            account,
        } => {
            let pending = session
                .mint(MintIntent {
                    tick_lower,
                    tick_upper,
                    liquidity,
                })
                .await?;
            finish(session, config, pending, &account).await?;
        }
        Commands::Burn { position, account } => {
            let pending = session.burn(parse_felt(&position)?).await?;
            finish(session, config, pending, &account).await?;
        }
        Commands::Initialize {
            fee,
            tick_spacing,
            sqrt_price,
            account,
        } => {
            let sqrt_price: Option<U256Words> = sqrt_price.as_deref().map(parse_u256).transpose()?;
            let pending = session.initialize(fee, tick_spacing, sqrt_price)?;
            finish(session, config, pending, &account).await?;
        }
        Commands::Associated { commitment, index } => {
            let proof = session
                .association_membership(parse_felt(&commitment)?, index)
                .await?;
            print_json(&serde_json::to_value(proof)?)?;
        }
        Commands::RefreshNotes => {
            let confirmed = session.refresh_notes().await?;
            println!("confirmed {confirmed} notes");
        }
        Commands::SyncPool => {
            let chain = chain_client(config);
            let state = session.sync_pool(&chain).await?;
            print_json(&serde_json::to_value(state)?)?;
        }
        Commands::PollStatus => {
            let chain = chain_client(config);
            let changed = session.poll_status(&chain).await?;
            print_json(&serde_json::to_value(changed)?)?;
        }
    }
    Ok(())
}

fn chain_client(config: &WalletConfig) -> ChainClient<JsonRpcClient<HttpTransport>> {
    ChainClient::connect(config.rpc_url.clone(), config.pool_address).with_retry(config.retry.clone())
}

/// Submits and records when an account is given, otherwise prints the calls for external signing.
async fn finish(
    session: &Session<HttpProver>,
    config: &WalletConfig,
    pending: PendingTransaction,
    account: &AccountArgs,
) -> Result<(), Box<dyn std::error::Error>> {
    let view = pending_view(&pending)?;
    match (&account.account_address, &account.private_key) {
        (Some(address), Some(private_key)) => {
            let account = build_account(&config.rpc_url, address, private_key, account.chain_id.as_deref()).await?;
            let record = session.submit(pending, &AccountSubmitter::new(account)).await?;
            print_json(&json!({
                "transaction": record,
                "prepared": view,
            }))?;
        }
        _ => {
            print_json(&view)?;
            eprintln!("no account given: transaction not submitted, notes not recorded");
        }
    }
    Ok(())
}

fn pending_view(pending: &PendingTransaction) -> Result<Value, serde_json::Error> {
    let mut view = json!({
        "kind": pending.kind,
        "calls": pending.calls.to_prepared(),
        "inputs": pending.inputs().iter().map(felt_to_hex).collect::<Vec<_>>(),
        "outputs": serde_json::to_value(&pending.outputs)?,
    });
    if let Some(quote) = &pending.quote {
        view["quote"] = json!({
            "amount0_delta": quote.amount0_delta.to_string(),
            "amount1_delta": quote.amount1_delta.to_string(),
            "amount_out": quote.amount_out.to_string(),
            "price_impact_bps": quote.price_impact_bps.to_string(),
        });
    }
    Ok(view)
}

async fn build_account(
    rpc_url: &Url,
    account_address: &str,
    private_key: &str,
    chain_id: Option<&str>,
) -> Result<SingleOwnerAccount<JsonRpcClient<HttpTransport>, LocalWallet>, String> {
    let provider = JsonRpcClient::new(HttpTransport::new(rpc_url.clone()));
    let chain_id = match chain_id {
        Some(chain_id) => parse_felt_arg(chain_id)?,
        None => provider.chain_id().await.map_err(|e| e.to_string())?,
    };
    let account_address = parse_felt_arg(account_address)?;
    let signing_key = SigningKey::from_secret_scalar(parse_felt_arg(private_key)?);
    let mut account = SingleOwnerAccount::new(
        provider,
        LocalWallet::from(signing_key),
        account_address,
        chain_id,
        ExecutionEncoding::New,
    );
    account.set_block_id(BlockId::Tag(BlockTag::Latest));
    Ok(account)
}

fn parse_felt_arg(value: &str) -> Result<Felt, String> {
    parse_felt(value).map_err(|e| e.to_string())
}

fn print_json(value: &Value) -> Result<(), serde_json::Error> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}
