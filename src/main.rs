// ============================================================================
// SIGNAL EXECUTOR - Webhook-Triggered Swap Execution
// Receives BUY/SELL signals over HTTP, executes them through the aggregator
// ============================================================================

mod broadcast;
mod builder;
mod config;
mod decimals;
mod error;
mod executor;
mod metrics;
mod quote;
mod signal;
mod store;
mod wallet;
mod webhook;

use crate::broadcast::BroadcastEngine;
use crate::builder::SwapPipeline;
use crate::decimals::DecimalResolver;
use crate::executor::{ExecPolicy, ExecutionContext};
use crate::quote::{JupiterClient, QuoteGuardPolicy};
use crate::store::PgStore;
use crate::wallet::RpcWallet;
use crate::webhook::AppState;
use log::{error, info, warn};
use solana_client::nonblocking::rpc_client::RpcClient;
use solana_sdk::pubkey::Pubkey;
use solana_sdk::signature::Keypair;
use solana_sdk::signer::Signer;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    // Initialize logger
    env_logger::init();

    // Initialize metrics
    metrics::init();

    info!("━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━");
    info!("🤖 SIGNAL EXECUTOR - Webhook-Triggered Swap Execution");
    info!("━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━");

    // Load .env file
    dotenv::dotenv().ok();

    // Load configuration
    let config = config::Config::from_env()?;
    info!("✅ Configuration: Loaded from .env");
    info!("   RPC: {}", config.rpc_endpoint);
    info!("   Aggregator: {}", config.aggregator_base_url);
    info!(
        "   Attempts: {} | Slippage: {}-{} bps | CU price: {}-{} µLamports",
        config.max_attempts,
        config.buy_slippage_bps,
        config.max_slippage_bps,
        config.base_cu_price_micro_lamports,
        config.max_cu_price_micro_lamports
    );

    // Wallet
    let keypair = Arc::new(load_keypair_from_string(&config.wallet_private_key)?);
    info!("💰 Wallet: {}", keypair.pubkey());

    // Database (idempotency claims, trade log, positions)
    let store = Arc::new(
        PgStore::connect(
            &config.db_host,
            config.db_port,
            &config.db_name,
            &config.db_user,
            &config.db_password,
        )
        .await?,
    );
    info!("✅ Database: Connected to {}", config.db_host);

    // RPC client, shared between wallet, builder, and broadcast
    let rpc = Arc::new(RpcClient::new(config.rpc_endpoint.clone()));
    match rpc.get_balance(&keypair.pubkey()).await {
        Ok(lamports) => info!("   Balance: {:.4} SOL", lamports as f64 / 1e9),
        Err(e) => warn!("   Balance check failed at startup: {}", e),
    }

    // Aggregator client with quote freshness guard
    let jupiter = Arc::new(JupiterClient::new(
        config.aggregator_base_url.clone(),
        config.aggregator_api_key.clone(),
        QuoteGuardPolicy {
            max_age: Duration::from_millis(config.quote_max_age_ms),
            max_hops: config.quote_max_hops,
            refetch_limit: config.quote_refetch_limit,
        },
    ));

    // Broadcast engine: standard RPC plus the optional fast lane
    let fast_lane_enabled = config.fast_sender_url.is_some();
    if let Some(url) = &config.fast_sender_url {
        info!("🚀 Fast sender lane: {}", url);
    } else {
        info!("   Fast sender lane: disabled (standard RPC only)");
    }
    let broadcast = Arc::new(BroadcastEngine::new(
        rpc.clone(),
        config.fast_sender_url.clone(),
        Duration::from_millis(config.confirm_timeout_ms),
        Duration::from_millis(config.confirm_poll_interval_ms),
    ));

    let tip_accounts: Vec<Pubkey> = config
        .fast_tip_accounts
        .iter()
        .filter_map(|a| match Pubkey::from_str(a) {
            Ok(key) => Some(key),
            Err(e) => {
                warn!("skipping bad tip account {}: {}", a, e);
                None
            }
        })
        .collect();

    let pipeline = Arc::new(SwapPipeline::new(
        rpc.clone(),
        jupiter.clone(),
        broadcast,
        keypair.clone(),
        tip_accounts,
        fast_lane_enabled,
    ));

    let decimals = Arc::new(DecimalResolver::new(
        rpc.clone(),
        config.helius_api_key.clone(),
        config.token_api_url.clone(),
        Duration::from_secs(config.decimals_cache_ttl_secs),
    ));

    let wallet = Arc::new(RpcWallet::new(rpc.clone(), keypair.pubkey()));

    let ctx = Arc::new(ExecutionContext {
        store,
        quotes: jupiter,
        pipeline,
        wallet,
        decimals,
        policy: ExecPolicy::from_config(&config),
    });

    // Metrics server on its own port
    let metrics_port = config.metrics_port;
    tokio::spawn(async move {
        if let Err(e) = metrics::start_metrics_server(metrics_port).await {
            error!("Metrics server failed: {}", e);
        }
    });

    // Webhook server carries the process
    webhook::serve(Arc::new(AppState { ctx }), config.webhook_port).await?;
    Ok(())
}

// Helper to load keypair from various formats
fn load_keypair_from_string(
    private_key: &str,
) -> Result<Keypair, Box<dyn std::error::Error + Send + Sync>> {
    // Try base58
    if let Ok(bytes) = bs58::decode(private_key).into_vec() {
        if bytes.len() == 64 {
            return Ok(Keypair::try_from(bytes.as_slice())?);
        }
    }

    // Try JSON array
    if private_key.starts_with('[') {
        let bytes: Vec<u8> = serde_json::from_str(private_key)?;
        if bytes.len() == 64 {
            return Ok(Keypair::try_from(bytes.as_slice())?);
        }
    }

    Err("Invalid private key format".into())
}
