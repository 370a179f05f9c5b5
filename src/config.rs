// Executor configuration - loaded once from .env at startup.

use std::env;

#[derive(Clone)]
pub struct Config {
    // ============================================================================
    // RPC & BROADCAST CONNECTIVITY
    // ============================================================================
    pub rpc_endpoint: String,
    pub fast_sender_url: Option<String>,
    pub fast_tip_accounts: Vec<String>,

    // ============================================================================
    // WALLET & KEYPAIR
    // ============================================================================
    pub wallet_private_key: String,

    // ============================================================================
    // AGGREGATOR (quote + swap-instructions API)
    // ============================================================================
    pub aggregator_base_url: String,
    pub aggregator_api_key: Option<String>,
    pub quote_max_age_ms: u64,
    pub quote_max_hops: usize,
    pub quote_refetch_limit: u32,

    // ============================================================================
    // TOKEN METADATA FALLBACKS
    // ============================================================================
    pub helius_api_key: Option<String>,
    pub token_api_url: String,
    pub decimals_cache_ttl_secs: u64,

    // ============================================================================
    // EXECUTION POLICY
    // ============================================================================
    pub max_attempts: u32,
    pub buy_slippage_bps: u16,
    pub sell_slippage_bps: u16,
    pub slippage_step_bps: u16,
    pub max_slippage_bps: u16,
    pub base_cu_price_micro_lamports: u64,
    pub max_cu_price_micro_lamports: u64,
    pub confirm_timeout_ms: u64,
    pub confirm_poll_interval_ms: u64,
    pub sell_enabled: bool,
    pub sell_balance_fraction: f64,

    // ============================================================================
    // SOLVENCY RESERVES (lamports)
    // ============================================================================
    pub safety_buffer_lamports: u64,
    pub flat_fee_lamports: u64,
    pub default_tip_lamports: u64,
    pub min_tip_lamports: u64,

    // ============================================================================
    // DATABASE (trade log, positions, idempotency claims)
    // ============================================================================
    pub db_host: String,
    pub db_port: u16,
    pub db_name: String,
    pub db_user: String,
    pub db_password: String,

    // ============================================================================
    // HTTP SURFACE
    // ============================================================================
    pub webhook_port: u16,
    pub metrics_port: u16,
}

impl Config {
    pub fn from_env() -> Result<Self, Box<dyn std::error::Error + Send + Sync>> {
        // Check required vars first
        let _wallet_key = env::var("WALLET_PRIVATE_KEY")
            .map_err(|_| "Missing WALLET_PRIVATE_KEY in .env")?;
        let _db_host = env::var("DB_HOST").map_err(|_| "Missing DB_HOST in .env")?;
        let _db_name = env::var("DB_NAME").map_err(|_| "Missing DB_NAME in .env")?;
        let _db_user = env::var("DB_USER").map_err(|_| "Missing DB_USER in .env")?;
        let _db_password = env::var("DB_PASSWORD").map_err(|_| "Missing DB_PASSWORD in .env")?;

        Ok(Config {
            // RPC & Broadcast
            rpc_endpoint: env::var("RPC_ENDPOINT")
                .unwrap_or_else(|_| "https://api.mainnet-beta.solana.com".to_string()),
            fast_sender_url: env::var("FAST_SENDER_URL").ok().filter(|s| !s.is_empty()),
            fast_tip_accounts: env::var("FAST_TIP_ACCOUNTS")
                .unwrap_or_else(|_| {
                    // Public tip accounts for the premium sender lane.
                    "96gYZGLnJYVFmbjzopPSU6QiEV5fGqZNyN9nmNhvrZU5,\
                     HFqU5x63VTqvQss8hp11i4wVV8bD44PvwucfZ2bU7gRe,\
                     Cw8CFyM9FkoMi7K7Crf6HNQqf4uEMzpKw6QNghXLvLkY,\
                     ADaUMid9yfUytqMBgopwjb2DTLSokTSzL1zt6iGPaS49"
                        .to_string()
                })
                .split(',')
                .map(|s| s.trim().to_string())
                .filter(|s| !s.is_empty())
                .collect(),

            // Wallet
            wallet_private_key: env::var("WALLET_PRIVATE_KEY")?,

            // Aggregator
            aggregator_base_url: env::var("AGGREGATOR_BASE_URL")
                .unwrap_or_else(|_| "https://quote-api.jup.ag/v6".to_string()),
            aggregator_api_key: env::var("AGGREGATOR_API_KEY").ok().filter(|s| !s.is_empty()),
            quote_max_age_ms: env::var("QUOTE_MAX_AGE_MS")
                .unwrap_or_else(|_| "1500".to_string())
                .parse()?,
            quote_max_hops: env::var("QUOTE_MAX_HOPS")
                .unwrap_or_else(|_| "3".to_string())
                .parse()?,
            quote_refetch_limit: env::var("QUOTE_REFETCH_LIMIT")
                .unwrap_or_else(|_| "2".to_string())
                .parse()?,

            // Token metadata
            helius_api_key: env::var("HELIUS_API_KEY").ok().filter(|s| !s.is_empty()),
            token_api_url: env::var("TOKEN_API_URL")
                .unwrap_or_else(|_| "https://tokens.jup.ag/token".to_string()),
            decimals_cache_ttl_secs: env::var("DECIMALS_CACHE_TTL_SECS")
                .unwrap_or_else(|_| "3600".to_string())
                .parse()?,

            // Execution policy
            max_attempts: env::var("MAX_ATTEMPTS")
                .unwrap_or_else(|_| "3".to_string())
                .parse()?,
            buy_slippage_bps: env::var("BUY_SLIPPAGE_BPS")
                .unwrap_or_else(|_| "100".to_string())
                .parse()?,
            sell_slippage_bps: env::var("SELL_SLIPPAGE_BPS")
                .unwrap_or_else(|_| "250".to_string())
                .parse()?,
            slippage_step_bps: env::var("SLIPPAGE_STEP_BPS")
                .unwrap_or_else(|_| "150".to_string())
                .parse()?,
            max_slippage_bps: env::var("MAX_SLIPPAGE_BPS")
                .unwrap_or_else(|_| "1500".to_string())
                .parse()?,
            base_cu_price_micro_lamports: env::var("BASE_CU_PRICE_MICRO_LAMPORTS")
                .unwrap_or_else(|_| "10000".to_string())
                .parse()?,
            max_cu_price_micro_lamports: env::var("MAX_CU_PRICE_MICRO_LAMPORTS")
                .unwrap_or_else(|_| "150000".to_string())
                .parse()?,
            confirm_timeout_ms: env::var("CONFIRM_TIMEOUT_MS")
                .unwrap_or_else(|_| "30000".to_string())
                .parse()?,
            confirm_poll_interval_ms: env::var("CONFIRM_POLL_INTERVAL_MS")
                .unwrap_or_else(|_| "1000".to_string())
                .parse()?,
            sell_enabled: env::var("SELL_ENABLED")
                .unwrap_or_else(|_| "true".to_string())
                .parse()?,
            sell_balance_fraction: env::var("SELL_BALANCE_FRACTION")
                .unwrap_or_else(|_| "0.9999".to_string())
                .parse()?,

            // Solvency reserves
            safety_buffer_lamports: env::var("SAFETY_BUFFER_LAMPORTS")
                .unwrap_or_else(|_| "5000000".to_string())
                .parse()?,
            flat_fee_lamports: env::var("FLAT_FEE_LAMPORTS")
                .unwrap_or_else(|_| "5000".to_string())
                .parse()?,
            default_tip_lamports: env::var("DEFAULT_TIP_LAMPORTS")
                .unwrap_or_else(|_| "1000000".to_string())
                .parse()?,
            min_tip_lamports: env::var("MIN_TIP_LAMPORTS")
                .unwrap_or_else(|_| "100000".to_string())
                .parse()?,

            // Database
            db_host: env::var("DB_HOST")?,
            db_port: env::var("DB_PORT")
                .unwrap_or_else(|_| "5432".to_string())
                .parse()?,
            db_name: env::var("DB_NAME")?,
            db_user: env::var("DB_USER")?,
            db_password: env::var("DB_PASSWORD")?,

            // HTTP surface
            webhook_port: env::var("WEBHOOK_PORT")
                .unwrap_or_else(|_| "8080".to_string())
                .parse()?,
            metrics_port: env::var("METRICS_PORT")
                .unwrap_or_else(|_| "9878".to_string())
                .parse()?,
        })
    }
}
