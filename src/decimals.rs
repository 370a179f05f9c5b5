// Token decimal resolver. Hot-path lookups hit the in-process cache; cold
// lookups walk a fallback chain that ends at the aggregator's token API.
// Chain: cache -> known table -> on-chain (both token programs) -> Helius DAS
// -> aggregator token API.

use crate::error::ExecError;
use crate::signal::NATIVE_MINT;
use async_trait::async_trait;
use dashmap::DashMap;
use log::{debug, warn};
use once_cell::sync::Lazy;
use solana_client::nonblocking::rpc_client::RpcClient;
use solana_sdk::program_pack::Pack;
use solana_sdk::pubkey::Pubkey;
use spl_token::state::Mint;
use std::str::FromStr;
use std::sync::Arc;
use std::time::{Duration, Instant};

const USDC_MINT: &str = "EPjFWdd5AufqSSqeM2qN1xzybapC8G4wEGGkZwyTDt1v";
const USDT_MINT: &str = "Es9vMFrzaCERmJfrF4H2FYD4KCoNkY11McCe8BenwNYB";

static TOKEN_2022_PROGRAM: Lazy<Pubkey> =
    Lazy::new(|| Pubkey::from_str("TokenzQdBNbLqP5VEhdkAS6EPFLC1PHnBqCXEpPxuEb").unwrap());

#[async_trait]
pub trait DecimalSource: Send + Sync {
    async fn decimals(&self, mint: &str) -> Result<u8, ExecError>;
}

struct CacheEntry {
    decimals: u8,
    cached_at: Instant,
}

pub struct DecimalResolver {
    rpc: Arc<RpcClient>,
    http: reqwest::Client,
    helius_api_key: Option<String>,
    token_api_url: String,
    cache: DashMap<String, CacheEntry>,
    ttl: Duration,
}

impl DecimalResolver {
    pub fn new(
        rpc: Arc<RpcClient>,
        helius_api_key: Option<String>,
        token_api_url: String,
        ttl: Duration,
    ) -> Self {
        Self {
            rpc,
            http: reqwest::Client::new(),
            helius_api_key,
            token_api_url,
            cache: DashMap::new(),
            ttl,
        }
    }

    fn known(mint: &str) -> Option<u8> {
        match mint {
            NATIVE_MINT => Some(9),
            USDC_MINT | USDT_MINT => Some(6),
            _ => None,
        }
    }

    /// On-chain mint account, accepted from either token program. Token-2022
    /// mints keep the legacy 82-byte base layout, so Mint::unpack covers both.
    async fn from_chain(&self, mint: &str) -> Option<u8> {
        let pubkey = Pubkey::from_str(mint).ok()?;
        let account = self.rpc.get_account(&pubkey).await.ok()?;
        if account.owner != spl_token::id() && account.owner != *TOKEN_2022_PROGRAM {
            warn!("mint {} owned by unexpected program {}", mint, account.owner);
            return None;
        }
        if account.data.len() < Mint::LEN {
            return None;
        }
        Mint::unpack_from_slice(&account.data[..Mint::LEN])
            .ok()
            .map(|m| m.decimals)
    }

    /// Helius DAS getAsset lookup.
    async fn from_helius(&self, mint: &str) -> Option<u8> {
        let api_key = self.helius_api_key.as_ref()?;
        let url = format!("https://mainnet.helius-rpc.com/?api-key={api_key}");
        let body = serde_json::json!({
            "jsonrpc": "2.0",
            "id": "decimals",
            "method": "getAsset",
            "params": { "id": mint }
        });
        let response = self
            .http
            .post(&url)
            .json(&body)
            .timeout(Duration::from_secs(3))
            .send()
            .await
            .ok()?
            .json::<serde_json::Value>()
            .await
            .ok()?;
        response
            .pointer("/result/token_info/decimals")
            .and_then(|v| v.as_u64())
            .map(|d| d as u8)
    }

    /// Aggregator token API, the last resort.
    async fn from_token_api(&self, mint: &str) -> Option<u8> {
        let url = format!("{}/{}", self.token_api_url, mint);
        let response = self
            .http
            .get(&url)
            .timeout(Duration::from_secs(3))
            .send()
            .await
            .ok()?
            .json::<serde_json::Value>()
            .await
            .ok()?;
        response.get("decimals").and_then(|v| v.as_u64()).map(|d| d as u8)
    }

    fn cache_put(&self, mint: &str, decimals: u8) -> u8 {
        self.cache.insert(
            mint.to_string(),
            CacheEntry {
                decimals,
                cached_at: Instant::now(),
            },
        );
        decimals
    }
}

#[async_trait]
impl DecimalSource for DecimalResolver {
    async fn decimals(&self, mint: &str) -> Result<u8, ExecError> {
        if let Some(entry) = self.cache.get(mint) {
            if entry.cached_at.elapsed() < self.ttl {
                return Ok(entry.decimals);
            }
        }

        if let Some(d) = Self::known(mint) {
            return Ok(self.cache_put(mint, d));
        }
        if let Some(d) = self.from_chain(mint).await {
            debug!("decimals for {} resolved on-chain: {}", mint, d);
            return Ok(self.cache_put(mint, d));
        }
        if let Some(d) = self.from_helius(mint).await {
            debug!("decimals for {} resolved via Helius: {}", mint, d);
            return Ok(self.cache_put(mint, d));
        }
        if let Some(d) = self.from_token_api(mint).await {
            debug!("decimals for {} resolved via token API: {}", mint, d);
            return Ok(self.cache_put(mint, d));
        }

        Err(ExecError::DecimalsUnresolved(mint.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn known_table_covers_majors() {
        assert_eq!(DecimalResolver::known(NATIVE_MINT), Some(9));
        assert_eq!(DecimalResolver::known(USDC_MINT), Some(6));
        assert_eq!(DecimalResolver::known(USDT_MINT), Some(6));
        assert_eq!(DecimalResolver::known("SomeRandomMint"), None);
    }

    #[tokio::test]
    async fn known_mints_resolve_without_network() {
        let rpc = Arc::new(RpcClient::new("http://127.0.0.1:1".to_string()));
        let resolver = DecimalResolver::new(rpc, None, "http://127.0.0.1:1".into(), Duration::from_secs(60));
        assert_eq!(resolver.decimals(NATIVE_MINT).await.unwrap(), 9);
        // Second hit comes from the cache.
        assert_eq!(resolver.decimals(NATIVE_MINT).await.unwrap(), 9);
        assert_eq!(resolver.cache.len(), 1);
    }
}
