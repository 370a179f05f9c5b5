// Aggregator quote client. Quotes are short-lived: anything past the age
// threshold or with too many route hops is re-requested a bounded number of
// times. If every re-fetch comes back stale we proceed with the last quote
// anyway; an actionable, slightly-stale quote beats blocking the signal.

use crate::error::ExecError;
use async_trait::async_trait;
use log::{debug, warn};
use serde_json::Value;
use std::time::{Duration, Instant};

#[derive(Debug, Clone)]
pub struct QuoteRequest {
    pub input_mint: String,
    pub output_mint: String,
    pub amount: u64,
    pub slippage_bps: u16,
    pub only_direct_routes: bool,
    pub restrict_intermediates: bool,
}

/// An aggregator-issued route, parsed for the fields the executor needs while
/// keeping the raw JSON for the swap-instructions POST.
#[derive(Debug, Clone)]
pub struct Quote {
    pub raw: Value,
    pub in_amount: u64,
    pub out_amount: u64,
    pub price_impact_pct: f64,
    pub hops: usize,
    pub fetched_at: Instant,
}

impl Quote {
    pub fn parse(raw: Value) -> Result<Self, ExecError> {
        Self::parse_with_origin(raw, Instant::now())
    }

    /// `requested_at` is when the quote request was issued, not when the
    /// response arrived; a slow aggregator response already counts against
    /// the freshness window.
    pub fn parse_with_origin(raw: Value, requested_at: Instant) -> Result<Self, ExecError> {
        let in_amount = amount_field(&raw, "inAmount")?;
        let out_amount = amount_field(&raw, "outAmount")?;
        let price_impact_pct = raw
            .get("priceImpactPct")
            .and_then(|v| v.as_str().and_then(|s| s.parse().ok()).or_else(|| v.as_f64()))
            .unwrap_or(0.0);
        let hops = raw
            .get("routePlan")
            .and_then(|v| v.as_array())
            .map(|a| a.len())
            .unwrap_or(0);
        Ok(Quote {
            raw,
            in_amount,
            out_amount,
            price_impact_pct,
            hops,
            fetched_at: requested_at,
        })
    }

    pub fn age(&self) -> Duration {
        self.fetched_at.elapsed()
    }
}

fn amount_field(raw: &Value, name: &str) -> Result<u64, ExecError> {
    raw.get(name)
        .and_then(|v| v.as_str().and_then(|s| s.parse().ok()).or_else(|| v.as_u64()))
        .ok_or_else(|| ExecError::QuoteUnavailable(format!("quote missing {name}")))
}

#[derive(Debug, Clone)]
pub struct QuoteGuardPolicy {
    pub max_age: Duration,
    pub max_hops: usize,
    pub refetch_limit: u32,
}

/// Staleness check. Hop count above the threshold counts as a freshness
/// violation: complex routes fail simulation far more often.
pub fn quote_is_stale(age: Duration, hops: usize, policy: &QuoteGuardPolicy) -> bool {
    age > policy.max_age || hops > policy.max_hops
}

#[async_trait]
pub trait QuoteSource: Send + Sync {
    async fn fresh_quote(&self, req: &QuoteRequest) -> Result<Quote, ExecError>;
}

pub struct JupiterClient {
    http: reqwest::Client,
    base_url: String,
    api_key: Option<String>,
    guard: QuoteGuardPolicy,
}

impl JupiterClient {
    pub fn new(base_url: String, api_key: Option<String>, guard: QuoteGuardPolicy) -> Self {
        Self {
            http: reqwest::Client::new(),
            base_url,
            api_key,
            guard,
        }
    }

    async fn fetch_quote(&self, req: &QuoteRequest) -> Result<Quote, ExecError> {
        let requested_at = Instant::now();
        let amount = req.amount.to_string();
        let slippage = req.slippage_bps.to_string();
        let direct_only = req.only_direct_routes.to_string();
        let restrict = req.restrict_intermediates.to_string();
        let mut request = self
            .http
            .get(format!("{}/quote", self.base_url))
            .query(&[
                ("inputMint", req.input_mint.as_str()),
                ("outputMint", req.output_mint.as_str()),
                ("amount", amount.as_str()),
                ("slippageBps", slippage.as_str()),
                ("swapMode", "ExactIn"),
                ("onlyDirectRoutes", direct_only.as_str()),
                ("restrictIntermediateTokens", restrict.as_str()),
            ])
            .timeout(Duration::from_secs(5));
        if let Some(key) = &self.api_key {
            request = request.header("x-api-key", key);
        }

        let response = request.send().await?;
        let status = response.status();
        if status == reqwest::StatusCode::BAD_REQUEST {
            let body = response.text().await.unwrap_or_default();
            return Err(ExecError::QuoteRejected(body));
        }
        if !status.is_success() {
            return Err(ExecError::QuoteUnavailable(format!("HTTP {status}")));
        }

        let raw: Value = response.json().await?;
        if raw.get("error").is_some() {
            let msg = raw
                .get("error")
                .and_then(|v| v.as_str())
                .unwrap_or("aggregator error")
                .to_string();
            return Err(ExecError::QuoteUnavailable(msg));
        }
        Quote::parse_with_origin(raw, requested_at)
    }

    /// POST the quote back for decomposed swap instructions.
    pub async fn swap_instructions(
        &self,
        quote: &Quote,
        user_pubkey: &str,
        use_shared_accounts: bool,
    ) -> Result<Value, ExecError> {
        let body = serde_json::json!({
            "quoteResponse": quote.raw,
            "userPublicKey": user_pubkey,
            "wrapAndUnwrapSol": true,
            "useSharedAccounts": use_shared_accounts,
        });
        let mut request = self
            .http
            .post(format!("{}/swap-instructions", self.base_url))
            .json(&body)
            .timeout(Duration::from_secs(10));
        if let Some(key) = &self.api_key {
            request = request.header("x-api-key", key);
        }

        let response = request.send().await?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(ExecError::QuoteUnavailable(format!(
                "swap-instructions HTTP {status}: {body}"
            )));
        }
        Ok(response.json().await?)
    }
}

/// Bounded re-fetch loop around any quote fetcher. Kept free of HTTP so the
/// guard policy runs against scripted fetchers in tests.
async fn guarded_quote<F, Fut>(guard: &QuoteGuardPolicy, mut fetch: F) -> Result<Quote, ExecError>
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = Result<Quote, ExecError>>,
{
    let mut quote = fetch().await?;
    let mut refetches = 0;
    while quote_is_stale(quote.age(), quote.hops, guard) && refetches < guard.refetch_limit {
        debug!(
            "quote stale (age {:?}, {} hops), re-requesting ({}/{})",
            quote.age(),
            quote.hops,
            refetches + 1,
            guard.refetch_limit
        );
        refetches += 1;
        match fetch().await {
            Ok(next) => quote = next,
            // Keep the quote we already have over failing outright.
            Err(e) => {
                warn!("quote re-fetch failed, keeping previous quote: {e}");
                break;
            }
        }
    }
    if quote_is_stale(quote.age(), quote.hops, guard) {
        warn!(
            "proceeding with stale quote after {} re-fetches ({} hops)",
            refetches, quote.hops
        );
    }
    Ok(quote)
}

#[async_trait]
impl QuoteSource for JupiterClient {
    async fn fresh_quote(&self, req: &QuoteRequest) -> Result<Quote, ExecError> {
        guarded_quote(&self.guard, || self.fetch_quote(req)).await
    }
}
