// Swap execution core: sizing, quoting, and the retry/escalation policy.
//
// One signal runs as one strictly-sequential attempt series. Attempt
// parameters are escalated, never mutated in place: slippage and priority fee
// only go up, route restriction only tightens. Every terminal outcome is
// persisted and the idempotency claim resolved before control returns.

use crate::config::Config;
use crate::decimals::DecimalSource;
use crate::error::{ExecError, FailureClass};
use crate::metrics;
use crate::quote::{Quote, QuoteRequest, QuoteSource};
use crate::signal::{ui_to_minor, Action, TradeSignal, NATIVE_MINT};
use crate::store::{OutcomeStore, Position, PositionExit, PositionStatus, TradeLogEntry};
use crate::wallet::{compute_spendable, Reserves, WalletView};
use async_trait::async_trait;
use chrono::Utc;
use log::{error, info, warn};
use std::sync::Arc;
use std::time::Instant;

/// Tunable execution policy, fixed for the process lifetime.
#[derive(Debug, Clone)]
pub struct ExecPolicy {
    pub max_attempts: u32,
    pub buy_slippage_bps: u16,
    pub sell_slippage_bps: u16,
    pub slippage_step_bps: u16,
    pub max_slippage_bps: u16,
    pub base_cu_price: u64,
    pub max_cu_price: u64,
    pub sell_enabled: bool,
    pub sell_balance_fraction: f64,
    pub reserves: Reserves,
}

impl ExecPolicy {
    pub fn from_config(config: &Config) -> Self {
        Self {
            max_attempts: config.max_attempts.max(1),
            buy_slippage_bps: config.buy_slippage_bps,
            sell_slippage_bps: config.sell_slippage_bps,
            slippage_step_bps: config.slippage_step_bps,
            max_slippage_bps: config.max_slippage_bps,
            base_cu_price: config.base_cu_price_micro_lamports,
            max_cu_price: config.max_cu_price_micro_lamports,
            sell_enabled: config.sell_enabled,
            sell_balance_fraction: config.sell_balance_fraction,
            reserves: Reserves {
                safety_buffer_lamports: config.safety_buffer_lamports,
                flat_fee_lamports: config.flat_fee_lamports,
                default_tip_lamports: config.default_tip_lamports,
                min_tip_lamports: config.min_tip_lamports,
            },
        }
    }
}

/// Parameters of one execution attempt. Escalates monotonically: fee and
/// slippage never decrease, restriction flags never loosen.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AttemptParams {
    pub slippage_bps: u16,
    pub cu_price_micro_lamports: u64,
    pub use_shared_accounts: bool,
    pub direct_only: bool,
    pub restrict_intermediates: bool,
    pub tip_lamports: u64,
}

impl AttemptParams {
    pub fn initial(action: Action, policy: &ExecPolicy, tip_lamports: u64) -> Self {
        let slippage_bps = match action {
            Action::Buy => policy.buy_slippage_bps,
            // Exits tolerate more slippage; leaving a volatile position beats
            // being stuck in it.
            Action::Sell => policy.sell_slippage_bps,
        };
        Self {
            slippage_bps,
            cu_price_micro_lamports: policy.base_cu_price,
            use_shared_accounts: true,
            direct_only: false,
            restrict_intermediates: false,
            tip_lamports,
        }
    }

    pub fn escalated(&self, class: FailureClass, policy: &ExecPolicy) -> Self {
        let bump_slippage = |s: u16| {
            s.saturating_add(policy.slippage_step_bps)
                .min(policy.max_slippage_bps)
                .max(s)
        };
        let bump_fee = |f: u64| f.saturating_mul(2).min(policy.max_cu_price).max(f);

        let mut next = self.clone();
        match class {
            FailureClass::SlippageExceeded => {
                next.slippage_bps = bump_slippage(next.slippage_bps);
            }
            FailureClass::Simulation => {
                next.slippage_bps = bump_slippage(next.slippage_bps);
                next.cu_price_micro_lamports = bump_fee(next.cu_price_micro_lamports);
                next.use_shared_accounts = false;
            }
            // Old quote and blockhash are stale; the re-quote happens anyway
            // at the top of every attempt, so only the fee escalates here.
            FailureClass::Expired => {
                next.cu_price_micro_lamports = bump_fee(next.cu_price_micro_lamports);
            }
            FailureClass::RouteProgram => {
                next.use_shared_accounts = false;
                next.direct_only = true;
                next.restrict_intermediates = true;
            }
            FailureClass::QuoteRejected => {
                next.direct_only = true;
            }
            FailureClass::Fatal => {}
        }
        next
    }
}

/// Terminal success record for one signal.
#[derive(Debug, Clone)]
pub struct ExecResult {
    pub signature: String,
    pub in_amount: u64,
    pub out_amount: u64,
    pub price_impact_pct: f64,
    pub slippage_bps: u16,
    pub cu_price_micro_lamports: u64,
    pub attempts: u32,
}

#[derive(Debug)]
pub enum SignalOutcome {
    Executed(ExecResult),
    /// The claim key was already taken. A normal, logged no-op.
    Duplicate,
}

/// Build + simulate + broadcast + confirm for one attempt. Production impl is
/// `builder::SwapPipeline`; tests substitute a scripted mock.
#[async_trait]
pub trait TxPipeline: Send + Sync {
    async fn execute(
        &self,
        quote: &Quote,
        params: &AttemptParams,
        signal: &TradeSignal,
    ) -> Result<String, ExecError>;
}

/// Everything a signal execution needs, constructed once at process start and
/// threaded through explicitly so the core is testable with mock contexts.
pub struct ExecutionContext {
    pub store: Arc<dyn OutcomeStore>,
    pub quotes: Arc<dyn QuoteSource>,
    pub pipeline: Arc<dyn TxPipeline>,
    pub wallet: Arc<dyn WalletView>,
    pub decimals: Arc<dyn DecimalSource>,
    pub policy: ExecPolicy,
}

/// Entry point: claim the signal, then run it. A losing claim is a no-op.
pub async fn execute_signal(
    ctx: &ExecutionContext,
    signal: &TradeSignal,
) -> Result<SignalOutcome, ExecError> {
    if !ctx.store.claim_signal(&signal.claim_key()).await? {
        info!("duplicate signal {} ignored", signal.signal_id);
        metrics::get().signals_duplicate.inc();
        return Ok(SignalOutcome::Duplicate);
    }
    run_claimed(ctx, signal).await.map(SignalOutcome::Executed)
}

/// Run a signal whose claim is already held. Resolves the claim to
/// success/failed on every path.
pub async fn run_claimed(
    ctx: &ExecutionContext,
    signal: &TradeSignal,
) -> Result<ExecResult, ExecError> {
    let started = Instant::now();
    let result = run_attempt_series(ctx, signal).await;

    let outcome = if result.is_ok() { "success" } else { "failed" };
    if let Err(e) = ctx.store.resolve_claim(&signal.claim_key(), outcome).await {
        metrics::get().db_errors.inc();
        error!("claim resolution failed for {}: {}", signal.signal_id, e);
    }
    match &result {
        Ok(res) => {
            metrics::get().trades_success.inc();
            info!(
                "signal {} executed in {} attempt(s), {:.1}s: sig={} out={}",
                signal.signal_id,
                res.attempts,
                started.elapsed().as_secs_f64(),
                res.signature,
                res.out_amount
            );
        }
        Err(e) => {
            metrics::get().trades_failed.inc();
            error!("signal {} failed terminally: {}", signal.signal_id, e);
        }
    }
    metrics::get()
        .execution_seconds
        .observe(started.elapsed().as_secs_f64());
    result
}

async fn run_attempt_series(
    ctx: &ExecutionContext,
    signal: &TradeSignal,
) -> Result<ExecResult, ExecError> {
    // SELL gate: must target an open position, checked before any quote.
    let position = match signal.action {
        Action::Sell => {
            let pos = ctx.store.open_position(&signal.signal_id).await?;
            match pos {
                Some(p) => Some(p),
                None => {
                    let err = ExecError::PositionNotOpen(signal.signal_id.clone());
                    record_terminal_failure(ctx, signal, 0, 0, None, &err).await;
                    return Err(err);
                }
            }
        }
        Action::Buy => None,
    };

    let (amount, tip_lamports) = match size_trade(ctx, signal).await {
        Ok(sized) => sized,
        Err(e) => {
            record_terminal_failure(ctx, signal, 0, 0, None, &e).await;
            return Err(e);
        }
    };

    let mut params = AttemptParams::initial(signal.action, &ctx.policy, tip_lamports);
    let mut last_err: Option<ExecError> = None;

    for attempt in 1..=ctx.policy.max_attempts {
        metrics::get().attempts_total.inc();
        info!(
            "attempt {}/{} for {}: amount={} slippage={}bps cu_price={} direct_only={}",
            attempt,
            ctx.policy.max_attempts,
            signal.signal_id,
            amount,
            params.slippage_bps,
            params.cu_price_micro_lamports,
            params.direct_only
        );

        let request = QuoteRequest {
            input_mint: signal.input_mint.clone(),
            output_mint: signal.output_mint.clone(),
            amount,
            slippage_bps: params.slippage_bps,
            only_direct_routes: params.direct_only,
            restrict_intermediates: params.restrict_intermediates,
        };

        let attempt_result = match ctx.quotes.fresh_quote(&request).await {
            Ok(quote) => match ctx.pipeline.execute(&quote, &params, signal).await {
                Ok(signature) => Ok((signature, quote)),
                Err(e) => Err(e),
            },
            Err(e) => Err(e),
        };

        match attempt_result {
            Ok((signature, quote)) => {
                let result = ExecResult {
                    signature: signature.clone(),
                    in_amount: quote.in_amount,
                    out_amount: quote.out_amount,
                    price_impact_pct: quote.price_impact_pct,
                    slippage_bps: params.slippage_bps,
                    cu_price_micro_lamports: params.cu_price_micro_lamports,
                    attempts: attempt,
                };
                record_fire_and_forget(
                    ctx,
                    &TradeLogEntry {
                        signal_id: signal.signal_id.clone(),
                        action: signal.action.as_str().to_string(),
                        attempt,
                        status: "success".into(),
                        signature: Some(signature),
                        in_amount: quote.in_amount,
                        out_amount: Some(quote.out_amount),
                        price_impact_pct: Some(quote.price_impact_pct),
                        slippage_bps: params.slippage_bps,
                        cu_price_micro_lamports: params.cu_price_micro_lamports,
                        error: None,
                        terminal: true,
                    },
                )
                .await;
                settle_position(ctx, signal, position.as_ref(), &result).await;
                return Ok(result);
            }
            Err(e) => {
                let class = e.class();
                warn!(
                    "attempt {} for {} failed ({:?}): {}",
                    attempt, signal.signal_id, class, e
                );
                let terminal = !e.is_retryable() || attempt == ctx.policy.max_attempts;
                record_fire_and_forget(
                    ctx,
                    &TradeLogEntry {
                        signal_id: signal.signal_id.clone(),
                        action: signal.action.as_str().to_string(),
                        attempt,
                        status: "failed".into(),
                        signature: None,
                        in_amount: amount,
                        out_amount: None,
                        price_impact_pct: None,
                        slippage_bps: params.slippage_bps,
                        cu_price_micro_lamports: params.cu_price_micro_lamports,
                        error: Some(e.to_string()),
                        terminal,
                    },
                )
                .await;
                if terminal {
                    return Err(e);
                }
                params = params.escalated(class, &ctx.policy);
                last_err = Some(e);
            }
        }
    }

    // Unreachable: the loop always returns on its final pass. Kept for the
    // type checker.
    Err(last_err.unwrap_or_else(|| ExecError::BroadcastFailed("attempt budget exhausted".into())))
}

/// Size the trade in the input mint's minor units and budget the fast-lane
/// tip from wallet solvency.
async fn size_trade(ctx: &ExecutionContext, signal: &TradeSignal) -> Result<(u64, u64), ExecError> {
    match signal.action {
        Action::Buy => {
            let in_decimals = ctx.decimals.decimals(&signal.input_mint).await?;
            let requested = ui_to_minor(signal.input_amount, in_decimals);

            let lamports = ctx.wallet.lamports().await?;
            let needs_token_account = ctx.wallet.needs_token_account(&signal.output_mint).await?;
            let plan = compute_spendable(lamports, needs_token_account, &ctx.policy.reserves)?;

            // Only native-SOL spends are bounded by the lamport plan; the tip
            // budget applies either way.
            let amount = if signal.input_mint == NATIVE_MINT && requested > plan.spendable_lamports
            {
                warn!(
                    "BUY {} clipped: requested {} > spendable {} lamports",
                    signal.signal_id, requested, plan.spendable_lamports
                );
                plan.spendable_lamports
            } else {
                requested
            };
            Ok((amount, plan.tip_lamports))
        }
        Action::Sell => {
            // Sell what the chain says we hold, not what the caller claims.
            let balance = ctx.wallet.token_balance(&signal.input_mint).await?;
            let amount = (balance as f64 * ctx.policy.sell_balance_fraction) as u64;
            if amount == 0 {
                return Err(ExecError::InsufficientFunds(format!(
                    "no {} balance to sell",
                    signal.input_mint
                )));
            }
            let lamports = ctx.wallet.lamports().await?;
            let plan = compute_spendable(lamports, false, &ctx.policy.reserves)?;
            Ok((amount, plan.tip_lamports))
        }
    }
}

/// Position bookkeeping after a confirmed swap. Fire-and-forget: a store
/// failure is logged, never propagated into the trade outcome.
async fn settle_position(
    ctx: &ExecutionContext,
    signal: &TradeSignal,
    open: Option<&Position>,
    result: &ExecResult,
) {
    match signal.action {
        Action::Buy => {
            let position = Position {
                signal_id: signal.signal_id.clone(),
                mint: signal.output_mint.clone(),
                status: PositionStatus::Open,
                entry_in_amount: result.in_amount,
                entry_out_amount: result.out_amount,
                entry_signature: result.signature.clone(),
                opened_at: Utc::now(),
            };
            if let Err(e) = ctx.store.upsert_position(&position).await {
                metrics::get().db_errors.inc();
                error!("position upsert failed for {}: {}", signal.signal_id, e);
            }
        }
        Action::Sell => {
            let signal_id = open
                .map(|p| p.signal_id.as_str())
                .unwrap_or(signal.signal_id.as_str());
            let exit = PositionExit {
                exit_signature: result.signature.clone(),
                exit_out_amount: result.out_amount,
                closed_at: Utc::now(),
            };
            if let Err(e) = ctx.store.close_position(signal_id, &exit).await {
                metrics::get().db_errors.inc();
                error!("position close failed for {}: {}", signal_id, e);
            }
        }
    }
}

async fn record_fire_and_forget(ctx: &ExecutionContext, entry: &TradeLogEntry) {
    if let Err(e) = ctx.store.record_attempt(entry).await {
        metrics::get().db_errors.inc();
        error!("trade log write failed for {}: {}", entry.signal_id, e);
    }
}

async fn record_terminal_failure(
    ctx: &ExecutionContext,
    signal: &TradeSignal,
    attempt: u32,
    in_amount: u64,
    signature: Option<String>,
    err: &ExecError,
) {
    record_fire_and_forget(
        ctx,
        &TradeLogEntry {
            signal_id: signal.signal_id.clone(),
            action: signal.action.as_str().to_string(),
            attempt,
            status: "failed".into(),
            signature,
            in_amount,
            out_amount: None,
            price_impact_pct: None,
            slippage_bps: 0,
            cu_price_micro_lamports: 0,
            error: Some(err.to_string()),
            terminal: true,
        },
    )
    .await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::collections::{HashMap, HashSet, VecDeque};
    use std::sync::Mutex;
    use std::time::Instant;

    // ------------------------------------------------------------------
    // Mock collaborators
    // ------------------------------------------------------------------

    #[derive(Default)]
    struct MockStore {
        claims: Mutex<HashSet<String>>,
        positions: Mutex<HashMap<String, Position>>,
        log: Mutex<Vec<TradeLogEntry>>,
        resolved: Mutex<Vec<(String, String)>>,
        fail_log_writes: std::sync::atomic::AtomicBool,
    }

    impl MockStore {
        fn with_open_position(self, signal_id: &str, mint: &str) -> Self {
            self.positions.lock().unwrap().insert(
                signal_id.to_string(),
                Position {
                    signal_id: signal_id.to_string(),
                    mint: mint.to_string(),
                    status: PositionStatus::Open,
                    entry_in_amount: 1_000,
                    entry_out_amount: 2_000,
                    entry_signature: "entry-sig".into(),
                    opened_at: Utc::now(),
                },
            );
            self
        }
    }

    #[async_trait]
    impl OutcomeStore for MockStore {
        async fn claim_signal(&self, claim_key: &str) -> Result<bool, ExecError> {
            Ok(self.claims.lock().unwrap().insert(claim_key.to_string()))
        }

        async fn resolve_claim(&self, claim_key: &str, outcome: &str) -> Result<(), ExecError> {
            self.resolved
                .lock()
                .unwrap()
                .push((claim_key.to_string(), outcome.to_string()));
            Ok(())
        }

        async fn open_position(&self, signal_id: &str) -> Result<Option<Position>, ExecError> {
            Ok(self
                .positions
                .lock()
                .unwrap()
                .get(signal_id)
                .filter(|p| p.status == PositionStatus::Open)
                .cloned())
        }

        async fn record_attempt(&self, entry: &TradeLogEntry) -> Result<(), ExecError> {
            if self.fail_log_writes.load(std::sync::atomic::Ordering::SeqCst) {
                return Err(ExecError::Store("trade_log unavailable".into()));
            }
            self.log.lock().unwrap().push(entry.clone());
            Ok(())
        }

        async fn upsert_position(&self, position: &Position) -> Result<(), ExecError> {
            self.positions
                .lock()
                .unwrap()
                .insert(position.signal_id.clone(), position.clone());
            Ok(())
        }

        async fn close_position(
            &self,
            signal_id: &str,
            _exit: &PositionExit,
        ) -> Result<(), ExecError> {
            if let Some(p) = self.positions.lock().unwrap().get_mut(signal_id) {
                p.status = PositionStatus::Closed;
            }
            Ok(())
        }
    }

    #[derive(Default)]
    struct MockQuotes {
        requests: Mutex<Vec<QuoteRequest>>,
    }

    #[async_trait]
    impl QuoteSource for MockQuotes {
        async fn fresh_quote(&self, req: &QuoteRequest) -> Result<Quote, ExecError> {
            self.requests.lock().unwrap().push(req.clone());
            Ok(Quote {
                raw: json!({"inAmount": req.amount.to_string()}),
                in_amount: req.amount,
                out_amount: req.amount * 2,
                price_impact_pct: 0.001,
                hops: 1,
                fetched_at: Instant::now(),
            })
        }
    }

    /// Scripted pipeline: pops the next result per call and records the
    /// attempt parameters it saw.
    struct MockPipeline {
        script: Mutex<VecDeque<Result<String, ExecError>>>,
        seen_params: Mutex<Vec<AttemptParams>>,
    }

    impl MockPipeline {
        fn new(script: Vec<Result<String, ExecError>>) -> Self {
            Self {
                script: Mutex::new(script.into()),
                seen_params: Mutex::new(Vec::new()),
            }
        }
    }

    #[async_trait]
    impl TxPipeline for MockPipeline {
        async fn execute(
            &self,
            _quote: &Quote,
            params: &AttemptParams,
            _signal: &TradeSignal,
        ) -> Result<String, ExecError> {
            self.seen_params.lock().unwrap().push(params.clone());
            self.script
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or_else(|| Err(ExecError::BroadcastFailed("script exhausted".into())))
        }
    }

    struct MockWallet {
        lamports: u64,
        token_balance: u64,
        needs_token_account: bool,
    }

    #[async_trait]
    impl WalletView for MockWallet {
        async fn lamports(&self) -> Result<u64, ExecError> {
            Ok(self.lamports)
        }
        async fn token_balance(&self, _mint: &str) -> Result<u64, ExecError> {
            Ok(self.token_balance)
        }
        async fn needs_token_account(&self, _mint: &str) -> Result<bool, ExecError> {
            Ok(self.needs_token_account)
        }
    }

    struct MockDecimals;

    #[async_trait]
    impl DecimalSource for MockDecimals {
        async fn decimals(&self, mint: &str) -> Result<u8, ExecError> {
            Ok(if mint == NATIVE_MINT { 9 } else { 6 })
        }
    }

    // ------------------------------------------------------------------
    // Fixtures
    // ------------------------------------------------------------------

    fn policy() -> ExecPolicy {
        ExecPolicy {
            max_attempts: 3,
            buy_slippage_bps: 100,
            sell_slippage_bps: 250,
            slippage_step_bps: 150,
            max_slippage_bps: 1500,
            base_cu_price: 10_000,
            max_cu_price: 150_000,
            sell_enabled: true,
            sell_balance_fraction: 0.9999,
            reserves: Reserves {
                safety_buffer_lamports: 5_000_000,
                flat_fee_lamports: 5_000,
                default_tip_lamports: 1_000_000,
                min_tip_lamports: 100_000,
            },
        }
    }

    fn ctx_with(
        store: MockStore,
        pipeline: MockPipeline,
        wallet: MockWallet,
    ) -> (ExecutionContext, Arc<MockStore>, Arc<MockQuotes>, Arc<MockPipeline>) {
        let store = Arc::new(store);
        let quotes = Arc::new(MockQuotes::default());
        let pipeline = Arc::new(pipeline);
        let ctx = ExecutionContext {
            store: store.clone(),
            quotes: quotes.clone(),
            pipeline: pipeline.clone(),
            wallet: Arc::new(wallet),
            decimals: Arc::new(MockDecimals),
            policy: policy(),
        };
        (ctx, store, quotes, pipeline)
    }

    fn buy_signal(signal_id: &str, amount_sol: f64) -> TradeSignal {
        TradeSignal {
            action: Action::Buy,
            signal_id: signal_id.to_string(),
            input_mint: NATIVE_MINT.to_string(),
            output_mint: "TOKENX".to_string(),
            input_amount: amount_sol,
            symbol: None,
        }
    }

    fn sell_signal(signal_id: &str) -> TradeSignal {
        TradeSignal {
            action: Action::Sell,
            signal_id: signal_id.to_string(),
            input_mint: "TOKENX".to_string(),
            output_mint: NATIVE_MINT.to_string(),
            input_amount: 1.0,
            symbol: None,
        }
    }

    fn rich_wallet() -> MockWallet {
        MockWallet {
            lamports: 10_000_000_000, // 10 SOL
            token_balance: 5_000_000,
            needs_token_account: false,
        }
    }

    // ------------------------------------------------------------------
    // Escalation unit tests
    // ------------------------------------------------------------------

    #[test]
    fn slippage_escalation_is_monotone_and_capped() {
        let p = policy();
        let mut params = AttemptParams::initial(Action::Buy, &p, 0);
        for _ in 0..20 {
            let next = params.escalated(FailureClass::SlippageExceeded, &p);
            assert!(next.slippage_bps >= params.slippage_bps);
            assert!(next.slippage_bps <= p.max_slippage_bps);
            params = next;
        }
        assert_eq!(params.slippage_bps, p.max_slippage_bps);
    }

    #[test]
    fn simulation_failure_disables_shared_accounts_and_bumps_both() {
        let p = policy();
        let initial = AttemptParams::initial(Action::Buy, &p, 0);
        let next = initial.escalated(FailureClass::Simulation, &p);
        assert!(next.slippage_bps > initial.slippage_bps);
        assert!(next.cu_price_micro_lamports > initial.cu_price_micro_lamports);
        assert!(!next.use_shared_accounts);
    }

    #[test]
    fn route_failure_tightens_restrictions_only() {
        let p = policy();
        let initial = AttemptParams::initial(Action::Buy, &p, 0);
        let next = initial.escalated(FailureClass::RouteProgram, &p);
        assert!(!next.use_shared_accounts);
        assert!(next.direct_only);
        assert!(next.restrict_intermediates);
        // Restrictions never loosen on later escalations.
        let after = next.escalated(FailureClass::SlippageExceeded, &p);
        assert!(after.direct_only && after.restrict_intermediates && !after.use_shared_accounts);
    }

    #[test]
    fn quote_rejection_forces_direct_only() {
        let p = policy();
        let next =
            AttemptParams::initial(Action::Buy, &p, 0).escalated(FailureClass::QuoteRejected, &p);
        assert!(next.direct_only);
    }

    #[test]
    fn fee_escalation_never_decreases_at_cap() {
        let p = policy();
        let mut params = AttemptParams::initial(Action::Buy, &p, 0);
        for _ in 0..10 {
            let next = params.escalated(FailureClass::Expired, &p);
            assert!(next.cu_price_micro_lamports >= params.cu_price_micro_lamports);
            params = next;
        }
        assert_eq!(params.cu_price_micro_lamports, p.max_cu_price);
    }

    // ------------------------------------------------------------------
    // End-to-end scenarios against mocks
    // ------------------------------------------------------------------

    #[tokio::test]
    async fn scenario_a_buy_succeeds_first_attempt() {
        let (ctx, store, quotes, pipeline) = ctx_with(
            MockStore::default(),
            MockPipeline::new(vec![Ok("sig-1".into())]),
            rich_wallet(),
        );
        let signal = buy_signal("s1", 0.5);

        let outcome = execute_signal(&ctx, &signal).await.unwrap();
        let result = match outcome {
            SignalOutcome::Executed(r) => r,
            other => panic!("expected execution, got {other:?}"),
        };

        assert_eq!(result.signature, "sig-1");
        assert_eq!(result.attempts, 1);
        assert_eq!(quotes.requests.lock().unwrap().len(), 1);
        assert_eq!(pipeline.seen_params.lock().unwrap().len(), 1);

        // One open position for s1 on TOKENX.
        let positions = store.positions.lock().unwrap();
        let pos = positions.get("s1").expect("position recorded");
        assert_eq!(pos.mint, "TOKENX");
        assert_eq!(pos.status, PositionStatus::Open);

        // Claim resolved success.
        assert_eq!(
            store.resolved.lock().unwrap().as_slice(),
            &[("BUY:s1".to_string(), "success".to_string())]
        );
    }

    #[tokio::test]
    async fn scenario_b_duplicate_signal_never_broadcasts() {
        let (ctx, _store, quotes, pipeline) = ctx_with(
            MockStore::default(),
            MockPipeline::new(vec![Ok("sig-1".into()), Ok("sig-2".into())]),
            rich_wallet(),
        );
        let signal = buy_signal("s1", 0.5);

        let first = execute_signal(&ctx, &signal).await.unwrap();
        assert!(matches!(first, SignalOutcome::Executed(_)));

        let second = execute_signal(&ctx, &signal).await.unwrap();
        assert!(matches!(second, SignalOutcome::Duplicate));

        // No second quote, no second broadcast.
        assert_eq!(quotes.requests.lock().unwrap().len(), 1);
        assert_eq!(pipeline.seen_params.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn scenario_c_buy_amount_clips_to_spendable() {
        let wallet = MockWallet {
            lamports: 1_000_000_000, // 1 SOL
            token_balance: 0,
            needs_token_account: true,
        };
        let reserves = policy().reserves;
        let expected_spendable =
            compute_spendable(1_000_000_000, true, &reserves).unwrap().spendable_lamports;

        let (ctx, store, quotes, _pipeline) = ctx_with(
            MockStore::default(),
            MockPipeline::new(vec![Ok("sig-1".into())]),
            wallet,
        );
        // Requested 2 SOL against ~1 SOL of balance.
        let signal = buy_signal("s1", 2.0);
        execute_signal(&ctx, &signal).await.unwrap();

        let requests = quotes.requests.lock().unwrap();
        assert_eq!(requests[0].amount, expected_spendable);
        assert!(requests[0].amount > 0);

        // The logged amount is the clipped amount, not the request's.
        let log = store.log.lock().unwrap();
        assert_eq!(log[0].in_amount, expected_spendable);
    }

    #[tokio::test]
    async fn sell_amount_derives_from_chain_balance() {
        let store = MockStore::default().with_open_position("s1", "TOKENX");
        let (ctx, _store, quotes, _pipeline) = ctx_with(
            store,
            MockPipeline::new(vec![Ok("sig-1".into())]),
            MockWallet {
                lamports: 1_000_000_000,
                token_balance: 5_000_000,
                needs_token_account: false,
            },
        );
        // Caller claims a wildly different amount; the chain balance wins.
        let mut signal = sell_signal("s1");
        signal.input_amount = 999_999.0;
        execute_signal(&ctx, &signal).await.unwrap();

        let requests = quotes.requests.lock().unwrap();
        assert_eq!(requests[0].amount, (5_000_000f64 * 0.9999) as u64);
    }

    #[tokio::test]
    async fn scenario_d_sell_without_open_position_is_rejected_before_quoting() {
        let (ctx, store, quotes, pipeline) = ctx_with(
            MockStore::default(),
            MockPipeline::new(vec![Ok("sig-1".into())]),
            rich_wallet(),
        );
        let signal = sell_signal("s-none");

        let err = execute_signal(&ctx, &signal).await.unwrap_err();
        assert!(matches!(err, ExecError::PositionNotOpen(_)));
        assert!(quotes.requests.lock().unwrap().is_empty());
        assert!(pipeline.seen_params.lock().unwrap().is_empty());

        // Terminal failure recorded exactly once; claim resolved failed.
        let log = store.log.lock().unwrap();
        assert_eq!(log.iter().filter(|e| e.terminal).count(), 1);
        assert_eq!(
            store.resolved.lock().unwrap().as_slice(),
            &[("SELL:s-none".to_string(), "failed".to_string())]
        );
    }

    #[tokio::test]
    async fn scenario_e_slippage_failure_escalates_then_succeeds_once() {
        let (ctx, store, _quotes, pipeline) = ctx_with(
            MockStore::default(),
            MockPipeline::new(vec![
                Err(ExecError::OnChainProgramError {
                    code: Some(6001),
                    message: "custom program error: 0x1771".into(),
                }),
                Ok("sig-2".into()),
            ]),
            rich_wallet(),
        );
        let signal = buy_signal("s1", 0.5);

        let outcome = execute_signal(&ctx, &signal).await.unwrap();
        assert!(matches!(outcome, SignalOutcome::Executed(_)));

        let seen = pipeline.seen_params.lock().unwrap();
        assert_eq!(seen.len(), 2);
        assert!(seen[1].slippage_bps > seen[0].slippage_bps);
        assert!(seen[1].cu_price_micro_lamports >= seen[0].cu_price_micro_lamports);

        // Exactly one success record, not two.
        let log = store.log.lock().unwrap();
        assert_eq!(log.iter().filter(|e| e.status == "success").count(), 1);
        assert_eq!(log.iter().filter(|e| e.terminal).count(), 1);
    }

    #[tokio::test]
    async fn exhausted_attempts_leave_one_terminal_failed_record() {
        let failing = || ExecError::ConfirmationTimeout("sig".into());
        let (ctx, store, _quotes, pipeline) = ctx_with(
            MockStore::default(),
            MockPipeline::new(vec![Err(failing()), Err(failing()), Err(failing())]),
            rich_wallet(),
        );
        let signal = buy_signal("s1", 0.5);

        let err = execute_signal(&ctx, &signal).await.unwrap_err();
        assert!(matches!(err, ExecError::ConfirmationTimeout(_)));

        // Attempt budget honored.
        assert_eq!(pipeline.seen_params.lock().unwrap().len(), 3);

        // Monotonicity across the whole series.
        let seen = pipeline.seen_params.lock().unwrap();
        for pair in seen.windows(2) {
            assert!(pair[1].slippage_bps >= pair[0].slippage_bps);
            assert!(pair[1].cu_price_micro_lamports >= pair[0].cu_price_micro_lamports);
        }

        // Exactly one terminal record; claim resolved failed, not dangling.
        let log = store.log.lock().unwrap();
        assert_eq!(log.iter().filter(|e| e.terminal).count(), 1);
        assert_eq!(log.len(), 3);
        assert_eq!(
            store.resolved.lock().unwrap().as_slice(),
            &[("BUY:s1".to_string(), "failed".to_string())]
        );
    }

    #[tokio::test]
    async fn fatal_error_is_not_retried() {
        let wallet = MockWallet {
            lamports: 1_000_000, // far below reserves
            token_balance: 0,
            needs_token_account: false,
        };
        let (ctx, store, quotes, _pipeline) = ctx_with(
            MockStore::default(),
            MockPipeline::new(vec![Ok("sig-1".into())]),
            wallet,
        );
        let signal = buy_signal("s1", 0.5);

        let err = execute_signal(&ctx, &signal).await.unwrap_err();
        assert!(matches!(err, ExecError::InsufficientFunds(_)));
        assert!(quotes.requests.lock().unwrap().is_empty());
        assert_eq!(store.log.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn store_write_failure_does_not_fail_the_trade() {
        let store = MockStore::default();
        store
            .fail_log_writes
            .store(true, std::sync::atomic::Ordering::SeqCst);
        let before = metrics::get().db_errors.get();

        let (ctx, _store, _quotes, _pipeline) = ctx_with(
            store,
            MockPipeline::new(vec![Ok("sig-1".into())]),
            rich_wallet(),
        );
        let outcome = execute_signal(&ctx, &buy_signal("s1", 0.5)).await.unwrap();

        // Recorder writes are fire-and-forget: the trade still succeeds and
        // the failure is counted.
        assert!(matches!(outcome, SignalOutcome::Executed(_)));
        assert!(metrics::get().db_errors.get() > before);
    }

    #[tokio::test]
    async fn sell_closes_the_open_position() {
        let store = MockStore::default().with_open_position("s1", "TOKENX");
        let (ctx, store, _quotes, _pipeline) = ctx_with(
            store,
            MockPipeline::new(vec![Ok("sig-close".into())]),
            rich_wallet(),
        );
        execute_signal(&ctx, &sell_signal("s1")).await.unwrap();

        let positions = store.positions.lock().unwrap();
        assert_eq!(positions.get("s1").unwrap().status, PositionStatus::Closed);
    }
}
