// Webhook intake. The claim is taken synchronously inside the request so the
// caller's response reflects duplicate status; the trade itself runs on a
// spawned task so the HTTP response never waits on confirmation.

use crate::executor::{run_claimed, ExecutionContext};
use crate::metrics;
use crate::signal::{normalize, Action};
use axum::extract::State;
use axum::http::StatusCode;
use axum::routing::{get, post};
use axum::{Json, Router};
use log::{info, warn};
use serde_json::{json, Value};
use std::sync::Arc;
use tokio::net::TcpListener;

pub struct AppState {
    pub ctx: Arc<ExecutionContext>,
}

pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/webhook/signal", post(handle_signal))
        .route("/health", get(health))
        .with_state(state)
}

pub async fn serve(state: Arc<AppState>, port: u16) -> anyhow::Result<()> {
    let addr = format!("0.0.0.0:{}", port);
    let listener = TcpListener::bind(&addr).await?;
    info!("🌐 Webhook server listening on http://{}/webhook/signal", addr);
    axum::serve(listener, router(state)).await?;
    Ok(())
}

async fn health() -> &'static str {
    "ok"
}

async fn handle_signal(
    State(state): State<Arc<AppState>>,
    Json(payload): Json<Value>,
) -> (StatusCode, Json<Value>) {
    let signal = match normalize(&payload) {
        Ok(signal) => signal,
        Err(e) => {
            metrics::get().signals_rejected.inc();
            warn!("rejected webhook payload: {}", e);
            return (
                StatusCode::BAD_REQUEST,
                Json(json!({ "accepted": false, "error": e.to_string() })),
            );
        }
    };
    metrics::get().signals_received.inc();

    if signal.action == Action::Sell && !state.ctx.policy.sell_enabled {
        info!("SELL {} ignored: sells disabled by config", signal.signal_id);
        return (
            StatusCode::OK,
            Json(json!({
                "accepted": false,
                "signal_id": signal.signal_id,
                "error": "sell execution disabled",
            })),
        );
    }

    // Claim before responding: a replayed delivery must see duplicate=true.
    let claimed = match state.ctx.store.claim_signal(&signal.claim_key()).await {
        Ok(claimed) => claimed,
        Err(e) => {
            warn!("claim failed for {}: {}", signal.signal_id, e);
            return (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(json!({ "accepted": false, "error": e.to_string() })),
            );
        }
    };
    if !claimed {
        metrics::get().signals_duplicate.inc();
        info!("duplicate signal {} acknowledged, not executed", signal.signal_id);
        return (
            StatusCode::OK,
            Json(json!({
                "accepted": true,
                "duplicate": true,
                "signal_id": signal.signal_id,
            })),
        );
    }

    info!(
        "📨 {} signal {} accepted: {} -> {}",
        signal.action.as_str(),
        signal.signal_id,
        signal.input_mint,
        signal.output_mint
    );
    let signal_id = signal.signal_id.clone();
    let ctx = state.ctx.clone();
    tokio::spawn(async move {
        // run_claimed records its own outcome and resolves the claim.
        let _ = run_claimed(&ctx, &signal).await;
    });

    (
        StatusCode::OK,
        Json(json!({
            "accepted": true,
            "duplicate": false,
            "signal_id": signal_id,
        })),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::decimals::DecimalSource;
    use crate::error::ExecError;
    use crate::executor::{AttemptParams, ExecPolicy, TxPipeline};
    use crate::quote::{Quote, QuoteRequest, QuoteSource};
    use crate::signal::TradeSignal;
    use crate::store::{OutcomeStore, Position, PositionExit, TradeLogEntry};
    use crate::wallet::{Reserves, WalletView};
    use async_trait::async_trait;
    use axum::body::Body;
    use axum::http::Request;
    use std::collections::HashSet;
    use std::sync::Mutex;
    use tower::ServiceExt;

    struct StubStore {
        claims: Mutex<HashSet<String>>,
    }

    #[async_trait]
    impl OutcomeStore for StubStore {
        async fn claim_signal(&self, claim_key: &str) -> Result<bool, ExecError> {
            Ok(self.claims.lock().unwrap().insert(claim_key.to_string()))
        }
        async fn resolve_claim(&self, _key: &str, _outcome: &str) -> Result<(), ExecError> {
            Ok(())
        }
        async fn open_position(&self, _signal_id: &str) -> Result<Option<Position>, ExecError> {
            Ok(None)
        }
        async fn record_attempt(&self, _entry: &TradeLogEntry) -> Result<(), ExecError> {
            Ok(())
        }
        async fn upsert_position(&self, _position: &Position) -> Result<(), ExecError> {
            Ok(())
        }
        async fn close_position(&self, _id: &str, _exit: &PositionExit) -> Result<(), ExecError> {
            Ok(())
        }
    }

    struct StubQuotes;
    #[async_trait]
    impl QuoteSource for StubQuotes {
        async fn fresh_quote(&self, _req: &QuoteRequest) -> Result<Quote, ExecError> {
            Err(ExecError::QuoteUnavailable("stub".into()))
        }
    }

    struct StubPipeline;
    #[async_trait]
    impl TxPipeline for StubPipeline {
        async fn execute(
            &self,
            _quote: &Quote,
            _params: &AttemptParams,
            _signal: &TradeSignal,
        ) -> Result<String, ExecError> {
            Err(ExecError::BroadcastFailed("stub".into()))
        }
    }

    struct StubWallet;
    #[async_trait]
    impl WalletView for StubWallet {
        async fn lamports(&self) -> Result<u64, ExecError> {
            Ok(10_000_000_000)
        }
        async fn token_balance(&self, _mint: &str) -> Result<u64, ExecError> {
            Ok(0)
        }
        async fn needs_token_account(&self, _mint: &str) -> Result<bool, ExecError> {
            Ok(false)
        }
    }

    struct StubDecimals;
    #[async_trait]
    impl DecimalSource for StubDecimals {
        async fn decimals(&self, _mint: &str) -> Result<u8, ExecError> {
            Ok(9)
        }
    }

    fn test_state(sell_enabled: bool) -> Arc<AppState> {
        let policy = ExecPolicy {
            max_attempts: 1,
            buy_slippage_bps: 100,
            sell_slippage_bps: 250,
            slippage_step_bps: 150,
            max_slippage_bps: 1500,
            base_cu_price: 10_000,
            max_cu_price: 150_000,
            sell_enabled,
            sell_balance_fraction: 0.9999,
            reserves: Reserves {
                safety_buffer_lamports: 5_000_000,
                flat_fee_lamports: 5_000,
                default_tip_lamports: 1_000_000,
                min_tip_lamports: 100_000,
            },
        };
        Arc::new(AppState {
            ctx: Arc::new(ExecutionContext {
                store: Arc::new(StubStore {
                    claims: Mutex::new(HashSet::new()),
                }),
                quotes: Arc::new(StubQuotes),
                pipeline: Arc::new(StubPipeline),
                wallet: Arc::new(StubWallet),
                decimals: Arc::new(StubDecimals),
                policy,
            }),
        })
    }

    async fn post_signal(app: Router, body: Value) -> (StatusCode, Value) {
        let response = app
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri("/webhook/signal")
                    .header("content-type", "application/json")
                    .body(Body::from(body.to_string()))
                    .unwrap(),
            )
            .await
            .unwrap();
        let status = response.status();
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        (status, serde_json::from_slice(&bytes).unwrap())
    }

    #[tokio::test]
    async fn accepts_a_buy_signal() {
        let state = test_state(true);
        let body = json!({
            "action": "BUY",
            "signal_id": "sig-1",
            "output_mint": "TOKENX",
            "input_amount": 0.25,
        });
        let (status, body) = post_signal(router(state), body).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["accepted"], true);
        assert_eq!(body["duplicate"], false);
        assert_eq!(body["signal_id"], "sig-1");
    }

    #[tokio::test]
    async fn replayed_delivery_reports_duplicate() {
        let state = test_state(true);
        let app = router(state);
        let body = json!({
            "action": "BUY",
            "signal_id": "sig-1",
            "output_mint": "TOKENX",
            "input_amount": 0.25,
        });
        let (_, first) = post_signal(app.clone(), body.clone()).await;
        assert_eq!(first["duplicate"], false);
        let (status, second) = post_signal(app, body).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(second["duplicate"], true);
    }

    #[tokio::test]
    async fn malformed_payload_is_rejected() {
        let state = test_state(true);
        let (status, body) = post_signal(router(state), json!({"hello": "world"})).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["accepted"], false);
    }

    #[tokio::test]
    async fn sells_can_be_disabled() {
        let state = test_state(false);
        let body = json!({
            "action": "SELL",
            "signal_id": "sig-2",
            "input_mint": "TOKENX",
            "input_amount": 1.0,
        });
        let (status, body) = post_signal(router(state), body).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["accepted"], false);
    }
}
