// Outcome recorder boundary. The execution core only sees the OutcomeStore
// trait; the Postgres implementation below owns the schema. Claiming a signal
// must be atomic create-if-absent, everything else is bookkeeping the core
// treats as fire-and-forget.

use crate::error::ExecError;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use log::{error, info};
use tokio_postgres::NoTls;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PositionStatus {
    Open,
    Closed,
}

impl PositionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            PositionStatus::Open => "open",
            PositionStatus::Closed => "closed",
        }
    }
}

/// Open/closed state per signal; closed exactly once per lifecycle.
#[derive(Debug, Clone)]
pub struct Position {
    pub signal_id: String,
    pub mint: String,
    pub status: PositionStatus,
    pub entry_in_amount: u64,
    pub entry_out_amount: u64,
    pub entry_signature: String,
    pub opened_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct PositionExit {
    pub exit_signature: String,
    pub exit_out_amount: u64,
    pub closed_at: DateTime<Utc>,
}

/// Append-only record of one attempt's outcome.
#[derive(Debug, Clone)]
pub struct TradeLogEntry {
    pub signal_id: String,
    pub action: String,
    pub attempt: u32,
    pub status: String, // "success" | "failed"
    pub signature: Option<String>,
    pub in_amount: u64,
    pub out_amount: Option<u64>,
    pub price_impact_pct: Option<f64>,
    pub slippage_bps: u16,
    pub cu_price_micro_lamports: u64,
    pub error: Option<String>,
    pub terminal: bool,
}

#[async_trait]
pub trait OutcomeStore: Send + Sync {
    /// Atomic create-if-absent claim. Returns false when the key was already
    /// claimed - the caller must treat that as a duplicate, not an error.
    async fn claim_signal(&self, claim_key: &str) -> Result<bool, ExecError>;

    /// Resolve a claim to its terminal outcome ("success" | "failed").
    async fn resolve_claim(&self, claim_key: &str, outcome: &str) -> Result<(), ExecError>;

    async fn open_position(&self, signal_id: &str) -> Result<Option<Position>, ExecError>;

    async fn record_attempt(&self, entry: &TradeLogEntry) -> Result<(), ExecError>;

    async fn upsert_position(&self, position: &Position) -> Result<(), ExecError>;

    async fn close_position(&self, signal_id: &str, exit: &PositionExit) -> Result<(), ExecError>;
}

pub struct PgStore {
    client: tokio_postgres::Client,
}

impl PgStore {
    pub async fn connect(
        host: &str,
        port: u16,
        dbname: &str,
        user: &str,
        password: &str,
    ) -> Result<Self, Box<dyn std::error::Error + Send + Sync>> {
        let connection_string =
            format!("host={host} port={port} dbname={dbname} user={user} password={password}");

        let (client, connection) = tokio_postgres::connect(&connection_string, NoTls).await?;

        // Spawn connection handler
        tokio::spawn(async move {
            if let Err(e) = connection.await {
                error!("Database connection error: {}", e);
            }
        });

        client
            .execute(
                "CREATE TABLE IF NOT EXISTS signal_claims (
                    claim_key TEXT PRIMARY KEY,
                    status TEXT NOT NULL DEFAULT 'inflight'
                        CHECK(status IN ('inflight', 'success', 'failed')),
                    claimed_at TIMESTAMPTZ DEFAULT CURRENT_TIMESTAMP,
                    resolved_at TIMESTAMPTZ
                )",
                &[],
            )
            .await?;

        client
            .execute(
                "CREATE TABLE IF NOT EXISTS trade_log (
                    id SERIAL PRIMARY KEY,
                    signal_id TEXT NOT NULL,
                    action TEXT NOT NULL,
                    attempt INTEGER NOT NULL,
                    status TEXT NOT NULL,
                    signature VARCHAR(88),
                    in_amount BIGINT NOT NULL,
                    out_amount BIGINT,
                    price_impact_pct DOUBLE PRECISION,
                    slippage_bps INTEGER NOT NULL,
                    cu_price_micro_lamports BIGINT NOT NULL,
                    error TEXT,
                    terminal BOOLEAN NOT NULL DEFAULT FALSE,
                    created_at TIMESTAMPTZ DEFAULT CURRENT_TIMESTAMP
                )",
                &[],
            )
            .await?;

        client
            .execute(
                "CREATE TABLE IF NOT EXISTS positions (
                    signal_id TEXT PRIMARY KEY,
                    mint TEXT NOT NULL,
                    status TEXT NOT NULL CHECK(status IN ('open', 'closed')),
                    entry_in_amount BIGINT NOT NULL,
                    entry_out_amount BIGINT NOT NULL,
                    entry_signature VARCHAR(88) NOT NULL,
                    exit_out_amount BIGINT,
                    exit_signature VARCHAR(88),
                    opened_at TIMESTAMPTZ NOT NULL,
                    closed_at TIMESTAMPTZ,
                    updated_at TIMESTAMPTZ DEFAULT CURRENT_TIMESTAMP
                )",
                &[],
            )
            .await?;

        client
            .execute(
                "CREATE INDEX IF NOT EXISTS idx_trade_log_signal ON trade_log(signal_id)",
                &[],
            )
            .await?;
        client
            .execute(
                "CREATE INDEX IF NOT EXISTS idx_positions_status ON positions(status)",
                &[],
            )
            .await?;

        info!("Database tables 'signal_claims', 'trade_log', 'positions' ready");

        Ok(PgStore { client })
    }
}

#[async_trait]
impl OutcomeStore for PgStore {
    async fn claim_signal(&self, claim_key: &str) -> Result<bool, ExecError> {
        let rows = self
            .client
            .execute(
                "INSERT INTO signal_claims (claim_key) VALUES ($1)
                 ON CONFLICT (claim_key) DO NOTHING",
                &[&claim_key],
            )
            .await
            .map_err(|e| ExecError::Store(e.to_string()))?;
        Ok(rows == 1)
    }

    async fn resolve_claim(&self, claim_key: &str, outcome: &str) -> Result<(), ExecError> {
        self.client
            .execute(
                "UPDATE signal_claims
                 SET status = $1, resolved_at = CURRENT_TIMESTAMP
                 WHERE claim_key = $2",
                &[&outcome, &claim_key],
            )
            .await
            .map_err(|e| ExecError::Store(e.to_string()))?;
        Ok(())
    }

    async fn open_position(&self, signal_id: &str) -> Result<Option<Position>, ExecError> {
        let row = self
            .client
            .query_opt(
                "SELECT mint, entry_in_amount, entry_out_amount, entry_signature, opened_at
                 FROM positions WHERE signal_id = $1 AND status = 'open'",
                &[&signal_id],
            )
            .await
            .map_err(|e| ExecError::Store(e.to_string()))?;

        Ok(row.map(|r| Position {
            signal_id: signal_id.to_string(),
            mint: r.get(0),
            status: PositionStatus::Open,
            entry_in_amount: r.get::<_, i64>(1) as u64,
            entry_out_amount: r.get::<_, i64>(2) as u64,
            entry_signature: r.get(3),
            opened_at: r.get(4),
        }))
    }

    async fn record_attempt(&self, entry: &TradeLogEntry) -> Result<(), ExecError> {
        self.client
            .execute(
                "INSERT INTO trade_log (
                    signal_id, action, attempt, status, signature, in_amount,
                    out_amount, price_impact_pct, slippage_bps,
                    cu_price_micro_lamports, error, terminal
                ) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12)",
                &[
                    &entry.signal_id,
                    &entry.action,
                    &(entry.attempt as i32),
                    &entry.status,
                    &entry.signature,
                    &(entry.in_amount as i64),
                    &entry.out_amount.map(|v| v as i64),
                    &entry.price_impact_pct,
                    &(entry.slippage_bps as i32),
                    &(entry.cu_price_micro_lamports as i64),
                    &entry.error,
                    &entry.terminal,
                ],
            )
            .await
            .map_err(|e| ExecError::Store(e.to_string()))?;
        Ok(())
    }

    async fn upsert_position(&self, position: &Position) -> Result<(), ExecError> {
        self.client
            .execute(
                "INSERT INTO positions (
                    signal_id, mint, status, entry_in_amount, entry_out_amount,
                    entry_signature, opened_at
                ) VALUES ($1, $2, $3, $4, $5, $6, $7)
                ON CONFLICT (signal_id) DO UPDATE SET
                    mint = EXCLUDED.mint,
                    status = EXCLUDED.status,
                    entry_in_amount = EXCLUDED.entry_in_amount,
                    entry_out_amount = EXCLUDED.entry_out_amount,
                    entry_signature = EXCLUDED.entry_signature,
                    updated_at = CURRENT_TIMESTAMP",
                &[
                    &position.signal_id,
                    &position.mint,
                    &position.status.as_str(),
                    &(position.entry_in_amount as i64),
                    &(position.entry_out_amount as i64),
                    &position.entry_signature,
                    &position.opened_at,
                ],
            )
            .await
            .map_err(|e| ExecError::Store(e.to_string()))?;
        Ok(())
    }

    async fn close_position(&self, signal_id: &str, exit: &PositionExit) -> Result<(), ExecError> {
        let rows = self
            .client
            .execute(
                "UPDATE positions SET
                    status = 'closed',
                    exit_out_amount = $1,
                    exit_signature = $2,
                    closed_at = $3,
                    updated_at = CURRENT_TIMESTAMP
                 WHERE signal_id = $4 AND status = 'open'",
                &[
                    &(exit.exit_out_amount as i64),
                    &exit.exit_signature,
                    &exit.closed_at,
                    &signal_id,
                ],
            )
            .await
            .map_err(|e| ExecError::Store(e.to_string()))?;
        if rows == 0 {
            error!("close_position: no open position for {}", signal_id);
        }
        Ok(())
    }
}
