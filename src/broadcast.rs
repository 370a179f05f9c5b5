// Transaction broadcast and confirmation.
//
// A signed transaction is serialized once and raced down every configured
// channel at the same time: the standard RPC endpoint and, when configured,
// a premium fast-sender lane speaking raw JSON-RPC. Duplicate sends are
// harmless since the signature is identical. Confirmation is a status poll
// under a hard deadline, with a last-chance lookup after the deadline so a
// transaction that landed late is still reported as a success.

use crate::error::{extract_custom_error_code, ExecError};
use crate::metrics;
use futures::stream::{FuturesUnordered, StreamExt};
use log::{info, warn};
use solana_client::nonblocking::rpc_client::RpcClient;
use solana_client::rpc_config::RpcSendTransactionConfig;
use solana_sdk::signature::Signature;
use solana_sdk::transaction::{TransactionError, VersionedTransaction};
use solana_transaction_status::{TransactionConfirmationStatus, TransactionStatus, UiTransactionEncoding};
use std::str::FromStr;
use std::sync::Arc;
use std::time::{Duration, Instant};

pub struct BroadcastEngine {
    rpc: Arc<RpcClient>,
    http: reqwest::Client,
    fast_sender_url: Option<String>,
    confirm_timeout: Duration,
    poll_interval: Duration,
}

/// Interpretation of one signature-status poll.
#[derive(Debug, PartialEq)]
pub enum PollVerdict {
    /// Not yet visible or not yet at the target commitment.
    Pending,
    Confirmed,
    Failed { code: Option<u32>, message: String },
}

/// One broadcast channel: resolves to its label on acceptance, its rendered
/// error otherwise.
type ChannelSend<'a> = futures::future::BoxFuture<'a, Result<&'static str, String>>;

/// First successful channel wins; every channel failing is a broadcast
/// failure carrying each channel's error.
async fn first_success(
    mut sends: FuturesUnordered<ChannelSend<'_>>,
) -> Result<&'static str, ExecError> {
    let mut failures = Vec::new();
    while let Some(result) = sends.next().await {
        match result {
            Ok(channel) => return Ok(channel),
            Err(e) => {
                metrics::get().broadcast_channel_errors.inc();
                warn!("broadcast channel failed: {}", e);
                failures.push(e);
            }
        }
    }
    Err(ExecError::BroadcastFailed(failures.join("; ")))
}

/// Verdict for a transaction found by direct lookup after the deadline. A
/// landed-with-error transaction keeps its program-error classification so
/// the next attempt escalates correctly.
pub fn landed_verdict(meta_err: Option<&TransactionError>) -> PollVerdict {
    match meta_err {
        None => PollVerdict::Confirmed,
        Some(err) => {
            let message = err.to_string();
            PollVerdict::Failed {
                code: extract_custom_error_code(&message),
                message,
            }
        }
    }
}

/// Map a `getSignatureStatuses` entry to a verdict at confirmed commitment.
pub fn poll_verdict(status: Option<&TransactionStatus>) -> PollVerdict {
    let Some(status) = status else {
        return PollVerdict::Pending;
    };
    if let Some(err) = &status.err {
        let message = err.to_string();
        return PollVerdict::Failed {
            code: extract_custom_error_code(&message),
            message,
        };
    }
    match &status.confirmation_status {
        Some(TransactionConfirmationStatus::Confirmed)
        | Some(TransactionConfirmationStatus::Finalized) => PollVerdict::Confirmed,
        _ => PollVerdict::Pending,
    }
}

impl BroadcastEngine {
    pub fn new(
        rpc: Arc<RpcClient>,
        fast_sender_url: Option<String>,
        confirm_timeout: Duration,
        poll_interval: Duration,
    ) -> Self {
        Self {
            rpc,
            http: reqwest::Client::new(),
            fast_sender_url,
            confirm_timeout,
            poll_interval,
        }
    }

    /// Race the transaction down every channel, then poll to confirmation.
    /// Returns the signature once it reaches confirmed commitment.
    pub async fn send_and_confirm(
        &self,
        tx: &VersionedTransaction,
    ) -> Result<String, ExecError> {
        let signature = tx
            .signatures
            .first()
            .map(|s| s.to_string())
            .ok_or_else(|| ExecError::BroadcastFailed("unsigned transaction".into()))?;

        // Serialize once; both channels send the same bytes.
        let bytes = bincode::serialize(tx)
            .map_err(|e| ExecError::BroadcastFailed(format!("serialize: {e}")))?;
        let encoded = base64::Engine::encode(&base64::engine::general_purpose::STANDARD, &bytes);

        self.race_channels(tx, &encoded).await?;
        info!("📡 Broadcast {} on all channels", signature);

        self.await_confirmation(&signature).await
    }

    async fn race_channels(
        &self,
        tx: &VersionedTransaction,
        encoded: &str,
    ) -> Result<(), ExecError> {
        let sends: FuturesUnordered<ChannelSend<'_>> = FuturesUnordered::new();

        sends.push(Box::pin(async move {
            self.send_standard_rpc(tx).await.map(|_| "rpc")
        }) as ChannelSend<'_>);

        if let Some(url) = &self.fast_sender_url {
            sends.push(Box::pin(async move {
                self.send_fast_lane(url, encoded).await.map(|_| "fast-sender")
            }) as ChannelSend<'_>);
        }

        // One acceptance is enough; pending sends are dropped.
        let channel = first_success(sends).await?;
        info!("✓ {} accepted the transaction first", channel);
        Ok(())
    }

    async fn send_standard_rpc(&self, tx: &VersionedTransaction) -> Result<(), String> {
        let config = RpcSendTransactionConfig {
            skip_preflight: true,
            max_retries: Some(0),
            ..Default::default()
        };
        self.rpc
            .send_transaction_with_config(tx, config)
            .await
            .map(|_| ())
            .map_err(|e| format!("rpc: {e}"))
    }

    async fn send_fast_lane(&self, url: &str, encoded: &str) -> Result<(), String> {
        let body = serde_json::json!({
            "jsonrpc": "2.0",
            "id": 1,
            "method": "sendTransaction",
            "params": [encoded, {
                "encoding": "base64",
                "skipPreflight": true,
                "maxRetries": 0,
            }],
        });
        let response = self
            .http
            .post(url)
            .json(&body)
            .timeout(Duration::from_secs(5))
            .send()
            .await
            .map_err(|e| format!("fast-sender: {e}"))?;
        let json: serde_json::Value = response
            .json()
            .await
            .map_err(|e| format!("fast-sender: {e}"))?;
        if let Some(err) = json.get("error") {
            return Err(format!("fast-sender: {err}"));
        }
        Ok(())
    }

    async fn await_confirmation(&self, signature: &str) -> Result<String, ExecError> {
        let started = Instant::now();
        let sig = Signature::from_str(signature)
            .map_err(|e| ExecError::BroadcastFailed(format!("bad signature: {e}")))?;
        let deadline = started + self.confirm_timeout;

        loop {
            match self.poll_once(&sig).await {
                PollVerdict::Confirmed => {
                    metrics::get()
                        .confirmation_seconds
                        .observe(started.elapsed().as_secs_f64());
                    info!(
                        "🎉 {} confirmed after {:.1}s",
                        signature,
                        started.elapsed().as_secs_f64()
                    );
                    return Ok(signature.to_string());
                }
                PollVerdict::Failed { code, message } => {
                    return Err(ExecError::OnChainProgramError { code, message });
                }
                PollVerdict::Pending => {}
            }
            if Instant::now() >= deadline {
                break;
            }
            tokio::time::sleep(self.poll_interval).await;
        }

        // Deadline hit. One last status poll plus a full transaction lookup:
        // a send accepted near the deadline can still land while we slept.
        match self.poll_once(&sig).await {
            PollVerdict::Confirmed => {
                info!("🎉 {} confirmed on the post-deadline poll", signature);
                return Ok(signature.to_string());
            }
            PollVerdict::Failed { code, message } => {
                return Err(ExecError::OnChainProgramError { code, message });
            }
            PollVerdict::Pending => {}
        }
        if let Ok(confirmed) = self
            .rpc
            .get_transaction(&sig, UiTransactionEncoding::Json)
            .await
        {
            if let Some(meta) = confirmed.transaction.meta.as_ref() {
                match landed_verdict(meta.err.as_ref()) {
                    PollVerdict::Confirmed => {
                        info!("🎉 {} found confirmed by transaction lookup", signature);
                        return Ok(signature.to_string());
                    }
                    PollVerdict::Failed { code, message } => {
                        return Err(ExecError::OnChainProgramError { code, message });
                    }
                    PollVerdict::Pending => {}
                }
            }
        }

        metrics::get().confirmations_timed_out.inc();
        warn!(
            "⏰ {} not confirmed within {:?}",
            signature, self.confirm_timeout
        );
        Err(ExecError::ConfirmationTimeout(signature.to_string()))
    }

    async fn poll_once(&self, sig: &Signature) -> PollVerdict {
        match self
            .rpc
            .get_signature_statuses(std::slice::from_ref(sig))
            .await
        {
            Ok(response) => poll_verdict(response.value.first().and_then(|s| s.as_ref())),
            Err(e) => {
                warn!("status poll failed: {}", e);
                PollVerdict::Pending
            }
        }
    }
}
