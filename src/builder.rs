// Transaction assembly: aggregator swap instructions + our own compute
// budget, fast-lane tip, and signal-id memo, compiled into a signed v0
// transaction. A simulation pass sizes the compute limit before the real
// broadcast.

use crate::broadcast::BroadcastEngine;
use crate::error::{extract_custom_error_code, ExecError};
use crate::executor::{AttemptParams, TxPipeline};
use crate::quote::{JupiterClient, Quote};
use crate::signal::TradeSignal;
use async_trait::async_trait;
use base64::Engine;
use log::{debug, info, warn};
use rand::seq::SliceRandom;
use serde_json::Value;
use solana_client::nonblocking::rpc_client::RpcClient;
use solana_client::rpc_config::RpcSimulateTransactionConfig;
use solana_sdk::address_lookup_table::state::AddressLookupTable;
use solana_sdk::address_lookup_table::AddressLookupTableAccount;
use solana_sdk::compute_budget::ComputeBudgetInstruction;
use solana_sdk::instruction::{AccountMeta, Instruction};
use solana_sdk::message::{v0, VersionedMessage};
use solana_sdk::pubkey::Pubkey;
use solana_sdk::signature::Keypair;
use solana_sdk::signer::Signer;
use solana_sdk::system_instruction;
use solana_sdk::transaction::VersionedTransaction;
use spl_memo::build_memo;
use std::str::FromStr;
use std::sync::Arc;

// Compute limit used for the sizing simulation; the real transaction carries
// the simulated consumption plus headroom.
const SIM_COMPUTE_LIMIT: u32 = 1_400_000;
const MIN_COMPUTE_LIMIT: u32 = 60_000;
const FALLBACK_COMPUTE_LIMIT: u32 = 600_000;
const COMPUTE_HEADROOM_NUM: u64 = 12;
const COMPUTE_HEADROOM_DEN: u64 = 10;

pub struct SwapPipeline {
    rpc: Arc<RpcClient>,
    jupiter: Arc<JupiterClient>,
    broadcast: Arc<BroadcastEngine>,
    keypair: Arc<Keypair>,
    tip_accounts: Vec<Pubkey>,
    fast_lane_enabled: bool,
}

impl SwapPipeline {
    pub fn new(
        rpc: Arc<RpcClient>,
        jupiter: Arc<JupiterClient>,
        broadcast: Arc<BroadcastEngine>,
        keypair: Arc<Keypair>,
        tip_accounts: Vec<Pubkey>,
        fast_lane_enabled: bool,
    ) -> Self {
        Self {
            rpc,
            jupiter,
            broadcast,
            keypair,
            tip_accounts,
            fast_lane_enabled,
        }
    }

    /// Assemble the instruction list: compute budget first, then the
    /// aggregator's setup/swap/cleanup, then tip and memo.
    fn assemble(
        &self,
        payload: &SwapInstructions,
        params: &AttemptParams,
        signal: &TradeSignal,
        compute_limit: u32,
    ) -> Vec<Instruction> {
        let owner = self.keypair.pubkey();
        let mut instructions = vec![
            ComputeBudgetInstruction::set_compute_unit_limit(compute_limit),
            ComputeBudgetInstruction::set_compute_unit_price(params.cu_price_micro_lamports),
        ];
        instructions.extend(payload.setup.iter().cloned());
        instructions.push(payload.swap.clone());
        instructions.extend(payload.cleanup.iter().cloned());

        // The tip pays the premium lane; without one the transfer is waste.
        if self.fast_lane_enabled && params.tip_lamports > 0 {
            if let Some(tip_account) = self.tip_accounts.choose(&mut rand::thread_rng()) {
                instructions.push(system_instruction::transfer(
                    &owner,
                    tip_account,
                    params.tip_lamports,
                ));
            }
        }

        // Memo ties the on-chain transaction back to the originating signal.
        instructions.push(build_memo(signal.signal_id.as_bytes(), &[&owner]));
        instructions
    }

    async fn resolve_lookup_tables(
        &self,
        addresses: &[String],
    ) -> Result<Vec<AddressLookupTableAccount>, ExecError> {
        if addresses.is_empty() {
            return Ok(Vec::new());
        }
        let keys: Vec<Pubkey> = addresses
            .iter()
            .map(|a| Pubkey::from_str(a))
            .collect::<Result<_, _>>()
            .map_err(|e| ExecError::Rpc(format!("bad lookup table address: {e}")))?;

        let accounts = self
            .rpc
            .get_multiple_accounts(&keys)
            .await
            .map_err(|e| ExecError::Rpc(format!("lookup table fetch: {e}")))?;

        let mut tables = Vec::with_capacity(keys.len());
        for (key, account) in keys.iter().zip(accounts) {
            let account = account
                .ok_or_else(|| ExecError::Rpc(format!("lookup table {key} not found")))?;
            let table = AddressLookupTable::deserialize(&account.data)
                .map_err(|e| ExecError::Rpc(format!("lookup table {key}: {e}")))?;
            tables.push(AddressLookupTableAccount {
                key: *key,
                addresses: table.addresses.to_vec(),
            });
        }
        debug!("resolved {} lookup table(s)", tables.len());
        Ok(tables)
    }

    fn compile_and_sign(
        &self,
        instructions: &[Instruction],
        tables: &[AddressLookupTableAccount],
        blockhash: solana_sdk::hash::Hash,
    ) -> Result<VersionedTransaction, ExecError> {
        let message = v0::Message::try_compile(
            &self.keypair.pubkey(),
            instructions,
            tables,
            blockhash,
        )
        .map_err(|e| ExecError::SimulationFailed(format!("message compile: {e}")))?;
        VersionedTransaction::try_new(VersionedMessage::V0(message), &[self.keypair.as_ref()])
            .map_err(|e| ExecError::SimulationFailed(format!("signing: {e}")))
    }

    /// Simulate to size the compute limit. A simulation error is an attempt
    /// failure, classified by its custom program code when one is present.
    async fn simulated_compute_limit(
        &self,
        tx: &VersionedTransaction,
    ) -> Result<u32, ExecError> {
        let config = RpcSimulateTransactionConfig {
            sig_verify: false,
            replace_recent_blockhash: true,
            ..Default::default()
        };
        let response = self
            .rpc
            .simulate_transaction_with_config(tx, config)
            .await
            .map_err(|e| ExecError::Rpc(format!("simulate: {e}")))?;
        let result = response.value;

        if let Some(err) = result.err {
            let logs_tail = result
                .logs
                .as_deref()
                .map(|logs| {
                    logs.iter()
                        .rev()
                        .take(3)
                        .rev()
                        .cloned()
                        .collect::<Vec<_>>()
                        .join(" | ")
                })
                .unwrap_or_default();
            let message = format!("{err}: {logs_tail}");
            return match extract_custom_error_code(&message) {
                Some(code) => Err(ExecError::OnChainProgramError {
                    code: Some(code),
                    message,
                }),
                None => Err(ExecError::SimulationFailed(message)),
            };
        }

        let limit = match result.units_consumed {
            Some(units) if units > 0 => {
                let padded = units * COMPUTE_HEADROOM_NUM / COMPUTE_HEADROOM_DEN;
                (padded as u32).clamp(MIN_COMPUTE_LIMIT, SIM_COMPUTE_LIMIT)
            }
            _ => {
                warn!("simulation returned no compute usage, using fallback limit");
                FALLBACK_COMPUTE_LIMIT
            }
        };
        Ok(limit)
    }
}

#[async_trait]
impl TxPipeline for SwapPipeline {
    async fn execute(
        &self,
        quote: &Quote,
        params: &AttemptParams,
        signal: &TradeSignal,
    ) -> Result<String, ExecError> {
        let owner = self.keypair.pubkey().to_string();
        let payload = self
            .jupiter
            .swap_instructions(quote, &owner, params.use_shared_accounts)
            .await?;
        let payload = SwapInstructions::parse(&payload)?;

        let tables = self
            .resolve_lookup_tables(&payload.lookup_table_addresses)
            .await?;
        let blockhash = self
            .rpc
            .get_latest_blockhash()
            .await
            .map_err(|e| ExecError::Rpc(format!("blockhash: {e}")))?;

        // Sizing pass at the ceiling limit, then the real transaction with
        // simulated consumption plus headroom.
        let sim_ixs = self.assemble(&payload, params, signal, SIM_COMPUTE_LIMIT);
        let sim_tx = self.compile_and_sign(&sim_ixs, &tables, blockhash)?;
        let compute_limit = self.simulated_compute_limit(&sim_tx).await?;
        info!(
            "⚙️ Compute limit {} CU, price {} µLamports/CU, tip {} lamports",
            compute_limit, params.cu_price_micro_lamports, params.tip_lamports
        );

        let instructions = self.assemble(&payload, params, signal, compute_limit);
        let tx = self.compile_and_sign(&instructions, &tables, blockhash)?;

        self.broadcast.send_and_confirm(&tx).await
    }
}

/// The decomposed swap-instructions response, decoded into sdk instructions.
#[derive(Debug)]
struct SwapInstructions {
    setup: Vec<Instruction>,
    swap: Instruction,
    cleanup: Vec<Instruction>,
    lookup_table_addresses: Vec<String>,
}

impl SwapInstructions {
    fn parse(payload: &Value) -> Result<Self, ExecError> {
        let setup = payload
            .get("setupInstructions")
            .and_then(Value::as_array)
            .map(|list| list.iter().map(decode_instruction).collect())
            .transpose()?
            .unwrap_or_default();

        let swap = payload
            .get("swapInstruction")
            .ok_or_else(|| {
                ExecError::QuoteUnavailable("swap-instructions response missing swapInstruction".into())
            })
            .and_then(decode_instruction)?;

        let cleanup = match payload.get("cleanupInstruction") {
            Some(Value::Null) | None => Vec::new(),
            Some(ix) => vec![decode_instruction(ix)?],
        };

        let lookup_table_addresses = payload
            .get("addressLookupTableAddresses")
            .and_then(Value::as_array)
            .map(|list| {
                list.iter()
                    .filter_map(Value::as_str)
                    .map(str::to_string)
                    .collect()
            })
            .unwrap_or_default();

        Ok(Self {
            setup,
            swap,
            cleanup,
            lookup_table_addresses,
        })
    }
}

/// Decode one aggregator instruction object: base58 program id and account
/// keys, base64 data.
fn decode_instruction(value: &Value) -> Result<Instruction, ExecError> {
    let bad = |what: &str| ExecError::QuoteUnavailable(format!("malformed instruction: {what}"));

    let program_id = value
        .get("programId")
        .and_then(Value::as_str)
        .ok_or_else(|| bad("programId"))
        .and_then(|s| Pubkey::from_str(s).map_err(|_| bad("programId")))?;

    let accounts = value
        .get("accounts")
        .and_then(Value::as_array)
        .ok_or_else(|| bad("accounts"))?
        .iter()
        .map(|a| {
            let pubkey = a
                .get("pubkey")
                .and_then(Value::as_str)
                .ok_or_else(|| bad("account pubkey"))
                .and_then(|s| Pubkey::from_str(s).map_err(|_| bad("account pubkey")))?;
            let is_signer = a.get("isSigner").and_then(Value::as_bool).unwrap_or(false);
            let is_writable = a.get("isWritable").and_then(Value::as_bool).unwrap_or(false);
            Ok(if is_writable {
                AccountMeta::new(pubkey, is_signer)
            } else {
                AccountMeta::new_readonly(pubkey, is_signer)
            })
        })
        .collect::<Result<Vec<_>, ExecError>>()?;

    let data = value
        .get("data")
        .and_then(Value::as_str)
        .ok_or_else(|| bad("data"))
        .and_then(|s| {
            base64::engine::general_purpose::STANDARD
                .decode(s)
                .map_err(|_| bad("data"))
        })?;

    Ok(Instruction {
        program_id,
        accounts,
        data,
    })
}
