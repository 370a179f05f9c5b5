// Wallet solvency accessor. Sizing is pure (`compute_spendable`) so the
// retry policy tests can run without a chain; the RPC-backed view lives
// behind the WalletView trait.

use crate::error::ExecError;
use async_trait::async_trait;
use log::{debug, warn};
use solana_client::nonblocking::rpc_client::RpcClient;
use solana_sdk::pubkey::Pubkey;
use spl_associated_token_account::get_associated_token_address;
use std::str::FromStr;
use std::sync::Arc;

/// Rent-exempt minimum for a token account.
pub const TOKEN_ACCOUNT_RENT_LAMPORTS: u64 = 2_039_280;

/// Fixed reservations taken off the wallet balance before sizing a trade.
#[derive(Debug, Clone)]
pub struct Reserves {
    pub safety_buffer_lamports: u64,
    pub flat_fee_lamports: u64,
    pub default_tip_lamports: u64,
    pub min_tip_lamports: u64,
}

/// Outcome of solvency computation: how much may be traded and what tip the
/// fast broadcast lane gets.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SpendPlan {
    pub tip_lamports: u64,
    pub spendable_lamports: u64,
}

/// Reserve, in order: safety buffer, flat fee, rent if a new token account is
/// needed, then the tip. If the default tip does not fit it is scaled down to
/// the minimum viable amount rather than aborting; only when even the minimum
/// does not fit is the wallet insolvent.
pub fn compute_spendable(
    balance_lamports: u64,
    needs_new_token_account: bool,
    reserves: &Reserves,
) -> Result<SpendPlan, ExecError> {
    let rent = if needs_new_token_account {
        TOKEN_ACCOUNT_RENT_LAMPORTS
    } else {
        0
    };
    let fixed = reserves.safety_buffer_lamports + reserves.flat_fee_lamports + rent;

    let after_fixed = balance_lamports.checked_sub(fixed).ok_or_else(|| {
        ExecError::InsufficientFunds(format!(
            "balance {balance_lamports} lamports below fixed reserves {fixed}"
        ))
    })?;

    let tip_lamports = if after_fixed > reserves.default_tip_lamports {
        reserves.default_tip_lamports
    } else if after_fixed > reserves.min_tip_lamports {
        warn!(
            "tip scaled down: {} -> {} lamports (low balance)",
            reserves.default_tip_lamports, reserves.min_tip_lamports
        );
        reserves.min_tip_lamports
    } else {
        return Err(ExecError::InsufficientFunds(format!(
            "balance {balance_lamports} lamports cannot cover minimum tip {}",
            reserves.min_tip_lamports
        )));
    };

    let spendable_lamports = after_fixed - tip_lamports;
    if spendable_lamports == 0 {
        return Err(ExecError::InsufficientFunds(
            "nothing spendable after reserves".into(),
        ));
    }

    debug!(
        "spend plan: balance={} rent={} tip={} spendable={}",
        balance_lamports, rent, tip_lamports, spendable_lamports
    );
    Ok(SpendPlan {
        tip_lamports,
        spendable_lamports,
    })
}

/// Read-only chain view of the signing wallet.
#[async_trait]
pub trait WalletView: Send + Sync {
    async fn lamports(&self) -> Result<u64, ExecError>;
    async fn token_balance(&self, mint: &str) -> Result<u64, ExecError>;
    /// True when the wallet has no associated token account for the mint yet
    /// (i.e. buying this token pays rent for a new account).
    async fn needs_token_account(&self, mint: &str) -> Result<bool, ExecError>;
}

pub struct RpcWallet {
    rpc: Arc<RpcClient>,
    owner: Pubkey,
}

impl RpcWallet {
    pub fn new(rpc: Arc<RpcClient>, owner: Pubkey) -> Self {
        Self { rpc, owner }
    }

    fn ata_for(&self, mint: &str) -> Result<Pubkey, ExecError> {
        let mint = Pubkey::from_str(mint)
            .map_err(|e| ExecError::InvalidSignal(format!("bad mint: {e}")))?;
        Ok(get_associated_token_address(&self.owner, &mint))
    }
}

// The RPC renders a missing account differently per call type; anything else
// is a transport failure and must not be read as "account missing".
fn is_missing_account(message: &str) -> bool {
    message.contains("AccountNotFound") || message.contains("could not find account")
}

#[async_trait]
impl WalletView for RpcWallet {
    async fn lamports(&self) -> Result<u64, ExecError> {
        self.rpc
            .get_balance(&self.owner)
            .await
            .map_err(|e| ExecError::Rpc(e.to_string()))
    }

    async fn token_balance(&self, mint: &str) -> Result<u64, ExecError> {
        let ata = self.ata_for(mint)?;
        match self.rpc.get_token_account_balance(&ata).await {
            Ok(balance) => balance
                .amount
                .parse::<u64>()
                .map_err(|e| ExecError::Rpc(format!("bad token balance: {e}"))),
            // A missing account is a zero balance, not an error.
            Err(e) if is_missing_account(&e.to_string()) => Ok(0),
            Err(e) => Err(ExecError::Rpc(e.to_string())),
        }
    }

    async fn needs_token_account(&self, mint: &str) -> Result<bool, ExecError> {
        let ata = self.ata_for(mint)?;
        match self.rpc.get_account(&ata).await {
            Ok(_) => Ok(false),
            Err(e) if is_missing_account(&e.to_string()) => Ok(true),
            Err(e) => Err(ExecError::Rpc(e.to_string())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn reserves() -> Reserves {
        Reserves {
            safety_buffer_lamports: 5_000_000,
            flat_fee_lamports: 5_000,
            default_tip_lamports: 1_000_000,
            min_tip_lamports: 100_000,
        }
    }

    #[test]
    fn full_tip_when_balance_is_healthy() {
        // 1 SOL
        let plan = compute_spendable(1_000_000_000, false, &reserves()).unwrap();
        assert_eq!(plan.tip_lamports, 1_000_000);
        assert_eq!(plan.spendable_lamports, 1_000_000_000 - 5_005_000 - 1_000_000);
    }

    #[test]
    fn rent_reserved_only_when_new_account_needed() {
        let with = compute_spendable(1_000_000_000, true, &reserves()).unwrap();
        let without = compute_spendable(1_000_000_000, false, &reserves()).unwrap();
        assert_eq!(
            without.spendable_lamports - with.spendable_lamports,
            TOKEN_ACCOUNT_RENT_LAMPORTS
        );
    }

    #[test]
    fn tip_scales_down_before_aborting() {
        // Enough for reserves plus a bit more than the minimum tip, but far
        // short of the default tip.
        let balance = 5_005_000 + 300_000;
        let plan = compute_spendable(balance, false, &reserves()).unwrap();
        assert!(plan.tip_lamports >= 100_000);
        assert!(plan.tip_lamports < 1_000_000);
        assert!(plan.spendable_lamports > 0);
        // Invariant: spendable never exceeds balance minus reserves and tip.
        assert_eq!(plan.spendable_lamports + plan.tip_lamports + 5_005_000, balance);
    }

    #[test]
    fn insolvent_when_below_fixed_reserves() {
        assert!(matches!(
            compute_spendable(4_000_000, false, &reserves()),
            Err(ExecError::InsufficientFunds(_))
        ));
    }

    #[test]
    fn missing_account_is_distinguished_from_transport_errors() {
        assert!(is_missing_account(
            "AccountNotFound: pubkey=7xKXtg2CW87d97TXJSDpbD5jBkheTqA83TZRuJosgAsU"
        ));
        assert!(is_missing_account("could not find account"));
        assert!(!is_missing_account("error sending request: connection refused"));
        assert!(!is_missing_account("request timed out"));
    }

    #[test]
    fn insolvent_when_minimum_tip_does_not_fit() {
        let balance = 5_005_000 + 50_000; // leftover below min tip
        assert!(matches!(
            compute_spendable(balance, false, &reserves()),
            Err(ExecError::InsufficientFunds(_))
        ));
    }
}
