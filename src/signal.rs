// Trade signal model + webhook payload normalization.
//
// The upstream agent service has gone through several payload shapes; the
// fallback field-name table below absorbs all of them so the execution core
// only ever sees a normalized TradeSignal.

use crate::error::ExecError;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Native SOL wrapped mint.
pub const NATIVE_MINT: &str = "So11111111111111111111111111111111111111112";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Action {
    Buy,
    Sell,
}

impl Action {
    pub fn as_str(&self) -> &'static str {
        match self {
            Action::Buy => "BUY",
            Action::Sell => "SELL",
        }
    }
}

/// Normalized trade intent. Immutable once handed to the executor;
/// `signal_id` is the idempotency key.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TradeSignal {
    pub action: Action,
    pub signal_id: String,
    pub input_mint: String,
    pub output_mint: String,
    pub input_amount: f64,
    pub symbol: Option<String>,
}

impl TradeSignal {
    /// Idempotency claim key. The action is part of the key so a SELL that
    /// references its BUY's signal id is not mistaken for a duplicate.
    pub fn claim_key(&self) -> String {
        format!("{}:{}", self.action.as_str(), self.signal_id)
    }
}

// Fallback field-name table, tried in order.
const ACTION_FIELDS: &[&str] = &["action", "side", "type"];
const SIGNAL_ID_FIELDS: &[&str] = &["signal_id", "signalId", "id", "uuid"];
const INPUT_MINT_FIELDS: &[&str] = &["input_mint", "inputMint", "from_mint", "fromMint", "in_token"];
const OUTPUT_MINT_FIELDS: &[&str] = &["output_mint", "outputMint", "to_mint", "toMint", "out_token"];
const AMOUNT_FIELDS: &[&str] = &["input_amount", "inputAmount", "amount", "amount_in", "amountIn", "size"];
const SYMBOL_FIELDS: &[&str] = &["symbol", "ticker", "token_symbol"];

fn first_str<'a>(raw: &'a Value, names: &[&str]) -> Option<&'a str> {
    names.iter().find_map(|n| raw.get(n).and_then(|v| v.as_str()))
}

fn first_number(raw: &Value, names: &[&str]) -> Option<f64> {
    names.iter().find_map(|n| {
        let v = raw.get(n)?;
        v.as_f64().or_else(|| v.as_str().and_then(|s| s.parse().ok()))
    })
}

/// Normalize a raw webhook payload into a TradeSignal.
pub fn normalize(raw: &Value) -> Result<TradeSignal, ExecError> {
    let action_str = first_str(raw, ACTION_FIELDS)
        .ok_or_else(|| ExecError::InvalidSignal("missing action field".into()))?;
    let action = match action_str.to_ascii_uppercase().as_str() {
        "BUY" => Action::Buy,
        "SELL" => Action::Sell,
        other => {
            return Err(ExecError::InvalidSignal(format!("unknown action '{other}'")));
        }
    };

    let signal_id = first_str(raw, SIGNAL_ID_FIELDS)
        .ok_or_else(|| ExecError::InvalidSignal("missing signal_id field".into()))?
        .to_string();

    // BUY spends native SOL unless told otherwise; SELL exits back to SOL
    // unless told otherwise.
    let input_mint = match first_str(raw, INPUT_MINT_FIELDS) {
        Some(m) => m.to_string(),
        None if action == Action::Buy => NATIVE_MINT.to_string(),
        None => return Err(ExecError::InvalidSignal("SELL missing input_mint".into())),
    };
    let output_mint = match first_str(raw, OUTPUT_MINT_FIELDS) {
        Some(m) => m.to_string(),
        None if action == Action::Sell => NATIVE_MINT.to_string(),
        None => return Err(ExecError::InvalidSignal("BUY missing output_mint".into())),
    };

    let input_amount = first_number(raw, AMOUNT_FIELDS)
        .ok_or_else(|| ExecError::InvalidSignal("missing input_amount field".into()))?;
    if !input_amount.is_finite() || input_amount <= 0.0 {
        return Err(ExecError::InvalidSignal(format!(
            "non-positive input_amount {input_amount}"
        )));
    }

    let symbol = first_str(raw, SYMBOL_FIELDS).map(|s| s.to_string());

    Ok(TradeSignal {
        action,
        signal_id,
        input_mint,
        output_mint,
        input_amount,
        symbol,
    })
}

/// Convert a UI amount to minor units given the mint's decimals. Rounded,
/// not truncated: 0.29 × 10^9 in f64 is fractionally below 290_000_000.
pub fn ui_to_minor(amount: f64, decimals: u8) -> u64 {
    (amount * 10f64.powi(decimals as i32)).round() as u64
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn canonical_payload_normalizes() {
        let raw = json!({
            "action": "BUY",
            "signal_id": "s1",
            "output_mint": "TOKENX",
            "input_amount": 0.5,
            "symbol": "TKX"
        });
        let sig = normalize(&raw).unwrap();
        assert_eq!(sig.action, Action::Buy);
        assert_eq!(sig.signal_id, "s1");
        assert_eq!(sig.input_mint, NATIVE_MINT);
        assert_eq!(sig.output_mint, "TOKENX");
        assert_eq!(sig.input_amount, 0.5);
        assert_eq!(sig.symbol.as_deref(), Some("TKX"));
    }

    #[test]
    fn legacy_field_names_are_accepted() {
        let raw = json!({
            "side": "sell",
            "signalId": "s2",
            "inputMint": "TOKENX",
            "amountIn": "123.25"
        });
        let sig = normalize(&raw).unwrap();
        assert_eq!(sig.action, Action::Sell);
        assert_eq!(sig.signal_id, "s2");
        assert_eq!(sig.input_mint, "TOKENX");
        assert_eq!(sig.output_mint, NATIVE_MINT);
        assert_eq!(sig.input_amount, 123.25);
    }

    #[test]
    fn missing_action_is_rejected() {
        let raw = json!({ "signal_id": "s3", "amount": 1.0 });
        assert!(matches!(normalize(&raw), Err(ExecError::InvalidSignal(_))));
    }

    #[test]
    fn zero_or_negative_amount_is_rejected() {
        for amount in [0.0, -1.5] {
            let raw = json!({
                "action": "BUY",
                "id": "s4",
                "output_mint": "TOKENX",
                "amount": amount
            });
            assert!(matches!(normalize(&raw), Err(ExecError::InvalidSignal(_))));
        }
    }

    #[test]
    fn claim_key_distinguishes_actions() {
        let raw_buy = json!({"action": "BUY", "id": "s5", "output_mint": "T", "amount": 1.0});
        let raw_sell = json!({"action": "SELL", "id": "s5", "input_mint": "T", "amount": 1.0});
        let buy = normalize(&raw_buy).unwrap();
        let sell = normalize(&raw_sell).unwrap();
        assert_ne!(buy.claim_key(), sell.claim_key());
    }

    #[test]
    fn ui_to_minor_conversion() {
        assert_eq!(ui_to_minor(0.5, 9), 500_000_000);
        assert_eq!(ui_to_minor(1.0, 6), 1_000_000);
        // 0.29 has no exact f64 representation; truncation would lose a unit.
        assert_eq!(ui_to_minor(0.29, 9), 290_000_000);
    }
}
