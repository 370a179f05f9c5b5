// Execution error taxonomy. The variant a failure lands in decides whether the
// retry policy gets another attempt and which parameters it escalates.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum ExecError {
    #[error("decimals unresolved for mint {0}")]
    DecimalsUnresolved(String),

    #[error("insufficient funds: {0}")]
    InsufficientFunds(String),

    #[error("quote unavailable: {0}")]
    QuoteUnavailable(String),

    #[error("quote request rejected: {0}")]
    QuoteRejected(String),

    #[error("simulation failed: {0}")]
    SimulationFailed(String),

    #[error("all broadcast channels failed: {0}")]
    BroadcastFailed(String),

    #[error("confirmation timeout for {0}")]
    ConfirmationTimeout(String),

    #[error("on-chain program error{}: {message}", .code.map(|c| format!(" {c:#x}")).unwrap_or_default())]
    OnChainProgramError { code: Option<u32>, message: String },

    #[error("no open position for signal {0}")]
    PositionNotOpen(String),

    #[error("invalid signal payload: {0}")]
    InvalidSignal(String),

    #[error("rpc error: {0}")]
    Rpc(String),

    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("store error: {0}")]
    Store(String),
}

/// Coarse failure class driving the next attempt's parameter escalation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureClass {
    /// Slippage tolerance exceeded on-chain.
    SlippageExceeded,
    /// Generic simulation failure (no recognizable program code).
    Simulation,
    /// Stale blockhash, confirmation timeout, or a dead broadcast path; the
    /// old quote and blockhash are unusable either way.
    Expired,
    /// Aggregator route-specific program failure (e.g. shared-accounts route).
    RouteProgram,
    /// The quote request itself was rejected (HTTP 400).
    QuoteRejected,
    /// No parameter adjustment can help; terminal immediately.
    Fatal,
}

// Jupiter v6 program custom error codes observed in the wild.
const JUP_SLIPPAGE_EXCEEDED: u32 = 6001; // 0x1771
const JUP_NOT_ENOUGH_ACCOUNT_KEYS: u32 = 6024;
const JUP_INVALID_CALCULATION: u32 = 6014;

impl ExecError {
    pub fn class(&self) -> FailureClass {
        match self {
            ExecError::OnChainProgramError { code, message } => {
                classify_program_error(*code, message)
            }
            ExecError::SimulationFailed(_) => FailureClass::Simulation,
            ExecError::ConfirmationTimeout(_)
            | ExecError::BroadcastFailed(_)
            | ExecError::QuoteUnavailable(_)
            | ExecError::Rpc(_)
            | ExecError::Http(_) => FailureClass::Expired,
            ExecError::QuoteRejected(_) => FailureClass::QuoteRejected,
            _ => FailureClass::Fatal,
        }
    }

    pub fn is_retryable(&self) -> bool {
        self.class() != FailureClass::Fatal
    }
}

/// Map a program error code/message onto a failure class. Codes win over
/// message sniffing; the message path covers RPC variants that only surface
/// the rendered error string.
pub fn classify_program_error(code: Option<u32>, message: &str) -> FailureClass {
    if let Some(c) = code {
        return match c {
            JUP_SLIPPAGE_EXCEEDED => FailureClass::SlippageExceeded,
            JUP_NOT_ENOUGH_ACCOUNT_KEYS | JUP_INVALID_CALCULATION => FailureClass::RouteProgram,
            _ => FailureClass::Simulation,
        };
    }
    let lower = message.to_lowercase();
    if lower.contains("0x1771") || lower.contains("slippage") {
        FailureClass::SlippageExceeded
    } else if lower.contains("shared account") || lower.contains("route plan") {
        FailureClass::RouteProgram
    } else if lower.contains("blockhash") || lower.contains("block height exceeded") {
        FailureClass::Expired
    } else {
        FailureClass::Simulation
    }
}

/// Extract a custom program error code from a rendered transaction error,
/// e.g. "custom program error: 0x1771".
pub fn extract_custom_error_code(message: &str) -> Option<u32> {
    let idx = message.find("custom program error: ")?;
    let rest = &message[idx + "custom program error: ".len()..];
    let token: String = rest
        .chars()
        .take_while(|c| c.is_ascii_alphanumeric())
        .collect();
    if let Some(hex) = token.strip_prefix("0x") {
        u32::from_str_radix(hex, 16).ok()
    } else {
        token.parse().ok()
    }
}
