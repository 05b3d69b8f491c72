//! Common types for cross-chain instructions
//!
//! The state enum and its transition table are the contract every other
//! module leans on: no record may persist a state outside this enum, and no
//! update path may apply a transition the table does not list.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Which kind of logical cross-chain operation an instruction drives.
/// Each kind runs under its own poll scheduler and transition table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "VARCHAR", rename_all = "camelCase")]
#[serde(rename_all = "camelCase")]
pub enum InstructionKind {
    Settlement,
    ValidatorSet,
    ValidatorUpdate,
    Swap,
}

impl InstructionKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            InstructionKind::Settlement => "settlement",
            InstructionKind::ValidatorSet => "validatorSet",
            InstructionKind::ValidatorUpdate => "validatorUpdate",
            InstructionKind::Swap => "swap",
        }
    }

    pub const ALL: [InstructionKind; 4] = [
        InstructionKind::Settlement,
        InstructionKind::ValidatorSet,
        InstructionKind::ValidatorUpdate,
        InstructionKind::Swap,
    ];
}

impl fmt::Display for InstructionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl std::str::FromStr for InstructionKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        InstructionKind::ALL
            .into_iter()
            .find(|kind| kind.as_str() == s)
            .ok_or_else(|| format!("unknown instruction kind '{s}'"))
    }
}

/// Instruction lifecycle state.
///
/// The swap kind maps commit/claim/revert onto the same shape: a placed
/// commit is a hold, a claim is the cross-chain execution, a revert runs the
/// cancellation branch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "VARCHAR", rename_all = "camelCase")]
#[serde(rename_all = "camelCase")]
pub enum InstructionState {
    Confirmed,
    WaitingForHold,
    WaitingForCrossBlockchainCallExecuted,
    WaitingForExecuteHoldExecuted,
    WaitingForCommunication,
    Processed,
    TimedOut,
    TimedOutCommunication,
    Failed,
    Cancel,
    Cancelling,
    WaitingForForeignSystemCancellation,
    WaitingForCancelHoldExecuted,
    Cancelled,
}

impl InstructionState {
    pub fn as_str(&self) -> &'static str {
        match self {
            InstructionState::Confirmed => "confirmed",
            InstructionState::WaitingForHold => "waitingForHold",
            InstructionState::WaitingForCrossBlockchainCallExecuted => {
                "waitingForCrossBlockchainCallExecuted"
            }
            InstructionState::WaitingForExecuteHoldExecuted => "waitingForExecuteHoldExecuted",
            InstructionState::WaitingForCommunication => "waitingForCommunication",
            InstructionState::Processed => "processed",
            InstructionState::TimedOut => "timedOut",
            InstructionState::TimedOutCommunication => "timedOutCommunication",
            InstructionState::Failed => "failed",
            InstructionState::Cancel => "cancel",
            InstructionState::Cancelling => "cancelling",
            InstructionState::WaitingForForeignSystemCancellation => {
                "waitingForForeignSystemCancellation"
            }
            InstructionState::WaitingForCancelHoldExecuted => "waitingForCancelHoldExecuted",
            InstructionState::Cancelled => "cancelled",
        }
    }

    /// Terminal states are retained for audit and never swept again.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            InstructionState::Processed
                | InstructionState::Cancelled
                | InstructionState::Failed
                | InstructionState::TimedOut
                | InstructionState::TimedOutCommunication
        )
    }

    /// States from which a record may be deleted. Deleting anywhere else
    /// would orphan a ledger-side hold with no tracking record.
    pub fn is_deletable(&self) -> bool {
        matches!(
            self,
            InstructionState::Confirmed
                | InstructionState::WaitingForHold
                | InstructionState::Failed
        )
    }
}

impl fmt::Display for InstructionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// The fixed transition table. Any (from, to) pair not listed here must be
/// rejected loudly by both the patch path and the state machines.
pub fn is_transition_allowed(from: InstructionState, to: InstructionState) -> bool {
    use InstructionState::*;
    match (from, to) {
        // main settlement path
        (Confirmed, WaitingForHold) => true,
        // validator kinds have no hold phase
        (Confirmed, WaitingForCrossBlockchainCallExecuted) => true,
        (WaitingForHold, WaitingForCrossBlockchainCallExecuted) => true,
        (WaitingForCrossBlockchainCallExecuted, WaitingForExecuteHoldExecuted) => true,
        (WaitingForCrossBlockchainCallExecuted, Processed) => true,
        (WaitingForCrossBlockchainCallExecuted, WaitingForCommunication) => true,
        (WaitingForExecuteHoldExecuted, Processed) => true,
        (WaitingForExecuteHoldExecuted, WaitingForCommunication) => true,
        (WaitingForCommunication, Processed) => true,
        (WaitingForCommunication, TimedOutCommunication) => true,
        // ledger-side timeouts
        (WaitingForHold, TimedOut) => true,
        (WaitingForCrossBlockchainCallExecuted, TimedOut) => true,
        (WaitingForExecuteHoldExecuted, TimedOut) => true,
        // retry whitelist (deliberate, not a general retry policy)
        (Failed, WaitingForHold) => true,
        (TimedOut, WaitingForHold) => true,
        // failure is reachable from every non-terminal working state
        (Confirmed, Failed) => true,
        (WaitingForHold, Failed) => true,
        (WaitingForCrossBlockchainCallExecuted, Failed) => true,
        (WaitingForExecuteHoldExecuted, Failed) => true,
        (WaitingForCommunication, Failed) => true,
        (Cancel, Failed) => true,
        (Cancelling, Failed) => true,
        (WaitingForForeignSystemCancellation, Failed) => true,
        (WaitingForCancelHoldExecuted, Failed) => true,
        // cancellation sub-protocol
        (Confirmed, Cancel) => true,
        (WaitingForHold, Cancel) => true,
        (WaitingForCrossBlockchainCallExecuted, Cancel) => true,
        (Failed, Cancel) => true,
        (WaitingForForeignSystemCancellation, Cancelling) => true,
        (WaitingForHold, Cancelling) => true,
        (Cancel, WaitingForForeignSystemCancellation) => true,
        (Cancel, WaitingForCancelHoldExecuted) => true,
        (Cancelling, WaitingForCancelHoldExecuted) => true,
        (Cancel, Cancelled) => true,
        (Cancelling, Cancelled) => true,
        (WaitingForForeignSystemCancellation, Cancelled) => true,
        (WaitingForCancelHoldExecuted, Cancelled) => true,
        _ => false,
    }
}

/// Kind of ledger a network is. Replaces dynamic dispatch on a "type"
/// string: every network is exactly one of these and the connector
/// implementation is chosen once at startup.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LedgerKind {
    Evm,
    Corda,
}

impl LedgerKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            LedgerKind::Evm => "evm",
            LedgerKind::Corda => "corda",
        }
    }
}

impl fmt::Display for LedgerKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl std::str::FromStr for LedgerKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "evm" | "ethereum" => Ok(LedgerKind::Evm),
            "corda" => Ok(LedgerKind::Corda),
            other => Err(format!("unknown ledger kind: {}", other)),
        }
    }
}

/// Evidence bundle that lets a destination chain trust a source-chain event
/// without trusting this service. Ephemeral: embedded in the instruction
/// result, never persisted on its own.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProofBundle {
    pub source_system_id: u64,
    pub destination_system_id: u64,
    /// Chain-specific encoded event/receipt payload, hex encoded.
    pub encoded_info: String,
    /// Consensus attestation: inclusion witness plus header encodings,
    /// notarization signatures, or an opaque decoder-service output.
    pub signature_or_proof: String,
}

#[cfg(test)]
mod tests {
    use super::*;
    use InstructionState::*;

    const ALL_STATES: [InstructionState; 14] = [
        Confirmed,
        WaitingForHold,
        WaitingForCrossBlockchainCallExecuted,
        WaitingForExecuteHoldExecuted,
        WaitingForCommunication,
        Processed,
        TimedOut,
        TimedOutCommunication,
        Failed,
        Cancel,
        Cancelling,
        WaitingForForeignSystemCancellation,
        WaitingForCancelHoldExecuted,
        Cancelled,
    ];

    #[test]
    fn test_terminal_states_have_no_outgoing_transitions() {
        for from in [Processed, Cancelled, TimedOutCommunication] {
            for to in ALL_STATES {
                assert!(
                    !is_transition_allowed(from, to),
                    "{} -> {} should be rejected",
                    from,
                    to
                );
            }
        }
    }

    #[test]
    fn test_retry_whitelist() {
        assert!(is_transition_allowed(Failed, WaitingForHold));
        assert!(is_transition_allowed(TimedOut, WaitingForHold));
        // no broader retry policy
        assert!(!is_transition_allowed(Failed, Confirmed));
        assert!(!is_transition_allowed(Failed, Processed));
        assert!(!is_transition_allowed(TimedOutCommunication, WaitingForHold));
    }

    #[test]
    fn test_cancelled_only_reachable_from_cancellation_states() {
        let allowed = [
            Cancel,
            Cancelling,
            WaitingForForeignSystemCancellation,
            WaitingForCancelHoldExecuted,
        ];
        for from in ALL_STATES {
            let expected = allowed.contains(&from);
            assert_eq!(
                is_transition_allowed(from, Cancelled),
                expected,
                "{} -> cancelled",
                from
            );
        }
    }

    #[test]
    fn test_no_self_transitions() {
        for state in ALL_STATES {
            assert!(!is_transition_allowed(state, state));
        }
    }

    #[test]
    fn test_deletable_whitelist() {
        assert!(Confirmed.is_deletable());
        assert!(WaitingForHold.is_deletable());
        assert!(Failed.is_deletable());
        assert!(!WaitingForCrossBlockchainCallExecuted.is_deletable());
        assert!(!Processed.is_deletable());
        assert!(!Cancelled.is_deletable());
    }

    #[test]
    fn test_state_round_trips_through_serde() {
        let json = serde_json::to_string(&WaitingForHold).unwrap();
        assert_eq!(json, "\"waitingForHold\"");
        let back: InstructionState = serde_json::from_str(&json).unwrap();
        assert_eq!(back, WaitingForHold);
    }

    #[test]
    fn test_kind_display() {
        assert_eq!(InstructionKind::ValidatorSet.to_string(), "validatorSet");
        assert_eq!(InstructionKind::Swap.to_string(), "swap");
    }
}
