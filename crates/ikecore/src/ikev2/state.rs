//! IKEv2 state machine
//!
//! Exchange handles walk numbered states. The initiator and responder
//! start states of an exchange differ by one and every round trip
//! advances a handle by the same increment:
//!
//! ```text
//! IKE_SA_INIT / IKE_AUTH
//!   initiator:  SA_INIT_I(1) -> AUTH_I(3) -> AUTH_I_RESPONSE(5) -> COMPLETE
//!   responder:  SA_INIT_R(2) -> AUTH_R(4) -> COMPLETE
//!
//! CREATE_CHILD_SA
//!   initiator:  CREATE_CHILD_I(6) -> CREATE_CHILD_I_RESPONSE(8) -> COMPLETE
//!   responder:  CREATE_CHILD_R(7) -> COMPLETE
//! ```
//!
//! The IKE SA itself has a coarser lifecycle:
//!
//! ```text
//! NEGOTIATING
//!   ↓ (IKE_AUTH completed)
//! ESTABLISHED
//!   ↓ (IKE SA re-key started)       ↓ (delete sent)
//! REKEYING                        WAIT_DELETE
//!   ↓ (replacement established)     ↓ (delete answered)
//! REPLACED                        DELETED
//! ```

use crate::error::{Error, Result};

/// Increment between a handle's consecutive states
const NEXT_STATE_INC: u8 = 2;

/// State of one exchange handle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ExchangeState {
    /// Send IKE_SA_INIT request
    SaInitI,
    /// Answer IKE_SA_INIT request
    SaInitR,
    /// Process IKE_SA_INIT response, send IKE_AUTH request
    AuthI,
    /// Answer IKE_AUTH request
    AuthR,
    /// Process IKE_AUTH response
    AuthIResponse,
    /// Send CREATE_CHILD_SA request
    CreateChildI,
    /// Answer CREATE_CHILD_SA request
    CreateChildR,
    /// Process CREATE_CHILD_SA response
    CreateChildIResponse,
    /// Exchange finished
    Complete,
}

impl ExchangeState {
    /// State number (Complete has none)
    pub fn number(self) -> Option<u8> {
        use ExchangeState::*;
        match self {
            SaInitI => Some(1),
            SaInitR => Some(2),
            AuthI => Some(3),
            AuthR => Some(4),
            AuthIResponse => Some(5),
            CreateChildI => Some(6),
            CreateChildR => Some(7),
            CreateChildIResponse => Some(8),
            Complete => None,
        }
    }

    fn from_number(number: u8) -> Option<Self> {
        use ExchangeState::*;
        match number {
            1 => Some(SaInitI),
            2 => Some(SaInitR),
            3 => Some(AuthI),
            4 => Some(AuthR),
            5 => Some(AuthIResponse),
            6 => Some(CreateChildI),
            7 => Some(CreateChildR),
            8 => Some(CreateChildIResponse),
            _ => None,
        }
    }

    /// Last state of each chain before completion
    fn is_final(self) -> bool {
        matches!(
            self,
            ExchangeState::AuthR
                | ExchangeState::AuthIResponse
                | ExchangeState::CreateChildR
                | ExchangeState::CreateChildIResponse
        )
    }

    /// State after one more round trip
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidState`] for a completed handle.
    pub fn next(self) -> Result<Self> {
        if self.is_final() {
            return Ok(ExchangeState::Complete);
        }
        self.number()
            .and_then(|n| Self::from_number(n + NEXT_STATE_INC))
            .ok_or_else(|| Error::InvalidState(format!("No state after {:?}", self)))
    }

    /// Whether the handle is finished
    pub fn is_complete(self) -> bool {
        self == ExchangeState::Complete
    }

    /// Name used in logs
    pub fn name(self) -> &'static str {
        use ExchangeState::*;
        match self {
            SaInitI => "SA_INIT_I",
            SaInitR => "SA_INIT_R",
            AuthI => "AUTH_I",
            AuthR => "AUTH_R",
            AuthIResponse => "AUTH_I_RESPONSE",
            CreateChildI => "CREATE_CHILD_I",
            CreateChildR => "CREATE_CHILD_R",
            CreateChildIResponse => "CREATE_CHILD_I_RESPONSE",
            Complete => "COMPLETE",
        }
    }
}

/// IKE SA state
///
/// Represents the current state of an IKE Security Association.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum IkeSaState {
    /// IKE_SA_INIT / IKE_AUTH in progress
    Negotiating,
    /// IKE SA established, ready for Child SA creation
    Established,
    /// Replacement IKE SA being negotiated
    Rekeying,
    /// Replaced by a re-keyed IKE SA, waiting for its deletion
    Replaced,
    /// Delete sent, waiting for the answer
    WaitDelete,
    /// IKE SA deleted
    Deleted,
}

impl IkeSaState {
    /// Check if state is a valid next state
    pub fn can_transition_to(self, next: IkeSaState) -> bool {
        use IkeSaState::*;

        match (self, next) {
            (Negotiating, Established) => true,

            (Established, Rekeying) => true,
            (Rekeying, Established) => true,
            (Rekeying, Replaced) => true,
            (Established, Replaced) => true,

            // Deletion from any live state
            (Deleted, _) => false,
            (_, WaitDelete) | (_, Deleted) => true,

            // Stay in same state (retransmission, etc.)
            (s1, s2) if s1 == s2 => true,

            _ => false,
        }
    }

    /// Check if IKE SA is established
    pub fn is_established(self) -> bool {
        matches!(self, IkeSaState::Established | IkeSaState::Rekeying)
    }

    /// Name used in logs
    pub fn name(self) -> &'static str {
        match self {
            IkeSaState::Negotiating => "NEGOTIATING",
            IkeSaState::Established => "ESTABLISHED",
            IkeSaState::Rekeying => "REKEYING",
            IkeSaState::Replaced => "REPLACED",
            IkeSaState::WaitDelete => "WAIT_DELETE",
            IkeSaState::Deleted => "DELETED",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_initiator_chain() {
        let mut state = ExchangeState::SaInitI;
        let mut seen = vec![state];
        while !state.is_complete() {
            state = state.next().unwrap();
            seen.push(state);
        }
        assert_eq!(
            seen,
            vec![
                ExchangeState::SaInitI,
                ExchangeState::AuthI,
                ExchangeState::AuthIResponse,
                ExchangeState::Complete
            ]
        );
    }

    #[test]
    fn test_responder_chain() {
        assert_eq!(ExchangeState::SaInitR.next(), Ok(ExchangeState::AuthR));
        assert_eq!(ExchangeState::AuthR.next(), Ok(ExchangeState::Complete));
        assert_eq!(
            ExchangeState::CreateChildI.next(),
            Ok(ExchangeState::CreateChildIResponse)
        );
        assert_eq!(ExchangeState::CreateChildR.next(), Ok(ExchangeState::Complete));
        assert!(ExchangeState::Complete.next().is_err());
    }

    #[test]
    fn test_state_numbers_step_by_increment() {
        let a = ExchangeState::SaInitI.number().unwrap();
        let b = ExchangeState::AuthI.number().unwrap();
        assert_eq!(b - a, NEXT_STATE_INC);
        assert_eq!(ExchangeState::Complete.number(), None);
    }

    #[test]
    fn test_ike_sa_transitions() {
        use IkeSaState::*;
        assert!(Negotiating.can_transition_to(Established));
        assert!(Established.can_transition_to(Rekeying));
        assert!(Rekeying.can_transition_to(Replaced));
        assert!(Negotiating.can_transition_to(Deleted));
        assert!(Established.can_transition_to(WaitDelete));
        assert!(!Deleted.can_transition_to(WaitDelete));
        assert!(!Negotiating.can_transition_to(Rekeying));
        assert!(!Replaced.can_transition_to(Established));
        assert!(Rekeying.is_established());
        assert!(!WaitDelete.is_established());
    }
}
