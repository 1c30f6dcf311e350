//! IKEv1 state machines
//!
//! Every exchange numbers its states so that initiator states are odd,
//! responder states even, and each round trip advances a side by two:
//!
//! ```text
//! Main Mode (identity protection)
//!   I1 SA -> R1 SA -> I2 KE,Ni -> R2 KE,Nr -> I3 ID,HASH_I -> R3 ID,HASH_R -> I4
//!
//! Aggressive Mode
//!   I1 SA,KE,Ni,ID -> R1 SA,KE,Nr,ID,HASH_R -> I2 HASH_I -> R2
//!
//! Quick Mode
//!   I1 HASH(1),SA,Ni -> R1 HASH(2),SA,Nr -> I2 HASH(3) -> R2 [HASH(4),CONNECTED] -> I3
//! ```
//!
//! A state names the step that handles the next message. I3 of Quick Mode
//! exists only when the responder set the commit bit: the initiator then
//! waits for CONNECTED before installing.

use crate::error::{Error, Result};

const NEXT_STATE_INC: u8 = 2;

/// Phase 1 exchange flavour
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Phase1Mode {
    /// Identity protection (six messages)
    Main,
    /// Aggressive (three messages)
    Aggressive,
}

impl Phase1Mode {
    /// Number of states
    pub fn state_count(self) -> u8 {
        match self {
            Phase1Mode::Main => 7,
            Phase1Mode::Aggressive => 4,
        }
    }

    /// Name used in logs
    pub fn name(self) -> &'static str {
        match self {
            Phase1Mode::Main => "MAIN",
            Phase1Mode::Aggressive => "AGGRESSIVE",
        }
    }
}

/// Position of a Phase 1 or Quick Mode exchange
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ExchangeKind {
    /// Phase 1 in the given mode
    Phase1(Phase1Mode),
    /// Quick Mode
    Quick,
}

impl ExchangeKind {
    /// Number of states
    pub fn state_count(self) -> u8 {
        match self {
            ExchangeKind::Phase1(mode) => mode.state_count(),
            ExchangeKind::Quick => 5,
        }
    }

    fn prefix(self) -> &'static str {
        match self {
            ExchangeKind::Phase1(Phase1Mode::Main) => "MM",
            ExchangeKind::Phase1(Phase1Mode::Aggressive) => "AM",
            ExchangeKind::Quick => "QM",
        }
    }
}

/// State of one exchange
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ExchangeState {
    kind: ExchangeKind,
    number: u8,
}

impl ExchangeState {
    /// First state of a side
    pub fn start(kind: ExchangeKind, initiator: bool) -> Self {
        ExchangeState {
            kind,
            number: if initiator { 1 } else { 2 },
        }
    }

    /// Exchange this state belongs to
    pub fn kind(self) -> ExchangeKind {
        self.kind
    }

    /// State number, 1-based
    pub fn number(self) -> u8 {
        self.number
    }

    /// Whether the state belongs to the initiator
    pub fn is_initiator(self) -> bool {
        self.number % 2 == 1
    }

    /// Quick Mode initiator waiting for CONNECTED
    pub fn is_commit_wait(self) -> bool {
        self.kind == ExchangeKind::Quick && self.number == 5
    }

    /// State after one more round trip
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidState`] past the last state of the exchange.
    pub fn next(self) -> Result<Self> {
        let number = self.number + NEXT_STATE_INC;
        if number > self.kind.state_count() {
            return Err(Error::InvalidState(format!("No state after {}", self.name())));
        }
        Ok(ExchangeState {
            kind: self.kind,
            number,
        })
    }

    /// Name used in logs, such as `MM_R2`
    pub fn name(self) -> String {
        let side = if self.is_initiator() { 'I' } else { 'R' };
        format!("{}_{}{}", self.kind.prefix(), side, self.number.div_ceil(2))
    }
}

/// ISAKMP SA lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum IsakmpSaState {
    /// Phase 1 in progress
    Negotiating,
    /// Authenticated, Quick Mode allowed
    Established,
    /// Soft lifetime passed; new negotiations use a fresh SA
    Expiring,
    /// Removed
    Deleted,
}

impl IsakmpSaState {
    /// Whether Phase 2 exchanges may run under the SA
    pub fn is_established(self) -> bool {
        matches!(self, IsakmpSaState::Established | IsakmpSaState::Expiring)
    }

    /// Whether `next` may follow
    pub fn can_transition_to(self, next: IsakmpSaState) -> bool {
        use IsakmpSaState::*;
        matches!(
            (self, next),
            (Negotiating, Established)
                | (Established, Expiring)
                | (_, Deleted)
        ) && self != Deleted
    }

    /// Name used in logs
    pub fn name(self) -> &'static str {
        match self {
            IsakmpSaState::Negotiating => "NEGOTIATING",
            IsakmpSaState::Established => "ESTABLISHED",
            IsakmpSaState::Expiring => "EXPIRING",
            IsakmpSaState::Deleted => "DELETED",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_main_mode_walk() {
        let kind = ExchangeKind::Phase1(Phase1Mode::Main);
        let mut i = ExchangeState::start(kind, true);
        let mut names = vec![i.name()];
        while let Ok(next) = i.next() {
            i = next;
            names.push(i.name());
        }
        assert_eq!(names, ["MM_I1", "MM_I2", "MM_I3", "MM_I4"]);

        let r = ExchangeState::start(kind, false);
        assert_eq!(r.next().unwrap().next().unwrap().name(), "MM_R3");
        assert!(r.next().unwrap().next().unwrap().next().is_err());
    }

    #[test]
    fn test_aggressive_and_quick_counts() {
        let am = ExchangeState::start(ExchangeKind::Phase1(Phase1Mode::Aggressive), true);
        assert_eq!(am.next().unwrap().number(), 3);
        assert!(am.next().unwrap().next().is_err());

        let qm = ExchangeState::start(ExchangeKind::Quick, true);
        let wait = qm.next().unwrap().next().unwrap();
        assert!(wait.is_commit_wait());
        assert_eq!(wait.name(), "QM_I3");
        assert!(!ExchangeState::start(ExchangeKind::Quick, false).is_initiator());
    }

    #[test]
    fn test_sa_lifecycle() {
        use IsakmpSaState::*;
        assert!(Negotiating.can_transition_to(Established));
        assert!(Established.can_transition_to(Expiring));
        assert!(Expiring.can_transition_to(Deleted));
        assert!(!Established.can_transition_to(Negotiating));
        assert!(!Deleted.can_transition_to(Deleted));
        assert!(Expiring.is_established());
    }
}
