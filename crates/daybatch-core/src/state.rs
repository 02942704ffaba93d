//! Status sum types for batches, items, orders and OCO groups.
//!
//! Every status persisted by the store is a closed enum here with a short
//! DB code, a terminal-state predicate and, for items, an explicit legal
//! transition table. Invalid codes and illegal transitions surface as
//! errors instead of silent writes.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::error::CoreError;

/// Batch lifecycle status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum BatchStatus {
    Scheduled,
    Running,
    Paused,
    Done,
    Error,
    Cancelled,
}

impl BatchStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Scheduled => "SCHEDULED",
            Self::Running => "RUNNING",
            Self::Paused => "PAUSED",
            Self::Done => "DONE",
            Self::Error => "ERROR",
            Self::Cancelled => "CANCELLED",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Done | Self::Error | Self::Cancelled)
    }
}

impl fmt::Display for BatchStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for BatchStatus {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "SCHEDULED" => Ok(Self::Scheduled),
            "RUNNING" => Ok(Self::Running),
            "PAUSED" => Ok(Self::Paused),
            "DONE" => Ok(Self::Done),
            "ERROR" => Ok(Self::Error),
            "CANCELLED" => Ok(Self::Cancelled),
            other => Err(CoreError::UnknownStatusCode(other.to_string())),
        }
    }
}

/// How a batch is started.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RunMode {
    /// Picked up by the scheduler on its next tick.
    Immediate,
    /// Fires at `scheduled_at`.
    Scheduled,
}

impl RunMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Immediate => "immediate",
            Self::Scheduled => "scheduled",
        }
    }
}

impl fmt::Display for RunMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RunMode {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "immediate" => Ok(Self::Immediate),
            "scheduled" => Ok(Self::Scheduled),
            other => Err(CoreError::UnknownStatusCode(other.to_string())),
        }
    }
}

/// Per-symbol item state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ItemState {
    Ready,
    EntrySent,
    EntryPartial,
    EntryFilled,
    BracketSent,
    TpFilled,
    SlFilled,
    EodMarketSent,
    Closed,
    Error,
}

impl ItemState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Ready => "READY",
            Self::EntrySent => "ENTRY_SENT",
            Self::EntryPartial => "ENTRY_PARTIAL",
            Self::EntryFilled => "ENTRY_FILLED",
            Self::BracketSent => "BRACKET_SENT",
            Self::TpFilled => "TP_FILLED",
            Self::SlFilled => "SL_FILLED",
            Self::EodMarketSent => "EOD_MARKET_SENT",
            Self::Closed => "CLOSED",
            Self::Error => "ERROR",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Closed | Self::Error)
    }

    /// Legal transition table. Same-state writes are allowed (fill
    /// progress updates re-assert the current state).
    pub fn can_transition(&self, to: ItemState) -> bool {
        use ItemState::*;
        if *self == to {
            return !self.is_terminal();
        }
        // A non-terminal item may always fail or be force-closed at EOD.
        if !self.is_terminal() && matches!(to, Error | EodMarketSent) {
            return true;
        }
        match (*self, to) {
            (Ready, EntrySent) => true,
            // Entry cancelled or expired before any fill.
            (Ready | EntrySent, Closed) => true,
            (EntrySent, EntryPartial | EntryFilled) => true,
            (EntryPartial, EntryFilled | BracketSent) => true,
            (EntryFilled, BracketSent) => true,
            (BracketSent, TpFilled | SlFilled) => true,
            // All covered slices closed while the entry terminated short
            // of the planned qty, or mixed TP+SL outcome.
            (EntryPartial | BracketSent, Closed) => true,
            (TpFilled | SlFilled | EodMarketSent, Closed) => true,
            _ => false,
        }
    }
}

impl fmt::Display for ItemState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ItemState {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "READY" => Ok(Self::Ready),
            "ENTRY_SENT" => Ok(Self::EntrySent),
            "ENTRY_PARTIAL" => Ok(Self::EntryPartial),
            "ENTRY_FILLED" => Ok(Self::EntryFilled),
            "BRACKET_SENT" => Ok(Self::BracketSent),
            "TP_FILLED" => Ok(Self::TpFilled),
            "SL_FILLED" => Ok(Self::SlFilled),
            "EOD_MARKET_SENT" => Ok(Self::EodMarketSent),
            "CLOSED" => Ok(Self::Closed),
            "ERROR" => Ok(Self::Error),
            other => Err(CoreError::UnknownStatusCode(other.to_string())),
        }
    }
}

/// Broker-order lifecycle status as tracked in the store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OrderStatus {
    New,
    Working,
    Partial,
    Filled,
    Cancelled,
    Expired,
    Rejected,
}

impl OrderStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::New => "NEW",
            Self::Working => "WORKING",
            Self::Partial => "PARTIAL",
            Self::Filled => "FILLED",
            Self::Cancelled => "CANCELLED",
            Self::Expired => "EXPIRED",
            Self::Rejected => "REJECTED",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Filled | Self::Cancelled | Self::Expired | Self::Rejected)
    }

    /// Still live at the broker (cancel can be attempted).
    pub fn is_active(&self) -> bool {
        !self.is_terminal()
    }
}

impl fmt::Display for OrderStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for OrderStatus {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "NEW" => Ok(Self::New),
            "WORKING" => Ok(Self::Working),
            "PARTIAL" => Ok(Self::Partial),
            "FILLED" => Ok(Self::Filled),
            "CANCELLED" => Ok(Self::Cancelled),
            "EXPIRED" => Ok(Self::Expired),
            "REJECTED" => Ok(Self::Rejected),
            other => Err(CoreError::UnknownStatusCode(other.to_string())),
        }
    }
}

/// OCO group lifecycle.
///
/// A group is inserted `PREPARING` as the intent row before the first
/// bracket submit and only becomes `ACTIVE` once both broker ids are
/// recorded. Groups are never deleted; abandoned intents are `CLOSED`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OcoStatus {
    Preparing,
    Active,
    TpFilled,
    SlFilled,
    Closed,
}

impl OcoStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Preparing => "PREPARING",
            Self::Active => "ACTIVE",
            Self::TpFilled => "TP_FILLED",
            Self::SlFilled => "SL_FILLED",
            Self::Closed => "CLOSED",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Closed)
    }
}

impl fmt::Display for OcoStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for OcoStatus {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "PREPARING" => Ok(Self::Preparing),
            "ACTIVE" => Ok(Self::Active),
            "TP_FILLED" => Ok(Self::TpFilled),
            "SL_FILLED" => Ok(Self::SlFilled),
            "CLOSED" => Ok(Self::Closed),
            other => Err(CoreError::UnknownStatusCode(other.to_string())),
        }
    }
}

/// Bracket fan-out mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OcoMode {
    /// One TP/SL pair per observed fill delta.
    #[default]
    PerPartial,
    /// A single pair once the entry is fully filled.
    PostComplete,
}

impl OcoMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::PerPartial => "per_partial",
            Self::PostComplete => "post_complete",
        }
    }
}

impl fmt::Display for OcoMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for OcoMode {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "per_partial" => Ok(Self::PerPartial),
            "post_complete" => Ok(Self::PostComplete),
            other => Err(CoreError::UnknownStatusCode(other.to_string())),
        }
    }
}

/// How a closed item ended, recorded for display.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CloseOutcome {
    TpFilled,
    SlFilled,
    /// Groups closed on both legs across partial slices.
    Mixed,
    Eod,
    /// Entry died before any fill; nothing to protect.
    EntryCancelled,
}

impl CloseOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::TpFilled => "TP_FILLED",
            Self::SlFilled => "SL_FILLED",
            Self::Mixed => "MIXED",
            Self::Eod => "EOD",
            Self::EntryCancelled => "ENTRY_CANCELLED",
        }
    }
}

impl fmt::Display for CloseOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for CloseOutcome {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "TP_FILLED" => Ok(Self::TpFilled),
            "SL_FILLED" => Ok(Self::SlFilled),
            "MIXED" => Ok(Self::Mixed),
            "EOD" => Ok(Self::Eod),
            "ENTRY_CANCELLED" => Ok(Self::EntryCancelled),
            other => Err(CoreError::UnknownStatusCode(other.to_string())),
        }
    }
}

/// Severity of a persisted event row.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum EventLevel {
    Debug,
    Info,
    Warn,
    Error,
}

impl EventLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Debug => "DEBUG",
            Self::Info => "INFO",
            Self::Warn => "WARN",
            Self::Error => "ERROR",
        }
    }
}

impl fmt::Display for EventLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_batch_status_round_trip() {
        for s in [
            BatchStatus::Scheduled,
            BatchStatus::Running,
            BatchStatus::Paused,
            BatchStatus::Done,
            BatchStatus::Error,
            BatchStatus::Cancelled,
        ] {
            assert_eq!(s.as_str().parse::<BatchStatus>().unwrap(), s);
        }
        assert!("FROZEN".parse::<BatchStatus>().is_err());
    }

    #[test]
    fn test_batch_terminal_states() {
        assert!(BatchStatus::Done.is_terminal());
        assert!(BatchStatus::Error.is_terminal());
        assert!(BatchStatus::Cancelled.is_terminal());
        assert!(!BatchStatus::Running.is_terminal());
        assert!(!BatchStatus::Paused.is_terminal());
    }

    #[test]
    fn test_item_happy_path_transitions() {
        use ItemState::*;
        assert!(Ready.can_transition(EntrySent));
        assert!(EntrySent.can_transition(EntryPartial));
        assert!(EntrySent.can_transition(EntryFilled));
        assert!(EntryPartial.can_transition(EntryFilled));
        assert!(EntryPartial.can_transition(BracketSent));
        assert!(EntryFilled.can_transition(BracketSent));
        assert!(BracketSent.can_transition(TpFilled));
        assert!(BracketSent.can_transition(SlFilled));
        assert!(TpFilled.can_transition(Closed));
        assert!(SlFilled.can_transition(Closed));
    }

    #[test]
    fn test_item_eod_and_error_from_any_non_terminal() {
        use ItemState::*;
        for s in [Ready, EntrySent, EntryPartial, EntryFilled, BracketSent, TpFilled, SlFilled] {
            assert!(s.can_transition(EodMarketSent), "{s} -> EOD_MARKET_SENT");
            assert!(s.can_transition(Error), "{s} -> ERROR");
        }
        assert!(EodMarketSent.can_transition(Closed));
    }

    #[test]
    fn test_item_terminal_states_are_sinks() {
        use ItemState::*;
        for target in [
            Ready,
            EntrySent,
            EntryPartial,
            EntryFilled,
            BracketSent,
            TpFilled,
            SlFilled,
            EodMarketSent,
            Closed,
            Error,
        ] {
            assert!(!Closed.can_transition(target), "CLOSED -> {target}");
            assert!(!Error.can_transition(target), "ERROR -> {target}");
        }
    }

    #[test]
    fn test_item_illegal_transitions() {
        use ItemState::*;
        assert!(!Ready.can_transition(BracketSent));
        assert!(!Ready.can_transition(EntryFilled));
        assert!(!EntryFilled.can_transition(EntrySent));
        assert!(!BracketSent.can_transition(EntrySent));
        assert!(!TpFilled.can_transition(SlFilled));
    }

    #[test]
    fn test_item_same_state_reassert() {
        assert!(ItemState::EntryPartial.can_transition(ItemState::EntryPartial));
        assert!(!ItemState::Closed.can_transition(ItemState::Closed));
    }

    #[test]
    fn test_entry_cancel_before_fill_closes() {
        assert!(ItemState::EntrySent.can_transition(ItemState::Closed));
    }

    #[test]
    fn test_order_status_predicates() {
        assert!(OrderStatus::New.is_active());
        assert!(OrderStatus::Working.is_active());
        assert!(OrderStatus::Partial.is_active());
        for s in [
            OrderStatus::Filled,
            OrderStatus::Cancelled,
            OrderStatus::Expired,
            OrderStatus::Rejected,
        ] {
            assert!(s.is_terminal());
            assert!(!s.is_active());
        }
    }

    #[test]
    fn test_oco_round_trip() {
        for s in [
            OcoStatus::Preparing,
            OcoStatus::Active,
            OcoStatus::TpFilled,
            OcoStatus::SlFilled,
            OcoStatus::Closed,
        ] {
            assert_eq!(s.as_str().parse::<OcoStatus>().unwrap(), s);
        }
    }

    #[test]
    fn test_oco_mode_parse() {
        assert_eq!("per_partial".parse::<OcoMode>().unwrap(), OcoMode::PerPartial);
        assert_eq!(
            "post_complete".parse::<OcoMode>().unwrap(),
            OcoMode::PostComplete
        );
        assert_eq!(OcoMode::default(), OcoMode::PerPartial);
    }

    #[test]
    fn test_close_outcome_round_trip() {
        for o in [
            CloseOutcome::TpFilled,
            CloseOutcome::SlFilled,
            CloseOutcome::Mixed,
            CloseOutcome::Eod,
            CloseOutcome::EntryCancelled,
        ] {
            assert_eq!(o.as_str().parse::<CloseOutcome>().unwrap(), o);
        }
    }
}
