//! Position lifecycle and exit management.
//!
//! This crate owns the exit state machine of the system:
//! - [`Position`]: one open trade and its exit progress
//! - [`ExitLadder`]: stateless evaluation of stop, trailing stop and
//!   scaled take-profit triggers
//! - [`PositionManager`]: the sole mutator, applying decisions and
//!   running the live pending-close protocol
//!
//! Backtest and live execution both drive the same manager; only the
//! fill pricing and the dispatch protocol differ.

pub mod ladder;
pub mod manager;
pub mod position;

pub use ladder::{ExitDecision, ExitLadder};
pub use manager::{
    CloseIntent, ExitEvent, FillPricer, NominalFill, PartialExitRecord, PositionManager,
    TradeRecord,
};
pub use position::{PartialExit, PendingClose, PendingKind, Position, PositionSnapshot};
