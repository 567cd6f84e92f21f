//! Quota reservations: a two-phase reserve -> confirm/release protocol over
//! per-tenant ledgers.
//!
//! A Reserve claims capacity up front, before the metered work starts. The
//! caller then Confirms with the true consumption or Releases on failure. A
//! claim that is never finalized is reclaimed by [`ReservationManager::sweep`]
//! once it outlives its TTL.
//!
//! ```text
//!            reserve            confirm
//!   (none) ---------> PENDING ----------> CONFIRMED
//!                        |  \   release
//!                        |   ----------> RELEASED
//!                        |      sweep
//!                         -------------> EXPIRED
//! ```

pub mod ledger;
pub mod manager;

pub use ledger::{LedgerKey, QuotaLedger, Reservation, ReservationStatus, UsageSnapshot};
pub use manager::{
    Admission, Confirmation, QuotaDenial, Release, ReservationManager, ReserveOutcome, SweepReport,
};
