//! Event Dispatcher
//!
//! Routes an inbound [`QuoteUpdate`] to every destination cell subscribed to
//! it and performs the writes through the [`WorkbookHost`] port.
//!
//! Routing is by [`SubscriptionKey`]: one key per label carried by the
//! update. A key with no destinations is a late event (the row was removed
//! after the subscribe went out) and is dropped. Each destination receives
//! only the label it asked for.
//!
//! Every write covers the whole output block: the quote date in the
//! destination cell, then [`LADDER_WIDTH`] ladder cells to its right.
//! Levels past the end of the ladder are blanked so a shorter ladder never
//! leaves stale values behind.

use rust_decimal::prelude::ToPrimitive;

use crate::application::ports::{CellWrite, WorkbookHost};
use crate::domain::quote::QuoteUpdate;
use crate::domain::subscription::{SubscriptionKey, SubscriptionTable};
use crate::domain::worksheet::{CellValue, LADDER_WIDTH};

/// Display format of the quote date cell.
const DATE_FORMAT: &str = "%Y-%m-%d %H:%M:%S";
use crate::infrastructure::metrics::{self, DropReason};

/// Result of dispatching one update.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DispatchOutcome {
    /// Cells written.
    pub written: usize,
    /// Writes the host refused.
    pub failed_writes: usize,
    /// Labels in the update that no destination wanted.
    pub unrouted: usize,
}

impl DispatchOutcome {
    /// Whether nothing was routed.
    #[must_use]
    pub const fn is_dropped(&self) -> bool {
        self.written == 0 && self.failed_writes == 0
    }
}

/// Writes quote updates into destination cells.
#[derive(Debug, Clone, Copy, Default)]
pub struct EventDispatcher;

impl EventDispatcher {
    /// Create a dispatcher.
    #[must_use]
    pub const fn new() -> Self {
        Self
    }

    /// Dispatch one update against a table snapshot.
    ///
    /// The destination cell receives the quote date (blank when the update
    /// carries none) along with the raw timestamp. Ladder values follow,
    /// best value first, padded with blanks to the full ladder width; levels
    /// beyond it are not written. Host write failures are counted and
    /// skipped.
    pub fn dispatch(
        &self,
        table: &SubscriptionTable,
        update: &QuoteUpdate,
        host: &mut dyn WorkbookHost,
    ) -> DispatchOutcome {
        let mut outcome = DispatchOutcome::default();

        if update.fields.is_empty() {
            metrics::record_dropped(DropReason::Empty, 1);
            return outcome;
        }

        let date = update.timestamp.map_or(CellValue::Empty, |ts| {
            CellValue::Text(ts.format(DATE_FORMAT).to_string())
        });

        for label in update.fields.labels() {
            let key = SubscriptionKey::for_update(update, label);
            let Some(destinations) = table.destinations(&key) else {
                tracing::debug!(key = %key, "No destination for quote, dropped");
                outcome.unrouted += 1;
                continue;
            };
            let Some(ladder) = update.ladder(label) else {
                continue;
            };

            let mut values = Vec::with_capacity(LADDER_WIDTH as usize);
            for level in 0..LADDER_WIDTH as usize {
                match ladder.get(level).map(ToPrimitive::to_f64) {
                    Some(Some(number)) => values.push(CellValue::Number(number)),
                    Some(None) => {
                        tracing::warn!(key = %key, level, "Ladder value out of range");
                        values.push(CellValue::Empty);
                    }
                    None => values.push(CellValue::Empty),
                }
            }

            for destination in destinations {
                let date_write = CellWrite {
                    value: date.clone(),
                    timestamp: update.timestamp,
                    number_format: None,
                };
                let ladder_writes = values.iter().map(|value| CellWrite {
                    value: value.clone(),
                    timestamp: None,
                    number_format: Some(label.number_format()),
                });

                let block = std::iter::once(date_write).chain(ladder_writes);
                for (offset, write) in (0u32..).zip(block) {
                    let Some(cell) = destination.cell.right(offset) else {
                        break;
                    };
                    match host.write_cell(&destination.sheet, cell, write) {
                        Ok(()) => outcome.written += 1,
                        Err(e) => {
                            tracing::warn!(
                                destination = %destination,
                                cell = %cell,
                                error = %e,
                                "Cell write dropped"
                            );
                            outcome.failed_writes += 1;
                        }
                    }
                }
            }
        }

        if outcome.written > 0 {
            metrics::record_cell_writes(outcome.written as u64);
        }
        if outcome.failed_writes > 0 {
            metrics::record_dropped(DropReason::HostError, outcome.failed_writes as u64);
        }
        if outcome.is_dropped() {
            metrics::record_dropped(DropReason::NoRoute, 1);
        }

        outcome
    }
}
