//! Subscription Keys and Routing Table
//!
//! Domain types for mapping worksheet rows onto upstream quote streams.
//!
//! # Design
//!
//! - A [`SubscriptionKey`] is the canonical identity of one upstream stream.
//!   Identifiers are resolved to FIGI before the key is formed, so rows
//!   naming the same bond through different schemes share a key.
//! - A [`SubscriptionTable`] maps each key to every [`Destination`] cell that
//!   wants it. Many rows may share one key; the upstream subscription is
//!   still made once.
//! - Tables are rebuilt, never patched: one table per worksheet, merged into
//!   an aggregate that the engine swaps in whole.
//!
//! The live (acknowledged) side of the subscription set is tracked by
//! [`ledger::SubscriptionLedger`].

pub mod ledger;

use std::collections::{BTreeSet, HashMap};
use std::fmt;

use super::instrument::{Figi, Identifier};
use super::quote::{Ats, Quantity, QuoteLabel, QuoteUpdate, Side};
use super::worksheet::{CellRef, ColumnMapping, ParsedRow};

// =============================================================================
// Types
// =============================================================================

/// Canonical identity of one upstream quote stream.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SubscriptionKey {
    /// Instrument.
    pub figi: Figi,
    /// Quote side.
    pub side: Side,
    /// Notional quantity.
    pub quantity: Quantity,
    /// Requested measure.
    pub label: QuoteLabel,
    /// ATS flag.
    pub ats: Ats,
}

impl SubscriptionKey {
    /// Key an inbound update would be routed under for `label`.
    #[must_use]
    pub fn for_update(update: &QuoteUpdate, label: QuoteLabel) -> Self {
        Self {
            figi: update.figi.clone(),
            side: update.side,
            quantity: update.quantity,
            label,
            ats: update.ats,
        }
    }
}

impl fmt::Display for SubscriptionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}/{}/{}/{}/{}",
            self.figi, self.side, self.quantity, self.label, self.ats
        )
    }
}

/// A cell that receives updates for a key.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Destination {
    /// Worksheet name.
    pub sheet: String,
    /// First output cell (ladders extend to the right).
    pub cell: CellRef,
}

impl fmt::Display for Destination {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}!{}", self.sheet, self.cell)
    }
}

// =============================================================================
// Subscription Changes
// =============================================================================

/// Changes to upstream subscriptions.
///
/// Ordered sets so each batch goes out in a stable order.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SubscriptionChanges {
    /// Keys to subscribe to.
    pub subscribe: BTreeSet<SubscriptionKey>,
    /// Keys to unsubscribe from.
    pub unsubscribe: BTreeSet<SubscriptionKey>,
}

impl SubscriptionChanges {
    /// Check if there are any changes.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.subscribe.is_empty() && self.unsubscribe.is_empty()
    }

    /// Create changes with only subscribes.
    #[must_use]
    pub fn subscribe_only(keys: impl IntoIterator<Item = SubscriptionKey>) -> Self {
        Self {
            subscribe: keys.into_iter().collect(),
            unsubscribe: BTreeSet::new(),
        }
    }

    /// Create changes with only unsubscribes.
    #[must_use]
    pub fn unsubscribe_only(keys: impl IntoIterator<Item = SubscriptionKey>) -> Self {
        Self {
            subscribe: BTreeSet::new(),
            unsubscribe: keys.into_iter().collect(),
        }
    }
}

// =============================================================================
// Subscription Table
// =============================================================================

/// Key → destination cells.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SubscriptionTable {
    routes: HashMap<SubscriptionKey, BTreeSet<Destination>>,
}

impl SubscriptionTable {
    /// Create an empty table.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a destination for a key. Duplicates are absorbed.
    pub fn insert(&mut self, key: SubscriptionKey, destination: Destination) {
        self.routes.entry(key).or_default().insert(destination);
    }

    /// Union of several tables.
    #[must_use]
    pub fn merged<'a>(tables: impl IntoIterator<Item = &'a Self>) -> Self {
        let mut merged = Self::new();
        for table in tables {
            for (key, destinations) in &table.routes {
                merged
                    .routes
                    .entry(key.clone())
                    .or_default()
                    .extend(destinations.iter().cloned());
            }
        }
        merged
    }

    /// Destinations for a key.
    #[must_use]
    pub fn destinations(&self, key: &SubscriptionKey) -> Option<&BTreeSet<Destination>> {
        self.routes.get(key)
    }

    /// Whether any destination wants `key`.
    #[must_use]
    pub fn contains(&self, key: &SubscriptionKey) -> bool {
        self.routes.contains_key(key)
    }

    /// Desired keys.
    pub fn keys(&self) -> impl Iterator<Item = &SubscriptionKey> {
        self.routes.keys()
    }

    /// Number of distinct keys.
    #[must_use]
    pub fn len(&self) -> usize {
        self.routes.len()
    }

    /// Whether the table is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.routes.is_empty()
    }

    /// Total destination count across all keys.
    #[must_use]
    pub fn destination_count(&self) -> usize {
        self.routes.values().map(BTreeSet::len).sum()
    }
}

// =============================================================================
// Key Builder
// =============================================================================

/// Worksheet a batch of requests came from.
#[derive(Debug, Clone, Copy)]
pub struct SheetContext<'a> {
    /// Worksheet name.
    pub sheet: &'a str,
    /// Validated column mapping.
    pub mapping: &'a ColumnMapping,
}

/// Result of building one worksheet's table.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SheetBuild {
    /// Routing table for the worksheet.
    pub table: SubscriptionTable,
    /// Rows whose identifier could not be resolved to a FIGI.
    pub unresolved: Vec<u32>,
}

/// Build a worksheet's routing table from its validated rows.
///
/// `resolve` maps an identifier to its FIGI. Rows it cannot resolve are
/// dropped and reported in [`SheetBuild::unresolved`].
pub fn build<F>(requests: &[ParsedRow], context: SheetContext<'_>, resolve: F) -> SheetBuild
where
    F: Fn(&Identifier) -> Option<Figi>,
{
    let mut build = SheetBuild::default();

    for parsed in requests {
        let request = &parsed.request;
        let Some(figi) = resolve(&request.identifier) else {
            tracing::warn!(
                sheet = context.sheet,
                row = parsed.row,
                identifier = %request.identifier,
                "Identifier has no FIGI, row skipped"
            );
            build.unresolved.push(parsed.row);
            continue;
        };

        let key = SubscriptionKey {
            figi,
            side: request.side,
            quantity: request.quantity,
            label: request.label,
            ats: request.ats,
        };
        let destination = Destination {
            sheet: context.sheet.to_string(),
            cell: context.mapping.output_cell(parsed.row),
        };
        build.table.insert(key, destination);
    }

    build
}
