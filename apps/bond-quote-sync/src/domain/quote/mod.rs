//! Quote Request and Quote Update Types
//!
//! A [`QuoteRequest`] is one validated worksheet row asking for a live
//! quote stream. A [`QuoteUpdate`] is one inbound quote pushed by the
//! market-data service.
//!
//! # Row Data Format
//!
//! | Field    | Accepted values                                              |
//! |----------|--------------------------------------------------------------|
//! | Side     | `bid`, `offer`, `dealer` (case-insensitive)                  |
//! | Quantity | 1 000, 10 000, 100 000, 250 000, 500 000, 1 000 000 … 5 000 000 |
//! | Label    | `price`, `ytm`, `spread` (case-insensitive)                  |
//! | ATS      | `Y`, `N` (case-insensitive)                                  |

use std::fmt;

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use super::instrument::{Figi, Identifier, IdentifierError};

// =============================================================================
// Errors
// =============================================================================

/// Logical row fields, in column-mapping order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum RowField {
    /// Security identifier column.
    Identifier,
    /// Side column.
    Side,
    /// Quantity column.
    Quantity,
    /// Quote label column.
    Label,
    /// ATS indicator column.
    Ats,
}

impl RowField {
    /// Configuration key for this field.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Identifier => "identifier",
            Self::Side => "side",
            Self::Quantity => "quantity",
            Self::Label => "rfq_label",
            Self::Ats => "ats",
        }
    }
}

impl fmt::Display for RowField {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Why a worksheet row is not a valid quote request.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RowValidationError {
    /// A required cell was empty.
    #[error("empty {0} cell")]
    EmptyCell(RowField),

    /// Side is not one of bid/offer/dealer.
    #[error("unrecognised side: {0}")]
    InvalidSide(String),

    /// Quantity is not in the enumerated set.
    #[error("unsupported quantity: {0}")]
    InvalidQuantity(String),

    /// Label is not one of price/ytm/spread.
    #[error("unrecognised quote label: {0}")]
    InvalidLabel(String),

    /// ATS indicator is not Y/N.
    #[error("unrecognised ATS indicator: {0}")]
    InvalidAts(String),

    /// Identifier failed format validation.
    #[error(transparent)]
    Identifier(#[from] IdentifierError),
}

// =============================================================================
// Side
// =============================================================================

/// Quote side.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Side {
    /// Bid side.
    Bid,
    /// Offer side.
    Offer,
    /// Dealer-to-dealer mid.
    Dealer,
}

impl Side {
    /// Parse a trimmed, case-insensitive cell value.
    #[must_use]
    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_lowercase().as_str() {
            "bid" => Some(Self::Bid),
            "offer" => Some(Self::Offer),
            "dealer" => Some(Self::Dealer),
            _ => None,
        }
    }

    /// Wire name.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Bid => "bid",
            Self::Offer => "offer",
            Self::Dealer => "dealer",
        }
    }
}

impl fmt::Display for Side {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// =============================================================================
// Quantity
// =============================================================================

/// A notional quantity drawn from the fixed enumerated set.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "u64", into = "u64")]
pub struct Quantity(u32);

impl Quantity {
    /// Supported quantities, ascending.
    pub const ALLOWED: [u32; 10] = [
        1_000, 10_000, 100_000, 250_000, 500_000, 1_000_000, 2_000_000, 3_000_000, 4_000_000,
        5_000_000,
    ];

    /// Accept an exact member of [`Self::ALLOWED`].
    #[must_use]
    pub fn new(value: u32) -> Option<Self> {
        Self::ALLOWED.contains(&value).then_some(Self(value))
    }

    /// Accept a numeric cell. Fractional values are rejected.
    #[must_use]
    #[allow(
        clippy::cast_possible_truncation,
        clippy::cast_sign_loss,
        clippy::float_cmp
    )]
    pub fn from_number(value: f64) -> Option<Self> {
        if !value.is_finite() || value.fract() != 0.0 || value < 0.0 || value > f64::from(u32::MAX)
        {
            return None;
        }
        Self::new(value as u32)
    }

    /// Accept a text cell.
    ///
    /// Spaces, non-breaking spaces, commas and underscores are accepted as
    /// digit separators; anything else makes the value invalid.
    #[must_use]
    pub fn parse_text(s: &str) -> Option<Self> {
        let digits: String = s
            .trim()
            .chars()
            .filter(|c| !matches!(c, ' ' | '\u{a0}' | ',' | '_'))
            .collect();
        if digits.is_empty() || !digits.bytes().all(|b| b.is_ascii_digit()) {
            return None;
        }
        digits.parse::<u32>().ok().and_then(Self::new)
    }

    /// Quantity as an integer.
    #[must_use]
    pub const fn value(&self) -> u32 {
        self.0
    }
}

impl TryFrom<u64> for Quantity {
    type Error = String;

    fn try_from(value: u64) -> Result<Self, Self::Error> {
        u32::try_from(value)
            .ok()
            .and_then(Self::new)
            .ok_or_else(|| format!("unsupported quantity {value}"))
    }
}

impl From<Quantity> for u64 {
    fn from(quantity: Quantity) -> Self {
        Self::from(quantity.0)
    }
}

impl fmt::Display for Quantity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

// =============================================================================
// Quote Label
// =============================================================================

/// Which quote measure a row asks for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum QuoteLabel {
    /// Clean price.
    Price,
    /// Yield to maturity.
    Ytm,
    /// Spread to benchmark.
    Spread,
}

impl QuoteLabel {
    /// All labels.
    #[must_use]
    pub const fn all() -> &'static [Self] {
        &[Self::Price, Self::Ytm, Self::Spread]
    }

    /// Parse a trimmed, case-insensitive cell value.
    #[must_use]
    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_lowercase().as_str() {
            "price" => Some(Self::Price),
            "ytm" => Some(Self::Ytm),
            "spread" => Some(Self::Spread),
            _ => None,
        }
    }

    /// Wire name.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Price => "price",
            Self::Ytm => "ytm",
            Self::Spread => "spread",
        }
    }

    /// Spreadsheet number format applied to written values.
    #[must_use]
    pub const fn number_format(&self) -> &'static str {
        match self {
            Self::Price => "$0.000",
            Self::Ytm => "0.00\"%\"",
            Self::Spread => "0.0",
        }
    }

    /// Whether a ladder for this label and side arrives worst-first.
    ///
    /// Price ladders are reversed on the offer side; yield and spread
    /// ladders are reversed on the bid side.
    #[must_use]
    pub const fn reverses_ladder(&self, side: Side) -> bool {
        matches!(
            (self, side),
            (Self::Price, Side::Offer) | (Self::Ytm | Self::Spread, Side::Bid)
        )
    }
}

impl fmt::Display for QuoteLabel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// =============================================================================
// ATS Indicator
// =============================================================================

/// Alternative Trading System flag.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Ats {
    /// `Y`
    #[serde(rename = "Y")]
    Yes,
    /// `N`
    #[serde(rename = "N")]
    No,
}

impl Ats {
    /// Parse a trimmed, case-insensitive `Y`/`N`.
    #[must_use]
    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_uppercase().as_str() {
            "Y" => Some(Self::Yes),
            "N" => Some(Self::No),
            _ => None,
        }
    }

    /// Wire value.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Yes => "Y",
            Self::No => "N",
        }
    }
}

impl From<bool> for Ats {
    fn from(value: bool) -> Self {
        if value { Self::Yes } else { Self::No }
    }
}

impl fmt::Display for Ats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// =============================================================================
// Quote Request
// =============================================================================

/// One validated worksheet row.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct QuoteRequest {
    /// Security identifier.
    pub identifier: Identifier,
    /// Quote side.
    pub side: Side,
    /// Notional quantity.
    pub quantity: Quantity,
    /// Requested measure.
    pub label: QuoteLabel,
    /// ATS flag.
    pub ats: Ats,
}

// =============================================================================
// Quote Update
// =============================================================================

/// Per-label values carried by an inbound quote.
///
/// Each label holds a ladder; a scalar on the wire becomes a one-value ladder.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct QuoteFields {
    /// Price ladder.
    pub price: Option<Vec<Decimal>>,
    /// Yield ladder.
    pub ytm: Option<Vec<Decimal>>,
    /// Spread ladder.
    pub spread: Option<Vec<Decimal>>,
}

impl QuoteFields {
    /// Values for one label, if present and non-empty.
    #[must_use]
    pub fn get(&self, label: QuoteLabel) -> Option<&[Decimal]> {
        let values = match label {
            QuoteLabel::Price => self.price.as_deref(),
            QuoteLabel::Ytm => self.ytm.as_deref(),
            QuoteLabel::Spread => self.spread.as_deref(),
        };
        values.filter(|v| !v.is_empty())
    }

    /// Labels that carry at least one value.
    pub fn labels(&self) -> impl Iterator<Item = QuoteLabel> + '_ {
        QuoteLabel::all()
            .iter()
            .copied()
            .filter(|label| self.get(*label).is_some())
    }

    /// Whether no label carries a value.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.labels().next().is_none()
    }
}

/// An inbound quote pushed by the market-data service.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QuoteUpdate {
    /// Instrument.
    pub figi: Figi,
    /// Quote side.
    pub side: Side,
    /// Notional quantity.
    pub quantity: Quantity,
    /// ATS flag.
    pub ats: Ats,
    /// Quoted values.
    pub fields: QuoteFields,
    /// Server timestamp, when supplied.
    pub timestamp: Option<DateTime<Utc>>,
}

impl QuoteUpdate {
    /// Values for `label` in display order (best first).
    #[must_use]
    pub fn ladder(&self, label: QuoteLabel) -> Option<Vec<Decimal>> {
        let values = self.fields.get(label)?;
        let mut ladder = values.to_vec();
        if label.reverses_ladder(self.side) {
            ladder.reverse();
        }
        Some(ladder)
    }
}

#[cfg(test)]
mod tests {
    use rust_decimal::prelude::FromPrimitive;
    use test_case::test_case;

    use super::*;

    #[test_case("bid", Some(Side::Bid) ; "bid")]
    #[test_case(" OFFER ", Some(Side::Offer) ; "offer upper padded")]
    #[test_case("Dealer", Some(Side::Dealer) ; "dealer mixed")]
    #[test_case("ask", None ; "ask rejected")]
    #[test_case("", None ; "empty")]
    fn side_parsing(raw: &str, expected: Option<Side>) {
        assert_eq!(Side::parse(raw), expected);
    }

    #[test_case("price", Some(QuoteLabel::Price) ; "price")]
    #[test_case("YTM", Some(QuoteLabel::Ytm) ; "ytm upper")]
    #[test_case(" spread", Some(QuoteLabel::Spread) ; "spread padded")]
    #[test_case("yield", None ; "yield rejected")]
    fn label_parsing(raw: &str, expected: Option<QuoteLabel>) {
        assert_eq!(QuoteLabel::parse(raw), expected);
    }

    #[test_case("y", Some(Ats::Yes) ; "lower y")]
    #[test_case("N", Some(Ats::No) ; "upper n")]
    #[test_case("yes", None ; "word rejected")]
    fn ats_parsing(raw: &str, expected: Option<Ats>) {
        assert_eq!(Ats::parse(raw), expected);
    }

    #[test_case("1 000 000", Some(1_000_000) ; "spaces")]
    #[test_case("1\u{a0}000\u{a0}000", Some(1_000_000) ; "non breaking spaces")]
    #[test_case("250,000", Some(250_000) ; "commas")]
    #[test_case("5_000_000", Some(5_000_000) ; "underscores")]
    #[test_case("1000", Some(1_000) ; "plain")]
    #[test_case("1 500 000", None ; "not enumerated")]
    #[test_case("1.000.000", None ; "dots")]
    #[test_case("1MM", None ; "suffix")]
    #[test_case("-1000", None ; "negative")]
    #[test_case("", None ; "empty")]
    fn quantity_text_parsing(raw: &str, expected: Option<u32>) {
        assert_eq!(Quantity::parse_text(raw).map(|q| q.value()), expected);
    }

    #[test_case(1_000_000.0, Some(1_000_000) ; "integral")]
    #[test_case(100_000.5, None ; "fractional")]
    #[test_case(f64::NAN, None ; "nan")]
    #[test_case(-1_000.0, None ; "negative")]
    #[test_case(1e12, None ; "overflow")]
    fn quantity_numeric_parsing(raw: f64, expected: Option<u32>) {
        assert_eq!(Quantity::from_number(raw).map(|q| q.value()), expected);
    }

    #[test]
    fn quantity_serde_enforces_enumeration() {
        let q: Quantity = serde_json::from_str("1000000").unwrap();
        assert_eq!(q.value(), 1_000_000);
        assert_eq!(serde_json::to_string(&q).unwrap(), "1000000");
        assert!(serde_json::from_str::<Quantity>("1500000").is_err());
    }

    #[test]
    fn ats_serde_uses_letters() {
        assert_eq!(serde_json::to_string(&Ats::Yes).unwrap(), "\"Y\"");
        assert_eq!(serde_json::from_str::<Ats>("\"N\"").unwrap(), Ats::No);
    }

    #[test]
    fn ladder_orientation() {
        assert!(QuoteLabel::Price.reverses_ladder(Side::Offer));
        assert!(!QuoteLabel::Price.reverses_ladder(Side::Bid));
        assert!(QuoteLabel::Ytm.reverses_ladder(Side::Bid));
        assert!(QuoteLabel::Spread.reverses_ladder(Side::Bid));
        assert!(!QuoteLabel::Spread.reverses_ladder(Side::Offer));
        assert!(!QuoteLabel::Price.reverses_ladder(Side::Dealer));
    }

    fn dec(v: f64) -> Decimal {
        Decimal::from_f64(v).unwrap()
    }

    #[test]
    fn update_ladder_reverses_offer_prices() {
        let update = QuoteUpdate {
            figi: Figi::parse("BBG000BLNNH6").unwrap(),
            side: Side::Offer,
            quantity: Quantity::new(1_000_000).unwrap(),
            ats: Ats::Yes,
            fields: QuoteFields {
                price: Some(vec![dec(101.0), dec(101.5), dec(102.0)]),
                ..QuoteFields::default()
            },
            timestamp: None,
        };

        assert_eq!(
            update.ladder(QuoteLabel::Price).unwrap(),
            vec![dec(102.0), dec(101.5), dec(101.0)]
        );
        assert!(update.ladder(QuoteLabel::Ytm).is_none());
    }

    #[test]
    fn fields_skip_empty_ladders() {
        let fields = QuoteFields {
            price: Some(vec![]),
            ytm: Some(vec![dec(4.5)]),
            spread: None,
        };

        assert_eq!(fields.labels().collect::<Vec<_>>(), vec![QuoteLabel::Ytm]);
        assert!(!fields.is_empty());
        assert!(QuoteFields::default().is_empty());
    }
}
