//! Worksheet Layout and Row Parsing
//!
//! Column addressing, cell values, the persisted per-worksheet column
//! mapping, and the row parser that turns a configured region into
//! [`QuoteRequest`]s.
//!
//! The parser is pure: it reads cell values already fetched from the host
//! and never touches the workbook. Invalid rows are reported alongside the
//! accepted ones; they never abort the batch.

use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use super::instrument::{Identifier, IdentifierType};
use super::quote::{Ats, Quantity, QuoteLabel, QuoteRequest, RowField, RowValidationError, Side};

/// First data row when a worksheet does not override it (row 1 is the header).
pub const DEFAULT_FIRST_ROW: u32 = 2;

/// Offset of the default output column from the ATS column.
pub const OUTPUT_COLUMN_OFFSET: u32 = 2;

/// Ladder levels written per row (5% through 95%).
pub const LADDER_WIDTH: u32 = 19;

/// Columns in a row's output block: the quote date, then the ladder.
pub const OUTPUT_WIDTH: u32 = LADDER_WIDTH + 1;

/// Header labels for the output block, left to right.
#[must_use]
pub fn output_headers() -> Vec<String> {
    std::iter::once("Inference".to_string())
        .chain((1..=LADDER_WIDTH).map(|level| format!("{}%", level * 5)))
        .collect()
}

// =============================================================================
// Column / Cell References
// =============================================================================

/// Invalid column letters.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("invalid column reference: {0:?}")]
pub struct InvalidColumn(pub String);

/// A spreadsheet column (`A`, `Z`, `AA`, ...), stored as a 1-based index.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ColumnRef(u32);

impl ColumnRef {
    /// Largest column index accepted (`XFD`).
    pub const MAX_INDEX: u32 = 16_384;

    /// Column from a 1-based index.
    #[must_use]
    pub const fn from_index(index: u32) -> Option<Self> {
        if index == 0 || index > Self::MAX_INDEX {
            None
        } else {
            Some(Self(index))
        }
    }

    /// Parse column letters (case-insensitive, surrounding whitespace ignored).
    ///
    /// # Errors
    ///
    /// Returns [`InvalidColumn`] if the value is empty, contains anything
    /// other than ASCII letters, or is past the last column.
    pub fn parse(letters: &str) -> Result<Self, InvalidColumn> {
        let trimmed = letters.trim();
        if trimmed.is_empty() || trimmed.len() > 3 {
            return Err(InvalidColumn(letters.to_string()));
        }

        let mut index: u32 = 0;
        for c in trimmed.chars() {
            if !c.is_ascii_alphabetic() {
                return Err(InvalidColumn(letters.to_string()));
            }
            let digit = u32::from(c.to_ascii_uppercase()) - u32::from('A') + 1;
            index = index * 26 + digit;
        }

        Self::from_index(index).ok_or_else(|| InvalidColumn(letters.to_string()))
    }

    /// 1-based column index.
    #[must_use]
    pub const fn index(&self) -> u32 {
        self.0
    }

    /// Column `n` places to the right, if it exists.
    #[must_use]
    pub const fn offset(&self, n: u32) -> Option<Self> {
        match self.0.checked_add(n) {
            Some(index) => Self::from_index(index),
            None => None,
        }
    }

    /// The next column to the right.
    #[must_use]
    pub const fn next(&self) -> Option<Self> {
        self.offset(1)
    }

    /// Column letters.
    #[must_use]
    pub fn letters(&self) -> String {
        let mut n = self.0;
        let mut out = Vec::with_capacity(3);
        while n > 0 {
            let rem = (n - 1) % 26;
            out.push(char::from(b'A' + u8::try_from(rem).unwrap_or(0)));
            n = (n - 1) / 26;
        }
        out.iter().rev().collect()
    }
}

impl fmt::Display for ColumnRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.letters())
    }
}

impl Serialize for ColumnRef {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.letters())
    }
}

impl<'de> Deserialize<'de> for ColumnRef {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        Self::parse(&s).map_err(serde::de::Error::custom)
    }
}

/// A single cell address.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CellRef {
    /// 1-based row.
    pub row: u32,
    /// Column.
    pub column: ColumnRef,
}

impl CellRef {
    /// Create a cell reference.
    #[must_use]
    pub const fn new(row: u32, column: ColumnRef) -> Self {
        Self { row, column }
    }

    /// Same row, `n` columns to the right.
    #[must_use]
    pub fn right(&self, n: u32) -> Option<Self> {
        self.column.offset(n).map(|column| Self::new(self.row, column))
    }
}

impl fmt::Display for CellRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{}", self.column, self.row)
    }
}

// =============================================================================
// Cell Value
// =============================================================================

/// Cell content as reported by the host.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum CellValue {
    /// Blank cell.
    #[default]
    Empty,
    /// Boolean.
    Bool(bool),
    /// Numeric.
    Number(f64),
    /// Text.
    Text(String),
}

impl CellValue {
    /// Whether the cell is blank or whitespace-only text.
    #[must_use]
    pub fn is_blank(&self) -> bool {
        match self {
            Self::Empty => true,
            Self::Text(s) => s.trim().is_empty(),
            Self::Bool(_) | Self::Number(_) => false,
        }
    }

    /// Trimmed text content, if this is a non-blank text cell.
    #[must_use]
    pub fn as_text(&self) -> Option<&str> {
        match self {
            Self::Text(s) if !s.trim().is_empty() => Some(s.trim()),
            _ => None,
        }
    }
}

impl fmt::Display for CellValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Empty => Ok(()),
            Self::Bool(b) => write!(f, "{b}"),
            Self::Number(n) => write!(f, "{n}"),
            Self::Text(s) => f.write_str(s),
        }
    }
}

// =============================================================================
// Configuration
// =============================================================================

/// Column mapping validation failures.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigurationError {
    /// No identifier column (figi, cusip or isin) configured.
    #[error("no identifier column configured (expected one of figi, cusip, isin)")]
    MissingIdentifier,

    /// More than one identifier column configured.
    #[error("more than one identifier column configured: {0:?}")]
    AmbiguousIdentifier(Vec<IdentifierType>),

    /// A required column mapping is absent.
    #[error("missing column mapping for {0}")]
    MissingColumn(RowField),

    /// A column mapping is not valid column letters.
    #[error("invalid column {value:?} for {field}")]
    InvalidColumn {
        /// Field the column was configured for.
        field: RowField,
        /// Configured value.
        value: String,
    },

    /// The output column is not usable.
    #[error("invalid output column {0:?}")]
    InvalidOutputColumn(String),

    /// The output block would cover an input column.
    #[error("output columns {output}..{last} overlap input column {input}")]
    OutputOverlapsInput {
        /// First output column.
        output: ColumnRef,
        /// Last output column.
        last: ColumnRef,
        /// Input column inside the block.
        input: ColumnRef,
    },

    /// First data row must be at least 1.
    #[error("invalid first row {0}")]
    InvalidFirstRow(u32),
}

/// Column letters for each logical field, as persisted.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct InputParameters {
    /// FIGI identifier column.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub figi: Option<String>,
    /// CUSIP identifier column.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cusip: Option<String>,
    /// ISIN identifier column.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub isin: Option<String>,
    /// Side column.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub side: Option<String>,
    /// Quantity column.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub quantity: Option<String>,
    /// Quote label column.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rfq_label: Option<String>,
    /// ATS column.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ats: Option<String>,
}

impl InputParameters {
    fn identifier_column(&self, kind: IdentifierType) -> Option<&str> {
        let value = match kind {
            IdentifierType::Figi => self.figi.as_deref(),
            IdentifierType::Cusip => self.cusip.as_deref(),
            IdentifierType::Isin => self.isin.as_deref(),
        };
        value.filter(|v| !v.trim().is_empty())
    }
}

/// Persisted configuration for one worksheet.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorksheetConfig {
    /// Column letters per field.
    pub input_parameters: InputParameters,
    /// First data row (default 2).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub first_row: Option<u32>,
    /// Output column (default: two columns right of ATS).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output_column: Option<String>,
}

impl WorksheetConfig {
    /// Validate into a [`ColumnMapping`].
    ///
    /// # Errors
    ///
    /// Returns [`ConfigurationError`] for absent, ambiguous or malformed
    /// mappings.
    pub fn resolve(&self) -> Result<ColumnMapping, ConfigurationError> {
        let params = &self.input_parameters;

        let configured: Vec<IdentifierType> = IdentifierType::all()
            .iter()
            .copied()
            .filter(|kind| params.identifier_column(*kind).is_some())
            .collect();
        let identifier_type = match configured.as_slice() {
            [] => return Err(ConfigurationError::MissingIdentifier),
            [single] => *single,
            _ => return Err(ConfigurationError::AmbiguousIdentifier(configured)),
        };

        let identifier = column(
            RowField::Identifier,
            params.identifier_column(identifier_type),
        )?;
        let side = column(RowField::Side, params.side.as_deref())?;
        let quantity = column(RowField::Quantity, params.quantity.as_deref())?;
        let label = column(RowField::Label, params.rfq_label.as_deref())?;
        let ats = column(RowField::Ats, params.ats.as_deref())?;

        let first_row = self.first_row.unwrap_or(DEFAULT_FIRST_ROW);
        if first_row == 0 {
            return Err(ConfigurationError::InvalidFirstRow(first_row));
        }

        let output = match self.output_column.as_deref() {
            Some(letters) => ColumnRef::parse(letters)
                .map_err(|_| ConfigurationError::InvalidOutputColumn(letters.to_string()))?,
            None => ats
                .offset(OUTPUT_COLUMN_OFFSET)
                .ok_or_else(|| ConfigurationError::InvalidOutputColumn(ats.to_string()))?,
        };

        let last = output
            .offset(OUTPUT_WIDTH - 1)
            .ok_or_else(|| ConfigurationError::InvalidOutputColumn(output.to_string()))?;

        let mapping = ColumnMapping {
            identifier_type,
            identifier,
            side,
            quantity,
            label,
            ats,
            first_row,
            output,
        };
        if let Some(input) = mapping
            .input_columns()
            .into_iter()
            .find(|column| (output..=last).contains(column))
        {
            return Err(ConfigurationError::OutputOverlapsInput {
                output,
                last,
                input,
            });
        }
        Ok(mapping)
    }
}

fn column(field: RowField, value: Option<&str>) -> Result<ColumnRef, ConfigurationError> {
    let value = value
        .filter(|v| !v.trim().is_empty())
        .ok_or(ConfigurationError::MissingColumn(field))?;
    ColumnRef::parse(value).map_err(|_| ConfigurationError::InvalidColumn {
        field,
        value: value.to_string(),
    })
}

/// A validated column mapping for one worksheet.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ColumnMapping {
    /// Identifier scheme of the identifier column.
    pub identifier_type: IdentifierType,
    /// Identifier column.
    pub identifier: ColumnRef,
    /// Side column.
    pub side: ColumnRef,
    /// Quantity column.
    pub quantity: ColumnRef,
    /// Quote label column.
    pub label: ColumnRef,
    /// ATS column.
    pub ats: ColumnRef,
    /// First data row.
    pub first_row: u32,
    /// Column receiving quote values.
    pub output: ColumnRef,
}

impl ColumnMapping {
    /// Input columns in field order.
    #[must_use]
    pub const fn input_columns(&self) -> [ColumnRef; 5] {
        [
            self.identifier,
            self.side,
            self.quantity,
            self.label,
            self.ats,
        ]
    }

    /// Whether an edit to `cell` can change the parsed requests.
    #[must_use]
    pub fn covers(&self, cell: CellRef) -> bool {
        cell.row >= self.first_row && self.input_columns().contains(&cell.column)
    }

    /// First cell of a data row's output block (the quote date).
    #[must_use]
    pub const fn output_cell(&self, row: u32) -> CellRef {
        CellRef::new(row, self.output)
    }

    /// Row holding the output block headers, if there is one above the data.
    #[must_use]
    pub const fn header_row(&self) -> Option<u32> {
        match self.first_row {
            0 | 1 => None,
            first => Some(first - 1),
        }
    }
}

// =============================================================================
// Row Parser
// =============================================================================

/// Input column contents for a region, each starting at the first data row.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RegionColumns {
    /// Identifier column cells.
    pub identifier: Vec<CellValue>,
    /// Side column cells.
    pub side: Vec<CellValue>,
    /// Quantity column cells.
    pub quantity: Vec<CellValue>,
    /// Label column cells.
    pub label: Vec<CellValue>,
    /// ATS column cells.
    pub ats: Vec<CellValue>,
}

impl RegionColumns {
    fn row_count(&self) -> usize {
        [
            self.identifier.len(),
            self.side.len(),
            self.quantity.len(),
            self.label.len(),
            self.ats.len(),
        ]
        .into_iter()
        .max()
        .unwrap_or(0)
    }
}

/// An accepted row.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParsedRow {
    /// 1-based worksheet row.
    pub row: u32,
    /// Validated request.
    pub request: QuoteRequest,
}

/// A rejected row.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RowRejection {
    /// 1-based worksheet row.
    pub row: u32,
    /// First validation failure.
    pub error: RowValidationError,
}

/// Row parser result.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ParseOutcome {
    /// Valid quote requests in row order.
    pub requests: Vec<ParsedRow>,
    /// Rows that failed validation, in row order.
    pub rejected: Vec<RowRejection>,
}

/// Parse every row of a region.
///
/// Fully blank rows are skipped silently. Short columns are padded with
/// blanks.
#[must_use]
pub fn parse_rows(mapping: &ColumnMapping, region: &RegionColumns) -> ParseOutcome {
    static EMPTY: CellValue = CellValue::Empty;
    fn cell(column: &[CellValue], idx: usize) -> &CellValue {
        column.get(idx).unwrap_or(&EMPTY)
    }

    let mut outcome = ParseOutcome::default();
    for (idx, row) in (0..region.row_count()).zip(mapping.first_row..) {
        let cells = RowCells {
            identifier: cell(&region.identifier, idx),
            side: cell(&region.side, idx),
            quantity: cell(&region.quantity, idx),
            label: cell(&region.label, idx),
            ats: cell(&region.ats, idx),
        };

        match parse_row(mapping.identifier_type, &cells) {
            Ok(Some(request)) => outcome.requests.push(ParsedRow { row, request }),
            Ok(None) => {}
            Err(error) => {
                tracing::debug!(row, error = %error, "Row skipped");
                outcome.rejected.push(RowRejection { row, error });
            }
        }
    }
    outcome
}

/// One row's input cells.
#[derive(Debug, Clone, Copy)]
pub struct RowCells<'a> {
    /// Identifier cell.
    pub identifier: &'a CellValue,
    /// Side cell.
    pub side: &'a CellValue,
    /// Quantity cell.
    pub quantity: &'a CellValue,
    /// Label cell.
    pub label: &'a CellValue,
    /// ATS cell.
    pub ats: &'a CellValue,
}

impl RowCells<'_> {
    fn is_blank(&self) -> bool {
        [self.identifier, self.side, self.quantity, self.label, self.ats]
            .iter()
            .all(|c| c.is_blank())
    }
}

/// Validate one row. Returns `Ok(None)` for a fully blank row.
///
/// # Errors
///
/// Returns the first [`RowValidationError`] found, checking fields in
/// column-mapping order.
pub fn parse_row(
    identifier_type: IdentifierType,
    cells: &RowCells<'_>,
) -> Result<Option<QuoteRequest>, RowValidationError> {
    if cells.is_blank() {
        return Ok(None);
    }

    let identifier = Identifier::parse(
        identifier_type,
        &identifier_text(cells.identifier).ok_or(RowValidationError::EmptyCell(RowField::Identifier))?,
    )?;

    let side = text(cells.side, RowField::Side)
        .and_then(|s| Side::parse(s).ok_or_else(|| RowValidationError::InvalidSide(s.to_string())))?;

    let quantity = match cells.quantity {
        CellValue::Number(n) => Quantity::from_number(*n),
        CellValue::Text(s) if !s.trim().is_empty() => Quantity::parse_text(s),
        CellValue::Empty | CellValue::Text(_) => {
            return Err(RowValidationError::EmptyCell(RowField::Quantity));
        }
        CellValue::Bool(_) => None,
    }
    .ok_or_else(|| RowValidationError::InvalidQuantity(cells.quantity.to_string()))?;

    let label = text(cells.label, RowField::Label).and_then(|s| {
        QuoteLabel::parse(s).ok_or_else(|| RowValidationError::InvalidLabel(s.to_string()))
    })?;

    let ats = text(cells.ats, RowField::Ats)
        .and_then(|s| Ats::parse(s).ok_or_else(|| RowValidationError::InvalidAts(s.to_string())))?;

    Ok(Some(QuoteRequest {
        identifier,
        side,
        quantity,
        label,
        ats,
    }))
}

/// Text content of an enumerated-value cell.
fn text(cell: &CellValue, field: RowField) -> Result<&str, RowValidationError> {
    match cell {
        CellValue::Empty => Err(RowValidationError::EmptyCell(field)),
        CellValue::Text(_) => cell.as_text().ok_or(RowValidationError::EmptyCell(field)),
        CellValue::Bool(_) | CellValue::Number(_) => Err(match field {
            RowField::Side => RowValidationError::InvalidSide(cell.to_string()),
            RowField::Label => RowValidationError::InvalidLabel(cell.to_string()),
            RowField::Ats => RowValidationError::InvalidAts(cell.to_string()),
            RowField::Identifier | RowField::Quantity => RowValidationError::EmptyCell(field),
        }),
    }
}

/// Identifier cells may be text, or an all-digit CUSIP the host stored as a number.
#[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss, clippy::float_cmp)]
fn identifier_text(cell: &CellValue) -> Option<String> {
    match cell {
        CellValue::Text(_) => cell.as_text().map(str::to_string),
        CellValue::Number(n) if n.is_finite() && *n >= 0.0 && n.fract() == 0.0 && *n < 1e15 => {
            Some(format!("{}", *n as u64))
        }
        _ => None,
    }
}
