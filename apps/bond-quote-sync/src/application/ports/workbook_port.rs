//! Workbook Host Port (Driven Port)
//!
//! Interface to the spreadsheet host: cell reads, cell writes, the
//! connection-status indicator and non-blocking user notices.
//!
//! The engine calls this port only from its own (single) thread of control;
//! implementations need not be re-entrant.

use chrono::{DateTime, Utc};

use crate::domain::session::ConnectionStatus;
use crate::domain::worksheet::{CellRef, CellValue, ColumnRef};

/// Host-side failures.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum HostError {
    /// The worksheet does not exist.
    #[error("Worksheet not found: {sheet}")]
    MissingSheet {
        /// Requested worksheet.
        sheet: String,
    },

    /// The cell cannot be read or written.
    #[error("Cell unavailable: {sheet}!{cell}")]
    CellUnavailable {
        /// Worksheet.
        sheet: String,
        /// Cell address.
        cell: String,
    },
}

/// A value written to one cell.
#[derive(Debug, Clone, PartialEq)]
pub struct CellWrite {
    /// New cell value.
    pub value: CellValue,
    /// Quote timestamp, when this cell carries one.
    pub timestamp: Option<DateTime<Utc>>,
    /// Number format to apply.
    pub number_format: Option<&'static str>,
}

/// Non-blocking notices surfaced to the user.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Notice {
    /// Credentials were rejected; no retry will happen.
    AuthRejected {
        /// Server message.
        reason: String,
    },

    /// Reconnection keeps failing; retries continue.
    PersistentConnectionFailure {
        /// Consecutive failed attempts so far.
        attempts: u32,
    },

    /// A worksheet's column mapping is unusable.
    ConfigurationError {
        /// Worksheet.
        sheet: String,
        /// Description.
        message: String,
    },

    /// Rows were skipped during a scan.
    RowsSkipped {
        /// Worksheet.
        sheet: String,
        /// Skipped row count.
        count: usize,
    },
}

/// Port to the spreadsheet host.
#[cfg_attr(test, mockall::automock)]
pub trait WorkbookHost: Send {
    /// Whether a worksheet with this name exists.
    fn has_sheet(&self, sheet: &str) -> bool;

    /// Last used row of a worksheet (0 when empty).
    ///
    /// # Errors
    ///
    /// Returns [`HostError::MissingSheet`] if the worksheet does not exist.
    fn used_row_count(&self, sheet: &str) -> Result<u32, HostError>;

    /// Read `first_row..=last_row` of one column.
    ///
    /// # Errors
    ///
    /// Returns [`HostError`] if the worksheet or range is unavailable.
    fn read_column(
        &self,
        sheet: &str,
        column: ColumnRef,
        first_row: u32,
        last_row: u32,
    ) -> Result<Vec<CellValue>, HostError>;

    /// Write one cell.
    ///
    /// # Errors
    ///
    /// Returns [`HostError`] if the worksheet or cell is unavailable.
    fn write_cell(&mut self, sheet: &str, cell: CellRef, write: CellWrite)
    -> Result<(), HostError>;

    /// Update the connection-status indicator.
    fn set_connection_status(&mut self, status: ConnectionStatus);

    /// Surface a notice to the user.
    fn notify(&mut self, notice: Notice);
}
