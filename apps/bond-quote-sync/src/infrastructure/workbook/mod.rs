//! In-Memory Workbook
//!
//! A [`WorkbookHost`] backed by a JSON snapshot of cell values, used by the
//! headless binary and by tests in place of a live spreadsheet host.
//!
//! # Snapshot Format
//!
//! ```json
//! {"sheets": {"Sheet1": [["FIGI", "Side", "Qty", "Label", "ATS"],
//!                        ["BBG000BLNNH6", "bid", 1000000, "price", "Y"]]}}
//! ```
//!
//! Row `n` of a sheet is element `n - 1`; column `A` is element 0.
//!
//! Clones share the same workbook, so a caller can hand one clone to the
//! engine and keep another to inspect cells, status and notices.

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use crate::application::ports::{CellWrite, HostError, Notice, WorkbookHost};
use crate::domain::session::ConnectionStatus;
use crate::domain::worksheet::{CellRef, CellValue, ColumnRef};

/// Snapshot load/save failures.
#[derive(Debug, thiserror::Error)]
pub enum WorkbookError {
    /// Reading or writing the snapshot failed.
    #[error("workbook I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// The snapshot is not valid workbook JSON.
    #[error("workbook JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

type Grid = Vec<Vec<CellValue>>;

#[derive(Debug, Default, Serialize, Deserialize)]
struct Snapshot {
    #[serde(default)]
    sheets: BTreeMap<String, Grid>,
}

#[derive(Debug)]
struct WorkbookState {
    sheets: BTreeMap<String, Grid>,
    last_writes: BTreeMap<(String, CellRef), CellWrite>,
    status: ConnectionStatus,
    notices: Vec<Notice>,
}

/// Shared in-memory workbook.
#[derive(Debug, Clone)]
pub struct InMemoryWorkbook {
    state: Arc<Mutex<WorkbookState>>,
}

impl Default for InMemoryWorkbook {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryWorkbook {
    /// Empty workbook with no worksheets.
    #[must_use]
    pub fn new() -> Self {
        Self::from_sheets(BTreeMap::new())
    }

    fn from_sheets(sheets: BTreeMap<String, Grid>) -> Self {
        Self {
            state: Arc::new(Mutex::new(WorkbookState {
                sheets,
                last_writes: BTreeMap::new(),
                status: ConnectionStatus::Disconnected,
                notices: Vec::new(),
            })),
        }
    }

    /// Parse a snapshot.
    ///
    /// # Errors
    ///
    /// Returns [`WorkbookError::Json`] if the snapshot is malformed.
    pub fn from_json(raw: &str) -> Result<Self, WorkbookError> {
        let snapshot: Snapshot = serde_json::from_str(raw)?;
        Ok(Self::from_sheets(snapshot.sheets))
    }

    /// Load a snapshot file.
    ///
    /// # Errors
    ///
    /// Returns [`WorkbookError`] if the file cannot be read or parsed.
    pub fn load(path: &Path) -> Result<Self, WorkbookError> {
        let workbook = Self::from_json(&std::fs::read_to_string(path)?)?;
        tracing::info!(
            path = %path.display(),
            sheets = workbook.sheet_names().len(),
            "Workbook loaded"
        );
        Ok(workbook)
    }

    /// Serialize the current cell values.
    ///
    /// # Errors
    ///
    /// Returns [`WorkbookError::Json`] if serialization fails.
    pub fn to_json(&self) -> Result<String, WorkbookError> {
        let state = self.state.lock();
        let snapshot = Snapshot {
            sheets: state.sheets.clone(),
        };
        Ok(serde_json::to_string_pretty(&snapshot)?)
    }

    /// Write the current cell values to a snapshot file.
    ///
    /// # Errors
    ///
    /// Returns [`WorkbookError`] if serialization or the write fails.
    pub fn save(&self, path: &Path) -> Result<(), WorkbookError> {
        std::fs::write(path, self.to_json()?)?;
        tracing::info!(path = %path.display(), "Workbook saved");
        Ok(())
    }

    /// Add an empty worksheet. Returns `false` if it already exists.
    pub fn add_sheet(&self, sheet: &str) -> bool {
        let mut state = self.state.lock();
        if state.sheets.contains_key(sheet) {
            return false;
        }
        state.sheets.insert(sheet.to_string(), Grid::new());
        true
    }

    /// Worksheet names in order.
    #[must_use]
    pub fn sheet_names(&self) -> Vec<String> {
        self.state.lock().sheets.keys().cloned().collect()
    }

    /// Set a cell as a user edit would.
    ///
    /// # Errors
    ///
    /// Returns [`HostError::MissingSheet`] if the worksheet does not exist.
    pub fn set_cell(
        &self,
        sheet: &str,
        cell: CellRef,
        value: CellValue,
    ) -> Result<(), HostError> {
        let mut state = self.state.lock();
        let grid = state
            .sheets
            .get_mut(sheet)
            .ok_or_else(|| HostError::MissingSheet {
                sheet: sheet.to_string(),
            })?;
        put(grid, cell, value);
        Ok(())
    }

    /// Current value of a cell (`Empty` outside the used range).
    #[must_use]
    pub fn cell(&self, sheet: &str, cell: CellRef) -> Option<CellValue> {
        let state = self.state.lock();
        state.sheets.get(sheet).map(|grid| get(grid, cell))
    }

    /// The last engine write to a cell, with its timestamp and format.
    #[must_use]
    pub fn last_write(&self, sheet: &str, cell: CellRef) -> Option<CellWrite> {
        self.state
            .lock()
            .last_writes
            .get(&(sheet.to_string(), cell))
            .cloned()
    }

    /// Current connection-status indicator.
    #[must_use]
    pub fn status(&self) -> ConnectionStatus {
        self.state.lock().status
    }

    /// Notices raised so far.
    #[must_use]
    pub fn notices(&self) -> Vec<Notice> {
        self.state.lock().notices.clone()
    }
}

impl WorkbookHost for InMemoryWorkbook {
    fn has_sheet(&self, sheet: &str) -> bool {
        self.state.lock().sheets.contains_key(sheet)
    }

    fn used_row_count(&self, sheet: &str) -> Result<u32, HostError> {
        let state = self.state.lock();
        let grid = state.sheets.get(sheet).ok_or_else(|| HostError::MissingSheet {
            sheet: sheet.to_string(),
        })?;
        let used = grid
            .iter()
            .rposition(|row| row.iter().any(|cell| !cell.is_blank()))
            .map_or(0, |index| index + 1);
        Ok(u32::try_from(used).unwrap_or(u32::MAX))
    }

    fn read_column(
        &self,
        sheet: &str,
        column: ColumnRef,
        first_row: u32,
        last_row: u32,
    ) -> Result<Vec<CellValue>, HostError> {
        let state = self.state.lock();
        let grid = state.sheets.get(sheet).ok_or_else(|| HostError::MissingSheet {
            sheet: sheet.to_string(),
        })?;
        if first_row == 0 {
            return Err(HostError::CellUnavailable {
                sheet: sheet.to_string(),
                cell: format!("{column}0"),
            });
        }
        Ok((first_row..=last_row)
            .map(|row| get(grid, CellRef::new(row, column)))
            .collect())
    }

    fn write_cell(
        &mut self,
        sheet: &str,
        cell: CellRef,
        write: CellWrite,
    ) -> Result<(), HostError> {
        let mut state = self.state.lock();
        let grid = state
            .sheets
            .get_mut(sheet)
            .ok_or_else(|| HostError::MissingSheet {
                sheet: sheet.to_string(),
            })?;
        if cell.row == 0 {
            return Err(HostError::CellUnavailable {
                sheet: sheet.to_string(),
                cell: cell.to_string(),
            });
        }
        put(grid, cell, write.value.clone());
        state.last_writes.insert((sheet.to_string(), cell), write);
        Ok(())
    }

    fn set_connection_status(&mut self, status: ConnectionStatus) {
        let mut state = self.state.lock();
        if state.status != status {
            tracing::debug!(from = %state.status, to = %status, "Connection status");
        }
        state.status = status;
    }

    fn notify(&mut self, notice: Notice) {
        tracing::info!(notice = ?notice, "Workbook notice");
        self.state.lock().notices.push(notice);
    }
}

fn indices(cell: CellRef) -> Option<(usize, usize)> {
    let row = usize::try_from(cell.row.checked_sub(1)?).ok()?;
    let column = usize::try_from(cell.column.index() - 1).ok()?;
    Some((row, column))
}

fn get(grid: &Grid, cell: CellRef) -> CellValue {
    indices(cell)
        .and_then(|(row, column)| grid.get(row)?.get(column).cloned())
        .unwrap_or_default()
}

fn put(grid: &mut Grid, cell: CellRef, value: CellValue) {
    let Some((row, column)) = indices(cell) else {
        return;
    };
    if grid.len() <= row {
        grid.resize_with(row + 1, Vec::new);
    }
    let cells = &mut grid[row];
    if cells.len() <= column {
        cells.resize_with(column + 1, CellValue::default);
    }
    cells[column] = value;
}
