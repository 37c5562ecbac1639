/// MemoryStore: an in-process positional row store.
///
/// Speaks the same calls as the HTTP store and keeps the same addressing
/// rules: rows have no identity beyond their position, appends land after
/// the last non-empty row, and each delete in a batch shifts every row
/// below it up by one before the next request is applied.
///
/// Tests use it to script failures (status + body, network errors, stalls),
/// to inspect the exact calls issued, and to interleave a "concurrent"
/// writer just before the next batch update.

use std::collections::VecDeque;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::json;
use tracing::debug;

use crate::descriptor::{CallKind, DimensionRequest, Row};
use crate::range::{self, RangeTarget};
use crate::transport::{StoreResponse, Transport, TransportError};

/// One scripted outcome, consumed by the next call.
#[derive(Debug, Clone)]
pub enum Fault {
    /// Reply with this status and body instead of touching the data.
    Status { status: u16, body: String },
    /// Fail without a response.
    Network(TransportError),
    /// Sleep, then serve the call normally.
    Stall(Duration),
}

impl Fault {
    pub fn status(status: u16) -> Self {
        Fault::Status {
            status,
            body: json!({ "error": { "code": status, "message": "scripted failure" } }).to_string(),
        }
    }

    /// The store's own quota error, the way it reports it.
    pub fn quota(status: u16) -> Self {
        Fault::Status {
            status,
            body: json!({
                "error": {
                    "code": status,
                    "message": "Quota exceeded for quota metric 'Write requests' and limit 'Write requests per minute per user'",
                    "status": "RESOURCE_EXHAUSTED",
                    "details": [{ "reason": "RATE_LIMIT_EXCEEDED" }]
                }
            })
            .to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MemorySheet {
    pub sheet_id: u64,
    pub title: String,
    pub rows: Vec<Row>,
}

impl MemorySheet {
    /// Rows as the store returns them: trailing blank cells and trailing
    /// blank rows trimmed.
    fn visible_rows(&self) -> Vec<Row> {
        let mut rows: Vec<Row> = self
            .rows
            .iter()
            .map(|row| {
                let keep = row.iter().rposition(|c| !c.is_empty()).map_or(0, |i| i + 1);
                row[..keep].to_vec()
            })
            .collect();
        while rows.last().map_or(false, |r| r.is_empty()) {
            rows.pop();
        }
        rows
    }

    fn last_non_empty_row(&self) -> usize {
        self.rows
            .iter()
            .rposition(|row| row.iter().any(|c| !c.is_empty()))
            .map_or(0, |i| i + 1)
    }

    fn write_at(&mut self, row: u32, column: usize, values: &[Row]) {
        let start = (row - 1) as usize;
        let needed = start + values.len();
        if self.rows.len() < needed {
            self.rows.resize(needed, Vec::new());
        }
        for (offset, cells) in values.iter().enumerate() {
            let target = &mut self.rows[start + offset];
            if target.len() < column + cells.len() {
                target.resize(column + cells.len(), String::new());
            }
            for (i, cell) in cells.iter().enumerate() {
                target[column + i] = cell.clone();
            }
        }
    }

    /// Insert a row at 1-based `position`, shifting everything below down.
    pub fn insert_row(&mut self, position: u32, row: Row) {
        let index = (position - 1) as usize;
        if index > self.rows.len() {
            self.rows.resize(index, Vec::new());
        }
        self.rows.insert(index, row);
    }
}

/// The sheets held by a `MemoryStore`.
#[derive(Debug, Default)]
pub struct MemoryTables {
    sheets: Vec<MemorySheet>,
    next_sheet_id: u64,
}

impl MemoryTables {
    pub fn sheet(&self, title: &str) -> Option<&MemorySheet> {
        self.sheets.iter().find(|s| s.title == title)
    }

    pub fn sheet_mut(&mut self, title: &str) -> Option<&mut MemorySheet> {
        self.sheets.iter_mut().find(|s| s.title == title)
    }

    fn sheet_by_id_mut(&mut self, sheet_id: u64) -> Option<&mut MemorySheet> {
        self.sheets.iter_mut().find(|s| s.sheet_id == sheet_id)
    }

    fn add(&mut self, title: &str, rows: Vec<Row>) -> u64 {
        let sheet_id = self.next_sheet_id;
        self.next_sheet_id += 1;
        self.sheets.push(MemorySheet {
            sheet_id,
            title: title.to_string(),
            rows,
        });
        sheet_id
    }
}

type BatchHook = Box<dyn FnOnce(&mut MemoryTables) + Send>;

#[derive(Default)]
pub struct MemoryStore {
    tables: Mutex<MemoryTables>,
    calls: Mutex<Vec<CallKind>>,
    faults: Mutex<VecDeque<Fault>>,
    batch_hook: Mutex<Option<BatchHook>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_sheet(self, title: &str, rows: Vec<Row>) -> Self {
        self.add_sheet(title, rows);
        self
    }

    pub fn add_sheet(&self, title: &str, rows: Vec<Row>) -> u64 {
        self.tables.lock().add(title, rows)
    }

    pub fn sheet_id(&self, title: &str) -> Option<u64> {
        self.tables.lock().sheet(title).map(|s| s.sheet_id)
    }

    /// Current contents of a sheet, trimmed the way reads see it.
    pub fn rows(&self, title: &str) -> Vec<Row> {
        self.tables
            .lock()
            .sheet(title)
            .map(MemorySheet::visible_rows)
            .unwrap_or_default()
    }

    /// Mutate the tables directly, bypassing the call log and faults.
    pub fn edit<R>(&self, f: impl FnOnce(&mut MemoryTables) -> R) -> R {
        f(&mut self.tables.lock())
    }

    pub fn push_fault(&self, fault: Fault) {
        self.faults.lock().push_back(fault);
    }

    pub fn push_faults(&self, faults: impl IntoIterator<Item = Fault>) {
        self.faults.lock().extend(faults);
    }

    /// Run `hook` against the tables right before the next batch update is
    /// applied, as if another client wrote in between.
    pub fn before_next_batch_update(&self, hook: impl FnOnce(&mut MemoryTables) + Send + 'static) {
        *self.batch_hook.lock() = Some(Box::new(hook));
    }

    /// Every call that reached the store, faults included.
    pub fn calls(&self) -> Vec<CallKind> {
        self.calls.lock().clone()
    }

    pub fn call_count(&self, name: &str) -> usize {
        self.calls.lock().iter().filter(|c| c.name() == name).count()
    }

    pub fn reset_calls(&self) {
        self.calls.lock().clear();
    }

    fn apply(&self, call: &CallKind) -> StoreResponse {
        match call {
            CallKind::GetValues { range: a1 } => {
                let tables = self.tables.lock();
                let Some(parsed) = range::parse(a1) else {
                    return bad_range(a1);
                };
                let Some(sheet) = tables.sheet(&parsed.sheet) else {
                    return bad_range(a1);
                };
                let rows = sheet.visible_rows();
                let values: Vec<Row> = match parsed.target {
                    RangeTarget::Sheet => rows,
                    RangeTarget::Row(r) => rows.into_iter().skip((r - 1) as usize).take(1).collect(),
                    RangeTarget::Anchor { row, column } => rows
                        .into_iter()
                        .skip((row - 1) as usize)
                        .map(|r| r.into_iter().skip(column).collect())
                        .collect(),
                };
                if values.is_empty() {
                    StoreResponse::ok_json(&json!({ "range": a1, "majorDimension": "ROWS" }))
                } else {
                    StoreResponse::ok_json(
                        &json!({ "range": a1, "majorDimension": "ROWS", "values": values }),
                    )
                }
            }
            CallKind::UpdateValues { range: a1, values } => {
                let mut tables = self.tables.lock();
                let Some(parsed) = range::parse(a1) else {
                    return bad_range(a1);
                };
                let (row, column) = match parsed.target {
                    RangeTarget::Sheet => (1, 0),
                    RangeTarget::Row(r) => (r, 0),
                    RangeTarget::Anchor { row, column } => (row, column),
                };
                let Some(sheet) = tables.sheet_mut(&parsed.sheet) else {
                    return bad_range(a1);
                };
                sheet.write_at(row, column, values);
                StoreResponse::ok_json(&json!({ "updatedRange": a1, "updatedRows": values.len() }))
            }
            CallKind::AppendValues { range: a1, values } => {
                let mut tables = self.tables.lock();
                let Some(parsed) = range::parse(a1) else {
                    return bad_range(a1);
                };
                let Some(sheet) = tables.sheet_mut(&parsed.sheet) else {
                    return bad_range(a1);
                };
                let first = sheet.last_non_empty_row() as u32 + 1;
                sheet.write_at(first, 0, values);
                let updated = format!("{}!A{}", range::quote_sheet(&sheet.title), first);
                StoreResponse::ok_json(&json!({
                    "updates": { "updatedRange": updated, "updatedRows": values.len() }
                }))
            }
            CallKind::BatchUpdate { requests } => {
                let hook = self.batch_hook.lock().take();
                let mut tables = self.tables.lock();
                if let Some(hook) = hook {
                    hook(&mut tables);
                }
                for request in requests {
                    let (DimensionRequest::DeleteRows { sheet_id, .. }
                    | DimensionRequest::InsertRows { sheet_id, .. }) = request;
                    let Some(sheet) = tables.sheet_by_id_mut(*sheet_id) else {
                        return StoreResponse::new(
                            400,
                            json!({ "error": { "code": 400, "message": format!("No grid with id: {}", sheet_id), "status": "INVALID_ARGUMENT" } })
                                .to_string(),
                        );
                    };
                    match *request {
                        DimensionRequest::DeleteRows {
                            start_index,
                            end_index,
                            ..
                        } => {
                            let len = sheet.rows.len();
                            let start = (start_index as usize).min(len);
                            let end = (end_index as usize).min(len);
                            sheet.rows.drain(start..end);
                        }
                        DimensionRequest::InsertRows {
                            start_index,
                            end_index,
                            ..
                        } => {
                            for offset in 0..end_index.saturating_sub(start_index) {
                                sheet.insert_row(start_index + offset + 1, Vec::new());
                            }
                        }
                    }
                }
                StoreResponse::ok_json(&json!({ "replies": vec![json!({}); requests.len()] }))
            }
            CallKind::SheetMetadata => {
                let tables = self.tables.lock();
                let sheets: Vec<_> = tables
                    .sheets
                    .iter()
                    .map(|s| json!({ "properties": { "sheetId": s.sheet_id, "title": s.title } }))
                    .collect();
                StoreResponse::ok_json(&json!({ "sheets": sheets }))
            }
        }
    }
}

fn bad_range(a1: &str) -> StoreResponse {
    StoreResponse::new(
        400,
        json!({ "error": { "code": 400, "message": format!("Unable to parse range: {}", a1), "status": "INVALID_ARGUMENT" } })
            .to_string(),
    )
}

#[async_trait]
impl Transport for MemoryStore {
    async fn send(&self, call: &CallKind) -> Result<StoreResponse, TransportError> {
        self.calls.lock().push(call.clone());

        let fault = self.faults.lock().pop_front();
        match fault {
            Some(Fault::Status { status, body }) => {
                debug!("MemoryStore: scripted {} for {}", status, call.name());
                return Ok(StoreResponse::new(status, body));
            }
            Some(Fault::Network(err)) => {
                debug!("MemoryStore: scripted network failure for {}", call.name());
                return Err(err);
            }
            Some(Fault::Stall(delay)) => {
                tokio::time::sleep(delay).await;
            }
            None => {}
        }

        Ok(self.apply(call))
    }
}
