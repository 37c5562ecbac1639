/// RowStore: the CRUD engine over a positional row store.
///
/// Callers speak in logical terms (ensure a header, find a row by key,
/// upsert, delete or update every row matching a predicate) and never see
/// physical positions except as read-only facts on a returned row. Each
/// logical operation becomes a minimal set of physical calls through the
/// shared rate-limited executor. Reads go through the TTL cache; writes
/// invalidate the affected sheet's cache family once they have succeeded.
///
/// Row 1 of every sheet is the header. Data rows start at position 2 and
/// positions are recomputed from a fresh read by every operation that writes
/// to a position.
///
/// Known limitation: `delete_rows` reads, computes positions, then deletes.
/// Another client mutating the sheet in between makes the batch hit stale
/// positions. The store offers no version check to guard against this.

use std::collections::BTreeMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use futures::future::join_all;
use serde_json::Value;
use tracing::{debug, info, info_span, warn, Instrument};

use crate::cache::{CacheStats, TtlCache};
use crate::config::{ResourceClass, RowGateConfig};
use crate::descriptor::{CallContext, CallDescriptor, DimensionRequest, Row};
use crate::error::{Result, RowGateError};
use crate::executor::{ExecutorStats, RateLimitedExecutor};
use crate::range;
use crate::transport::{parse_sheets, parse_values, SheetInfo, StoreResponse, Transport};

/// Column name to cell value, as handed to writes.
pub type Fields = BTreeMap<String, String>;

/// Build `Fields` from pairs.
pub fn fields<K, V, I>(pairs: I) -> Fields
where
    K: Into<String>,
    V: Into<String>,
    I: IntoIterator<Item = (K, V)>,
{
    pairs
        .into_iter()
        .map(|(k, v)| (k.into(), v.into()))
        .collect()
}

/// One record as of the read that produced it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogicalRow {
    /// 1-based sheet row. Only valid until the next insert or delete above it.
    pub position: u32,
    /// In header order.
    pub fields: Vec<(String, String)>,
}

impl LogicalRow {
    fn from_cells(header: &[String], cells: &[String], position: u32) -> Self {
        let fields = header
            .iter()
            .enumerate()
            .map(|(i, column)| (column.clone(), cells.get(i).cloned().unwrap_or_default()))
            .collect();
        Self { position, fields }
    }

    pub fn get(&self, column: &str) -> Option<&str> {
        self.fields
            .iter()
            .find(|(c, _)| c == column)
            .map(|(_, v)| v.as_str())
    }
}

/// What `ensure_schema` had to do.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SchemaChange {
    /// Header already matched or extended the expected one.
    Unchanged,
    /// Sheet had no header.
    Created,
    /// Existing header was a strict prefix; missing columns were added.
    Extended,
    /// Existing header disagreed and was overwritten.
    Replaced,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Upserted {
    Updated { position: u32 },
    /// Position is known when the store reports where the append landed.
    Inserted { position: Option<u32> },
}

#[derive(Debug, Clone)]
pub struct RowStoreStats {
    pub executor: ExecutorStats,
    pub cache: CacheStats,
}

#[derive(Debug, Clone)]
enum Cached {
    Values(Arc<Vec<Row>>),
    Sheets(Arc<Vec<SheetInfo>>),
}

fn header_key(sheet: &str) -> String {
    format!("sheet:{}:header", sheet)
}

fn rows_key(sheet: &str) -> String {
    format!("sheet:{}:rows", sheet)
}

fn family_key(sheet: &str) -> String {
    format!("sheet:{}:", sheet)
}

const SHEETS_KEY: &str = "spreadsheet:sheets";

fn trim_trailing_blanks(row: &[String]) -> &[String] {
    let keep = row.iter().rposition(|c| !c.trim().is_empty()).map_or(0, |i| i + 1);
    &row[..keep]
}

fn key_matches(cell: Option<&String>, key_value: &str) -> bool {
    cell.map_or(false, |c| c.trim() == key_value.trim())
}

/// Sheet row an append landed on, from `updates.updatedRange` (`T!A7:C7`).
fn appended_position(response: &StoreResponse) -> Option<u32> {
    let body: Value = response.json().ok()?;
    let updated = body.pointer("/updates/updatedRange")?.as_str()?;
    let cells = updated.rsplit_once('!').map_or(updated, |(_, c)| c);
    let start = cells.split(':').next()?;
    let digits: String = start.chars().skip_while(|c| c.is_ascii_alphabetic()).collect();
    digits.parse().ok()
}

/// Run one logical operation inside its span, tagging any error with it.
async fn traced<T, F>(op: &'static str, range: &str, operation: F) -> Result<T>
where
    F: Future<Output = Result<T>>,
{
    operation
        .instrument(info_span!("row_store", op = op, range = %range))
        .await
        .map_err(|e| e.in_operation(op, range))
}

struct Shared {
    executor: RateLimitedExecutor,
    cache: TtlCache<Cached>,
    config: RowGateConfig,
    schemas: DashMap<String, Vec<String>>,
}

/// Cheap to clone; clones share the executor, cache and registered schemas.
#[derive(Clone)]
pub struct RowStore {
    shared: Arc<Shared>,
    ctx: CallContext,
}

impl RowStore {
    pub fn new(config: RowGateConfig, transport: Arc<dyn Transport>) -> Result<Self> {
        config.validate()?;
        info!("Initializing RowStore");
        Ok(Self {
            shared: Arc::new(Shared {
                executor: RateLimitedExecutor::new(transport, &config),
                cache: TtlCache::new(),
                config,
                schemas: DashMap::new(),
            }),
            ctx: CallContext::default(),
        })
    }

    /// A handle whose operations honour `ctx` (deadline, abort).
    pub fn with_context(&self, ctx: CallContext) -> Self {
        Self {
            shared: self.shared.clone(),
            ctx,
        }
    }

    /// Every later operation on `sheet` first runs `ensure_schema` with
    /// this header.
    pub fn register_schema(&self, sheet: &str, header: &[&str]) {
        self.shared.schemas.insert(
            sheet.to_string(),
            header.iter().map(|c| c.to_string()).collect(),
        );
    }

    pub fn stats(&self) -> RowStoreStats {
        RowStoreStats {
            executor: self.shared.executor.stats(),
            cache: self.shared.cache.stats(),
        }
    }

    /// Drop cached entries whose key starts with `prefix`, e.g. after an
    /// out-of-band edit.
    pub fn invalidate(&self, prefix: &str) -> usize {
        self.shared.cache.invalidate(prefix)
    }

    // ---- physical calls -------------------------------------------------

    async fn call(&self, descriptor: CallDescriptor) -> Result<StoreResponse> {
        let outcome = self
            .shared
            .executor
            .submit_with(&descriptor, &self.ctx)
            .await?;
        Ok(outcome.response)
    }

    /// Read-through fetch of a value range. `fresh` skips the lookup but
    /// still repopulates. An empty range is not cached: "nothing there yet"
    /// must not outlive the write that fills it.
    async fn read_values(
        &self,
        a1: &str,
        key: String,
        ttl: Duration,
        fresh: bool,
    ) -> Result<Arc<Vec<Row>>> {
        let cache = &self.shared.cache;
        if !fresh {
            if let Some(Cached::Values(rows)) = cache.get(&key) {
                return Ok(rows);
            }
        }
        let generation = cache.generation();
        let response = self.call(CallDescriptor::get_values(a1)).await?;
        let rows = Arc::new(parse_values(&response)?);
        if rows.is_empty() {
            debug!("Not caching empty read of {}", a1);
        } else {
            cache.set_if_unchanged(key, Cached::Values(rows.clone()), ttl, generation);
        }
        Ok(rows)
    }

    fn ttl(&self, class: ResourceClass) -> Duration {
        self.shared.config.cache.ttl_for(class)
    }

    async fn sheet_values(&self, sheet: &str, fresh: bool) -> Result<Arc<Vec<Row>>> {
        self.read_values(
            &range::whole_sheet(sheet),
            rows_key(sheet),
            self.ttl(ResourceClass::Rows),
            fresh,
        )
        .await
    }

    async fn sheet_id(&self, sheet: &str) -> Result<u64> {
        let cache = &self.shared.cache;
        let sheets = match cache.get(SHEETS_KEY) {
            Some(Cached::Sheets(sheets)) => sheets,
            _ => {
                let generation = cache.generation();
                let response = self.call(CallDescriptor::sheet_metadata()).await?;
                let sheets = Arc::new(parse_sheets(&response)?);
                cache.set_if_unchanged(
                    SHEETS_KEY,
                    Cached::Sheets(sheets.clone()),
                    self.ttl(ResourceClass::Metadata),
                    generation,
                );
                sheets
            }
        };
        sheets
            .iter()
            .find(|s| s.title == sheet)
            .map(|s| s.sheet_id)
            .ok_or_else(|| RowGateError::UnexpectedState(format!("no sheet titled '{}'", sheet)))
    }

    fn invalidate_rows(&self, sheet: &str) {
        self.shared.cache.invalidate(&rows_key(sheet));
    }

    fn invalidate_family(&self, sheet: &str) {
        self.shared.cache.invalidate(&family_key(sheet));
    }

    async fn confirm_schema(&self, sheet: &str) -> Result<()> {
        let expected = self.shared.schemas.get(sheet).map(|h| h.value().clone());
        if let Some(expected) = expected {
            self.ensure_schema_inner(sheet, &expected).await?;
        }
        Ok(())
    }

    /// Header and data rows of a fresh or cached read.
    async fn table(&self, sheet: &str, fresh: bool) -> Result<(Vec<String>, Arc<Vec<Row>>)> {
        self.confirm_schema(sheet).await?;
        let values = self.sheet_values(sheet, fresh).await?;
        let header = values
            .first()
            .map(|h| trim_trailing_blanks(h).iter().map(|c| c.trim().to_string()).collect())
            .unwrap_or_default();
        Ok((header, values))
    }

    fn column_index(header: &[String], sheet: &str, column: &str) -> Result<usize> {
        header
            .iter()
            .position(|c| c == column)
            .ok_or_else(|| RowGateError::UnknownColumn {
                range: sheet.to_string(),
                column: column.to_string(),
            })
    }

    /// Data rows as logical rows, skipping blank lines.
    fn logical_rows(header: &[String], values: &[Row]) -> Vec<LogicalRow> {
        values
            .iter()
            .enumerate()
            .skip(1)
            .filter(|(_, cells)| cells.iter().any(|c| !c.trim().is_empty()))
            .map(|(i, cells)| LogicalRow::from_cells(header, cells, i as u32 + 1))
            .collect()
    }

    /// `existing` with `updates` applied, laid out in header order.
    fn merged_cells(
        header: &[String],
        sheet: &str,
        existing: Option<&[String]>,
        updates: &Fields,
    ) -> Result<Row> {
        let mut cells: Row = (0..header.len())
            .map(|i| existing.and_then(|e| e.get(i)).cloned().unwrap_or_default())
            .collect();
        for (column, value) in updates {
            let index = Self::column_index(header, sheet, column)?;
            cells[index] = value.clone();
        }
        Ok(cells)
    }

    // ---- logical operations ---------------------------------------------

    /// Make row 1 of `sheet` match or extend `expected`. Safe to call before
    /// every operation: when the header already fits, this costs one
    /// (usually cached) read and no write.
    pub async fn ensure_schema(&self, sheet: &str, expected: &[&str]) -> Result<SchemaChange> {
        let expected: Vec<String> = expected.iter().map(|c| c.to_string()).collect();
        traced("ensure_schema", sheet, self.ensure_schema_inner(sheet, &expected)).await
    }

    async fn ensure_schema_inner(&self, sheet: &str, expected: &[String]) -> Result<SchemaChange> {
        let header_rows = self
            .read_values(
                &range::header_row(sheet),
                header_key(sheet),
                self.ttl(ResourceClass::Header),
                false,
            )
            .await?;
        let raw: &[String] = header_rows.first().map(Vec::as_slice).unwrap_or(&[]);
        let current: Vec<String> = trim_trailing_blanks(raw)
            .iter()
            .map(|c| c.trim().to_string())
            .collect();

        if current.len() >= expected.len() && current[..expected.len()] == *expected {
            debug!("Header of {} already fits", sheet);
            return Ok(SchemaChange::Unchanged);
        }

        let change = if current.is_empty() {
            SchemaChange::Created
        } else if expected.starts_with(&current) {
            SchemaChange::Extended
        } else {
            warn!(
                "Header of {} {:?} disagrees with expected {:?}; overwriting",
                sheet, current, expected
            );
            SchemaChange::Replaced
        };

        // Pad so leftover cells of a longer, different header are cleared.
        let mut header: Row = expected.to_vec();
        if raw.len() > header.len() {
            header.resize(raw.len(), String::new());
        }
        self.call(CallDescriptor::update_values(
            range::row_anchor(sheet, 1),
            vec![header],
        ))
        .await?;
        self.invalidate_family(sheet);
        info!("Header of {} written ({:?})", sheet, change);
        Ok(change)
    }

    /// First data row whose `key_column` equals `key_value` (both trimmed).
    /// No match is `Ok(None)`.
    pub async fn find_row(
        &self,
        sheet: &str,
        key_column: &str,
        key_value: &str,
    ) -> Result<Option<LogicalRow>> {
        traced("find_row", sheet, async {
            let (header, values) = self.table(sheet, false).await?;
            Self::locate(&header, &values, sheet, key_column, key_value)
        })
        .await
    }

    fn locate(
        header: &[String],
        values: &[Row],
        sheet: &str,
        key_column: &str,
        key_value: &str,
    ) -> Result<Option<LogicalRow>> {
        if header.is_empty() {
            return Ok(None);
        }
        let key_index = Self::column_index(header, sheet, key_column)?;
        Ok(values
            .iter()
            .enumerate()
            .skip(1)
            .find(|(_, cells)| key_matches(cells.get(key_index), key_value))
            .map(|(i, cells)| LogicalRow::from_cells(header, cells, i as u32 + 1)))
    }

    /// Every data row, in sheet order.
    pub async fn read_rows(&self, sheet: &str) -> Result<Vec<LogicalRow>> {
        traced("read_rows", sheet, async {
            let (header, values) = self.table(sheet, false).await?;
            Ok(Self::logical_rows(&header, &values))
        })
        .await
    }

    /// Overwrite the matching row in place, or append a new one. Columns not
    /// named in `updates` keep their current values on update.
    pub async fn upsert_row(
        &self,
        sheet: &str,
        key_column: &str,
        key_value: &str,
        updates: &Fields,
    ) -> Result<Upserted> {
        traced("upsert_row", sheet, self.upsert_row_inner(sheet, key_column, key_value, updates)).await
    }

    async fn upsert_row_inner(
        &self,
        sheet: &str,
        key_column: &str,
        key_value: &str,
        updates: &Fields,
    ) -> Result<Upserted> {
        let (header, values) = self.table(sheet, true).await?;
        if header.is_empty() {
            return Err(RowGateError::UnknownColumn {
                range: sheet.to_string(),
                column: key_column.to_string(),
            });
        }
        let key_index = Self::column_index(&header, sheet, key_column)?;

        let outcome = match Self::locate(&header, &values, sheet, key_column, key_value)? {
            Some(found) => {
                let existing = &values[(found.position - 1) as usize];
                let cells = Self::merged_cells(&header, sheet, Some(existing), updates)?;
                self.call(CallDescriptor::update_values(
                    range::row_anchor(sheet, found.position),
                    vec![cells],
                ))
                .await?;
                info!("Updated {}={} at row {} of {}", key_column, key_value, found.position, sheet);
                Upserted::Updated {
                    position: found.position,
                }
            }
            None => {
                let mut cells = Self::merged_cells(&header, sheet, None, updates)?;
                if cells[key_index].trim().is_empty() {
                    cells[key_index] = key_value.to_string();
                }
                let response = self
                    .call(CallDescriptor::append_values(
                        range::whole_sheet(sheet),
                        vec![cells],
                    ))
                    .await?;
                let position = appended_position(&response);
                info!("Appended {}={} to {} at {:?}", key_column, key_value, sheet, position);
                Upserted::Inserted { position }
            }
        };

        self.invalidate_rows(sheet);
        Ok(outcome)
    }

    /// Delete every data row matching `predicate` with one batched call.
    /// Returns the deleted positions in the order they were processed,
    /// which is always highest first: each delete shifts the rows below it
    /// up, so going bottom-up keeps the remaining targets where they were.
    pub async fn delete_rows<P>(&self, sheet: &str, predicate: P) -> Result<Vec<u32>>
    where
        P: Fn(&LogicalRow) -> bool,
    {
        traced("delete_rows", sheet, async {
            let (header, values) = self.table(sheet, true).await?;
            let mut positions: Vec<u32> = Self::logical_rows(&header, &values)
                .iter()
                .filter(|&row| predicate(row))
                .map(|row| row.position)
                .collect();
            if positions.is_empty() {
                debug!("delete_rows on {}: nothing matched", sheet);
                return Ok(positions);
            }
            positions.sort_unstable_by(|a, b| b.cmp(a));

            let sheet_id = self.sheet_id(sheet).await?;
            let requests = positions
                .iter()
                .map(|&p| DimensionRequest::delete_row(sheet_id, p))
                .collect();
            self.call(CallDescriptor::batch_update(requests)).await?;

            self.invalidate_rows(sheet);
            info!("Deleted {} rows from {}: {:?}", positions.len(), sheet, positions);
            Ok(positions)
        })
        .await
    }

    /// Rewrite every data row matching `predicate` in place with `updates`
    /// applied. Positions are preserved. Returns the positions written.
    pub async fn update_rows<P>(&self, sheet: &str, predicate: P, updates: &Fields) -> Result<Vec<u32>>
    where
        P: Fn(&LogicalRow) -> bool,
    {
        traced("update_rows", sheet, async {
            let (header, values) = self.table(sheet, true).await?;
            let mut writes = Vec::new();
            for row in Self::logical_rows(&header, &values).iter().filter(|&r| predicate(r)) {
                let existing = &values[(row.position - 1) as usize];
                let cells = Self::merged_cells(&header, sheet, Some(existing), updates)?;
                writes.push((row.position, cells));
            }
            if writes.is_empty() {
                return Ok(Vec::new());
            }

            let results = join_all(writes.into_iter().map(|(position, cells)| async move {
                self.call(CallDescriptor::update_values(
                    range::row_anchor(sheet, position),
                    vec![cells],
                ))
                .await
                .map(|_| position)
            }))
            .await;

            // Some rows may already be rewritten even if others failed.
            self.invalidate_rows(sheet);
            let mut written = Vec::with_capacity(results.len());
            for result in results {
                written.push(result?);
            }
            info!("Updated {} rows of {}", written.len(), sheet);
            Ok(written)
        })
        .await
    }

    /// Insert `rows` so the first lands at sheet row `position`, pushing the
    /// existing rows there and below down.
    pub async fn insert_rows_at(&self, sheet: &str, position: u32, rows: Vec<Row>) -> Result<()> {
        traced("insert_rows_at", sheet, async {
            if position < 2 {
                return Err(RowGateError::Fatal {
                    status: None,
                    message: format!("cannot insert above the header of '{}'", sheet),
                });
            }
            if rows.is_empty() {
                return Ok(());
            }
            self.confirm_schema(sheet).await?;
            let sheet_id = self.sheet_id(sheet).await?;
            self.call(CallDescriptor::batch_update(vec![DimensionRequest::insert_rows(
                sheet_id,
                position,
                rows.len() as u32,
            )]))
            .await?;
            // The blank rows exist now; drop cached positions before filling them.
            self.invalidate_rows(sheet);
            self.call(CallDescriptor::update_values(
                range::row_anchor(sheet, position),
                rows,
            ))
            .await?;
            self.invalidate_rows(sheet);
            Ok(())
        })
        .await
    }

    /// Raw read of any A1 range, cached under the owning sheet's family with
    /// the default TTL. Ranges of other shapes go straight to the store.
    pub async fn get(&self, a1: &str) -> Result<Vec<Row>> {
        traced("get", a1, async {
            match range::parse(a1) {
                Some(parsed) => {
                    let key = format!("{}:raw:{}", rows_key(&parsed.sheet), a1);
                    let ttl = self.shared.config.cache.default_ttl();
                    let rows = self.read_values(a1, key, ttl, false).await?;
                    Ok(rows.as_ref().clone())
                }
                None => {
                    let response = self.call(CallDescriptor::get_values(a1)).await?;
                    parse_values(&response)
                }
            }
        })
        .await
    }

    /// Raw append. Returns the sheet row of the first appended row if the
    /// store reports it.
    pub async fn append(&self, a1: &str, rows: Vec<Row>) -> Result<Option<u32>> {
        traced("append", a1, async {
            let response = self.call(CallDescriptor::append_values(a1, rows)).await?;
            match range::parse(a1) {
                Some(parsed) => self.invalidate_rows(&parsed.sheet),
                None => {
                    self.shared.cache.invalidate("sheet:");
                }
            }
            Ok(appended_position(&response))
        })
        .await
    }
}
