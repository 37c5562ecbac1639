/// Call descriptors: one physical request to the row store, as data.
///
/// A descriptor says *what* to send (`CallKind`), whether it is safe to
/// resend blindly, how much of the rate budget it consumes, and an optional
/// per-attempt timeout. `CallContext` carries the caller's deadline and abort
/// signal down through the executor and retry loop.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tokio::time::Instant;

/// One row of cells, left to right.
pub type Row = Vec<String>;

/// Structural mutation inside a batch update. Indices are 0-based and
/// half-open, as the store's API expects.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum DimensionRequest {
    DeleteRows {
        sheet_id: u64,
        start_index: u32,
        end_index: u32,
    },
    InsertRows {
        sheet_id: u64,
        start_index: u32,
        end_index: u32,
    },
}

impl DimensionRequest {
    /// Delete the single row at 1-based sheet position `position`.
    pub fn delete_row(sheet_id: u64, position: u32) -> Self {
        DimensionRequest::DeleteRows {
            sheet_id,
            start_index: position - 1,
            end_index: position,
        }
    }

    /// Insert `count` blank rows so the first one lands at 1-based `position`.
    pub fn insert_rows(sheet_id: u64, position: u32, count: u32) -> Self {
        DimensionRequest::InsertRows {
            sheet_id,
            start_index: position - 1,
            end_index: position - 1 + count,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CallKind {
    /// `values.get`
    GetValues { range: String },
    /// `values.update`
    UpdateValues { range: String, values: Vec<Row> },
    /// `values.append`; the store picks the insertion point atomically.
    AppendValues { range: String, values: Vec<Row> },
    /// `batchUpdate` with dimension requests, applied in order.
    BatchUpdate { requests: Vec<DimensionRequest> },
    /// Sheet titles and numeric ids.
    SheetMetadata,
}

impl CallKind {
    pub fn name(&self) -> &'static str {
        match self {
            CallKind::GetValues { .. } => "values.get",
            CallKind::UpdateValues { .. } => "values.update",
            CallKind::AppendValues { .. } => "values.append",
            CallKind::BatchUpdate { .. } => "batchUpdate",
            CallKind::SheetMetadata => "spreadsheets.get",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CallDescriptor {
    pub kind: CallKind,
    /// Resending after an ambiguous failure cannot duplicate an effect.
    pub idempotent: bool,
    /// Units charged against the rate budget at admission.
    pub cost: u32,
    /// Bound on a single attempt; the overall deadline still applies.
    pub timeout: Option<Duration>,
}

impl CallDescriptor {
    pub fn new(kind: CallKind, idempotent: bool) -> Self {
        Self {
            kind,
            idempotent,
            cost: 1,
            timeout: None,
        }
    }

    pub fn get_values(range: impl Into<String>) -> Self {
        Self::new(CallKind::GetValues { range: range.into() }, true)
    }

    /// Writing the same cells twice leaves the same result, so updates are
    /// idempotent.
    pub fn update_values(range: impl Into<String>, values: Vec<Row>) -> Self {
        Self::new(
            CallKind::UpdateValues {
                range: range.into(),
                values,
            },
            true,
        )
    }

    pub fn append_values(range: impl Into<String>, values: Vec<Row>) -> Self {
        Self::new(
            CallKind::AppendValues {
                range: range.into(),
                values,
            },
            false,
        )
    }

    pub fn batch_update(requests: Vec<DimensionRequest>) -> Self {
        Self::new(CallKind::BatchUpdate { requests }, false)
    }

    pub fn sheet_metadata() -> Self {
        Self::new(CallKind::SheetMetadata, true)
    }

    pub fn with_cost(mut self, cost: u32) -> Self {
        self.cost = cost.max(1);
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }
}

/// Caller side of an abort signal.
#[derive(Debug)]
pub struct AbortHandle {
    tx: watch::Sender<bool>,
}

impl AbortHandle {
    pub fn abort(&self) {
        let _ = self.tx.send(true);
    }
}

/// Observed by the retry loop; resolves once the paired handle aborts.
#[derive(Debug, Clone)]
pub struct AbortSignal {
    rx: watch::Receiver<bool>,
}

impl AbortSignal {
    pub fn is_aborted(&self) -> bool {
        *self.rx.borrow()
    }

    /// Completes when aborted. Never completes if the handle is dropped first.
    pub async fn aborted(&self) {
        let mut rx = self.rx.clone();
        if rx.wait_for(|aborted| *aborted).await.is_err() {
            futures::future::pending::<()>().await;
        }
    }
}

pub fn abort_pair() -> (AbortHandle, AbortSignal) {
    let (tx, rx) = watch::channel(false);
    (AbortHandle { tx }, AbortSignal { rx })
}

/// Per-operation caller constraints.
#[derive(Debug, Clone, Default)]
pub struct CallContext {
    pub deadline: Option<Instant>,
    pub abort: Option<AbortSignal>,
}

impl CallContext {
    pub fn with_deadline(mut self, deadline: Instant) -> Self {
        self.deadline = Some(deadline);
        self
    }

    pub fn with_timeout(self, timeout: Duration) -> Self {
        self.with_deadline(Instant::now() + timeout)
    }

    pub fn with_abort(mut self, signal: AbortSignal) -> Self {
        self.abort = Some(signal);
        self
    }

    pub fn is_aborted(&self) -> bool {
        self.abort.as_ref().map_or(false, AbortSignal::is_aborted)
    }

    /// The earlier of the caller's deadline and `start + default_timeout`.
    pub fn effective_deadline(&self, start: Instant, default_timeout: Duration) -> Instant {
        let own = start + default_timeout;
        match self.deadline {
            Some(d) if d < own => d,
            _ => own,
        }
    }
}
