/// Rate-Limited Executor: every outbound call passes through here.
///
/// A fixed-window budget caps how many cost units are admitted per window.
/// Admission is strictly first-come first-served: callers queue on a fair
/// async mutex, and the head of the queue sleeps until the window boundary
/// when the budget is spent, so nobody behind it can jump ahead. Cost is
/// charged at admission, before the call resolves. Admitted calls are run by
/// the retry controller.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::time::Instant;
use tracing::{debug, info};

use crate::config::{RateSettings, RowGateConfig};
use crate::descriptor::{CallContext, CallDescriptor};
use crate::error::{Result, RowGateError};
use crate::retry::{CallOutcome, RetryController};
use crate::transport::Transport;

/// Calls issued in the current fixed window.
#[derive(Debug)]
struct RateBudget {
    window_start: Instant,
    issued: u32,
    ceiling: u32,
    window: Duration,
}

impl RateBudget {
    fn new(settings: RateSettings, now: Instant) -> Self {
        Self {
            window_start: now,
            issued: 0,
            ceiling: settings.ceiling.max(1),
            window: settings.window(),
        }
    }

    /// Move to the window containing `now`, aligned to the first window.
    fn roll(&mut self, now: Instant) {
        let elapsed = now.saturating_duration_since(self.window_start);
        if elapsed >= self.window {
            let windows = (elapsed.as_nanos() / self.window.as_nanos()) as u32;
            self.window_start += self.window * windows;
            self.issued = 0;
        }
    }

    /// Check and charge in one step. On refusal, returns when the current
    /// window ends. A call costing more than the whole ceiling is let into
    /// an empty window rather than starved.
    fn try_admit(&mut self, cost: u32, now: Instant) -> std::result::Result<(), Instant> {
        self.roll(now);
        if self.issued == 0 || self.issued.saturating_add(cost) <= self.ceiling {
            self.issued = self.issued.saturating_add(cost);
            Ok(())
        } else {
            Err(self.window_start + self.window)
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecutorStats {
    /// Calls admitted since construction.
    pub admitted: u64,
    /// Calls that had to wait for at least one window rollover.
    pub deferred: u64,
    /// Cost units charged in the current window.
    pub window_calls: u32,
    pub ceiling: u32,
}

pub struct RateLimitedExecutor {
    retry: RetryController,
    budget: Mutex<RateBudget>,
    /// Fair (FIFO) queue of callers waiting for admission.
    admission: tokio::sync::Mutex<()>,
    admitted: AtomicU64,
    deferred: AtomicU64,
}

impl RateLimitedExecutor {
    pub fn new(transport: Arc<dyn Transport>, config: &RowGateConfig) -> Self {
        info!(
            "Initializing rate-limited executor: {} calls per {:?}",
            config.rate.ceiling,
            config.rate.window()
        );
        Self {
            retry: RetryController::new(transport, config),
            budget: Mutex::new(RateBudget::new(config.rate, Instant::now())),
            admission: tokio::sync::Mutex::new(()),
            admitted: AtomicU64::new(0),
            deferred: AtomicU64::new(0),
        }
    }

    pub async fn submit(&self, descriptor: CallDescriptor) -> Result<CallOutcome> {
        self.submit_with(&descriptor, &CallContext::default()).await
    }

    /// Wait for admission, then run the call through the retry controller.
    /// Budget already charged is not refunded if the call later fails or is
    /// cancelled.
    pub async fn submit_with(
        &self,
        descriptor: &CallDescriptor,
        ctx: &CallContext,
    ) -> Result<CallOutcome> {
        self.admit(descriptor, ctx).await?;
        self.retry.execute_with(descriptor, ctx).await
    }

    async fn admit(&self, descriptor: &CallDescriptor, ctx: &CallContext) -> Result<()> {
        let queued_at = Instant::now();
        let _turn = tokio::select! {
            biased;
            _ = wait_for_abort(ctx) => return Err(RowGateError::Cancelled { attempts: 0 }),
            _ = wait_for_deadline(ctx) => {
                return Err(RowGateError::Timeout { elapsed: queued_at.elapsed(), attempts: 0 });
            }
            turn = self.admission.lock() => turn,
        };

        let mut waited = false;
        loop {
            let refused_until = {
                let mut budget = self.budget.lock();
                match budget.try_admit(descriptor.cost, Instant::now()) {
                    Ok(()) => None,
                    Err(window_end) => Some(window_end),
                }
            };

            let Some(window_end) = refused_until else {
                self.admitted.fetch_add(1, Ordering::Relaxed);
                debug!(
                    "Admitted {} (cost {}) after {:?}",
                    descriptor.kind.name(),
                    descriptor.cost,
                    queued_at.elapsed()
                );
                return Ok(());
            };

            if !waited {
                waited = true;
                self.deferred.fetch_add(1, Ordering::Relaxed);
            }
            debug!(
                "Rate budget spent; {} waits {:?} for the next window",
                descriptor.kind.name(),
                window_end.saturating_duration_since(Instant::now())
            );

            tokio::select! {
                biased;
                _ = wait_for_abort(ctx) => return Err(RowGateError::Cancelled { attempts: 0 }),
                _ = wait_for_deadline(ctx) => {
                    return Err(RowGateError::Timeout { elapsed: queued_at.elapsed(), attempts: 0 });
                }
                _ = tokio::time::sleep_until(window_end) => {}
            }
        }
    }

    pub fn stats(&self) -> ExecutorStats {
        let (window_calls, ceiling) = {
            let mut budget = self.budget.lock();
            budget.roll(Instant::now());
            (budget.issued, budget.ceiling)
        };
        ExecutorStats {
            admitted: self.admitted.load(Ordering::Relaxed),
            deferred: self.deferred.load(Ordering::Relaxed),
            window_calls,
            ceiling,
        }
    }
}

async fn wait_for_abort(ctx: &CallContext) {
    match &ctx.abort {
        Some(signal) => signal.aborted().await,
        None => futures::future::pending::<()>().await,
    }
}

async fn wait_for_deadline(ctx: &CallContext) {
    match ctx.deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => futures::future::pending::<()>().await,
    }
}
