//! Coordinator Thread
//!
//! The single thread that executes VM operations:
//! - dequeues with the queue's safepoint bias
//! - for a safepoint operation: synchronizes, runs it, then drains and runs
//!   every other queued safepoint operation before releasing (coalescing),
//!   then runs the cleanup tasks
//! - when no safepoint happened for `guaranteed_safepoint_interval_ms` and the
//!   monitor population is mostly in use, forces a maintenance safepoint
//!
//! Nested operations (submitted from inside an operation body) run inline on
//! this thread, and only if the enclosing operation allows it.

use super::operation::{MaintenanceOperation, OperationContext, VmOperation};
use super::queue::QueuedOperation;
use super::{RuntimeShared, RuntimeState};
use crate::error::{FvmError, Result};
use crate::logging::VmEvent;
use crate::stats::VmTimer;
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Instant;

/// The operation currently running on the coordinator thread
#[derive(Clone)]
pub(crate) struct CurrentOperation {
    pub(crate) name: String,
    pub(crate) allow_nested: bool,
    pub(crate) at_safepoint: bool,
}

enum Next {
    Operation(QueuedOperation),
    Maintenance,
    Exit,
}

pub(crate) fn spawn(shared: Arc<RuntimeShared>) -> std::io::Result<JoinHandle<()>> {
    thread::Builder::new()
        .name("vm-coordinator".to_string())
        .spawn(move || Coordinator::new(shared).run())
}

struct Coordinator {
    shared: Arc<RuntimeShared>,
    last_safepoint: Instant,
}

impl Coordinator {
    fn new(shared: Arc<RuntimeShared>) -> Self {
        Self {
            shared,
            last_safepoint: Instant::now(),
        }
    }

    fn run(mut self) {
        *self.shared.coordinator_thread.lock() = Some(thread::current().id());
        log::debug!("VM coordinator started");

        loop {
            match self.next() {
                Next::Operation(op) => self.execute(op),
                Next::Maintenance => self.maintenance(),
                Next::Exit => break,
            }
        }

        log::debug!("VM coordinator stopped");
    }

    /// Block until there is work, a forced safepoint is due, or shutdown
    fn next(&mut self) -> Next {
        let interval = self.shared.config.guaranteed_safepoint_interval();
        let mut queue = self.shared.queue.lock();

        loop {
            if let Some(op) = queue.pop() {
                return Next::Operation(op);
            }

            if self.shared.state() != RuntimeState::Running {
                return Next::Exit;
            }

            match interval {
                None => self.shared.queue_cv.wait(&mut queue),
                Some(interval) => {
                    let idle = self.last_safepoint.elapsed();
                    if idle < interval {
                        self.shared.queue_cv.wait_for(&mut queue, interval - idle);
                    } else if self.shared.sync.is_cleanup_needed() {
                        return Next::Maintenance;
                    } else {
                        self.shared.queue_cv.wait_for(&mut queue, interval);
                    }
                }
            }
        }
    }

    fn execute(&mut self, first: QueuedOperation) {
        log::debug!(
            "Dequeued {} from {} after {:?}",
            first.op.name(),
            first
                .requester
                .map_or_else(|| "detached caller".to_string(), |id| format!("thread {}", id)),
            VmTimer::since(first.submitted_at).elapsed()
        );

        if let Some(err) = self.shared.fatal.latched() {
            first.complete(Err(err));
            return;
        }

        if first.op.evaluate_at_safepoint() {
            self.safepoint(Some(first));
        } else {
            let result = evaluate(&self.shared, first.op.as_ref(), false, first.ticket);
            first.complete(result);
        }
    }

    fn maintenance(&mut self) {
        let idle_ms = self.last_safepoint.elapsed().as_millis() as u64;
        self.shared.stats.record_forced_safepoint();
        self.shared
            .logger
            .log(VmEvent::ForcedSafepoint { idle_ms });
        self.safepoint(None);
    }

    /// One safepoint episode covering `first` and every coalesced operation
    fn safepoint(&mut self, first: Option<QueuedOperation>) {
        let shared = &self.shared;
        let name = first
            .as_ref()
            .map_or_else(|| MaintenanceOperation.name().to_string(), |q| q.op.name().to_string());

        let sync = match shared
            .safepoint
            .begin(&shared.threads, shared.config.safepoint_timeout())
        {
            Ok(sync) => sync,
            Err(err) => {
                let err = shared.fatal.handle(err);
                shared.safepoint.end();
                self.last_safepoint = Instant::now();

                let mut failed: Vec<_> = first.into_iter().collect();
                failed.extend(shared.queue.lock().drain_safepoint());
                for op in failed {
                    op.complete(Err(err.clone()));
                }
                return;
            }
        };

        shared.logger.log(VmEvent::SafepointBegin {
            safepoint_id: sync.safepoint_id,
            operation: name,
            threads: sync.threads,
            sync_us: sync.time_to_safepoint.as_micros() as u64,
        });

        let pause = VmTimer::new();
        let mut batch: Vec<(QueuedOperation, Result<()>)> = Vec::new();

        if let Some(first) = first {
            let result = evaluate(shared, first.op.as_ref(), true, first.ticket);
            batch.push((first, result));
        }

        loop {
            let coalesced = shared.queue.lock().drain_safepoint();
            if coalesced.is_empty() {
                break;
            }
            for op in coalesced {
                let result = evaluate(shared, op.op.as_ref(), true, op.ticket);
                batch.push((op, result));
            }
        }

        let cleanup = cleanup(shared);

        shared.safepoint.end();
        self.last_safepoint = Instant::now();

        let pause = pause.elapsed();
        shared
            .stats
            .record_safepoint(sync.time_to_safepoint, pause, batch.len());
        shared.logger.log(VmEvent::SafepointEnd {
            safepoint_id: sync.safepoint_id,
            operations: batch.len(),
            pause_us: pause.as_micros() as u64,
        });

        let cleanup_failure = cleanup.err().map(|err| shared.fatal.handle(err));
        for (op, result) in batch {
            let result = match (&cleanup_failure, result) {
                (Some(err), Ok(())) => Err(err.clone()),
                (_, result) => result,
            };
            op.complete(result);
        }
    }
}

/// Safepoint cleanup tasks
fn cleanup(shared: &RuntimeShared) -> Result<()> {
    if shared.sync.registry().in_use_count() == 0 {
        return Ok(());
    }
    let threads = shared.threads.snapshot();
    shared.sync.deflate_idle_monitors(&threads).map(|_| ())
}

/// Evaluate one operation with the current-operation record set
fn evaluate(shared: &RuntimeShared, op: &dyn VmOperation, at_safepoint: bool, ticket: u64) -> Result<()> {
    let previous = shared.current_operation.lock().replace(CurrentOperation {
        name: op.name().to_string(),
        allow_nested: op.allow_nested(),
        at_safepoint,
    });

    let ctx = OperationContext::new(shared, op, at_safepoint);
    let result = op.evaluate(&ctx);

    *shared.current_operation.lock() = previous;

    shared.stats.record_operation();
    shared.logger.log(VmEvent::OperationExecuted {
        operation: op.name().to_string(),
        at_safepoint,
        ticket,
    });

    result.map_err(|err| match err {
        FvmError::FatalProtocolViolation(_) => err,
        err if err.is_fatal() => shared.fatal.handle(err),
        err => err,
    })
}

/// Run `op` inline from inside the operation currently executing
pub(crate) fn run_nested(shared: &RuntimeShared, op: Arc<dyn VmOperation>) -> Result<()> {
    let outer = shared.current_operation.lock().clone();

    let Some(outer) = outer else {
        return Err(FvmError::InvalidState {
            expected: "an executing operation".to_string(),
            actual: "coordinator idle".to_string(),
        });
    };

    if !outer.allow_nested {
        return Err(shared.fatal.handle(FvmError::NestedOperation {
            outer: outer.name,
            inner: op.name().to_string(),
        }));
    }

    if !op.evaluate_at_safepoint() || outer.at_safepoint {
        return evaluate(shared, op.as_ref(), outer.at_safepoint, 0);
    }

    let sync = shared
        .safepoint
        .begin(&shared.threads, shared.config.safepoint_timeout())
        .map_err(|err| {
            let err = shared.fatal.handle(err);
            shared.safepoint.end();
            err
        })?;
    let pause = VmTimer::new();
    let result = evaluate(shared, op.as_ref(), true, 0);
    shared.safepoint.end();
    shared
        .stats
        .record_safepoint(sync.time_to_safepoint, pause.elapsed(), 1);
    result
}
