//! VM Operation Queue
//!
//! Two FIFO queues, one per priority. Safepoint operations are preferred,
//! but after `fairness_ratio` consecutive safepoint dequeues a waiting
//! ordinary operation goes first, so neither class starves.

use super::operation::{OperationKind, TicketBox, VmOperation};
use crate::error::Result;
use crate::thread::ThreadId;
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Instant;

/// One submitted operation
pub(crate) struct QueuedOperation {
    pub(crate) op: Arc<dyn VmOperation>,
    pub(crate) kind: OperationKind,
    pub(crate) requester: Option<ThreadId>,
    pub(crate) submitted_at: Instant,
    pub(crate) ticket: u64,
    pub(crate) tickets: Arc<TicketBox>,
}

impl QueuedOperation {
    pub(crate) fn new(
        op: Arc<dyn VmOperation>,
        requester: Option<ThreadId>,
        tickets: Arc<TicketBox>,
    ) -> Self {
        let kind = OperationKind::of(op.as_ref());
        let ticket = tickets.issue();
        Self {
            op,
            kind,
            requester,
            submitted_at: Instant::now(),
            ticket,
            tickets,
        }
    }

    /// Signal the requester
    pub(crate) fn complete(self, result: Result<()>) {
        self.tickets.complete(self.ticket, result);
    }
}

/// OperationQueue - pending operations by priority
pub(crate) struct OperationQueue {
    safepoint: VecDeque<QueuedOperation>,
    ordinary: VecDeque<QueuedOperation>,
    fairness_ratio: u32,
    safepoint_streak: u32,
}

impl OperationQueue {
    pub(crate) fn new(fairness_ratio: u32) -> Self {
        Self {
            safepoint: VecDeque::new(),
            ordinary: VecDeque::new(),
            fairness_ratio: fairness_ratio.max(1),
            safepoint_streak: 0,
        }
    }

    pub(crate) fn push(&mut self, op: QueuedOperation) {
        match op.kind {
            OperationKind::Safepoint => self.safepoint.push_back(op),
            OperationKind::Ordinary => self.ordinary.push_back(op),
        }
    }

    /// Next operation, biased towards safepoint operations
    pub(crate) fn pop(&mut self) -> Option<QueuedOperation> {
        if self.safepoint_streak >= self.fairness_ratio {
            if let Some(op) = self.ordinary.pop_front() {
                self.safepoint_streak = 0;
                return Some(op);
            }
        }

        if let Some(op) = self.safepoint.pop_front() {
            self.safepoint_streak += 1;
            return Some(op);
        }

        self.safepoint_streak = 0;
        self.ordinary.pop_front()
    }

    /// Remove every queued safepoint operation, for coalescing
    pub(crate) fn drain_safepoint(&mut self) -> Vec<QueuedOperation> {
        self.safepoint.drain(..).collect()
    }

    /// Remove everything
    pub(crate) fn drain_all(&mut self) -> Vec<QueuedOperation> {
        let mut all: Vec<_> = self.safepoint.drain(..).collect();
        all.extend(self.ordinary.drain(..));
        all
    }

    pub(crate) fn len(&self) -> usize {
        self.safepoint.len() + self.ordinary.len()
    }
}
