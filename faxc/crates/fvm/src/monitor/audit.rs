//! Monitor Audit - structural verification of every monitor list
//!
//! Walks the global and per-thread lists and checks:
//! - recorded counts match walked lengths
//! - free monitors are unbound and idle; in-use monitors are bound and their
//!   object's lock word points back at them
//! - no monitor appears twice, no list cycles, no block link slot is listed
//! - conservation: everything walked adds up to the population
//!
//! The walk is unsynchronized: run it at a safepoint or with no attached
//! mutators.

use super::list::MonitorList;
use super::{MonitorRegistry, ObjectMonitor};
use crate::error::{FvmError, Result};
use crate::object::LockWord;
use crate::thread::MutatorThread;
use serde::Serialize;
use std::collections::HashSet;
use std::sync::Arc;

/// Recorded vs. walked length of one list class
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ListAudit {
    pub recorded: usize,
    pub walked: usize,
}

impl ListAudit {
    fn add(&mut self, other: ListAudit) {
        self.recorded += other.recorded;
        self.walked += other.walked;
    }
}

/// Result of `MonitorRegistry::audit`
#[derive(Debug, Clone, Default, Serialize)]
pub struct AuditReport {
    pub population: usize,
    pub global_free: ListAudit,
    pub global_in_use: ListAudit,
    pub thread_free: ListAudit,
    pub thread_in_use: ListAudit,
    pub errors: Vec<String>,
}

impl AuditReport {
    pub fn is_ok(&self) -> bool {
        self.errors.is_empty()
    }

    /// Monitors found on any list
    pub fn total_walked(&self) -> usize {
        self.global_free.walked
            + self.global_in_use.walked
            + self.thread_free.walked
            + self.thread_in_use.walked
    }

    /// `Err(InvariantViolation)` listing every problem found
    pub fn into_result(self) -> Result<AuditReport> {
        if self.is_ok() {
            Ok(self)
        } else {
            Err(FvmError::InvariantViolation(format!(
                "monitor audit failed: {}",
                self.errors.join("; ")
            )))
        }
    }
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum ListKind {
    Free,
    InUse,
}

struct Walker<'r> {
    registry: &'r MonitorRegistry,
    seen: HashSet<usize>,
    limit: usize,
    errors: Vec<String>,
}

impl Walker<'_> {
    fn walk(&mut self, name: &str, list: &MonitorList, kind: ListKind) -> ListAudit {
        let mut audit = ListAudit {
            recorded: list.count(),
            walked: 0,
        };

        for node in list.iter() {
            if audit.walked > self.limit {
                self.errors.push(format!("{}: list longer than population (cycle?)", name));
                break;
            }
            audit.walked += 1;
            let monitor = self.registry.resolve(node);
            self.check(name, monitor, kind);
        }

        if audit.recorded != audit.walked {
            self.errors.push(format!(
                "{}: count {} but {} monitors linked",
                name, audit.recorded, audit.walked
            ));
        }
        audit
    }

    fn check(&mut self, name: &str, monitor: &ObjectMonitor, kind: ListKind) {
        let address = crate::util::format_address(monitor.address());

        if !self.seen.insert(monitor.address()) {
            self.errors.push(format!("{}: monitor {} listed twice", name, address));
        }
        if monitor.is_block_link() {
            self.errors.push(format!("{}: block link slot {} listed", name, address));
        }
        if monitor.is_link_locked() {
            self.errors.push(format!("{}: monitor {} left locked", name, address));
        }

        match kind {
            ListKind::Free => {
                if monitor.is_bound() {
                    self.errors.push(format!("{}: free monitor {} still bound", name, address));
                }
                if monitor.is_busy() {
                    self.errors.push(format!("{}: free monitor {} busy", name, address));
                }
            }
            ListKind::InUse => match monitor.bound_object() {
                None => self
                    .errors
                    .push(format!("{}: in-use monitor {} unbound", name, address)),
                Some(object) if object.lock_word() != LockWord::inflated(monitor) => {
                    self.errors.push(format!(
                        "{}: object of monitor {} has lock word {:?}",
                        name,
                        address,
                        object.lock_word()
                    ))
                }
                Some(_) => {}
            },
        }
    }
}

impl MonitorRegistry {
    /// Verify every list against the registry's invariants
    pub fn audit(&self, threads: &[Arc<MutatorThread>]) -> AuditReport {
        let population = self.population();
        let mut walker = Walker {
            registry: self,
            seen: HashSet::with_capacity(population),
            limit: population,
            errors: Vec::new(),
        };

        let mut report = AuditReport {
            population,
            global_free: walker.walk("global free", &self.global_free, ListKind::Free),
            global_in_use: walker.walk("global in-use", &self.global_in_use, ListKind::InUse),
            ..Default::default()
        };

        for thread in threads {
            let cache = thread.monitors();
            let free = walker.walk(
                &format!("thread {} free", thread.id()),
                cache.free_list(),
                ListKind::Free,
            );
            let in_use = walker.walk(
                &format!("thread {} in-use", thread.id()),
                cache.in_use_list(),
                ListKind::InUse,
            );
            report.thread_free.add(free);
            report.thread_in_use.add(in_use);
        }

        let walked = report.total_walked();
        if walked != population {
            walker.errors.push(format!(
                "conservation: {} monitors on lists, population {}",
                walked, population
            ));
        }

        report.errors = walker.errors;
        report
    }
}
