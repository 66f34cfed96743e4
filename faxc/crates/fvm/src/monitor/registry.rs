//! Monitor Registry - allocation and recycling of heavyweight monitors
//!
//! Pools:
//! - global free list / global in-use list
//! - per-thread free list / in-use list (`ThreadMonitorCache`)
//!
//! Allocation order: thread free list, then a batch moved from the global
//! free list, then a freshly carved block. Batches start at
//! `monitor_initial_provision` and grow by `1 + batch / 2` per refill up to
//! `monitor_max_provision`.
//!
//! Conservation: `population == Σ free counts + Σ in-use counts` whenever the
//! lists are quiescent. The population only grows.

use super::list::{MonitorChain, MonitorList};
use super::ObjectMonitor;
use crate::config::VmConfig;
use crate::error::{FvmError, Result};
use crate::object::LockWord;
use crate::thread::MutatorThread;
use std::ptr::{self, NonNull};
use std::sync::atomic::{AtomicPtr, AtomicUsize, Ordering};
use std::sync::Arc;

/// Per-thread monitor pools
pub struct ThreadMonitorCache {
    free: MonitorList,
    in_use: MonitorList,
    provision: AtomicUsize,
}

impl ThreadMonitorCache {
    pub fn new(initial_provision: usize) -> Self {
        Self {
            free: MonitorList::new(),
            in_use: MonitorList::new(),
            provision: AtomicUsize::new(initial_provision.max(1)),
        }
    }

    pub fn free_count(&self) -> usize {
        self.free.count()
    }

    pub fn in_use_count(&self) -> usize {
        self.in_use.count()
    }

    /// Size of the next batch pulled from the global free list
    pub fn provision(&self) -> usize {
        self.provision.load(Ordering::Relaxed)
    }

    pub(crate) fn free_list(&self) -> &MonitorList {
        &self.free
    }

    pub(crate) fn in_use_list(&self) -> &MonitorList {
        &self.in_use
    }
}

impl std::fmt::Debug for ThreadMonitorCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ThreadMonitorCache")
            .field("free", &self.free_count())
            .field("in_use", &self.in_use_count())
            .field("provision", &self.provision())
            .finish()
    }
}

/// Counts from one deflation pass
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DeflationReport {
    pub scanned: usize,
    pub deflated: usize,
}

/// MonitorRegistry - owner of every monitor block
pub struct MonitorRegistry {
    pub(super) global_free: MonitorList,
    pub(super) global_in_use: MonitorList,
    /// Slot 0 of the newest block; older blocks chain through slot 0's link
    pub(super) blocks: AtomicPtr<ObjectMonitor>,
    pub(super) block_count: AtomicUsize,
    pub(super) population: AtomicUsize,
    in_use_total: AtomicUsize,
    pub(super) block_size: usize,
    max_provision: usize,
}

impl MonitorRegistry {
    pub fn new(config: &VmConfig) -> Self {
        Self {
            global_free: MonitorList::new(),
            global_in_use: MonitorList::new(),
            blocks: AtomicPtr::new(ptr::null_mut()),
            block_count: AtomicUsize::new(0),
            population: AtomicUsize::new(0),
            in_use_total: AtomicUsize::new(0),
            block_size: config.monitor_block_size.max(2),
            max_provision: config.monitor_max_provision.max(1),
        }
    }

    /// Reborrow a node with the registry's lifetime
    #[inline]
    pub(super) fn resolve(&self, monitor: NonNull<ObjectMonitor>) -> &ObjectMonitor {
        // SAFETY: every list node lives in one of our blocks, which are only
        // freed when the registry is dropped.
        unsafe { monitor.as_ref() }
    }

    // ========================================================================
    // ALLOCATION
    // ========================================================================

    /// Take a free monitor for the thread owning `cache`
    ///
    /// Fails only with `ResourceExhausted`.
    pub fn allocate(&self, cache: &ThreadMonitorCache) -> Result<&ObjectMonitor> {
        loop {
            if let Some(monitor) = cache.free.take_from_start() {
                return Ok(self.resolve(monitor));
            }
            if self.refill(cache) > 0 {
                continue;
            }
            self.carve_block()?;
        }
    }

    /// Move one batch from the global free list into `cache`
    fn refill(&self, cache: &ThreadMonitorCache) -> usize {
        let batch = cache.provision();
        let mut chain = MonitorChain::new();

        while chain.len() < batch {
            match self.global_free.take_from_start() {
                Some(monitor) => chain.push(self.resolve(monitor)),
                None => break,
            }
        }

        let moved = chain.len();
        if moved > 0 {
            cache.free.prepend_chain(chain);
            let next = (batch + 1 + batch / 2).min(self.max_provision);
            cache.provision.store(next, Ordering::Relaxed);
            crate::trace_sync!("moved {} monitors to a thread free list", moved);
        }
        moved
    }

    /// Allocate a block from the system allocator and free all its monitors
    fn carve_block(&self) -> Result<()> {
        let mut slots: Vec<ObjectMonitor> = Vec::new();
        slots
            .try_reserve_exact(self.block_size)
            .map_err(|_| FvmError::ResourceExhausted {
                resource: format!("monitor block of {} slots", self.block_size),
            })?;
        slots.push(ObjectMonitor::new_block_link());
        slots.extend((1..self.block_size).map(|_| ObjectMonitor::new()));

        let base = Box::into_raw(slots.into_boxed_slice()) as *mut ObjectMonitor;
        // SAFETY: `base` points at `block_size` initialized monitors leaked above.
        let block = unsafe { std::slice::from_raw_parts(base as *const ObjectMonitor, self.block_size) };

        let mut chain = MonitorChain::new();
        for monitor in block[1..].iter().rev() {
            chain.push(monitor);
        }

        let link = &block[0];
        let mut head = self.blocks.load(Ordering::Acquire);
        loop {
            link.link_to(head);
            match self
                .blocks
                .compare_exchange(head, base, Ordering::AcqRel, Ordering::Acquire)
            {
                Ok(_) => break,
                Err(current) => head = current,
            }
        }

        self.block_count.fetch_add(1, Ordering::Relaxed);
        self.population
            .fetch_add(self.block_size - 1, Ordering::AcqRel);
        self.global_free.prepend_chain(chain);

        log::debug!(
            "Carved monitor block {} ({} monitors, population {})",
            crate::util::format_address(base as usize),
            self.block_size - 1,
            self.population()
        );
        Ok(())
    }

    /// Return an unused monitor to the thread's free list
    ///
    /// The monitor must be idle and unbound.
    pub fn release(&self, cache: &ThreadMonitorCache, monitor: &ObjectMonitor) -> Result<()> {
        let problem = if monitor.is_block_link() {
            Some("block link slot")
        } else if monitor.is_bound() {
            Some("bound")
        } else if monitor.is_busy() {
            Some("busy")
        } else {
            None
        };

        if let Some(problem) = problem {
            return Err(FvmError::InvariantViolation(format!(
                "release of {} monitor {}",
                problem,
                crate::util::format_address(monitor.address())
            )));
        }

        monitor.reset();
        cache.free.prepend(monitor);
        Ok(())
    }

    /// Record a freshly bound monitor on the thread's in-use list
    pub(crate) fn register_in_use(&self, cache: &ThreadMonitorCache, monitor: &ObjectMonitor) {
        self.in_use_total.fetch_add(1, Ordering::AcqRel);
        cache.in_use.prepend(monitor);
    }

    /// Move a detaching thread's pools to the global lists
    pub fn flush(&self, cache: &ThreadMonitorCache) {
        let free = cache.free.take_all();
        let in_use = cache.in_use.take_all();
        log::debug!(
            "Flushing thread monitors: {} free, {} in use",
            free.len(),
            in_use.len()
        );
        self.global_free.prepend_chain(free);
        self.global_in_use.prepend_chain(in_use);
    }

    // ========================================================================
    // DEFLATION
    // ========================================================================

    /// Scan every in-use list and free the monitors `deflate` accepts
    ///
    /// `deflate` unbinds a monitor and returns `Ok(true)`, or leaves it alone
    /// with `Ok(false)`. After the first error no further monitor is offered,
    /// but the lists are still restored before the error is returned.
    /// Caller must hold a safepoint.
    pub(crate) fn deflate_idle<F>(
        &self,
        threads: &[Arc<MutatorThread>],
        mut deflate: F,
    ) -> Result<DeflationReport>
    where
        F: FnMut(&ObjectMonitor) -> Result<bool>,
    {
        let mut report = DeflationReport::default();
        let mut freed = MonitorChain::new();
        let mut failure = None;

        let lists = std::iter::once(&self.global_in_use)
            .chain(threads.iter().map(|t| t.monitors().in_use_list()));

        for list in lists {
            let mut keep = MonitorChain::new();
            for node in list.take_all().into_nodes() {
                let monitor = self.resolve(node);
                report.scanned += 1;

                let deflated = if failure.is_some() {
                    false
                } else {
                    match deflate(monitor) {
                        Ok(deflated) => deflated,
                        Err(err) => {
                            failure = Some(err);
                            false
                        }
                    }
                };

                if deflated {
                    freed.push(monitor);
                } else {
                    keep.push(monitor);
                }
            }
            list.prepend_chain(keep);
        }

        report.deflated = freed.len();
        self.in_use_total
            .fetch_sub(report.deflated, Ordering::AcqRel);
        self.global_free.prepend_chain(freed);

        match failure {
            Some(err) => Err(err),
            None => Ok(report),
        }
    }

    /// Whether the in-use share of the population exceeds `threshold_pct`
    pub fn is_cleanup_needed(&self, threshold_pct: u8) -> bool {
        if threshold_pct == 0 {
            return false;
        }
        let population = self.population();
        population > 0 && self.in_use_count() * 100 / population > threshold_pct as usize
    }

    // ========================================================================
    // COUNTS
    // ========================================================================

    /// Total monitors ever carved, excluding block link slots
    pub fn population(&self) -> usize {
        self.population.load(Ordering::Acquire)
    }

    /// Monitors currently bound to an object, on any list
    pub fn in_use_count(&self) -> usize {
        self.in_use_total.load(Ordering::Acquire)
    }

    pub fn global_free_count(&self) -> usize {
        self.global_free.count()
    }

    pub fn global_in_use_count(&self) -> usize {
        self.global_in_use.count()
    }

    pub fn block_count(&self) -> usize {
        self.block_count.load(Ordering::Relaxed)
    }
}

impl Drop for MonitorRegistry {
    fn drop(&mut self) {
        let mut base = *self.blocks.get_mut();
        while !base.is_null() {
            // SAFETY: `base` is slot 0 of a block leaked by `carve_block`.
            let block = unsafe { std::slice::from_raw_parts(base as *const ObjectMonitor, self.block_size) };

            for monitor in &block[1..] {
                if let Some(object) = monitor.bound_object() {
                    if object.lock_word() == LockWord::inflated(monitor) {
                        object.store_lock_word(monitor.header());
                    }
                }
                drop(monitor.unbind());
            }

            let next = block[0].next_ptr() as *mut ObjectMonitor;
            // SAFETY: reconstitutes exactly the boxed slice leaked in `carve_block`.
            drop(unsafe { Box::from_raw(ptr::slice_from_raw_parts_mut(base, self.block_size)) });
            base = next;
        }
    }
}

impl std::fmt::Debug for MonitorRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MonitorRegistry")
            .field("population", &self.population())
            .field("blocks", &self.block_count())
            .field("global_free", &self.global_free_count())
            .field("global_in_use", &self.global_in_use_count())
            .field("in_use", &self.in_use_count())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::object::ManagedObject;

    fn registry(block_size: usize) -> MonitorRegistry {
        MonitorRegistry::new(&VmConfig {
            monitor_block_size: block_size,
            ..Default::default()
        })
    }

    #[test]
    fn test_first_allocation_carves_block() {
        let registry = registry(16);
        let cache = ThreadMonitorCache::new(4);

        let m = registry.allocate(&cache).unwrap();
        assert!(!m.is_block_link());
        assert_eq!(registry.population(), 15);
        assert_eq!(registry.block_count(), 1);
        // 15 carved, 4 moved to the thread, 1 handed out
        assert_eq!(registry.global_free_count(), 11);
        assert_eq!(cache.free_count(), 3);
        assert_eq!(cache.provision(), 7);
    }

    #[test]
    fn test_release_rejects_bound_monitor() {
        let registry = registry(8);
        let cache = ThreadMonitorCache::new(2);
        let obj = ManagedObject::new_ref();

        let m = registry.allocate(&cache).unwrap();
        m.bind(&obj);
        assert!(matches!(
            registry.release(&cache, m),
            Err(FvmError::InvariantViolation(_))
        ));

        drop(m.unbind());
        registry.release(&cache, m).unwrap();
        assert_eq!(cache.free_count(), 2);
    }

    #[test]
    fn test_cleanup_threshold() {
        let registry = registry(3);
        let cache = ThreadMonitorCache::new(1);
        let obj = ManagedObject::new_ref();

        assert!(!registry.is_cleanup_needed(90));
        let m = registry.allocate(&cache).unwrap();
        m.bind(&obj);
        registry.register_in_use(&cache, m);

        // 1 of 2 in use
        assert!(registry.is_cleanup_needed(40));
        assert!(!registry.is_cleanup_needed(50));
        assert!(!registry.is_cleanup_needed(0));
    }

    #[test]
    fn test_drop_restores_bound_objects() {
        let obj = ManagedObject::new_ref();
        {
            let registry = registry(4);
            let cache = ThreadMonitorCache::new(1);
            let m = registry.allocate(&cache).unwrap();
            m.set_header(LockWord::neutral_with_hash(42));
            m.bind(&obj);
            obj.store_lock_word(LockWord::inflated(m));
            registry.register_in_use(&cache, m);
        }
        assert_eq!(obj.lock_word().hash(), 42);
        assert_eq!(std::sync::Arc::strong_count(&obj), 1);
    }
}
