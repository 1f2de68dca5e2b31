/*!
 * Policy Controller
 * Decides when the merge engine runs
 *
 * Four-case tagged dispatch, branched once per allocation or free:
 * disabled, allocation-frequency, memory-threshold (damped, self-adjusting
 * high-water mark), and the buffered mode where the fault handler queues
 * dirty page addresses for the next consultation to drain.
 */

use crate::config::{Config, MergeMode};
use crate::core::limits::{DIRTY_BUFFER_CAPACITY, THRESHOLD_COUNTDOWN};
use crate::core::types::{Address, Size};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};

/// Which allocation-path event is consulting the policy
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PolicyEvent {
    Alloc,
    Free,
}

/// What the caller should do now
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PolicyDecision {
    /// Nothing to do
    Stand,
    /// Walk the whole allocation index
    FullPass,
    /// Merge the regions named by the dirty-page buffer
    DrainBuffer,
}

pub struct PolicyController {
    mode: MergeMode,
    frequency: u64,
    alloc_counter: AtomicU64,
    /// Threshold-mode high-water mark, in pages; only ever raised
    threshold_pages: AtomicI64,
    /// Damping countdown between threshold evaluations
    countdown: AtomicI64,
    /// Page addresses queued by the fault handler in buffered mode.
    /// Pre-sized so handler pushes never reallocate.
    buffer: Mutex<Vec<Address>>,
    capacity: usize,
}

impl PolicyController {
    pub fn new(config: &Config, page_size: Size) -> Self {
        Self {
            mode: config.merge_mode,
            frequency: config.merge_frequency,
            alloc_counter: AtomicU64::new(0),
            threshold_pages: AtomicI64::new(config.threshold_pages(page_size)),
            countdown: AtomicI64::new(THRESHOLD_COUNTDOWN),
            buffer: Mutex::new(Vec::with_capacity(DIRTY_BUFFER_CAPACITY)),
            capacity: DIRTY_BUFFER_CAPACITY,
        }
    }

    pub fn mode(&self) -> MergeMode {
        self.mode
    }

    /// Current threshold in pages (hint read, threshold mode only)
    pub fn threshold(&self) -> i64 {
        self.threshold_pages.load(Ordering::SeqCst)
    }

    /// Consult the policy. `resident_pages` is the node's private + shared
    /// page count, read as a hint outside the node mutex.
    pub fn decide(&self, event: PolicyEvent, resident_pages: i64) -> PolicyDecision {
        match self.mode {
            MergeMode::Disabled => PolicyDecision::Stand,
            MergeMode::AllocFrequency => {
                if event != PolicyEvent::Alloc {
                    return PolicyDecision::Stand;
                }
                let count = self.alloc_counter.fetch_add(1, Ordering::SeqCst) + 1;
                if count % self.frequency == 0 {
                    PolicyDecision::FullPass
                } else {
                    PolicyDecision::Stand
                }
            }
            MergeMode::MemoryThreshold => {
                if self.countdown.fetch_sub(1, Ordering::SeqCst) - 1 > 0 {
                    return PolicyDecision::Stand;
                }
                self.countdown.store(THRESHOLD_COUNTDOWN, Ordering::SeqCst);
                let threshold = self.threshold_pages.load(Ordering::SeqCst);
                if resident_pages >= threshold {
                    // ratchet to the observed level; the footprint is
                    // bounded by the highest level ever reached
                    self.threshold_pages.store(resident_pages, Ordering::SeqCst);
                    PolicyDecision::FullPass
                } else {
                    PolicyDecision::Stand
                }
            }
            MergeMode::DirtyBuffer => {
                if self.buffer.lock().len() >= self.capacity {
                    PolicyDecision::DrainBuffer
                } else {
                    PolicyDecision::Stand
                }
            }
        }
    }

    /// Called from the fault handler in buffered mode. Never blocks and
    /// never allocates; a contended or full buffer just drops the hint.
    pub fn note_fault(&self, page: Address) {
        if self.mode != MergeMode::DirtyBuffer {
            return;
        }
        if let Some(mut buffer) = self.buffer.try_lock() {
            if buffer.len() < self.capacity {
                buffer.push(page);
            }
        }
    }

    /// Take the queued dirty pages, leaving the buffer's capacity in place
    pub fn take_buffer(&self) -> Vec<Address> {
        self.buffer.lock().drain(..).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn config(mode: MergeMode) -> Config {
        Config {
            merge_mode: mode,
            merge_frequency: 4,
            memory_threshold_mb: 10,
            ..Config::default()
        }
    }

    #[test]
    fn test_disabled_never_merges() {
        let policy = PolicyController::new(&config(MergeMode::Disabled), 4096);
        for _ in 0..500 {
            assert_eq!(
                policy.decide(PolicyEvent::Alloc, i64::MAX / 2),
                PolicyDecision::Stand
            );
        }
    }

    #[test]
    fn test_frequency_fires_every_nth_alloc() {
        let policy = PolicyController::new(&config(MergeMode::AllocFrequency), 4096);
        let mut passes = 0;
        for _ in 0..12 {
            if policy.decide(PolicyEvent::Alloc, 0) == PolicyDecision::FullPass {
                passes += 1;
            }
        }
        assert_eq!(passes, 3);
        // frees do not advance the allocation counter
        assert_eq!(policy.decide(PolicyEvent::Free, 0), PolicyDecision::Stand);
    }

    #[test]
    fn test_threshold_damps_and_ratchets() {
        let policy = PolicyController::new(&config(MergeMode::MemoryThreshold), 4096);
        let threshold = policy.threshold();
        assert_eq!(threshold, 10 * (1_000_000 / 4096));

        // below the countdown, nothing happens no matter the load
        for _ in 0..THRESHOLD_COUNTDOWN - 1 {
            assert_eq!(
                policy.decide(PolicyEvent::Alloc, threshold * 2),
                PolicyDecision::Stand
            );
        }
        // the damped evaluation fires and ratchets the threshold up
        assert_eq!(
            policy.decide(PolicyEvent::Alloc, threshold * 2),
            PolicyDecision::FullPass
        );
        assert_eq!(policy.threshold(), threshold * 2);

        // anything below the new mark no longer qualifies
        for _ in 0..THRESHOLD_COUNTDOWN - 1 {
            policy.decide(PolicyEvent::Free, 0);
        }
        assert_eq!(
            policy.decide(PolicyEvent::Free, threshold * 2 - 1),
            PolicyDecision::Stand
        );
    }

    #[test]
    fn test_threshold_monotone_under_shrinking_load() {
        let policy = PolicyController::new(&config(MergeMode::MemoryThreshold), 4096);
        let initial = policy.threshold();
        for _ in 0..THRESHOLD_COUNTDOWN {
            policy.decide(PolicyEvent::Alloc, 1);
        }
        assert_eq!(policy.threshold(), initial);
    }

    #[test]
    fn test_buffer_drains_only_when_full() {
        let policy = PolicyController::new(&config(MergeMode::DirtyBuffer), 4096);
        policy.note_fault(0x1000);
        assert_eq!(policy.decide(PolicyEvent::Alloc, 0), PolicyDecision::Stand);

        for page in 0..DIRTY_BUFFER_CAPACITY {
            policy.note_fault(page * 4096);
        }
        assert_eq!(
            policy.decide(PolicyEvent::Alloc, 0),
            PolicyDecision::DrainBuffer
        );
        let drained = policy.take_buffer();
        assert_eq!(drained.len(), DIRTY_BUFFER_CAPACITY);
        assert_eq!(policy.decide(PolicyEvent::Alloc, 0), PolicyDecision::Stand);
    }

    #[test]
    fn test_note_fault_ignored_outside_buffered_mode() {
        let policy = PolicyController::new(&config(MergeMode::AllocFrequency), 4096);
        policy.note_fault(0x1000);
        assert!(policy.take_buffer().is_empty());
    }
}
