/*!
 * Lifecycle
 * Library init, cohort join, teardown, and the process-global layer handle
 *
 * Init runs once per process: detect the page size and kernel map limit,
 * reserve the heap window, join the sibling cohort through the shared
 * arena, install the fault handlers, and register teardown with the
 * process-exit machinery. The enclosing parallel runtime calls
 * [`runtime_init`] after it has established ranks and [`runtime_finalize`]
 * before it exits; those two hooks are the only runtime dependency.
 */

use crate::config::{Config, MergeMode};
use crate::core::errors::{InitError, LayerError};
use crate::core::limits::HEAP_WINDOW_BYTES;
use crate::core::types::{Address, PageIndex, SiblingId, Size};
use crate::fault;
use crate::heap::HeapWindow;
use crate::index::RegionIndex;
use crate::policy::{PolicyController, PolicyDecision, PolicyEvent};
use crate::shared::{HolderWidth, NodeMutex, PageFlagSet, SharedArena, SharedCounters};
use crate::stats::{MemSnapshot, StatWriter};
use crate::sys;
use log::{info, warn};
use parking_lot::Mutex;
use serde::Serialize;
use std::backtrace::Backtrace;
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::{Arc, OnceLock};

static LAYER: OnceLock<Layer> = OnceLock::new();
static INIT_LOCK: Mutex<()> = Mutex::new(());
static TEARDOWN_DONE: AtomicBool = AtomicBool::new(false);

/// Observable state of one page of the heap window
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PageState {
    /// Allocated but never written
    Untouched,
    /// Privately backed, read-write
    Private,
    /// Backed by its frame of the shared file, read-only
    Shared,
    /// Mapped onto the canonical zero frame, read-only
    Zero,
}

/// The deduplication layer for this process
pub struct Layer {
    pub(crate) config: Config,
    pub(crate) page_size: Size,
    pub(crate) window: HeapWindow,
    pub(crate) index: Mutex<RegionIndex>,
    /// Has this process ever written the page since allocation?
    pub(crate) initialized: PageFlagSet,
    /// Is the page currently mapped onto the zero frame?
    pub(crate) zero: PageFlagSet,
    pub(crate) zero_count: AtomicI64,
    pub(crate) arena: SharedArena,
    pub(crate) mutex: NodeMutex,
    pub(crate) policy: PolicyController,
    pub(crate) stats: Mutex<StatWriter>,
    /// Set when the enclosing runtime's init hook fires
    pub(crate) runtime_attached: AtomicBool,
    pub(crate) finalized: AtomicBool,
}

/// Initialize the layer for this process and join the node cohort.
/// Idempotent: a second call returns the existing layer.
pub fn init(config: Config) -> Result<&'static Layer, LayerError> {
    let _init_guard = INIT_LOCK.lock();
    if let Some(layer) = LAYER.get() {
        warn!("layer already initialized, ignoring second init");
        return Ok(layer);
    }

    config.validate()?;
    let page_size = sys::page_size()?;
    sys::init_map_limit();

    let window = HeapWindow::reserve(page_size)?;
    let mutex = NodeMutex::open(&config.sem_name())?;

    let cores = std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(8);
    let width = HolderWidth::for_cores(cores);
    let arena = SharedArena::join(&config.shm_name(), width, page_size, &mutex)?;

    fault::install()?;

    let num_pages = HEAP_WINDOW_BYTES / page_size;
    let stats = if config.merge_mode == MergeMode::Disabled {
        StatWriter::disabled()
    } else {
        StatWriter::open(&config.stats_dir, arena.rank())
    };
    let policy = PolicyController::new(&config, page_size);

    let layer = Layer {
        page_size,
        window,
        index: Mutex::new(RegionIndex::new()),
        initialized: PageFlagSet::new(num_pages),
        zero: PageFlagSet::new(num_pages),
        zero_count: AtomicI64::new(0),
        arena,
        mutex,
        policy,
        stats: Mutex::new(stats),
        runtime_attached: AtomicBool::new(false),
        finalized: AtomicBool::new(false),
        config,
    };

    if LAYER.set(layer).is_err() {
        return Err(InitError::Config("layer initialized concurrently".into()).into());
    }
    unsafe {
        libc::atexit(teardown_at_exit);
    }

    let layer = LAYER.get().expect("layer was just installed");
    info!(
        "pagemerge initialized: sibling {} of cohort {}, page size {page_size}, window at {:#x}",
        layer.arena.rank(),
        layer.config.shm_name(),
        layer.window.base()
    );
    Ok(layer)
}

/// The installed layer, if init has completed
pub fn get() -> Option<&'static Layer> {
    LAYER.get()
}

/// Hook for the parallel runtime's initialization entry point. Until it
/// fires, the allocation surface refuses to operate unless standalone
/// mode (`NOT_MPI_APP`) was declared.
pub fn runtime_init() -> Result<&'static Layer, LayerError> {
    let layer = init(Config::from_env()?)?;
    layer.runtime_attached.store(true, Ordering::SeqCst);
    Ok(layer)
}

/// Hook for the parallel runtime's finalization entry point: flushes
/// statistics and stops handing out memory
pub fn runtime_finalize() {
    if let Some(layer) = LAYER.get() {
        layer.finalize();
    }
}

extern "C" fn teardown_at_exit() {
    if let Some(layer) = LAYER.get() {
        layer.teardown();
    }
}

impl Layer {
    pub fn page_size(&self) -> Size {
        self.page_size
    }

    pub fn rank(&self) -> SiblingId {
        self.arena.rank()
    }

    pub fn counters(&self) -> &SharedCounters {
        self.arena.counters()
    }

    /// This sibling's count of pages collapsed onto the zero frame
    pub fn zero_page_count(&self) -> i64 {
        self.zero_count.load(Ordering::SeqCst)
    }

    pub(crate) fn is_finalized(&self) -> bool {
        self.finalized.load(Ordering::SeqCst)
    }

    /// May the allocation surface operate? Requires the runtime's init
    /// hook to have fired, or standalone operation to have been declared.
    pub(crate) fn is_operational(&self) -> bool {
        self.config.standalone || self.runtime_attached.load(Ordering::SeqCst)
    }

    /// Does the allocation index own a region covering `addr`?
    pub fn owns(&self, addr: Address) -> bool {
        self.index.lock().find_containing(addr).is_some()
    }

    /// Call-stack snapshot captured when the region covering `addr` was
    /// allocated, when `ENABLE_BACKTRACE` was on
    pub fn region_provenance(&self, addr: Address) -> Option<Arc<Backtrace>> {
        self.index
            .lock()
            .find_containing(addr)
            .and_then(|region| region.provenance.clone())
    }

    /// Observable state of the page containing `addr`, None outside the
    /// heap window
    pub fn page_state(&self, addr: Address) -> Option<PageState> {
        if !self.window.contains(addr) {
            return None;
        }
        let page = self.window.page_index(addr);
        Some(self.page_state_by_index(page))
    }

    pub(crate) fn page_state_by_index(&self, page: PageIndex) -> PageState {
        if !self.initialized.test(page) {
            PageState::Untouched
        } else if self.zero.test(page) {
            PageState::Zero
        } else if self.arena.bitmap().holds(page, self.arena.rank()) {
            PageState::Shared
        } else {
            PageState::Private
        }
    }

    /// Consult the merge policy after an allocation-path event
    pub(crate) fn consult_policy(&self, event: PolicyEvent) {
        let counters = self.arena.counters();
        let resident = counters.private_pages().load(Ordering::SeqCst)
            + counters.shared_pages().load(Ordering::SeqCst);
        match self.policy.decide(event, resident) {
            PolicyDecision::Stand => {}
            PolicyDecision::FullPass => self.merge_pass(),
            PolicyDecision::DrainBuffer => self.drain_dirty_buffer(),
        }
    }

    /// The six-counter memory picture, as recorded in the statistics file
    pub fn snapshot(&self) -> MemSnapshot {
        let counters = self.arena.counters();
        let page_size = self.page_size as i64;
        let local_heap = self.config.local_heap_probe.map_or(0, |probe| probe()) as i64;
        let alive = counters.alive().load(Ordering::SeqCst);
        let private_pages = counters.private_pages().load(Ordering::SeqCst);
        let shared_pages = counters.shared_pages().load(Ordering::SeqCst);
        let unmerged_pages = counters.unmerged_pages().load(Ordering::SeqCst);
        let local_heap_total = local_heap * alive;

        MemSnapshot {
            private_total: local_heap_total + private_pages * page_size,
            local_heap_total,
            zero_total: self.zero_count.load(Ordering::SeqCst) * page_size,
            shared_total: shared_pages * page_size,
            unmerged_total: local_heap_total + unmerged_pages * page_size,
            merged_total: local_heap_total + (private_pages + shared_pages) * page_size,
        }
    }

    pub(crate) fn record_stats(&self) {
        if self.policy.mode() == MergeMode::Disabled {
            return;
        }
        let snapshot = self.snapshot();
        self.stats.lock().record(snapshot);
    }

    /// Flush statistics and stop handing out memory. Allocation calls made
    /// after this return null so callers fall through to the small-object
    /// allocator.
    pub fn finalize(&self) {
        self.finalized.store(true, Ordering::SeqCst);
        self.stats.lock().flush();
        info!("pagemerge finalized: sibling {}", self.arena.rank());
    }

    /// Detach from the cohort. The last sibling out removes the backing
    /// file and the semaphore. Registered with atexit; runs at most once.
    pub fn teardown(&self) {
        if TEARDOWN_DONE.swap(true, Ordering::SeqCst) {
            return;
        }
        self.finalized.store(true, Ordering::SeqCst);
        self.stats.lock().flush();

        // drop the allocation index before the window goes away
        *self.index.lock() = RegionIndex::new();

        let last_out = self.arena.detach(&self.mutex);
        self.mutex.close();
        if last_out {
            NodeMutex::unlink(&self.config.sem_name());
        }
        info!("pagemerge torn down (last out: {last_out})");
    }
}
