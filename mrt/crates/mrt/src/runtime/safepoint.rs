//! Safepoint Management
//!
//! A safepoint stops every attached mutator so the collector can see a
//! consistent heap. A mutator counts as stopped when it is either:
//! - parked at a yieldpoint, or
//! - inside a safe region (blocking native call, waiting on the GC)
//!
//! ## Safepoint States
//!
//! ```text
//! SAFEPOINT_NONE (0) ─────┐
//!     │                   │
//!     ▼                   │
//! SAFEPOINT_REQUESTED (1) │   polling page armed
//!     │                   │
//!     ▼                   │
//! SAFEPOINT_REACHED (2) ──┘ (after release)
//! ```
//!
//! ## Polling Page
//!
//! Yieldpoints emitted by the code generator read the first word of a
//! dedicated page. The word is non-zero while a pause is requested; the
//! fast path is a single load.
//!
//! ## Handshake
//!
//! Every mutator state change that can race with a request (leaving a safe
//! region, parking, resuming) happens under the safepoint mutex, and the
//! collector re-counts running threads under the same mutex. A thread is
//! therefore never counted safe while it is already back in managed code.

use crate::error::{MrtError, Result};
use crate::roots::{MutatorState, ThreadList, ThreadRecord};
use crate::util::{current_thread_id, set_in_saferegion};
use memmap2::MmapMut;
use parking_lot::{Condvar, Mutex};
use std::sync::atomic::{AtomicU64, AtomicU8, AtomicUsize, Ordering};
use std::time::{Duration, Instant};

/// Safepoint state constants
pub const SAFEPOINT_NONE: u8 = 0;
pub const SAFEPOINT_REQUESTED: u8 = 1;
pub const SAFEPOINT_REACHED: u8 = 2;

/// Granularity of the collector's re-check while waiting
const WAIT_SLICE: Duration = Duration::from_millis(2);

/// Page read by every yieldpoint
struct PollingPage {
    map: MmapMut,
}

impl PollingPage {
    fn new() -> Result<Self> {
        let map = MmapMut::map_anon(page_size::get())
            .map_err(|e| MrtError::HeapInitialization(format!("polling page: {}", e)))?;
        Ok(Self { map })
    }

    fn address(&self) -> usize {
        self.map.as_ptr() as usize
    }

    #[inline]
    fn word(&self) -> &AtomicUsize {
        // SAFETY: the page is page-aligned, at least one word long and lives
        // as long as `self`; it is only accessed atomically.
        unsafe { AtomicUsize::from_ptr(self.map.as_ptr() as *mut usize) }
    }
}

/// Safepoint - coordination point between the collector and mutators
///
/// # Thread Safety
///
/// The fast path ([`Safepoint::poll`]) is one atomic load. Everything that
/// changes whether a thread is safe goes through the internal mutex.
///
/// # Examples
///
/// ```rust
/// use mrt::runtime::safepoint::{Safepoint, SAFEPOINT_NONE};
///
/// let safepoint = Safepoint::new().unwrap();
/// assert!(!safepoint.poll());
/// assert_eq!(safepoint.get_state(), SAFEPOINT_NONE);
/// assert_ne!(safepoint.polling_page(), 0);
/// ```
pub struct Safepoint {
    /// Current safepoint state
    state: AtomicU8,

    /// Page read at yieldpoints
    page: PollingPage,

    /// Thread that requested the current pause
    requester: AtomicU64,

    /// Threads currently parked at a yieldpoint
    parked: AtomicUsize,

    lock: Mutex<()>,
    changed: Condvar,
}

impl Safepoint {
    /// Map the polling page
    ///
    /// # Returns
    /// `HeapInitialization` if the page cannot be mapped
    pub fn new() -> Result<Self> {
        Ok(Self {
            state: AtomicU8::new(SAFEPOINT_NONE),
            page: PollingPage::new()?,
            requester: AtomicU64::new(0),
            parked: AtomicUsize::new(0),
            lock: Mutex::new(()),
            changed: Condvar::new(),
        })
    }

    /// Address of the polling page
    pub fn polling_page(&self) -> usize {
        self.page.address()
    }

    /// Yieldpoint fast path
    ///
    /// # Returns
    /// `true` if a pause is requested and the caller must take the slow path
    #[inline]
    pub fn poll(&self) -> bool {
        self.page.word().load(Ordering::Acquire) != 0
    }

    /// Check if a pause is requested or in effect
    pub fn is_requested(&self) -> bool {
        self.state.load(Ordering::Acquire) != SAFEPOINT_NONE
    }

    /// Get current safepoint state
    pub fn get_state(&self) -> u8 {
        self.state.load(Ordering::Acquire)
    }

    /// Thread id of the current requester, 0 if none
    pub fn requester(&self) -> u64 {
        self.requester.load(Ordering::Acquire)
    }

    /// Threads parked at a yieldpoint
    pub fn threads_at_safepoint(&self) -> usize {
        self.parked.load(Ordering::Acquire)
    }

    // ========================================================================
    // Collector side
    // ========================================================================

    /// Request a pause on behalf of the calling thread
    ///
    /// Arms the polling page.
    pub fn request_safepoint(&self) {
        let _guard = self.lock.lock();
        self.requester.store(current_thread_id(), Ordering::Release);
        self.state.store(SAFEPOINT_REQUESTED, Ordering::SeqCst);
        self.page.word().store(1, Ordering::SeqCst);
    }

    /// Wait until every attached thread other than the requester is safe
    ///
    /// # Returns
    /// `Err(n)` with the number of threads still running if `timeout`
    /// expires first
    pub fn wait_for_safepoint(&self, threads: &ThreadList, timeout: Duration) -> std::result::Result<(), usize> {
        let deadline = Instant::now() + timeout;
        let me = self.requester();
        let mut guard = self.lock.lock();
        loop {
            let running = threads
                .snapshot()
                .iter()
                .filter(|t| t.tid() != me && !t.state().is_safe())
                .count();
            if running == 0 {
                self.state.store(SAFEPOINT_REACHED, Ordering::Release);
                return Ok(());
            }
            let now = Instant::now();
            if now >= deadline {
                return Err(running);
            }
            self.changed
                .wait_for(&mut guard, WAIT_SLICE.min(deadline - now));
        }
    }

    /// End the pause and wake every waiting mutator
    pub fn release_safepoint(&self) {
        let _guard = self.lock.lock();
        self.page.word().store(0, Ordering::SeqCst);
        self.state.store(SAFEPOINT_NONE, Ordering::SeqCst);
        self.requester.store(0, Ordering::Release);
        self.changed.notify_all();
    }

    // ========================================================================
    // Mutator side
    // ========================================================================

    /// The pause applies to the calling thread
    #[inline]
    fn must_wait(&self) -> bool {
        self.is_requested() && self.requester() != current_thread_id()
    }

    /// Park at a yieldpoint until the pause ends
    pub fn block_until_released(&self, record: &ThreadRecord) {
        let mut guard = self.lock.lock();
        if !self.must_wait() {
            return;
        }
        record.set_state(MutatorState::Parked);
        self.parked.fetch_add(1, Ordering::AcqRel);
        self.changed.notify_all();
        while self.must_wait() {
            self.changed.wait(&mut guard);
        }
        self.parked.fetch_sub(1, Ordering::AcqRel);
        record.set_state(MutatorState::Running);
    }

    /// Promise not to touch managed memory until [`Self::leave_saferegion`]
    pub fn enter_saferegion(&self, record: &ThreadRecord) {
        let _guard = self.lock.lock();
        record.set_state(MutatorState::Saferegion);
        set_in_saferegion(true);
        self.changed.notify_all();
    }

    /// Return to managed code, waiting out any pause in progress
    pub fn leave_saferegion(&self, record: &ThreadRecord) {
        let mut guard = self.lock.lock();
        while self.must_wait() {
            self.changed.wait(&mut guard);
        }
        record.set_state(MutatorState::Running);
        set_in_saferegion(false);
    }

    /// Mark a thread detached so a waiting collector stops counting it
    pub(crate) fn detach(&self, record: &ThreadRecord) {
        let _guard = self.lock.lock();
        record.set_state(MutatorState::Detached);
        set_in_saferegion(false);
        self.changed.notify_all();
    }
}
