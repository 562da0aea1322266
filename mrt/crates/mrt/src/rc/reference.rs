//! Reference Processing - Soft, weak and phantom reference objects
//!
//! A reference object is an instance of a class built with
//! [`ClassBuilder::reference`](crate::object::ClassBuilder::reference). Its
//! referent word sits at [`REFERENT_OFFSET`] and holds a weak count on the
//! referent, so the referent's memory outlives its release until the
//! reference lets go.
//!
//! A processing pass walks every registered reference object:
//! - referent released (weak-collected) → clear the word, drop the weak
//!   count, set `REFERENT_CLEARED`
//! - then enqueue the reference, holding one strong count on it until the
//!   language side polls it
//!
//! Soft references behave like weak ones: a softly held object has no
//! strong holders left, so there is nothing to keep alive under pressure.
//! Passes run at the end of a collection in immediate mode, or on the
//! processor daemon when triggered.

use crate::object::header::{STATE_ENQUEUED, STATE_REFERENT_CLEARED};
use crate::object::{get_header, ref_slot, ObjRef, NULL, REFERENT_OFFSET};
use crate::runtime::Runtime;
use crossbeam::channel::{unbounded, Receiver, Sender};
use indexmap::IndexSet;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;

/// Commands for the processor daemon
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Command {
    Process,
    Stop { finalize: bool },
}

/// Result of one processing pass
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReferencePass {
    pub cleared: u64,
    pub enqueued: u64,
}

/// Registry and queue of reference objects
pub struct ReferenceProcessor {
    /// Live reference objects, in allocation order
    registered: Mutex<IndexSet<ObjRef>>,

    /// Cleared references waiting to be polled
    queue: Mutex<VecDeque<ObjRef>>,

    /// Process at the end of every collection
    immediate: AtomicBool,

    /// A pass is running
    working: AtomicBool,

    commands_tx: Sender<Command>,
    commands_rx: Receiver<Command>,
    daemon: Mutex<Option<JoinHandle<()>>>,

    cleared_total: AtomicU64,
    enqueued_total: AtomicU64,
}

impl ReferenceProcessor {
    pub fn new() -> Self {
        let (commands_tx, commands_rx) = unbounded();
        Self {
            registered: Mutex::new(IndexSet::new()),
            queue: Mutex::new(VecDeque::new()),
            immediate: AtomicBool::new(true),
            working: AtomicBool::new(false),
            commands_tx,
            commands_rx,
            daemon: Mutex::new(None),
            cleared_total: AtomicU64::new(0),
            enqueued_total: AtomicU64::new(0),
        }
    }

    /// Track a new reference object
    pub fn register(&self, reference: ObjRef) {
        self.registered.lock().insert(reference);
    }

    /// Stop tracking a reference object that is being released
    pub fn unregister(&self, reference: ObjRef) {
        self.registered.lock().swap_remove(&reference);
    }

    pub fn registered_count(&self) -> usize {
        self.registered.lock().len()
    }

    pub fn set_immediate(&self, immediate: bool) {
        self.immediate.store(immediate, Ordering::Relaxed);
    }

    pub fn is_immediate(&self) -> bool {
        self.immediate.load(Ordering::Relaxed)
    }

    pub fn is_working(&self) -> bool {
        self.working.load(Ordering::Acquire)
    }

    /// Run one processing pass
    ///
    /// The registry lock is held for the whole pass: a registered reference
    /// cannot be freed, because release unregisters before it frees.
    pub(crate) fn process(&self, rt: &Runtime) -> ReferencePass {
        self.working.store(true, Ordering::Release);
        let mut pass = ReferencePass::default();
        let registered = self.registered.lock();

        for &reference in registered.iter() {
            let header = unsafe { get_header(reference) };
            if header.is_released() {
                continue;
            }
            let slot = unsafe { ref_slot(reference, REFERENT_OFFSET) };
            let referent = slot.load(Ordering::Acquire);
            if referent == NULL || !unsafe { get_header(referent) }.is_released() {
                continue;
            }
            if slot
                .compare_exchange(referent, NULL, Ordering::AcqRel, Ordering::Acquire)
                .is_err()
            {
                continue;
            }
            header.set(STATE_REFERENT_CLEARED);
            rt.rc().weak_dec(referent);
            pass.cleared += 1;

            if header.set(STATE_ENQUEUED) & STATE_ENQUEUED == 0 {
                if rt.rc().inc_resurrect_weak(reference) {
                    self.queue.lock().push_back(reference);
                    pass.enqueued += 1;
                } else {
                    header.clear(STATE_ENQUEUED);
                }
            }
        }
        drop(registered);

        self.cleared_total.fetch_add(pass.cleared, Ordering::Relaxed);
        self.enqueued_total.fetch_add(pass.enqueued, Ordering::Relaxed);
        self.working.store(false, Ordering::Release);
        pass
    }

    /// Take the next cleared reference
    ///
    /// The caller receives the strong count the queue held.
    pub fn poll(&self) -> Option<ObjRef> {
        let reference = self.queue.lock().pop_front()?;
        unsafe { get_header(reference) }.clear(STATE_ENQUEUED);
        Some(reference)
    }

    /// References waiting to be polled
    pub fn queue_len(&self) -> usize {
        self.queue.lock().len()
    }

    /// Snapshot of the queued references; each holds a queue-owned count
    pub(crate) fn queued(&self) -> Vec<ObjRef> {
        self.queue.lock().iter().copied().collect()
    }

    pub fn cleared_total(&self) -> u64 {
        self.cleared_total.load(Ordering::Relaxed)
    }

    pub fn enqueued_total(&self) -> u64 {
        self.enqueued_total.load(Ordering::Relaxed)
    }

    // === Daemon ===

    /// Start the processor thread
    ///
    /// The thread attaches as a mutator and owns a handle on the runtime
    /// until it is stopped. It waits for commands inside a safe region.
    pub(crate) fn start_daemon(&self, rt: Arc<Runtime>) -> std::io::Result<()> {
        let mut daemon = self.daemon.lock();
        if daemon.is_some() {
            return Ok(());
        }
        let handle = std::thread::Builder::new()
            .name("mrt-reference-processor".to_string())
            .spawn(move || {
                let rt: &Runtime = &rt;
                let mutator = match rt.gc_init_thread_local(false) {
                    Ok(mutator) => mutator,
                    Err(e) => {
                        log::warn!("reference processor could not attach: {}", e);
                        return;
                    },
                };
                let commands = rt.references.commands_rx.clone();
                while let Ok(command) = mutator.saferegion(|| commands.recv()) {
                    match command {
                        Command::Process => {
                            rt.process_references();
                            rt.run_finalization();
                        },
                        Command::Stop { finalize } => {
                            if finalize {
                                rt.run_finalization();
                            }
                            break;
                        },
                    }
                }
                drop(mutator);
                log::debug!("reference processor stopped");
            })?;
        *daemon = Some(handle);
        Ok(())
    }

    pub fn is_daemon_running(&self) -> bool {
        self.daemon.lock().is_some()
    }

    /// Wake the processor thread
    ///
    /// # Returns
    /// `false` if no processor thread is running
    pub fn trigger(&self) -> bool {
        if !self.is_daemon_running() {
            return false;
        }
        self.commands_tx.send(Command::Process).is_ok()
    }

    /// Stop the processor thread and wait for it
    pub fn stop(&self, finalize: bool) {
        let handle = self.daemon.lock().take();
        if let Some(handle) = handle {
            let _ = self.commands_tx.send(Command::Stop { finalize });
            if handle.join().is_err() {
                log::warn!("reference processor thread panicked");
            }
        }
    }
}

impl Default for ReferenceProcessor {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_register_unregister() {
        let processor = ReferenceProcessor::new();
        processor.register(0x100);
        processor.register(0x200);
        processor.register(0x100);
        assert_eq!(processor.registered_count(), 2);
        processor.unregister(0x100);
        assert_eq!(processor.registered_count(), 1);
    }

    #[test]
    fn test_trigger_without_daemon() {
        let processor = ReferenceProcessor::new();
        assert!(!processor.trigger());
        assert!(!processor.is_daemon_running());
        processor.stop(false);
    }

    #[test]
    fn test_mode_flags() {
        let processor = ReferenceProcessor::new();
        assert!(processor.is_immediate());
        processor.set_immediate(false);
        assert!(!processor.is_immediate());
        assert!(!processor.is_working());
        assert_eq!(processor.poll(), None);
    }
}
