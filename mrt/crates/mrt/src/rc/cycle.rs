//! Cycle Patterns - Candidate tracking and deferred pattern jobs
//!
//! Reference counting alone never reclaims a cycle. The engine records
//! objects that survived a decrement (candidates); the collector reclaims
//! cyclic garbage and reports the class shape of every reclaimed cycle
//! here as a pattern. Patterns that recur often enough are "learned": their
//! classes are flagged so the language runtime can treat them specially.
//!
//! Saving and learning are deferred jobs. Mutators only enqueue them; the
//! queue is drained after each collection or on demand, never on the
//! count hot path.

use crate::error::{MrtError, Result};
use crate::logging::{RuntimeEvent, RuntimeLogger};
use crate::object::ObjRef;
use crossbeam::channel::{unbounded, Receiver, Sender};
use indexmap::{IndexMap, IndexSet};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

/// Hits after which a pattern is learned by periodic learning
pub const DEFAULT_LEARN_THRESHOLD: u64 = 2;

/// Shape of a reclaimed cycle
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CyclePattern {
    /// Sorted class names joined with `,`
    pub signature: String,
    pub classes: Vec<String>,
    /// Number of reclaimed cycles with this shape
    pub hits: u64,
    pub learned: bool,
}

/// Deferred pattern work
pub enum CycleJob {
    /// Serialize the pattern table into the saved snapshot
    Save,
    /// Learn every pattern with at least `min_hits` hits
    Learn { min_hits: u64 },
    /// Arbitrary work against the store
    Custom(Box<dyn FnOnce(&CyclePatternStore) + Send>),
}

impl CycleJob {
    pub fn name(&self) -> &'static str {
        match self {
            CycleJob::Save => "save",
            CycleJob::Learn { .. } => "learn",
            CycleJob::Custom(_) => "custom",
        }
    }
}

impl fmt::Debug for CycleJob {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CycleJob::Learn { min_hits } => write!(f, "Learn {{ min_hits: {} }}", min_hits),
            other => f.write_str(other.name()),
        }
    }
}

/// Candidate set, pattern table and job queue
pub struct CyclePatternStore {
    limit: usize,
    candidates: Mutex<IndexSet<ObjRef>>,
    patterns: RwLock<IndexMap<String, CyclePattern>>,
    learned_classes: RwLock<IndexSet<String>>,
    jobs_tx: Sender<CycleJob>,
    jobs_rx: Receiver<CycleJob>,
    periodic_save: AtomicBool,
    periodic_learn: AtomicBool,
    saved: Mutex<Option<String>>,
    updated: AtomicBool,
    jobs_run: AtomicU64,
}

impl CyclePatternStore {
    /// Create a store holding at most `limit` candidates
    pub fn new(limit: usize) -> Self {
        let (jobs_tx, jobs_rx) = unbounded();
        Self {
            limit,
            candidates: Mutex::new(IndexSet::new()),
            patterns: RwLock::new(IndexMap::new()),
            learned_classes: RwLock::new(IndexSet::new()),
            jobs_tx,
            jobs_rx,
            periodic_save: AtomicBool::new(false),
            periodic_learn: AtomicBool::new(false),
            saved: Mutex::new(None),
            updated: AtomicBool::new(false),
            jobs_run: AtomicU64::new(0),
        }
    }

    // === Candidates ===

    /// Remember an object that may be part of a cycle
    ///
    /// # Returns
    /// `false` if the object was already recorded or the set is full
    pub fn record_candidate(&self, obj: ObjRef) -> bool {
        let mut candidates = self.candidates.lock();
        if candidates.len() >= self.limit {
            return false;
        }
        candidates.insert(obj)
    }

    pub fn candidate_count(&self) -> usize {
        self.candidates.lock().len()
    }

    /// Take and clear the candidate set
    ///
    /// Entries are hints: an address may have been freed or reused since it
    /// was recorded.
    pub fn take_candidates(&self) -> Vec<ObjRef> {
        std::mem::take(&mut *self.candidates.lock()).into_iter().collect()
    }

    // === Patterns ===

    /// Record one reclaimed cycle made of instances of `classes`
    ///
    /// # Returns
    /// `true` if the shape was seen for the first time
    pub fn record_pattern(&self, mut classes: Vec<String>) -> bool {
        classes.sort();
        let signature = classes.join(",");
        self.updated.store(true, Ordering::Release);

        let mut patterns = self.patterns.write();
        match patterns.get_mut(&signature) {
            Some(pattern) => {
                pattern.hits += 1;
                false
            },
            None => {
                log::debug!("new cycle pattern [{}]", signature);
                patterns.insert(
                    signature.clone(),
                    CyclePattern {
                        signature,
                        classes,
                        hits: 1,
                        learned: false,
                    },
                );
                true
            },
        }
    }

    pub fn pattern_count(&self) -> usize {
        self.patterns.read().len()
    }

    pub fn patterns(&self) -> Vec<CyclePattern> {
        self.patterns.read().values().cloned().collect()
    }

    /// Check whether instances of `class` belong to a learned pattern
    pub fn has_dynamic_load_pattern(&self, class: &str) -> bool {
        self.learned_classes.read().contains(class)
    }

    /// Flag `class` as belonging to a learned pattern
    pub fn set_has_dynamic_load_pattern(&self, class: &str) {
        self.learned_classes.write().insert(class.to_string());
    }

    /// Patterns changed since the last save
    pub fn is_updated(&self) -> bool {
        self.updated.load(Ordering::Acquire)
    }

    /// Learn every pattern with at least `min_hits` hits
    ///
    /// # Returns
    /// Number of newly learned patterns
    pub fn learn(&self, min_hits: u64) -> usize {
        let mut learned = 0;
        let mut patterns = self.patterns.write();
        let mut classes = self.learned_classes.write();
        for pattern in patterns.values_mut().filter(|p| !p.learned && p.hits >= min_hits) {
            pattern.learned = true;
            classes.extend(pattern.classes.iter().cloned());
            learned += 1;
        }
        learned
    }

    /// Serialize the pattern table into the saved snapshot
    pub fn save(&self) -> Result<String> {
        let patterns = self.patterns();
        let json = serde_json::to_string(&patterns).map_err(|e| MrtError::InvalidState {
            expected: "serializable cycle patterns".to_string(),
            actual: e.to_string(),
        })?;
        *self.saved.lock() = Some(json.clone());
        self.updated.store(false, Ordering::Release);
        Ok(json)
    }

    /// Last saved snapshot
    pub fn saved_patterns(&self) -> Option<String> {
        self.saved.lock().clone()
    }

    /// Merge a saved snapshot into the table
    ///
    /// Learned patterns flag their classes immediately.
    ///
    /// # Returns
    /// Number of patterns merged
    pub fn load_patterns(&self, json: &str) -> Result<usize> {
        let loaded: Vec<CyclePattern> = serde_json::from_str(json)
            .map_err(|e| MrtError::InvalidArgument(format!("bad cycle pattern data: {}", e)))?;
        let count = loaded.len();

        let mut patterns = self.patterns.write();
        let mut classes = self.learned_classes.write();
        for pattern in loaded {
            if pattern.learned {
                classes.extend(pattern.classes.iter().cloned());
            }
            patterns
                .entry(pattern.signature.clone())
                .and_modify(|existing| {
                    existing.hits += pattern.hits;
                    existing.learned |= pattern.learned;
                })
                .or_insert(pattern);
        }
        Ok(count)
    }

    // === Jobs ===

    /// Queue a job for the next drain
    pub fn send_job(&self, job: CycleJob) {
        // Both channel ends live in `self`, so the send cannot fail.
        let _ = self.jobs_tx.send(job);
    }

    pub fn pending_jobs(&self) -> usize {
        self.jobs_rx.len()
    }

    /// Save after every drain
    pub fn set_periodic_save(&self, enabled: bool) {
        self.periodic_save.store(enabled, Ordering::Relaxed);
    }

    /// Learn after every drain
    pub fn set_periodic_learn(&self, enabled: bool) {
        self.periodic_learn.store(enabled, Ordering::Relaxed);
    }

    /// Run every queued job, then the periodic ones
    ///
    /// # Returns
    /// Number of jobs run
    pub fn run_pending_jobs(&self, logger: &RuntimeLogger) -> usize {
        let mut jobs: Vec<CycleJob> = self.jobs_rx.try_iter().collect();
        if self.periodic_learn.load(Ordering::Relaxed) {
            jobs.push(CycleJob::Learn {
                min_hits: DEFAULT_LEARN_THRESHOLD,
            });
        }
        if self.periodic_save.load(Ordering::Relaxed) && self.is_updated() {
            jobs.push(CycleJob::Save);
        }

        let count = jobs.len();
        for job in jobs {
            let name = job.name();
            match job {
                CycleJob::Save => {
                    if let Err(e) = self.save() {
                        log::warn!("cycle pattern save failed: {}", e);
                    }
                },
                CycleJob::Learn { min_hits } => {
                    self.learn(min_hits);
                },
                CycleJob::Custom(work) => work(self),
            }
            self.jobs_run.fetch_add(1, Ordering::Relaxed);
            logger.log(RuntimeEvent::CyclePatternJob {
                job: name.to_string(),
                patterns: self.pattern_count(),
            });
        }
        count
    }

    pub fn jobs_run(&self) -> u64 {
        self.jobs_run.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::logging::RuntimeLoggerConfig;

    #[test]
    fn test_candidate_limit() {
        let store = CyclePatternStore::new(2);
        assert!(store.record_candidate(0x10));
        assert!(!store.record_candidate(0x10), "duplicates are ignored");
        assert!(store.record_candidate(0x20));
        assert!(!store.record_candidate(0x30), "set is full");
        assert_eq!(store.take_candidates(), vec![0x10, 0x20]);
        assert_eq!(store.candidate_count(), 0);
    }

    #[test]
    fn test_pattern_signature_is_order_free() {
        let store = CyclePatternStore::new(16);
        assert!(store.record_pattern(vec!["B".into(), "A".into()]));
        assert!(!store.record_pattern(vec!["A".into(), "B".into()]));

        let patterns = store.patterns();
        assert_eq!(patterns.len(), 1);
        assert_eq!(patterns[0].signature, "A,B");
        assert_eq!(patterns[0].hits, 2);
    }

    #[test]
    fn test_learn_flags_classes() {
        let store = CyclePatternStore::new(16);
        store.record_pattern(vec!["Node".into()]);
        assert_eq!(store.learn(2), 0);
        store.record_pattern(vec!["Node".into()]);
        assert_eq!(store.learn(2), 1);
        assert!(store.has_dynamic_load_pattern("Node"));
        assert!(!store.has_dynamic_load_pattern("Leaf"));
        store.set_has_dynamic_load_pattern("Leaf");
        assert!(store.has_dynamic_load_pattern("Leaf"));
    }

    #[test]
    fn test_save_and_load() {
        let store = CyclePatternStore::new(16);
        store.record_pattern(vec!["Parent".into(), "Child".into()]);
        store.learn(1);
        assert!(store.is_updated());
        let json = store.save().unwrap();
        assert!(!store.is_updated());
        assert_eq!(store.saved_patterns().as_deref(), Some(json.as_str()));

        let other = CyclePatternStore::new(16);
        assert_eq!(other.load_patterns(&json).unwrap(), 1);
        assert!(other.has_dynamic_load_pattern("Child"));
        assert!(other.load_patterns("not json").is_err());
    }

    #[test]
    fn test_jobs_are_deferred() {
        let store = CyclePatternStore::new(16);
        let logger = RuntimeLogger::new(RuntimeLoggerConfig::default());
        store.record_pattern(vec!["Node".into()]);

        store.send_job(CycleJob::Learn { min_hits: 1 });
        store.send_job(CycleJob::Save);
        assert!(!store.has_dynamic_load_pattern("Node"), "nothing runs on send");
        assert_eq!(store.pending_jobs(), 2);

        assert_eq!(store.run_pending_jobs(&logger), 2);
        assert!(store.has_dynamic_load_pattern("Node"));
        assert!(store.saved_patterns().is_some());
        assert_eq!(
            logger.count_matching(|e| matches!(e, RuntimeEvent::CyclePatternJob { .. })),
            2
        );
    }

    #[test]
    fn test_periodic_jobs() {
        let store = CyclePatternStore::new(16);
        let logger = RuntimeLogger::new(RuntimeLoggerConfig::default());
        store.set_periodic_save(true);
        assert_eq!(store.run_pending_jobs(&logger), 0, "nothing to save");

        store.record_pattern(vec!["Node".into()]);
        assert_eq!(store.run_pending_jobs(&logger), 1);
        assert!(store.saved_patterns().is_some());
    }

    #[test]
    fn test_custom_job() {
        let store = CyclePatternStore::new(16);
        let logger = RuntimeLogger::new(RuntimeLoggerConfig::default());
        store.send_job(CycleJob::Custom(Box::new(|s| {
            s.record_pattern(vec!["X".into()]);
        })));
        store.run_pending_jobs(&logger);
        assert_eq!(store.pattern_count(), 1);
        assert_eq!(store.jobs_run(), 1);
    }
}
