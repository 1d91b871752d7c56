//! Dependency chain primitives
//!
//! Every sequenced task owns a `ChainLink`. Successors attach a `Gate` to the
//! links they depend on; a gate opens (and schedules its task) once every
//! link it is attached to has finished.

use parking_lot::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

type Release = Box<dyn FnOnce() + Send>;

/// Admission counter of one task
pub(crate) struct Gate {
    // One extra count is held by the submitter until setup completes
    remaining: AtomicUsize,
    release: Mutex<Option<Release>>,
}

impl Gate {
    pub(crate) fn new() -> Arc<Self> {
        Arc::new(Self {
            remaining: AtomicUsize::new(1),
            release: Mutex::new(None),
        })
    }

    /// Account for one more predecessor
    pub(crate) fn hold(&self) {
        self.remaining.fetch_add(1, Ordering::AcqRel);
    }

    pub(crate) fn set_release(&self, release: impl FnOnce() + Send + 'static) {
        *self.release.lock() = Some(Box::new(release));
    }

    /// One predecessor (or the submitter) is done; the last arrival releases.
    pub(crate) fn arrive(&self) {
        if self.remaining.fetch_sub(1, Ordering::AcqRel) == 1 {
            let release = self.release.lock().take();
            if let Some(release) = release {
                release();
            }
        }
    }

    #[cfg(test)]
    fn remaining(&self) -> usize {
        self.remaining.load(Ordering::Acquire)
    }
}

#[derive(Default)]
struct LinkState {
    finished: bool,
    dependents: Vec<Arc<Gate>>,
}

/// Completion marker of one sequenced task
#[derive(Default)]
pub(crate) struct ChainLink {
    state: Mutex<LinkState>,
}

impl ChainLink {
    pub(crate) fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Register `gate` as waiting on this link; false if already finished.
    pub(crate) fn attach(&self, gate: Arc<Gate>) -> bool {
        let mut state = self.state.lock();
        if state.finished {
            return false;
        }
        state.dependents.push(gate);
        true
    }

    /// Mark finished and hand back the gates to open.
    pub(crate) fn finish(&self) -> Vec<Arc<Gate>> {
        let mut state = self.state.lock();
        state.finished = true;
        std::mem::take(&mut state.dependents)
    }

    pub(crate) fn is_finished(&self) -> bool {
        self.state.lock().finished
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicBool;

    #[test]
    fn test_gate_opens_after_every_predecessor() {
        let opened = Arc::new(AtomicBool::new(false));
        let first = ChainLink::new();
        let second = ChainLink::new();
        let gate = Gate::new();

        for link in [&first, &second] {
            gate.hold();
            assert!(link.attach(gate.clone()));
        }
        let flag = opened.clone();
        gate.set_release(move || flag.store(true, Ordering::SeqCst));
        gate.arrive();
        assert_eq!(gate.remaining(), 2);

        for g in first.finish() {
            g.arrive();
        }
        assert!(!opened.load(Ordering::SeqCst));
        for g in second.finish() {
            g.arrive();
        }
        assert!(opened.load(Ordering::SeqCst));
    }

    #[test]
    fn test_attach_to_finished_link() {
        let link = ChainLink::new();
        assert!(link.finish().is_empty());
        assert!(link.is_finished());
        assert!(!link.attach(Gate::new()));
    }

    #[test]
    fn test_release_before_setup_done() {
        let opened = Arc::new(AtomicBool::new(false));
        let link = ChainLink::new();
        let gate = Gate::new();
        gate.hold();
        assert!(link.attach(gate.clone()));

        // Predecessor finishes while the submitter still holds its count
        for g in link.finish() {
            g.arrive();
        }
        let flag = opened.clone();
        gate.set_release(move || flag.store(true, Ordering::SeqCst));
        assert!(!opened.load(Ordering::SeqCst));
        gate.arrive();
        assert!(opened.load(Ordering::SeqCst));
    }
}
