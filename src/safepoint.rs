use std::sync::atomic::{AtomicBool, Ordering};

use parking_lot::{Condvar, Mutex};

/// Brings every attached processor into a synchronized section such that e.g. a
/// garbage collection can be performed.
///
/// A section opens once all participants have arrived. Their bodies then run one after
/// another while the others wait, and nobody leaves before the last body has finished.
pub struct Rendezvous {
    requested: AtomicBool,
    state: Mutex<SectionState>,
    cv: Condvar,
}

#[derive(Default)]
struct SectionState {
    participants: usize,
    arrived: usize,
    departed: usize,
    epoch: u64,
}

impl Rendezvous {
    pub fn new() -> Self {
        Self {
            requested: AtomicBool::new(false),
            state: Mutex::new(SectionState::default()),
            cv: Condvar::new(),
        }
    }

    /// Registers the calling thread as a participant. Waits for a running section to end.
    pub fn attach(&self) {
        let mut state = self.state.lock();
        while state.arrived > 0 {
            self.cv.wait(&mut state);
        }
        state.participants += 1;
    }

    pub fn detach(&self) {
        let mut state = self.state.lock();
        debug_assert!(state.participants > 0);
        state.participants -= 1;
        // Arrived participants may have been waiting on this one.
        self.cv.notify_all();
    }

    pub fn participants(&self) -> usize {
        self.state.lock().participants
    }

    /// Whether some participant is waiting in a synchronized section.
    #[inline(always)]
    pub fn thread_in_section(&self) -> bool {
        self.requested.load(Ordering::Acquire)
    }

    /// Runs `body` inside the synchronized section. The caller must be attached.
    pub fn section<R>(&self, body: impl FnOnce() -> R) -> R {
        let mut state = self.state.lock();
        while state.departed > 0 {
            self.cv.wait(&mut state);
        }
        self.requested.store(true, Ordering::Release);
        state.arrived += 1;
        let epoch = state.epoch;
        self.cv.notify_all();
        while state.arrived < state.participants {
            self.cv.wait(&mut state);
        }

        let result = body();

        state.departed += 1;
        if state.departed == state.arrived {
            state.arrived = 0;
            state.departed = 0;
            state.epoch += 1;
            self.requested.store(false, Ordering::Release);
            self.cv.notify_all();
        } else {
            while state.epoch == epoch {
                self.cv.wait(&mut state);
            }
        }
        result
    }

    /// Stops counting the caller as a participant while `f` blocks outside the heap.
    pub fn blocking<R>(&self, f: impl FnOnce() -> R) -> R {
        self.detach();
        let result = f();
        self.attach();
        result
    }
}

impl Default for Rendezvous {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[test]
    fn bodies_run_serially_after_everyone_arrived() {
        let rendezvous = Rendezvous::new();
        let inside = AtomicUsize::new(0);
        let ran = AtomicUsize::new(0);
        for _ in 0..4 {
            rendezvous.attach();
        }
        crossbeam_utils::thread::scope(|scope| {
            for _ in 0..4 {
                scope.spawn(|_| {
                    for _ in 0..10 {
                        rendezvous.section(|| {
                            assert_eq!(inside.fetch_add(1, Ordering::SeqCst), 0);
                            ran.fetch_add(1, Ordering::SeqCst);
                            inside.fetch_sub(1, Ordering::SeqCst);
                        });
                    }
                    rendezvous.detach();
                });
            }
        })
        .unwrap();
        assert_eq!(ran.load(Ordering::SeqCst), 40);
        assert!(!rendezvous.thread_in_section());
        assert_eq!(rendezvous.participants(), 0);
    }

    #[test]
    fn blocked_participant_does_not_hold_up_a_section() {
        let rendezvous = Rendezvous::new();
        rendezvous.attach();
        rendezvous.attach();
        let (tx, rx) = flume::bounded::<()>(0);
        crossbeam_utils::thread::scope(|scope| {
            scope.spawn(|_| {
                rendezvous.blocking(|| rx.recv().unwrap());
                rendezvous.detach();
            });
            rendezvous.section(|| ());
            tx.send(()).unwrap();
            rendezvous.detach();
        })
        .unwrap();
    }
}
