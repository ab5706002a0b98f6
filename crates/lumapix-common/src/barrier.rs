//! N-party shutdown rendezvous.
//!
//! Components that must finish work before their backing store can be
//! closed register with [`ShutdownBarrier::about_to_begin`] and report with
//! [`ShutdownBarrier::just_ended`]. The coordinating side calls
//! [`ShutdownBarrier::wait`], optionally bounded by a timeout; whichever
//! outcome happens first wins and the status never changes afterwards.

use parking_lot::{Condvar, Mutex};
use std::time::{Duration, Instant};

/// Terminal state of a coordinated shutdown
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CoordinationStatus {
    /// Every registered party reported completion
    AllDone,
    /// Shutdown was cancelled before completion
    Cancel,
    /// The timeout elapsed with parties still outstanding
    Timeout,
}

struct BarrierState {
    /// Outstanding parties. Starts at one: the waiter itself holds a slot
    /// until `wait` runs, so parties registered beforehand always count.
    pending: usize,
    status: Option<CoordinationStatus>,
    /// The waiter's slot is released at most once
    released: bool,
}

/// N-party completion gate with a single-shot outcome
pub struct ShutdownBarrier {
    state: Mutex<BarrierState>,
    done: Condvar,
}

impl ShutdownBarrier {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(BarrierState {
                pending: 1,
                status: None,
                released: false,
            }),
            done: Condvar::new(),
        }
    }

    /// Register `parties` additional participants
    pub fn about_to_begin(&self, parties: usize) {
        let mut state = self.state.lock();
        state.pending += parties;
    }

    /// Report completion of one participant
    pub fn just_ended(&self) {
        let mut state = self.state.lock();
        self.finish_one(&mut state);
    }

    /// Abort the rendezvous; waiters wake with `Cancel`
    pub fn cancel(&self) {
        let mut state = self.state.lock();
        if state.status.is_none() {
            state.status = Some(CoordinationStatus::Cancel);
        }
        self.done.notify_all();
    }

    /// Release the waiter's own slot and block until every party has
    /// reported, the gate is cancelled, or `timeout` elapses.
    pub fn wait(&self, timeout: Option<Duration>) -> CoordinationStatus {
        let mut state = self.state.lock();
        if !state.released {
            state.released = true;
            self.finish_one(&mut state);
        }

        let deadline = timeout.map(|t| Instant::now() + t);
        while state.status.is_none() {
            match deadline {
                Some(deadline) => {
                    if self.done.wait_until(&mut state, deadline).timed_out() {
                        if state.status.is_none() {
                            state.status = Some(CoordinationStatus::Timeout);
                        }
                        break;
                    }
                }
                None => self.done.wait(&mut state),
            }
        }

        state.status.unwrap_or(CoordinationStatus::AllDone)
    }

    fn finish_one(&self, state: &mut BarrierState) {
        debug_assert!(state.pending > 0, "more reports than registrations");
        state.pending = state.pending.saturating_sub(1);
        if state.pending == 0 {
            if state.status.is_none() {
                state.status = Some(CoordinationStatus::AllDone);
            }
            self.done.notify_all();
        }
    }
}

impl Default for ShutdownBarrier {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn test_wait_with_no_parties() {
        let barrier = ShutdownBarrier::new();
        assert_eq!(
            barrier.wait(Some(Duration::from_millis(50))),
            CoordinationStatus::AllDone
        );
    }

    #[test]
    fn test_all_parties_report() {
        let barrier = Arc::new(ShutdownBarrier::new());
        barrier.about_to_begin(3);

        let mut handles = Vec::new();
        for _ in 0..3 {
            let barrier = Arc::clone(&barrier);
            handles.push(thread::spawn(move || {
                thread::sleep(Duration::from_millis(10));
                barrier.just_ended();
            }));
        }

        assert_eq!(
            barrier.wait(Some(Duration::from_secs(5))),
            CoordinationStatus::AllDone
        );
        for handle in handles {
            handle.join().unwrap();
        }
    }

    #[test]
    fn test_timeout_when_party_never_reports() {
        let barrier = ShutdownBarrier::new();
        barrier.about_to_begin(1);

        assert_eq!(
            barrier.wait(Some(Duration::from_millis(20))),
            CoordinationStatus::Timeout
        );
    }

    #[test]
    fn test_status_is_single_shot() {
        let barrier = ShutdownBarrier::new();
        barrier.about_to_begin(1);

        assert_eq!(
            barrier.wait(Some(Duration::from_millis(20))),
            CoordinationStatus::Timeout
        );

        // A late report must not rewrite the outcome
        barrier.just_ended();
        assert_eq!(
            barrier.wait(Some(Duration::from_millis(20))),
            CoordinationStatus::Timeout
        );
    }

    #[test]
    fn test_cancel_wins() {
        let barrier = Arc::new(ShutdownBarrier::new());
        barrier.about_to_begin(1);

        let canceller = {
            let barrier = Arc::clone(&barrier);
            thread::spawn(move || {
                thread::sleep(Duration::from_millis(10));
                barrier.cancel();
            })
        };

        assert_eq!(
            barrier.wait(Some(Duration::from_secs(5))),
            CoordinationStatus::Cancel
        );
        canceller.join().unwrap();
    }
}
