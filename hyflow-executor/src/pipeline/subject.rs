//! Counting barrier between neighbouring pipeline stages.

use hyflow_core::error::{HyflowError, Result};
use hyflow_core::types::StageId;
use parking_lot::{Condvar, Mutex};

#[derive(Debug)]
struct SubjectState {
    releases: u64,
    first_wait: bool,
    aborted: bool,
}

/// Gates a stage from starting its next iteration until the downstream
/// stage has taken the previous iteration's outputs.
///
/// The first await of a run passes without a release. Every later await
/// consumes one release.
#[derive(Debug)]
pub struct StageSubject {
    stage: StageId,
    state: Mutex<SubjectState>,
    released: Condvar,
}

impl StageSubject {
    /// Create the subject of `stage`.
    pub fn new(stage: StageId) -> Self {
        Self {
            stage,
            state: Mutex::new(SubjectState {
                releases: 0,
                first_wait: true,
                aborted: false,
            }),
            released: Condvar::new(),
        }
    }

    /// Block until the stage may start its next iteration.
    pub fn await_release(&self) -> Result<()> {
        let mut state = self.state.lock();
        loop {
            if state.aborted {
                return Err(HyflowError::Aborted {
                    reason: format!("{} subject aborted", self.stage),
                });
            }
            if state.first_wait {
                state.first_wait = false;
                return Ok(());
            }
            if state.releases > 0 {
                state.releases -= 1;
                return Ok(());
            }
            self.released.wait(&mut state);
        }
    }

    /// Allow one more iteration.
    pub fn release(&self) {
        let mut state = self.state.lock();
        state.releases += 1;
        self.released.notify_one();
    }

    /// Fail current and future awaits until [`StageSubject::reset`].
    pub fn abort(&self) {
        let mut state = self.state.lock();
        state.aborted = true;
        self.released.notify_all();
    }

    /// Restore the initial state for a new run.
    pub fn reset(&self) {
        let mut state = self.state.lock();
        state.releases = 0;
        state.first_wait = true;
        state.aborted = false;
    }

    /// Releases not yet consumed.
    pub fn pending_releases(&self) -> u64 {
        self.state.lock().releases
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;
    use std::time::Duration;

    #[test]
    fn first_wait_passes() {
        let subject = StageSubject::new(StageId::new(0));
        subject.await_release().unwrap();
        subject.release();
        subject.await_release().unwrap();
        assert_eq!(subject.pending_releases(), 0);
    }

    #[test]
    fn second_wait_blocks_until_release() {
        let subject = Arc::new(StageSubject::new(StageId::new(0)));
        subject.await_release().unwrap();

        let waiter = {
            let subject = Arc::clone(&subject);
            thread::spawn(move || subject.await_release())
        };
        thread::sleep(Duration::from_millis(20));
        assert!(!waiter.is_finished());
        subject.release();
        assert!(waiter.join().unwrap().is_ok());
    }

    #[test]
    fn abort_unblocks_and_reset_clears() {
        let subject = Arc::new(StageSubject::new(StageId::new(2)));
        subject.await_release().unwrap();
        let waiter = {
            let subject = Arc::clone(&subject);
            thread::spawn(move || subject.await_release())
        };
        subject.abort();
        assert!(waiter.join().unwrap().unwrap_err().is_aborted());

        subject.reset();
        assert!(subject.await_release().is_ok());
    }
}
