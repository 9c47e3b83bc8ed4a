use std::sync::{Condvar, Mutex, PoisonError};
use std::time::Duration;

/// A manual-reset event: once set, every waiter passes until it is reset.
#[derive(Debug, Default)]
pub struct Event {
    signaled: Mutex<bool>,
    cond: Condvar,
}

impl Event {
    pub const fn new(signaled: bool) -> Event {
        Event {
            signaled: Mutex::new(signaled),
            cond: Condvar::new(),
        }
    }

    pub fn set(&self) {
        *self.signaled.lock().unwrap_or_else(PoisonError::into_inner) = true;
        self.cond.notify_all();
    }

    pub fn reset(&self) {
        *self.signaled.lock().unwrap_or_else(PoisonError::into_inner) = false;
    }

    pub fn is_set(&self) -> bool {
        *self.signaled.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Block until the event is set.
    pub fn wait(&self) {
        let signaled = self.signaled.lock().unwrap_or_else(PoisonError::into_inner);
        let _signaled = self
            .cond
            .wait_while(signaled, |s| !*s)
            .unwrap_or_else(PoisonError::into_inner);
    }

    /// Block until the event is set or `timeout` passes. Returns whether the
    /// event was set.
    pub fn wait_timeout(&self, timeout: Duration) -> bool {
        let signaled = self.signaled.lock().unwrap_or_else(PoisonError::into_inner);
        let (signaled, _) = self
            .cond
            .wait_timeout_while(signaled, timeout, |s| !*s)
            .unwrap_or_else(PoisonError::into_inner);
        *signaled
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn set_releases_waiters() {
        let event = Arc::new(Event::new(false));
        assert!(!event.wait_timeout(Duration::from_millis(1)));

        let waiter = {
            let event = event.clone();
            std::thread::spawn(move || event.wait())
        };
        event.set();
        waiter.join().unwrap();
        assert!(event.is_set());

        // Manual reset: stays set until reset.
        event.wait();
        event.reset();
        assert!(!event.is_set());
    }
}
