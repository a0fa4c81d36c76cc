use std::{
    sync::{Condvar, Mutex},
    time::{Duration, Instant},
};

/// Auto-resetting wake-up flag. `set` releases one waiter; a wait that
/// observes the flag consumes it.
pub(crate) struct Signal {
    flag: Mutex<bool>,
    cond: Condvar,
}

impl Signal {
    pub(crate) fn new() -> Self {
        Self {
            flag: Mutex::new(false),
            cond: Condvar::new(),
        }
    }

    pub(crate) fn set(&self) {
        let mut flag = self.flag.lock().unwrap();
        *flag = true;
        self.cond.notify_one();
    }

    /// Blocks until the signal fires.
    pub(crate) fn wait(&self) {
        let mut flag = self.flag.lock().unwrap();
        while !*flag {
            flag = self.cond.wait(flag).unwrap();
        }
        *flag = false;
    }

    /// Blocks until the signal fires or `timeout` elapses. Returns whether
    /// the signal fired.
    pub(crate) fn wait_timeout(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut flag = self.flag.lock().unwrap();
        while !*flag {
            let now = Instant::now();
            if now >= deadline {
                return false;
            }
            let (guard, _) = self.cond.wait_timeout(flag, deadline - now).unwrap();
            flag = guard;
        }
        *flag = false;
        true
    }
}
