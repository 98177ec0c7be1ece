use parking_lot::{Condvar, Mutex};
use std::convert::Infallible;
use std::fmt;
use std::sync::atomic::{AtomicU8, Ordering};

const EMPTY: u8 = 0;
const RUNNING: u8 = 1;
const READY: u8 = 2;

/// A write-once value slot that runs its initializer at most once at a time.
///
/// The first caller of [`SingleFlightCell::resolve`] runs the compute function. Callers arriving
/// while it runs block until it finishes and then observe the same value; later callers get the
/// stored value right away.
///
/// If the compute function panics or returns an error, the cell goes back to empty and the next
/// resolver (a blocked waiter or a later caller) runs its own compute function. A failure is never
/// cached.
pub struct SingleFlightCell<V> {
    state: AtomicU8,
    value: Mutex<Option<V>>,
    ready: Condvar,
}

impl<V> SingleFlightCell<V> {
    pub fn new() -> Self {
        Self {
            state: AtomicU8::new(EMPTY),
            value: Mutex::new(None),
            ready: Condvar::new(),
        }
    }

    pub fn is_resolved(&self) -> bool {
        self.state.load(Ordering::Acquire) == READY
    }

    fn wait_while_running(&self) {
        let mut value = self.value.lock();
        while self.state.load(Ordering::Acquire) == RUNNING {
            self.ready.wait(&mut value);
        }
    }

    // The state only changes while the value lock is held, so a waiter can't miss the wakeup.
    fn land(&self, value: Option<V>) {
        let mut slot = self.value.lock();
        let next = if value.is_some() { READY } else { EMPTY };
        *slot = value;
        self.state.store(next, Ordering::Release);
        drop(slot);
        self.ready.notify_all();
    }
}

impl<V: Clone> SingleFlightCell<V> {
    /// Returns the value if the cell has been resolved, without blocking on an in-flight compute.
    pub fn get(&self) -> Option<V> {
        if !self.is_resolved() {
            return None;
        }
        self.value.lock().clone()
    }

    /// Returns the stored value, running `compute` first if nobody has resolved the cell yet.
    pub fn resolve<F>(&self, compute: F) -> V
    where
        F: FnOnce() -> V,
    {
        match self.try_resolve(|| Ok::<V, Infallible>(compute())) {
            Ok(value) => value,
            Err(never) => match never {},
        }
    }

    /// Like [`SingleFlightCell::resolve`], but with a fallible compute function.
    ///
    /// An error is handed back to this caller only. The cell stays empty, so a concurrent waiter
    /// takes over and runs its own compute function.
    pub fn try_resolve<F, E>(&self, compute: F) -> Result<V, E>
    where
        F: FnOnce() -> Result<V, E>,
    {
        loop {
            match self
                .state
                .compare_exchange(EMPTY, RUNNING, Ordering::AcqRel, Ordering::Acquire)
            {
                Ok(_) => break,
                Err(READY) => {
                    if let Some(value) = self.value.lock().as_ref() {
                        return Ok(value.clone());
                    }
                }
                Err(_) => self.wait_while_running(),
            }
        }

        let mut flight = Flight {
            cell: self,
            landed: false,
        };

        let result = compute();
        if let Ok(value) = &result {
            flight.landed = true;
            self.land(Some(value.clone()));
        }

        result
    }
}

impl<V> Default for SingleFlightCell<V> {
    fn default() -> Self {
        Self::new()
    }
}

impl<V> fmt::Debug for SingleFlightCell<V> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = match self.state.load(Ordering::Acquire) {
            EMPTY => "empty",
            RUNNING => "running",
            _ => "ready",
        };
        f.debug_struct("SingleFlightCell")
            .field("state", &state)
            .finish()
    }
}

/// Resets the cell when the running compute fails or unwinds.
struct Flight<'a, V> {
    cell: &'a SingleFlightCell<V>,
    landed: bool,
}

impl<V> Drop for Flight<'_, V> {
    fn drop(&mut self) {
        if !self.landed {
            self.cell.land(None);
        }
    }
}
