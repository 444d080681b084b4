//! Single-flight execution
//!
//! At most one attempt runs per [`SingleFlight`]; callers arriving while it
//! runs receive a handle to the same attempt and observe the identical
//! outcome. The slot clears itself when the attempt settles, so the next
//! caller starts fresh.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use futures::future::{BoxFuture, FutureExt, Shared};
use parking_lot::Mutex;

/// Handle to a running attempt
pub type Flight<T> = Shared<BoxFuture<'static, T>>;

type Slot<T> = Arc<Mutex<Option<(u64, Flight<T>)>>>;

/// Deduplicates concurrent attempts of one operation
pub struct SingleFlight<T: Clone> {
    slot: Slot<T>,
    next_id: AtomicU64,
}

impl<T> SingleFlight<T>
where
    T: Clone + Send + Sync + 'static,
{
    /// Create an idle single-flight slot
    #[must_use]
    pub fn new() -> Self {
        Self {
            slot: Arc::new(Mutex::new(None)),
            next_id: AtomicU64::new(0),
        }
    }

    /// True while an attempt is running
    pub fn in_flight(&self) -> bool {
        self.slot.lock().is_some()
    }

    /// Join the running attempt, if any
    pub fn join(&self) -> Option<Flight<T>> {
        self.slot.lock().as_ref().map(|(_, f)| f.clone())
    }

    /// Join the running attempt or start one with `start`
    pub fn run<F>(&self, start: F) -> Flight<T>
    where
        F: FnOnce() -> BoxFuture<'static, T>,
    {
        match self.try_run(|| Ok::<_, std::convert::Infallible>(start())) {
            Ok(flight) => flight,
            Err(never) => match never {},
        }
    }

    /// Join the running attempt or try to start one
    ///
    /// `start` runs under the slot lock, so a gate it checks (a throttle, say)
    /// is evaluated by exactly one would-be leader. When it returns an error
    /// nothing is started and the error is handed back.
    ///
    /// The attempt is driven by its own task, so it completes even if every
    /// caller stops waiting.
    pub fn try_run<F, E>(&self, start: F) -> std::result::Result<Flight<T>, E>
    where
        F: FnOnce() -> std::result::Result<BoxFuture<'static, T>, E>,
    {
        let mut slot = self.slot.lock();
        if let Some((_, flight)) = slot.as_ref() {
            return Ok(flight.clone());
        }

        let work = start()?;
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let cleanup = Arc::clone(&self.slot);
        let flight = async move {
            let outcome = work.await;
            let mut slot = cleanup.lock();
            if slot.as_ref().is_some_and(|(current, _)| *current == id) {
                *slot = None;
            }
            outcome
        }
        .boxed()
        .shared();

        *slot = Some((id, flight.clone()));
        drop(slot);

        tokio::spawn(flight.clone());
        Ok(flight)
    }
}

impl<T> Default for SingleFlight<T>
where
    T: Clone + Send + Sync + 'static,
{
    fn default() -> Self {
        Self::new()
    }
}
