//! Concurrency limiter.
//!
//! Dispatches work items in submission order with at most `limit` running
//! at once. Each item runs in its own spawned task with panics caught, so a
//! misbehaving item never takes down its siblings or the dispatch loop.

use std::any::Any;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use futures_util::FutureExt;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

/// Result of a dispatch pass.
#[derive(Debug)]
pub struct Dispatch<T> {
    /// Items that were handed a slot.
    pub dispatched: usize,
    /// Items never started because the run was cancelled first.
    pub undispatched: Vec<T>,
}

/// Bounded-concurrency dispatcher.
#[derive(Clone)]
pub struct ConcurrencyLimiter {
    limit: usize,
    semaphore: Arc<Semaphore>,
    in_flight: Arc<AtomicUsize>,
    peak: Arc<AtomicUsize>,
}

/// Decrements the in-flight counter however the item ends.
struct InFlightGuard(Arc<AtomicUsize>);

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

impl ConcurrencyLimiter {
    /// Create a limiter. A limit of zero is treated as one.
    pub fn new(limit: usize) -> Self {
        let limit = limit.max(1);
        Self {
            limit,
            semaphore: Arc::new(Semaphore::new(limit)),
            in_flight: Arc::new(AtomicUsize::new(0)),
            peak: Arc::new(AtomicUsize::new(0)),
        }
    }

    pub fn limit(&self) -> usize {
        self.limit
    }

    /// Items running right now.
    pub fn in_flight(&self) -> usize {
        self.in_flight.load(Ordering::SeqCst)
    }

    /// Highest concurrent count observed so far.
    pub fn peak(&self) -> usize {
        self.peak.load(Ordering::SeqCst)
    }

    /// Run `work` for every item, waiting for all dispatched items to end.
    ///
    /// Dispatch stops as soon as `cancel` fires; items not yet started are
    /// returned in [`Dispatch::undispatched`]. Items already running are
    /// expected to watch the same token. A panicking item is reported to
    /// `on_panic` with its panic message.
    pub async fn run<T, W, WF, P, PF>(
        &self,
        items: Vec<T>,
        cancel: &CancellationToken,
        work: W,
        on_panic: P,
    ) -> Dispatch<T>
    where
        T: Clone + Send + 'static,
        W: Fn(T) -> WF,
        WF: Future<Output = ()> + Send + 'static,
        P: Fn(T, String) -> PF + Clone + Send + 'static,
        PF: Future<Output = ()> + Send + 'static,
    {
        let mut running = JoinSet::new();
        let mut dispatched = 0usize;
        let mut pending = items.into_iter();

        while let Some(item) = pending.next() {
            let permit = tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    let mut undispatched = vec![item];
                    undispatched.extend(pending);
                    info!(
                        dispatched,
                        undispatched = undispatched.len(),
                        "Dispatch stopped by cancellation"
                    );
                    drain(&mut running).await;
                    return Dispatch { dispatched, undispatched };
                }
                permit = self.semaphore.clone().acquire_owned() => match permit {
                    Ok(permit) => permit,
                    Err(_) => {
                        error!("Concurrency semaphore closed");
                        let mut undispatched = vec![item];
                        undispatched.extend(pending);
                        drain(&mut running).await;
                        return Dispatch { dispatched, undispatched };
                    }
                },
            };

            let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
            self.peak.fetch_max(now, Ordering::SeqCst);
            let guard = InFlightGuard(self.in_flight.clone());
            dispatched += 1;
            debug!(in_flight = now, limit = self.limit, "Dispatching item");

            let fut = work(item.clone());
            let on_panic = on_panic.clone();
            running.spawn(async move {
                let _permit = permit;
                let _guard = guard;
                if let Err(payload) = AssertUnwindSafe(fut).catch_unwind().await {
                    let message = panic_message(payload.as_ref());
                    error!(panic = %message, "Dispatched item panicked");
                    on_panic(item, message).await;
                }
            });
        }

        drain(&mut running).await;
        Dispatch {
            dispatched,
            undispatched: Vec::new(),
        }
    }
}

async fn drain(running: &mut JoinSet<()>) {
    while let Some(joined) = running.join_next().await {
        if let Err(e) = joined {
            error!(error = %e, "Dispatched item did not finish cleanly");
        }
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}
