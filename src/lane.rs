//! Ordered lanes: one FIFO queue feeding one sequential consumer.
//!
//! - [`SpeechLane`] dispatches speech results strictly in arrival order.
//! - [`ResponseLane`] does the same for model responses, but runs every
//!   dispatch as a preemptible unit so barge-in can cancel a handler
//!   mid-flight without disturbing the lane loop.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

use tokio::runtime::Handle;
use tokio::sync::{Notify, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use crate::dispatch::Dispatcher;
use crate::error::AgentError;
use crate::events::AgentEvent;

/// Unbounded FIFO queue with an async single-consumer `pop`.
///
/// Unlike an mpsc receiver, the queue can be drained and measured from any
/// task while the consumer is parked in `pop`.
pub struct LaneQueue<T> {
    items: Mutex<VecDeque<T>>,
    notify: Notify,
}

impl<T> Default for LaneQueue<T> {
    fn default() -> Self {
        Self {
            items: Mutex::new(VecDeque::new()),
            notify: Notify::new(),
        }
    }
}

impl<T> LaneQueue<T> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&self, item: T) {
        self.items
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push_back(item);
        self.notify.notify_one();
    }

    /// Wait for the next item. Only one task may pop at a time.
    pub async fn pop(&self) -> T {
        loop {
            if let Some(item) = self.try_pop() {
                return item;
            }
            // notify_one stores a permit, so a push between try_pop and here
            // is not lost.
            self.notify.notified().await;
        }
    }

    pub fn try_pop(&self) -> Option<T> {
        self.items
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .pop_front()
    }

    /// Remove every pending item, returning how many were dropped.
    pub fn drain(&self) -> usize {
        let mut items = self.items.lock().unwrap_or_else(|e| e.into_inner());
        let drained = items.len();
        items.clear();
        drained
    }

    pub fn len(&self) -> usize {
        self.items.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// FIFO lane for speech-recognition results.
#[derive(Clone, Default)]
pub struct SpeechLane {
    queue: Arc<LaneQueue<AgentEvent>>,
}

impl SpeechLane {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&self, event: AgentEvent) {
        self.queue.push(event);
    }

    pub fn pending(&self) -> usize {
        self.queue.len()
    }

    /// Start the consumer loop; it exits once `shutdown` is cancelled.
    pub fn spawn(
        &self,
        dispatcher: Dispatcher,
        shutdown: CancellationToken,
        handle: &Handle,
    ) -> JoinHandle<()> {
        let queue = Arc::clone(&self.queue);
        handle.spawn(async move {
            loop {
                let event = tokio::select! {
                    () = shutdown.cancelled() => break,
                    event = queue.pop() => event,
                };
                if let Err(e) = dispatcher.dispatch(&event).await {
                    debug!(error = %e, "speech lane dispatch ended early");
                }
            }
            info!("speech lane stopped");
        })
    }
}

/// The dispatch unit currently running on the response lane.
struct ActiveTask {
    cancel: CancellationToken,
    done: watch::Receiver<bool>,
}

#[derive(Default)]
struct ResponseLaneState {
    /// Bumped by every flush; events queued under an older generation are
    /// discarded instead of dispatched.
    generation: u64,
    /// Open [`LaneSeal`]s. Pushes are dropped while this is non-zero.
    seals: usize,
    active: Option<ActiveTask>,
}

/// FIFO lane for model responses with a cancellable active task.
#[derive(Clone, Default)]
pub struct ResponseLane {
    queue: Arc<LaneQueue<(u64, AgentEvent)>>,
    state: Arc<Mutex<ResponseLaneState>>,
}

impl ResponseLane {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&self, event: AgentEvent) {
        let state = self.lock_state();
        if state.seals > 0 {
            debug!(event = event.name(), "dropping response pushed into a sealed lane");
            return;
        }
        // Queued under the lock so a concurrent flush sees it in the drain.
        self.queue.push((state.generation, event));
    }

    pub fn pending(&self) -> usize {
        self.queue.len()
    }

    /// Whether a dispatch unit is running right now.
    pub fn has_active(&self) -> bool {
        self.lock_state().active.is_some()
    }

    /// Drop every queued response, cancel the running handler and wait for
    /// it to finish. Returns the number of queued events dropped.
    pub async fn flush(&self) -> usize {
        let (drained, active) = {
            let mut state = self.lock_state();
            state.generation += 1;
            let drained = self.queue.drain();
            let active = state
                .active
                .as_ref()
                .map(|a| (a.cancel.clone(), a.done.clone()));
            (drained, active)
        };

        if let Some((cancel, mut done)) = active {
            cancel.cancel();
            let _ = done.wait_for(|finished| *finished).await;
        }
        if drained > 0 {
            debug!(drained, "response lane flushed");
        }
        drained
    }

    /// Flush the lane and keep it closed until the returned seal is dropped.
    ///
    /// Responses pushed while sealed are discarded, so nothing raised during
    /// the seal can reach a handler.
    pub async fn seal(&self) -> LaneSeal {
        self.lock_state().seals += 1;
        // Guard first, so a cancelled flush still releases the seal.
        let mut seal = LaneSeal {
            lane: self.clone(),
            dropped: 0,
        };
        seal.dropped = self.flush().await;
        seal
    }

    /// Whether any seal is open.
    pub fn is_sealed(&self) -> bool {
        self.lock_state().seals > 0
    }

    /// Start the consumer loop; it exits once `shutdown` is cancelled.
    pub fn spawn(
        &self,
        dispatcher: Dispatcher,
        shutdown: CancellationToken,
        handle: &Handle,
    ) -> JoinHandle<()> {
        let lane = self.clone();
        let unit_handle = handle.clone();
        handle.spawn(async move {
            loop {
                let (generation, event) = tokio::select! {
                    () = shutdown.cancelled() => break,
                    item = lane.queue.pop() => item,
                };
                lane.run_unit(generation, event, &dispatcher, &shutdown, &unit_handle)
                    .await;
            }
            info!("response lane stopped");
        })
    }

    async fn run_unit(
        &self,
        generation: u64,
        event: AgentEvent,
        dispatcher: &Dispatcher,
        shutdown: &CancellationToken,
        handle: &Handle,
    ) {
        let cancel = shutdown.child_token();
        let (done_tx, done_rx) = watch::channel(false);
        {
            let mut state = self.lock_state();
            if state.generation != generation {
                debug!(event = event.name(), "dropping response queued before flush");
                return;
            }
            state.active = Some(ActiveTask {
                cancel: cancel.clone(),
                done: done_rx,
            });
        }

        let dispatcher = dispatcher.clone();
        let unit = handle.spawn(async move {
            tokio::select! {
                () = cancel.cancelled() => Err(AgentError::Cancelled),
                result = dispatcher.dispatch(&event) => result,
            }
        });
        let outcome = unit.await;

        self.lock_state().active = None;
        let _ = done_tx.send(true);

        match outcome {
            Ok(Ok(())) => {}
            Ok(Err(e)) if e.is_cancelled() => debug!("response handler cancelled"),
            Ok(Err(e)) => debug!(error = %e, "response dispatch ended early"),
            Err(e) => error!(error = %e, "response dispatch task failed"),
        }
    }

    fn lock_state(&self) -> std::sync::MutexGuard<'_, ResponseLaneState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }
}

/// Keeps a [`ResponseLane`] closed to new responses while held.
pub struct LaneSeal {
    lane: ResponseLane,
    dropped: usize,
}

impl LaneSeal {
    /// Queued events dropped when the seal was taken.
    pub fn dropped(&self) -> usize {
        self.dropped
    }
}

impl Drop for LaneSeal {
    fn drop(&mut self) {
        let mut state = self.lane.lock_state();
        state.seals = state.seals.saturating_sub(1);
    }
}
