//! Barge-in handling.
//!
//! When the user starts talking over the assistant, everything downstream of
//! the model is thrown away in a fixed order:
//!
//! 1. the pending sentence fragment is cleared;
//! 2. the Model-Response Lane is sealed, with its queue drained and the
//!    running handler cancelled and awaited, and the engine is flushed
//!    behind the seal so nothing it raises on the way out is dispatched;
//! 3. the synthesizer is told to drop its buffer;
//! 4. audio playback is stopped.
//!
//! [`InterruptCoordinator::interrupt`] must not be called from a
//! Model-Response Lane handler: it waits for that lane's active handler.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use tracing::{info, warn};

use crate::lane::ResponseLane;
use crate::llm::engine::ModelEngine;
use crate::outbound::{Outbound, SynthesisFlush};
use crate::turn::SentenceFragment;

pub struct InterruptCoordinator {
    engine: ModelEngine,
    response_lane: ResponseLane,
    outbound: Arc<dyn Outbound>,
    fragment: SentenceFragment,
    serial: tokio::sync::Mutex<()>,
    count: AtomicU64,
}

impl InterruptCoordinator {
    pub fn new(engine: ModelEngine, response_lane: ResponseLane, outbound: Arc<dyn Outbound>) -> Self {
        Self {
            engine,
            response_lane,
            outbound,
            fragment: SentenceFragment::new(),
            serial: tokio::sync::Mutex::new(()),
            count: AtomicU64::new(0),
        }
    }

    /// Handle to the sentence fragment this coordinator clears.
    pub fn fragment(&self) -> SentenceFragment {
        self.fragment.clone()
    }

    /// Number of completed interrupts.
    pub fn count(&self) -> u64 {
        self.count.load(Ordering::Relaxed)
    }

    /// Run the barge-in sequence. Concurrent calls are serialized.
    ///
    /// Collaborator failures are logged; the remaining steps still run.
    pub async fn interrupt(&self) {
        let _serial = self.serial.lock().await;

        self.fragment.clear();
        let seal = self.response_lane.seal().await;
        self.engine.flush().await;
        let dropped = seal.dropped();
        drop(seal);
        // A handler cancelled mid-flight may have refilled the fragment.
        self.fragment.clear();

        let flush = SynthesisFlush::new();
        let flush_id = flush.flush_id.clone();
        if let Err(e) = self.outbound.flush_synthesis(flush).await {
            warn!(%flush_id, error = %e, "synthesis flush failed");
        }
        if let Err(e) = self.outbound.flush_audio().await {
            warn!(error = %e, "audio flush failed");
        }

        let count = self.count.fetch_add(1, Ordering::Relaxed) + 1;
        info!(%flush_id, dropped, count, "interrupt sent");
    }
}
