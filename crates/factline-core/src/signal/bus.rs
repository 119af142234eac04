//! In-process typed pub/sub for [`ChangeSignal`]s.
//!
//! Delivery is fire-and-forget: a published signal reaches the handlers
//! registered at publish time, in registration order, on the publishing
//! task. Handlers must not block; long work (refreshing from the store,
//! delayed invalidation) is spawned onto the runtime by the handler.
//!
//! # Panic Safety
//!
//! A panicking handler is caught via [`std::panic::catch_unwind`] and
//! logged; remaining handlers still receive the signal.

use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use fxhash::FxHashMap;
use parking_lot::RwLock;
use smallvec::SmallVec;

use super::event::{ChangeSignal, SignalKind};

/// Callback invoked for every signal of a subscribed kind.
pub type SignalHandler = Arc<dyn Fn(&ChangeSignal) + Send + Sync>;

/// Publish/subscribe seam for change signals.
pub trait ChangeBus: Send + Sync {
    /// Publishes a signal to all handlers registered for its kind.
    fn publish(&self, signal: ChangeSignal);

    /// Registers a handler for one signal kind.
    fn subscribe(&self, kind: SignalKind, handler: SignalHandler);
}

/// Default [`ChangeBus`] backed by a handler table.
#[derive(Default)]
pub struct LocalChangeBus {
    handlers: RwLock<FxHashMap<SignalKind, Vec<SignalHandler>>>,
}

impl LocalChangeBus {
    /// Creates an empty bus.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the number of handlers registered for `kind`.
    #[must_use]
    pub fn handler_count(&self, kind: SignalKind) -> usize {
        self.handlers.read().get(&kind).map_or(0, Vec::len)
    }
}

impl ChangeBus for LocalChangeBus {
    fn publish(&self, signal: ChangeSignal) {
        // Copy out so handlers may subscribe without deadlocking.
        let handlers: SmallVec<[SignalHandler; 4]> = match self.handlers.read().get(&signal.kind())
        {
            Some(list) => list.iter().cloned().collect(),
            None => return,
        };

        for handler in handlers {
            let result = std::panic::catch_unwind(AssertUnwindSafe(|| handler(&signal)));
            if result.is_err() {
                tracing::error!(signal = %signal, "change bus handler panicked");
            }
        }
    }

    fn subscribe(&self, kind: SignalKind, handler: SignalHandler) {
        self.handlers.write().entry(kind).or_default().push(handler);
    }
}

impl std::fmt::Debug for LocalChangeBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let handlers = self.handlers.read();
        f.debug_struct("LocalChangeBus")
            .field("kinds", &handlers.len())
            .finish()
    }
}
