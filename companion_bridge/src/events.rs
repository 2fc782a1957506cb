use companion_protocol::{AddressingMode, FillImage};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError, Weak};

/// A validated button image pushed by the controller.
#[derive(Debug, Clone)]
pub struct FillImageEvent {
    pub mode: AddressingMode,
    pub key_index: u32,
    pub page: Option<u32>,
    pub bank: Option<u32>,
    /// Exactly `IMAGE_BUFFER_LEN` bytes of row-major RGB.
    pub pixels: Arc<[u8]>,
}

impl FillImageEvent {
    /// Returns `None` when the buffer has the wrong length.
    pub fn from_fill(fill: &FillImage) -> Option<Self> {
        let pixels = fill.pixels().ok()?;
        Some(Self {
            mode: fill.addressing(),
            key_index: fill.key_index,
            page: fill.page,
            bank: fill.bank,
            pixels: Arc::from(pixels),
        })
    }
}

type Handler = Arc<dyn Fn(&FillImageEvent) + Send + Sync>;

#[derive(Default)]
struct BusInner {
    next_id: AtomicU64,
    handlers: Mutex<Vec<(u64, Handler)>>,
}

/// Fan-out of fill-image events to the caches that render them.
#[derive(Clone, Default)]
pub struct FillImageBus {
    inner: Arc<BusInner>,
}

impl FillImageBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// The handler stays registered until the returned `Subscription` is dropped.
    #[must_use = "dropping the subscription unsubscribes immediately"]
    pub fn subscribe<F>(&self, handler: F) -> Subscription
    where
        F: Fn(&FillImageEvent) + Send + Sync + 'static,
    {
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        let mut handlers = self
            .inner
            .handlers
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        handlers.push((id, Arc::new(handler)));
        Subscription {
            id,
            bus: Arc::downgrade(&self.inner),
        }
    }

    pub fn publish(&self, event: &FillImageEvent) {
        // Handlers run outside the lock so they may subscribe or unsubscribe.
        let snapshot: Vec<Handler> = {
            let handlers = self
                .inner
                .handlers
                .lock()
                .unwrap_or_else(PoisonError::into_inner);
            handlers.iter().map(|(_, h)| Arc::clone(h)).collect()
        };
        for handler in snapshot {
            handler(event);
        }
    }

    pub fn subscriber_count(&self) -> usize {
        self.inner
            .handlers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }
}

pub struct Subscription {
    id: u64,
    bus: Weak<BusInner>,
}

impl Drop for Subscription {
    fn drop(&mut self) {
        let Some(bus) = self.bus.upgrade() else {
            return;
        };
        let mut handlers = bus.handlers.lock().unwrap_or_else(PoisonError::into_inner);
        handlers.retain(|(id, _)| *id != self.id);
    }
}
