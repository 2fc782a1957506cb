use crate::events::{FillImageBus, FillImageEvent, Subscription};
use crate::image::Bitmap;
use companion_protocol::{ButtonAddress, DecodeError, FillImage, FLAT_SLOTS};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, PoisonError, RwLock};
use thiserror::Error;
use tracing::debug;

/// Where a button image lives: the flat dynamic-folder tier (0..34) or the
/// paged grid (page 1..100, bank 0..32).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CacheKey {
    Flat(u32),
    Grid(ButtonAddress),
}

impl CacheKey {
    /// `bank` overrides `key_index`. Page 0 is the dynamic page and folds
    /// into the flat tier.
    pub fn resolve(page: Option<u32>, bank: Option<u32>, key_index: u32) -> Self {
        let index = bank.unwrap_or(key_index);
        match page {
            None => CacheKey::Flat(index),
            Some(page) => CacheKey::from_address(ButtonAddress::new(page, index)),
        }
    }

    pub fn from_address(address: ButtonAddress) -> Self {
        if address.is_dynamic() {
            CacheKey::Flat(address.bank)
        } else {
            CacheKey::Grid(address)
        }
    }

    pub fn address(&self) -> ButtonAddress {
        match self {
            CacheKey::Flat(index) => ButtonAddress::dynamic(*index),
            CacheKey::Grid(address) => *address,
        }
    }

    pub fn in_range(&self) -> bool {
        match self {
            CacheKey::Flat(index) => *index < FLAT_SLOTS,
            CacheKey::Grid(address) => address.in_grid(),
        }
    }
}

pub fn resolve_key(fill: &FillImage) -> CacheKey {
    CacheKey::resolve(fill.page, fill.bank, fill.key_index)
}

impl FillImageEvent {
    pub fn cache_key(&self) -> CacheKey {
        CacheKey::resolve(self.page, self.bank, self.key_index)
    }
}

#[derive(Debug, Error)]
pub enum CacheError {
    #[error("cache key {0:?} is outside the address space")]
    OutOfRange(CacheKey),
    #[error(transparent)]
    Decode(#[from] DecodeError),
}

type ChangeListener = Box<dyn Fn(CacheKey) + Send + Sync>;

/// Two-tier button image store. Every slot holds an `Arc<Bitmap>` that is
/// replaced whole, so a reader never sees a partially written image.
pub struct ImageCache {
    flat: Vec<RwLock<Arc<Bitmap>>>,
    flat_filled: Vec<AtomicBool>,
    grid: RwLock<HashMap<ButtonAddress, Arc<Bitmap>>>,
    on_change: ChangeListener,
}

impl Default for ImageCache {
    fn default() -> Self {
        Self::new()
    }
}

impl ImageCache {
    pub fn new() -> Self {
        Self::with_listener(|_| {})
    }

    pub fn with_listener<F>(on_change: F) -> Self
    where
        F: Fn(CacheKey) + Send + Sync + 'static,
    {
        let black = Arc::new(Bitmap::black());
        Self {
            flat: (0..FLAT_SLOTS)
                .map(|_| RwLock::new(Arc::clone(&black)))
                .collect(),
            flat_filled: (0..FLAT_SLOTS).map(|_| AtomicBool::new(false)).collect(),
            grid: RwLock::new(HashMap::new()),
            on_change: Box::new(on_change),
        }
    }

    /// Feeds every fill-image event on `bus` into this cache until the
    /// subscription is dropped.
    pub fn attach(self: &Arc<Self>, bus: &FillImageBus) -> Subscription {
        self.attach_where(bus, |_| true)
    }

    /// Like `attach`, but only keys accepted by `keep` are stored.
    pub fn attach_where<P>(self: &Arc<Self>, bus: &FillImageBus, keep: P) -> Subscription
    where
        P: Fn(&CacheKey) -> bool + Send + Sync + 'static,
    {
        let cache = Arc::downgrade(self);
        bus.subscribe(move |event| {
            let Some(cache) = cache.upgrade() else {
                return;
            };
            if !keep(&event.cache_key()) {
                return;
            }
            if let Err(e) = cache.apply(event) {
                debug!(error = %e, "fill image not cached");
            }
        })
    }

    pub fn apply(&self, event: &FillImageEvent) -> Result<CacheKey, CacheError> {
        let key = event.cache_key();
        self.update(key, &event.pixels)?;
        Ok(key)
    }

    /// Overwrites the slot for `key`, creating it on first use.
    pub fn update(&self, key: CacheKey, pixels: &[u8]) -> Result<(), CacheError> {
        if !key.in_range() {
            return Err(CacheError::OutOfRange(key));
        }
        let bitmap = Arc::new(Bitmap::from_rgb(pixels)?);

        match key {
            CacheKey::Flat(index) => {
                let Some(slot) = self.flat.get(index as usize) else {
                    return Err(CacheError::OutOfRange(key));
                };
                *slot.write().unwrap_or_else(PoisonError::into_inner) = bitmap;
                if let Some(filled) = self.flat_filled.get(index as usize) {
                    filled.store(true, Ordering::Release);
                }
            }
            CacheKey::Grid(address) => {
                self.grid
                    .write()
                    .unwrap_or_else(PoisonError::into_inner)
                    .insert(address, bitmap);
            }
        }

        (self.on_change)(key);
        Ok(())
    }

    /// Flat slots always hit (they start black); grid slots miss until the
    /// controller has filled them.
    pub fn lookup(&self, key: CacheKey) -> Option<Arc<Bitmap>> {
        match key {
            CacheKey::Flat(index) => self
                .flat
                .get(index as usize)
                .map(|slot| slot.read().unwrap_or_else(PoisonError::into_inner).clone()),
            CacheKey::Grid(address) => self
                .grid
                .read()
                .unwrap_or_else(PoisonError::into_inner)
                .get(&address)
                .cloned(),
        }
    }

    /// Like `lookup`, but a flat slot only hits once the controller has
    /// filled it.
    pub fn received(&self, key: CacheKey) -> Option<Arc<Bitmap>> {
        if let CacheKey::Flat(index) = key {
            let filled = self
                .flat_filled
                .get(index as usize)
                .is_some_and(|f| f.load(Ordering::Acquire));
            if !filled {
                return None;
            }
        }
        self.lookup(key)
    }

    pub fn grid_len(&self) -> usize {
        self.grid
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }
}
