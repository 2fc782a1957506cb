use crate::cache::{CacheKey, ImageCache};
use crate::events::{FillImageBus, Subscription};
use crate::image::Bitmap;
use crate::session::CommandSink;
use companion_protocol::{ButtonAddress, OutboundCommand, BANK_COUNT, PAGE_COUNT};
use std::collections::HashSet;
use std::sync::{Arc, Mutex, PoisonError};
use tracing::trace;

/// Host callbacks telling the UI to repaint an action.
pub trait ImageNotifier: Send + Sync {
    fn command_image_changed(&self, action: &str);

    fn adjustment_image_changed(&self, _action: &str) {}
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TouchEvent {
    Press,
    Release,
}

#[derive(Debug, Clone)]
pub enum ButtonImage {
    Bitmap(Arc<Bitmap>),
    /// Not received yet; a fetch has been requested where applicable.
    Missing,
    Disconnected,
}

impl ButtonImage {
    /// Missing images render red, disconnected ones black.
    pub fn to_bitmap(&self) -> Arc<Bitmap> {
        match self {
            ButtonImage::Bitmap(bitmap) => Arc::clone(bitmap),
            ButtonImage::Missing => Arc::new(Bitmap::filled([0xFF, 0x00, 0x00])),
            ButtonImage::Disconnected => Arc::new(Bitmap::black()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProfileAction {
    pub parameter: String,
    pub display_name: String,
    pub group: String,
}

fn send_touch(sink: &dyn CommandSink, address: ButtonAddress, event: TouchEvent) {
    let target = address.target();
    let cmd = match event {
        TouchEvent::Press => OutboundCommand::keydown(target),
        TouchEvent::Release => OutboundCommand::keyup(target),
    };
    sink.send_command(cmd);
}

/// Any controller button, addressed as `"<page>|<bank>"`.
pub struct ButtonGrid {
    sink: Arc<dyn CommandSink>,
    cache: Arc<ImageCache>,
    requested: Mutex<HashSet<ButtonAddress>>,
    _subscription: Subscription,
}

impl ButtonGrid {
    pub const DISPLAY_NAME: &'static str = "Companion button";

    pub fn new(
        sink: Arc<dyn CommandSink>,
        bus: &FillImageBus,
        notifier: Arc<dyn ImageNotifier>,
    ) -> Self {
        let cache = Arc::new(ImageCache::with_listener(move |key| {
            notifier.command_image_changed(&key.address().to_string());
        }));
        let subscription = cache.attach(bus);
        Self {
            sink,
            cache,
            requested: Mutex::new(HashSet::new()),
            _subscription: subscription,
        }
    }

    pub fn cache(&self) -> &ImageCache {
        &self.cache
    }

    pub fn touch(&self, action: &str, event: TouchEvent) {
        let Ok(address) = action.parse::<ButtonAddress>() else {
            trace!(%action, "ignoring touch on malformed action");
            return;
        };
        send_touch(self.sink.as_ref(), address, event);
    }

    /// A tap without a physical touch: press immediately followed by release.
    pub fn run_command(&self, action: &str) {
        self.touch(action, TouchEvent::Press);
        self.touch(action, TouchEvent::Release);
    }

    /// `None` when `action` is not a valid grid address. Dynamic buttons are
    /// `Missing` until their first push. A miss on a paged button asks the
    /// controller for it once, through the connect-command queue so the
    /// request outlives a reconnect.
    pub fn image(&self, action: &str) -> Option<ButtonImage> {
        let address = action.parse::<ButtonAddress>().ok()?;
        let key = CacheKey::from_address(address);
        if !key.in_range() {
            return None;
        }
        if !self.sink.is_connected() {
            return Some(ButtonImage::Disconnected);
        }

        if let Some(bitmap) = self.cache.received(key) {
            return Some(ButtonImage::Bitmap(bitmap));
        }

        if !address.is_dynamic() {
            let first_request = self
                .requested
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .insert(address);
            if first_request {
                self.sink
                    .on_connect_command(OutboundCommand::request_button(address));
            }
        }
        Some(ButtonImage::Missing)
    }

    /// The dynamic page followed by pages 1..=99, 32 buttons each.
    pub fn profile_actions() -> Vec<ProfileAction> {
        let mut actions = Vec::with_capacity((PAGE_COUNT * BANK_COUNT) as usize);
        for page in 0..PAGE_COUNT {
            let group = if page == 0 {
                "Page dynamic".to_string()
            } else {
                format!("Page {page}")
            };
            for bank in 0..BANK_COUNT {
                actions.push(ProfileAction {
                    parameter: ButtonAddress::new(page, bank).to_string(),
                    display_name: format!("{group}, button {}", bank + 1),
                    group: group.clone(),
                });
            }
        }
        actions
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FolderKind {
    Dynamic,
    /// Offset by one column; the encoder pages up and down.
    Shifted,
}

/// Flat slot showing the current page number.
pub const PAGE_SLOT: u32 = 8;
const PAGE_UP_KEY: u32 = 0;
const PAGE_DOWN_KEY: u32 = 16;
pub const PAGE_ADJUSTMENT: &str = "page";

/// Folder view over the dynamic tier, actions named by flat index.
pub struct FolderSurface {
    kind: FolderKind,
    sink: Arc<dyn CommandSink>,
    cache: Arc<ImageCache>,
    _subscription: Subscription,
}

impl FolderSurface {
    pub fn new(
        kind: FolderKind,
        sink: Arc<dyn CommandSink>,
        bus: &FillImageBus,
        notifier: Arc<dyn ImageNotifier>,
    ) -> Self {
        let cache = Arc::new(ImageCache::with_listener(move |key| {
            let CacheKey::Flat(index) = key else { return };
            if kind == FolderKind::Shifted && index == PAGE_SLOT {
                notifier.adjustment_image_changed(PAGE_ADJUSTMENT);
            } else {
                notifier.command_image_changed(&index.to_string());
            }
        }));
        let subscription = cache.attach_where(bus, |key| matches!(key, CacheKey::Flat(_)));
        Self {
            kind,
            sink,
            cache,
            _subscription: subscription,
        }
    }

    pub fn kind(&self) -> FolderKind {
        self.kind
    }

    pub fn display_name(&self) -> &'static str {
        match self.kind {
            FolderKind::Dynamic => "Companion",
            FolderKind::Shifted => "Companion Shifted",
        }
    }

    pub fn button_actions(&self) -> &'static [u32] {
        match self.kind {
            FolderKind::Dynamic => &[0, 1, 2, 3, 8, 9, 10, 11, 16, 17, 18, 19],
            FolderKind::Shifted => &[1, 2, 3, 4, 9, 10, 11, 12, 17, 18, 19, 20],
        }
    }

    pub fn cache(&self) -> &ImageCache {
        &self.cache
    }

    pub fn touch(&self, action: &str, event: TouchEvent) {
        let Some(index) = parse_index(action) else {
            return;
        };
        send_touch(self.sink.as_ref(), ButtonAddress::dynamic(index), event);
    }

    pub fn image(&self, action: &str) -> Option<ButtonImage> {
        let index = parse_index(action)?;
        if !self.sink.is_connected() {
            return Some(ButtonImage::Disconnected);
        }
        self.cache
            .lookup(CacheKey::Flat(index))
            .map(ButtonImage::Bitmap)
    }

    /// Encoder rotation pages the controller: left presses the page-down
    /// key, right the page-up key.
    pub fn apply_adjustment(&self, diff: i32) {
        if self.kind != FolderKind::Shifted {
            return;
        }
        let key_index = match diff {
            d if d < 0 => PAGE_DOWN_KEY,
            d if d > 0 => PAGE_UP_KEY,
            _ => return,
        };
        self.sink.send_command(OutboundCommand::keydown(
            ButtonAddress::dynamic(key_index).target(),
        ));
    }

    pub fn adjustment_image(&self, action: &str) -> Option<ButtonImage> {
        if self.kind != FolderKind::Shifted || action != PAGE_ADJUSTMENT {
            return None;
        }
        if !self.sink.is_connected() {
            return Some(ButtonImage::Disconnected);
        }
        self.cache
            .lookup(CacheKey::Flat(PAGE_SLOT))
            .map(ButtonImage::Bitmap)
    }
}

fn parse_index(action: &str) -> Option<u32> {
    action.trim().parse().ok()
}
