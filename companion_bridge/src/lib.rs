mod cache;
mod config;
mod dispatcher;
mod error;
mod events;
mod image;
mod net;
mod plugin;
mod session;
mod surfaces;

pub use companion_protocol as protocol;

pub use crate::cache::{resolve_key, CacheError, CacheKey, ImageCache};
pub use crate::config::{BridgeConfig, DEFAULT_BACKOFF, DEFAULT_URL};
pub use crate::dispatcher::{dispatch_text, Dispatched};
pub use crate::error::BridgeError;
pub use crate::events::{FillImageBus, FillImageEvent, Subscription};
pub use crate::image::Bitmap;
pub use crate::plugin::CompanionPlugin;
pub use crate::session::{
    CommandSink, Session, SessionState, SessionStatus, StatusLevel, STATUS_CAP,
};
pub use crate::surfaces::{
    ButtonGrid, ButtonImage, FolderKind, FolderSurface, ImageNotifier, ProfileAction, TouchEvent,
    PAGE_ADJUSTMENT, PAGE_SLOT,
};
