use crate::config::BridgeConfig;
use crate::error::BridgeError;
use crate::session::{CommandSink, Session, SessionStatus};
use crate::surfaces::{ButtonGrid, FolderKind, FolderSurface, ImageNotifier};
use crossbeam_channel::{Receiver, TryRecvError};
use std::sync::Arc;
use tracing::info;

/// Host-facing entry point: owns the session and hands out input surfaces
/// wired to it.
pub struct CompanionPlugin {
    session: Arc<Session>,
    status_rx: Receiver<SessionStatus>,
}

impl CompanionPlugin {
    pub fn new(config: BridgeConfig) -> Self {
        let (session, status_rx) = Session::new(config);
        Self {
            session: Arc::new(session),
            status_rx,
        }
    }

    pub fn load(&self) -> Result<(), BridgeError> {
        info!(url = %self.session.config().url, "loading companion plugin");
        self.session.start()
    }

    pub fn unload(&self) {
        info!("unloading companion plugin");
        self.session.stop();
    }

    pub fn session(&self) -> &Arc<Session> {
        &self.session
    }

    pub fn sink(&self) -> Arc<dyn CommandSink> {
        Arc::clone(&self.session) as Arc<dyn CommandSink>
    }

    pub fn statuses(&self) -> &Receiver<SessionStatus> {
        &self.status_rx
    }

    /// Drains pending statuses and returns the most recent one, for hosts
    /// that only show the current state.
    pub fn latest_status(&self) -> Option<SessionStatus> {
        let mut latest = None;
        loop {
            match self.status_rx.try_recv() {
                Ok(status) => latest = Some(status),
                Err(TryRecvError::Empty) | Err(TryRecvError::Disconnected) => break,
            }
        }
        latest
    }

    pub fn button_grid(&self, notifier: Arc<dyn ImageNotifier>) -> ButtonGrid {
        ButtonGrid::new(self.sink(), self.session.fill_images(), notifier)
    }

    pub fn folder(&self, kind: FolderKind, notifier: Arc<dyn ImageNotifier>) -> FolderSurface {
        FolderSurface::new(kind, self.sink(), self.session.fill_images(), notifier)
    }
}

impl Drop for CompanionPlugin {
    fn drop(&mut self) {
        self.session.stop();
    }
}
