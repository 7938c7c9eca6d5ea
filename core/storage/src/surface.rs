//! Interactive consent surface contract.
//!
//! The session manager opens a navigable window at the consent URL and
//! watches its navigation attempts for the provider redirect. Hosts plug
//! in an embedded browser, a loopback listener or anything else that can
//! report navigations and closure.

use async_trait::async_trait;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;

use lexisync_common::{Error, Result};

/// Event reported by an open consent surface.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SurfaceEvent {
    /// The surface is about to navigate to the given URL.
    Navigating(String),
    /// The surface was dismissed.
    Closed,
}

/// How the consent surface is presented.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SurfaceOptions {
    /// Handle of the owning window, if any.
    pub parent: Option<String>,
    /// Whether the surface blocks its parent.
    pub modal: bool,
}

impl Default for SurfaceOptions {
    fn default() -> Self {
        Self {
            parent: None,
            modal: true,
        }
    }
}

/// An open consent surface.
#[async_trait]
pub trait SurfaceHandle: Send {
    /// Wait for the next event. Returns `Closed` once the surface is gone.
    async fn next_event(&mut self) -> SurfaceEvent;

    /// Close the surface. Idempotent.
    async fn close(&mut self);
}

/// Opens consent surfaces.
#[async_trait]
pub trait InteractiveSurface: Send + Sync {
    /// Open a surface at `url`.
    async fn open(&self, url: &str, options: &SurfaceOptions) -> Result<Box<dyn SurfaceHandle>>;
}

/// Host-side view of a surface opened by [`ChannelSurface`].
///
/// Dropping it is equivalent to the user closing the window.
#[derive(Debug)]
pub struct OpenedSurface {
    pub url: String,
    pub options: SurfaceOptions,
    events: mpsc::UnboundedSender<SurfaceEvent>,
    closed: Arc<AtomicBool>,
}

impl OpenedSurface {
    /// Report a navigation attempt.
    pub fn navigate(&self, url: impl Into<String>) {
        let _ = self.events.send(SurfaceEvent::Navigating(url.into()));
    }

    /// Report that the user dismissed the window.
    pub fn dismiss(&self) {
        let _ = self.events.send(SurfaceEvent::Closed);
    }

    /// Whether the session side closed the surface.
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

/// Channel-driven surface.
///
/// Every `open` call hands an [`OpenedSurface`] to the host through the
/// receiver returned by [`ChannelSurface::new`]; the host then feeds
/// navigation events into it.
pub struct ChannelSurface {
    opened: mpsc::UnboundedSender<OpenedSurface>,
}

impl ChannelSurface {
    /// Create a surface and the receiver of opened windows.
    pub fn new() -> (Self, mpsc::UnboundedReceiver<OpenedSurface>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { opened: tx }, rx)
    }
}

struct ChannelSurfaceHandle {
    events: mpsc::UnboundedReceiver<SurfaceEvent>,
    closed: Arc<AtomicBool>,
}

#[async_trait]
impl SurfaceHandle for ChannelSurfaceHandle {
    async fn next_event(&mut self) -> SurfaceEvent {
        if self.closed.load(Ordering::SeqCst) {
            return SurfaceEvent::Closed;
        }
        self.events.recv().await.unwrap_or(SurfaceEvent::Closed)
    }

    async fn close(&mut self) {
        self.closed.store(true, Ordering::SeqCst);
        self.events.close();
    }
}

#[async_trait]
impl InteractiveSurface for ChannelSurface {
    async fn open(&self, url: &str, options: &SurfaceOptions) -> Result<Box<dyn SurfaceHandle>> {
        let (tx, rx) = mpsc::unbounded_channel();
        let closed = Arc::new(AtomicBool::new(false));

        self.opened
            .send(OpenedSurface {
                url: url.to_string(),
                options: options.clone(),
                events: tx,
                closed: closed.clone(),
            })
            .map_err(|_| Error::InvalidInput("Consent surface host is gone".to_string()))?;

        Ok(Box::new(ChannelSurfaceHandle { events: rx, closed }))
    }
}
