//! Change-notification transport port.
//!
//! The realtime core never sees a wire format: it asks a [`ChangeNotifier`]
//! for typed subscriptions and gets back a queue plus a [`ReleaseGuard`]. The
//! guard is the subscription's lifetime; dropping it releases the underlying
//! transport resource exactly once.

pub mod local;

pub use local::LocalNotifier;

use async_trait::async_trait;
use tokio::sync::mpsc;

use studyhall_chats::{ChangeEvent, ChannelName, ChatResult, EventFilter, PresenceEvent, PresenceMeta, UserId};

/// Runs a release action exactly once, on drop or on [`ReleaseGuard::release`].
pub struct ReleaseGuard {
    release: Option<Box<dyn FnOnce() + Send>>,
}

impl ReleaseGuard {
    pub fn new(release: impl FnOnce() + Send + 'static) -> Self {
        Self {
            release: Some(Box::new(release)),
        }
    }

    /// A guard with nothing to release.
    pub fn noop() -> Self {
        Self { release: None }
    }

    pub fn release(mut self) {
        self.run();
    }

    fn run(&mut self) {
        if let Some(release) = self.release.take() {
            release();
        }
    }
}

impl Drop for ReleaseGuard {
    fn drop(&mut self) {
        self.run();
    }
}

impl std::fmt::Debug for ReleaseGuard {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReleaseGuard")
            .field("armed", &self.release.is_some())
            .finish()
    }
}

/// A live subscription: an event queue and the guard that owns it.
#[derive(Debug)]
pub struct Subscription<T> {
    channel: ChannelName,
    events: mpsc::UnboundedReceiver<T>,
    guard: ReleaseGuard,
}

pub type ChangeSubscription = Subscription<ChangeEvent>;
pub type PresenceSubscription = Subscription<PresenceEvent>;

impl<T> Subscription<T> {
    pub fn new(channel: ChannelName, events: mpsc::UnboundedReceiver<T>, guard: ReleaseGuard) -> Self {
        Self { channel, events, guard }
    }

    pub fn channel(&self) -> ChannelName {
        self.channel
    }

    pub async fn recv(&mut self) -> Option<T> {
        self.events.recv().await
    }

    /// Split into the queue and its guard so they can live in different owners.
    pub fn into_parts(self) -> (mpsc::UnboundedReceiver<T>, ReleaseGuard) {
        (self.events, self.guard)
    }
}

/// Publish/subscribe transport for row changes and presence.
#[async_trait]
pub trait ChangeNotifier: Send + Sync + 'static {
    /// Subscribe to row changes on a channel, narrowed by `filter`.
    async fn subscribe(&self, channel: ChannelName, filter: EventFilter) -> ChatResult<ChangeSubscription>;

    /// Join a channel's presence set. The first event delivered is a `Sync`.
    async fn join_presence(&self, channel: ChannelName, user_id: UserId) -> ChatResult<PresenceSubscription>;

    /// Publish the caller's presence state on a channel.
    async fn track(&self, channel: ChannelName, meta: PresenceMeta) -> ChatResult<()>;
}
