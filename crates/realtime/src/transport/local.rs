//! In-process change notifier.
//!
//! Routes published row changes to matching subscribers and keeps a presence
//! set per channel. Used by tests and single-process deployments; a network
//! transport implements the same [`ChangeNotifier`] port.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};

use async_trait::async_trait;
use tokio::sync::mpsc;
use tracing::{debug, trace};

use studyhall_chats::{
    ChangeEvent, ChangePublisher, ChannelName, ChatError, ChatResult, EventFilter, PresenceEvent,
    PresenceMeta, UserId,
};

use super::{ChangeNotifier, ChangeSubscription, PresenceSubscription, ReleaseGuard, Subscription};

struct ChangeSubscriber {
    id: u64,
    filter: EventFilter,
    tx: mpsc::UnboundedSender<ChangeEvent>,
}

struct PresenceSubscriber {
    id: u64,
    user_id: UserId,
    tx: mpsc::UnboundedSender<PresenceEvent>,
}

#[derive(Default)]
struct LocalState {
    changes: HashMap<ChannelName, Vec<ChangeSubscriber>>,
    presence_subscribers: HashMap<ChannelName, Vec<PresenceSubscriber>>,
    presence: HashMap<ChannelName, HashMap<UserId, PresenceMeta>>,
}

impl LocalState {
    fn broadcast_presence(&mut self, channel: &ChannelName, event: PresenceEvent) {
        if let Some(subscribers) = self.presence_subscribers.get_mut(channel) {
            subscribers.retain(|subscriber| subscriber.tx.send(event.clone()).is_ok());
        }
    }

    fn snapshot(&self, channel: &ChannelName) -> PresenceEvent {
        let mut present: Vec<PresenceMeta> = self
            .presence
            .get(channel)
            .map(|metas| metas.values().cloned().collect())
            .unwrap_or_default();
        present.sort_by_key(|meta| meta.user_id);
        PresenceEvent::Sync { present }
    }
}

struct LocalInner {
    available: AtomicBool,
    next_id: AtomicU64,
    state: Mutex<LocalState>,
}

impl LocalInner {
    fn state(&self) -> MutexGuard<'_, LocalState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn ensure_available(&self, channel: &ChannelName) -> ChatResult<()> {
        if self.available.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(ChatError::transport(format!("cannot reach notifier for {}", channel)))
        }
    }

    fn remove_change_subscriber(&self, channel: &ChannelName, id: u64) {
        let mut state = self.state();
        if let Some(subscribers) = state.changes.get_mut(channel) {
            subscribers.retain(|subscriber| subscriber.id != id);
            if subscribers.is_empty() {
                state.changes.remove(channel);
            }
        }
        trace!(%channel, id, "change subscription released");
    }

    fn remove_presence_subscriber(&self, channel: &ChannelName, id: u64, user_id: UserId) {
        let mut state = self.state();
        let still_present = match state.presence_subscribers.get_mut(channel) {
            Some(subscribers) => {
                subscribers.retain(|subscriber| subscriber.id != id);
                subscribers.iter().any(|subscriber| subscriber.user_id == user_id)
            }
            None => false,
        };

        if !still_present {
            let removed = state
                .presence
                .get_mut(channel)
                .and_then(|metas| metas.remove(&user_id))
                .is_some();
            if removed {
                state.broadcast_presence(channel, PresenceEvent::Leave { user_id });
            }
        }
        trace!(%channel, id, %user_id, "presence subscription released");
    }
}

/// In-process [`ChangeNotifier`] and [`ChangePublisher`].
#[derive(Clone)]
pub struct LocalNotifier {
    inner: Arc<LocalInner>,
}

impl LocalNotifier {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(LocalInner {
                available: AtomicBool::new(true),
                next_id: AtomicU64::new(1),
                state: Mutex::new(LocalState::default()),
            }),
        }
    }

    /// Simulate the transport going away (`false`) or coming back (`true`).
    ///
    /// Going away also closes every live queue, as a dropped connection would.
    pub fn set_available(&self, available: bool) {
        self.inner.available.store(available, Ordering::SeqCst);
        if !available {
            let mut state = self.inner.state();
            state.changes.clear();
            state.presence_subscribers.clear();
            state.presence.clear();
            debug!("local notifier disconnected all subscribers");
        }
    }

    /// Number of live row-change subscriptions across all channels.
    pub fn active_subscriptions(&self) -> usize {
        self.inner.state().changes.values().map(Vec::len).sum()
    }

    /// Number of live row-change subscriptions on one channel.
    pub fn subscriptions_on(&self, channel: &ChannelName) -> usize {
        self.inner.state().changes.get(channel).map_or(0, Vec::len)
    }

    /// Number of live presence subscriptions across all channels.
    pub fn active_presence(&self) -> usize {
        self.inner.state().presence_subscribers.values().map(Vec::len).sum()
    }

    /// Broadcast the channel's full presence state to every member.
    pub fn resync(&self, channel: &ChannelName) {
        let mut state = self.inner.state();
        let snapshot = state.snapshot(channel);
        state.broadcast_presence(channel, snapshot);
    }

    /// Deliver a raw presence event, bypassing the tracked state.
    pub fn inject_presence(&self, channel: &ChannelName, event: PresenceEvent) {
        self.inner.state().broadcast_presence(channel, event);
    }

    fn next_id(&self) -> u64 {
        self.inner.next_id.fetch_add(1, Ordering::Relaxed)
    }
}

impl Default for LocalNotifier {
    fn default() -> Self {
        Self::new()
    }
}

impl ChangePublisher for LocalNotifier {
    fn publish(&self, channel: &ChannelName, event: ChangeEvent) {
        let mut state = self.inner.state();
        if let Some(subscribers) = state.changes.get_mut(channel) {
            subscribers.retain(|subscriber| {
                !subscriber.filter.matches(&event) || subscriber.tx.send(event.clone()).is_ok()
            });
        }
    }
}

#[async_trait]
impl ChangeNotifier for LocalNotifier {
    async fn subscribe(&self, channel: ChannelName, filter: EventFilter) -> ChatResult<ChangeSubscription> {
        self.inner.ensure_available(&channel)?;

        let id = self.next_id();
        let (tx, rx) = mpsc::unbounded_channel();
        self.inner
            .state()
            .changes
            .entry(channel)
            .or_default()
            .push(ChangeSubscriber { id, filter, tx });

        let weak: Weak<LocalInner> = Arc::downgrade(&self.inner);
        let guard = ReleaseGuard::new(move || {
            if let Some(inner) = weak.upgrade() {
                inner.remove_change_subscriber(&channel, id);
            }
        });
        debug!(%channel, id, ?filter, "change subscription opened");
        Ok(Subscription::new(channel, rx, guard))
    }

    async fn join_presence(&self, channel: ChannelName, user_id: UserId) -> ChatResult<PresenceSubscription> {
        self.inner.ensure_available(&channel)?;

        let id = self.next_id();
        let (tx, rx) = mpsc::unbounded_channel();
        {
            let mut state = self.inner.state();
            let snapshot = state.snapshot(&channel);
            // a closed receiver here is impossible: we still own it
            let _ = tx.send(snapshot);
            state
                .presence_subscribers
                .entry(channel)
                .or_default()
                .push(PresenceSubscriber { id, user_id, tx });
        }

        let weak: Weak<LocalInner> = Arc::downgrade(&self.inner);
        let guard = ReleaseGuard::new(move || {
            if let Some(inner) = weak.upgrade() {
                inner.remove_presence_subscriber(&channel, id, user_id);
            }
        });
        debug!(%channel, id, %user_id, "presence joined");
        Ok(Subscription::new(channel, rx, guard))
    }

    async fn track(&self, channel: ChannelName, meta: PresenceMeta) -> ChatResult<()> {
        self.inner.ensure_available(&channel)?;

        let mut state = self.inner.state();
        state
            .presence
            .entry(channel)
            .or_default()
            .insert(meta.user_id, meta.clone());
        state.broadcast_presence(&channel, PresenceEvent::Join { meta });
        Ok(())
    }
}
