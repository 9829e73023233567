//! Typing indicators.
//!
//! [`TypingCoordinator`] turns local keystrokes into at most one start and one
//! stop signal per burst. [`RemoteTypers`] tracks who else is typing, with
//! expiry computed when the set is read.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio::time::{sleep_until, Instant};
use tracing::{debug, warn};

use studyhall_chats::{
    ChannelName, ChatResult, ConversationId, ConversationStore, PresenceEvent, PresenceMeta, UserId,
};

use crate::transport::ChangeNotifier;

/// Default idle window before a typing burst is considered over.
pub const DEFAULT_TYPING_IDLE: Duration = Duration::from_millis(3000);

/// Outbound typing signals for the local user.
#[async_trait]
pub trait TypingSignaller: Send + Sync + 'static {
    async fn start_typing(&self, conversation_id: ConversationId) -> ChatResult<()>;

    async fn stop_typing(&self, conversation_id: ConversationId) -> ChatResult<()>;
}

/// Signals typing through presence, with the store's typing endpoints as the
/// fallback path.
pub struct StoreTypingSignaller {
    user_id: UserId,
    store: Arc<dyn ConversationStore>,
    notifier: Arc<dyn ChangeNotifier>,
}

impl StoreTypingSignaller {
    pub fn new(user_id: UserId, store: Arc<dyn ConversationStore>, notifier: Arc<dyn ChangeNotifier>) -> Self {
        Self {
            user_id,
            store,
            notifier,
        }
    }
}

#[async_trait]
impl TypingSignaller for StoreTypingSignaller {
    async fn start_typing(&self, conversation_id: ConversationId) -> ChatResult<()> {
        let presence = self
            .notifier
            .track(ChannelName::conversation(conversation_id), PresenceMeta::typing(self.user_id))
            .await;
        let fallback = self.store.start_typing(conversation_id, self.user_id).await;
        presence.and(fallback)
    }

    async fn stop_typing(&self, conversation_id: ConversationId) -> ChatResult<()> {
        let presence = self
            .notifier
            .track(ChannelName::conversation(conversation_id), PresenceMeta::idle(self.user_id))
            .await;
        let fallback = self.store.stop_typing(conversation_id, self.user_id).await;
        presence.and(fallback)
    }
}

enum TypingState {
    Idle,
    Active {
        generation: u64,
        deadline: Instant,
        timer: JoinHandle<()>,
    },
}

struct TypingInner {
    conversation_id: ConversationId,
    idle: Duration,
    signaller: Arc<dyn TypingSignaller>,
    generation: AtomicU64,
    // held across signal emission so a start and a stop never reorder
    state: Mutex<TypingState>,
}

impl Drop for TypingInner {
    fn drop(&mut self) {
        let TypingState::Active { timer, .. } = std::mem::replace(self.state.get_mut(), TypingState::Idle) else {
            return;
        };
        timer.abort();

        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            return;
        };
        let signaller = self.signaller.clone();
        let conversation_id = self.conversation_id;
        runtime.spawn(async move {
            if let Err(error) = signaller.stop_typing(conversation_id).await {
                warn!(%conversation_id, %error, "typing stop on teardown failed");
            }
        });
    }
}

/// Local typing state machine for one conversation.
///
/// `Idle --keystroke--> Active` emits start and arms the idle timer; further
/// keystrokes only push the deadline out. Timer expiry or [`stop`](Self::stop)
/// emits stop and returns to `Idle`. Each timer carries the generation it was
/// armed for, so a timer from an older burst can never stop a newer one.
#[derive(Clone)]
pub struct TypingCoordinator {
    inner: Arc<TypingInner>,
}

impl TypingCoordinator {
    pub fn new(conversation_id: ConversationId, idle: Duration, signaller: Arc<dyn TypingSignaller>) -> Self {
        Self {
            inner: Arc::new(TypingInner {
                conversation_id,
                idle,
                signaller,
                generation: AtomicU64::new(0),
                state: Mutex::new(TypingState::Idle),
            }),
        }
    }

    pub fn conversation_id(&self) -> ConversationId {
        self.inner.conversation_id
    }

    pub async fn is_active(&self) -> bool {
        matches!(*self.inner.state.lock().await, TypingState::Active { .. })
    }

    /// Register local typing activity.
    ///
    /// A failed start leaves the coordinator idle so the next keystroke retries.
    pub async fn keystroke(&self) -> ChatResult<()> {
        let mut state = self.inner.state.lock().await;
        let deadline = Instant::now() + self.inner.idle;

        if let TypingState::Active { deadline: current, .. } = &mut *state {
            *current = deadline;
            return Ok(());
        }

        self.inner.signaller.start_typing(self.inner.conversation_id).await?;
        let generation = self.inner.generation.fetch_add(1, Ordering::Relaxed) + 1;
        let timer = tokio::spawn(run_timer(Arc::downgrade(&self.inner), generation));
        *state = TypingState::Active {
            generation,
            deadline,
            timer,
        };
        debug!(conversation_id = %self.inner.conversation_id, generation, "typing started");
        Ok(())
    }

    /// Explicit stop: cancels the timer and emits stop if a burst is running.
    pub async fn stop(&self) -> ChatResult<()> {
        let mut state = self.inner.state.lock().await;
        match std::mem::replace(&mut *state, TypingState::Idle) {
            TypingState::Idle => Ok(()),
            TypingState::Active { timer, generation, .. } => {
                timer.abort();
                debug!(conversation_id = %self.inner.conversation_id, generation, "typing stopped");
                self.inner.signaller.stop_typing(self.inner.conversation_id).await
            }
        }
    }

    /// Best-effort stop when the view goes away. Failures are logged.
    pub async fn shutdown(&self) {
        if let Err(error) = self.stop().await {
            warn!(conversation_id = %self.inner.conversation_id, %error, "typing stop on teardown failed");
        }
    }
}

async fn run_timer(inner: Weak<TypingInner>, generation: u64) {
    loop {
        let deadline = {
            let Some(inner) = inner.upgrade() else {
                return;
            };
            let mut state = inner.state.lock().await;
            let deadline = match &*state {
                TypingState::Active {
                    generation: current,
                    deadline,
                    ..
                } if *current == generation => *deadline,
                _ => return,
            };
            if Instant::now() < deadline {
                deadline
            } else {
                *state = TypingState::Idle;
                debug!(conversation_id = %inner.conversation_id, generation, "typing idle timeout");
                if let Err(error) = inner.signaller.stop_typing(inner.conversation_id).await {
                    warn!(conversation_id = %inner.conversation_id, %error, "typing stop after idle failed");
                }
                return;
            }
        };
        sleep_until(deadline).await;
    }
}

/// Remote users currently typing, keyed by when we last saw them start.
#[derive(Debug, Clone)]
pub struct RemoteTypers {
    idle: Duration,
    entries: HashMap<UserId, Instant>,
}

impl RemoteTypers {
    pub fn new(idle: Duration) -> Self {
        Self {
            idle,
            entries: HashMap::new(),
        }
    }

    /// Fold a presence event in. `Sync` replaces the set wholesale; users
    /// already known keep their timestamp so a repeated sync does not keep a
    /// stale entry alive.
    pub fn apply(&mut self, event: &PresenceEvent, now: Instant) {
        match event {
            PresenceEvent::Sync { present } => {
                let previous = std::mem::take(&mut self.entries);
                self.entries = present
                    .iter()
                    .filter(|meta| meta.typing)
                    .map(|meta| (meta.user_id, previous.get(&meta.user_id).copied().unwrap_or(now)))
                    .collect();
            }
            PresenceEvent::Join { meta } if meta.typing => {
                self.entries.insert(meta.user_id, now);
            }
            PresenceEvent::Join { meta } => {
                self.entries.remove(&meta.user_id);
            }
            PresenceEvent::Leave { user_id } => {
                self.entries.remove(user_id);
            }
        }
    }

    /// Users whose typing signal is younger than the idle window, sorted.
    pub fn active(&self, now: Instant) -> Vec<UserId> {
        let mut users: Vec<UserId> = self
            .entries
            .iter()
            .filter(|(_, seen)| now.saturating_duration_since(**seen) < self.idle)
            .map(|(user_id, _)| *user_id)
            .collect();
        users.sort();
        users
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex as StdMutex;
    use studyhall_chats::ChatError;
    use uuid::Uuid;

    #[derive(Default)]
    struct RecordingSignaller {
        calls: StdMutex<Vec<&'static str>>,
        fail_start: std::sync::atomic::AtomicBool,
    }

    impl RecordingSignaller {
        fn calls(&self) -> Vec<&'static str> {
            self.calls.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl TypingSignaller for RecordingSignaller {
        async fn start_typing(&self, _conversation_id: ConversationId) -> ChatResult<()> {
            if self.fail_start.load(Ordering::SeqCst) {
                return Err(ChatError::transport("offline"));
            }
            self.calls.lock().unwrap().push("start");
            Ok(())
        }

        async fn stop_typing(&self, _conversation_id: ConversationId) -> ChatResult<()> {
            self.calls.lock().unwrap().push("stop");
            Ok(())
        }
    }

    fn coordinator() -> (TypingCoordinator, Arc<RecordingSignaller>) {
        let signaller = Arc::new(RecordingSignaller::default());
        let coordinator = TypingCoordinator::new(Uuid::new_v4(), DEFAULT_TYPING_IDLE, signaller.clone());
        (coordinator, signaller)
    }

    #[tokio::test(start_paused = true)]
    async fn burst_emits_one_start_and_one_stop() {
        let (typing, signaller) = coordinator();

        for _ in 0..5 {
            typing.keystroke().await.unwrap();
            tokio::time::sleep(Duration::from_millis(500)).await;
        }
        assert_eq!(signaller.calls(), vec!["start"]);

        tokio::time::sleep(Duration::from_millis(3100)).await;
        assert_eq!(signaller.calls(), vec!["start", "stop"]);
        assert!(!typing.is_active().await);
    }

    #[tokio::test(start_paused = true)]
    async fn keystrokes_push_the_deadline_out() {
        let (typing, signaller) = coordinator();

        typing.keystroke().await.unwrap();
        tokio::time::sleep(Duration::from_millis(2500)).await;
        typing.keystroke().await.unwrap();
        tokio::time::sleep(Duration::from_millis(2500)).await;
        assert_eq!(signaller.calls(), vec!["start"]);

        tokio::time::sleep(Duration::from_millis(600)).await;
        assert_eq!(signaller.calls(), vec!["start", "stop"]);
    }

    #[tokio::test(start_paused = true)]
    async fn explicit_stop_cancels_timer() {
        let (typing, signaller) = coordinator();

        typing.keystroke().await.unwrap();
        typing.stop().await.unwrap();
        assert_eq!(signaller.calls(), vec!["start", "stop"]);

        tokio::time::sleep(Duration::from_secs(10)).await;
        assert_eq!(signaller.calls(), vec!["start", "stop"]);
    }

    #[tokio::test(start_paused = true)]
    async fn stale_timer_does_not_stop_new_burst() {
        let (typing, signaller) = coordinator();

        typing.keystroke().await.unwrap();
        tokio::time::sleep(Duration::from_millis(2900)).await;
        typing.stop().await.unwrap();
        typing.keystroke().await.unwrap();

        // the first burst's deadline passes while the second is running
        tokio::time::sleep(Duration::from_millis(500)).await;
        assert_eq!(signaller.calls(), vec!["start", "stop", "start"]);
        assert!(typing.is_active().await);
    }

    #[tokio::test(start_paused = true)]
    async fn stop_while_idle_is_silent() {
        let (typing, signaller) = coordinator();
        typing.stop().await.unwrap();
        typing.shutdown().await;
        assert!(signaller.calls().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn failed_start_stays_idle() {
        let (typing, signaller) = coordinator();
        signaller.fail_start.store(true, Ordering::SeqCst);

        assert!(typing.keystroke().await.is_err());
        assert!(!typing.is_active().await);

        signaller.fail_start.store(false, Ordering::SeqCst);
        typing.keystroke().await.unwrap();
        assert_eq!(signaller.calls(), vec!["start"]);
    }

    #[tokio::test(start_paused = true)]
    async fn dropping_active_coordinator_stops() {
        let (typing, signaller) = coordinator();
        typing.keystroke().await.unwrap();

        drop(typing);
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(signaller.calls(), vec!["start", "stop"]);
    }

    #[tokio::test(start_paused = true)]
    async fn remote_sync_then_leave() {
        let (a, b) = (Uuid::new_v4(), Uuid::new_v4());
        let mut remote = RemoteTypers::new(DEFAULT_TYPING_IDLE);
        let now = Instant::now();

        remote.apply(
            &PresenceEvent::Sync {
                present: vec![PresenceMeta::typing(a), PresenceMeta::typing(b)],
            },
            now,
        );
        remote.apply(&PresenceEvent::Leave { user_id: a }, now);
        assert_eq!(remote.active(now), vec![b]);

        remote.apply(&PresenceEvent::Join { meta: PresenceMeta::typing(a) }, now);
        remote.apply(&PresenceEvent::Sync { present: vec![] }, now);
        assert!(remote.active(now).is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn remote_entries_expire_on_read() {
        let (a, b) = (Uuid::new_v4(), Uuid::new_v4());
        let mut remote = RemoteTypers::new(DEFAULT_TYPING_IDLE);
        let start = Instant::now();

        remote.apply(&PresenceEvent::Join { meta: PresenceMeta::typing(a) }, start);
        remote.apply(&PresenceEvent::Join { meta: PresenceMeta::typing(b) }, start + Duration::from_secs(2));
        remote.apply(&PresenceEvent::Join { meta: PresenceMeta::idle(b) }, start + Duration::from_secs(2));

        assert_eq!(remote.active(start + Duration::from_secs(1)), vec![a]);
        assert!(remote.active(start + Duration::from_secs(3)).is_empty());
    }
}
