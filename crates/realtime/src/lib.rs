//! # Studyhall Realtime Crate
//!
//! The realtime messaging core: live subscriptions, the per-user messaging
//! aggregate and typing indicators.
//!
//! ## Architecture
//!
//! - **Transport**: the [`ChangeNotifier`] port and the in-process [`LocalNotifier`]
//! - **Session**: [`RealtimeSessionManager`], one conversation and one user-index
//!   subscription at a time, decoded into [`RealtimeEvent`]s
//! - **Facade**: [`MessagingFacade`], ordered message timeline, conversation list,
//!   receipts and the operations the UI calls
//! - **Typing**: [`TypingCoordinator`] for local bursts, [`RemoteTypers`] for
//!   everyone else
//!
//! ## Usage
//!
//! ```rust
//! use std::sync::Arc;
//! use studyhall_chats::{ConversationStore, MemoryStore, NewConversation};
//! use studyhall_realtime::{FacadeSettings, LocalNotifier, MessagingFacade, RealtimeSessionManager};
//!
//! # tokio_test_block(async {
//! let notifier = LocalNotifier::new();
//! let store = Arc::new(MemoryStore::new(Arc::new(notifier.clone())));
//! let sessions = RealtimeSessionManager::new(Arc::new(notifier));
//!
//! let (alice, bob) = (uuid::Uuid::new_v4(), uuid::Uuid::new_v4());
//! let conversation = store.create_conversation(alice, &NewConversation::direct(bob)).await?;
//!
//! let facade = MessagingFacade::new(alice, store, sessions, FacadeSettings::default());
//! facade.open_conversation(conversation.id).await?;
//! facade.send_text("hi").await.map_err(|error| error.source)?;
//! # Ok::<(), studyhall_chats::ChatError>(())
//! # });
//! # fn tokio_test_block<F: std::future::Future>(f: F) -> F::Output {
//! #     tokio::runtime::Builder::new_current_thread().enable_all().build().unwrap().block_on(f)
//! # }
//! ```

pub mod events;
pub mod facade;
pub mod session;
pub mod timeline;
pub mod transport;
pub mod typing;

pub use events::{ConnectionState, EventSink, EventStream, MessageChange, RealtimeEvent};
pub use facade::{FacadeSettings, MessagingFacade, SendError};
pub use session::{ChannelGuard, RealtimeSessionManager, Scope, SubscriptionHandle, DEFAULT_DEDUPE_WINDOW};
pub use timeline::MessageTimeline;
pub use transport::{ChangeNotifier, ChangeSubscription, LocalNotifier, PresenceSubscription, ReleaseGuard, Subscription};
pub use typing::{RemoteTypers, StoreTypingSignaller, TypingCoordinator, TypingSignaller, DEFAULT_TYPING_IDLE};
