use std::sync::Arc;

use anyhow::{Context, Result};
use studyhall_chats::{ConversationStore, MemoryStore, MessageLimits, UserId};
use studyhall_config::AppConfig;
use studyhall_realtime::{
    ChangeNotifier, FacadeSettings, LocalNotifier, MessagingFacade, RealtimeSessionManager,
};
use tracing::info;

pub mod telemetry {
    use anyhow::Result;
    use tracing::Level;
    use tracing_subscriber::{fmt::SubscriberBuilder, EnvFilter};

    pub fn init_tracing() -> Result<()> {
        let env_filter =
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

        let subscriber = SubscriberBuilder::default()
            .with_max_level(Level::INFO)
            .with_env_filter(env_filter)
            .finish();

        tracing::subscriber::set_global_default(subscriber)
            .map_err(|error| anyhow::anyhow!("failed to set tracing subscriber: {error}"))
    }
}

/// Shared wiring for the realtime core: one store and one notifier, and a
/// fresh session manager for every signed-in user.
#[derive(Clone)]
pub struct RealtimeServices {
    pub store: Arc<dyn ConversationStore>,
    pub notifier: Arc<dyn ChangeNotifier>,
    pub settings: FacadeSettings,
    pub dedupe_window: usize,
}

impl RealtimeServices {
    pub fn initialise(
        config: &AppConfig,
        store: Arc<dyn ConversationStore>,
        notifier: Arc<dyn ChangeNotifier>,
    ) -> Result<Self> {
        config
            .validate()
            .context("invalid realtime configuration")?;

        let settings = FacadeSettings {
            typing_idle: config.realtime.typing_idle(),
            page_size: config.realtime.message_page_size,
            limits: limits_from(config),
        };

        info!(
            typing_idle_ms = config.realtime.typing_idle_ms,
            page_size = settings.page_size,
            dedupe_window = config.realtime.event_buffer,
            max_message_length = settings.limits.max_content_length,
            max_attachments = settings.limits.max_attachments,
            "Realtime services initialised"
        );

        Ok(Self {
            store,
            notifier,
            settings,
            dedupe_window: config.realtime.event_buffer,
        })
    }

    /// In-process wiring: a [`MemoryStore`] publishing into a [`LocalNotifier`].
    /// The notifier is returned as well so callers can drive presence or
    /// simulate outages.
    pub fn in_memory(config: &AppConfig) -> Result<(Self, LocalNotifier)> {
        let notifier = LocalNotifier::new();
        let store = MemoryStore::new(Arc::new(notifier.clone())).with_limits(limits_from(config));
        let services = Self::initialise(config, Arc::new(store), Arc::new(notifier.clone()))?;
        Ok((services, notifier))
    }

    /// A session manager holds at most one conversation and one user-index
    /// channel, so each user gets their own.
    pub fn session_manager(&self) -> RealtimeSessionManager {
        RealtimeSessionManager::with_dedupe_window(self.notifier.clone(), self.dedupe_window)
    }

    pub fn facade_for(&self, user_id: UserId) -> MessagingFacade {
        MessagingFacade::new(
            user_id,
            self.store.clone(),
            self.session_manager(),
            self.settings.clone(),
        )
    }
}

fn limits_from(config: &AppConfig) -> MessageLimits {
    MessageLimits {
        max_content_length: config.store.max_message_length,
        max_attachments: config.store.max_attachments,
    }
}
