//! Outbound notifications.
//!
//! Sweeps enqueue [`Notification`]s while they run; the cycle flushes the
//! queue at the end. Delivery is best-effort: every attempt is logged to
//! `notification_log`, transient failures go back on the queue with
//! exponential backoff, and nothing is ever surfaced as an error to the
//! caller.

use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use chrono::Utc;
use fleet_core::config::{CredentialProvider, NotificationConfig, NotificationLevel};
use fleet_core::store::FleetStore;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::rate_limiter::{RateLimitConfig, RateLimitError, RateLimiter};

// ---------------------------------------------------------------------------
// Events and levels
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NotificationEvent {
    Block,
    Complete,
    Error,
    AutoStop,
    Alert,
    Assign,
    Start,
    Unblock,
    Review,
    Backlog,
    Create,
    Progress,
}

impl NotificationEvent {
    pub fn as_str(&self) -> &'static str {
        match self {
            NotificationEvent::Block => "block",
            NotificationEvent::Complete => "complete",
            NotificationEvent::Error => "error",
            NotificationEvent::AutoStop => "auto_stop",
            NotificationEvent::Alert => "alert",
            NotificationEvent::Assign => "assign",
            NotificationEvent::Start => "start",
            NotificationEvent::Unblock => "unblock",
            NotificationEvent::Review => "review",
            NotificationEvent::Backlog => "backlog",
            NotificationEvent::Create => "create",
            NotificationEvent::Progress => "progress",
        }
    }

    /// Lowest configured level at which this event is delivered.
    pub fn min_level(&self) -> NotificationLevel {
        match self {
            NotificationEvent::Block
            | NotificationEvent::Complete
            | NotificationEvent::Error
            | NotificationEvent::AutoStop
            | NotificationEvent::Alert => NotificationLevel::Minimal,
            NotificationEvent::Assign | NotificationEvent::Start | NotificationEvent::Unblock => {
                NotificationLevel::Normal
            }
            NotificationEvent::Review
            | NotificationEvent::Backlog
            | NotificationEvent::Create
            | NotificationEvent::Progress => NotificationLevel::Verbose,
        }
    }

    pub fn enabled_at(&self, level: NotificationLevel) -> bool {
        level_rank(level) >= level_rank(self.min_level())
    }

    fn glyph(&self) -> &'static str {
        match self {
            NotificationEvent::Block => "🚫",
            NotificationEvent::Complete => "✅",
            NotificationEvent::Error => "❌",
            NotificationEvent::AutoStop => "🛑",
            NotificationEvent::Alert => "⚠️",
            NotificationEvent::Assign => "📋",
            NotificationEvent::Start => "▶️",
            NotificationEvent::Unblock => "🔓",
            NotificationEvent::Review => "🔍",
            NotificationEvent::Backlog => "📥",
            NotificationEvent::Create => "🆕",
            NotificationEvent::Progress => "📈",
        }
    }
}

fn level_rank(level: NotificationLevel) -> u8 {
    match level {
        NotificationLevel::Minimal => 0,
        NotificationLevel::Normal => 1,
        NotificationLevel::Verbose => 2,
    }
}

fn level_name(level: NotificationLevel) -> &'static str {
    match level {
        NotificationLevel::Minimal => "minimal",
        NotificationLevel::Normal => "normal",
        NotificationLevel::Verbose => "verbose",
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Notification {
    pub event: NotificationEvent,
    pub entity_ids: Vec<String>,
    pub message: String,
}

impl Notification {
    pub fn new(event: NotificationEvent, entity_ids: Vec<String>, message: impl Into<String>) -> Self {
        Self {
            event,
            entity_ids,
            message: message.into(),
        }
    }

    /// Text as delivered to the chat channel.
    pub fn render(&self) -> String {
        format!("{} {}", self.event.glyph(), self.message)
    }
}

// ---------------------------------------------------------------------------
// Transports
// ---------------------------------------------------------------------------

const SEND_TIMEOUT: Duration = Duration::from_secs(10);
const MAX_BACKOFF: Duration = Duration::from_secs(60);

#[derive(Debug, Error)]
pub enum NotifyError {
    /// Never carries the request URL; it embeds the bot token.
    #[error("http: {0}")]
    Http(reqwest::Error),
    #[error("chat api returned {status}: {body}")]
    Rejected { status: u16, body: String },
    #[error(transparent)]
    RateLimited(#[from] RateLimitError),
}

impl From<reqwest::Error> for NotifyError {
    fn from(e: reqwest::Error) -> Self {
        NotifyError::Http(e.without_url())
    }
}

impl NotifyError {
    /// Whether another attempt could succeed.
    pub fn is_retryable(&self) -> bool {
        match self {
            NotifyError::Http(e) => !e.is_builder(),
            NotifyError::Rejected { status, .. } => *status == 429 || *status >= 500,
            NotifyError::RateLimited(RateLimitError::Exhausted { retry_after, .. }) => {
                *retry_after != Duration::MAX
            }
        }
    }

    fn retry_after(&self) -> Duration {
        match self {
            NotifyError::RateLimited(RateLimitError::Exhausted { retry_after, .. }) => *retry_after,
            _ => Duration::ZERO,
        }
    }
}

#[async_trait]
pub trait Notifier: Send + Sync {
    /// Transport name, also the rate-limiter key.
    fn name(&self) -> &'static str;

    async fn send(&self, text: &str) -> Result<(), NotifyError>;
}

/// Telegram Bot API `sendMessage`.
#[derive(Debug, Clone)]
pub struct TelegramNotifier {
    client: reqwest::Client,
    api_base: String,
    token: String,
    chat_id: String,
}

impl TelegramNotifier {
    pub fn new(api_base: &str, token: &str, chat_id: &str) -> Result<Self, NotifyError> {
        let client = reqwest::Client::builder().timeout(SEND_TIMEOUT).build()?;
        Ok(Self {
            client,
            api_base: api_base.trim_end_matches('/').to_string(),
            token: token.to_string(),
            chat_id: chat_id.to_string(),
        })
    }

    /// `None` unless both a chat id and a bot token are available.
    pub fn from_config(cfg: &NotificationConfig) -> Option<Self> {
        let chat_id = cfg.telegram_chat_id.as_deref().filter(|c| !c.trim().is_empty())?;
        let token = CredentialProvider::from_env(&cfg.bot_token_env)?;
        match Self::new(&cfg.api_base, &token, chat_id) {
            Ok(telegram) => Some(telegram),
            Err(e) => {
                warn!(error = %e, "telegram client unavailable");
                None
            }
        }
    }

    fn endpoint(&self) -> String {
        format!("{}/bot{}/sendMessage", self.api_base, self.token)
    }
}

#[async_trait]
impl Notifier for TelegramNotifier {
    fn name(&self) -> &'static str {
        "telegram"
    }

    async fn send(&self, text: &str) -> Result<(), NotifyError> {
        let body = serde_json::json!({ "chat_id": self.chat_id, "text": text });
        let resp = self.client.post(self.endpoint()).json(&body).send().await?;
        if !resp.status().is_success() {
            let status = resp.status().as_u16();
            let body = resp.text().await.unwrap_or_default();
            return Err(NotifyError::Rejected { status, body });
        }
        Ok(())
    }
}

/// Writes notifications to the log only.
#[derive(Debug, Clone, Default)]
pub struct LogNotifier;

#[async_trait]
impl Notifier for LogNotifier {
    fn name(&self) -> &'static str {
        "log"
    }

    async fn send(&self, text: &str) -> Result<(), NotifyError> {
        info!(text, "notification");
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Dispatcher
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct FlushReport {
    pub sent: usize,
    /// Dropped after a permanent error or the last allowed attempt.
    pub failed: usize,
    /// Still queued, waiting out a backoff.
    pub retrying: usize,
}

impl FlushReport {
    /// Fold in a later flush of the same queue.
    pub fn absorb(&mut self, later: FlushReport) {
        self.sent += later.sent;
        self.failed += later.failed;
        self.retrying = later.retrying;
    }
}

/// Bounded retry with exponential backoff.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_backoff: Duration,
}

impl RetryPolicy {
    pub fn from_config(cfg: &NotificationConfig) -> Self {
        Self {
            max_attempts: cfg.retry_attempts.max(1),
            base_backoff: Duration::from_millis(cfg.retry_backoff_ms),
        }
    }

    /// Wait after the `attempt`-th failed send (1-based).
    pub fn backoff_for(&self, attempt: u32) -> Duration {
        let factor = 2u32.saturating_pow(attempt.saturating_sub(1));
        self.base_backoff.saturating_mul(factor).min(MAX_BACKOFF)
    }
}

#[derive(Debug)]
struct Queued {
    notification: Notification,
    attempts: u32,
    not_before: Instant,
}

struct Inner {
    notifier: Box<dyn Notifier>,
    store: FleetStore,
    enabled: bool,
    level: NotificationLevel,
    limiter: RateLimiter,
    retry: RetryPolicy,
    tx: flume::Sender<Queued>,
    rx: flume::Receiver<Queued>,
}

/// Level filter, queue, rate limit, retry and delivery log in front of a
/// [`Notifier`]. Clones share one queue.
#[derive(Clone)]
pub struct NotificationDispatcher {
    inner: Arc<Inner>,
}

impl NotificationDispatcher {
    pub fn new(store: FleetStore, notifier: Box<dyn Notifier>, cfg: &NotificationConfig) -> Self {
        let (tx, rx) = flume::unbounded();
        Self {
            inner: Arc::new(Inner {
                notifier,
                store,
                enabled: cfg.enabled,
                level: cfg.level,
                limiter: RateLimiter::new(RateLimitConfig::per_minute(cfg.per_minute)),
                retry: RetryPolicy::from_config(cfg),
                tx,
                rx,
            }),
        }
    }

    /// Telegram when configured, log-only otherwise.
    pub fn from_config(store: FleetStore, cfg: &NotificationConfig) -> Self {
        let notifier: Box<dyn Notifier> = match TelegramNotifier::from_config(cfg) {
            Some(telegram) => Box::new(telegram),
            None => {
                debug!("telegram not configured; notifications go to the log");
                Box::new(LogNotifier)
            }
        };
        Self::new(store, notifier, cfg)
    }

    fn accepts(&self, event: NotificationEvent) -> bool {
        self.inner.enabled && event.enabled_at(self.inner.level)
    }

    /// Queue a notification for the next flush. Returns `false` when the
    /// configured level filters it out.
    pub fn enqueue(&self, event: NotificationEvent, entity_ids: Vec<String>, message: impl Into<String>) -> bool {
        if !self.accepts(event) {
            return false;
        }
        self.push(Queued {
            notification: Notification::new(event, entity_ids, message),
            attempts: 0,
            not_before: Instant::now(),
        })
    }

    fn push(&self, item: Queued) -> bool {
        self.inner.tx.send(item).is_ok()
    }

    pub fn pending(&self) -> usize {
        self.inner.rx.len()
    }

    /// One send attempt, logged whatever the outcome.
    async fn deliver(&self, notification: &Notification, attempt: u32) -> Result<(), NotifyError> {
        let notifier = &self.inner.notifier;
        let result = match self.inner.limiter.check(notifier.name()) {
            Ok(()) => notifier.send(&notification.render()).await,
            Err(e) => Err(NotifyError::from(e)),
        };
        if let Err(e) = &result {
            warn!(
                event = notification.event.as_str(),
                transport = notifier.name(),
                attempt,
                error = %e,
                "notification not delivered"
            );
        }
        if let Err(e) = self
            .inner
            .store
            .record_notification(
                notification.event.as_str(),
                &notification.entity_ids,
                &notification.message,
                level_name(self.inner.level),
                result.is_ok(),
                Utc::now(),
            )
            .await
        {
            warn!(error = %e, "failed to record notification");
        }
        result
    }

    /// One pass over the queue: send what is due, requeue what is backing
    /// off. Also returns when the earliest requeued item falls due.
    async fn flush_pass(&self) -> (FlushReport, Option<Instant>) {
        let mut report = FlushReport::default();
        let mut next_due: Option<Instant> = None;
        let batch: Vec<Queued> = self.inner.rx.drain().collect();
        let started = Instant::now();

        for mut item in batch {
            if item.not_before <= started {
                item.attempts += 1;
                match self.deliver(&item.notification, item.attempts).await {
                    Ok(()) => {
                        report.sent += 1;
                        continue;
                    }
                    Err(e) if e.is_retryable() && item.attempts < self.inner.retry.max_attempts => {
                        let wait = self.inner.retry.backoff_for(item.attempts).max(e.retry_after());
                        debug!(
                            event = item.notification.event.as_str(),
                            attempt = item.attempts,
                            wait_ms = wait.as_millis() as u64,
                            "notification requeued"
                        );
                        item.not_before = Instant::now() + wait;
                    }
                    Err(_) => {
                        report.failed += 1;
                        continue;
                    }
                }
            }
            next_due = Some(next_due.map_or(item.not_before, |due| due.min(item.not_before)));
            if self.push(item) {
                report.retrying += 1;
            }
        }
        if report.sent + report.failed + report.retrying > 0 {
            info!(
                sent = report.sent,
                failed = report.failed,
                retrying = report.retrying,
                "notifications flushed"
            );
        }
        (report, next_due)
    }

    /// Deliver everything that is due; retries wait for a later flush.
    pub async fn flush(&self) -> FlushReport {
        self.flush_pass().await.0
    }

    /// Flush until the queue is empty, sleeping through backoffs. For
    /// one-shot callers about to exit.
    pub async fn flush_settled(&self) -> FlushReport {
        let mut total = FlushReport::default();
        loop {
            let (pass, next_due) = self.flush_pass().await;
            total.absorb(pass);
            let Some(due) = next_due else {
                return total;
            };
            tokio::time::sleep_until(due.into()).await;
        }
    }
}
