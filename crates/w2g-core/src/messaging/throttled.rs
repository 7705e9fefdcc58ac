use std::{collections::HashMap, path::Path, sync::Arc, time::Duration};

use tokio::sync::Mutex;
use tokio::time::{sleep, Instant};

use crate::{
    domain::{ChatId, MessageRef},
    messaging::port::CompanionPort,
    Result,
};

#[derive(Clone, Copy, Debug)]
pub struct ThrottleConfig {
    /// Minimum spacing between *any* Telegram API calls (global flood control).
    pub global_min_interval: Duration,
    /// Minimum spacing between calls per chat (Telegram 1 msg/sec style limits).
    pub per_chat_min_interval: Duration,
}

impl Default for ThrottleConfig {
    fn default() -> Self {
        Self {
            global_min_interval: Duration::from_millis(40), // ~25/sec
            per_chat_min_interval: Duration::from_millis(1050), // ~0.95/sec
        }
    }
}

#[derive(Debug)]
struct IntervalLimiter {
    interval: Duration,
    next: Instant,
}

impl IntervalLimiter {
    fn new(interval: Duration) -> Self {
        Self {
            interval,
            next: Instant::now(),
        }
    }

    /// Reserve the next slot and return the wait duration required before executing.
    fn reserve(&mut self) -> Duration {
        let now = Instant::now();
        let start = if now >= self.next { now } else { self.next };
        self.next = start + self.interval;
        start.saturating_duration_since(now)
    }
}

/// CompanionPort decorator that rate-limits outbound calls.
///
/// A busy WhatsApp chat can relay bursts of messages; this keeps the Telegram
/// side under the flood limits. It does not guarantee zero 429s (the adapter
/// still retries RetryAfter), but it should drastically reduce them.
pub struct ThrottledCompanion {
    inner: Arc<dyn CompanionPort>,
    cfg: ThrottleConfig,
    global: Mutex<IntervalLimiter>,
    per_chat: Mutex<HashMap<i64, Arc<Mutex<IntervalLimiter>>>>,
}

impl ThrottledCompanion {
    pub fn new(inner: Arc<dyn CompanionPort>, cfg: ThrottleConfig) -> Self {
        Self {
            inner,
            cfg,
            global: Mutex::new(IntervalLimiter::new(cfg.global_min_interval)),
            per_chat: Mutex::new(HashMap::new()),
        }
    }

    async fn limiter_for_chat(&self, chat_id: i64) -> Arc<Mutex<IntervalLimiter>> {
        let mut map = self.per_chat.lock().await;
        map.entry(chat_id)
            .or_insert_with(|| {
                Arc::new(Mutex::new(IntervalLimiter::new(
                    self.cfg.per_chat_min_interval,
                )))
            })
            .clone()
    }

    async fn throttle_chat(&self, chat_id: i64) {
        let global_wait = { self.global.lock().await.reserve() };
        let chat_wait = {
            let lim = self.limiter_for_chat(chat_id).await;
            let mut guard = lim.lock().await;
            guard.reserve()
        };

        let wait = if global_wait > chat_wait {
            global_wait
        } else {
            chat_wait
        };
        if wait > Duration::from_millis(0) {
            sleep(wait).await;
        }
    }
}

#[async_trait::async_trait]
impl CompanionPort for ThrottledCompanion {
    async fn send_text(&self, chat_id: ChatId, text: &str) -> Result<MessageRef> {
        self.throttle_chat(chat_id.0).await;
        self.inner.send_text(chat_id, text).await
    }

    async fn send_photo_bytes(
        &self,
        chat_id: ChatId,
        png: Vec<u8>,
        caption: &str,
    ) -> Result<MessageRef> {
        self.throttle_chat(chat_id.0).await;
        self.inner.send_photo_bytes(chat_id, png, caption).await
    }

    async fn send_photo(
        &self,
        chat_id: ChatId,
        file: &Path,
        caption: &str,
    ) -> Result<MessageRef> {
        self.throttle_chat(chat_id.0).await;
        self.inner.send_photo(chat_id, file, caption).await
    }

    async fn send_video(
        &self,
        chat_id: ChatId,
        file: &Path,
        caption: &str,
    ) -> Result<MessageRef> {
        self.throttle_chat(chat_id.0).await;
        self.inner.send_video(chat_id, file, caption).await
    }

    async fn send_document(
        &self,
        chat_id: ChatId,
        file: &Path,
        caption: &str,
    ) -> Result<MessageRef> {
        self.throttle_chat(chat_id.0).await;
        self.inner.send_document(chat_id, file, caption).await
    }

    async fn send_sticker(&self, chat_id: ChatId, file: &Path) -> Result<MessageRef> {
        self.throttle_chat(chat_id.0).await;
        self.inner.send_sticker(chat_id, file).await
    }

    async fn delete_message(&self, msg: MessageRef) -> Result<()> {
        self.throttle_chat(msg.chat_id.0).await;
        self.inner.delete_message(msg).await
    }
}
