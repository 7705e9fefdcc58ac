//! Telegram adapter (teloxide).
//!
//! This crate implements the `w2g-core` CompanionPort over the Telegram Bot
//! API. Relayed WhatsApp media arrives as files written by the media sink;
//! the QR challenge is sent straight from memory.

use std::path::Path;

use async_trait::async_trait;

use teloxide::{prelude::*, types::InputFile};

use tokio::time::sleep;

pub mod handlers;
pub mod router;

use w2g_core::{
    domain::{ChatId, MessageId, MessageRef},
    errors::Error,
    messaging::port::CompanionPort,
    Result,
};

#[derive(Clone)]
pub struct TelegramCompanion {
    bot: Bot,
}

impl TelegramCompanion {
    pub fn new(bot: Bot) -> Self {
        Self { bot }
    }

    pub fn bot(&self) -> Bot {
        self.bot.clone()
    }

    fn tg_chat(chat_id: ChatId) -> teloxide::types::ChatId {
        teloxide::types::ChatId(chat_id.0)
    }

    fn tg_msg_id(message_id: MessageId) -> teloxide::types::MessageId {
        teloxide::types::MessageId(message_id.0)
    }

    fn map_err(e: teloxide::RequestError) -> Error {
        Error::Transport(format!("telegram error: {e}"))
    }

    async fn with_retry<T, Fut>(&self, mut op: impl FnMut() -> Fut) -> Result<T>
    where
        Fut: std::future::IntoFuture<Output = std::result::Result<T, teloxide::RequestError>>,
        Fut::IntoFuture: Send,
    {
        const MAX_RETRIES: usize = 1;
        let mut attempts = 0usize;
        loop {
            match op().await {
                Ok(v) => return Ok(v),
                Err(e) => match e {
                    teloxide::RequestError::RetryAfter(d) if attempts < MAX_RETRIES => {
                        attempts += 1;
                        sleep(d).await;
                        continue;
                    }
                    other => return Err(Self::map_err(other)),
                },
            }
        }
    }

    fn msg_ref(chat_id: ChatId, msg: &teloxide::types::Message) -> MessageRef {
        MessageRef {
            chat_id,
            message_id: MessageId(msg.id.0),
        }
    }
}

#[async_trait]
impl CompanionPort for TelegramCompanion {
    async fn send_text(&self, chat_id: ChatId, text: &str) -> Result<MessageRef> {
        let msg = self
            .with_retry(|| {
                self.bot
                    .send_message(Self::tg_chat(chat_id), text.to_string())
            })
            .await?;
        Ok(Self::msg_ref(chat_id, &msg))
    }

    async fn send_photo_bytes(
        &self,
        chat_id: ChatId,
        png: Vec<u8>,
        caption: &str,
    ) -> Result<MessageRef> {
        let msg = self
            .with_retry(|| {
                self.bot
                    .send_photo(Self::tg_chat(chat_id), InputFile::memory(png.clone()))
                    .caption(caption.to_string())
            })
            .await?;
        Ok(Self::msg_ref(chat_id, &msg))
    }

    async fn send_photo(
        &self,
        chat_id: ChatId,
        file: &Path,
        caption: &str,
    ) -> Result<MessageRef> {
        let msg = self
            .with_retry(|| {
                self.bot
                    .send_photo(Self::tg_chat(chat_id), InputFile::file(file))
                    .caption(caption.to_string())
            })
            .await?;
        Ok(Self::msg_ref(chat_id, &msg))
    }

    async fn send_video(
        &self,
        chat_id: ChatId,
        file: &Path,
        caption: &str,
    ) -> Result<MessageRef> {
        let msg = self
            .with_retry(|| {
                self.bot
                    .send_video(Self::tg_chat(chat_id), InputFile::file(file))
                    .caption(caption.to_string())
            })
            .await?;
        Ok(Self::msg_ref(chat_id, &msg))
    }

    async fn send_document(
        &self,
        chat_id: ChatId,
        file: &Path,
        caption: &str,
    ) -> Result<MessageRef> {
        let msg = self
            .with_retry(|| {
                self.bot
                    .send_document(Self::tg_chat(chat_id), InputFile::file(file))
                    .caption(caption.to_string())
            })
            .await?;
        Ok(Self::msg_ref(chat_id, &msg))
    }

    async fn send_sticker(&self, chat_id: ChatId, file: &Path) -> Result<MessageRef> {
        let msg = self
            .with_retry(|| {
                self.bot
                    .send_sticker(Self::tg_chat(chat_id), InputFile::file(file))
            })
            .await?;
        Ok(Self::msg_ref(chat_id, &msg))
    }

    async fn delete_message(&self, msg: MessageRef) -> Result<()> {
        self.with_retry(|| {
            self.bot
                .delete_message(Self::tg_chat(msg.chat_id), Self::tg_msg_id(msg.message_id))
        })
        .await?;
        Ok(())
    }
}
