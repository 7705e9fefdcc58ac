use std::path::Path;

use async_trait::async_trait;

use crate::{
    domain::{ChatId, MessageRef},
    Result,
};

/// Companion chat transport port.
///
/// Telegram is the first implementation; the shape is designed so a future
/// adapter (Slack/Discord) can fit behind the same interface. Media sends
/// take a filesystem locator produced by the media sink; the QR display takes
/// bytes directly since the challenge image never touches disk.
#[async_trait]
pub trait CompanionPort: Send + Sync {
    async fn send_text(&self, chat_id: ChatId, text: &str) -> Result<MessageRef>;

    /// Send an in-memory PNG with a caption. Used for the QR challenge.
    async fn send_photo_bytes(
        &self,
        chat_id: ChatId,
        png: Vec<u8>,
        caption: &str,
    ) -> Result<MessageRef>;

    async fn send_photo(&self, chat_id: ChatId, file: &Path, caption: &str)
        -> Result<MessageRef>;

    async fn send_video(&self, chat_id: ChatId, file: &Path, caption: &str)
        -> Result<MessageRef>;

    async fn send_document(
        &self,
        chat_id: ChatId,
        file: &Path,
        caption: &str,
    ) -> Result<MessageRef>;

    /// Stickers carry no caption on the Telegram side.
    async fn send_sticker(&self, chat_id: ChatId, file: &Path) -> Result<MessageRef>;

    async fn delete_message(&self, msg: MessageRef) -> Result<()>;
}
