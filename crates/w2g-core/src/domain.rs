/// Telegram user id (numeric). The controlling user of a WhatsApp session.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct UserId(pub i64);

/// Telegram chat id (numeric). The companion chat a session relays into.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct ChatId(pub i64);

/// Telegram message id (numeric).
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct MessageId(pub i32);

/// A stable reference to a Telegram message.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct MessageRef {
    pub chat_id: ChatId,
    pub message_id: MessageId,
}

/// Per-user WhatsApp client identifier, derived deterministically from the
/// controlling user so credentials persist across restarts.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct ClientId(pub String);

impl ClientId {
    pub fn for_user(user: UserId) -> Self {
        Self(user.0.to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}
