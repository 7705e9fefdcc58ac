//! Telegram update handlers.
//!
//! Every update goes through the allowlist gate before it can touch the
//! session registry; denials are answered and audited.

use std::sync::Arc;

use teloxide::{prelude::*, types::Message};

use w2g_core::domain::UserId;
use w2g_core::security::is_authorized;
use w2g_core::utils::AuditEvent;

use crate::router::AppState;
mod commands;

pub async fn handle_message(bot: Bot, msg: Message, state: Arc<AppState>) -> ResponseResult<()> {
    let user_id = msg.from().map(|u| u.id.0 as i64);
    let username = msg
        .from()
        .and_then(|u| u.username.clone())
        .unwrap_or_default();

    if !is_authorized(user_id.map(UserId), &state.cfg.telegram_allowed_users) {
        let _ = state
            .audit
            .write(AuditEvent::auth(user_id.unwrap_or(0), &username, false));
        let _ = bot
            .send_message(
                msg.chat.id,
                "Unauthorized. Contact the bot owner for access.",
            )
            .await;
        return Ok(());
    }

    if let Some(text) = msg.text() {
        if text.starts_with('/') {
            return commands::handle_command(msg, state).await;
        }
    }

    // Traffic flows WhatsApp → Telegram only; plain chat here has nowhere to go.
    let _ = bot
        .send_message(
            msg.chat.id,
            "This bot relays your WhatsApp messages. Commands: /login, /logout, /status.",
        )
        .await;

    Ok(())
}
