use std::sync::Arc;

use chrono::Utc;
use teloxide::{prelude::*, types::Message};

use w2g_core::{
    domain::{ChatId, UserId},
    utils::AuditEvent,
};

use crate::router::AppState;

fn parse_command(text: &str) -> (String, String) {
    // Telegram may send `/cmd@botname arg1 ...`
    let mut parts = text.trim().splitn(2, char::is_whitespace);
    let first = parts.next().unwrap_or("").trim();
    let rest = parts.next().unwrap_or("").trim().to_string();

    let cmd = first
        .trim_start_matches('/')
        .split('@')
        .next()
        .unwrap_or("")
        .to_lowercase();

    (cmd, rest)
}

fn format_duration(seconds: i64) -> String {
    let seconds = seconds.max(0);
    let hours = seconds / 3600;
    let mins = (seconds % 3600) / 60;
    let secs = seconds % 60;
    if hours > 0 {
        return format!("{hours}h {mins}m {secs}s");
    }
    if mins > 0 {
        return format!("{mins}m {secs}s");
    }
    format!("{secs}s")
}

pub async fn handle_command(msg: Message, state: Arc<AppState>) -> ResponseResult<()> {
    let Some(from) = msg.from() else {
        return Ok(());
    };
    let user = UserId(from.id.0 as i64);
    let chat = ChatId(msg.chat.id.0);
    let username = from.username.clone().unwrap_or_default();

    let (cmd, _args) = parse_command(msg.text().unwrap_or(""));
    let _ = state
        .audit
        .write(AuditEvent::command(user.0, &username, &cmd));

    match cmd.as_str() {
        "start" => {
            let _ = state
                .companion
                .send_text(
                    chat,
                    "👋 Welcome to what2gram!\n\nUse /login to link your WhatsApp account. \
                     Incoming WhatsApp messages will be relayed to this chat.",
                )
                .await;
        }

        "login" => {
            let _ = state
                .companion
                .send_text(
                    chat,
                    "⏳ Starting WhatsApp session. A QR code will appear here shortly.",
                )
                .await;

            if let Err(e) = state.registry.create(user, chat).await {
                let _ = state
                    .audit
                    .write(AuditEvent::error(user.0, &e.to_string(), Some("login")));
                let _ = state
                    .companion
                    .send_text(chat, &format!("🚨 Failed to start WhatsApp session: {e}"))
                    .await;
            }
        }

        "logout" => {
            let reply = if state.registry.logout(user).await {
                let _ = state.audit.write(AuditEvent::session(user.0, "logout"));
                "✅ Logged out. Use /login to link again."
            } else {
                "No active session to log out of."
            };
            let _ = state.companion.send_text(chat, reply).await;
        }

        "status" => {
            let reply = match state.registry.session(user).await {
                Some(session) => {
                    let up = Utc::now()
                        .signed_duration_since(session.created_at)
                        .num_seconds();
                    format!("🟢 WhatsApp session active (up {}).", format_duration(up))
                }
                None => "⚪ No active session. Use /login to link WhatsApp.".to_string(),
            };
            let _ = state.companion.send_text(chat, &reply).await;
        }

        _ => {
            let _ = state
                .companion
                .send_text(
                    chat,
                    "Unknown command. Available: /start, /login, /logout, /status.",
                )
                .await;
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn commands_parse_with_bot_suffix_and_args() {
        assert_eq!(parse_command("/login"), ("login".to_string(), String::new()));
        assert_eq!(
            parse_command("/Status@what2gram_bot  now"),
            ("status".to_string(), "now".to_string())
        );
        assert_eq!(parse_command("/"), (String::new(), String::new()));
    }

    #[test]
    fn durations_format_by_magnitude() {
        assert_eq!(format_duration(42), "42s");
        assert_eq!(format_duration(125), "2m 5s");
        assert_eq!(format_duration(3700), "1h 1m 40s");
        assert_eq!(format_duration(-5), "0s");
    }
}
