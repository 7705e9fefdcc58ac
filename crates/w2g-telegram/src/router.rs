use std::sync::Arc;

use teloxide::{dispatching::Dispatcher, dptree, prelude::*};

use w2g_core::{
    config::Config, messaging::port::CompanionPort, registry::SessionRegistry, utils::AuditLogger,
};

use crate::handlers;

#[derive(Clone)]
pub struct AppState {
    pub cfg: Arc<Config>,
    pub registry: Arc<SessionRegistry>,
    pub companion: Arc<dyn CompanionPort>,
    pub audit: Arc<AuditLogger>,
}

/// Long-polling entry point. The caller owns construction of the registry and
/// companion so the bot instance can be shared with the raw adapter.
pub async fn run_polling(
    cfg: Arc<Config>,
    bot: Bot,
    registry: Arc<SessionRegistry>,
    companion: Arc<dyn CompanionPort>,
) -> anyhow::Result<()> {
    // Basic startup info.
    if let Ok(me) = bot.get_me().await {
        println!("what2gram started: @{}", me.username());
    }
    println!("Bridge binary: {}", cfg.bridge_path.display());
    println!("Download folder: {}", cfg.download_dir.display());
    println!("Allowed users: {}", cfg.telegram_allowed_users.len());

    let state = Arc::new(AppState {
        cfg: cfg.clone(),
        registry,
        companion,
        audit: Arc::new(AuditLogger::new(
            cfg.audit_log_path.clone(),
            cfg.audit_log_json,
        )),
    });

    let handler = dptree::entry().branch(Update::filter_message().endpoint(handlers::handle_message));

    Dispatcher::builder(bot, handler)
        .dependencies(dptree::deps![state])
        .build()
        .dispatch()
        .await;

    Ok(())
}
