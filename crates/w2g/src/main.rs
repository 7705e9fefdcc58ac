use std::sync::Arc;

use teloxide::Bot;

use w2g_core::{
    config::Config,
    media::FsMediaSink,
    messaging::{
        port::CompanionPort,
        throttled::{ThrottleConfig, ThrottledCompanion},
    },
    registry::SessionRegistry,
    store::{FsSessionStore, SessionStore},
};
use w2g_telegram::TelegramCompanion;
use w2g_whatsapp::BridgeFactory;

#[tokio::main]
async fn main() -> Result<(), w2g_core::Error> {
    w2g_core::logging::init("w2g")?;

    let cfg = Arc::new(Config::load()?);

    let store: Arc<dyn SessionStore> = Arc::new(FsSessionStore::new(cfg.session_dir.clone()));
    store.connect().await?;

    let bot = Bot::new(cfg.telegram_bot_token.clone());
    let raw: Arc<dyn CompanionPort> = Arc::new(TelegramCompanion::new(bot.clone()));
    let companion: Arc<dyn CompanionPort> =
        Arc::new(ThrottledCompanion::new(raw, ThrottleConfig::default()));

    let factory = Arc::new(BridgeFactory::new(
        cfg.bridge_path.clone(),
        store,
        cfg.media_download_timeout,
    ));
    let sink = Arc::new(FsMediaSink::new(cfg.download_dir.clone()));

    let registry = SessionRegistry::new(factory, companion.clone(), sink, cfg.qr_lifetime);

    w2g_telegram::router::run_polling(cfg, bot, registry, companion)
        .await
        .map_err(|e| w2g_core::Error::Transport(format!("telegram bot failed: {e}")))?;

    Ok(())
}
