//! Per-session event relay.
//!
//! One relay task is subscribed per WhatsApp session. It translates protocol
//! lifecycle events into companion-chat actions: QR challenges become expiring
//! photos, inbound messages become forwarded text/media, disconnects notify
//! the user and tear the registry entry down.

use std::sync::{Arc, Weak};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::{
    domain::{ChatId, MessageRef, UserId},
    media::MediaSink,
    messaging::port::CompanionPort,
    protocol::{ContentKind, InboundMessage, ProtocolClient, ProtocolEvent},
    qr,
    Result,
};

/// Registry-side hook the relay invokes when its session ends.
///
/// Returns whether an entry was actually removed. A deliberate `/logout`
/// removes the entry before the client's stream closes, so the relay uses
/// the return value to tell a real disconnect from its own teardown echo.
#[async_trait]
pub trait SessionTeardown: Send + Sync {
    async fn teardown(&self, user: UserId) -> bool;
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum RelayState {
    AwaitingChallenge,
    Authenticated,
    Terminal,
}

pub struct EventRelay {
    client: Arc<dyn ProtocolClient>,
    companion: Arc<dyn CompanionPort>,
    sink: Arc<dyn MediaSink>,
    chat_id: ChatId,
    user: UserId,
    qr_lifetime: Duration,
    teardown: Weak<dyn SessionTeardown>,
    state: RelayState,
}

impl EventRelay {
    pub fn new(
        client: Arc<dyn ProtocolClient>,
        companion: Arc<dyn CompanionPort>,
        sink: Arc<dyn MediaSink>,
        chat_id: ChatId,
        user: UserId,
        qr_lifetime: Duration,
        teardown: Weak<dyn SessionTeardown>,
    ) -> Self {
        Self {
            client,
            companion,
            sink,
            chat_id,
            user,
            qr_lifetime,
            teardown,
            state: RelayState::AwaitingChallenge,
        }
    }

    /// Consume the session's event stream until it ends.
    pub fn spawn(self, events: mpsc::UnboundedReceiver<ProtocolEvent>) -> tokio::task::JoinHandle<()> {
        tokio::spawn(self.run(events))
    }

    async fn run(mut self, mut events: mpsc::UnboundedReceiver<ProtocolEvent>) {
        while let Some(ev) = events.recv().await {
            self.handle_event(ev).await;
            if self.state == RelayState::Terminal {
                return;
            }
        }

        // Stream ended without a disconnect event: the client is gone, so the
        // session is unusable either way. Clean up as if disconnected.
        if self.state != RelayState::Terminal {
            eprintln!(
                "[RELAY] event stream for user {} ended unexpectedly",
                self.user.0
            );
            self.handle_event(ProtocolEvent::Disconnected { reason: None })
                .await;
        }
    }

    async fn handle_event(&mut self, ev: ProtocolEvent) {
        match ev {
            ProtocolEvent::Challenge { code } => self.handle_challenge(&code).await,
            ProtocolEvent::Ready => self.handle_ready().await,
            ProtocolEvent::Message(msg) => {
                // Per-message failure granularity: one bad message never stops
                // the relay or touches session state.
                if let Err(e) = self.relay_message(&msg).await {
                    eprintln!(
                        "[RELAY] message forwarding failed for user {}: {e}",
                        self.user.0
                    );
                }
            }
            ProtocolEvent::Disconnected { reason } => self.handle_disconnected(reason).await,
        }
    }

    /// Challenges may recur before authentication succeeds, and are handled
    /// even after it (protocol ordering is not assumed).
    async fn handle_challenge(&mut self, code: &str) {
        let png = match qr::challenge_to_png(code) {
            Ok(png) => png,
            Err(e) => {
                eprintln!("[RELAY] QR encode failed for user {}: {e}", self.user.0);
                return;
            }
        };

        let caption = format!(
            "📱 Scan this QR to login.\n⚠️ Expires in {}s.",
            self.qr_lifetime.as_secs()
        );

        match self
            .companion
            .send_photo_bytes(self.chat_id, png, &caption)
            .await
        {
            Ok(sent) => self.schedule_challenge_expiry(sent),
            Err(e) => {
                eprintln!("[RELAY] QR display failed for user {}: {e}", self.user.0);
            }
        }
    }

    /// Arm exactly one deletion timer for this challenge's message.
    ///
    /// The timer captures only the transport handle and the message ref: a
    /// superseding challenge or a completed login must not disturb it, and it
    /// fires harmlessly against its own message id.
    fn schedule_challenge_expiry(&self, sent: MessageRef) {
        let companion = self.companion.clone();
        let lifetime = self.qr_lifetime;
        let user = self.user;
        tokio::spawn(async move {
            tokio::time::sleep(lifetime).await;
            if let Err(e) = companion.delete_message(sent).await {
                // Best-effort: the user may have dismissed it already.
                eprintln!("[RELAY] QR message for user {} already gone: {e}", user.0);
            }
        });
    }

    async fn handle_ready(&mut self) {
        self.state = RelayState::Authenticated;
        if let Err(e) = self
            .companion
            .send_text(self.chat_id, "✅ WhatsApp connected successfully!")
            .await
        {
            eprintln!(
                "[RELAY] login confirmation failed for user {}: {e}",
                self.user.0
            );
        }
    }

    async fn handle_disconnected(&mut self, reason: Option<String>) {
        self.state = RelayState::Terminal;

        match &reason {
            Some(r) => println!("[RELAY] user {} disconnected: {r}", self.user.0),
            None => println!("[RELAY] user {} disconnected", self.user.0),
        }

        // When the entry is already gone the user logged out on purpose;
        // prompting them to /login again would be noise.
        let was_live = match self.teardown.upgrade() {
            Some(registry) => registry.teardown(self.user).await,
            None => false,
        };
        if !was_live {
            return;
        }

        if let Err(e) = self
            .companion
            .send_text(
                self.chat_id,
                "⚠️ WhatsApp disconnected. Please /login again.",
            )
            .await
        {
            eprintln!(
                "[RELAY] disconnect notification failed for user {}: {e}",
                self.user.0
            );
        }
    }

    async fn relay_message(&self, msg: &InboundMessage) -> Result<()> {
        let sender = sender_display_name(msg);
        let chat = chat_display_name(msg, &sender);
        let caption = build_caption(&sender, &chat, msg.body.as_deref());

        if let Some(media) = &msg.media {
            // Unsupported media kinds are dropped before any download work.
            if !matches!(
                msg.kind,
                ContentKind::Image | ContentKind::Video | ContentKind::Document | ContentKind::Sticker
            ) {
                return Ok(());
            }

            let payload = self.client.download_media(media).await?;
            let locator = self.sink.persist(&payload).await?;

            match msg.kind {
                ContentKind::Image => {
                    self.companion
                        .send_photo(self.chat_id, &locator, &caption)
                        .await?;
                }
                ContentKind::Video => {
                    self.companion
                        .send_video(self.chat_id, &locator, &caption)
                        .await?;
                }
                ContentKind::Document => {
                    self.companion
                        .send_document(self.chat_id, &locator, &caption)
                        .await?;
                }
                ContentKind::Sticker => {
                    self.companion.send_sticker(self.chat_id, &locator).await?;
                }
                ContentKind::Text | ContentKind::Other => unreachable!(),
            }
            return Ok(());
        }

        if msg.kind == ContentKind::Text {
            self.companion.send_text(self.chat_id, &caption).await?;
        }
        Ok(())
    }
}

/// Fallback order: address-book name, then the sender's own push name, then
/// the raw protocol address.
fn sender_display_name(msg: &InboundMessage) -> String {
    trimmed(msg.sender_name.as_deref())
        .or_else(|| trimmed(msg.sender_handle.as_deref()))
        .unwrap_or(&msg.sender_address)
        .to_string()
}

/// Group subject when the conversation is a group, else the sender name.
fn chat_display_name(msg: &InboundMessage, sender: &str) -> String {
    if msg.is_group {
        return trimmed(msg.chat_name.as_deref()).unwrap_or(sender).to_string();
    }
    sender.to_string()
}

fn build_caption(sender: &str, chat: &str, body: Option<&str>) -> String {
    format!(
        "📩 From: {sender}\n💬 Chat: {chat}\n\n{}",
        body.unwrap_or("")
    )
}

fn trimmed(s: Option<&str>) -> Option<&str> {
    s.map(str::trim).filter(|s| !s.is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::MessageId;
    use crate::protocol::{MediaPayload, MediaRef};
    use crate::Error;
    use std::path::{Path, PathBuf};
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::sync::Mutex;

    #[derive(Clone, Debug, PartialEq)]
    enum Sent {
        Text(ChatId, String),
        PhotoBytes(ChatId, String),
        Photo(ChatId, PathBuf, String),
        Video(ChatId, PathBuf, String),
        Document(ChatId, PathBuf, String),
        Sticker(ChatId, PathBuf),
    }

    #[derive(Default)]
    struct FakeCompanion {
        next_id: Mutex<i32>,
        sent: Mutex<Vec<Sent>>,
        deleted: Mutex<Vec<MessageRef>>,
        fail_delete: bool,
    }

    impl FakeCompanion {
        fn failing_delete() -> Self {
            Self {
                fail_delete: true,
                ..Self::default()
            }
        }

        fn alloc(&self, chat_id: ChatId) -> MessageRef {
            let mut guard = self.next_id.lock().unwrap();
            *guard += 1;
            MessageRef {
                chat_id,
                message_id: MessageId(*guard),
            }
        }

        fn sent(&self) -> Vec<Sent> {
            self.sent.lock().unwrap().clone()
        }

        fn deleted(&self) -> Vec<MessageRef> {
            self.deleted.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl CompanionPort for FakeCompanion {
        async fn send_text(&self, chat_id: ChatId, text: &str) -> Result<MessageRef> {
            self.sent
                .lock()
                .unwrap()
                .push(Sent::Text(chat_id, text.to_string()));
            Ok(self.alloc(chat_id))
        }

        async fn send_photo_bytes(
            &self,
            chat_id: ChatId,
            _png: Vec<u8>,
            caption: &str,
        ) -> Result<MessageRef> {
            self.sent
                .lock()
                .unwrap()
                .push(Sent::PhotoBytes(chat_id, caption.to_string()));
            Ok(self.alloc(chat_id))
        }

        async fn send_photo(
            &self,
            chat_id: ChatId,
            file: &Path,
            caption: &str,
        ) -> Result<MessageRef> {
            self.sent.lock().unwrap().push(Sent::Photo(
                chat_id,
                file.to_path_buf(),
                caption.to_string(),
            ));
            Ok(self.alloc(chat_id))
        }

        async fn send_video(
            &self,
            chat_id: ChatId,
            file: &Path,
            caption: &str,
        ) -> Result<MessageRef> {
            self.sent.lock().unwrap().push(Sent::Video(
                chat_id,
                file.to_path_buf(),
                caption.to_string(),
            ));
            Ok(self.alloc(chat_id))
        }

        async fn send_document(
            &self,
            chat_id: ChatId,
            file: &Path,
            caption: &str,
        ) -> Result<MessageRef> {
            self.sent.lock().unwrap().push(Sent::Document(
                chat_id,
                file.to_path_buf(),
                caption.to_string(),
            ));
            Ok(self.alloc(chat_id))
        }

        async fn send_sticker(&self, chat_id: ChatId, file: &Path) -> Result<MessageRef> {
            self.sent
                .lock()
                .unwrap()
                .push(Sent::Sticker(chat_id, file.to_path_buf()));
            Ok(self.alloc(chat_id))
        }

        async fn delete_message(&self, msg: MessageRef) -> Result<()> {
            if self.fail_delete {
                return Err(Error::Transport("message to delete not found".to_string()));
            }
            self.deleted.lock().unwrap().push(msg);
            Ok(())
        }
    }

    #[derive(Default)]
    struct FakeClient {
        downloads: AtomicUsize,
        fail_download: bool,
    }

    impl FakeClient {
        fn failing_download() -> Self {
            Self {
                fail_download: true,
                ..Self::default()
            }
        }
    }

    #[async_trait]
    impl ProtocolClient for FakeClient {
        async fn start(&self) -> Result<()> {
            Ok(())
        }

        async fn download_media(&self, media: &MediaRef) -> Result<MediaPayload> {
            self.downloads.fetch_add(1, Ordering::SeqCst);
            if self.fail_download {
                return Err(Error::Protocol("media decode failed".to_string()));
            }
            Ok(MediaPayload {
                data: b"bytes".to_vec(),
                mimetype: "image/jpeg".to_string(),
                filename: Some(format!("{}.jpg", media.0)),
            })
        }

        async fn shutdown(&self) -> Result<()> {
            Ok(())
        }
    }

    struct FakeSink;

    #[async_trait]
    impl MediaSink for FakeSink {
        async fn persist(&self, payload: &MediaPayload) -> Result<PathBuf> {
            Ok(PathBuf::from("/downloads").join(payload.filename.as_deref().unwrap_or("blob")))
        }
    }

    /// Mirrors the registry: holds one entry which the first teardown (or an
    /// explicit logout) removes.
    struct FakeTeardown {
        entry_present: AtomicBool,
        users: Mutex<Vec<UserId>>,
    }

    impl Default for FakeTeardown {
        fn default() -> Self {
            Self {
                entry_present: AtomicBool::new(true),
                users: Mutex::new(Vec::new()),
            }
        }
    }

    impl FakeTeardown {
        fn logged_out() -> Self {
            Self {
                entry_present: AtomicBool::new(false),
                ..Self::default()
            }
        }
    }

    #[async_trait]
    impl SessionTeardown for FakeTeardown {
        async fn teardown(&self, user: UserId) -> bool {
            self.users.lock().unwrap().push(user);
            self.entry_present.swap(false, Ordering::SeqCst)
        }
    }

    struct Harness {
        relay: EventRelay,
        companion: Arc<FakeCompanion>,
        client: Arc<FakeClient>,
        teardown: Arc<FakeTeardown>,
        // Keeps the trait-object Arc the relay's Weak points at alive.
        _teardown_dyn: Arc<dyn SessionTeardown>,
    }

    fn harness_with(companion: FakeCompanion, client: FakeClient) -> Harness {
        harness_full(companion, client, FakeTeardown::default())
    }

    fn harness_full(
        companion: FakeCompanion,
        client: FakeClient,
        teardown: FakeTeardown,
    ) -> Harness {
        let companion = Arc::new(companion);
        let client = Arc::new(client);
        let teardown = Arc::new(teardown);
        let teardown_dyn: Arc<dyn SessionTeardown> = teardown.clone();
        let relay = EventRelay::new(
            client.clone(),
            companion.clone(),
            Arc::new(FakeSink),
            ChatId(10),
            UserId(1),
            Duration::from_secs(15),
            Arc::downgrade(&teardown_dyn),
        );
        Harness {
            relay,
            companion,
            client,
            teardown,
            _teardown_dyn: teardown_dyn,
        }
    }

    fn harness() -> Harness {
        harness_with(FakeCompanion::default(), FakeClient::default())
    }

    fn text_message(sender: &str, body: &str) -> InboundMessage {
        InboundMessage {
            kind: ContentKind::Text,
            sender_name: Some(sender.to_string()),
            sender_handle: None,
            sender_address: "491700000000".to_string(),
            chat_name: None,
            is_group: false,
            body: Some(body.to_string()),
            media: None,
        }
    }

    fn media_message(kind: ContentKind) -> InboundMessage {
        InboundMessage {
            kind,
            sender_name: Some("Alice".to_string()),
            sender_handle: None,
            sender_address: "491700000000".to_string(),
            chat_name: None,
            is_group: false,
            body: None,
            media: Some(MediaRef("m1".to_string())),
        }
    }

    async fn settle() {
        // Let spawned expiry tasks observe advanced time.
        tokio::time::sleep(Duration::from_millis(1)).await;
    }

    #[tokio::test(start_paused = true)]
    async fn challenge_displays_once_and_expires_its_own_message() {
        let mut h = harness();
        h.relay.handle_event(ProtocolEvent::Challenge {
            code: "2@abc".to_string(),
        })
        .await;

        let sent = h.companion.sent();
        assert_eq!(sent.len(), 1, "exactly one display action per challenge");
        let Sent::PhotoBytes(chat, caption) = &sent[0] else {
            panic!("expected a photo send, got {sent:?}");
        };
        assert_eq!(*chat, ChatId(10));
        assert!(caption.contains("15s"), "caption names the expiry window");

        // Not yet expired.
        tokio::time::advance(Duration::from_secs(14)).await;
        settle().await;
        assert!(h.companion.deleted().is_empty());

        tokio::time::advance(Duration::from_secs(1)).await;
        settle().await;
        let deleted = h.companion.deleted();
        assert_eq!(deleted.len(), 1);
        assert_eq!(deleted[0].message_id, MessageId(1));
    }

    #[tokio::test(start_paused = true)]
    async fn superseded_challenges_expire_independently() {
        let mut h = harness();
        h.relay.handle_event(ProtocolEvent::Challenge {
            code: "2@first".to_string(),
        })
        .await;

        tokio::time::advance(Duration::from_secs(5)).await;
        settle().await;
        h.relay.handle_event(ProtocolEvent::Challenge {
            code: "2@second".to_string(),
        })
        .await;

        assert_eq!(h.companion.sent().len(), 2);

        // First timer fires at +15s, ten seconds from now.
        tokio::time::advance(Duration::from_secs(10)).await;
        settle().await;
        assert_eq!(h.companion.deleted(), vec![MessageRef {
            chat_id: ChatId(10),
            message_id: MessageId(1),
        }]);

        // Second timer fires at its own +15s mark.
        tokio::time::advance(Duration::from_secs(5)).await;
        settle().await;
        assert_eq!(h.companion.deleted().len(), 2);
        assert_eq!(h.companion.deleted()[1].message_id, MessageId(2));
    }

    #[tokio::test(start_paused = true)]
    async fn expired_deletion_failure_is_swallowed() {
        let mut h = harness_with(FakeCompanion::failing_delete(), FakeClient::default());
        h.relay.handle_event(ProtocolEvent::Challenge {
            code: "2@abc".to_string(),
        })
        .await;

        tokio::time::advance(Duration::from_secs(16)).await;
        settle().await;

        // The relay is still healthy: later events are handled normally.
        h.relay.handle_event(ProtocolEvent::Ready).await;
        h.relay
            .handle_event(ProtocolEvent::Message(text_message("Alice", "hi")))
            .await;
        assert_eq!(h.relay.state, RelayState::Authenticated);
        assert_eq!(h.companion.sent().len(), 3);
    }

    #[tokio::test]
    async fn ready_confirms_and_transitions() {
        let mut h = harness();
        h.relay.handle_event(ProtocolEvent::Ready).await;
        assert_eq!(h.relay.state, RelayState::Authenticated);
        assert_eq!(
            h.companion.sent(),
            vec![Sent::Text(
                ChatId(10),
                "✅ WhatsApp connected successfully!".to_string()
            )]
        );
    }

    #[tokio::test]
    async fn text_message_builds_expected_caption() {
        let mut h = harness();
        h.relay.handle_event(ProtocolEvent::Ready).await;
        h.relay
            .handle_event(ProtocolEvent::Message(text_message("Alice", "hello")))
            .await;

        assert_eq!(
            h.companion.sent()[1],
            Sent::Text(
                ChatId(10),
                "📩 From: Alice\n💬 Chat: Alice\n\nhello".to_string()
            )
        );
    }

    #[tokio::test]
    async fn sender_name_falls_back_to_handle_then_address() {
        let mut msg = text_message("ignored", "hi");
        msg.sender_name = None;
        msg.sender_handle = Some("ali".to_string());
        assert_eq!(sender_display_name(&msg), "ali");

        msg.sender_handle = Some("   ".to_string());
        assert_eq!(sender_display_name(&msg), "491700000000");
    }

    #[tokio::test]
    async fn group_chat_uses_group_subject() {
        let mut msg = text_message("Alice", "hi");
        msg.is_group = true;
        msg.chat_name = Some("Family".to_string());

        let sender = sender_display_name(&msg);
        assert_eq!(chat_display_name(&msg, &sender), "Family");

        // Missing group subject falls back to the sender name.
        msg.chat_name = None;
        assert_eq!(chat_display_name(&msg, &sender), "Alice");
    }

    #[tokio::test]
    async fn media_kinds_pick_their_transport_action() {
        let mut h = harness();
        h.relay.handle_event(ProtocolEvent::Ready).await;

        h.relay
            .handle_event(ProtocolEvent::Message(media_message(ContentKind::Image)))
            .await;
        h.relay
            .handle_event(ProtocolEvent::Message(media_message(ContentKind::Sticker)))
            .await;

        let sent = h.companion.sent();
        assert!(matches!(&sent[1], Sent::Photo(_, _, caption) if caption.contains("Alice")));
        // Stickers carry no caption.
        assert!(matches!(&sent[2], Sent::Sticker(_, path) if path.starts_with("/downloads")));
    }

    #[tokio::test]
    async fn unsupported_media_kind_is_dropped_without_download() {
        let mut h = harness();
        h.relay.handle_event(ProtocolEvent::Ready).await;
        h.relay
            .handle_event(ProtocolEvent::Message(media_message(ContentKind::Other)))
            .await;

        assert_eq!(h.client.downloads.load(Ordering::SeqCst), 0);
        assert_eq!(h.companion.sent().len(), 1, "only the ready confirmation");
    }

    #[tokio::test]
    async fn failed_decode_skips_message_but_relay_continues() {
        let mut h = harness_with(FakeCompanion::default(), FakeClient::failing_download());
        h.relay.handle_event(ProtocolEvent::Ready).await;

        h.relay
            .handle_event(ProtocolEvent::Message(media_message(ContentKind::Image)))
            .await;
        assert_eq!(h.companion.sent().len(), 1, "no outbound action for the bad message");
        assert_eq!(h.relay.state, RelayState::Authenticated);

        h.relay
            .handle_event(ProtocolEvent::Message(text_message("Alice", "next")))
            .await;
        assert_eq!(h.companion.sent().len(), 2, "next message relays normally");
    }

    #[tokio::test]
    async fn disconnect_notifies_and_tears_down() {
        let mut h = harness();
        h.relay.handle_event(ProtocolEvent::Ready).await;
        h.relay
            .handle_event(ProtocolEvent::Disconnected {
                reason: Some("logged out".to_string()),
            })
            .await;

        assert_eq!(h.relay.state, RelayState::Terminal);
        assert_eq!(h.teardown.users.lock().unwrap().as_slice(), &[UserId(1)]);
        let sent = h.companion.sent();
        assert!(
            matches!(&sent[1], Sent::Text(_, t) if t.contains("/login")),
            "user is told to re-authenticate"
        );
    }

    #[tokio::test]
    async fn stream_end_without_disconnect_still_tears_down() {
        let h = harness();
        let (tx, rx) = mpsc::unbounded_channel();
        let handle = h.relay.spawn(rx);

        tx.send(ProtocolEvent::Ready).unwrap();
        drop(tx);
        handle.await.unwrap();

        assert_eq!(h.teardown.users.lock().unwrap().as_slice(), &[UserId(1)]);
        let sent = h.companion.sent();
        assert!(
            matches!(&sent[1], Sent::Text(_, t) if t.contains("/login")),
            "a live session that loses its stream is told to re-authenticate"
        );
    }

    #[tokio::test]
    async fn stream_close_after_logout_stays_silent() {
        // /logout removes the registry entry and shuts the client down;
        // the resulting stream close must not prompt a fresh /login.
        let h = harness_full(
            FakeCompanion::default(),
            FakeClient::default(),
            FakeTeardown::logged_out(),
        );
        let (tx, rx) = mpsc::unbounded_channel();
        let handle = h.relay.spawn(rx);

        tx.send(ProtocolEvent::Ready).unwrap();
        drop(tx);
        handle.await.unwrap();

        let sent = h.companion.sent();
        assert_eq!(sent.len(), 1, "only the ready confirmation");
        assert!(matches!(&sent[0], Sent::Text(_, t) if t.contains("connected")));
    }
}
