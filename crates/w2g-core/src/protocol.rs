//! Port for the WhatsApp side of the relay.
//!
//! The wire protocol is an adapter concern; the core only sees typed
//! lifecycle events and an opaque media-decode operation.

use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::Result;

/// Closed set of inbound content kinds the relay dispatches on.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ContentKind {
    Text,
    Image,
    Video,
    Document,
    Sticker,
    Other,
}

/// Opaque handle to a media attachment, resolvable via
/// [`ProtocolClient::download_media`].
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct MediaRef(pub String);

/// Decoded media payload as produced by the protocol client.
#[derive(Clone, Debug)]
pub struct MediaPayload {
    pub data: Vec<u8>,
    pub mimetype: String,
    pub filename: Option<String>,
}

/// One received WhatsApp message, normalized for relaying.
///
/// Transient: exists only for the duration of one relay operation.
#[derive(Clone, Debug)]
pub struct InboundMessage {
    pub kind: ContentKind,
    /// Contact display name as set in the address book, if any.
    pub sender_name: Option<String>,
    /// Push name / handle the sender chose for themselves, if any.
    pub sender_handle: Option<String>,
    /// Raw protocol address (phone number / JID user part). Always present.
    pub sender_address: String,
    /// Group subject; only meaningful when `is_group` is set.
    pub chat_name: Option<String>,
    pub is_group: bool,
    pub body: Option<String>,
    pub media: Option<MediaRef>,
}

/// Session lifecycle events emitted by a protocol client, in protocol order:
/// zero or more challenges, then ready, then messages, then disconnected.
#[derive(Clone, Debug)]
pub enum ProtocolEvent {
    /// A login QR challenge was (re-)issued.
    Challenge { code: String },
    /// Authentication succeeded; the session is live.
    Ready,
    Message(InboundMessage),
    /// The session ended. Terminal for this client.
    Disconnected { reason: Option<String> },
}

/// A live WhatsApp client bound to one controlling user.
#[async_trait]
pub trait ProtocolClient: Send + Sync {
    /// Issue the startup request. Authentication completes asynchronously and
    /// is reported through the event stream, not through this call.
    async fn start(&self) -> Result<()>;

    /// Decode a media attachment into bytes + declared mimetype.
    async fn download_media(&self, media: &MediaRef) -> Result<MediaPayload>;

    /// Tear the client down. Idempotent.
    async fn shutdown(&self) -> Result<()>;
}

/// Constructs protocol clients bound to the persistent session store.
#[async_trait]
pub trait ProtocolClientFactory: Send + Sync {
    /// Build a client for `client_id` and hand back its event stream.
    ///
    /// A synchronous construction failure here must leave nothing running.
    async fn connect(
        &self,
        client_id: &str,
    ) -> Result<(Arc<dyn ProtocolClient>, mpsc::UnboundedReceiver<ProtocolEvent>)>;
}
