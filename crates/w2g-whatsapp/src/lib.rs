//! WhatsApp bridge adapter.
//!
//! Implements the `w2g-core` protocol ports by driving a sidecar bridge
//! process (one per session) that speaks newline-delimited JSON on stdio:
//!
//! - stdout, bridge → relay: `qr`, `ready`, `message`, `media`,
//!   `credentials`, `disconnected`
//! - stdin, relay → bridge: `start`, `restore`, `download`
//!
//! Credentials never touch this adapter in decoded form beyond the base64
//! framing; they flow between the bridge and the session store as opaque
//! blobs.

use std::{collections::HashMap, path::PathBuf, process::Stdio, sync::Arc, time::Duration};

use async_trait::async_trait;
use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use serde_json::json;
use tokio::{
    io::{AsyncBufReadExt, AsyncWriteExt, BufReader},
    process::{ChildStdin, Command},
    sync::{mpsc, oneshot, Mutex},
};
use tokio_util::sync::CancellationToken;

use w2g_core::{
    errors::Error,
    protocol::{
        ContentKind, InboundMessage, MediaPayload, MediaRef, ProtocolClient,
        ProtocolClientFactory, ProtocolEvent,
    },
    store::SessionStore,
    Result,
};

type PendingDownloads = Arc<Mutex<HashMap<String, oneshot::Sender<Result<MediaPayload>>>>>;

/// Spawns one bridge process per session, bound to the session store for
/// credential persistence.
pub struct BridgeFactory {
    bridge_path: PathBuf,
    store: Arc<dyn SessionStore>,
    download_timeout: Duration,
}

impl BridgeFactory {
    pub fn new(
        bridge_path: impl Into<PathBuf>,
        store: Arc<dyn SessionStore>,
        download_timeout: Duration,
    ) -> Self {
        Self {
            bridge_path: bridge_path.into(),
            store,
            download_timeout,
        }
    }
}

#[async_trait]
impl ProtocolClientFactory for BridgeFactory {
    async fn connect(
        &self,
        client_id: &str,
    ) -> Result<(Arc<dyn ProtocolClient>, mpsc::UnboundedReceiver<ProtocolEvent>)> {
        let credentials = self.store.load(client_id).await?;

        let mut cmd = Command::new(&self.bridge_path);
        cmd.arg("--client-id")
            .arg(client_id)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let mut child = cmd.spawn().map_err(|e| {
            Error::Protocol(format!(
                "failed to spawn bridge {}: {e}",
                self.bridge_path.display()
            ))
        })?;

        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| Error::Protocol("bridge stdin was not captured".to_string()))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| Error::Protocol("bridge stdout was not captured".to_string()))?;
        let stderr = child.stderr.take();

        // Drain stderr in background to avoid blocking on a full pipe.
        if let Some(stderr) = stderr {
            let tag = client_id.to_string();
            tokio::spawn(async move {
                let mut lines = BufReader::new(stderr).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    eprintln!("[BRIDGE {tag}] {line}");
                }
            });
        }

        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let pending: PendingDownloads = Arc::new(Mutex::new(HashMap::new()));
        let cancel = CancellationToken::new();

        let client = Arc::new(BridgeClient {
            client_id: client_id.to_string(),
            stdin: Mutex::new(stdin),
            child: Mutex::new(Some(child)),
            cancel: cancel.clone(),
            pending: pending.clone(),
            download_timeout: self.download_timeout,
        });

        // Hand saved credentials to the bridge before anything starts.
        if let Some(blob) = credentials {
            client
                .send_op(json!({ "op": "restore", "credentials": BASE64.encode(blob) }))
                .await?;
        }

        tokio::spawn(read_bridge_events(
            client_id.to_string(),
            stdout,
            event_tx,
            pending,
            self.store.clone(),
            cancel,
        ));

        Ok((client, event_rx))
    }
}

/// One live bridge process.
pub struct BridgeClient {
    client_id: String,
    stdin: Mutex<ChildStdin>,
    child: Mutex<Option<tokio::process::Child>>,
    cancel: CancellationToken,
    pending: PendingDownloads,
    download_timeout: Duration,
}

impl BridgeClient {
    async fn send_op(&self, op: serde_json::Value) -> Result<()> {
        let mut line = serde_json::to_string(&op)?;
        line.push('\n');

        let mut stdin = self.stdin.lock().await;
        stdin
            .write_all(line.as_bytes())
            .await
            .map_err(|e| Error::Protocol(format!("bridge stdin write failed: {e}")))?;
        stdin
            .flush()
            .await
            .map_err(|e| Error::Protocol(format!("bridge stdin flush failed: {e}")))?;
        Ok(())
    }

    async fn kill_child(&self) -> Result<()> {
        let child = {
            let mut guard = self.child.lock().await;
            guard.take()
        };

        let Some(mut child) = child else {
            return Ok(());
        };

        // If it's already exited, `try_wait` reaps it.
        if child.try_wait()?.is_some() {
            return Ok(());
        }

        match child.kill().await {
            Ok(()) => {
                let _ = child.wait().await?;
            }
            Err(e) => {
                // If it exited between `try_wait` and `kill`, `wait` will reap it.
                if child.try_wait()?.is_none() {
                    let mut guard = self.child.lock().await;
                    *guard = Some(child);
                    return Err(Error::Io(e));
                }
            }
        }

        Ok(())
    }
}

#[async_trait]
impl ProtocolClient for BridgeClient {
    async fn start(&self) -> Result<()> {
        self.send_op(json!({ "op": "start" })).await
    }

    async fn download_media(&self, media: &MediaRef) -> Result<MediaPayload> {
        let (tx, rx) = oneshot::channel();
        {
            let mut pending = self.pending.lock().await;
            pending.insert(media.0.clone(), tx);
        }

        if let Err(e) = self
            .send_op(json!({ "op": "download", "id": media.0 }))
            .await
        {
            self.pending.lock().await.remove(&media.0);
            return Err(e);
        }

        match tokio::time::timeout(self.download_timeout, rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(Error::Protocol(format!(
                "bridge for client {} exited during media download",
                self.client_id
            ))),
            Err(_) => {
                self.pending.lock().await.remove(&media.0);
                Err(Error::Protocol(format!(
                    "media download {} timed out",
                    media.0
                )))
            }
        }
    }

    async fn shutdown(&self) -> Result<()> {
        self.cancel.cancel();
        self.kill_child().await
    }
}

/// Reader loop: parses bridge stdout lines and routes them.
///
/// Malformed lines are per-line failures (logged, skipped); the loop only
/// ends on cancellation or stream end.
async fn read_bridge_events(
    client_id: String,
    stdout: tokio::process::ChildStdout,
    event_tx: mpsc::UnboundedSender<ProtocolEvent>,
    pending: PendingDownloads,
    store: Arc<dyn SessionStore>,
    cancel: CancellationToken,
) {
    let mut lines = BufReader::new(stdout).lines();

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            line = lines.next_line() => {
                let line = match line {
                    Ok(Some(line)) => line,
                    Ok(None) => break,
                    Err(e) => {
                        eprintln!("[BRIDGE {client_id}] stdout read failed: {e}");
                        break;
                    }
                };

                if line.trim().is_empty() {
                    continue;
                }

                let value: serde_json::Value = match serde_json::from_str(&line) {
                    Ok(v) => v,
                    Err(e) => {
                        eprintln!("[BRIDGE {client_id}] unparseable line skipped: {e}");
                        continue;
                    }
                };

                handle_bridge_line(&client_id, value, &event_tx, &pending, store.as_ref()).await;
            }
        }
    }

    // Fail anything still waiting on a media response.
    let mut pending = pending.lock().await;
    for (id, tx) in pending.drain() {
        let _ = tx.send(Err(Error::Protocol(format!(
            "bridge exited before answering media download {id}"
        ))));
    }
}

async fn handle_bridge_line(
    client_id: &str,
    value: serde_json::Value,
    event_tx: &mpsc::UnboundedSender<ProtocolEvent>,
    pending: &PendingDownloads,
    store: &dyn SessionStore,
) {
    let Some(kind) = value.get("type").and_then(|v| v.as_str()) else {
        eprintln!("[BRIDGE {client_id}] line without a type skipped");
        return;
    };

    match kind {
        "qr" => {
            let Some(code) = value.get("code").and_then(|v| v.as_str()) else {
                eprintln!("[BRIDGE {client_id}] qr line without a code skipped");
                return;
            };
            let _ = event_tx.send(ProtocolEvent::Challenge {
                code: code.to_string(),
            });
        }
        "ready" => {
            let _ = event_tx.send(ProtocolEvent::Ready);
        }
        "message" => match parse_inbound(&value) {
            Some(msg) => {
                let _ = event_tx.send(ProtocolEvent::Message(msg));
            }
            None => eprintln!("[BRIDGE {client_id}] malformed message line skipped"),
        },
        "media" => {
            let Some(id) = value.get("id").and_then(|v| v.as_str()) else {
                eprintln!("[BRIDGE {client_id}] media line without an id skipped");
                return;
            };
            let Some(tx) = pending.lock().await.remove(id) else {
                // Late answer for a timed-out request.
                return;
            };
            let _ = tx.send(parse_media(&value));
        }
        "credentials" => {
            let blob = value
                .get("data")
                .and_then(|v| v.as_str())
                .and_then(|s| BASE64.decode(s).ok());
            match blob {
                Some(blob) => {
                    if let Err(e) = store.save(client_id, &blob).await {
                        eprintln!("[BRIDGE {client_id}] credential save failed: {e}");
                    }
                }
                None => eprintln!("[BRIDGE {client_id}] malformed credentials line skipped"),
            }
        }
        "disconnected" => {
            let reason = value
                .get("reason")
                .and_then(|v| v.as_str())
                .map(|s| s.to_string());
            let _ = event_tx.send(ProtocolEvent::Disconnected { reason });
        }
        other => {
            eprintln!("[BRIDGE {client_id}] unknown event type {other:?} skipped");
        }
    }
}

fn parse_inbound(value: &serde_json::Value) -> Option<InboundMessage> {
    let get_str = |k: &str| value.get(k).and_then(|v| v.as_str()).map(|s| s.to_string());

    let sender_address = get_str("sender_address")?;
    let kind = classify_kind(value.get("kind").and_then(|v| v.as_str()).unwrap_or(""));

    Some(InboundMessage {
        kind,
        sender_name: get_str("sender_name"),
        sender_handle: get_str("sender_handle"),
        sender_address,
        chat_name: get_str("chat_name"),
        is_group: value
            .get("is_group")
            .and_then(|v| v.as_bool())
            .unwrap_or(false),
        body: get_str("body"),
        media: get_str("media_id").map(MediaRef),
    })
}

fn parse_media(value: &serde_json::Value) -> Result<MediaPayload> {
    if let Some(err) = value.get("error").and_then(|v| v.as_str()) {
        return Err(Error::Protocol(format!("bridge media download failed: {err}")));
    }

    let data = value
        .get("data")
        .and_then(|v| v.as_str())
        .ok_or_else(|| Error::Protocol("media line without data".to_string()))?;
    let data = BASE64
        .decode(data)
        .map_err(|e| Error::Protocol(format!("media payload is not valid base64: {e}")))?;

    let mimetype = value
        .get("mimetype")
        .and_then(|v| v.as_str())
        .ok_or_else(|| Error::Protocol("media line without a mimetype".to_string()))?
        .to_string();

    Ok(MediaPayload {
        data,
        mimetype,
        filename: value
            .get("filename")
            .and_then(|v| v.as_str())
            .map(|s| s.to_string()),
    })
}

/// The bridge reports the protocol-native message type string.
fn classify_kind(kind: &str) -> ContentKind {
    match kind {
        "chat" => ContentKind::Text,
        "image" => ContentKind::Image,
        "video" => ContentKind::Video,
        "document" => ContentKind::Document,
        "sticker" => ContentKind::Sticker,
        _ => ContentKind::Other,
    }
}
