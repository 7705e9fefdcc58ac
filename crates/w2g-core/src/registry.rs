//! Session registry: the canonical user → session mapping.
//!
//! The registry is the only owner of live sessions. It creates them lazily,
//! reuses live ones, and guarantees at most one session per controlling user.

use std::{collections::HashMap, sync::Arc, time::Duration};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::Mutex;

use crate::{
    domain::{ChatId, ClientId, UserId},
    media::MediaSink,
    messaging::port::CompanionPort,
    protocol::{ProtocolClient, ProtocolClientFactory},
    relay::{EventRelay, SessionTeardown},
    Result,
};

/// A live WhatsApp session bound to one controlling user.
pub struct Session {
    pub user: UserId,
    pub chat: ChatId,
    pub client: Arc<dyn ProtocolClient>,
    pub created_at: DateTime<Utc>,
}

pub struct SessionRegistry {
    factory: Arc<dyn ProtocolClientFactory>,
    companion: Arc<dyn CompanionPort>,
    sink: Arc<dyn MediaSink>,
    qr_lifetime: Duration,
    sessions: Mutex<HashMap<UserId, Arc<Session>>>,
    // Per-user creation locks: a slow bridge spawn for one user must not
    // block other users' creates or disconnect teardown.
    creating: Mutex<HashMap<UserId, Arc<Mutex<()>>>>,
}

impl SessionRegistry {
    pub fn new(
        factory: Arc<dyn ProtocolClientFactory>,
        companion: Arc<dyn CompanionPort>,
        sink: Arc<dyn MediaSink>,
        qr_lifetime: Duration,
    ) -> Arc<Self> {
        Arc::new(Self {
            factory,
            companion,
            sink,
            qr_lifetime,
            sessions: Mutex::new(HashMap::new()),
            creating: Mutex::new(HashMap::new()),
        })
    }

    async fn creation_lock(&self, user: UserId) -> Arc<Mutex<()>> {
        let mut map = self.creating.lock().await;
        map.entry(user)
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    /// Return the live session for `user`, creating one if needed.
    ///
    /// Reuse is idempotent: no new authentication is triggered for a live
    /// session. A synchronous construction/startup failure propagates and
    /// leaves the registry unchanged. Authentication itself completes
    /// asynchronously and is reported through the relay, not here.
    pub async fn create(self: &Arc<Self>, user: UserId, chat: ChatId) -> Result<Arc<Session>> {
        // Held across construction so two concurrent creates for the same
        // user cannot both start a client. The shared map lock is only taken
        // for the lookups themselves.
        let lock = self.creation_lock(user).await;
        let _guard = lock.lock_owned().await;

        if let Some(existing) = self.sessions.lock().await.get(&user) {
            println!("[REGISTRY] reusing session for user {}", user.0);
            return Ok(existing.clone());
        }

        let client_id = ClientId::for_user(user);
        let (client, events) = self.factory.connect(client_id.as_str()).await?;

        if let Err(e) = client.start().await {
            // No zombie state: the client never reaches the registry.
            let _ = client.shutdown().await;
            return Err(e);
        }

        let teardown: Arc<dyn SessionTeardown> = self.clone();
        EventRelay::new(
            client.clone(),
            self.companion.clone(),
            self.sink.clone(),
            chat,
            user,
            self.qr_lifetime,
            Arc::downgrade(&teardown),
        )
        .spawn(events);

        let session = Arc::new(Session {
            user,
            chat,
            client,
            created_at: Utc::now(),
        });
        self.sessions.lock().await.insert(user, session.clone());
        println!("[REGISTRY] new session for user {}", user.0);

        Ok(session)
    }

    /// Remove the session for `user`, if any. A subsequent `create` performs
    /// a fresh authentication rather than reusing a dead handle.
    pub async fn remove(&self, user: UserId) -> Option<Arc<Session>> {
        self.sessions.lock().await.remove(&user)
    }

    /// Explicit teardown initiated by the user: drop the entry and shut the
    /// client down.
    pub async fn logout(&self, user: UserId) -> bool {
        let Some(session) = self.remove(user).await else {
            return false;
        };
        if let Err(e) = session.client.shutdown().await {
            eprintln!("[REGISTRY] shutdown for user {} failed: {e}", user.0);
        }
        true
    }

    pub async fn contains(&self, user: UserId) -> bool {
        self.sessions.lock().await.contains_key(&user)
    }

    pub async fn session(&self, user: UserId) -> Option<Arc<Session>> {
        self.sessions.lock().await.get(&user).cloned()
    }

    pub async fn len(&self) -> usize {
        self.sessions.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.sessions.lock().await.is_empty()
    }
}

#[async_trait]
impl SessionTeardown for SessionRegistry {
    async fn teardown(&self, user: UserId) -> bool {
        let removed = self.remove(user).await.is_some();
        if removed {
            println!(
                "[REGISTRY] session for user {} removed after disconnect",
                user.0
            );
        }
        removed
    }
}
