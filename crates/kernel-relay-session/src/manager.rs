//! Session container: owns every live session and the notion of "current".

use std::{
    collections::{HashMap, HashSet},
    sync::{Arc, Mutex, PoisonError},
};

use kernel_relay_core::{
    Channel, ConnectError, CorrelationId, KernelConnector, Message, RelayConfig, SessionArgs,
    SessionIdentity, Sink, SinkRole,
};
use tokio::sync::RwLock;

use crate::session::{Session, SessionError};

/// Session container error.
#[derive(Debug, thiserror::Error)]
pub enum ContainerError {
    #[error("Session already running: {0}")]
    DuplicateIdentity(SessionIdentity),
    #[error("Session not found: {0}")]
    UnknownIdentity(SessionIdentity),
    #[error("Connect error: {0}")]
    Connect(#[from] ConnectError),
    #[error(transparent)]
    Session(#[from] SessionError),
}

#[derive(Default)]
struct Inner {
    sessions: HashMap<SessionIdentity, Arc<Session>>,
    current: Option<SessionIdentity>,
}

/// Registry of live sessions keyed by identity.
pub struct SessionContainer<C>
where
    C: KernelConnector,
{
    connector: C,
    config: RelayConfig,
    inner: RwLock<Inner>,
    /// Identities whose connect is in flight. Only touched while `inner` is
    /// write-locked or from [`Reservation::drop`].
    starting: Mutex<HashSet<SessionIdentity>>,
}

/// Claim on an identity for the duration of one connect.
struct Reservation<'a> {
    starting: &'a Mutex<HashSet<SessionIdentity>>,
    identity: SessionIdentity,
}

impl Drop for Reservation<'_> {
    fn drop(&mut self) {
        self.starting
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&self.identity);
    }
}

impl<C> SessionContainer<C>
where
    C: KernelConnector,
{
    #[must_use]
    pub fn new(connector: C, config: &RelayConfig) -> Self {
        Self {
            connector,
            config: config.clone(),
            inner: RwLock::new(Inner::default()),
            starting: Mutex::new(HashSet::new()),
        }
    }

    #[must_use]
    pub const fn config(&self) -> &RelayConfig {
        &self.config
    }

    /// Connect a new session and make it current.
    ///
    /// The identity is reserved while the connector runs, so other sessions
    /// keep receiving traffic and a second start of the same identity fails
    /// fast. A failed or cancelled connect releases the reservation.
    ///
    /// # Errors
    /// Returns error if the identity is already live or starting, or the
    /// connector fails.
    pub async fn start(
        &self,
        identity: SessionIdentity,
        args: SessionArgs,
    ) -> Result<Arc<Session>, ContainerError> {
        let reservation = self.reserve(&identity).await?;

        let transport = self.connector.connect(&identity, &args).await?;
        let session = Arc::new(Session::new(identity.clone(), args, transport, &self.config));

        let mut inner = self.inner.write().await;
        inner.sessions.insert(identity.clone(), Arc::clone(&session));
        inner.current = Some(identity.clone());
        drop(reservation);

        tracing::info!(session = %identity, live = inner.sessions.len(), "Session started");
        Ok(session)
    }

    async fn reserve(
        &self,
        identity: &SessionIdentity,
    ) -> Result<Reservation<'_>, ContainerError> {
        let inner = self.inner.write().await;
        let mut starting = self.starting.lock().unwrap_or_else(PoisonError::into_inner);
        if inner.sessions.contains_key(identity) || !starting.insert(identity.clone()) {
            return Err(ContainerError::DuplicateIdentity(identity.clone()));
        }
        tracing::debug!(session = %identity, "Connecting session");
        Ok(Reservation {
            starting: &self.starting,
            identity: identity.clone(),
        })
    }

    /// Close and remove a session. Returns `false` if the identity is unknown.
    pub async fn stop(&self, identity: &SessionIdentity) -> bool {
        let mut inner = self.inner.write().await;
        let Some(session) = inner.sessions.remove(identity) else {
            tracing::warn!(session = %identity, "Stop requested for unknown session");
            return false;
        };
        if inner.current.as_ref() == Some(identity) {
            inner.current = None;
        }
        drop(inner);

        session.close();
        tracing::info!(session = %identity, "Session stopped");
        true
    }

    /// Stop every session; returns how many were stopped.
    pub async fn stop_all(&self) -> usize {
        let sessions: Vec<Arc<Session>> = {
            let mut inner = self.inner.write().await;
            inner.current = None;
            inner.sessions.drain().map(|(_, s)| s).collect()
        };
        for session in &sessions {
            session.close();
        }
        if !sessions.is_empty() {
            tracing::info!(count = sessions.len(), "Stopped all sessions");
        }
        sessions.len()
    }

    pub async fn get(&self, identity: &SessionIdentity) -> Option<Arc<Session>> {
        self.inner.read().await.sessions.get(identity).cloned()
    }

    /// Live identities, sorted.
    pub async fn identities(&self) -> Vec<SessionIdentity> {
        let mut ids: Vec<_> = self.inner.read().await.sessions.keys().cloned().collect();
        ids.sort();
        ids
    }

    pub async fn current(&self) -> Option<Arc<Session>> {
        let inner = self.inner.read().await;
        inner
            .current
            .as_ref()
            .and_then(|id| inner.sessions.get(id))
            .cloned()
    }

    /// # Errors
    /// Returns error if no session has that identity.
    pub async fn set_current(&self, identity: &SessionIdentity) -> Result<(), ContainerError> {
        let mut inner = self.inner.write().await;
        if !inner.sessions.contains_key(identity) {
            return Err(ContainerError::UnknownIdentity(identity.clone()));
        }
        inner.current = Some(identity.clone());
        Ok(())
    }

    pub async fn clear_current(&self) {
        self.inner.write().await.current = None;
    }

    /// Deliver one inbound message. Returns `false` if the identity is unknown,
    /// in which case the message is dropped.
    pub async fn handle_message(
        &self,
        identity: &SessionIdentity,
        channel: Channel,
        message: &Message,
    ) -> bool {
        let Some(session) = self.get(identity).await else {
            tracing::debug!(
                session = %identity,
                %channel,
                msg_type = %message.msg_type,
                "Dropping message for unknown session"
            );
            return false;
        };
        session.handle_message(channel, message);
        true
    }

    /// # Errors
    /// Returns error if no session has that identity.
    pub async fn register_sink(
        &self,
        identity: &SessionIdentity,
        role: SinkRole,
        sink: Arc<dyn Sink>,
    ) -> Result<bool, ContainerError> {
        let session = self.require(identity).await?;
        Ok(session.register_sink(role, sink))
    }

    /// # Errors
    /// Returns error if no session has that identity or the execute fails.
    pub async fn execute(
        &self,
        identity: &SessionIdentity,
        code: &str,
    ) -> Result<CorrelationId, ContainerError> {
        let session = self.require(identity).await?;
        Ok(session.execute(code)?)
    }

    async fn require(&self, identity: &SessionIdentity) -> Result<Arc<Session>, ContainerError> {
        self.get(identity)
            .await
            .ok_or_else(|| ContainerError::UnknownIdentity(identity.clone()))
    }
}
