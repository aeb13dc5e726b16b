//! FlightVars server: accepts client connections and serves variables out
//! of a [`VariableBackend`].

use std::future::Future;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use oac_proto::{Message, MessageType, SubscriptionId, SubscriptionStatus, VariableId, VariableValue, PROTOCOL_VERSION};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{broadcast, watch};
use tokio::task::JoinSet;
use tracing::{debug, info, trace, warn};

use crate::backend::{VarChange, VariableBackend};
use crate::config::ServerConfig;
use crate::error::{CommunicationError, Disconnection, ProtocolError};
use crate::registry::SubscriptionRegistry;
use crate::wire::{FrameReader, FrameWriter};

pub const SHUTDOWN_CAUSE: &str = "server shutdown";

/// How long shutdown waits for sessions to say goodbye.
pub const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

/// Hands out subscription ids unique across every session of one server.
#[derive(Debug)]
pub struct SubscriptionIdGenerator {
    next: AtomicU32,
}

impl Default for SubscriptionIdGenerator {
    fn default() -> Self {
        Self::new()
    }
}

impl SubscriptionIdGenerator {
    pub fn new() -> Self {
        Self { next: AtomicU32::new(1) }
    }

    pub fn next_id(&self) -> SubscriptionId {
        self.next.fetch_add(1, Ordering::Relaxed)
    }
}

struct Shared {
    config: ServerConfig,
    backend: Arc<dyn VariableBackend>,
    ids: SubscriptionIdGenerator,
    next_session: AtomicU64,
}

pub struct FlightVarsServer {
    listener: TcpListener,
    shared: Arc<Shared>,
    shutdown: watch::Sender<bool>,
}

impl FlightVarsServer {
    pub async fn bind(config: ServerConfig, backend: Arc<dyn VariableBackend>) -> Result<Self> {
        let listener = TcpListener::bind(config.listen)
            .await
            .with_context(|| format!("bind {}", config.listen))?;
        let (shutdown, _) = watch::channel(false);
        Ok(Self {
            listener,
            shared: Arc::new(Shared {
                config,
                backend,
                ids: SubscriptionIdGenerator::new(),
                next_session: AtomicU64::new(1),
            }),
            shutdown,
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        self.listener.local_addr().context("listener address")
    }

    pub async fn run(self) -> Result<()> {
        self.run_until(std::future::pending()).await
    }

    /// Accepts connections until `shutdown` completes, then tells every
    /// open session to end with `EndSession{"server shutdown"}` and waits up
    /// to [`SHUTDOWN_GRACE`] for them to finish.
    pub async fn run_until<F: Future<Output = ()>>(self, shutdown: F) -> Result<()> {
        info!("server: {} listening on {}", self.shared.config.name, self.local_addr()?);
        tokio::pin!(shutdown);
        let mut sessions = JoinSet::new();
        loop {
            tokio::select! {
                res = self.listener.accept() => {
                    let (stream, peer) = match res {
                        Ok(conn) => conn,
                        Err(e) => {
                            warn!("server: accept failed: {}", e);
                            continue;
                        }
                    };
                    let id = self.shared.next_session.fetch_add(1, Ordering::Relaxed);
                    let shared = self.shared.clone();
                    let stop = self.shutdown.subscribe();
                    sessions.spawn(async move {
                        match ServerSession::new(id, stream, peer, shared, stop) {
                            Ok(session) => session.run().await,
                            Err(e) => warn!("server: session {} with {}: {}", id, peer, e),
                        }
                    });
                }
                Some(res) = sessions.join_next(), if !sessions.is_empty() => {
                    if let Err(e) = res {
                        warn!("server: session task failed: {}", e);
                    }
                }
                _ = &mut shutdown => break,
            }
        }

        info!("server: shutting down {} sessions", sessions.len());
        self.shutdown.send_replace(true);
        let drained = tokio::time::timeout(SHUTDOWN_GRACE, async {
            while let Some(res) = sessions.join_next().await {
                if let Err(e) = res {
                    warn!("server: session task failed: {}", e);
                }
            }
        })
        .await;
        if drained.is_err() {
            warn!("server: {} sessions still open after {:?}, aborting them", sessions.len(), SHUTDOWN_GRACE);
            sessions.abort_all();
        }
        Ok(())
    }
}

struct ServerSession {
    id: u64,
    peer: SocketAddr,
    reader: FrameReader,
    writer: FrameWriter,
    registry: SubscriptionRegistry,
    changes: broadcast::Receiver<VarChange>,
    stop: watch::Receiver<bool>,
    client_name: Option<String>,
    shared: Arc<Shared>,
}

enum Flow {
    Continue,
    End,
}

impl ServerSession {
    fn new(
        id: u64,
        stream: TcpStream,
        peer: SocketAddr,
        shared: Arc<Shared>,
        stop: watch::Receiver<bool>,
    ) -> Result<Self, CommunicationError> {
        stream.set_nodelay(true)?;
        let (reader, writer) = stream.into_split();
        Ok(Self {
            id,
            peer,
            reader: FrameReader::new(reader, shared.config.recv_buffer_bytes),
            writer: FrameWriter::new(writer, shared.config.send_buffer_bytes),
            registry: SubscriptionRegistry::new(),
            changes: shared.backend.watch(),
            stop,
            client_name: None,
            shared,
        })
    }

    async fn run(mut self) {
        info!("server: session {} opened by {}", self.id, self.peer);
        let outcome = self.drive().await;
        match &outcome {
            Ok(()) => info!("server: session {} closed", self.id),
            Err(e) => warn!("server: session {} closed: {}", self.id, e),
        }
        self.writer.shutdown().await;
    }

    async fn drive(&mut self) -> Disconnection {
        loop {
            let flow = tokio::select! {
                res = self.reader.fill() => match res {
                    Ok(0) => return Err(CommunicationError::ConnectionLost("client closed the connection".into())),
                    Ok(_) => self.on_input().await,
                    Err(e) => return Err(e.into()),
                },
                change = self.changes.recv() => match change {
                    Ok(change) => self.on_change(change).await,
                    Err(broadcast::error::RecvError::Lagged(n)) => {
                        warn!("server: session {} missed {} variable changes", self.id, n);
                        Ok(Flow::Continue)
                    }
                    Err(broadcast::error::RecvError::Closed) => {
                        self.end_session("variable backend closed").await;
                        Ok(Flow::End)
                    }
                },
                _ = self.stop.changed() => {
                    self.end_session(SHUTDOWN_CAUSE).await;
                    Ok(Flow::End)
                }
            };
            match flow {
                Ok(Flow::Continue) => {}
                Ok(Flow::End) => return Ok(()),
                Err(CommunicationError::Protocol(e)) => {
                    self.end_session(&e.to_string()).await;
                    return Err(e.into());
                }
                Err(e) => return Err(e),
            }
        }
    }

    async fn on_input(&mut self) -> Result<Flow, CommunicationError> {
        while let Some(msg) = self.reader.next_message()? {
            if let Flow::End = self.dispatch(msg).await? {
                return Ok(Flow::End);
            }
        }
        Ok(Flow::Continue)
    }

    async fn dispatch(&mut self, msg: Message) -> Result<Flow, CommunicationError> {
        debug!("server: session {} <- {:?}", self.id, msg.message_type());
        match msg {
            Message::BeginSession { peer_name, protocol_version } => {
                if self.client_name.is_some() {
                    return Err(ProtocolError::UnexpectedMessage(MessageType::BeginSession).into());
                }
                if protocol_version != PROTOCOL_VERSION {
                    warn!(
                        "server: session {}: {} speaks protocol 0x{:04x}",
                        self.id, peer_name, protocol_version
                    );
                }
                info!("server: session {} is {}", self.id, peer_name);
                self.client_name = Some(peer_name);
                let name = self.shared.config.name.clone();
                self.send(&Message::BeginSession { peer_name: name, protocol_version: PROTOCOL_VERSION })
                    .await?;
            }
            Message::SubscriptionRequest { var_group, var_name } => {
                self.on_subscribe(VariableId::new(var_group, var_name)).await?;
            }
            Message::UnsubscriptionRequest { subscription_id } => {
                let reply = match self.registry.unregister_subscription(subscription_id) {
                    Ok(var) => {
                        debug!("server: session {} released {} ({})", self.id, subscription_id, var);
                        Message::UnsubscriptionReply {
                            status: SubscriptionStatus::Unsubscribed,
                            subscription_id,
                            cause: String::new(),
                        }
                    }
                    Err(e) => Message::UnsubscriptionReply {
                        status: SubscriptionStatus::NoSuchSubscription,
                        subscription_id,
                        cause: e.to_string(),
                    },
                };
                self.send(&reply).await?;
            }
            Message::VarUpdate { subscription_id, value } => {
                self.on_client_update(subscription_id, value);
            }
            Message::EndSession { cause } => {
                info!("server: session {} ended by client: {}", self.id, cause);
                return Ok(Flow::End);
            }
            other => {
                return Err(ProtocolError::UnexpectedMessage(other.message_type()).into());
            }
        }
        Ok(Flow::Continue)
    }

    async fn on_subscribe(&mut self, var: VariableId) -> Result<(), CommunicationError> {
        let backend = &self.shared.backend;
        if !backend.contains(&var) {
            let cause = format!("no such variable {}", var);
            return self.send(&Message::subscription_reply(SubscriptionStatus::NoSuchVar, &var, 0, cause)).await;
        }
        if let Ok(existing) = self.registry.lookup_by_var(&var) {
            let cause = format!("already subscribed as {}", existing);
            let reply = Message::subscription_reply(SubscriptionStatus::VarAlreadySubscribed, &var, existing, cause);
            return self.send(&reply).await;
        }

        let subscription = self.shared.ids.next_id();
        if let Err(e) = self.registry.register(var.clone(), subscription) {
            let reply = Message::subscription_reply(SubscriptionStatus::Unknown, &var, 0, e.to_string());
            return self.send(&reply).await;
        }
        info!("server: session {} subscribed {} as {}", self.id, var, subscription);
        self.send(&Message::subscription_reply(SubscriptionStatus::Subscribed, &var, subscription, ""))
            .await?;
        if let Some(value) = self.shared.backend.get(&var) {
            self.send(&Message::VarUpdate { subscription_id: subscription, value }).await?;
        }
        Ok(())
    }

    fn on_client_update(&mut self, subscription: SubscriptionId, value: VariableValue) {
        let Ok(var) = self.registry.lookup_by_subscription(subscription) else {
            debug!("server: session {} dropping update for unknown {}", self.id, subscription);
            return;
        };
        trace!("server: session {} sets {} = {}", self.id, var, value);
        if let Err(e) = self.shared.backend.set(var, value, Some(self.id)) {
            warn!("server: session {}: {}", self.id, e);
        }
    }

    async fn on_change(&mut self, change: VarChange) -> Result<Flow, CommunicationError> {
        if change.origin == Some(self.id) {
            return Ok(Flow::Continue);
        }
        if let Ok(subscription) = self.registry.lookup_by_var(&change.var) {
            self.send(&Message::VarUpdate { subscription_id: subscription, value: change.value }).await?;
        }
        Ok(Flow::Continue)
    }

    async fn send(&mut self, msg: &Message) -> Result<(), CommunicationError> {
        self.writer.send(msg).await
    }

    async fn end_session(&mut self, cause: &str) {
        debug!("server: session {} -> EndSession: {}", self.id, cause);
        if let Err(e) = self.send(&Message::EndSession { cause: cause.to_string() }).await {
            debug!("server: session {}: cannot send EndSession: {}", self.id, e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn ids_are_unique_across_threads() {
        let ids = Arc::new(SubscriptionIdGenerator::new());
        let handles: Vec<_> = (0..4)
            .map(|_| {
                let ids = ids.clone();
                std::thread::spawn(move || (0..1000).map(|_| ids.next_id()).collect::<Vec<_>>())
            })
            .collect();
        let mut seen = HashSet::new();
        for h in handles {
            for id in h.join().unwrap() {
                assert!(seen.insert(id), "duplicate id {}", id);
            }
        }
        assert_eq!(seen.len(), 4000);
        assert!(!seen.contains(&0));
    }
}
