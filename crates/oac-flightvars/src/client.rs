use std::future::Future;
use std::sync::Arc;

use oac_proto::{SubscriptionId, VariableId, VariableValue};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot, watch, Mutex};
use tracing::{debug, info, warn};

use crate::config::ClientConfig;
use crate::error::{CommunicationError, Disconnection, FlightVarsError};
use crate::session::{Command, ConnectionState, Session};

const COMMAND_QUEUE_DEPTH: usize = 64;

/// Handle on one FlightVars connection. Cheap to clone; every clone drives
/// the same session.
///
/// The connection is opened by [`connect`](Self::connect) or lazily by the
/// first request. Once the session has ended the client stays closed and
/// every request fails with [`CommunicationError::Closed`].
#[derive(Clone)]
pub struct FlightVarsClient {
    inner: Arc<Inner>,
}

struct Inner {
    config: ClientConfig,
    state: Arc<watch::Sender<ConnectionState>>,
    commands: Mutex<Option<mpsc::Sender<Command>>>,
}

impl FlightVarsClient {
    pub fn new(config: ClientConfig) -> Self {
        let (state, _) = watch::channel(ConnectionState::Disconnected);
        Self {
            inner: Arc::new(Inner {
                config,
                state: Arc::new(state),
                commands: Mutex::new(None),
            }),
        }
    }

    pub fn config(&self) -> &ClientConfig {
        &self.inner.config
    }

    pub fn state(&self) -> ConnectionState {
        self.inner.state.borrow().clone()
    }

    /// Opens the connection and announces this peer. A no-op when already
    /// established. A failed attempt leaves the client `Disconnected`, so it
    /// may be retried.
    pub async fn connect(&self) -> Result<(), CommunicationError> {
        self.sender().await.map(|_| ())
    }

    async fn sender(&self) -> Result<mpsc::Sender<Command>, CommunicationError> {
        let mut commands = self.inner.commands.lock().await;
        if let Some(tx) = commands.as_ref() {
            return Ok(tx.clone());
        }
        if self.state().is_closed() {
            return Err(CommunicationError::Closed);
        }

        let cfg = &self.inner.config;
        let addr = cfg.endpoint();
        self.inner.state.send_replace(ConnectionState::Connecting);
        info!("client: connecting to {}", addr);
        let session = match self.open(&addr).await {
            Ok(session) => session,
            Err(e) => {
                warn!("client: {}", e);
                self.inner.state.send_replace(ConnectionState::Disconnected);
                return Err(e);
            }
        };

        let (tx, rx) = mpsc::channel(COMMAND_QUEUE_DEPTH);
        tokio::spawn(session.run(rx));
        *commands = Some(tx.clone());
        Ok(tx)
    }

    async fn open(&self, addr: &str) -> Result<Session, CommunicationError> {
        let stream = TcpStream::connect(addr)
            .await
            .map_err(|e| CommunicationError::Connect { addr: addr.to_string(), source: Arc::new(e) })?;
        Session::establish(stream, &self.inner.config, self.inner.state.clone()).await
    }

    async fn submit(&self, cmd: Command) -> Result<(), CommunicationError> {
        let tx = self.sender().await?;
        tx.send(cmd).await.map_err(|_| CommunicationError::Closed)
    }

    /// Subscribes to `var`. `handler` runs on the session task for every
    /// update the peer sends for it, starting with the current value.
    pub async fn subscribe<F>(&self, var: &VariableId, handler: F) -> Result<SubscriptionId, FlightVarsError>
    where
        F: Fn(&VariableId, &VariableValue) + Send + Sync + 'static,
    {
        let (reply, rx) = oneshot::channel();
        self.submit(Command::Subscribe {
            var: var.clone(),
            handler: Arc::new(handler),
            timeout: self.inner.config.request_timeout(),
            reply,
        })
        .await?;
        rx.await.map_err(|_| CommunicationError::Closed)?
    }

    pub async fn unsubscribe(&self, subscription: SubscriptionId) -> Result<(), FlightVarsError> {
        let (reply, rx) = oneshot::channel();
        self.submit(Command::Unsubscribe {
            subscription,
            timeout: self.inner.config.request_timeout(),
            reply,
        })
        .await?;
        rx.await.map_err(|_| CommunicationError::Closed)?
    }

    /// Sends a new value for a subscribed variable. The protocol has no
    /// reply for updates, so success means the frame was written.
    pub async fn update(&self, subscription: SubscriptionId, value: VariableValue) -> Result<(), FlightVarsError> {
        let (reply, rx) = oneshot::channel();
        self.submit(Command::Update { subscription, value, reply }).await?;
        rx.await.map_err(|_| CommunicationError::Closed)?
    }

    /// Copy of the live subscriptions, sorted by variable. Empty when no
    /// session is running.
    pub async fn subscriptions(&self) -> Vec<(VariableId, SubscriptionId)> {
        let Some(tx) = self.inner.commands.lock().await.clone() else {
            return Vec::new();
        };
        let (reply, rx) = oneshot::channel();
        if tx.send(Command::Snapshot { reply }).await.is_err() {
            return Vec::new();
        }
        rx.await.unwrap_or_default()
    }

    /// Ends the session with `EndSession{cause}` and waits until it is torn
    /// down. Calling it again, or after the peer hung up, does nothing.
    pub async fn disconnect(&self, cause: &str) -> Disconnection {
        let tx = {
            let commands = self.inner.commands.lock().await;
            match commands.as_ref() {
                Some(tx) => tx.clone(),
                None => {
                    // never connected: nothing to tell the peer
                    self.inner.state.send_if_modified(|state| {
                        if state.is_closed() {
                            return false;
                        }
                        debug!("client: closed before connecting");
                        *state = ConnectionState::Closed(Ok(()));
                        true
                    });
                    return self.disconnection().await;
                }
            }
        };
        let _ = tx.send(Command::Disconnect { cause: cause.to_string() }).await;
        self.disconnection().await
    }

    /// Resolves once the session has ended, with `Ok(())` for a graceful
    /// close and the cause otherwise. Resolves immediately when the session
    /// is already over. Independent of `self`, so it can be awaited anywhere.
    pub fn disconnection(&self) -> impl Future<Output = Disconnection> + Send + 'static {
        let mut rx = self.inner.state.subscribe();
        async move {
            loop {
                let outcome = match &*rx.borrow_and_update() {
                    ConnectionState::Closed(outcome) => Some(outcome.clone()),
                    _ => None,
                };
                if let Some(outcome) = outcome {
                    return outcome;
                }
                if rx.changed().await.is_err() {
                    return Err(CommunicationError::Closed);
                }
            }
        }
    }
}
