//! Client side of a FlightVars connection.
//!
//! One [`Session`] task owns the socket, both ring buffers, the subscription
//! registry and the table of requests waiting for a reply. Other tasks talk
//! to it only through [`Command`]s and get their answers back on oneshot
//! channels, so none of that state is shared.

use std::cmp::Reverse;
use std::collections::{BTreeMap, BinaryHeap, HashMap};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;
use std::time::Duration;

use oac_proto::codec;
use oac_proto::{Message, MessageType, SubscriptionId, SubscriptionStatus, VariableId, VariableValue, PROTOCOL_VERSION};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::time::{sleep_until, Instant};
use tracing::{debug, info, trace, warn};

use crate::config::ClientConfig;
use crate::error::{
    CommunicationError, Disconnection, FlightVarsError, ProtocolError, RequestTimeoutError,
};
use crate::registry::SubscriptionRegistry;
use crate::wire::{FrameReader, FrameWriter};

/// Callback invoked on the session task for every update of a subscribed variable.
pub type UpdateHandler = Arc<dyn Fn(&VariableId, &VariableValue) + Send + Sync>;

#[derive(Debug, Clone)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Established,
    Closing,
    /// Final state, carrying how the session ended.
    Closed(Disconnection),
}

impl ConnectionState {
    pub fn is_closed(&self) -> bool {
        matches!(self, ConnectionState::Closed(_))
    }

    pub fn is_established(&self) -> bool {
        matches!(self, ConnectionState::Established)
    }
}

pub(crate) enum Command {
    Subscribe {
        var: VariableId,
        handler: UpdateHandler,
        timeout: Duration,
        reply: oneshot::Sender<Result<SubscriptionId, FlightVarsError>>,
    },
    Unsubscribe {
        subscription: SubscriptionId,
        timeout: Duration,
        reply: oneshot::Sender<Result<(), FlightVarsError>>,
    },
    Update {
        subscription: SubscriptionId,
        value: VariableValue,
        reply: oneshot::Sender<Result<(), FlightVarsError>>,
    },
    Snapshot {
        reply: oneshot::Sender<Vec<(VariableId, SubscriptionId)>>,
    },
    Disconnect {
        cause: String,
    },
}

impl Command {
    fn reject(self, err: CommunicationError) {
        match self {
            Command::Subscribe { reply, .. } => {
                let _ = reply.send(Err(err.into()));
            }
            Command::Unsubscribe { reply, .. } | Command::Update { reply, .. } => {
                let _ = reply.send(Err(err.into()));
            }
            Command::Snapshot { reply } => {
                let _ = reply.send(Vec::new());
            }
            Command::Disconnect { .. } => {}
        }
    }
}

struct PendingSubscribe {
    var: VariableId,
    handler: UpdateHandler,
    issued_at: Instant,
    timeout: Duration,
    reply: oneshot::Sender<Result<SubscriptionId, FlightVarsError>>,
}

struct PendingUnsubscribe {
    subscription: SubscriptionId,
    issued_at: Instant,
    timeout: Duration,
    reply: oneshot::Sender<Result<(), FlightVarsError>>,
}

enum Flow {
    Continue,
    End(Disconnection),
}

pub(crate) struct Session {
    reader: FrameReader,
    writer: FrameWriter,
    registry: SubscriptionRegistry,
    handlers: HashMap<SubscriptionId, UpdateHandler>,
    // keyed by correlation id, so iteration finds the oldest matching request
    subscribes: BTreeMap<u64, PendingSubscribe>,
    unsubscribes: BTreeMap<u64, PendingUnsubscribe>,
    deadlines: BinaryHeap<Reverse<(Instant, u64)>>,
    next_correlation: u64,
    server_name: Option<String>,
    state: Arc<watch::Sender<ConnectionState>>,
}

impl Session {
    /// Announces this peer with `BeginSession` and moves to `Established`.
    pub async fn establish(
        stream: TcpStream,
        config: &ClientConfig,
        state: Arc<watch::Sender<ConnectionState>>,
    ) -> Result<Self, CommunicationError> {
        stream.set_nodelay(true)?;
        let (reader, writer) = stream.into_split();
        let mut session = Self {
            reader: FrameReader::new(reader, config.recv_buffer_bytes),
            writer: FrameWriter::new(writer, config.send_buffer_bytes),
            registry: SubscriptionRegistry::new(),
            handlers: HashMap::new(),
            subscribes: BTreeMap::new(),
            unsubscribes: BTreeMap::new(),
            deadlines: BinaryHeap::new(),
            next_correlation: 1,
            server_name: None,
            state,
        };
        session
            .writer
            .send(&Message::BeginSession {
                peer_name: config.peer_name.clone(),
                protocol_version: PROTOCOL_VERSION,
            })
            .await?;
        session.state.send_replace(ConnectionState::Established);
        info!("session: established as {:?}", config.peer_name);
        Ok(session)
    }

    pub async fn run(mut self, mut commands: mpsc::Receiver<Command>) {
        let outcome = self.drive(&mut commands).await;
        self.teardown(outcome, &mut commands).await;
    }

    async fn drive(&mut self, commands: &mut mpsc::Receiver<Command>) -> Disconnection {
        loop {
            let deadline = self.next_deadline();
            let flow = tokio::select! {
                cmd = commands.recv() => match cmd {
                    Some(cmd) => self.on_command(cmd).await,
                    None => {
                        debug!("session: all client handles dropped");
                        self.end_session("client gone").await;
                        Ok(Flow::End(Ok(())))
                    }
                },
                res = self.reader.fill() => match res {
                    Ok(0) => Err(CommunicationError::ConnectionLost("peer closed the connection".into())),
                    Ok(n) => {
                        trace!("session: received {} bytes", n);
                        self.on_input().await
                    }
                    Err(e) => Err(e.into()),
                },
                _ = sleep_until(deadline.unwrap_or_else(Instant::now)), if deadline.is_some() => {
                    self.expire_requests(Instant::now());
                    Ok(Flow::Continue)
                }
            };
            match flow {
                Ok(Flow::Continue) => {}
                Ok(Flow::End(outcome)) => return outcome,
                Err(e) => return Err(e),
            }
        }
    }

    async fn on_input(&mut self) -> Result<Flow, CommunicationError> {
        while let Some(msg) = self.reader.next_message()? {
            if let Flow::End(outcome) = self.dispatch(msg).await? {
                return Ok(Flow::End(outcome));
            }
        }
        Ok(Flow::Continue)
    }

    async fn dispatch(&mut self, msg: Message) -> Result<Flow, CommunicationError> {
        debug!("session: <- {:?}", msg.message_type());
        match msg {
            Message::SubscriptionReply { status, var_group, var_name, subscription_id, cause } => {
                let var = VariableId::new(var_group, var_name);
                self.on_subscription_reply(status, var, subscription_id, cause).await?;
            }
            Message::UnsubscriptionReply { status, subscription_id, cause } => {
                self.on_unsubscription_reply(status, subscription_id, cause);
            }
            Message::VarUpdate { subscription_id, value } => {
                self.on_var_update(subscription_id, value);
            }
            Message::EndSession { cause } => {
                info!("session: peer ended the session: {}", cause);
                return Ok(Flow::End(Ok(())));
            }
            Message::BeginSession { peer_name, protocol_version } => {
                if self.server_name.is_some() {
                    return Err(ProtocolError::UnexpectedMessage(MessageType::BeginSession).into());
                }
                if protocol_version != PROTOCOL_VERSION {
                    warn!(
                        "session: peer {} speaks protocol 0x{:04x}, we speak 0x{:04x}",
                        peer_name, protocol_version, PROTOCOL_VERSION
                    );
                }
                info!("session: connected to {}", peer_name);
                self.server_name = Some(peer_name);
            }
            other => {
                return Err(ProtocolError::UnexpectedMessage(other.message_type()).into());
            }
        }
        Ok(Flow::Continue)
    }

    async fn on_subscription_reply(
        &mut self,
        status: SubscriptionStatus,
        var: VariableId,
        subscription: SubscriptionId,
        cause: String,
    ) -> Result<(), CommunicationError> {
        let key = self.subscribes.iter().find(|(_, p)| p.var == var).map(|(k, _)| *k);
        let Some(pending) = key.and_then(|k| self.subscribes.remove(&k)) else {
            if status == SubscriptionStatus::Subscribed {
                // the request already timed out; give the subscription back
                warn!("session: late subscription of {} as {}, releasing it", var, subscription);
                self.send(&Message::UnsubscriptionRequest { subscription_id: subscription }).await?;
            } else {
                debug!("session: ignoring unsolicited {:?} reply for {}", status, var);
            }
            return Ok(());
        };

        let result = match status {
            SubscriptionStatus::Subscribed => match self.registry.register(var.clone(), subscription) {
                Ok(()) => {
                    self.handlers.insert(subscription, pending.handler);
                    info!("session: subscribed to {} as {}", var, subscription);
                    Ok(subscription)
                }
                Err(e) => {
                    warn!("session: cannot register {} as {}: {}", var, subscription, e);
                    Err(e.into())
                }
            },
            SubscriptionStatus::NoSuchVar => Err(FlightVarsError::NoSuchVariable(var)),
            SubscriptionStatus::VarAlreadySubscribed => Err(FlightVarsError::AlreadySubscribed(var)),
            other => Err(FlightVarsError::Rejected { status: other, cause }),
        };
        trace!("session: subscribe answered after {:?}", pending.issued_at.elapsed());
        let _ = pending.reply.send(result);
        Ok(())
    }

    fn on_unsubscription_reply(&mut self, status: SubscriptionStatus, subscription: SubscriptionId, cause: String) {
        let key = self
            .unsubscribes
            .iter()
            .find(|(_, p)| p.subscription == subscription)
            .map(|(k, _)| *k);
        let Some(pending) = key.and_then(|k| self.unsubscribes.remove(&k)) else {
            if matches!(status, SubscriptionStatus::Unsubscribed | SubscriptionStatus::NoSuchSubscription) {
                // the request already timed out, but the peer has dropped it
                warn!("session: late release of {}, forgetting it", subscription);
                self.forget(subscription);
            } else {
                debug!("session: ignoring unsolicited {:?} reply for {}", status, subscription);
            }
            return;
        };

        let result = match status {
            SubscriptionStatus::Unsubscribed => {
                self.forget(subscription);
                info!("session: unsubscribed {}", subscription);
                Ok(())
            }
            SubscriptionStatus::NoSuchSubscription => {
                // the peer no longer knows it, so neither should we
                self.forget(subscription);
                Err(FlightVarsError::NoSuchSubscription(subscription))
            }
            other => Err(FlightVarsError::Rejected { status: other, cause }),
        };
        trace!("session: unsubscribe answered after {:?}", pending.issued_at.elapsed());
        let _ = pending.reply.send(result);
    }

    fn on_var_update(&mut self, subscription: SubscriptionId, value: VariableValue) {
        let Ok(var) = self.registry.lookup_by_subscription(subscription) else {
            trace!("session: dropping update for unknown subscription {}", subscription);
            return;
        };
        let Some(handler) = self.handlers.get(&subscription) else {
            return;
        };
        trace!("session: {} = {}", var, value);
        if catch_unwind(AssertUnwindSafe(|| handler(var, &value))).is_err() {
            warn!("session: update handler for {} panicked", var);
        }
    }

    fn forget(&mut self, subscription: SubscriptionId) {
        let _ = self.registry.unregister_subscription(subscription);
        self.handlers.remove(&subscription);
    }

    async fn on_command(&mut self, cmd: Command) -> Result<Flow, CommunicationError> {
        match cmd {
            Command::Subscribe { var, handler, timeout, reply } => {
                if self.registry.contains_var(&var) || self.subscribes.values().any(|p| p.var == var) {
                    let _ = reply.send(Err(FlightVarsError::AlreadySubscribed(var)));
                    return Ok(Flow::Continue);
                }
                let frame = match self.writer.stage(&Message::subscription_request(&var)) {
                    Ok(frame) => frame,
                    Err(e) => {
                        let msg = format!("cannot encode request for {}: {}", var, e);
                        let _ = reply.send(Err(FlightVarsError::IllegalValue(msg)));
                        return Ok(Flow::Continue);
                    }
                };
                let (key, issued_at) = self.track(timeout);
                debug!("session: -> subscribe {} (request {})", var, key);
                self.subscribes.insert(key, PendingSubscribe { var, handler, issued_at, timeout, reply });
                self.writer.transmit(&frame).await?;
            }
            Command::Unsubscribe { subscription, timeout, reply } => {
                if !self.registry.contains_subscription(subscription) {
                    let _ = reply.send(Err(FlightVarsError::NoSuchSubscription(subscription)));
                    return Ok(Flow::Continue);
                }
                let (key, issued_at) = self.track(timeout);
                debug!("session: -> unsubscribe {} (request {})", subscription, key);
                self.unsubscribes.insert(key, PendingUnsubscribe { subscription, issued_at, timeout, reply });
                self.send(&Message::UnsubscriptionRequest { subscription_id: subscription }).await?;
            }
            Command::Update { subscription, value, reply } => {
                if !self.registry.contains_subscription(subscription) {
                    let _ = reply.send(Err(FlightVarsError::NoSuchSubscription(subscription)));
                    return Ok(Flow::Continue);
                }
                if let VariableValue::Float(v) = value {
                    if !codec::is_representable_float(v) {
                        let msg = format!("{} has no wire form; floats must be positive and finite", v);
                        let _ = reply.send(Err(FlightVarsError::IllegalValue(msg)));
                        return Ok(Flow::Continue);
                    }
                }
                debug!("session: -> update {} = {}", subscription, value);
                match self.send(&Message::VarUpdate { subscription_id: subscription, value }).await {
                    Ok(()) => {
                        let _ = reply.send(Ok(()));
                    }
                    Err(e) => {
                        let _ = reply.send(Err(e.clone().into()));
                        return Err(e);
                    }
                }
            }
            Command::Snapshot { reply } => {
                let _ = reply.send(self.registry.snapshot());
            }
            Command::Disconnect { cause } => {
                self.end_session(&cause).await;
                return Ok(Flow::End(Ok(())));
            }
        }
        Ok(Flow::Continue)
    }

    async fn send(&mut self, msg: &Message) -> Result<(), CommunicationError> {
        self.writer.send(msg).await
    }

    async fn end_session(&mut self, cause: &str) {
        info!("session: ending session: {}", cause);
        if let Err(e) = self.send(&Message::EndSession { cause: cause.to_string() }).await {
            debug!("session: cannot send EndSession: {}", e);
        }
    }

    fn track(&mut self, timeout: Duration) -> (u64, Instant) {
        let key = self.next_correlation;
        self.next_correlation += 1;
        let now = Instant::now();
        self.deadlines.push(Reverse((now + timeout, key)));
        (key, now)
    }

    /// Earliest deadline of a request that is still waiting. Entries of
    /// requests already answered are discarded on the way.
    fn next_deadline(&mut self) -> Option<Instant> {
        while let Some(Reverse((at, key))) = self.deadlines.peek().copied() {
            if self.subscribes.contains_key(&key) || self.unsubscribes.contains_key(&key) {
                return Some(at);
            }
            self.deadlines.pop();
        }
        None
    }

    fn expire_requests(&mut self, now: Instant) {
        while let Some(Reverse((at, key))) = self.deadlines.peek().copied() {
            if at > now {
                break;
            }
            self.deadlines.pop();
            if let Some(p) = self.subscribes.remove(&key) {
                warn!("session: subscribe {} timed out after {:?}", p.var, p.timeout);
                let _ = p.reply.send(Err(timeout_error(p.timeout)));
            } else if let Some(p) = self.unsubscribes.remove(&key) {
                warn!("session: unsubscribe {} timed out after {:?}", p.subscription, p.timeout);
                let _ = p.reply.send(Err(timeout_error(p.timeout)));
            }
        }
    }

    async fn teardown(&mut self, outcome: Disconnection, commands: &mut mpsc::Receiver<Command>) {
        self.state.send_replace(ConnectionState::Closing);
        let reason = match &outcome {
            Ok(()) => {
                info!("session: closed");
                "session ended".to_string()
            }
            Err(e) => {
                warn!("session: closed: {}", e);
                e.to_string()
            }
        };

        let lost = CommunicationError::ConnectionLost(reason);
        for (_, p) in std::mem::take(&mut self.subscribes) {
            let _ = p.reply.send(Err(lost.clone().into()));
        }
        for (_, p) in std::mem::take(&mut self.unsubscribes) {
            let _ = p.reply.send(Err(lost.clone().into()));
        }
        self.deadlines.clear();
        self.registry.clear();
        self.handlers.clear();

        commands.close();
        while let Ok(cmd) = commands.try_recv() {
            cmd.reject(CommunicationError::Closed);
        }

        self.writer.shutdown().await;
        self.state.send_replace(ConnectionState::Closed(outcome));
    }
}

fn timeout_error(timeout: Duration) -> FlightVarsError {
    CommunicationError::from(RequestTimeoutError { timeout }).into()
}
