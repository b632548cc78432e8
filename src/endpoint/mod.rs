
pub(crate) mod tokio_timer;

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use bytes::Bytes;
use tokio::sync::{broadcast, mpsc, oneshot, Mutex};
use util::Conn;

use crate::association::association_stats::AssociationStats;
use crate::association::{Association, AssociationHandler, AssociationState, PacketIo};
use crate::config::Config;
use crate::error::{Error, Result};
use crate::stream::{Message, Reliability};
use crate::timer::TimerHandle;
use tokio_timer::TokioTimerService;

pub(crate) const RECEIVE_MTU: usize = 8192;

/// Names one association hosted by an [`Endpoint`]. It stays valid after the
/// association is gone; calls then fail with
/// [`Error::ErrAssociationNotFound`].
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct AssociationId(u64);

impl fmt::Display for AssociationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Everything an association task reacts to, in arrival order.
pub(crate) enum Command {
    Inbound(Bytes),
    Timeout(TimerHandle),
    Connect(oneshot::Sender<Result<()>>),
    OpenStream {
        stream_identifier: u16,
        ordered: bool,
        reliability: Reliability,
        reply: oneshot::Sender<Result<()>>,
    },
    Send {
        stream_identifier: u16,
        message: Message,
        reliability: Option<Reliability>,
        reply: oneshot::Sender<Result<()>>,
    },
    Shutdown(oneshot::Sender<Result<()>>),
    Abort {
        reason: String,
        reply: oneshot::Sender<Result<()>>,
    },
    State(oneshot::Sender<AssociationState>),
    Stats(oneshot::Sender<AssociationStats>),
    BufferedAmount(oneshot::Sender<usize>),
    SetStreamPriority {
        stream_identifier: u16,
        priority: u16,
        reply: oneshot::Sender<Result<()>>,
    },
    SetBufferedAmountLowThreshold {
        stream_identifier: u16,
        threshold: usize,
        reply: oneshot::Sender<Result<()>>,
    },
}

/// What an association reports back to the application when driven by an
/// [`Endpoint`] with an [`EventForwarder`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AssociationEvent {
    StateChanged {
        state: AssociationState,
        reason: Option<Error>,
    },
    StreamOpened(u16),
    MessageReceived {
        stream_identifier: u16,
        message: Message,
    },
    MessageFailed {
        stream_identifier: u16,
        message: Message,
        error: Error,
    },
    Error(Error),
    BufferedAmountLow(u16),
    TotalBufferedAmountLow,
}

/// AssociationHandler that turns every callback into an [`AssociationEvent`]
/// on an unbounded channel.
pub struct EventForwarder {
    events_tx: mpsc::UnboundedSender<AssociationEvent>,
}

impl EventForwarder {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<AssociationEvent>) {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        (EventForwarder { events_tx }, events_rx)
    }

    fn forward(&self, event: AssociationEvent) {
        // the application stopped listening; nothing left to tell
        let _ = self.events_tx.send(event);
    }
}

impl AssociationHandler for EventForwarder {
    fn on_message_received(&mut self, stream_identifier: u16, message: Message) {
        self.forward(AssociationEvent::MessageReceived {
            stream_identifier,
            message,
        });
    }

    fn on_state_changed(&mut self, state: AssociationState, reason: Option<Error>) {
        self.forward(AssociationEvent::StateChanged { state, reason });
    }

    fn on_message_failed(&mut self, stream_identifier: u16, message: Message, error: Error) {
        self.forward(AssociationEvent::MessageFailed {
            stream_identifier,
            message,
            error,
        });
    }

    fn on_error(&mut self, error: Error) {
        self.forward(AssociationEvent::Error(error));
    }

    fn on_stream_opened(&mut self, stream_identifier: u16) {
        self.forward(AssociationEvent::StreamOpened(stream_identifier));
    }

    fn on_buffered_amount_low(&mut self, stream_identifier: u16) {
        self.forward(AssociationEvent::BufferedAmountLow(stream_identifier));
    }

    fn on_total_buffered_amount_low(&mut self) {
        self.forward(AssociationEvent::TotalBufferedAmountLow);
    }
}

/// Hands outbound packets to the write loop.
struct ConnIo {
    outbound_tx: mpsc::UnboundedSender<Bytes>,
}

impl PacketIo for ConnIo {
    fn send_packet(&mut self, packet: Bytes) {
        if self.outbound_tx.send(packet).is_err() {
            log::debug!("write loop gone, packet discarded");
        }
    }
}

type Registry = Arc<Mutex<HashMap<AssociationId, mpsc::UnboundedSender<Command>>>>;

/// Hosts associations, each on its own tokio task over its own `Conn`.
///
/// Every association is owned by exactly one task. Packets read from the
/// conn, timer expiries and the calls made through this type are queued on
/// that task's command channel and handled one at a time, so an association
/// never needs a lock. When an association reaches Closed its task ends and
/// its id is forgotten.
///
/// May be cloned to obtain another handle to the same endpoint.
#[derive(Clone, Default)]
pub struct Endpoint {
    associations: Registry,
    next_id: Arc<AtomicU64>,
}

impl fmt::Debug for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Endpoint")
            .field("next_id", &self.next_id.load(Ordering::SeqCst))
            .finish()
    }
}

impl Endpoint {
    pub fn new() -> Self {
        Endpoint::default()
    }

    /// Starts an association that initiates the handshake over `net_conn`.
    ///
    /// Must be called from within a tokio runtime context. Returns once the
    /// INIT is on its way; progress is reported through `handler`.
    pub async fn client(
        &self,
        config: Config,
        net_conn: Arc<dyn Conn + Send + Sync>,
        handler: Box<dyn AssociationHandler + Send>,
    ) -> Result<AssociationId> {
        let id = self.spawn(config, net_conn, handler).await;
        self.request(id, Command::Connect).await??;
        Ok(id)
    }

    /// Starts an association that waits for the peer's INIT on `net_conn`.
    ///
    /// Must be called from within a tokio runtime context.
    pub async fn server(
        &self,
        config: Config,
        net_conn: Arc<dyn Conn + Send + Sync>,
        handler: Box<dyn AssociationHandler + Send>,
    ) -> AssociationId {
        self.spawn(config, net_conn, handler).await
    }

    pub async fn open_stream(
        &self,
        id: AssociationId,
        stream_identifier: u16,
        ordered: bool,
        reliability: Reliability,
    ) -> Result<()> {
        self.request(id, |reply| Command::OpenStream {
            stream_identifier,
            ordered,
            reliability,
            reply,
        })
        .await?
    }

    pub async fn send(
        &self,
        id: AssociationId,
        stream_identifier: u16,
        message: Message,
    ) -> Result<()> {
        self.request(id, |reply| Command::Send {
            stream_identifier,
            message,
            reliability: None,
            reply,
        })
        .await?
    }

    pub async fn send_with_reliability(
        &self,
        id: AssociationId,
        stream_identifier: u16,
        message: Message,
        reliability: Reliability,
    ) -> Result<()> {
        self.request(id, |reply| Command::Send {
            stream_identifier,
            message,
            reliability: Some(reliability),
            reply,
        })
        .await?
    }

    pub async fn shutdown(&self, id: AssociationId) -> Result<()> {
        self.request(id, Command::Shutdown).await?
    }

    pub async fn abort(&self, id: AssociationId, reason: &str) -> Result<()> {
        let reason = reason.to_owned();
        self.request(id, |reply| Command::Abort { reason, reply })
            .await?
    }

    pub async fn state(&self, id: AssociationId) -> Result<AssociationState> {
        self.request(id, Command::State).await
    }

    pub async fn stats(&self, id: AssociationId) -> Result<AssociationStats> {
        self.request(id, Command::Stats).await
    }

    pub async fn buffered_amount(&self, id: AssociationId) -> Result<usize> {
        self.request(id, Command::BufferedAmount).await
    }

    pub async fn set_stream_priority(
        &self,
        id: AssociationId,
        stream_identifier: u16,
        priority: u16,
    ) -> Result<()> {
        self.request(id, |reply| Command::SetStreamPriority {
            stream_identifier,
            priority,
            reply,
        })
        .await?
    }

    pub async fn set_buffered_amount_low_threshold(
        &self,
        id: AssociationId,
        stream_identifier: u16,
        threshold: usize,
    ) -> Result<()> {
        self.request(id, |reply| Command::SetBufferedAmountLowThreshold {
            stream_identifier,
            threshold,
            reply,
        })
        .await?
    }

    /// Number of associations not yet closed.
    pub async fn len(&self) -> usize {
        self.associations.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.associations.lock().await.is_empty()
    }

    async fn request<T>(
        &self,
        id: AssociationId,
        make: impl FnOnce(oneshot::Sender<T>) -> Command,
    ) -> Result<T> {
        let cmd_tx = {
            let associations = self.associations.lock().await;
            associations
                .get(&id)
                .cloned()
                .ok_or(Error::ErrAssociationNotFound)?
        };

        let (reply_tx, reply_rx) = oneshot::channel();
        cmd_tx
            .send(make(reply_tx))
            .map_err(|_| Error::ErrAssociationNotFound)?;
        reply_rx.await.map_err(|_| Error::ErrAssociationNotFound)
    }

    async fn spawn(
        &self,
        config: Config,
        net_conn: Arc<dyn Conn + Send + Sync>,
        handler: Box<dyn AssociationHandler + Send>,
    ) -> AssociationId {
        let id = AssociationId(self.next_id.fetch_add(1, Ordering::SeqCst));
        let name = format!("{}#{}", config.name(), id);

        let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
        let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
        let (close_loop_ch_tx, close_loop_ch_rx) = broadcast::channel::<()>(1);

        let timers = TokioTimerService::new(cmd_tx.clone());
        let association = Association::new(
            config,
            Box::new(ConnIo { outbound_tx }),
            Box::new(timers.clone()),
            handler,
        );

        self.associations.lock().await.insert(id, cmd_tx.clone());

        let name1 = name.clone();
        let net_conn1 = Arc::clone(&net_conn);
        tokio::spawn(async move {
            Endpoint::read_loop(name1, net_conn1, close_loop_ch_rx, cmd_tx).await;
        });

        let name2 = name.clone();
        tokio::spawn(async move {
            Endpoint::write_loop(name2, net_conn, outbound_rx).await;
        });

        let associations = Arc::clone(&self.associations);
        tokio::spawn(async move {
            Endpoint::drive(association, cmd_rx, timers).await;
            let _ = close_loop_ch_tx.send(());
            associations.lock().await.remove(&id);
            log::debug!("[{}] association task exited", name);
        });

        id
    }

    async fn read_loop(
        name: String,
        net_conn: Arc<dyn Conn + Send + Sync>,
        mut close_loop_ch: broadcast::Receiver<()>,
        cmd_tx: mpsc::UnboundedSender<Command>,
    ) {
        log::debug!("[{}] read_loop entered", name);

        let mut buffer = vec![0u8; RECEIVE_MTU];
        loop {
            let n = tokio::select! {
                _ = close_loop_ch.recv() => break,
                result = net_conn.recv(&mut buffer) => {
                    match result {
                        Ok(n) => n,
                        Err(err) => {
                            log::warn!("[{}] failed to read packets on net_conn: {}", name, err);
                            break;
                        }
                    }
                }
            };

            log::trace!("[{}] recving {} bytes", name, n);
            let inbound = Bytes::copy_from_slice(&buffer[..n]);
            if cmd_tx.send(Command::Inbound(inbound)).is_err() {
                break;
            }
        }

        log::debug!("[{}] read_loop exited", name);
    }

    /// Writes until the association is dropped, so its last words (ABORT,
    /// SHUTDOWN COMPLETE) still reach the peer.
    async fn write_loop(
        name: String,
        net_conn: Arc<dyn Conn + Send + Sync>,
        mut outbound_rx: mpsc::UnboundedReceiver<Bytes>,
    ) {
        log::debug!("[{}] write_loop entered", name);

        while let Some(raw) = outbound_rx.recv().await {
            log::trace!("[{}] sending {} bytes", name, raw.len());
            if let Err(err) = net_conn.send(&raw).await {
                log::warn!("[{}] failed to write packets on net_conn: {}", name, err);
                break;
            }
        }

        log::debug!("[{}] write_loop exited", name);
    }

    async fn drive(
        mut association: Association,
        mut cmd_rx: mpsc::UnboundedReceiver<Command>,
        timers: TokioTimerService,
    ) {
        while let Some(cmd) = cmd_rx.recv().await {
            match cmd {
                Command::Inbound(raw) => association.handle_packet(&raw),
                Command::Timeout(handle) => {
                    timers.forget(handle);
                    association.handle_timeout(handle);
                }
                Command::Connect(reply) => {
                    let _ = reply.send(association.connect());
                }
                Command::OpenStream {
                    stream_identifier,
                    ordered,
                    reliability,
                    reply,
                } => {
                    let _ = reply.send(association.open_stream(
                        stream_identifier,
                        ordered,
                        reliability,
                    ));
                }
                Command::Send {
                    stream_identifier,
                    message,
                    reliability,
                    reply,
                } => {
                    let result = match reliability {
                        Some(reliability) => association.send_with_reliability(
                            stream_identifier,
                            message,
                            reliability,
                        ),
                        None => association.send(stream_identifier, message),
                    };
                    let _ = reply.send(result);
                }
                Command::Shutdown(reply) => {
                    let _ = reply.send(association.shutdown());
                }
                Command::Abort { reason, reply } => {
                    let _ = reply.send(association.abort(&reason));
                }
                Command::State(reply) => {
                    let _ = reply.send(association.state());
                }
                Command::Stats(reply) => {
                    let _ = reply.send(association.stats());
                }
                Command::BufferedAmount(reply) => {
                    let _ = reply.send(association.buffered_amount());
                }
                Command::SetStreamPriority {
                    stream_identifier,
                    priority,
                    reply,
                } => {
                    let _ = reply.send(association.set_stream_priority(stream_identifier, priority));
                }
                Command::SetBufferedAmountLowThreshold {
                    stream_identifier,
                    threshold,
                    reply,
                } => {
                    let _ = reply.send(
                        association.set_buffered_amount_low_threshold(stream_identifier, threshold),
                    );
                }
            }

            if association.is_closed() {
                break;
            }
        }

        timers.cancel_all();
    }
}
