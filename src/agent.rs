//! The client agent: accepts host-shippable log records, spools them
//! durably, and drains the spool to the host over one supervised TLS
//! connection.
//!
//! Delivery is at-least-once. A record leaves the spool only after the host
//! acknowledges its id; crashes and mid-flight disconnects therefore
//! re-ship rather than lose. Four tasks cooperate on each connection (see
//! the `run_*` functions below), all watching one `die` broadcast, with the
//! writer as the sole owner of the TLS write half.

use async_trait::async_trait;
use std::{
    collections::HashSet,
    sync::Arc,
    time::{Duration, Instant},
};
use thiserror::Error;
use tokio::{
    io::{ReadHalf, WriteHalf},
    net::TcpStream,
    sync::{broadcast, mpsc, Mutex, OnceCell, RwLock},
    task::JoinHandle,
    time::MissedTickBehavior,
};
use tokio_rustls::client::TlsStream;

use crate::{
    backoff::Backoff,
    certificate,
    config::agent::Config,
    database::{
        spool::{self, Spool, SpoolRecord},
        SqlitePool,
    },
    defaults::agent as defaults,
    log::{Handler, Log},
    protocol::{ClientMessage, HostMessage, MessageType},
    transport::{client::Connector, codec},
};

/// Errors are observability, not flow control: the agent surfaces them on
/// this unbounded channel and keeps running wherever it can.
pub type ErrorSink = mpsc::UnboundedSender<Error>;

#[derive(Debug, Error)]
pub enum Error {
    #[error("certificate and key paths are required")]
    CertRequired,
    #[error("Registration error: {0}")]
    Registration(String),
    #[error(transparent)]
    Certificate(#[from] certificate::Error),
    #[error("could not open spool: {0}")]
    SpoolOpen(String),
    #[error(transparent)]
    Spool(#[from] spool::Error),
    #[error(transparent)]
    Tls(#[from] rustls::Error),
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    Codec(#[from] codec::Error),
    #[error("could not serialize log context: {0}")]
    Context(#[from] serde_json::Error),
    /// The host rejected a log record; it stays spooled and will be
    /// retried.
    #[error("record {id} rejected by host: {detail}")]
    Rejected { id: String, detail: String },
    /// A control message (heartbeat, mid-session register) failed on the
    /// host.
    #[error("{message_type} failed: {detail}")]
    Control {
        message_type: MessageType,
        detail: String,
    },
}

pub struct Agent {
    config: Config,
    /// Ids handed to the wire and awaiting acknowledgment. Snapshots are
    /// taken under the read lock; the reader and sender tasks mutate under
    /// the write lock.
    in_flight: Arc<RwLock<HashSet<String>>>,
    spool: OnceCell<SqlitePool>,
    session: Mutex<Option<Session>>,
    die: broadcast::Sender<()>,
}

/// The four tasks sharing one connection, plus the channel they report
/// their death on.
struct Session {
    tasks: Vec<JoinHandle<()>>,
    dead: mpsc::Receiver<()>,
}

impl Session {
    /// Resolves when any task hits a connection-fatal error or exits.
    async fn died(&mut self) {
        self.dead.recv().await;
    }

    fn shutdown(&self) {
        for task in &self.tasks {
            task.abort();
        }
    }
}

impl Agent {
    pub fn new(config: Config) -> Self {
        let (die, _) = broadcast::channel(4);
        Agent {
            config,
            in_flight: Arc::new(RwLock::new(HashSet::new())),
            spool: OnceCell::new(),
            session: Mutex::new(None),
            die,
        }
    }

    /// Open (and migrate) the spool on first use; it outlives individual
    /// connections.
    async fn spool(&self) -> Result<&SqlitePool, Error> {
        self.spool
            .get_or_try_init(|| async {
                let location = match &self.config.spool {
                    Some(location) => location.clone(),
                    None => defaults::spool_location()
                        .map_err(|e| Error::SpoolOpen(e.to_string()))?,
                };
                let pool = location
                    .connect()
                    .await
                    .map_err(|e| Error::SpoolOpen(e.to_string()))?;
                pool.migrate().await?;
                Ok(pool)
            })
            .await
    }

    /// Spool a log record for delivery, returning the number of context
    /// bytes accepted. Values without the host-log capability are silently
    /// ignored: non-spoolable loggers coexist with this one.
    pub async fn handle(&self, log: &dyn Log) -> Result<usize, Error> {
        let host_log = match log.as_host_log() {
            Some(host_log) => host_log,
            None => return Ok(0),
        };
        let context = serde_json::to_vec(&host_log.context())?;
        let written = context.len();
        let record = SpoolRecord::new(
            host_log.log_type(),
            host_log.time(),
            host_log.message().to_vec(),
            context,
        );
        self.spool().await?.put(record).await?;
        Ok(written)
    }

    /// Number of records spooled and not yet acknowledged by the host.
    pub async fn pending(&self) -> Result<u64, Error> {
        Ok(self.spool().await?.pending().await?)
    }

    /// Establish the connection: certificate bootstrap, spool open, TLS
    /// dial, registration handshake, then spawn the per-connection tasks.
    ///
    /// Fails (rather than retries) on registration rejection, so a
    /// misconfigured password is caught at startup.
    pub async fn start(&self, errors: &ErrorSink) -> Result<(), Error> {
        let session = self.connect(errors).await?;
        *self.session.lock().await = Some(session);
        Ok(())
    }

    /// Supervise the connection made by [`start`](Agent::start), redialing
    /// with exponential backoff whenever it dies, until
    /// [`close`](Agent::close) is called.
    pub async fn run(&self, errors: ErrorSink) {
        let mut die = self.die.subscribe();
        let mut backoff = Backoff::new(
            defaults::backoff_initial_delay(),
            defaults::backoff_maximum_delay(),
        );

        loop {
            let mut session = match self.session.lock().await.take() {
                Some(session) => session,
                None => match self.connect(&errors).await {
                    Ok(session) => session,
                    Err(error) => {
                        errors.send(error).ok();
                        tokio::select! {
                            _ = tokio::time::sleep(backoff.next_delay()) => continue,
                            _ = die.recv() => return,
                        }
                    }
                },
            };

            let connected_at = Instant::now();
            let terminated = tokio::select! {
                _ = session.died() => false,
                _ = die.recv() => true,
            };
            session.shutdown();
            // A fresh connection starts with nothing in flight; anything
            // stranded by the old one is still spooled and will re-ship.
            self.in_flight.write().await.clear();

            if terminated {
                return;
            }
            if connected_at.elapsed() >= defaults::backoff_reset_after() {
                backoff.reset();
            }
            tokio::select! {
                _ = tokio::time::sleep(backoff.next_delay()) => {}
                _ = die.recv() => return,
            }
        }
    }

    /// Signal every task to stop and close the spool.
    pub async fn close(&self) {
        let _ = self.die.send(());
        if let Some(session) = self.session.lock().await.take() {
            session.shutdown();
        }
        if let Some(pool) = self.spool.get() {
            pool.close().await;
        }
    }

    async fn connect(&self, errors: &ErrorSink) -> Result<Session, Error> {
        if self.config.certificate.as_os_str().is_empty()
            || self.config.private_key.as_os_str().is_empty()
        {
            return Err(Error::CertRequired);
        }
        let identity = certificate::ensure(
            &self.config.certificate,
            &self.config.private_key,
            defaults::certificate_validity(),
        )
        .await?;
        let spool = self.spool().await?.clone();

        let connector = Connector::new(&identity)?;
        let tls_stream = connector.connect(&self.config.endpoint).await?;
        let (read_half, write_half) = tokio::io::split(tls_stream);
        let mut reader = codec::Reader::new(read_half);
        let mut writer = codec::Writer::new(write_half);

        // Register synchronously, before any task touches the connection.
        writer
            .write(&HostMessage::register(
                &self.config.machine,
                &self.config.service,
                &self.config.password,
            ))
            .await?;
        let ack: ClientMessage = reader
            .read()
            .await
            .map_err(|e| Error::Registration(e.to_string()))?;
        if ack.message_type != MessageType::Register || !ack.is_successful() {
            let detail = if ack.message.is_empty() {
                format!("unexpected {} acknowledgment", ack.message_type)
            } else {
                ack.message
            };
            return Err(Error::Registration(detail));
        }

        let (wr_tx, wr_rx) = mpsc::channel::<HostMessage>(1);
        let (dead_tx, dead_rx) = mpsc::channel::<()>(4);

        let tasks = vec![
            tokio::spawn(run_writer(
                writer,
                wr_rx,
                dead_tx.clone(),
                errors.clone(),
                self.die.subscribe(),
            )),
            tokio::spawn(run_reader(
                reader,
                spool.clone(),
                Arc::clone(&self.in_flight),
                dead_tx.clone(),
                errors.clone(),
                self.die.subscribe(),
            )),
            tokio::spawn(run_sender(
                spool,
                Arc::clone(&self.in_flight),
                wr_tx.clone(),
                self.config.wait_duration,
                errors.clone(),
                self.die.subscribe(),
            )),
            tokio::spawn(run_heartbeat(
                wr_tx,
                self.config.machine.clone(),
                self.config.service.clone(),
                self.config.heartbeat_duration,
                self.die.subscribe(),
            )),
        ];

        Ok(Session {
            tasks,
            dead: dead_rx,
        })
    }
}

#[async_trait]
impl Handler for Agent {
    async fn handle(&self, log: &dyn Log) -> Result<usize, anyhow::Error> {
        Ok(Agent::handle(self, log).await?)
    }
}

/// Sole consumer of the write channel; the only task that touches the TLS
/// write half, so frames never interleave.
async fn run_writer(
    mut writer: codec::Writer<WriteHalf<TlsStream<TcpStream>>>,
    mut messages: mpsc::Receiver<HostMessage>,
    dead: mpsc::Sender<()>,
    errors: ErrorSink,
    mut die: broadcast::Receiver<()>,
) {
    loop {
        tokio::select! {
            message = messages.recv() => match message {
                Some(message) => {
                    if let Err(error) = writer.write(&message).await {
                        errors.send(error.into()).ok();
                        dead.send(()).await.ok();
                        return;
                    }
                }
                None => return,
            },
            _ = die.recv() => return,
        }
    }
}

/// Streams acknowledgments off the connection and settles the in-flight
/// set: delete the record on success, retain it for retry on failure.
async fn run_reader(
    mut reader: codec::Reader<ReadHalf<TlsStream<TcpStream>>>,
    spool: SqlitePool,
    in_flight: Arc<RwLock<HashSet<String>>>,
    dead: mpsc::Sender<()>,
    errors: ErrorSink,
    mut die: broadcast::Receiver<()>,
) {
    loop {
        let message: ClientMessage = tokio::select! {
            result = reader.read::<ClientMessage>() => match result {
                Ok(message) => message,
                Err(codec::Error::Closed) => {
                    dead.send(()).await.ok();
                    return;
                }
                Err(error) => {
                    errors.send(error.into()).ok();
                    dead.send(()).await.ok();
                    return;
                }
            },
            _ = die.recv() => return,
        };

        if message.id.is_empty() {
            // Control acks; only failures are worth surfacing.
            if !message.is_successful() {
                errors
                    .send(Error::Control {
                        message_type: message.message_type,
                        detail: message.message,
                    })
                    .ok();
            }
            continue;
        }

        in_flight.write().await.remove(&message.id);
        if message.is_successful() {
            if let Err(error) = spool.delete(&message.id).await {
                errors.send(error.into()).ok();
            }
        } else {
            // The record stays spooled; the sender re-ships it next cycle.
            errors
                .send(Error::Rejected {
                    id: message.id,
                    detail: message.message,
                })
                .ok();
        }
    }
}

/// Every `wait` period, ship whatever is spooled and not already in
/// flight.
async fn run_sender(
    spool: SqlitePool,
    in_flight: Arc<RwLock<HashSet<String>>>,
    messages: mpsc::Sender<HostMessage>,
    wait: Duration,
    errors: ErrorSink,
    mut die: broadcast::Receiver<()>,
) {
    let mut ticker = tokio::time::interval(wait);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    loop {
        tokio::select! {
            _ = ticker.tick() => {}
            _ = die.recv() => return,
        }

        let snapshot = in_flight.read().await.clone();
        let records = match spool.list(&snapshot).await {
            Ok(records) => records,
            Err(error) => {
                // Skip this cycle; the records are still spooled.
                errors.send(error.into()).ok();
                continue;
            }
        };

        for record in records {
            in_flight.write().await.insert(record.id.clone());
            let message = HostMessage::log(
                record.id,
                record.log_type,
                record.log_time,
                record.message,
                record.context,
            );
            tokio::select! {
                result = messages.send(message) => if result.is_err() { return },
                _ = die.recv() => return,
            }
        }
    }
}

/// Every `heartbeat` period, enqueue a liveness tick.
async fn run_heartbeat(
    messages: mpsc::Sender<HostMessage>,
    machine: String,
    service: String,
    heartbeat: Duration,
    mut die: broadcast::Receiver<()>,
) {
    let mut ticker = tokio::time::interval(heartbeat);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    loop {
        tokio::select! {
            _ = ticker.tick() => {}
            _ = die.recv() => return,
        }
        tokio::select! {
            result = messages.send(HostMessage::heartbeat(&machine, &service)) => {
                if result.is_err() {
                    return;
                }
            }
            _ = die.recv() => return,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::database::DatabaseLocation;
    use crate::log::Record;
    use std::path::PathBuf;

    fn test_config(spool: Option<DatabaseLocation>) -> Config {
        Config {
            endpoint: "localhost:9090".to_string(),
            certificate: PathBuf::new(),
            private_key: PathBuf::new(),
            machine: "m1".to_string(),
            service: "s1".to_string(),
            password: "p".to_string(),
            wait_duration: Duration::from_millis(50),
            heartbeat_duration: Duration::from_millis(50),
            spool,
        }
    }

    #[tokio::test]
    async fn empty_certificate_paths_are_fatal() {
        let agent = Agent::new(test_config(Some(DatabaseLocation::Ephemeral)));
        let (errors, _drain) = mpsc::unbounded_channel();

        match agent.start(&errors).await {
            Err(Error::CertRequired) => {}
            other => panic!("expected CertRequired, got {:?}", other.map(|_| ())),
        }
    }

    #[tokio::test]
    async fn handle_spools_host_logs_and_ignores_plain_ones() {
        let agent = Agent::new(test_config(Some(DatabaseLocation::Ephemeral)));

        struct PlainLog;
        impl Log for PlainLog {
            fn bytes(&self) -> &[u8] {
                b"local"
            }
        }

        assert_eq!(agent.handle(&PlainLog).await.unwrap(), 0);
        assert_eq!(agent.pending().await.unwrap(), 0);

        let record = Record::new("X", "hello").with_context(serde_json::json!({"a": 1}));
        let written = agent.handle(&record).await.unwrap();
        assert!(written > 0);
        assert_eq!(agent.pending().await.unwrap(), 1);
    }
}
