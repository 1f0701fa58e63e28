//! The host server: accepts mutually-authenticated TLS connections from
//! agents, binds each client certificate to a registered service, and
//! persists heartbeats and log records.
//!
//! Each connection runs its own handler task plus one writer task; the
//! only shared mutable state across connections is the signature cache and
//! the repositories.

use futures::Future;
use std::{
    collections::HashMap,
    net::SocketAddr,
    sync::Arc,
};
use thiserror::Error;
use tokio::{
    io::ReadHalf,
    net::{TcpListener, TcpSocket, TcpStream},
    sync::{mpsc, RwLock},
    task::JoinSet,
};
use tokio_rustls::{server::TlsStream, TlsAcceptor};
use tracing::{error, info};

use crate::{
    backoff::Backoff,
    certificate,
    config::host::Config,
    database::host::{self as repository, LogRepository, Service, ServiceRepository},
    defaults::host as defaults,
    protocol::{ClientMessage, HostMessage, MessageType},
    transport::{codec, server as tls},
};

/// Errors are observability, not flow control: the host surfaces them on
/// this unbounded channel and keeps serving.
pub type ErrorSink = mpsc::UnboundedSender<Error>;

#[derive(Debug, Error)]
pub enum Error {
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    Codec(#[from] codec::Error),
    #[error(transparent)]
    Certificate(#[from] certificate::Error),
    #[error(transparent)]
    Repository(#[from] repository::Error),
    #[error("connection presented no client certificate")]
    MissingClientCertificate,
}

pub struct Host {
    config: Config,
    services: Arc<dyn ServiceRepository>,
    logs: Arc<dyn LogRepository>,
    /// Fingerprint → bound service. Read-heavy; only registration writes.
    sig_cache: RwLock<HashMap<String, Service>>,
}

impl Host {
    pub fn new(
        config: Config,
        services: Arc<dyn ServiceRepository>,
        logs: Arc<dyn LogRepository>,
    ) -> Self {
        Host {
            config,
            services,
            logs,
            sig_cache: RwLock::new(HashMap::new()),
        }
    }

    pub fn check_password(&self, offered: &[u8]) -> bool {
        offered == self.config.password.as_bytes()
    }

    /// Load the keypair and bind the listener.
    pub async fn listen(&self) -> Result<(TcpListener, TlsAcceptor), Error> {
        let acceptor = tls::acceptor(&self.config.certificate, &self.config.private_key)?;
        let address = SocketAddr::from((self.config.address, self.config.port));

        // Reusing the address lets a restarted host rebind while old
        // connections linger in TIME_WAIT.
        let socket = match address {
            SocketAddr::V4(_) => TcpSocket::new_v4()?,
            SocketAddr::V6(_) => TcpSocket::new_v6()?,
        };
        socket.set_reuseaddr(true)?;
        socket.bind(address)?;
        let listener = socket.listen(1024)?;

        info!("serving on: {:?}", listener.local_addr()?);
        Ok((listener, acceptor))
    }

    /// Accept connections until `terminate` resolves, handling each on its
    /// own task. Accept errors back off exponentially; a successful accept
    /// resets the delay. Termination closes every live connection.
    pub async fn serve(
        self: Arc<Self>,
        listener: TcpListener,
        acceptor: TlsAcceptor,
        errors: ErrorSink,
        terminate: impl Future<Output = ()> + Send,
    ) {
        tokio::pin!(terminate);
        let mut backoff = Backoff::new(
            defaults::backoff_initial_delay(),
            defaults::backoff_maximum_delay(),
        );
        let mut handlers = JoinSet::new();

        loop {
            let accepted = tokio::select! {
                accepted = listener.accept() => accepted,
                Some(_finished) = handlers.join_next(), if !handlers.is_empty() => continue,
                () = &mut terminate => break,
            };

            match accepted {
                Err(error) => {
                    errors.send(error.into()).ok();
                    tokio::select! {
                        _ = tokio::time::sleep(backoff.next_delay()) => continue,
                        () = &mut terminate => break,
                    }
                }
                Ok((tcp_stream, address)) => {
                    backoff.reset();
                    if let Err(error) = tcp_stream.set_nodelay(true) {
                        errors.send(error.into()).ok();
                        continue;
                    }

                    let acceptor = acceptor.clone();
                    let host = Arc::clone(&self);
                    let errors = errors.clone();
                    handlers.spawn(async move {
                        // The TLS accept completes the handshake, which is
                        // what makes the peer certificate available below.
                        let tls_stream = match acceptor.accept(tcp_stream).await {
                            Ok(tls_stream) => tls_stream,
                            Err(e) => {
                                error!("TLS initialization error [{}]: {}", address, e);
                                return;
                            }
                        };
                        host.handle_connection(tls_stream, &errors).await;
                    });
                }
            }
        }

        handlers.shutdown().await;
    }

    async fn handle_connection(&self, tls_stream: TlsStream<TcpStream>, errors: &ErrorSink) {
        let hash = {
            let (_, connection) = tls_stream.get_ref();
            let leaf = match connection.peer_certificates().and_then(|certs| certs.first()) {
                Some(leaf) => leaf,
                None => {
                    errors.send(Error::MissingClientCertificate).ok();
                    return;
                }
            };
            match certificate::signature_fingerprint(leaf.as_ref()) {
                Ok(hash) => hash,
                Err(error) => {
                    errors.send(error.into()).ok();
                    return;
                }
            }
        };

        let (read_half, write_half) = tokio::io::split(tls_stream);
        let mut reader = codec::Reader::new(read_half);

        // Writer task: sole owner of the write half. It drains and exits
        // once the handler below drops its sender.
        let (replies, mut reply_rx) = mpsc::channel::<ClientMessage>(1);
        let writer_errors = errors.clone();
        let writer = tokio::spawn(async move {
            let mut writer = codec::Writer::new(write_half);
            while let Some(message) = reply_rx.recv().await {
                if let Err(error) = writer.write(&message).await {
                    writer_errors.send(error.into()).ok();
                }
            }
        });

        if let Err(error) = self.serve_connection(&hash, &mut reader, &replies, errors).await {
            errors.send(error).ok();
        }

        drop(replies);
        writer.await.ok();
    }

    /// The per-connection message loop.
    async fn serve_connection(
        &self,
        hash: &str,
        reader: &mut codec::Reader<ReadHalf<TlsStream<TcpStream>>>,
        replies: &mpsc::Sender<ClientMessage>,
        errors: &ErrorSink,
    ) -> Result<(), Error> {
        // A returning client may already be bound to a service; a missing
        // binding is fine at this stage, the client can still register.
        let mut bound = self.verify_signature(hash).await?;

        loop {
            let read = reader.read::<HostMessage>();
            let result = match self.config.read_timeout {
                Some(limit) => match tokio::time::timeout(limit, read).await {
                    Ok(result) => result,
                    Err(_) => {
                        replies
                            .send(ClientMessage::failed(MessageType::Decode, "", "Timeout"))
                            .await
                            .ok();
                        return Ok(());
                    }
                },
                None => read.await,
            };

            let message = match result {
                Ok(message) => message,
                // EOF closes silently.
                Err(codec::Error::Closed) => return Ok(()),
                Err(codec::Error::Decode(e)) => {
                    replies
                        .send(ClientMessage::failed(
                            MessageType::Decode,
                            "",
                            format!("400: Could not decode message. {}", e),
                        ))
                        .await
                        .ok();
                    return Err(codec::Error::Decode(e).into());
                }
                Err(error) => return Err(error.into()),
            };

            match message.message_type {
                MessageType::Register => {
                    // Stop processing if the passwords don't match.
                    if !self.check_password(&message.message) {
                        replies
                            .send(ClientMessage::failed(
                                MessageType::Register,
                                "",
                                "Password doesn't match",
                            ))
                            .await
                            .ok();
                        return Ok(());
                    }
                    match self
                        .register_service(hash, &message.machine, &message.service)
                        .await
                    {
                        Ok(service) => {
                            bound = Some(service);
                            replies
                                .send(ClientMessage::successful(MessageType::Register, ""))
                                .await
                                .ok();
                        }
                        Err(error) => {
                            replies
                                .send(ClientMessage::failed(MessageType::Register, "", &error))
                                .await
                                .ok();
                        }
                    }
                }
                MessageType::Heartbeat => {
                    let service = match &bound {
                        Some(service) => service,
                        None => {
                            self.reply_unauthorized(replies).await;
                            continue;
                        }
                    };
                    if let Err(error) = self.services.update_last_seen(service.id).await {
                        replies
                            .send(ClientMessage::failed(
                                MessageType::Heartbeat,
                                "",
                                format!("Could not update heartbeat. {}", error),
                            ))
                            .await
                            .ok();
                    }
                }
                _ => {
                    let service = match &bound {
                        Some(service) => service,
                        None => {
                            self.reply_unauthorized(replies).await;
                            continue;
                        }
                    };
                    let log_type = String::from(message.message_type.clone());
                    match self
                        .logs
                        .insert(
                            service.id,
                            &log_type,
                            message.time,
                            &message.message,
                            &message.context,
                        )
                        .await
                    {
                        Ok(()) => {
                            // Accepted messages count as liveness too.
                            if let Err(error) = self.services.update_last_seen(service.id).await {
                                errors.send(error.into()).ok();
                            }
                            replies
                                .send(ClientMessage::successful(
                                    message.message_type,
                                    &message.id,
                                ))
                                .await
                                .ok();
                        }
                        Err(error) => {
                            replies
                                .send(ClientMessage::failed(
                                    message.message_type,
                                    &message.id,
                                    &error,
                                ))
                                .await
                                .ok();
                        }
                    }
                }
            }
        }
    }

    async fn reply_unauthorized(&self, replies: &mpsc::Sender<ClientMessage>) {
        replies
            .send(ClientMessage::failed(
                MessageType::Authorization,
                "",
                "Unauthorized",
            ))
            .await
            .ok();
    }

    /// Resolve the service bound to a certificate fingerprint: cache first,
    /// then the repository. Only positive lookups are cached.
    pub async fn verify_signature(&self, hash: &str) -> Result<Option<Service>, Error> {
        if let Some(service) = self.sig_cache.read().await.get(hash) {
            return Ok(Some(service.clone()));
        }
        let service = self.services.get_by_hash(hash).await?;
        if let Some(service) = &service {
            self.sig_cache
                .write()
                .await
                .insert(hash.to_string(), service.clone());
        }
        Ok(service)
    }

    /// Bind a certificate fingerprint to a `(machine, name)` identity.
    ///
    /// Resolution order, hash match dominating:
    /// 1. Known hash: the same client, possibly renamed; update labels in
    ///    place.
    /// 2. Known `(machine, name)`: an existing identity under a new
    ///    certificate; rebind its hash.
    /// 3. Neither: a brand-new service.
    pub async fn register_service(
        &self,
        hash: &str,
        machine: &str,
        name: &str,
    ) -> Result<Service, Error> {
        if let Some(mut service) = self.services.get_by_hash(hash).await? {
            if service.machine != machine || service.name != name {
                service.machine = machine.to_string();
                service.name = name.to_string();
                self.services.update(&service).await?;
            }
            self.cache(service.clone()).await;
            return Ok(service);
        }

        if let Some(mut service) = self.services.get_by_name(machine, name).await? {
            self.services.update_hash(service.id, hash).await?;
            // The superseded certificate must stop authenticating, so its
            // cache entry is retired along with the repository row.
            let old_hash = std::mem::replace(&mut service.sig_hash, hash.to_string());
            self.sig_cache.write().await.remove(&old_hash);
            self.cache(service.clone()).await;
            return Ok(service);
        }

        let mut service = Service::new(machine, name, hash);
        self.services.insert(&mut service).await?;
        self.cache(service.clone()).await;
        Ok(service)
    }

    async fn cache(&self, service: Service) {
        self.sig_cache
            .write()
            .await
            .insert(service.sig_hash.clone(), service);
    }
}
