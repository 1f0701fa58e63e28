//! Log values and the handlers that consume them.
//!
//! Applications produce values implementing [`Log`]; handlers decide what to
//! do with them. Handlers that ship logs to the host only accept values
//! which also expose the [`HostLog`] capability; anything else passes
//! through them untouched, so host-bound and purely local handlers can be
//! fanned out over the same stream of records.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::fmt::{self, Display};
use tokio::io::AsyncWriteExt;

/// A log value: at minimum, a byte rendering of the message.
pub trait Log: Send + Sync {
    /// The message as bytes.
    fn bytes(&self) -> &[u8];

    /// Probe for the host-shipping capability. The default refusal keeps
    /// plain local logs out of the spool.
    fn as_host_log(&self) -> Option<&dyn HostLog> {
        None
    }
}

/// The capability a log value needs in order to be spooled and shipped to
/// the host: a type tag, a timestamp, the message, and a structured context.
pub trait HostLog: Log {
    fn log_type(&self) -> &str;
    fn time(&self) -> DateTime<Utc>;
    fn message(&self) -> &[u8];
    /// Structured payload attached to the message; serialized to bytes when
    /// the record enters the spool.
    fn context(&self) -> serde_json::Value;
}

/// The standard host-shippable record.
#[derive(Debug, Clone)]
pub struct Record {
    pub log_type: String,
    pub time: DateTime<Utc>,
    pub message: Vec<u8>,
    pub context: serde_json::Value,
}

impl Record {
    pub fn new(log_type: impl Into<String>, message: impl Into<Vec<u8>>) -> Self {
        Record {
            log_type: log_type.into(),
            time: Utc::now(),
            message: message.into(),
            context: serde_json::Value::Null,
        }
    }

    pub fn with_context(mut self, context: serde_json::Value) -> Self {
        self.context = context;
        self
    }
}

impl Log for Record {
    fn bytes(&self) -> &[u8] {
        &self.message
    }

    fn as_host_log(&self) -> Option<&dyn HostLog> {
        Some(self)
    }
}

impl HostLog for Record {
    fn log_type(&self) -> &str {
        &self.log_type
    }

    fn time(&self) -> DateTime<Utc> {
        self.time
    }

    fn message(&self) -> &[u8] {
        &self.message
    }

    fn context(&self) -> serde_json::Value {
        self.context.clone()
    }
}

/// Consumes log values. Returns the number of bytes accepted.
#[async_trait]
pub trait Handler: Send + Sync {
    async fn handle(&self, log: &dyn Log) -> Result<usize, anyhow::Error>;
}

/// Runs every registered handler over each log, collecting all their errors
/// rather than stopping at the first.
#[derive(Default)]
pub struct Fanout {
    handlers: Vec<Box<dyn Handler>>,
}

impl Fanout {
    pub fn new() -> Self {
        Fanout::default()
    }

    pub fn add(mut self, handler: impl Handler + 'static) -> Self {
        self.handlers.push(Box::new(handler));
        self
    }
}

#[async_trait]
impl Handler for Fanout {
    async fn handle(&self, log: &dyn Log) -> Result<usize, anyhow::Error> {
        let mut written = 0;
        let mut errors = Vec::new();
        for handler in &self.handlers {
            match handler.handle(log).await {
                Ok(n) => written = n,
                Err(error) => errors.push(error),
            }
        }
        if errors.is_empty() {
            Ok(written)
        } else {
            Err(HandlerErrors(errors).into())
        }
    }
}

/// Every error raised while fanning a log out to multiple handlers.
#[derive(Debug)]
pub struct HandlerErrors(pub Vec<anyhow::Error>);

impl Display for HandlerErrors {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let rendered: Vec<String> = self.0.iter().map(|e| e.to_string()).collect();
        write!(f, "{}", rendered.join("\n"))
    }
}

impl std::error::Error for HandlerErrors {}

/// Writes the raw message bytes to standard output.
pub struct Stdout;

#[async_trait]
impl Handler for Stdout {
    async fn handle(&self, log: &dyn Log) -> Result<usize, anyhow::Error> {
        let mut out = tokio::io::stdout();
        out.write_all(log.bytes()).await?;
        Ok(log.bytes().len())
    }
}
