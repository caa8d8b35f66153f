//! Publish/subscribe transport for worker telemetry.
//!
//! [`MessagingService`] is the capability set the scheduler relies on; the
//! concrete backend ([`NatsMessagingService`] or [`RedisMessagingService`])
//! is chosen from [`MessagingConfig`] at startup. Neither backend replays
//! messages published before a subscription was registered.

use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use thiserror::Error;

use crate::config::MessagingConfig;

mod dispatch;
mod nats;
mod redis;

pub use self::nats::NatsMessagingService;
pub use self::redis::RedisMessagingService;

pub(crate) use dispatch::dispatch;

/// Boxed future returned by message handlers.
pub type HandlerFuture = Pin<Box<dyn Future<Output = Result<(), HandlerError>> + Send>>;

/// Callback invoked with the raw payload of each delivered message.
pub type MessageHandler = Arc<dyn Fn(Bytes) -> HandlerFuture + Send + Sync>;

/// Boxed future returned by [`MessagingService`] operations.
pub type MessagingFuture<'a, T> =
    Pin<Box<dyn Future<Output = Result<T, MessagingError>> + Send + 'a>>;

/// Wraps an async closure as a [`MessageHandler`].
///
/// # Examples
///
/// ```
/// use slurmflow::messaging::{handler, HandlerError};
///
/// let on_message = handler(|payload| async move {
///     if payload.is_empty() {
///         return Err(HandlerError::Failed(String::from("empty")));
///     }
///     Ok(())
/// });
/// # drop(on_message);
/// ```
pub fn handler<F, Fut>(f: F) -> MessageHandler
where
    F: Fn(Bytes) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<(), HandlerError>> + Send + 'static,
{
    Arc::new(move |payload| Box::pin(f(payload)))
}

/// Failure reported by a message handler. Logged by the delivering loop,
/// never propagated to it.
#[derive(Clone, Debug, Error, Eq, PartialEq)]
pub enum HandlerError {
    /// The payload could not be decoded.
    #[error("cannot decode payload: {0}")]
    Decode(String),
    /// Processing the decoded message failed.
    #[error("handler failed: {0}")]
    Failed(String),
}

/// Errors raised by messaging backends.
#[derive(Clone, Debug, Error, Eq, PartialEq)]
pub enum MessagingError {
    /// Publish or subscribe attempted without a live connection.
    #[error("not connected to {backend} server")]
    NotConnected {
        /// Backend name.
        backend: &'static str,
    },
    /// The server could not be reached.
    #[error("failed to connect to {url}: {message}")]
    Connect {
        /// Server URL.
        url: String,
        /// Client diagnostic.
        message: String,
    },
    /// A publish was rejected.
    #[error("failed to publish to {subject}: {message}")]
    Publish {
        /// Target subject.
        subject: String,
        /// Client diagnostic.
        message: String,
    },
    /// A subscription could not be registered.
    #[error("failed to subscribe to {subject}: {message}")]
    Subscribe {
        /// Target subject.
        subject: String,
        /// Client diagnostic.
        message: String,
    },
    /// Other backend failure, for example an unknown backend name.
    #[error("messaging backend error: {0}")]
    Backend(String),
}

/// Options applied when connecting.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct ConnectOptions {
    /// Name reported to the server where supported.
    pub client_name: String,
    /// Upper bound on establishing the connection.
    pub connect_timeout: Duration,
}

impl Default for ConnectOptions {
    fn default() -> Self {
        Self {
            client_name: String::from("slurmflow"),
            connect_timeout: Duration::from_secs(10),
        }
    }
}

/// Publish/subscribe capability set.
pub trait MessagingService: Send + Sync {
    /// Connects to `url`. Connecting an already connected service is a
    /// no-op.
    fn connect<'a>(&'a self, url: &'a str, options: &'a ConnectOptions)
    -> MessagingFuture<'a, ()>;

    /// Closes the connection. Calling it again, or before connecting, is a
    /// no-op.
    fn disconnect(&self) -> MessagingFuture<'_, ()>;

    /// Publishes `payload` on `subject`.
    fn publish<'a>(&'a self, subject: &'a str, payload: Bytes) -> MessagingFuture<'a, ()>;

    /// Registers `handler` for messages published on `subject` from now on.
    fn subscribe<'a>(&'a self, subject: &'a str, handler: MessageHandler)
    -> MessagingFuture<'a, ()>;

    /// Whether the service currently holds a live connection.
    fn is_connected(&self) -> bool;
}

impl<T: MessagingService + ?Sized> MessagingService for Arc<T> {
    fn connect<'a>(
        &'a self,
        url: &'a str,
        options: &'a ConnectOptions,
    ) -> MessagingFuture<'a, ()> {
        (**self).connect(url, options)
    }

    fn disconnect(&self) -> MessagingFuture<'_, ()> {
        (**self).disconnect()
    }

    fn publish<'a>(&'a self, subject: &'a str, payload: Bytes) -> MessagingFuture<'a, ()> {
        (**self).publish(subject, payload)
    }

    fn subscribe<'a>(
        &'a self,
        subject: &'a str,
        handler: MessageHandler,
    ) -> MessagingFuture<'a, ()> {
        (**self).subscribe(subject, handler)
    }

    fn is_connected(&self) -> bool {
        (**self).is_connected()
    }
}

/// Supported messaging backends.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum MessagingBackend {
    /// NATS core pub/sub.
    Nats,
    /// Redis pub/sub.
    Redis,
}

impl FromStr for MessagingBackend {
    type Err = MessagingError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "nats" => Ok(Self::Nats),
            "redis" => Ok(Self::Redis),
            other => Err(MessagingError::Backend(format!(
                "unknown backend `{other}`; expected `nats` or `redis`"
            ))),
        }
    }
}

impl fmt::Display for MessagingBackend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Nats => f.write_str("nats"),
            Self::Redis => f.write_str("redis"),
        }
    }
}

impl MessagingBackend {
    /// Creates a disconnected service for this backend.
    #[must_use]
    pub fn service(self) -> Arc<dyn MessagingService> {
        match self {
            Self::Nats => Arc::new(NatsMessagingService::new()),
            Self::Redis => Arc::new(RedisMessagingService::new()),
        }
    }
}

/// Builds and connects the backend selected by `config`.
///
/// # Errors
///
/// Returns [`MessagingError::Backend`] for an unknown backend name and
/// [`MessagingError::Connect`] when the server is unreachable.
pub async fn connect_from_config(
    config: &MessagingConfig,
) -> Result<Arc<dyn MessagingService>, MessagingError> {
    let backend: MessagingBackend = config.backend.parse()?;
    let service = backend.service();
    let options = ConnectOptions {
        connect_timeout: Duration::from_secs(config.connect_timeout_seconds),
        ..ConnectOptions::default()
    };
    service.connect(&config.url, &options).await?;
    Ok(service)
}
