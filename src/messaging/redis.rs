//! Redis backend: one pub/sub connection drained by a single listener task.
//!
//! The listener is started by the first `subscribe` and polls the pub/sub
//! stream on a short timeout so it can observe the stop flag. It holds the
//! pub/sub lock only while waiting for one message, which lets later
//! `subscribe` calls register channels between polls.

use std::collections::HashMap;
use std::pin::pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, PoisonError, RwLock};
use std::time::Duration;

use ::redis::AsyncCommands;
use ::redis::aio::{MultiplexedConnection, PubSub};
use bytes::Bytes;
use futures::StreamExt;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use super::{
    ConnectOptions, MessageHandler, MessagingError, MessagingFuture, MessagingService, dispatch,
};

const BACKEND: &str = "Redis";

/// How long the listener waits for a message before re-checking its stop flag.
pub const LISTEN_POLL_INTERVAL: Duration = Duration::from_millis(250);

type Handlers = Arc<RwLock<HashMap<String, MessageHandler>>>;

struct Connection {
    publisher: MultiplexedConnection,
    pubsub: Arc<Mutex<PubSub>>,
    listener: Option<JoinHandle<()>>,
    stop: Arc<AtomicBool>,
}

/// [`MessagingService`] over Redis pub/sub.
#[derive(Default)]
pub struct RedisMessagingService {
    connection: Mutex<Option<Connection>>,
    handlers: Handlers,
    connected: AtomicBool,
}

impl std::fmt::Debug for RedisMessagingService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RedisMessagingService")
            .field("connected", &self.connected.load(Ordering::Acquire))
            .finish_non_exhaustive()
    }
}

impl RedisMessagingService {
    /// Creates a disconnected service.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

impl MessagingService for RedisMessagingService {
    fn connect<'a>(
        &'a self,
        url: &'a str,
        options: &'a ConnectOptions,
    ) -> MessagingFuture<'a, ()> {
        Box::pin(async move {
            let mut guard = self.connection.lock().await;
            if guard.is_some() {
                warn!("Redis client is already connected");
                return Ok(());
            }
            info!(url, "connecting to Redis server");
            let connect_error = |message: String| MessagingError::Connect {
                url: url.to_owned(),
                message,
            };
            let client = ::redis::Client::open(url).map_err(|err| connect_error(err.to_string()))?;
            let established = tokio::time::timeout(options.connect_timeout, async {
                let mut publisher = client.get_multiplexed_async_connection().await?;
                ::redis::cmd("PING")
                    .query_async::<String>(&mut publisher)
                    .await?;
                let pubsub = client.get_async_pubsub().await?;
                Ok::<_, ::redis::RedisError>((publisher, pubsub))
            })
            .await
            .map_err(|_| connect_error(String::from("connection timed out")))?;
            let (publisher, pubsub) = established.map_err(|err| connect_error(err.to_string()))?;

            *guard = Some(Connection {
                publisher,
                pubsub: Arc::new(Mutex::new(pubsub)),
                listener: None,
                stop: Arc::new(AtomicBool::new(false)),
            });
            self.connected.store(true, Ordering::Release);
            info!(url, "connected to Redis server");
            Ok(())
        })
    }

    fn disconnect(&self) -> MessagingFuture<'_, ()> {
        Box::pin(async move {
            let Some(mut connection) = self.connection.lock().await.take() else {
                debug!("Redis client already disconnected");
                return Ok(());
            };
            self.connected.store(false, Ordering::Release);

            connection.stop.store(true, Ordering::Release);
            if let Some(listener) = connection.listener.take() {
                info!("stopping Redis listener task");
                if let Err(err) = listener.await {
                    warn!(error = %err, "Redis listener task ended abnormally");
                }
            }

            let channels: Vec<String> = self
                .handlers
                .write()
                .unwrap_or_else(PoisonError::into_inner)
                .drain()
                .map(|(channel, _)| channel)
                .collect();
            let mut pubsub = connection.pubsub.lock().await;
            for channel in channels {
                if let Err(err) = pubsub.unsubscribe(&channel).await {
                    debug!(channel, error = %err, "unsubscribe during disconnect failed");
                }
            }
            drop(pubsub);
            drop(connection);
            info!("disconnected from Redis server");
            Ok(())
        })
    }

    fn publish<'a>(&'a self, subject: &'a str, payload: Bytes) -> MessagingFuture<'a, ()> {
        Box::pin(async move {
            let mut publisher = self
                .connection
                .lock()
                .await
                .as_ref()
                .map(|conn| conn.publisher.clone())
                .ok_or(MessagingError::NotConnected { backend: BACKEND })?;
            let receivers: i64 = publisher
                .publish(subject, payload.as_ref())
                .await
                .map_err(|err| MessagingError::Publish {
                    subject: subject.to_owned(),
                    message: err.to_string(),
                })?;
            debug!(subject, receivers, "published message");
            Ok(())
        })
    }

    fn subscribe<'a>(
        &'a self,
        subject: &'a str,
        handler: MessageHandler,
    ) -> MessagingFuture<'a, ()> {
        Box::pin(async move {
            let mut guard = self.connection.lock().await;
            let connection = guard
                .as_mut()
                .ok_or(MessagingError::NotConnected { backend: BACKEND })?;

            self.handlers
                .write()
                .unwrap_or_else(PoisonError::into_inner)
                .insert(subject.to_owned(), handler);
            let subscribed = connection.pubsub.lock().await.subscribe(subject).await;
            if let Err(err) = subscribed {
                self.handlers
                    .write()
                    .unwrap_or_else(PoisonError::into_inner)
                    .remove(subject);
                return Err(MessagingError::Subscribe {
                    subject: subject.to_owned(),
                    message: err.to_string(),
                });
            }
            info!(subject, "subscribed to Redis channel");

            let running = connection
                .listener
                .as_ref()
                .is_some_and(|task| !task.is_finished());
            if !running {
                connection.stop.store(false, Ordering::Release);
                connection.listener = Some(tokio::spawn(listen(
                    Arc::clone(&connection.pubsub),
                    Arc::clone(&self.handlers),
                    Arc::clone(&connection.stop),
                )));
            }
            Ok(())
        })
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Acquire)
    }
}

async fn listen(pubsub: Arc<Mutex<PubSub>>, handlers: Handlers, stop: Arc<AtomicBool>) {
    info!("Redis listener started");
    while !stop.load(Ordering::Acquire) {
        let next = {
            let mut guard = pubsub.lock().await;
            let mut messages = pin!(guard.on_message());
            let polled = tokio::time::timeout(LISTEN_POLL_INTERVAL, messages.next()).await;
            polled
        };
        let message = match next {
            Err(_elapsed) => continue,
            Ok(Some(message)) => message,
            Ok(None) => {
                if !stop.load(Ordering::Acquire) {
                    error!("Redis pub/sub stream closed unexpectedly");
                }
                break;
            }
        };

        let channel = message.get_channel_name().to_owned();
        let handler = handlers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&channel)
            .cloned();
        match handler {
            Some(handler) => {
                let payload = Bytes::copy_from_slice(message.get_payload_bytes());
                dispatch(&channel, &handler, payload).await;
            }
            None => debug!(channel, "message on channel without handler"),
        }
    }
    info!("Redis listener stopped");
}
