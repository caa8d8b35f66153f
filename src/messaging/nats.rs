//! NATS backend: one native subscription and delivery task per subject.

use std::sync::{Mutex, PoisonError};

use async_nats::connection::State;
use bytes::Bytes;
use futures::StreamExt;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::{
    ConnectOptions, MessageHandler, MessagingError, MessagingFuture, MessagingService, dispatch,
};

const BACKEND: &str = "NATS";

#[derive(Debug)]
struct Connection {
    client: async_nats::Client,
    deliveries: Vec<JoinHandle<()>>,
}

/// [`MessagingService`] over a NATS server.
#[derive(Debug, Default)]
pub struct NatsMessagingService {
    connection: Mutex<Option<Connection>>,
}

impl NatsMessagingService {
    /// Creates a disconnected service.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn client(&self) -> Result<async_nats::Client, MessagingError> {
        let guard = self
            .connection
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        guard
            .as_ref()
            .filter(|conn| matches!(conn.client.connection_state(), State::Connected))
            .map(|conn| conn.client.clone())
            .ok_or(MessagingError::NotConnected { backend: BACKEND })
    }
}

impl MessagingService for NatsMessagingService {
    fn connect<'a>(
        &'a self,
        url: &'a str,
        options: &'a ConnectOptions,
    ) -> MessagingFuture<'a, ()> {
        Box::pin(async move {
            if self.is_connected() {
                warn!("NATS client is already connected");
                return Ok(());
            }
            info!(url, "connecting to NATS server");
            let client = async_nats::ConnectOptions::new()
                .name(&options.client_name)
                .connection_timeout(options.connect_timeout)
                .connect(url)
                .await
                .map_err(|err| MessagingError::Connect {
                    url: url.to_owned(),
                    message: err.to_string(),
                })?;
            let replaced = self
                .connection
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .replace(Connection {
                    client,
                    deliveries: Vec::new(),
                });
            if let Some(stale) = replaced {
                for task in stale.deliveries {
                    task.abort();
                }
            }
            info!(url, "connected to NATS server");
            Ok(())
        })
    }

    fn disconnect(&self) -> MessagingFuture<'_, ()> {
        Box::pin(async move {
            let taken = self
                .connection
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .take();
            let Some(connection) = taken else {
                debug!("NATS client already disconnected");
                return Ok(());
            };
            info!("disconnecting from NATS server");
            for task in connection.deliveries {
                task.abort();
            }
            if let Err(err) = connection.client.flush().await {
                debug!(error = %err, "flush before disconnect failed");
            }
            drop(connection.client);
            info!("disconnected from NATS server");
            Ok(())
        })
    }

    fn publish<'a>(&'a self, subject: &'a str, payload: Bytes) -> MessagingFuture<'a, ()> {
        Box::pin(async move {
            let client = self.client()?;
            client
                .publish(subject.to_owned(), payload)
                .await
                .map_err(|err| MessagingError::Publish {
                    subject: subject.to_owned(),
                    message: err.to_string(),
                })?;
            debug!(subject, "published message");
            Ok(())
        })
    }

    fn subscribe<'a>(
        &'a self,
        subject: &'a str,
        handler: MessageHandler,
    ) -> MessagingFuture<'a, ()> {
        Box::pin(async move {
            let client = self.client()?;
            let mut subscriber =
                client
                    .subscribe(subject.to_owned())
                    .await
                    .map_err(|err| MessagingError::Subscribe {
                        subject: subject.to_owned(),
                        message: err.to_string(),
                    })?;
            // The server has processed SUB once flush returns.
            client
                .flush()
                .await
                .map_err(|err| MessagingError::Subscribe {
                    subject: subject.to_owned(),
                    message: err.to_string(),
                })?;

            let owned_subject = subject.to_owned();
            let task = tokio::spawn(async move {
                while let Some(message) = subscriber.next().await {
                    dispatch(&owned_subject, &handler, message.payload).await;
                }
                debug!(subject = %owned_subject, "NATS subscription ended");
            });

            let mut guard = self
                .connection
                .lock()
                .unwrap_or_else(PoisonError::into_inner);
            match guard.as_mut() {
                Some(connection) => connection.deliveries.push(task),
                None => task.abort(),
            }
            drop(guard);
            info!(subject, "subscribed to NATS subject");
            Ok(())
        })
    }

    fn is_connected(&self) -> bool {
        self.connection
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .as_ref()
            .is_some_and(|conn| matches!(conn.client.connection_state(), State::Connected))
    }
}
