//! Broadcast hub: the single owner of the subscriber set.
//!
//! Every operation is a message to one actor task, so registration, removal
//! and fan-out never observe the set concurrently. Each subscriber is the
//! sending half of a bounded outbox; a per-connection writer task drains the
//! other half into the socket. Dropping the sender is how a connection gets
//! closed, and the hub holds the only one.

use std::{
    collections::BTreeMap,
    sync::{
        Arc,
        atomic::{AtomicU64, Ordering},
    },
    time::Duration,
};

use bytes::Bytes;
use thiserror::Error;
use tokio::{
    sync::{mpsc, mpsc::error::SendTimeoutError, oneshot},
    task::JoinHandle,
};
use tracing::{Instrument, Span, debug, info};

/// Mailbox depth for hub commands. Publishers wait when it is full.
const COMMAND_QUEUE: usize = 256;

pub type SubscriberId = u64;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum HubError {
    #[error("broadcast hub is no longer running")]
    Closed,
}

/// The hub's end of one subscriber's outbox.
#[derive(Debug)]
pub struct Subscriber {
    id: SubscriberId,
    outbox: mpsc::Sender<Bytes>,
}

impl Subscriber {
    pub fn id(&self) -> SubscriberId {
        self.id
    }
}

enum HubCommand {
    Register(Subscriber),
    Unregister(SubscriberId),
    Publish(Bytes),
    Count { respond_to: oneshot::Sender<usize> },
    Shutdown,
}

/// Cloneable handle for talking to the hub actor.
#[derive(Clone)]
pub struct HubHandle {
    commands: mpsc::Sender<HubCommand>,
    next_id: Arc<AtomicU64>,
}

impl HubHandle {
    /// Creates a subscriber outbox holding up to `capacity` pending payloads.
    ///
    /// The returned receiver is drained by whoever owns the connection; it
    /// yields `None` once the hub has dropped the subscriber.
    pub fn subscriber(&self, capacity: usize) -> (Subscriber, mpsc::Receiver<Bytes>) {
        let (outbox, inbox) = mpsc::channel(capacity.max(1));
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        (Subscriber { id, outbox }, inbox)
    }

    pub async fn register(&self, subscriber: Subscriber) -> Result<(), HubError> {
        self.send(HubCommand::Register(subscriber)).await
    }

    pub async fn unregister(&self, id: SubscriberId) -> Result<(), HubError> {
        self.send(HubCommand::Unregister(id)).await
    }

    pub async fn publish(&self, payload: Bytes) -> Result<(), HubError> {
        self.send(HubCommand::Publish(payload)).await
    }

    /// Publishes from a thread outside the runtime, such as the serial reader.
    pub fn blocking_publish(&self, payload: Bytes) -> Result<(), HubError> {
        self.commands
            .blocking_send(HubCommand::Publish(payload))
            .map_err(|_| HubError::Closed)
    }

    pub async fn subscriber_count(&self) -> Result<usize, HubError> {
        let (respond_to, response) = oneshot::channel();
        self.send(HubCommand::Count { respond_to }).await?;
        response.await.map_err(|_| HubError::Closed)
    }

    /// Closes every subscriber and stops the actor. Safe to call repeatedly.
    pub async fn shutdown(&self) {
        let _ = self.commands.send(HubCommand::Shutdown).await;
    }

    async fn send(&self, command: HubCommand) -> Result<(), HubError> {
        self.commands
            .send(command)
            .await
            .map_err(|_| HubError::Closed)
    }
}

pub struct Hub {
    subscribers: BTreeMap<SubscriberId, mpsc::Sender<Bytes>>,
    commands: mpsc::Receiver<HubCommand>,
    write_timeout: Duration,
}

impl Hub {
    /// Starts the hub actor. `write_timeout` bounds how long one publish may
    /// wait on a full subscriber outbox before that subscriber is dropped.
    pub fn spawn(write_timeout: Duration, span: Span) -> (HubHandle, JoinHandle<()>) {
        let (commands_tx, commands) = mpsc::channel(COMMAND_QUEUE);
        let hub = Hub {
            subscribers: BTreeMap::new(),
            commands,
            write_timeout,
        };
        let task = tokio::spawn(hub.run().instrument(span));
        let handle = HubHandle {
            commands: commands_tx,
            next_id: Arc::new(AtomicU64::new(1)),
        };
        (handle, task)
    }

    async fn run(mut self) {
        while let Some(command) = self.commands.recv().await {
            match command {
                HubCommand::Register(Subscriber { id, outbox }) => {
                    self.subscribers.insert(id, outbox);
                    let total = self.subscribers.len();
                    info!(subscriber = id, total, "subscriber connected");
                }
                HubCommand::Unregister(id) => {
                    if self.subscribers.remove(&id).is_some() {
                        info!(
                            subscriber = id,
                            total = self.subscribers.len(),
                            "subscriber disconnected"
                        );
                    }
                }
                HubCommand::Publish(payload) => self.fan_out(payload).await,
                HubCommand::Count { respond_to } => {
                    let _ = respond_to.send(self.subscribers.len());
                }
                HubCommand::Shutdown => break,
            }
        }

        if !self.subscribers.is_empty() {
            info!(total = self.subscribers.len(), "closing remaining subscribers");
        }
        self.subscribers.clear();
    }

    async fn fan_out(&mut self, payload: Bytes) {
        let mut failed = Vec::new();
        for (&id, outbox) in &self.subscribers {
            match outbox.send_timeout(payload.clone(), self.write_timeout).await {
                Ok(()) => {}
                Err(SendTimeoutError::Closed(_)) => {
                    debug!(subscriber = id, "subscriber went away");
                    failed.push(id);
                }
                Err(SendTimeoutError::Timeout(_)) => {
                    debug!(subscriber = id, "subscriber too slow, dropping");
                    failed.push(id);
                }
            }
        }

        for id in failed {
            self.subscribers.remove(&id);
            let total = self.subscribers.len();
            info!(subscriber = id, total, "subscriber disconnected");
        }
    }
}
