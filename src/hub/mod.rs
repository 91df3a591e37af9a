//! Broadcast hub with slow-consumer eviction.
//!
//! One task owns the observer set. Registration, unregistration and delivery
//! are all messages to that task, so the set needs no lock. Every event is
//! prepared once and the prepared payload is cloned into each observer's
//! bounded mailbox with `try_send`; an observer whose mailbox is full is
//! dropped on the spot instead of slowing the publisher down.

use std::collections::HashMap;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};

use futures_util::Stream;
use thiserror::Error;
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, oneshot};

/// Capacity of the hub's own command queue.
const COMMAND_BUFFER: usize = 256;

#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
#[error("broadcast hub has stopped")]
pub struct HubClosed;

enum Command<E, P> {
    Register { id: u64, mailbox: mpsc::Sender<P> },
    Unregister(u64),
    Publish(E),
    Count(oneshot::Sender<usize>),
}

/// Cloneable handle to a running hub. The hub task stops once every handle
/// and every observer is gone.
pub struct Hub<E, P> {
    commands: mpsc::Sender<Command<E, P>>,
    next_id: Arc<AtomicU64>,
    mailbox: usize,
}

impl<E, P> Clone for Hub<E, P> {
    fn clone(&self) -> Self {
        Self {
            commands: self.commands.clone(),
            next_id: self.next_id.clone(),
            mailbox: self.mailbox,
        }
    }
}

impl<E, P> Hub<E, P>
where
    E: Send + 'static,
    P: Clone + Send + 'static,
{
    /// Start the owning task. `prepare` turns an event into the payload
    /// shared by every observer; it runs once per event.
    pub fn spawn<F>(mailbox: usize, prepare: F) -> Self
    where
        F: Fn(E) -> P + Send + 'static,
    {
        let (commands, rx) = mpsc::channel(COMMAND_BUFFER);
        tokio::spawn(run(rx, prepare));
        Self {
            commands,
            next_id: Arc::new(AtomicU64::new(1)),
            mailbox: mailbox.max(1),
        }
    }

    pub async fn subscribe(&self) -> Result<Observer<E, P>, HubClosed> {
        self.subscribe_with_capacity(self.mailbox).await
    }

    pub async fn subscribe_with_capacity(
        &self,
        capacity: usize,
    ) -> Result<Observer<E, P>, HubClosed> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = mpsc::channel(capacity.max(1));
        self.commands
            .send(Command::Register { id, mailbox: tx })
            .await
            .map_err(|_| HubClosed)?;
        Ok(Observer {
            id,
            mailbox: rx,
            commands: self.commands.clone(),
        })
    }

    /// Queue an event for delivery. Waits only for room in the hub's command
    /// queue, never for an observer.
    pub async fn publish(&self, event: E) -> Result<(), HubClosed> {
        self.commands
            .send(Command::Publish(event))
            .await
            .map_err(|_| HubClosed)
    }

    /// Number of currently registered observers.
    pub async fn observer_count(&self) -> Result<usize, HubClosed> {
        let (tx, rx) = oneshot::channel();
        self.commands
            .send(Command::Count(tx))
            .await
            .map_err(|_| HubClosed)?;
        rx.await.map_err(|_| HubClosed)
    }
}

async fn run<E, P, F>(mut commands: mpsc::Receiver<Command<E, P>>, prepare: F)
where
    P: Clone,
    F: Fn(E) -> P,
{
    let mut observers: HashMap<u64, mpsc::Sender<P>> = HashMap::new();
    while let Some(command) = commands.recv().await {
        match command {
            Command::Register { id, mailbox } => {
                observers.insert(id, mailbox);
                tracing::debug!(observer_id = id, observers = observers.len(), "Observer registered");
            }
            Command::Unregister(id) => {
                if observers.remove(&id).is_some() {
                    tracing::debug!(observer_id = id, observers = observers.len(), "Observer unregistered");
                }
            }
            Command::Publish(event) => {
                if observers.is_empty() {
                    continue;
                }
                let payload = prepare(event);
                observers.retain(|id, mailbox| match mailbox.try_send(payload.clone()) {
                    Ok(()) => true,
                    Err(TrySendError::Full(_)) => {
                        tracing::warn!(observer_id = id, "Observer too slow, evicting");
                        false
                    }
                    Err(TrySendError::Closed(_)) => false,
                });
            }
            Command::Count(reply) => {
                let _ = reply.send(observers.len());
            }
        }
    }
    tracing::debug!("Broadcast hub stopped");
}

/// A live subscription. Yields payloads until the observer is evicted or the
/// hub stops; dropping it unregisters.
pub struct Observer<E, P> {
    id: u64,
    mailbox: mpsc::Receiver<P>,
    commands: mpsc::Sender<Command<E, P>>,
}

impl<E, P> Observer<E, P> {
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Next payload, or `None` once evicted.
    pub async fn recv(&mut self) -> Option<P> {
        self.mailbox.recv().await
    }
}

impl<E, P> Stream for Observer<E, P> {
    type Item = P;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<P>> {
        self.mailbox.poll_recv(cx)
    }
}

impl<E, P> Drop for Observer<E, P> {
    fn drop(&mut self) {
        // A full command queue only delays removal until the next failed
        // delivery to the closed mailbox.
        let _ = self.commands.try_send(Command::Unregister(self.id));
    }
}
