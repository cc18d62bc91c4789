//! Background expiration sweeper (spec.md §4.G).
//!
//! A single `tokio::spawn`ed task owns a min-heap of `(expires_at,
//! state_token)` entries and sleeps until the next deadline, waking early
//! whenever `add`/`remove` arrives over its mpsc channel. On expiry it calls
//! back into whatever implements `ExpiryHandler` — in practice the
//! `LockManager` — to release the lock through the normal release path, so
//! expiry and explicit `UNLOCK` share one code path and one event.

use std::cmp::Reverse;
use std::collections::BinaryHeap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use log::{trace, warn};
use tokio::sync::mpsc;
use tokio::time::Instant;

use crate::clock::Clock;

/// Implemented by whatever owns lock storage, so the cleanup actor can
/// react to an expiry without knowing about transactions or backends.
pub trait ExpiryHandler: Send + Sync {
    fn expire<'a>(&'a self, state_token: &'a str) -> crate::backend::BackendFuture<'a, ()>;
}

enum Command {
    Track { state_token: String, expires_at: DateTime<Utc> },
    Untrack { state_token: String },
    Shutdown,
}

#[derive(Eq, PartialEq)]
struct Entry {
    expires_at: DateTime<Utc>,
    state_token: String,
}

impl Ord for Entry {
    fn cmp(&self, other: &Entry) -> std::cmp::Ordering {
        self.expires_at.cmp(&other.expires_at).then_with(|| self.state_token.cmp(&other.state_token))
    }
}

impl PartialOrd for Entry {
    fn partial_cmp(&self, other: &Entry) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

/// Handle to the running cleanup task. Dropping it stops the task.
#[derive(Debug)]
pub struct CleanupActor {
    commands: mpsc::UnboundedSender<Command>,
}

impl CleanupActor {
    /// Spawn the sweeper. `clock` is consulted each wakeup so tests using a
    /// manually-advanced clock still observe expirations deterministically.
    pub fn spawn<H>(clock: Arc<dyn Clock>, handler: Arc<H>) -> CleanupActor
    where
        H: ExpiryHandler + 'static,
    {
        let (tx, rx) = mpsc::unbounded_channel();
        tokio::spawn(run(rx, clock, handler));
        CleanupActor { commands: tx }
    }

    pub fn track(&self, state_token: String, expires_at: DateTime<Utc>) {
        if self.commands.send(Command::Track { state_token: state_token.clone(), expires_at }).is_err() {
            warn!("cleanup queue mutation failed, actor task is gone: track {}", state_token);
        }
    }

    pub fn untrack(&self, state_token: String) {
        if self.commands.send(Command::Untrack { state_token: state_token.clone() }).is_err() {
            warn!("cleanup queue mutation failed, actor task is gone: untrack {}", state_token);
        }
    }

    pub fn shutdown(&self) {
        let _ = self.commands.send(Command::Shutdown);
    }
}

async fn run<H>(mut commands: mpsc::UnboundedReceiver<Command>, clock: Arc<dyn Clock>, handler: Arc<H>)
where
    H: ExpiryHandler + 'static,
{
    let mut heap: BinaryHeap<Reverse<Entry>> = BinaryHeap::new();
    let mut removed: std::collections::HashSet<String> = std::collections::HashSet::new();

    loop {
        let sleep_for = heap.peek().map(|Reverse(e)| {
            let now = clock.now();
            (e.expires_at - now).to_std().unwrap_or(std::time::Duration::ZERO)
        });

        let wake = async {
            match sleep_for {
                Some(d) => tokio::time::sleep_until(Instant::now() + d).await,
                None => std::future::pending::<()>().await,
            }
        };

        tokio::select! {
            biased;
            msg = commands.recv() => {
                match msg {
                    Some(Command::Track { state_token, expires_at }) => {
                        trace!("cleanup queue mutation: track {} expires_at={}", state_token, expires_at);
                        removed.remove(&state_token);
                        // A re-track (refresh) may supersede an already-queued deadline for
                        // this token; drop the stale entry so the heap can't fire on it.
                        if heap.iter().any(|Reverse(e)| e.state_token == state_token) {
                            heap = heap.into_iter().filter(|Reverse(e)| e.state_token != state_token).collect();
                        }
                        heap.push(Reverse(Entry { expires_at, state_token }));
                    },
                    Some(Command::Untrack { state_token }) => {
                        trace!("cleanup queue mutation: untrack {}", state_token);
                        removed.insert(state_token);
                    },
                    Some(Command::Shutdown) | None => return,
                }
            },
            _ = wake => {
                let now = clock.now();
                while let Some(Reverse(top)) = heap.peek() {
                    if top.expires_at > now {
                        break;
                    }
                    let Reverse(entry) = heap.pop().unwrap();
                    if removed.remove(&entry.state_token) {
                        continue;
                    }
                    handler.expire(&entry.state_token).await;
                }
            },
        }
    }
}
