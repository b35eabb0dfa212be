//! Outbound message queue.
//!
//! A single worker task consumes a FIFO of (packet, recipients) entries and
//! writes each packet to every recipient through the externally-owned
//! connection pool. Recipients whose connection is still being established
//! stay in the entry's outstanding set and are retried on the next cycle;
//! recipients with hard connection failures are dropped and remembered as
//! unreachable, which feeds the tree overlay's reachability input.

use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::utilities::crypto::ProcessId;
use crate::network::{ConnectError, ConnectionPool};
use crate::view::ViewData;

const RETRY_INTERVAL: Duration = Duration::from_millis(500);

#[derive(Debug)]
struct OutboundEntry {
    packet: Bytes,
    recipients: BTreeSet<ProcessId>,
}

#[derive(Debug)]
enum OutboundCommand {
    Enqueue(OutboundEntry),
    ClearQueue,
}

/// Handle to the outbound worker. Cheap to clone; the worker stops when the
/// last handle is dropped.
#[derive(Clone)]
pub struct MessageSender {
    commands: mpsc::UnboundedSender<OutboundCommand>,
    unreachable: Arc<Mutex<BTreeSet<ProcessId>>>,
}

impl MessageSender {
    /// Spawns the worker task over `pool`.
    pub fn start(pool: Arc<dyn ConnectionPool>) -> (MessageSender, JoinHandle<()>) {
        let (commands_tx, commands_rx) = mpsc::unbounded_channel();
        let unreachable = Arc::new(Mutex::new(BTreeSet::new()));

        let worker = Worker {
            commands: commands_rx,
            pool,
            unreachable: unreachable.clone(),
            pending: Vec::new(),
        };
        let handle = tokio::spawn(worker.run());

        (
            MessageSender {
                commands: commands_tx,
                unreachable,
            },
            handle,
        )
    }

    /// Queues `packet` for delivery to every recipient. Self-addressed
    /// sends never reach this point; engines loop those back internally.
    pub fn enqueue(&self, packet: Bytes, recipients: BTreeSet<ProcessId>) {
        if recipients.is_empty() {
            return;
        }
        let entry = OutboundEntry { packet, recipients };
        if self.commands.send(OutboundCommand::Enqueue(entry)).is_err() {
            log::warn!("outbound worker is gone, dropping packet");
        }
    }

    /// Drops all queued and retry-pending packets.
    pub fn clear_queue(&self) {
        let _ = self.commands.send(OutboundCommand::ClearQueue);
    }

    /// The subset of `candidates` with a recorded hard connection failure.
    pub fn unreachable_nodes(&self, candidates: &ViewData) -> ViewData {
        let unreachable = self.unreachable.lock();
        candidates
            .iter()
            .filter(|id| unreachable.contains(*id))
            .copied()
            .collect()
    }

    /// Forgets recorded connection failures, e.g. after a view change.
    pub fn clear_unreachable_nodes(&self) {
        self.unreachable.lock().clear();
    }
}

struct Worker {
    commands: mpsc::UnboundedReceiver<OutboundCommand>,
    pool: Arc<dyn ConnectionPool>,
    unreachable: Arc<Mutex<BTreeSet<ProcessId>>>,
    pending: Vec<OutboundEntry>,
}

impl Worker {
    async fn run(mut self) {
        loop {
            if self.pending.is_empty() {
                match self.commands.recv().await {
                    Some(command) => self.apply(command),
                    None => return,
                }
            } else {
                // Entries kept for retry: wait for new work, but retry the
                // outstanding recipients even when none arrives.
                tokio::select! {
                    command = self.commands.recv() => match command {
                        Some(command) => self.apply(command),
                        None => return,
                    },
                    _ = tokio::time::sleep(RETRY_INTERVAL) => {}
                }
            }

            // Drain whatever else is already queued before hitting sockets.
            while let Ok(command) = self.commands.try_recv() {
                self.apply(command);
            }

            let entries = std::mem::take(&mut self.pending);
            for entry in entries {
                if let Some(unsent) = self.send_entry(entry).await {
                    self.pending.push(unsent);
                }
            }
        }
    }

    fn apply(&mut self, command: OutboundCommand) {
        match command {
            OutboundCommand::Enqueue(entry) => self.pending.push(entry),
            OutboundCommand::ClearQueue => self.pending.clear(),
        }
    }

    /// Attempts delivery to every recipient of `entry`. Returns the entry
    /// with the recipients that should be retried, if any.
    async fn send_entry(&self, entry: OutboundEntry) -> Option<OutboundEntry> {
        let mut outstanding = BTreeSet::new();
        for recipient in entry.recipients {
            match self.pool.acquire(&recipient).await {
                Ok(writer) => {
                    if let Err(err) = writer.write(entry.packet.clone()).await {
                        log::error!("sending packet to {recipient} failed: {err}");
                    }
                }
                Err(ConnectError::AlreadyConnected) => {
                    outstanding.insert(recipient);
                }
                Err(ConnectError::Failed(reason)) => {
                    log::warn!("connection to {recipient} failed: {reason}");
                    self.unreachable.lock().insert(recipient);
                }
            }
        }

        if outstanding.is_empty() {
            None
        } else {
            Some(OutboundEntry {
                packet: entry.packet,
                recipients: outstanding,
            })
        }
    }
}
