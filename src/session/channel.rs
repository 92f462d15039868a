//! Non-owning handle to a device-facing connection
//!
//! The connection task owns the socket. Everyone else holds a
//! [`DeviceChannel`], which queues writes and close requests for that task.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

use tokio::sync::mpsc;

use crate::{Error, Result};

static NEXT_CHANNEL_ID: AtomicU64 = AtomicU64::new(1);

/// Process-unique identifier of a device connection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ChannelId(u64);

impl ChannelId {
    fn next() -> Self {
        Self(NEXT_CHANNEL_ID.fetch_add(1, Ordering::Relaxed))
    }
}

impl fmt::Display for ChannelId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ch-{}", self.0)
    }
}

/// Instruction for the task that owns the connection
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChannelCommand {
    /// Write a raw, already-delimited line
    Write(String),
    /// Flush pending writes and close the connection
    Close,
}

/// Cloneable handle used to write to a device connection
#[derive(Debug, Clone)]
pub struct DeviceChannel {
    id: ChannelId,
    peer: String,
    tx: mpsc::UnboundedSender<ChannelCommand>,
}

impl DeviceChannel {
    /// Create a handle and the receiver the connection task drains
    #[must_use]
    pub fn new(peer: impl Into<String>) -> (Self, mpsc::UnboundedReceiver<ChannelCommand>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let channel = Self {
            id: ChannelId::next(),
            peer: peer.into(),
            tx,
        };
        (channel, rx)
    }

    /// Connection identifier
    #[must_use]
    pub const fn id(&self) -> ChannelId {
        self.id
    }

    /// Remote peer description
    #[must_use]
    pub fn peer(&self) -> &str {
        &self.peer
    }

    /// Queue a raw line for writing, preserving order
    ///
    /// # Errors
    ///
    /// Returns error if the connection task has already exited
    pub fn write(&self, line: String) -> Result<()> {
        self.tx
            .send(ChannelCommand::Write(line))
            .map_err(|_| Error::Session(format!("channel {} is closed", self.id)))
    }

    /// Ask the connection task to close after pending writes
    pub fn close(&self) {
        if self.tx.send(ChannelCommand::Close).is_err() {
            tracing::debug!(channel = %self.id, "close requested on finished channel");
        }
    }

    /// Whether the connection task has exited
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ids_are_unique() {
        let (a, _rx_a) = DeviceChannel::new("a");
        let (b, _rx_b) = DeviceChannel::new("b");
        assert_ne!(a.id(), b.id());
    }

    #[test]
    fn writes_arrive_in_order() {
        let (ch, mut rx) = DeviceChannel::new("peer");
        ch.write("one".to_string()).unwrap();
        ch.write("two".to_string()).unwrap();
        ch.close();

        assert_eq!(rx.try_recv().unwrap(), ChannelCommand::Write("one".to_string()));
        assert_eq!(rx.try_recv().unwrap(), ChannelCommand::Write("two".to_string()));
        assert_eq!(rx.try_recv().unwrap(), ChannelCommand::Close);
    }

    #[test]
    fn write_after_task_exit_fails() {
        let (ch, rx) = DeviceChannel::new("peer");
        drop(rx);

        assert!(ch.is_closed());
        assert!(ch.write("late".to_string()).is_err());
    }
}
