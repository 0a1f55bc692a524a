//! Exclusive access to the serial channel.
//!
//! The serial line is half duplex and the PSU handles one request at a time, so every writer
//! first takes a [`ChannelLease`]. The lease is the only way to put a frame on the wire and the
//! channel is released when it is dropped, whichever path the holder leaves by.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use tokio::sync::OwnedMutexGuard;
use tracing::trace;

use crate::error::{Error, Result};
use crate::frame::RtuBuffer;
use crate::serial::{SerialWriter, Ticket};

/// Who is currently driving the serial channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LeaseOwner {
    /// The bridge, on behalf of a network peer.
    Peer(SocketAddr),
    /// The periodic status read.
    StatusPoller,
}

/// The single serial channel to the PSU.
pub struct Channel {
    gate: Arc<tokio::sync::Mutex<()>>,
    holder: Mutex<Option<LeaseOwner>>,
    writer: SerialWriter,
    bridge_attached: AtomicBool,
    max_wait: Duration,
}

impl Channel {
    /// `max_wait` bounds how long [`Channel::acquire`] waits for the channel.
    pub fn new(writer: SerialWriter, max_wait: Duration) -> Arc<Self> {
        Arc::new(Self {
            gate: Arc::new(tokio::sync::Mutex::new(())),
            holder: Mutex::new(None),
            writer,
            bridge_attached: AtomicBool::new(false),
            max_wait,
        })
    }

    /// Take the channel if nobody holds it, without waiting.
    pub fn try_acquire(self: &Arc<Self>, owner: LeaseOwner) -> Result<ChannelLease> {
        let guard = self
            .gate
            .clone()
            .try_lock_owned()
            .map_err(|_| Error::Busy)?;
        Ok(self.grant(owner, guard))
    }

    /// Wait up to the channel's maximum wait for the lease, then give up with [`Error::Busy`].
    pub async fn acquire(self: &Arc<Self>, owner: LeaseOwner) -> Result<ChannelLease> {
        if self.max_wait.is_zero() {
            return self.try_acquire(owner);
        }
        let guard = tokio::time::timeout(self.max_wait, self.gate.clone().lock_owned())
            .await
            .map_err(|_| Error::Busy)?;
        Ok(self.grant(owner, guard))
    }

    fn grant(self: &Arc<Self>, owner: LeaseOwner, guard: OwnedMutexGuard<()>) -> ChannelLease {
        *self.holder() = Some(owner);
        trace!(?owner, "lease granted");
        ChannelLease {
            owner,
            channel: self.clone(),
            _guard: guard,
        }
    }

    /// Is somebody driving the channel right now?
    pub fn is_leased(&self) -> bool {
        self.holder().is_some()
    }

    /// Current lease holder, if any.
    pub fn lease_holder(&self) -> Option<LeaseOwner> {
        *self.holder()
    }

    fn holder(&self) -> std::sync::MutexGuard<'_, Option<LeaseOwner>> {
        self.holder.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Claim the channel for a bridge. Only one bridge may ever be attached at a time.
    pub(crate) fn attach_bridge(&self) -> Result<()> {
        self.bridge_attached
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .map(|_| ())
            .map_err(|_| Error::DuplicateArbiter)
    }

    pub(crate) fn detach_bridge(&self) {
        self.bridge_attached.store(false, Ordering::Release);
    }
}

/// The right to drive the serial channel. Dropping it releases the channel.
pub struct ChannelLease {
    owner: LeaseOwner,
    channel: Arc<Channel>,
    _guard: OwnedMutexGuard<()>,
}

impl ChannelLease {
    pub fn owner(&self) -> LeaseOwner {
        self.owner
    }

    /// Queue a frame for the serial transport. The returned ticket identifies the response.
    pub fn send(&self, frame: RtuBuffer) -> Result<Ticket> {
        self.channel.writer.send(frame)
    }
}

impl Drop for ChannelLease {
    fn drop(&mut self) {
        // The guard field is dropped after this, so the holder is cleared first.
        *self.channel.holder() = None;
        trace!(owner = ?self.owner, "lease released");
    }
}

impl core::fmt::Debug for ChannelLease {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("ChannelLease")
            .field("owner", &self.owner)
            .finish()
    }
}
