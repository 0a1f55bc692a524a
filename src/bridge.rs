//! The bridge between Modbus TCP peers and the PSU on the serial line.
//!
//! Every network request goes through [`Bridge::submit`]: it waits (bounded) for the channel
//! lease, queues the RTU frame and records the [`PendingTransaction`] under the frame's ticket. The
//! serial transport reports what it reads through [`FrameSink::on_serial_frame`]. Only a response
//! read for the pending transaction's own ticket is routed back to the submitter; anything else,
//! including a late answer to a request that was already given up on, is passed through unmodified
//! to [`Bridge::subscribe_frames`] listeners such as the status poller.
//!
//! There is at most one pending transaction at a time and it always ends: by its response, by the
//! response timeout, or by an administrative release. Each of those drops the lease.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Duration;

use serde::Deserialize;
use tokio::sync::{broadcast, oneshot, watch};
use tracing::{debug, info, trace, warn};

use crate::error::{Error, Result};
use crate::frame;
use crate::lease::{Channel, ChannelLease, LeaseOwner};
use crate::serial::{Direction, FrameSink, SerialFrame, Ticket};
use crate::uplink::UplinkState;

/// Capacity of the pass-through frame feed.
const FRAME_FEED_CAPACITY: usize = 32;

/// Bridge timing.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct BridgeConfig {
    /// How long the PSU has to answer a forwarded request.
    #[serde(with = "humantime_serde")]
    pub response_timeout: Duration,
    /// How long a request may wait for the channel before it is refused as busy.
    #[serde(with = "humantime_serde")]
    pub lease_wait: Duration,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            response_timeout: Duration::from_secs(1),
            lease_wait: Duration::from_secs(2),
        }
    }
}

/// A Modbus request from a network peer, stripped of its TCP envelope.
#[derive(Debug, Clone)]
pub struct Request {
    pub peer: SocketAddr,
    pub unit_id: u8,
    pub transaction_id: u16,
    /// Function code and data.
    pub pdu: Vec<u8>,
}

/// The PSU's answer, tagged with everything needed to send it back to the right peer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Response {
    pub peer: SocketAddr,
    pub transaction_id: u16,
    pub unit_id: u8,
    pub pdu: Vec<u8>,
}

/// Handed to the submitter of an accepted request.
#[derive(Debug)]
pub struct PendingReply {
    rx: oneshot::Receiver<Result<Response>>,
}

impl PendingReply {
    /// Wait for the correlated response. Ends with [`Error::Timeout`] if the device never
    /// answered or the transaction was cancelled.
    pub async fn wait(self) -> Result<Response> {
        self.rx.await.unwrap_or(Err(Error::Timeout))
    }
}

/// The one request currently in flight on the serial channel.
struct PendingTransaction {
    /// The queued frame; only a response read for it completes the transaction.
    ticket: Ticket,
    transaction_id: u16,
    peer: SocketAddr,
    unit_id: u8,
    function: u8,
    generation: u64,
    reply: oneshot::Sender<Result<Response>>,
    lease: ChannelLease,
}

/// Serializes network requests onto the serial channel and routes the answers back.
pub struct Bridge {
    me: Weak<Bridge>,
    channel: Arc<Channel>,
    pending: Mutex<Option<PendingTransaction>>,
    frames: broadcast::Sender<SerialFrame>,
    uplink: watch::Receiver<UplinkState>,
    response_timeout: Duration,
    next_generation: AtomicU64,
}

impl Bridge {
    /// Attach a bridge to `channel`. Fails with [`Error::DuplicateArbiter`] if the channel already
    /// has one.
    pub fn new(
        channel: Arc<Channel>,
        uplink: watch::Receiver<UplinkState>,
        config: &BridgeConfig,
    ) -> Result<Arc<Self>> {
        channel.attach_bridge()?;
        let (frames, _) = broadcast::channel(FRAME_FEED_CAPACITY);
        info!(response_timeout = ?config.response_timeout, "modbus bridge attached");
        Ok(Arc::new_cyclic(|me| Self {
            me: me.clone(),
            channel,
            pending: Mutex::new(None),
            frames,
            uplink,
            response_timeout: config.response_timeout,
            next_generation: AtomicU64::new(0),
        }))
    }

    /// Forward a request to the PSU.
    ///
    /// Refused with [`Error::LinkDown`] while the uplink is not connected and with [`Error::Busy`]
    /// if the channel stays leased longer than the lease wait.
    pub async fn submit(&self, request: Request) -> Result<PendingReply> {
        if *self.uplink.borrow() != UplinkState::Connected {
            return Err(Error::LinkDown);
        }
        let function = *request.pdu.first().ok_or(Error::InvalidFrame)?;
        let frame = frame::encode_rtu(request.unit_id, &request.pdu)?;

        let lease = self.channel.acquire(LeaseOwner::Peer(request.peer)).await?;
        let generation = self.next_generation.fetch_add(1, Ordering::Relaxed);
        let (reply, rx) = oneshot::channel();

        {
            let mut slot = self.pending();
            if slot.is_some() {
                return Err(Error::Busy);
            }
            // The slot stays locked until the transaction is on record, so the response cannot
            // overtake it.
            let ticket = lease.send(frame)?;
            *slot = Some(PendingTransaction {
                ticket,
                transaction_id: request.transaction_id,
                peer: request.peer,
                unit_id: request.unit_id,
                function,
                generation,
                reply,
                lease,
            });
        }

        debug!(
            peer = %request.peer,
            transaction_id = request.transaction_id,
            unit_id = request.unit_id,
            function,
            "request forwarded"
        );
        self.arm_watchdog(generation);
        Ok(PendingReply { rx })
    }

    /// Frames seen on the serial line that were not a response to a bridged request.
    pub fn subscribe_frames(&self) -> broadcast::Receiver<SerialFrame> {
        self.frames.subscribe()
    }

    pub fn channel(&self) -> &Arc<Channel> {
        &self.channel
    }

    /// True when no transaction is pending.
    pub fn is_idle(&self) -> bool {
        self.pending().is_none()
    }

    /// The peer whose transaction is pending, if any.
    pub fn pending_peer(&self) -> Option<SocketAddr> {
        self.pending().as_ref().map(|pending| pending.peer)
    }

    /// Drop the pending transaction of `peer`, if it has one, and release the channel.
    ///
    /// Used when the peer is disconnected administratively. Returns whether anything was released.
    pub fn release_peer(&self, peer: SocketAddr) -> bool {
        let released = {
            let mut slot = self.pending();
            if slot.as_ref().is_some_and(|pending| pending.peer == peer) {
                slot.take()
            } else {
                None
            }
        };
        match released {
            Some(pending) => {
                info!(
                    %peer,
                    transaction_id = pending.transaction_id,
                    "pending transaction released"
                );
                true
            }
            None => false,
        }
    }

    fn pending(&self) -> MutexGuard<'_, Option<PendingTransaction>> {
        self.pending.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn arm_watchdog(&self, generation: u64) {
        let bridge = self.me.clone();
        let timeout = self.response_timeout;
        tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            if let Some(bridge) = bridge.upgrade() {
                bridge.expire(generation);
            }
        });
    }

    /// Time out the transaction started as `generation`, if it is still pending.
    fn expire(&self, generation: u64) {
        let expired = {
            let mut slot = self.pending();
            if slot.as_ref().is_some_and(|pending| pending.generation == generation) {
                slot.take()
            } else {
                None
            }
        };
        if let Some(pending) = expired {
            warn!(
                peer = %pending.peer,
                transaction_id = pending.transaction_id,
                unit_id = pending.unit_id,
                "device did not respond"
            );
            let PendingTransaction { reply, lease, .. } = pending;
            drop(lease);
            let _ = reply.send(Err(Error::Timeout));
        }
    }

    /// Take the pending transaction if `frame` was read in answer to its request.
    fn correlate(&self, frame: &SerialFrame) -> Option<(PendingTransaction, Result<Vec<u8>>)> {
        let mut slot = self.pending();
        let pending = slot.as_ref()?;
        if frame.direction != Direction::FromDevice || frame.ticket != Some(pending.ticket) {
            return None;
        }
        let outcome = match frame::decode_rtu(&frame.bytes) {
            Ok((unit_id, pdu)) if unit_id == pending.unit_id && pdu[0] & 0x7F == pending.function => {
                Ok(pdu.to_vec())
            }
            Ok(_) => return None,
            Err(err) => Err(err),
        };
        slot.take().map(|pending| (pending, outcome))
    }

    fn deliver(&self, pending: PendingTransaction, outcome: Result<Vec<u8>>) {
        let PendingTransaction {
            transaction_id,
            peer,
            unit_id,
            reply,
            lease,
            ..
        } = pending;
        // The channel is free again before the peer sees its answer.
        drop(lease);

        if let Err(err) = &outcome {
            warn!(%peer, transaction_id, %err, "unusable response from device");
        }
        let response = outcome.map(|pdu| Response {
            peer,
            transaction_id,
            unit_id,
            pdu,
        });
        match reply.send(response) {
            Ok(()) => debug!(%peer, transaction_id, "response delivered"),
            Err(_) => debug!(%peer, transaction_id, "peer gone, response discarded"),
        }
    }

    fn pass_through(&self, frame: &SerialFrame) {
        if frame.direction == Direction::FromDevice && frame.ticket.is_some() {
            trace!(ticket = ?frame.ticket, "uncorrelated response passed through");
        }
        // Nobody listening is fine.
        let _ = self.frames.send(frame.clone());
    }
}

impl FrameSink for Bridge {
    fn on_serial_frame(&self, frame: &SerialFrame) {
        match self.correlate(frame) {
            Some((pending, outcome)) => self.deliver(pending, outcome),
            None => self.pass_through(frame),
        }
    }
}

impl Drop for Bridge {
    fn drop(&mut self) {
        self.channel.detach_bridge();
    }
}
