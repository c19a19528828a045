//! In-process pub/sub for sync frames.
//!
//! One tokio broadcast channel carries pre-encoded [`Frame`]s to every
//! subscriber. Delivery is at-most-once: a receiver that falls more than
//! `capacity` frames behind loses the overflow, which is counted and logged.
//! Subscribers never see frames they published themselves.
//!
//! The channel also keeps the session directory (who is connected, with
//! which role), so it doubles as the [`SubordinateDirectory`] the authority
//! uses to resolve "all subordinates".

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, RwLock};
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::sync::broadcast::error::{RecvError, TryRecvError};
use warden_core::{Member, PeerId, SubordinateDirectory};

use crate::protocol::{Envelope, Frame, ProtocolError, SyncMessage};

#[derive(Debug, Clone, Default, PartialEq)]
pub struct ChannelStats {
    pub frames_sent: u64,
    pub frames_dropped: u64,
    pub members: usize,
    pub online: usize,
}

struct AtomicChannelStats {
    frames_sent: AtomicU64,
    frames_dropped: AtomicU64,
}

pub struct SyncChannel {
    sender: broadcast::Sender<Arc<Vec<u8>>>,
    members: RwLock<HashMap<PeerId, Member>>,
    capacity: usize,
    stats: Arc<AtomicChannelStats>,
}

impl SyncChannel {
    /// `capacity` bounds how far a receiver may lag before losing frames.
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self {
            sender,
            members: RwLock::new(HashMap::new()),
            capacity,
            stats: Arc::new(AtomicChannelStats {
                frames_sent: AtomicU64::new(0),
                frames_dropped: AtomicU64::new(0),
            }),
        }
    }

    /// Register `member` as online, announce it, and subscribe it.
    pub fn join(&self, member: Member) -> Subscription {
        let subscription = self.subscribe(member.id);
        self.admit(member);
        subscription
    }

    /// Register `member` as online and announce it to every subscriber.
    pub fn admit(&self, member: Member) -> Member {
        let announced = self.upsert_member(member);
        if let Ok(bytes) = (Frame::PeerJoined {
            peer: announced.clone(),
        })
        .encode()
        {
            self.publish_raw(Arc::new(bytes));
        }
        announced
    }

    /// Mark `peer_id` offline and announce the departure. Offline members
    /// stay in the directory: pushes may still name them.
    pub fn leave(&self, peer_id: &PeerId) {
        if self.mark_offline(peer_id) {
            if let Ok(bytes) = (Frame::PeerLeft { peer_id: *peer_id }).encode() {
                self.publish_raw(Arc::new(bytes));
            }
        }
    }

    /// Subscribe without touching the directory.
    pub fn subscribe(&self, peer_id: PeerId) -> Subscription {
        Subscription {
            peer_id,
            receiver: self.sender.subscribe(),
            stats: self.stats.clone(),
        }
    }

    pub fn subscribe_raw(&self) -> broadcast::Receiver<Arc<Vec<u8>>> {
        self.sender.subscribe()
    }

    /// Insert or replace a member, forcing it online. Silent.
    pub fn upsert_member(&self, mut member: Member) -> Member {
        member.online = true;
        let mut members = self.members.write().unwrap_or_else(|e| e.into_inner());
        members.insert(member.id, member.clone());
        member
    }

    /// Returns whether the member was known and online.
    pub fn mark_offline(&self, peer_id: &PeerId) -> bool {
        let mut members = self.members.write().unwrap_or_else(|e| e.into_inner());
        match members.get_mut(peer_id) {
            Some(member) if member.online => {
                member.online = false;
                true
            }
            _ => false,
        }
    }

    /// Replace the directory with a roster received from a relay, keeping
    /// `local` (this process's own member) in place.
    pub fn replace_roster(&self, roster: Vec<Member>, local: &Member) {
        let mut members = self.members.write().unwrap_or_else(|e| e.into_inner());
        members.clear();
        for member in roster {
            members.insert(member.id, member);
        }
        members
            .entry(local.id)
            .or_insert_with(|| Member {
                online: true,
                ..local.clone()
            });
    }

    pub fn online_count(&self) -> usize {
        let members = self.members.read().unwrap_or_else(|e| e.into_inner());
        members.values().filter(|m| m.online).count()
    }

    pub fn member(&self, peer_id: &PeerId) -> Option<Member> {
        let members = self.members.read().unwrap_or_else(|e| e.into_inner());
        members.get(peer_id).cloned()
    }

    /// Publish `message` as `sender`. Returns the number of receivers; zero
    /// receivers is not an error.
    pub fn publish(&self, sender: PeerId, message: SyncMessage) -> Result<usize, ProtocolError> {
        let kind = message.type_name();
        let bytes = Frame::Message(Envelope::new(sender, message)).encode()?;
        let receivers = self.publish_raw(Arc::new(bytes));
        log::debug!("Published {kind} from {sender} to {receivers} receivers");
        Ok(receivers)
    }

    /// Publish an already-encoded frame.
    pub fn publish_raw(&self, bytes: Arc<Vec<u8>>) -> usize {
        let receivers = self.sender.send(bytes).unwrap_or(0);
        self.stats.frames_sent.fetch_add(1, Ordering::Relaxed);
        receivers
    }

    pub fn stats(&self) -> ChannelStats {
        let members = self.members.read().unwrap_or_else(|e| e.into_inner()).len();
        ChannelStats {
            frames_sent: self.stats.frames_sent.load(Ordering::Relaxed),
            frames_dropped: self.stats.frames_dropped.load(Ordering::Relaxed),
            members,
            online: self.online_count(),
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}

impl SubordinateDirectory for SyncChannel {
    fn members(&self) -> Vec<Member> {
        let members = self.members.read().unwrap_or_else(|e| e.into_inner());
        members.values().cloned().collect()
    }
}

/// A peer's view of the channel: envelopes from everyone else.
pub struct Subscription {
    peer_id: PeerId,
    receiver: broadcast::Receiver<Arc<Vec<u8>>>,
    stats: Arc<AtomicChannelStats>,
}

impl Subscription {
    pub fn peer_id(&self) -> PeerId {
        self.peer_id
    }

    /// Wait for the next envelope from another peer. Returns `None` once the
    /// channel is closed.
    pub async fn recv(&mut self) -> Option<Envelope> {
        loop {
            match self.receiver.recv().await {
                Ok(bytes) => {
                    if let Some(envelope) = self.accept(&bytes) {
                        return Some(envelope);
                    }
                }
                Err(RecvError::Lagged(skipped)) => self.lagged(skipped),
                Err(RecvError::Closed) => return None,
            }
        }
    }

    /// Non-blocking variant of [`recv`](Self::recv).
    pub fn try_recv(&mut self) -> Option<Envelope> {
        loop {
            match self.receiver.try_recv() {
                Ok(bytes) => {
                    if let Some(envelope) = self.accept(&bytes) {
                        return Some(envelope);
                    }
                }
                Err(TryRecvError::Lagged(skipped)) => self.lagged(skipped),
                Err(TryRecvError::Empty) | Err(TryRecvError::Closed) => return None,
            }
        }
    }

    fn accept(&self, bytes: &[u8]) -> Option<Envelope> {
        match Frame::decode(bytes) {
            Ok(Frame::Message(envelope)) if envelope.sender != self.peer_id => Some(envelope),
            Ok(_) => None,
            Err(e) => {
                log::warn!("Dropping malformed frame: {e}");
                None
            }
        }
    }

    fn lagged(&self, skipped: u64) {
        log::warn!("Peer {} lagged; {skipped} frames lost", self.peer_id);
        self.stats.frames_dropped.fetch_add(skipped, Ordering::Relaxed);
    }
}

/// Coalesces refresh requests inside a short window into one broadcast.
pub struct RefreshDebouncer {
    channel: Arc<SyncChannel>,
    sender: PeerId,
    message: SyncMessage,
    window: Duration,
    scheduled: Arc<AtomicBool>,
}

impl RefreshDebouncer {
    pub fn new(channel: Arc<SyncChannel>, sender: PeerId, message: SyncMessage, window: Duration) -> Self {
        Self {
            channel,
            sender,
            message,
            window,
            scheduled: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Schedule a refresh. Requests arriving while one is pending are folded
    /// into it. Without a tokio runtime, or with a zero window, the refresh
    /// goes out immediately.
    pub fn request(&self) {
        if self.window.is_zero() {
            self.publish_now();
            return;
        }
        let Ok(handle) = tokio::runtime::Handle::try_current() else {
            self.publish_now();
            return;
        };
        if self.scheduled.swap(true, Ordering::AcqRel) {
            return;
        }

        let channel = self.channel.clone();
        let sender = self.sender;
        let message = self.message.clone();
        let window = self.window;
        let scheduled = self.scheduled.clone();
        handle.spawn(async move {
            tokio::time::sleep(window).await;
            scheduled.store(false, Ordering::Release);
            if let Err(e) = channel.publish(sender, message) {
                log::warn!("Refresh broadcast failed: {e}");
            }
        });
    }

    pub fn is_pending(&self) -> bool {
        self.scheduled.load(Ordering::Acquire)
    }

    fn publish_now(&self) {
        if let Err(e) = self.channel.publish(self.sender, self.message.clone()) {
            log::warn!("Refresh broadcast failed: {e}");
        }
    }
}
