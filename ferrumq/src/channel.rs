//! Implements the channel contract and the per-connection channel
//! registry

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::Bytes;
use parking_lot::{Mutex, RwLock};

use ferrumq_types::methods::Method;
use ferrumq_types::properties::ContentHeader;
use ferrumq_types::reply_code::ReplyCode;

use crate::error::{ChannelException, ConnectionException};

/// Traffic addressed to one channel.
#[derive(Debug, Clone, PartialEq)]
pub enum ChannelFrame {
    /// A method frame
    Method(Method),

    /// A content header opening a message body
    ContentHeader(ContentHeader),

    /// A slice of message body
    ContentBody(Bytes),
}

/// The contract a channel implementation exposes to the engine.
///
/// The channel's own state machine (consumers, unconfirmed deliveries,
/// transactions) lives behind this trait; the engine only routes traffic
/// and lifecycle signals through it.
pub trait AmqpChannel: Send + Sync {
    /// Delivers one decoded frame in wire order.
    fn receive(&self, frame: ChannelFrame) -> Result<(), ChannelException>;

    /// Signals that the inbound buffer the last `receive` calls came
    /// from has been fully processed. Called exactly once per touched
    /// channel per buffer.
    fn receive_complete(&self) -> Result<(), ChannelException>;

    /// Closes the channel, releasing its resources.
    fn close(&self, cause: ReplyCode, message: &str);

    /// Suspends message flow to the client.
    fn block(&self);

    /// Resumes message flow to the client.
    fn unblock(&self);

    /// Notifies the channel that transport writability changed.
    fn transport_state_changed(&self);

    /// Performs one unit of deferred work; returns true while more
    /// remains.
    fn process_pending(&self) -> bool;

    /// True once the channel started closing.
    fn is_closing(&self) -> bool;
}

/// Creates channel implementations for `Channel.Open`.
///
/// The channel's state machine lives with the virtual host's fabric;
/// the engine only asks for an instance to register.
pub trait ChannelFactory: Send + Sync {
    /// Creates the channel registered under `id`.
    fn create_channel(
        &self,
        id: u16,
        virtual_host: &Arc<dyn crate::contract::VirtualHost>,
    ) -> Arc<dyn AmqpChannel>;
}

/// Result of a registry lookup.
#[derive(Clone)]
pub enum ChannelLookup {
    /// The channel is open
    Open(Arc<dyn AmqpChannel>),

    /// The channel awaits `Close-Ok`; inbound methods are discarded
    Closing,

    /// No such channel; dispatch replies `Connection.Close(CHANNEL_ERROR)`
    Missing,
}

impl std::fmt::Debug for ChannelLookup {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Open(_) => f.write_str("Open"),
            Self::Closing => f.write_str("Closing"),
            Self::Missing => f.write_str("Missing"),
        }
    }
}

#[derive(Debug, Default)]
struct RegistryState {
    blocked: bool,
}

/// The per-connection mapping from channel number to open channel.
///
/// Mutations (open, close, block state) are serialised under `state`;
/// lookups go through the read side of `channels` so the I/O thread
/// never waits on a mutator. The awaiting-`Close-Ok` table is readable
/// from any thread.
pub struct ChannelRegistry {
    channels: RwLock<HashMap<u16, Arc<dyn AmqpChannel>>>,
    state: Mutex<RegistryState>,
    closing: Mutex<HashMap<u16, Instant>>,
    max_channel_id: std::sync::atomic::AtomicU16,
}

impl std::fmt::Debug for ChannelRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChannelRegistry")
            .field("open", &self.channels.read().len())
            .field("closing", &self.closing.lock().len())
            .finish()
    }
}

impl ChannelRegistry {
    /// An empty registry admitting channel ids up to `max_channel_id`.
    pub fn new(max_channel_id: u16) -> Self {
        Self {
            channels: RwLock::new(HashMap::new()),
            state: Mutex::new(RegistryState::default()),
            closing: Mutex::new(HashMap::new()),
            max_channel_id: std::sync::atomic::AtomicU16::new(max_channel_id),
        }
    }

    /// Updates the negotiated channel cap after `Tune-Ok`.
    pub fn set_max_channel_id(&self, max_channel_id: u16) {
        self.max_channel_id
            .store(max_channel_id, std::sync::atomic::Ordering::Relaxed);
    }

    fn max_channel_id(&self) -> u16 {
        self.max_channel_id.load(std::sync::atomic::Ordering::Relaxed)
    }

    /// Registers a channel under `id`.
    ///
    /// Rejects ids above the negotiated cap, ids already in use and ids
    /// still awaiting `Close-Ok`; each rejection is connection-fatal
    /// with `CHANNEL_ERROR`.
    pub fn open(
        &self,
        id: u16,
        channel: Arc<dyn AmqpChannel>,
    ) -> Result<(), ConnectionException> {
        let state = self.state.lock();

        let max = self.max_channel_id();
        if id > max {
            return Err(ConnectionException::new(
                ReplyCode::ChannelError,
                format!("Channel {id} cannot be created as the max allowed channel id is {max}"),
            ));
        }
        if self.closing.lock().contains_key(&id) {
            return Err(ConnectionException::new(
                ReplyCode::ChannelError,
                format!("Channel {id} already exists"),
            ));
        }

        let mut channels = self.channels.write();
        if channels.contains_key(&id) {
            return Err(ConnectionException::new(
                ReplyCode::ChannelError,
                format!("Channel {id} already exists"),
            ));
        }
        if state.blocked {
            channel.block();
        }
        channels.insert(id, channel);
        Ok(())
    }

    /// Looks up the channel for `id`.
    pub fn get(&self, id: u16) -> ChannelLookup {
        if let Some(channel) = self.channels.read().get(&id) {
            return ChannelLookup::Open(Arc::clone(channel));
        }
        if self.closing.lock().contains_key(&id) {
            return ChannelLookup::Closing;
        }
        ChannelLookup::Missing
    }

    /// Removes `id` from the live map, returning the channel.
    pub fn remove(&self, id: u16) -> Option<Arc<dyn AmqpChannel>> {
        let _state = self.state.lock();
        self.channels.write().remove(&id)
    }

    /// Moves `id` into the awaiting-`Close-Ok` table.
    pub fn mark_awaiting_close_ok(&self, id: u16) -> Option<Arc<dyn AmqpChannel>> {
        let _state = self.state.lock();
        let removed = self.channels.write().remove(&id);
        if removed.is_some() {
            self.closing.lock().insert(id, Instant::now());
        }
        removed
    }

    /// Completes a close handshake; returns true when `id` was awaiting
    /// `Close-Ok`.
    pub fn close_ok(&self, id: u16) -> bool {
        self.closing.lock().remove(&id).is_some()
    }

    /// True when any channel has been awaiting `Close-Ok` longer than
    /// `timeout`.
    pub fn has_stale_closing(&self, timeout: Duration) -> bool {
        let now = Instant::now();
        self.closing
            .lock()
            .values()
            .any(|since| now.duration_since(*since) >= timeout)
    }

    /// Blocks every open channel; returns false when already blocked.
    pub fn block_all(&self) -> bool {
        let mut state = self.state.lock();
        if state.blocked {
            return false;
        }
        state.blocked = true;
        for channel in self.channels.read().values() {
            channel.block();
        }
        true
    }

    /// Unblocks every open channel; returns false when not blocked.
    pub fn unblock_all(&self) -> bool {
        let mut state = self.state.lock();
        if !state.blocked {
            return false;
        }
        state.blocked = false;
        for channel in self.channels.read().values() {
            channel.unblock();
        }
        true
    }

    /// Visits every open channel.
    pub fn for_each(&self, mut f: impl FnMut(u16, &Arc<dyn AmqpChannel>)) {
        for (id, channel) in self.channels.read().iter() {
            f(*id, channel);
        }
    }

    /// Removes and returns every open channel, for teardown.
    pub fn drain(&self) -> Vec<(u16, Arc<dyn AmqpChannel>)> {
        let _state = self.state.lock();
        self.channels.write().drain().collect()
    }

    /// Ids of every open channel, in ascending order.
    pub fn ids(&self) -> Vec<u16> {
        let mut ids: Vec<u16> = self.channels.read().keys().copied().collect();
        ids.sort_unstable();
        ids
    }

    /// Number of open channels.
    pub fn len(&self) -> usize {
        self.channels.read().len()
    }

    /// True when no channels are open.
    pub fn is_empty(&self) -> bool {
        self.channels.read().is_empty()
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

    use super::*;

    /// A channel stub recording the lifecycle calls it receives.
    #[derive(Debug, Default)]
    pub(crate) struct RecordingChannel {
        pub received: Mutex<Vec<ChannelFrame>>,
        pub receive_complete_calls: AtomicUsize,
        pub pending_rounds: AtomicUsize,
        pub blocked: AtomicBool,
        pub closed: AtomicBool,
        pub closing: AtomicBool,
    }

    impl AmqpChannel for RecordingChannel {
        fn receive(&self, frame: ChannelFrame) -> Result<(), ChannelException> {
            self.received.lock().push(frame);
            Ok(())
        }

        fn receive_complete(&self) -> Result<(), ChannelException> {
            self.receive_complete_calls.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        fn close(&self, _cause: ReplyCode, _message: &str) {
            self.closed.store(true, Ordering::SeqCst);
        }

        fn block(&self) {
            self.blocked.store(true, Ordering::SeqCst);
        }

        fn unblock(&self) {
            self.blocked.store(false, Ordering::SeqCst);
        }

        fn transport_state_changed(&self) {}

        fn process_pending(&self) -> bool {
            // counts down to zero, one unit of work per call
            let remaining = self.pending_rounds.load(Ordering::SeqCst);
            if remaining == 0 {
                return false;
            }
            self.pending_rounds.store(remaining - 1, Ordering::SeqCst);
            remaining > 1
        }

        fn is_closing(&self) -> bool {
            self.closing.load(Ordering::SeqCst)
        }
    }

    fn registry() -> ChannelRegistry {
        ChannelRegistry::new(16)
    }

    #[test]
    fn ids_are_unique() {
        let registry = registry();
        registry.open(1, Arc::new(RecordingChannel::default())).unwrap();
        let err = registry
            .open(1, Arc::new(RecordingChannel::default()))
            .unwrap_err();
        assert_eq!(err.reply_code, ReplyCode::ChannelError);
        assert_eq!(err.message, "Channel 1 already exists");
    }

    #[test]
    fn ids_above_the_cap_are_rejected() {
        let registry = ChannelRegistry::new(10);
        let err = registry
            .open(11, Arc::new(RecordingChannel::default()))
            .unwrap_err();
        assert_eq!(err.reply_code, ReplyCode::ChannelError);
        assert_eq!(
            err.message,
            "Channel 11 cannot be created as the max allowed channel id is 10"
        );
    }

    #[test]
    fn awaiting_close_ok_blocks_reuse() {
        let registry = registry();
        registry.open(2, Arc::new(RecordingChannel::default())).unwrap();
        registry.mark_awaiting_close_ok(2);

        assert!(matches!(registry.get(2), ChannelLookup::Closing));
        let err = registry
            .open(2, Arc::new(RecordingChannel::default()))
            .unwrap_err();
        assert_eq!(err.reply_code, ReplyCode::ChannelError);

        assert!(registry.close_ok(2));
        assert!(matches!(registry.get(2), ChannelLookup::Missing));
        registry.open(2, Arc::new(RecordingChannel::default())).unwrap();
    }

    #[test]
    fn block_all_is_idempotent_and_reaches_new_channels() {
        let registry = registry();
        let early = Arc::new(RecordingChannel::default());
        registry.open(1, early.clone()).unwrap();

        assert!(registry.block_all());
        assert!(!registry.block_all());
        assert!(early.blocked.load(Ordering::SeqCst));

        // a channel opened while blocked starts blocked
        let late = Arc::new(RecordingChannel::default());
        registry.open(2, late.clone()).unwrap();
        assert!(late.blocked.load(Ordering::SeqCst));

        assert!(registry.unblock_all());
        assert!(!early.blocked.load(Ordering::SeqCst));
        assert!(!late.blocked.load(Ordering::SeqCst));
    }

    #[test]
    fn stale_closing_detection() {
        let registry = registry();
        registry.open(3, Arc::new(RecordingChannel::default())).unwrap();
        registry.mark_awaiting_close_ok(3);
        assert!(!registry.has_stale_closing(Duration::from_secs(10)));
        assert!(registry.has_stale_closing(Duration::ZERO));
    }
}
