//! Suggest-and-dial loop, gossip dispatch and peer persistence.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, trace, warn};
use waggle_overlay::{Overlay, PeerAddr};
use waggle_primitives::{OverlayAddress, MAX_PO};
use waggle_store::{StateStore, StoreError};
use waggle_tasks::{spawn_named, Shutdown};

use crate::message::HiveMessage;
use crate::{Dialer, HiveError, PeerSender};

/// Hive tuning knobs.
#[derive(Debug, Clone)]
pub struct HiveConfig {
    /// Tick of the suggest-and-dial loop.
    pub keep_alive_interval: Duration,
    /// Whether to gossip depth and peer lists at all.
    pub discovery: bool,
    /// Disables the dial loop; gossip and persistence still run.
    pub disable_auto_connect: bool,
    /// Store bucket for every known address.
    pub peers_bucket: String,
    /// Store bucket for the addresses that were live at shutdown.
    pub conns_bucket: String,
}

impl Default for HiveConfig {
    fn default() -> Self {
        Self {
            keep_alive_interval: Duration::from_millis(500),
            discovery: true,
            disable_auto_connect: false,
            peers_bucket: "peers".to_owned(),
            conns_bucket: "conns".to_owned(),
        }
    }
}

impl HiveConfig {
    pub fn with_keep_alive_interval(mut self, keep_alive_interval: Duration) -> Self {
        self.keep_alive_interval = keep_alive_interval;
        self
    }

    pub fn with_discovery(mut self, discovery: bool) -> Self {
        self.discovery = discovery;
        self
    }

    pub fn with_disable_auto_connect(mut self, disable_auto_connect: bool) -> Self {
        self.disable_auto_connect = disable_auto_connect;
        self
    }
}

/// What the hive remembers about gossip with one live peer.
#[derive(Default)]
struct GossipState {
    /// The peer's last declared neighbourhood depth.
    depth: u8,
    /// Whether the initial peer dump was already sent.
    sent_peers: bool,
    /// Addresses this peer already knows; never gossiped back.
    seen: HashSet<OverlayAddress>,
}

/// Connectivity manager over an [`Overlay`].
pub struct Hive<D, P, S> {
    config: HiveConfig,
    overlay: Arc<Overlay>,
    dialer: D,
    sender: P,
    store: Option<S>,
    shutdown: Shutdown,
    quit: Shutdown,
    gossip: Mutex<HashMap<OverlayAddress, GossipState>>,
    connect_loop: Mutex<Option<JoinHandle<()>>>,
}

impl<D, P, S> Hive<D, P, S>
where
    D: Dialer + Clone,
    P: PeerSender + Clone,
    S: StateStore,
{
    pub fn new(
        overlay: Arc<Overlay>,
        config: HiveConfig,
        dialer: D,
        sender: P,
        store: Option<S>,
        shutdown: Shutdown,
    ) -> Self {
        Self {
            config,
            overlay,
            dialer,
            sender,
            store,
            shutdown,
            quit: Shutdown::new(),
            gossip: Mutex::new(HashMap::new()),
            connect_loop: Mutex::new(None),
        }
    }

    pub fn overlay(&self) -> &Arc<Overlay> {
        &self.overlay
    }

    /// Restores persisted addresses and spawns the dial loop. A store
    /// error other than an absent bucket refuses the start.
    pub fn start(&self) -> Result<(), HiveError> {
        info!(base = %self.overlay.base(), "starting hive");
        if let Some(store) = &self.store {
            self.load_bucket(store, &self.config.peers_bucket)?;
            self.load_bucket(store, &self.config.conns_bucket)?;
        }
        if !self.config.disable_auto_connect {
            *self.connect_loop.lock() = Some(self.spawn_connect_loop());
        }
        Ok(())
    }

    /// Tears the loop down and persists the overlay. Save and close
    /// errors are logged and returned, but teardown always completes.
    pub fn stop(&self) -> Result<(), HiveError> {
        info!(base = %self.overlay.base(), "stopping hive, saving peers");
        self.quit.cancel();
        if let Some(handle) = self.connect_loop.lock().take() {
            handle.abort();
        }
        let mut result = Ok(());
        if let Some(store) = &self.store {
            if let Err(e) = self.save_buckets(store) {
                warn!(error = %e, "failed to save peers");
                result = Err(e);
            }
            if let Err(e) = store.close() {
                warn!(error = %e, "failed to close peer store");
                if result.is_ok() {
                    result = Err(e.into());
                }
            }
        }
        result
    }

    /// Transport callback for an established connection. Moves the
    /// peer into the overlay and, with discovery on, advertises the
    /// depth: to everyone when it moved, otherwise to the new peer
    /// only.
    pub fn connected(&self, peer: PeerAddr) {
        let addr = peer.overlay;
        self.gossip.lock().entry(addr).or_default();
        let (depth, changed) = self.overlay.on(peer);
        if !self.config.discovery {
            return;
        }
        if changed {
            self.notify_depth(depth);
        } else {
            self.sender.send(&addr, HiveMessage::SubPeers { depth });
        }
    }

    /// Transport callback for a dropped connection.
    pub fn disconnected(&self, addr: &OverlayAddress) {
        self.overlay.off(addr);
        self.gossip.lock().remove(addr);
    }

    /// Sends the local depth to every live peer.
    pub fn notify_depth(&self, depth: u8) {
        let base = *self.overlay.base();
        self.overlay.each_conn(&base, MAX_PO, |peer, _| {
            self.sender
                .send(&peer.overlay, HiveMessage::SubPeers { depth });
            true
        });
    }

    /// Dispatches one inbound gossip message from a connected peer.
    pub fn handle_message(
        &self,
        from: &OverlayAddress,
        msg: HiveMessage,
    ) -> Result<(), HiveError> {
        match msg {
            HiveMessage::Peers(peers) => self.handle_peers(from, peers),
            HiveMessage::SubPeers { depth } => self.handle_sub_peers(from, depth),
        }
    }

    /// Marks every advertised address as seen by the sender, then
    /// registers the batch with the overlay.
    fn handle_peers(&self, from: &OverlayAddress, peers: Vec<PeerAddr>) -> Result<(), HiveError> {
        if peers.is_empty() {
            return Ok(());
        }
        debug!(from = %from, count = peers.len(), "received peers");
        {
            let mut gossip = self.gossip.lock();
            let state = gossip.entry(*from).or_default();
            for peer in &peers {
                state.seen.insert(peer.overlay);
            }
        }
        self.overlay.register(peers)?;
        Ok(())
    }

    /// Records the sender's depth. The first announcement earns a one-
    /// time dump of every live peer within the sender's radius that it
    /// has not seen yet.
    fn handle_sub_peers(&self, from: &OverlayAddress, depth: u8) -> Result<(), HiveError> {
        let first_time = {
            let mut gossip = self.gossip.lock();
            let state = gossip.entry(*from).or_default();
            state.depth = depth;
            let first = !state.sent_peers;
            state.sent_peers = true;
            first
        };
        if !first_time {
            return Ok(());
        }

        let mut candidates = Vec::new();
        self.overlay.each_conn(from, MAX_PO, |peer, po| {
            if peer.overlay != *from && po >= depth {
                candidates.push(peer.clone());
            }
            true
        });

        let to_send: Vec<PeerAddr> = {
            let mut gossip = self.gossip.lock();
            let state = gossip.entry(*from).or_default();
            candidates
                .into_iter()
                .filter(|peer| state.seen.insert(peer.overlay))
                .collect()
        };
        if !to_send.is_empty() {
            debug!(to = %from, count = to_send.len(), "sending initial peer dump");
            self.sender.send(from, HiveMessage::Peers(to_send));
        }
        Ok(())
    }

    fn spawn_connect_loop(&self) -> JoinHandle<()> {
        let overlay = Arc::clone(&self.overlay);
        let dialer = self.dialer.clone();
        let sender = self.sender.clone();
        let discovery = self.config.discovery;
        let interval = self.config.keep_alive_interval;
        let quit = self.quit.clone();
        let shutdown = self.shutdown.clone();

        spawn_named("hive-connect", async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        let suggestion = overlay.suggest_peer();
                        if discovery && suggestion.changed {
                            let base = *overlay.base();
                            overlay.each_conn(&base, MAX_PO, |peer, _| {
                                sender.send(
                                    &peer.overlay,
                                    HiveMessage::SubPeers { depth: suggestion.depth },
                                );
                                true
                            });
                        }
                        if let Some(addr) = suggestion.addr {
                            trace!(peer = %addr, "dialing suggested peer");
                            dialer.dial(&addr.underlay);
                        }
                    }
                    () = quit.cancelled() => break,
                    () = shutdown.cancelled() => break,
                }
            }
        })
    }

    fn load_bucket(&self, store: &S, bucket: &str) -> Result<(), HiveError> {
        match store.get::<Vec<PeerAddr>>(bucket) {
            Ok(peers) => {
                info!(bucket, count = peers.len(), "restored persisted peers");
                self.overlay.register(peers)?;
                Ok(())
            }
            Err(StoreError::NotFound) => {
                debug!(bucket, "no persisted peers");
                Ok(())
            }
            Err(e) => Err(e.into()),
        }
    }

    fn save_buckets(&self, store: &S) -> Result<(), HiveError> {
        let base = *self.overlay.base();

        let mut peers = Vec::new();
        self.overlay.each_addr(&base, MAX_PO, |peer, _| {
            peers.push(peer.clone());
            true
        });
        store.put(&self.config.peers_bucket, &peers)?;

        let mut conns = Vec::new();
        self.overlay.each_conn(&base, MAX_PO, |peer, _| {
            conns.push(peer.clone());
            true
        });
        store.put(&self.config.conns_bucket, &conns)?;
        Ok(())
    }
}
