//! The overlay proper: known/live pots, capability indices, depth
//! tracking and dial suggestions.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::time::Instant;

use parking_lot::RwLock;
use tokio::sync::mpsc;
use tracing::{debug, trace};
use waggle_capability::CapabilitySet;
use waggle_primitives::OverlayAddress;
use waggle_pubsub::{PubSub, Subscription};
use waggle_tasks::{spawn_named, Shutdown};

use crate::config::OverlayConfig;
use crate::events::{DepthChange, TopologyEvent};
use crate::peer::PeerAddr;
use crate::OverlayError;

/// Dial-attempt bookkeeping for a known address.
struct KnownEntry {
    addr: PeerAddr,
    retries: u32,
    last_attempt: Option<Instant>,
}

/// Sub-index over peers whose capabilities match a pattern.
struct CapabilityIndex {
    pattern: CapabilitySet,
    known: HashSet<OverlayAddress>,
    live: HashSet<OverlayAddress>,
}

struct Inner {
    known: HashMap<OverlayAddress, KnownEntry>,
    live: HashMap<OverlayAddress, PeerAddr>,
    indices: HashMap<String, CapabilityIndex>,
    /// Depth as of the last emitted depth event.
    reported_depth: u8,
    /// Depth as of the previous `suggest_peer` call.
    suggested_depth: u8,
    depth_subs: Vec<mpsc::UnboundedSender<DepthChange>>,
}

/// Outcome of [`Overlay::suggest_peer`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SuggestedPeer {
    /// Next address to dial, if any bin wants one.
    pub addr: Option<PeerAddr>,
    pub depth: u8,
    /// Depth moved since the previous suggestion.
    pub changed: bool,
}

/// Observable connectivity health. Never gates any operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Health {
    pub knows_peers: bool,
    /// Every bin below depth holds `min_bin_size` live peers or every
    /// known peer at that po.
    pub saturated: bool,
    /// Every known peer at or beyond depth is connected.
    pub nn_connected: bool,
}

impl Health {
    pub fn healthy(&self) -> bool {
        self.knows_peers && self.saturated && self.nn_connected
    }
}

/// Kademlia-style overlay over a fixed base address.
pub struct Overlay {
    base: OverlayAddress,
    config: OverlayConfig,
    inner: RwLock<Inner>,
    events: PubSub<TopologyEvent>,
    event_tx: mpsc::UnboundedSender<TopologyEvent>,
}

impl Overlay {
    /// Spawns the event dispatcher, so this must run inside a tokio
    /// runtime. The dispatcher stops when `shutdown` fires.
    pub fn new(base: OverlayAddress, config: OverlayConfig, shutdown: Shutdown) -> Self {
        let events: PubSub<TopologyEvent> = PubSub::default();
        let (event_tx, mut event_rx) = mpsc::unbounded_channel();

        // Mutators stay synchronous: they queue events here and the
        // dispatcher publishes them one at a time, in mutation order.
        let bus = events.clone();
        spawn_named("overlay-events", async move {
            loop {
                tokio::select! {
                    maybe = event_rx.recv() => match maybe {
                        Some(event) => {
                            bus.publish(event).await;
                        }
                        None => break,
                    },
                    () = shutdown.cancelled() => break,
                }
            }
            bus.close();
        });

        Self {
            base,
            config,
            inner: RwLock::new(Inner {
                known: HashMap::new(),
                live: HashMap::new(),
                indices: HashMap::new(),
                reported_depth: 0,
                suggested_depth: 0,
                depth_subs: Vec::new(),
            }),
            events,
            event_tx,
        }
    }

    pub fn base(&self) -> &OverlayAddress {
        &self.base
    }

    pub fn config(&self) -> &OverlayConfig {
        &self.config
    }

    /// Adds addresses to the known pot and every matching capability
    /// index. Re-registering a known address is a no-op and keeps its
    /// retry bookkeeping. Registering the base address is refused.
    pub fn register<I>(&self, addrs: I) -> Result<(), OverlayError>
    where
        I: IntoIterator<Item = PeerAddr>,
    {
        let mut inner = self.inner.write();
        for addr in addrs {
            if addr.overlay == self.base {
                return Err(OverlayError::SelfRegistration);
            }
            Self::register_locked(&mut inner, addr);
        }
        Ok(())
    }

    fn register_locked(inner: &mut Inner, addr: PeerAddr) {
        if inner.known.contains_key(&addr.overlay) {
            return;
        }
        for index in inner.indices.values_mut() {
            if addr.capabilities.match_all(&index.pattern) {
                index.known.insert(addr.overlay);
            }
        }
        trace!(peer = %addr, "registered address");
        inner.known.insert(
            addr.overlay,
            KnownEntry {
                addr,
                retries: 0,
                last_attempt: None,
            },
        );
    }

    /// Moves a peer into the live pot. Idempotent: a second `on` for a
    /// connected peer reports the current depth and emits nothing.
    /// Emits `PeerAdded` and, when the depth moved, `DepthChanged`.
    pub fn on(&self, peer: PeerAddr) -> (u8, bool) {
        let mut inner = self.inner.write();
        if peer.overlay == self.base || inner.live.contains_key(&peer.overlay) {
            return (inner.reported_depth, false);
        }
        // live peers are always known
        Self::register_locked(&mut inner, peer.clone());
        for index in inner.indices.values_mut() {
            if peer.capabilities.match_all(&index.pattern) {
                index.live.insert(peer.overlay);
            }
        }
        let po = self.base.proximity(&peer.overlay);
        inner.live.insert(peer.overlay, peer.clone());
        debug!(peer = %peer, po, "peer connected");
        let _ = self.event_tx.send(TopologyEvent::PeerAdded { peer, po });
        self.report_depth_locked(&mut inner)
    }

    /// Drops a peer from the live pot, keeping it known. Idempotent.
    /// Emits `PeerRemoved` and possibly `DepthChanged`.
    pub fn off(&self, addr: &OverlayAddress) {
        let mut inner = self.inner.write();
        let Some(peer) = inner.live.remove(addr) else {
            return;
        };
        for index in inner.indices.values_mut() {
            index.live.remove(addr);
        }
        debug!(peer = %peer, "peer disconnected");
        let _ = self.event_tx.send(TopologyEvent::PeerRemoved { peer });
        self.report_depth_locked(&mut inner);
    }

    /// Prunes an address from the known pot entirely, disconnecting it
    /// first when live. Forgetting is always explicit; `off` never does
    /// this.
    pub fn remove(&self, addr: &OverlayAddress) {
        let mut inner = self.inner.write();
        if let Some(peer) = inner.live.remove(addr) {
            for index in inner.indices.values_mut() {
                index.live.remove(addr);
            }
            let _ = self.event_tx.send(TopologyEvent::PeerRemoved { peer });
        }
        inner.known.remove(addr);
        for index in inner.indices.values_mut() {
            index.known.remove(addr);
        }
        self.report_depth_locked(&mut inner);
    }

    /// Picks the next address to dial: the deepest bin with fewer than
    /// `min_bin_size` live peers that holds a known, unconnected
    /// address whose retry backoff has elapsed. Within the bin,
    /// addresses with fewer attempts win, then longer-idle ones.
    /// Returning an address counts as an attempt.
    pub fn suggest_peer(&self) -> SuggestedPeer {
        let mut inner = self.inner.write();
        let now = Instant::now();

        let mut live_at: HashMap<u8, usize> = HashMap::new();
        for addr in inner.live.keys() {
            *live_at.entry(self.base.proximity(addr)).or_insert(0) += 1;
        }

        let mut candidates: BTreeMap<u8, Vec<(u32, Option<Instant>, OverlayAddress)>> =
            BTreeMap::new();
        for (addr, entry) in &inner.known {
            if inner.live.contains_key(addr) || entry.retries >= self.config.max_retries {
                continue;
            }
            let due = match entry.last_attempt {
                None => true,
                Some(at) => now.duration_since(at) >= self.config.backoff(entry.retries),
            };
            if !due {
                continue;
            }
            let po = self.base.proximity(addr);
            if live_at.get(&po).copied().unwrap_or(0) >= self.config.min_bin_size {
                continue;
            }
            candidates
                .entry(po)
                .or_default()
                .push((entry.retries, entry.last_attempt, *addr));
        }

        // deepest unsaturated bin with an eligible candidate
        let picked = candidates.iter_mut().next_back().and_then(|(_, bin)| {
            bin.sort_by(|a, b| a.0.cmp(&b.0).then_with(|| a.1.cmp(&b.1)));
            bin.first().map(|(_, _, addr)| *addr)
        });

        let addr = picked.and_then(|overlay| {
            let entry = inner.known.get_mut(&overlay)?;
            entry.retries += 1;
            entry.last_attempt = Some(now);
            trace!(peer = %entry.addr, retries = entry.retries, "suggesting peer");
            Some(entry.addr.clone())
        });

        // `changed` is relative to the previous suggestion, not to the
        // mutation-driven depth events
        let depth = self.depth_locked(&inner);
        let changed = depth != inner.suggested_depth;
        inner.suggested_depth = depth;
        SuggestedPeer {
            addr,
            depth,
            changed,
        }
    }

    /// Live peers in load-balancing order relative to `pivot`: the
    /// pivot's bin first (nearest the pivot first inside it), then bins
    /// nearer the local base, then farther ones. Peers whose proximity
    /// to the pivot exceeds `max_po` are skipped. `f` returns `false`
    /// to stop. The callback runs on a snapshot, without the overlay
    /// lock.
    pub fn each_conn<F>(&self, pivot: &OverlayAddress, max_po: u8, f: F)
    where
        F: FnMut(&PeerAddr, u8) -> bool,
    {
        let peers: Vec<PeerAddr> = self.inner.read().live.values().cloned().collect();
        self.each_in(peers, pivot, max_po, f);
    }

    /// [`Self::each_conn`] restricted to one capability index.
    pub fn each_conn_filtered<F>(
        &self,
        key: &str,
        pivot: &OverlayAddress,
        max_po: u8,
        f: F,
    ) -> Result<(), OverlayError>
    where
        F: FnMut(&PeerAddr, u8) -> bool,
    {
        let peers = {
            let inner = self.inner.read();
            let index = inner
                .indices
                .get(key)
                .ok_or_else(|| OverlayError::UnknownIndex(key.to_owned()))?;
            index
                .live
                .iter()
                .filter_map(|addr| inner.live.get(addr).cloned())
                .collect()
        };
        self.each_in(peers, pivot, max_po, f);
        Ok(())
    }

    /// Known addresses in the same order as [`Self::each_conn`].
    pub fn each_addr<F>(&self, pivot: &OverlayAddress, max_po: u8, f: F)
    where
        F: FnMut(&PeerAddr, u8) -> bool,
    {
        let peers: Vec<PeerAddr> = self
            .inner
            .read()
            .known
            .values()
            .map(|entry| entry.addr.clone())
            .collect();
        self.each_in(peers, pivot, max_po, f);
    }

    /// [`Self::each_addr`] restricted to one capability index.
    pub fn each_addr_filtered<F>(
        &self,
        key: &str,
        pivot: &OverlayAddress,
        max_po: u8,
        f: F,
    ) -> Result<(), OverlayError>
    where
        F: FnMut(&PeerAddr, u8) -> bool,
    {
        let peers = {
            let inner = self.inner.read();
            let index = inner
                .indices
                .get(key)
                .ok_or_else(|| OverlayError::UnknownIndex(key.to_owned()))?;
            index
                .known
                .iter()
                .filter_map(|addr| inner.known.get(addr).map(|entry| entry.addr.clone()))
                .collect()
        };
        self.each_in(peers, pivot, max_po, f);
        Ok(())
    }

    /// Live bins, whole, in the [`Self::each_conn`] bin order. Bins
    /// below `min_po` relative to the local base are skipped.
    pub fn each_bin<F>(&self, pivot: &OverlayAddress, min_po: u8, mut f: F)
    where
        F: FnMut(u8, &[PeerAddr]) -> bool,
    {
        let peers: Vec<PeerAddr> = self.inner.read().live.values().cloned().collect();
        for (po, bin) in self.ordered_bins(pivot, peers) {
            if po < min_po {
                continue;
            }
            if !f(po, &bin) {
                return;
            }
        }
    }

    /// [`Self::each_bin`] restricted to one capability index.
    pub fn each_bin_filtered<F>(
        &self,
        key: &str,
        pivot: &OverlayAddress,
        min_po: u8,
        mut f: F,
    ) -> Result<(), OverlayError>
    where
        F: FnMut(u8, &[PeerAddr]) -> bool,
    {
        let peers = {
            let inner = self.inner.read();
            let index = inner
                .indices
                .get(key)
                .ok_or_else(|| OverlayError::UnknownIndex(key.to_owned()))?;
            index
                .live
                .iter()
                .filter_map(|addr| inner.live.get(addr).cloned())
                .collect()
        };
        for (po, bin) in self.ordered_bins(pivot, peers) {
            if po < min_po {
                continue;
            }
            if !f(po, &bin) {
                break;
            }
        }
        Ok(())
    }

    fn each_in<F>(&self, peers: Vec<PeerAddr>, pivot: &OverlayAddress, max_po: u8, mut f: F)
    where
        F: FnMut(&PeerAddr, u8) -> bool,
    {
        for (_, bin) in self.ordered_bins(pivot, peers) {
            for peer in &bin {
                let po = pivot.proximity(&peer.overlay);
                if po > max_po {
                    continue;
                }
                if !f(peer, po) {
                    return;
                }
            }
        }
    }

    /// Groups peers into bins by po to the local base and orders the
    /// bins for iteration relative to `pivot`: the pivot's own bin
    /// first, then nearer bins, then farther ones.
    fn ordered_bins(
        &self,
        pivot: &OverlayAddress,
        peers: Vec<PeerAddr>,
    ) -> Vec<(u8, Vec<PeerAddr>)> {
        let mut bins: BTreeMap<u8, Vec<PeerAddr>> = BTreeMap::new();
        for peer in peers {
            bins.entry(self.base.proximity(&peer.overlay))
                .or_default()
                .push(peer);
        }
        let pivot_po = self.base.proximity(pivot);

        let mut ordered = Vec::with_capacity(bins.len());
        if let Some(mut bin) = bins.remove(&pivot_po) {
            bin.sort_by(|a, b| pivot.distance_cmp(&a.overlay, &b.overlay));
            ordered.push((pivot_po, bin));
        }
        let (farther, nearer): (Vec<_>, Vec<_>) =
            bins.into_iter().partition(|(po, _)| *po < pivot_po);
        ordered.extend(nearer);
        ordered.extend(farther.into_iter().rev());
        ordered
    }

    /// Neighbourhood depth: with at most `neighbourhood_size` live
    /// peers it is 0; otherwise walk the bins from 0 upward and stop at
    /// the first empty one, capped at the po of the farthest of the
    /// `neighbourhood_size` nearest peers.
    pub fn neighbourhood_depth(&self) -> u8 {
        self.depth_locked(&self.inner.read())
    }

    fn depth_locked(&self, inner: &Inner) -> u8 {
        let nn = self.config.neighbourhood_size;
        if inner.live.len() <= nn {
            return 0;
        }
        let mut pos: Vec<u8> = inner
            .live
            .keys()
            .map(|addr| self.base.proximity(addr))
            .collect();
        pos.sort_unstable_by(|a, b| b.cmp(a));
        let bound = pos.get(nn.saturating_sub(1)).copied().unwrap_or(0);
        let occupied: HashSet<u8> = pos.into_iter().collect();
        (0..bound)
            .find(|po| !occupied.contains(po))
            .unwrap_or(bound)
    }

    fn report_depth_locked(&self, inner: &mut Inner) -> (u8, bool) {
        let depth = self.depth_locked(inner);
        let old = inner.reported_depth;
        if depth == old {
            return (depth, false);
        }
        inner.reported_depth = depth;
        debug!(old, new = depth, "neighbourhood depth changed");
        let _ = self
            .event_tx
            .send(TopologyEvent::DepthChanged { old, new: depth });
        inner
            .depth_subs
            .retain(|tx| tx.send(DepthChange { old, new: depth }).is_ok());
        (depth, true)
    }

    /// Stream of peer and depth events in mutation order.
    pub fn subscribe_peer_changes(&self) -> Subscription<TopologyEvent> {
        self.events.subscribe()
    }

    /// One message per depth transition, never coalesced. Drain
    /// promptly; the channel is unbounded.
    pub fn subscribe_depth_change(&self) -> mpsc::UnboundedReceiver<DepthChange> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.inner.write().depth_subs.push(tx);
        rx
    }

    /// Adds a capability sub-index and back-fills it from the current
    /// known and live pots.
    pub fn register_capability_index(
        &self,
        key: &str,
        pattern: CapabilitySet,
    ) -> Result<(), OverlayError> {
        let mut inner = self.inner.write();
        if inner.indices.contains_key(key) {
            return Err(OverlayError::DuplicateIndex(key.to_owned()));
        }
        let mut index = CapabilityIndex {
            pattern,
            known: HashSet::new(),
            live: HashSet::new(),
        };
        for (addr, entry) in &inner.known {
            if entry.addr.capabilities.match_all(&index.pattern) {
                index.known.insert(*addr);
            }
        }
        for (addr, peer) in &inner.live {
            if peer.capabilities.match_all(&index.pattern) {
                index.live.insert(*addr);
            }
        }
        inner.indices.insert(key.to_owned(), index);
        Ok(())
    }

    pub fn known_count(&self) -> usize {
        self.inner.read().known.len()
    }

    pub fn live_count(&self) -> usize {
        self.inner.read().live.len()
    }

    /// Connectivity health snapshot, purely observational.
    pub fn health(&self) -> Health {
        let inner = self.inner.read();
        let depth = self.depth_locked(&inner);

        let mut known_at: HashMap<u8, usize> = HashMap::new();
        for addr in inner.known.keys() {
            *known_at.entry(self.base.proximity(addr)).or_insert(0) += 1;
        }
        let mut live_at: HashMap<u8, usize> = HashMap::new();
        for addr in inner.live.keys() {
            *live_at.entry(self.base.proximity(addr)).or_insert(0) += 1;
        }

        let saturated = (0..depth).all(|po| {
            let live = live_at.get(&po).copied().unwrap_or(0);
            let known = known_at.get(&po).copied().unwrap_or(0);
            live >= self.config.min_bin_size || live >= known
        });
        let nn_connected = inner
            .known
            .keys()
            .all(|addr| self.base.proximity(addr) < depth || inner.live.contains_key(addr));

        Health {
            knows_peers: !inner.known.is_empty(),
            saturated,
            nn_connected,
        }
    }

    pub fn healthy(&self) -> bool {
        self.health().healthy()
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use waggle_capability::Capability;
    use waggle_primitives::MAX_PO;

    use super::*;

    fn addr_at(base: &OverlayAddress, po: u8) -> OverlayAddress {
        let mut rng = rand::rng();
        OverlayAddress::random_at(&mut rng, base, po)
    }

    fn peer_at(base: &OverlayAddress, po: u8) -> PeerAddr {
        let overlay = addr_at(base, po);
        PeerAddr::new(overlay, overlay.to_vec(), CapabilitySet::new())
    }

    fn caps(pattern: &[bool]) -> CapabilitySet {
        let mut cap = Capability::new(0, pattern.len());
        for (i, bit) in pattern.iter().enumerate() {
            if *bit {
                cap.set(i).unwrap();
            }
        }
        let mut set = CapabilitySet::new();
        set.add(cap).unwrap();
        set
    }

    fn new_overlay() -> Overlay {
        let mut rng = rand::rng();
        Overlay::new(
            OverlayAddress::random(&mut rng),
            OverlayConfig::default(),
            Shutdown::new(),
        )
    }

    #[tokio::test]
    async fn neighbourhood_depth_over_mutations() {
        let overlay = new_overlay();
        let base = *overlay.base();

        let peers: Vec<PeerAddr> = (0..7).map(|po| peer_at(&base, po)).collect();
        let seven_peers: Vec<PeerAddr> = (0..2).map(|_| peer_at(&base, 7)).collect();

        assert_eq!(overlay.neighbourhood_depth(), 0);

        // up to neighbourhood_size connections the depth stays 0
        overlay.on(seven_peers[0].clone());
        assert_eq!(overlay.neighbourhood_depth(), 0);
        overlay.on(seven_peers[1].clone());
        assert_eq!(overlay.neighbourhood_depth(), 0);

        // filling bins 0..7 moves the depth up one bin at a time
        for (i, peer) in peers.iter().enumerate() {
            overlay.on(peer.clone());
            assert_eq!(overlay.neighbourhood_depth(), i as u8 + 1, "after bin {i}");
        }

        overlay.off(&seven_peers[1].overlay);
        assert_eq!(overlay.neighbourhood_depth(), 6);

        overlay.off(&peers[4].overlay);
        assert_eq!(overlay.neighbourhood_depth(), 4);

        overlay.off(&peers[3].overlay);
        assert_eq!(overlay.neighbourhood_depth(), 3);
    }

    #[tokio::test]
    async fn on_is_idempotent() {
        let overlay = new_overlay();
        let base = *overlay.base();
        let mut events = overlay.subscribe_peer_changes();

        let peer = peer_at(&base, 3);
        overlay.on(peer.clone());
        let (_, changed) = overlay.on(peer.clone());
        assert!(!changed);
        assert_eq!(overlay.live_count(), 1);

        overlay.off(&peer.overlay);
        overlay.off(&peer.overlay);
        assert_eq!(overlay.live_count(), 0);
        assert_eq!(overlay.known_count(), 1);

        // exactly one add and one remove despite the duplicates
        assert_eq!(
            events.recv().await,
            Some(TopologyEvent::PeerAdded { peer: peer.clone(), po: 3 })
        );
        assert_eq!(
            events.recv().await,
            Some(TopologyEvent::PeerRemoved { peer })
        );
    }

    #[tokio::test]
    async fn known_always_contains_live() {
        let overlay = new_overlay();
        let base = *overlay.base();

        // connecting an unregistered peer registers it on the way in
        let peer = peer_at(&base, 2);
        overlay.on(peer.clone());
        assert_eq!(overlay.known_count(), 1);

        overlay.off(&peer.overlay);
        assert_eq!(overlay.known_count(), 1);

        overlay.remove(&peer.overlay);
        assert_eq!(overlay.known_count(), 0);
    }

    #[tokio::test]
    async fn self_registration_is_refused() {
        let overlay = new_overlay();
        let base = *overlay.base();
        let this = PeerAddr::new(base, base.to_vec(), CapabilitySet::new());
        assert_eq!(
            overlay.register([this]),
            Err(OverlayError::SelfRegistration)
        );
    }

    #[tokio::test]
    async fn suggest_prefers_the_deepest_unsaturated_bin() {
        let overlay = new_overlay();
        let base = *overlay.base();

        let shallow = peer_at(&base, 1);
        let deep = peer_at(&base, 5);
        overlay.register([shallow.clone(), deep.clone()]).unwrap();

        let suggested = overlay.suggest_peer();
        assert_eq!(suggested.addr, Some(deep.clone()));

        // the deep address now backs off, so the shallow one is next
        let suggested = overlay.suggest_peer();
        assert_eq!(suggested.addr, Some(shallow));

        // everything is backing off
        assert_eq!(overlay.suggest_peer().addr, None);
    }

    #[tokio::test]
    async fn suggest_skips_saturated_bins() {
        let overlay = new_overlay();
        let base = *overlay.base();

        // bin 4 saturated with min_bin_size live peers
        overlay.on(peer_at(&base, 4));
        overlay.on(peer_at(&base, 4));
        let candidate = peer_at(&base, 4);
        overlay.register([candidate.clone()]).unwrap();
        assert_eq!(overlay.suggest_peer().addr, None);

        // an unsaturated shallower bin still qualifies
        let shallow = peer_at(&base, 0);
        overlay.register([shallow.clone()]).unwrap();
        assert_eq!(overlay.suggest_peer().addr, Some(shallow));
    }

    #[tokio::test]
    async fn suggest_respects_backoff_and_max_retries() {
        let mut rng = rand::rng();
        let base = OverlayAddress::random(&mut rng);
        let config = OverlayConfig::default()
            .with_retry_interval(Duration::from_secs(3600))
            .with_max_retries(1);
        let overlay = Overlay::new(base, config, Shutdown::new());

        let peer = peer_at(&base, 3);
        overlay.register([peer.clone()]).unwrap();

        // never attempted: eligible immediately
        assert_eq!(overlay.suggest_peer().addr, Some(peer));
        // attempted once: backoff not elapsed, and with max_retries 1 never again
        assert_eq!(overlay.suggest_peer().addr, None);
    }

    #[tokio::test]
    async fn suggest_reports_depth_changes() {
        let overlay = new_overlay();
        let base = *overlay.base();

        assert!(!overlay.suggest_peer().changed);

        // the depth grew since the previous suggestion
        let peers: Vec<PeerAddr> = (0..4).map(|po| peer_at(&base, po)).collect();
        for peer in &peers {
            overlay.on(peer.clone());
        }
        let s = overlay.suggest_peer();
        assert_eq!(s.depth, 2);
        assert!(s.changed);
        assert!(!overlay.suggest_peer().changed);

        // a disconnect drops the depth; the next suggestion reports it
        // even though off() already emitted the depth event
        overlay.off(&peers[1].overlay);
        let s = overlay.suggest_peer();
        assert_eq!(s.depth, 1);
        assert!(s.changed);
        assert!(!overlay.suggest_peer().changed);
    }

    #[tokio::test]
    async fn depth_changes_are_not_coalesced() {
        let overlay = new_overlay();
        let base = *overlay.base();
        let mut depths = overlay.subscribe_depth_change();

        for po in 0..5 {
            overlay.on(peer_at(&base, po));
        }
        // three transitions once the live count clears neighbourhood_size
        assert_eq!(depths.recv().await, Some(DepthChange { old: 0, new: 1 }));
        assert_eq!(depths.recv().await, Some(DepthChange { old: 1, new: 2 }));
        assert_eq!(depths.recv().await, Some(DepthChange { old: 2, new: 3 }));
    }

    #[tokio::test]
    async fn capability_index_tracks_membership() {
        let overlay = new_overlay();
        let base = *overlay.base();

        let mut light = peer_at(&base, 1);
        light.capabilities = caps(&[true, false]);
        let mut full = peer_at(&base, 2);
        full.capabilities = caps(&[true, true]);
        let plain = peer_at(&base, 3);

        // same bits as the full node but under a different capability id
        let mut alien = peer_at(&base, 4);
        let mut alien_cap = Capability::new(9, 2);
        alien_cap.set(0).unwrap();
        alien_cap.set(1).unwrap();
        let mut alien_caps = CapabilitySet::new();
        alien_caps.add(alien_cap).unwrap();
        alien.capabilities = alien_caps;

        overlay.register([light.clone(), plain.clone()]).unwrap();
        overlay.on(full.clone());
        overlay.on(alien.clone());

        // back-fill picks up peers registered before the index existed
        overlay
            .register_capability_index("full", caps(&[true, true]))
            .unwrap();
        overlay
            .register_capability_index("light", caps(&[true, false]))
            .unwrap();
        assert_eq!(
            overlay.register_capability_index("full", caps(&[true, true])),
            Err(OverlayError::DuplicateIndex("full".to_owned()))
        );

        let mut seen = Vec::new();
        overlay
            .each_addr_filtered("light", &base, MAX_PO, |peer, _| {
                seen.push(peer.overlay);
                true
            })
            .unwrap();
        // the full node matches the light pattern too; the plain node
        // and the foreign-id one do not
        assert_eq!(seen.len(), 2);
        assert!(seen.contains(&light.overlay));
        assert!(seen.contains(&full.overlay));
        assert!(!seen.contains(&alien.overlay));

        let mut live_seen = Vec::new();
        overlay
            .each_conn_filtered("full", &base, MAX_PO, |peer, _| {
                live_seen.push(peer.overlay);
                true
            })
            .unwrap();
        assert_eq!(live_seen, vec![full.overlay]);

        // membership follows disconnects
        overlay.off(&full.overlay);
        let mut live_seen = Vec::new();
        overlay
            .each_conn_filtered("full", &base, MAX_PO, |peer, _| {
                live_seen.push(peer.overlay);
                true
            })
            .unwrap();
        assert!(live_seen.is_empty());

        assert!(matches!(
            overlay.each_conn_filtered("nope", &base, MAX_PO, |_, _| true),
            Err(OverlayError::UnknownIndex(_))
        ));
    }

    #[tokio::test]
    async fn each_conn_orders_bins_descending_from_self() {
        let overlay = new_overlay();
        let base = *overlay.base();

        for po in [1u8, 3, 5] {
            overlay.on(peer_at(&base, po));
        }
        let mut pos = Vec::new();
        overlay.each_conn(&base, MAX_PO, |_, po| {
            pos.push(po);
            true
        });
        assert_eq!(pos, vec![5, 3, 1]);

        // early stop
        let mut count = 0;
        overlay.each_conn(&base, MAX_PO, |_, _| {
            count += 1;
            false
        });
        assert_eq!(count, 1);

        // max_po excludes nearer peers
        let mut pos = Vec::new();
        overlay.each_conn(&base, 3, |_, po| {
            pos.push(po);
            true
        });
        assert_eq!(pos, vec![3, 1]);
    }

    #[tokio::test]
    async fn each_bin_respects_min_po() {
        let overlay = new_overlay();
        let base = *overlay.base();

        for po in [0u8, 2, 4] {
            overlay.on(peer_at(&base, po));
            overlay.on(peer_at(&base, po));
        }
        let mut bins = Vec::new();
        overlay.each_bin(&base, 2, |po, peers| {
            bins.push((po, peers.len()));
            true
        });
        assert_eq!(bins, vec![(4, 2), (2, 2)]);
    }

    #[tokio::test]
    async fn health_requires_connected_neighbourhood() {
        // mirrors the high-min-bin-size health walk of the original
        for min_bin_size in [3usize, 4, 5] {
            let mut rng = rand::rng();
            let base = OverlayAddress::random(&mut rng);
            let overlay = Overlay::new(
                base,
                OverlayConfig::default().with_min_bin_size(min_bin_size),
                Shutdown::new(),
            );

            overlay.on(peer_at(&base, 0));
            overlay.on(peer_at(&base, 3));
            overlay.on(peer_at(&base, 4));

            let first = peer_at(&base, 1);
            overlay.register([first.clone()]).unwrap();

            for i in 1..min_bin_size {
                overlay.on(peer_at(&base, 1));
                if i == min_bin_size - 1 {
                    overlay.on(first.clone());
                    assert!(overlay.healthy(), "min_bin_size {min_bin_size}");
                } else {
                    assert!(!overlay.healthy(), "min_bin_size {min_bin_size} step {i}");
                }
            }
        }
    }

    #[tokio::test]
    async fn fresh_overlay_is_unhealthy() {
        let overlay = new_overlay();
        let health = overlay.health();
        assert!(!health.knows_peers);
        assert!(!overlay.healthy());
    }
}
