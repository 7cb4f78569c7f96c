//! Least-used peer selection over the overlay bins.
//!
//! The [`LoadBalancer`] hands out each overlay bin with its peers
//! sorted ascending by use count. Callers signal actual dispatch with
//! [`LoadedPeer::add_use_count`]; only that moves a peer back in the
//! queue. A listener task tracks the overlay event stream to seed
//! counters for newly connected peers and drop counters for removed
//! ones.

use std::sync::Arc;

use tokio::task::JoinHandle;
use tracing::debug;
use waggle_overlay::{Overlay, OverlayError, PeerAddr, TopologyEvent};
use waggle_primitives::{OverlayAddress, MAX_PO};
use waggle_stats::UseStats;
use waggle_tasks::{spawn_named, Shutdown};

/// How a newly connected peer's counter is seeded.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum InitCountPolicy {
    /// Count of the least-used other peer in the same bin, else 0.
    #[default]
    LeastUsedInBin,
    /// Count of the nearest other live peer by po, else 0.
    NearestNeighbour,
}

/// One peer plus its use counter.
pub struct LoadedPeer {
    peer: PeerAddr,
    count: u64,
    stats: Arc<UseStats<OverlayAddress>>,
}

impl LoadedPeer {
    pub fn peer(&self) -> &PeerAddr {
        &self.peer
    }

    /// Count at the time the bin was produced.
    pub fn use_count(&self) -> u64 {
        self.count
    }

    /// Records that work was actually dispatched to this peer. Call
    /// exactly once per dispatch.
    pub fn add_use_count(&self) {
        self.stats.add_use(&self.peer.overlay);
    }
}

/// One bin, peers least-used first.
pub struct LoadedBin {
    pub po: u8,
    pub peers: Vec<LoadedPeer>,
}

/// Balances work across live peers, least-used first.
pub struct LoadBalancer {
    overlay: Arc<Overlay>,
    stats: Arc<UseStats<OverlayAddress>>,
    quit: Shutdown,
    listener: JoinHandle<()>,
}

impl LoadBalancer {
    /// Subscribes to the overlay's event stream and spawns the
    /// listener for the balancer's lifetime. `shutdown` stops the
    /// listener too; [`Self::stop`] only stops this balancer.
    pub fn new(overlay: Arc<Overlay>, policy: InitCountPolicy, shutdown: Shutdown) -> Self {
        let stats = Arc::new(UseStats::new(shutdown.clone()));
        let quit = Shutdown::new();

        let listener = {
            let overlay = Arc::clone(&overlay);
            let stats = Arc::clone(&stats);
            let quit = quit.clone();
            let mut events = overlay.subscribe_peer_changes();
            spawn_named("balancer-listener", async move {
                loop {
                    tokio::select! {
                        () = quit.cancelled() => break,
                        () = shutdown.cancelled() => break,
                        maybe = events.recv() => match maybe {
                            Some(TopologyEvent::PeerAdded { peer, po }) => {
                                let count = match policy {
                                    InitCountPolicy::LeastUsedInBin => {
                                        least_used_in_bin(&overlay, &stats, po, &peer.overlay)
                                    }
                                    InitCountPolicy::NearestNeighbour => {
                                        nearest_neighbour_count(&overlay, &stats, &peer.overlay)
                                    }
                                };
                                debug!(peer = %peer, count, "seeding use counter");
                                stats.init(peer.overlay, count);
                            }
                            Some(TopologyEvent::PeerRemoved { peer }) => {
                                stats.remove(&peer.overlay);
                            }
                            Some(TopologyEvent::DepthChanged { .. }) => {}
                            None => break,
                        },
                    }
                }
                events.unsubscribe();
            })
        };

        Self {
            overlay,
            stats,
            quit,
            listener,
        }
    }

    /// Bins nearest `base` first, peers inside each bin least-used
    /// first. `f` returns `false` to stop.
    pub fn each_bin_desc<F>(&self, base: &OverlayAddress, mut f: F)
    where
        F: FnMut(LoadedBin) -> bool,
    {
        self.overlay
            .each_bin(base, 0, |po, peers| f(self.loaded_bin(po, peers)));
    }

    /// [`Self::each_bin_desc`] restricted to one capability index.
    pub fn each_bin_filtered<F>(
        &self,
        base: &OverlayAddress,
        cap_key: &str,
        mut f: F,
    ) -> Result<(), OverlayError>
    where
        F: FnMut(LoadedBin) -> bool,
    {
        self.overlay
            .each_bin_filtered(cap_key, base, 0, |po, peers| f(self.loaded_bin(po, peers)))
    }

    /// [`Self::each_bin_desc`] from the local base address.
    pub fn each_bin_node_address<F>(&self, f: F)
    where
        F: FnMut(LoadedBin) -> bool,
    {
        let base = *self.overlay.base();
        self.each_bin_desc(&base, f);
    }

    /// Counter access, mainly to synchronize tests on
    /// [`UseStats::wait_key`].
    pub fn stats(&self) -> &Arc<UseStats<OverlayAddress>> {
        &self.stats
    }

    /// Stops the listener and detaches from the overlay stream.
    pub fn stop(&self) {
        self.quit.cancel();
        self.listener.abort();
    }

    fn loaded_bin(&self, po: u8, peers: &[PeerAddr]) -> LoadedBin {
        let mut peers: Vec<PeerAddr> = peers.to_vec();
        self.stats.sort_by_use(&mut peers, |peer| peer.overlay);
        let peers = peers
            .into_iter()
            .map(|peer| LoadedPeer {
                count: self.stats.get(&peer.overlay),
                peer,
                stats: Arc::clone(&self.stats),
            })
            .collect();
        LoadedBin { po, peers }
    }
}

fn least_used_in_bin(
    overlay: &Overlay,
    stats: &UseStats<OverlayAddress>,
    po: u8,
    exclude: &OverlayAddress,
) -> u64 {
    let base = *overlay.base();
    let mut least: Option<u64> = None;
    overlay.each_bin(&base, po, |bin_po, peers| {
        if bin_po != po {
            return true;
        }
        least = peers
            .iter()
            .filter(|peer| peer.overlay != *exclude)
            .map(|peer| stats.get(&peer.overlay))
            .min();
        false
    });
    least.unwrap_or(0)
}

fn nearest_neighbour_count(
    overlay: &Overlay,
    stats: &UseStats<OverlayAddress>,
    exclude: &OverlayAddress,
) -> u64 {
    // pivot on the newcomer: the first other peer is its nearest
    let mut count = 0;
    overlay.each_conn(exclude, MAX_PO, |peer, _| {
        if peer.overlay == *exclude {
            return true;
        }
        count = stats.get(&peer.overlay);
        false
    });
    count
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use waggle_capability::CapabilitySet;
    use waggle_overlay::OverlayConfig;

    use super::*;

    fn peer_at(base: &OverlayAddress, po: u8) -> PeerAddr {
        let mut rng = rand::rng();
        let overlay = OverlayAddress::random_at(&mut rng, base, po);
        PeerAddr::new(overlay, overlay.to_vec(), CapabilitySet::new())
    }

    fn new_overlay(shutdown: &Shutdown) -> Arc<Overlay> {
        let mut rng = rand::rng();
        Arc::new(Overlay::new(
            OverlayAddress::random(&mut rng),
            OverlayConfig::default(),
            shutdown.clone(),
        ))
    }

    async fn connect(balancer: &LoadBalancer, overlay: &Overlay, peer: PeerAddr) {
        overlay.on(peer.clone());
        // the listener seeds the counter asynchronously
        tokio::time::timeout(
            Duration::from_secs(1),
            balancer.stats().wait_key(&peer.overlay),
        )
        .await
        .unwrap();
    }

    #[tokio::test]
    async fn rotates_through_least_used_peers() {
        let shutdown = Shutdown::new();
        let overlay = new_overlay(&shutdown);
        let balancer = LoadBalancer::new(
            Arc::clone(&overlay),
            InitCountPolicy::LeastUsedInBin,
            shutdown.clone(),
        );
        let base = *overlay.base();
        for _ in 0..3 {
            connect(&balancer, &overlay, peer_at(&base, 4)).await;
        }

        // always use the first peer of the single bin
        for _ in 0..6 {
            balancer.each_bin_node_address(|bin| {
                bin.peers.first().unwrap().add_use_count();
                false
            });
        }
        let counts: Vec<u64> = balancer.stats().dump().values().copied().collect();
        assert_eq!(counts, vec![2, 2, 2]);
    }

    #[tokio::test]
    async fn new_peer_inherits_the_least_used_count_in_its_bin() {
        let shutdown = Shutdown::new();
        let overlay = new_overlay(&shutdown);
        let balancer = LoadBalancer::new(
            Arc::clone(&overlay),
            InitCountPolicy::LeastUsedInBin,
            shutdown.clone(),
        );
        let base = *overlay.base();

        let veteran = peer_at(&base, 4);
        connect(&balancer, &overlay, veteran.clone()).await;
        for _ in 0..5 {
            balancer.stats().add_use(&veteran.overlay);
        }

        let newcomer = peer_at(&base, 4);
        connect(&balancer, &overlay, newcomer.clone()).await;
        assert_eq!(balancer.stats().get(&newcomer.overlay), 5);

        // a peer opening an empty bin starts from zero
        let lonely = peer_at(&base, 1);
        connect(&balancer, &overlay, lonely.clone()).await;
        assert_eq!(balancer.stats().get(&lonely.overlay), 0);
    }

    #[tokio::test]
    async fn nearest_neighbour_policy_copies_the_closest_count() {
        let shutdown = Shutdown::new();
        let overlay = new_overlay(&shutdown);
        let balancer = LoadBalancer::new(
            Arc::clone(&overlay),
            InitCountPolicy::NearestNeighbour,
            shutdown.clone(),
        );
        let base = *overlay.base();

        let far = peer_at(&base, 1);
        connect(&balancer, &overlay, far.clone()).await;
        for _ in 0..3 {
            balancer.stats().add_use(&far.overlay);
        }
        // `near` itself was seeded with `far`'s count 3, then used 7 times
        let near = peer_at(&base, 6);
        connect(&balancer, &overlay, near.clone()).await;
        assert_eq!(balancer.stats().get(&near.overlay), 3);
        for _ in 0..7 {
            balancer.stats().add_use(&near.overlay);
        }

        // po 4: the nearest existing peer is the one at po 6
        let newcomer = peer_at(&base, 4);
        connect(&balancer, &overlay, newcomer.clone()).await;
        assert_eq!(balancer.stats().get(&newcomer.overlay), 10);
    }

    #[tokio::test]
    async fn nearest_neighbour_is_measured_from_the_newcomer() {
        let shutdown = Shutdown::new();
        let overlay = new_overlay(&shutdown);
        let balancer = LoadBalancer::new(
            Arc::clone(&overlay),
            InitCountPolicy::NearestNeighbour,
            shutdown.clone(),
        );
        let base = *overlay.base();
        let mut rng = rand::rng();

        let busy = peer_at(&base, 6);
        connect(&balancer, &overlay, busy.clone()).await;

        // the sibling shares 200 bits with the newcomer but sits in a
        // shallow bin relative to the base
        let newcomer = peer_at(&base, 2);
        let sibling_overlay = OverlayAddress::random_at(&mut rng, &newcomer.overlay, 200);
        let sibling = PeerAddr::new(
            sibling_overlay,
            sibling_overlay.to_vec(),
            CapabilitySet::new(),
        );
        connect(&balancer, &overlay, sibling.clone()).await;
        for _ in 0..3 {
            balancer.stats().add_use(&sibling.overlay);
        }
        for _ in 0..9 {
            balancer.stats().add_use(&busy.overlay);
        }

        // inherits from the sibling, not from the peer nearest the base
        connect(&balancer, &overlay, newcomer.clone()).await;
        assert_eq!(balancer.stats().get(&newcomer.overlay), 3);
    }

    #[tokio::test]
    async fn removed_peers_drop_their_counters() {
        let shutdown = Shutdown::new();
        let overlay = new_overlay(&shutdown);
        let balancer = LoadBalancer::new(
            Arc::clone(&overlay),
            InitCountPolicy::LeastUsedInBin,
            shutdown.clone(),
        );
        let base = *overlay.base();

        let peer = peer_at(&base, 3);
        connect(&balancer, &overlay, peer.clone()).await;
        balancer.stats().add_use(&peer.overlay);
        assert_eq!(balancer.stats().len(), 1);

        overlay.off(&peer.overlay);
        for _ in 0..100 {
            if balancer.stats().is_empty() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(balancer.stats().is_empty());
    }

    #[tokio::test]
    async fn bins_come_out_sorted_by_use() {
        let shutdown = Shutdown::new();
        let overlay = new_overlay(&shutdown);
        let balancer = LoadBalancer::new(
            Arc::clone(&overlay),
            InitCountPolicy::LeastUsedInBin,
            shutdown.clone(),
        );
        let base = *overlay.base();

        let a = peer_at(&base, 4);
        let b = peer_at(&base, 4);
        connect(&balancer, &overlay, a.clone()).await;
        connect(&balancer, &overlay, b.clone()).await;
        balancer.stats().add_use(&a.overlay);
        balancer.stats().add_use(&a.overlay);

        balancer.each_bin_node_address(|bin| {
            let order: Vec<OverlayAddress> =
                bin.peers.iter().map(|p| p.peer().overlay).collect();
            assert_eq!(order, vec![b.overlay, a.overlay]);
            assert_eq!(bin.peers.first().unwrap().use_count(), 0);
            false
        });
        balancer.stop();
    }
}
