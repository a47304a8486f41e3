//! Swarm supervision: which peers we talk to, and when.
//!
//! The supervisor owns the candidate queue and the active peer set. It
//! drains tracker-supplied addresses into dials, accepts inbound
//! connections on the listen socket, and replaces peers as they die, all
//! within the configured cap. It never looks inside the wire protocol;
//! per-connection work lives in the peer tasks it spawns.

use std::collections::{HashMap, HashSet, VecDeque};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::net::TcpListener;
use tokio::sync::{mpsc, watch};

use crate::metainfo::Metainfo;
use crate::peer::{spawn_peer, Bitfield, PeerEvent, PeerId, PeerSpawnArgs};

/// Failed or closed peers are not redialed for this long.
const REDIAL_COOLDOWN: Duration = Duration::from_secs(600);

pub struct Swarm {
    meta: Arc<Metainfo>,
    our_id: PeerId,
    max_peers: usize,
    listener: TcpListener,
    /// Snapshot source for the bitfield each new connection advertises.
    bitfield_rx: watch::Receiver<Bitfield>,
    /// Peer tasks report protocol events here (forwarded to the scheduler).
    events_tx: mpsc::Sender<PeerEvent>,
    /// Addresses from tracker announces.
    candidates_rx: mpsc::Receiver<Vec<SocketAddr>>,
    /// Published count of live connections, read by the session.
    active_count: Arc<AtomicUsize>,
    shutdown: watch::Receiver<bool>,
}

impl Swarm {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        meta: Arc<Metainfo>,
        our_id: PeerId,
        max_peers: usize,
        listener: TcpListener,
        bitfield_rx: watch::Receiver<Bitfield>,
        events_tx: mpsc::Sender<PeerEvent>,
        candidates_rx: mpsc::Receiver<Vec<SocketAddr>>,
        active_count: Arc<AtomicUsize>,
        shutdown: watch::Receiver<bool>,
    ) -> Self {
        Self {
            meta,
            our_id,
            max_peers,
            listener,
            bitfield_rx,
            events_tx,
            candidates_rx,
            active_count,
            shutdown,
        }
    }

    pub async fn run(mut self) {
        // Peer tasks report their exit here so slots free up.
        let (closed_tx, mut closed_rx) = mpsc::channel::<SocketAddr>(64);

        let mut active: HashSet<SocketAddr> = HashSet::new();
        let mut queue: VecDeque<SocketAddr> = VecDeque::new();
        let mut queued: HashSet<SocketAddr> = HashSet::new();
        let mut cooldown: HashMap<SocketAddr, Instant> = HashMap::new();
        let mut shutdown = self.shutdown.clone();

        loop {
            tokio::select! {
                biased;

                _ = shutdown.changed() => break,

                addrs = self.candidates_rx.recv() => {
                    let Some(addrs) = addrs else { break };
                    let now = Instant::now();
                    for addr in addrs {
                        let cooling = cooldown
                            .get(&addr)
                            .is_some_and(|until| *until > now);
                        if !cooling && !active.contains(&addr) && queued.insert(addr) {
                            queue.push_back(addr);
                        }
                    }
                    self.dial_more(&mut active, &mut queue, &mut queued, &closed_tx);
                }

                closed = closed_rx.recv() => {
                    let Some(addr) = closed else { break };
                    active.remove(&addr);
                    self.active_count.store(active.len(), Ordering::Relaxed);
                    cooldown.insert(addr, Instant::now() + REDIAL_COOLDOWN);
                    self.dial_more(&mut active, &mut queue, &mut queued, &closed_tx);
                }

                accepted = self.listener.accept() => {
                    let Ok((stream, addr)) = accepted else { continue };
                    if active.len() >= self.max_peers || active.contains(&addr) {
                        continue;
                    }
                    tracing::debug!(%addr, "accepting inbound peer");
                    active.insert(addr);
                    self.active_count.store(active.len(), Ordering::Relaxed);
                    spawn_peer(addr, Some(stream), self.spawn_args(&closed_tx));
                }
            }
        }
    }

    fn dial_more(
        &self,
        active: &mut HashSet<SocketAddr>,
        queue: &mut VecDeque<SocketAddr>,
        queued: &mut HashSet<SocketAddr>,
        closed_tx: &mpsc::Sender<SocketAddr>,
    ) {
        while active.len() < self.max_peers {
            let Some(addr) = queue.pop_front() else { break };
            queued.remove(&addr);
            if active.contains(&addr) {
                continue;
            }

            tracing::debug!(%addr, "dialing peer");
            active.insert(addr);
            self.active_count.store(active.len(), Ordering::Relaxed);
            spawn_peer(addr, None, self.spawn_args(closed_tx));
        }
    }

    fn spawn_args(&self, closed_tx: &mpsc::Sender<SocketAddr>) -> PeerSpawnArgs {
        PeerSpawnArgs {
            meta: self.meta.clone(),
            our_id: self.our_id,
            our_bitfield: self.bitfield_rx.borrow().clone(),
            events: self.events_tx.clone(),
            closed: closed_tx.clone(),
            shutdown: self.shutdown.clone(),
        }
    }
}

/// Binds the listen socket, falling through the port range starting at
/// `preferred` (conventionally 6881 through 6889).
pub async fn bind_listener(preferred: u16) -> std::io::Result<TcpListener> {
    let last = preferred.saturating_add(8);
    let mut port = preferred;
    loop {
        match TcpListener::bind(("0.0.0.0", port)).await {
            Ok(listener) => {
                tracing::debug!(port, "listening for inbound peers");
                return Ok(listener);
            }
            Err(e) if port >= last => return Err(e),
            Err(_) => port += 1,
        }
    }
}
