//! One torrent download from start to finish.
//!
//! The session wires the components together: storage is prepared and
//! scanned for resumable pieces, then the scheduler, swarm supervisor, and
//! tracker announce loop run as tasks until the download completes, a fatal
//! error surfaces, or the caller interrupts. Shutdown is cooperative with a
//! five-second grace budget.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tokio::sync::{mpsc, watch};

use crate::config::Config;
use crate::metainfo::Metainfo;
use crate::peer::{PeerEvent, PeerId};
use crate::scheduler::{Scheduler, SchedulerMsg, TransferStats};
use crate::storage::{FileStore, StorageError};
use crate::swarm::{bind_listener, Swarm};
use crate::tracker::{AnnounceRequest, TrackerError, TrackerEvent, TrackerSet};

/// Grace budget for shutdown work (flushes and the `stopped` announce).
const SHUTDOWN_BUDGET: Duration = Duration::from_secs(5);
/// Wait between announce rounds when every tracker errored but some may
/// recover.
const ANNOUNCE_RETRY_SECS: u64 = 30;

/// Terminal session outcomes that are not a finished download.
#[derive(Debug, Error)]
pub enum SessionError {
    #[error("storage failure: {0}")]
    Storage(#[from] StorageError),

    #[error("no peers obtainable: trackers exhausted")]
    NoPeers,

    #[error("interrupted")]
    Interrupted,
}

/// A running download for a single torrent.
pub struct Session {
    config: Config,
    meta: Arc<Metainfo>,
}

impl Session {
    pub fn new(config: Config, meta: Metainfo) -> Self {
        Self {
            config,
            meta: Arc::new(meta),
        }
    }

    /// Drives the download to completion.
    ///
    /// Returns `Ok(())` when every piece is verified on disk (including the
    /// degenerate resume where the scan already proves completion).
    pub async fn run(self) -> Result<(), SessionError> {
        let meta = self.meta.clone();
        let our_id = PeerId::generate();

        let store = Arc::new(FileStore::new(self.config.dest_dir.clone(), meta.clone())?);
        store.preallocate().await?;

        tracing::info!(name = %meta.name, "verifying existing data");
        let resumed = store.scan_resume().await?;
        tracing::info!(
            have = resumed.count_ones(),
            total = meta.piece_count(),
            "resume scan finished"
        );

        let listener = bind_listener(self.config.listen_port)
            .await
            .map_err(StorageError::Io)?;
        let listen_port = listener.local_addr().map_err(StorageError::Io)?.port();

        // Channel plumbing between the tasks.
        let (msg_tx, msg_rx) = mpsc::channel::<SchedulerMsg>(256);
        let (peer_tx, mut peer_rx) = mpsc::channel::<PeerEvent>(256);
        let (candidates_tx, candidates_rx) = mpsc::channel(16);
        let (fatal_tx, mut fatal_rx) = mpsc::channel::<StorageError>(1);
        let (exhausted_tx, mut exhausted_rx) = mpsc::channel::<()>(1);
        let (bitfield_tx, bitfield_rx) = watch::channel(resumed.clone());
        let (done_tx, mut done_rx) = watch::channel(false);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let stats = Arc::new(TransferStats::default());
        let active_count = Arc::new(AtomicUsize::new(0));

        let scheduler = Scheduler::new(
            meta.clone(),
            store.clone(),
            resumed,
            stats.clone(),
            msg_rx,
            msg_tx.clone(),
            bitfield_tx,
            done_tx,
            fatal_tx,
            shutdown_rx.clone(),
        );
        tokio::spawn(scheduler.run());

        // Peer events fold into the scheduler's single inbox.
        let sched_tx = msg_tx.clone();
        tokio::spawn(async move {
            while let Some(event) = peer_rx.recv().await {
                if sched_tx.send(SchedulerMsg::Peer(event)).await.is_err() {
                    break;
                }
            }
        });

        let swarm = Swarm::new(
            meta.clone(),
            our_id,
            self.config.max_peers,
            listener,
            bitfield_rx,
            peer_tx,
            candidates_rx,
            active_count.clone(),
            shutdown_rx.clone(),
        );
        tokio::spawn(swarm.run());

        let announcer = tokio::spawn(announce_loop(
            TrackerSet::new(meta.tracker_tiers()),
            AnnounceBase {
                meta: meta.clone(),
                our_id,
                port: listen_port,
                numwant: self.config.numwant,
            },
            stats.clone(),
            done_rx.clone(),
            candidates_tx,
            exhausted_tx,
            shutdown_rx,
        ));

        // Wait for a terminal condition.
        let outcome = loop {
            tokio::select! {
                _ = done_rx.changed() => {
                    if *done_rx.borrow() {
                        break Ok(());
                    }
                }

                Some(error) = fatal_rx.recv() => {
                    break Err(SessionError::Storage(error));
                }

                Some(()) = exhausted_rx.recv() => {
                    // Tracker exhaustion only kills the session when there
                    // is nobody left to download from.
                    if active_count.load(Ordering::Relaxed) == 0 {
                        break Err(SessionError::NoPeers);
                    }
                }

                _ = tokio::signal::ctrl_c() => {
                    break Err(SessionError::Interrupted);
                }
            }
        };

        let _ = shutdown_tx.send(true);
        let _ = tokio::time::timeout(SHUTDOWN_BUDGET, announcer).await;
        // Downloaded data must be durable before the outcome is reported.
        store.sync().await;

        outcome
    }
}

struct AnnounceBase {
    meta: Arc<Metainfo>,
    our_id: PeerId,
    port: u16,
    numwant: u32,
}

impl AnnounceBase {
    fn request(&self, stats: &TransferStats, event: TrackerEvent) -> AnnounceRequest {
        let (uploaded, downloaded, left) = stats.snapshot();
        AnnounceRequest {
            info_hash: self.meta.info_hash,
            peer_id: self.our_id,
            port: self.port,
            uploaded,
            downloaded,
            left,
            event,
            numwant: self.numwant,
        }
    }
}

/// Periodic announces: `started` first, re-announce at the tracker's
/// interval, `completed` exactly once when the last piece lands, and
/// `stopped` on the way out.
async fn announce_loop(
    mut trackers: TrackerSet,
    base: AnnounceBase,
    stats: Arc<TransferStats>,
    mut done_rx: watch::Receiver<bool>,
    candidates_tx: mpsc::Sender<Vec<std::net::SocketAddr>>,
    exhausted_tx: mpsc::Sender<()>,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut event = TrackerEvent::Started;
    let mut completed_sent = false;

    loop {
        let wait_secs = match trackers.announce(&base.request(&stats, event)).await {
            Ok(response) => {
                tracing::debug!(
                    peers = response.peers.len(),
                    interval = response.interval,
                    "announce ok"
                );
                if event == TrackerEvent::Completed {
                    completed_sent = true;
                }
                event = TrackerEvent::None;
                let reannounce_secs = u64::from(response.reannounce_secs().max(1));
                if !response.peers.is_empty() {
                    let _ = candidates_tx.send(response.peers).await;
                }
                reannounce_secs
            }
            Err(TrackerError::AllExhausted) => {
                let _ = exhausted_tx.try_send(());
                if !trackers.has_live_trackers() {
                    // Nothing will ever answer again; idle until shutdown.
                    let _ = shutdown.changed().await;
                    return;
                }
                ANNOUNCE_RETRY_SECS
            }
            Err(e) => {
                tracing::debug!(error = %e, "announce failed");
                ANNOUNCE_RETRY_SECS
            }
        };

        // A freshly-finished download announces `completed` right away; a
        // failed `completed` attempt retries on the normal wait instead.
        if !completed_sent && event != TrackerEvent::Completed && *done_rx.borrow() {
            event = TrackerEvent::Completed;
            continue;
        }

        tokio::select! {
            _ = shutdown.changed() => {
                let farewell = async {
                    if !completed_sent && *done_rx.borrow() {
                        let _ = trackers
                            .announce(&base.request(&stats, TrackerEvent::Completed))
                            .await;
                    }
                    let _ = trackers
                        .announce(&base.request(&stats, TrackerEvent::Stopped))
                        .await;
                };
                let _ = tokio::time::timeout(SHUTDOWN_BUDGET, farewell).await;
                return;
            }

            changed = done_rx.changed(), if !completed_sent => {
                if changed.is_ok() && *done_rx.borrow() {
                    event = TrackerEvent::Completed;
                }
            }

            _ = tokio::time::sleep(Duration::from_secs(wait_secs)) => {}
        }
    }
}
