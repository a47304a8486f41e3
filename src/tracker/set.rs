use rand::seq::SliceRandom;

use super::error::TrackerError;
use super::http::HttpTracker;
use super::response::{AnnounceRequest, AnnounceResponse};
use super::udp::UdpTracker;

enum Client {
    Http(HttpTracker),
    Udp(UdpTracker),
}

struct Tracker {
    url: String,
    client: Option<Client>,
    /// Set when the tracker sends a `failure reason` or its URL is
    /// unusable; never contacted again this session.
    dead: bool,
}

/// Tiered tracker list with BEP-12 semantics.
///
/// Tiers are tried in order; within a tier the order is shuffled once at
/// startup and a responding tracker is promoted to the head of its tier.
/// A tracker that rejects an announce is dead for the rest of the session.
///
/// # Examples
///
/// ```no_run
/// use spate::tracker::TrackerSet;
///
/// let tiers = vec![
///     vec!["http://primary.example/announce".to_string()],
///     vec!["udp://backup.example:6969".to_string()],
/// ];
/// let set = TrackerSet::new(tiers);
/// assert!(set.has_live_trackers());
/// ```
pub struct TrackerSet {
    tiers: Vec<Vec<Tracker>>,
}

impl TrackerSet {
    pub fn new(tiers: Vec<Vec<String>>) -> Self {
        let mut rng = rand::rng();
        let tiers = tiers
            .into_iter()
            .map(|tier| {
                let mut tier: Vec<Tracker> = tier
                    .into_iter()
                    .map(|url| Tracker {
                        url,
                        client: None,
                        dead: false,
                    })
                    .collect();
                tier.shuffle(&mut rng);
                tier
            })
            .collect();

        Self { tiers }
    }

    /// `true` while at least one tracker has not been marked dead.
    pub fn has_live_trackers(&self) -> bool {
        self.tiers
            .iter()
            .any(|tier| tier.iter().any(|t| !t.dead))
    }

    /// Announces to the first tracker that responds, walking tiers in
    /// order.
    ///
    /// The responder is promoted to the head of its tier. Returns
    /// [`TrackerError::AllExhausted`] when every tracker is dead or
    /// unreachable.
    pub async fn announce(
        &mut self,
        req: &AnnounceRequest,
    ) -> Result<AnnounceResponse, TrackerError> {
        for tier in self.tiers.iter_mut() {
            for i in 0..tier.len() {
                if tier[i].dead {
                    continue;
                }

                match announce_one(&mut tier[i], req).await {
                    Ok(response) => {
                        tier[..=i].rotate_right(1);
                        return Ok(response);
                    }
                    Err(TrackerError::Rejected(reason)) => {
                        tracing::warn!(url = %tier[i].url, %reason, "tracker rejected announce");
                        tier[i].dead = true;
                    }
                    Err(TrackerError::UnsupportedProtocol(_) | TrackerError::InvalidUrl(_)) => {
                        tier[i].dead = true;
                    }
                    Err(e) => {
                        tracing::debug!(url = %tier[i].url, error = %e, "tracker unreachable");
                        tier[i].client = None;
                    }
                }
            }
        }

        Err(TrackerError::AllExhausted)
    }
}

async fn announce_one(
    tracker: &mut Tracker,
    req: &AnnounceRequest,
) -> Result<AnnounceResponse, TrackerError> {
    let client = match &mut tracker.client {
        Some(client) => client,
        slot => slot.insert(build_client(&tracker.url).await?),
    };

    match client {
        Client::Http(http) => http.announce(req).await,
        Client::Udp(udp) => udp.announce(req).await,
    }
}

async fn build_client(url: &str) -> Result<Client, TrackerError> {
    if url.starts_with("http://") || url.starts_with("https://") {
        Ok(Client::Http(HttpTracker::new(url)?))
    } else if url.starts_with("udp://") {
        Ok(Client::Udp(UdpTracker::connect(url).await?))
    } else {
        Err(TrackerError::UnsupportedProtocol(url.to_string()))
    }
}
