//! Choke scheduler
//!
//! Periodically re-evaluates which interested neighbours may download
//! from us. Every unchoking interval the top `preferred_count`
//! neighbours by download speed are unchoked and the rest choked; on a
//! longer interval one additional choked-and-interested neighbour is
//! unchoked optimistically so newcomers get a chance to prove their
//! speed. Decisions reach the connection handlers through their
//! transition queues; the scheduler never touches a socket.

use std::sync::Arc;
use std::time::Duration;

use rand::seq::SliceRandom;
use rand::Rng;
use tracing::{debug, info, trace};

use crate::peer::machine::ProtocolState;
use crate::peer::registry::{NeighbourRegistry, NeighbourSummary};
use crate::peer::state::CooperativeState;
use crate::peer::PeerId;

/// One scheduler decision for one neighbour
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChokeDecision {
    pub peer_id: PeerId,
    pub choke: bool,
}

/// Interested neighbours ranked by download speed, fastest first
///
/// Shut-down records never rank. Ties are broken randomly so equal-speed
/// neighbours rotate through the preferred set instead of starving.
pub fn rank_by_speed<T: Rng>(summaries: &[NeighbourSummary], rng: &mut T) -> Vec<PeerId> {
    let mut ranked: Vec<&NeighbourSummary> = summaries
        .iter()
        .filter(|s| s.state.is_interested() && !s.state.is_shutdown())
        .collect();
    ranked.shuffle(rng);
    ranked.sort_by(|a, b| {
        b.download_speed
            .partial_cmp(&a.download_speed)
            .unwrap_or(std::cmp::Ordering::Equal)
    });
    ranked.iter().map(|s| s.peer_id).collect()
}

/// Plan one unchoking round
///
/// The desired unchoked set is the fastest `preferred_count` interested
/// neighbours plus the optimistic pick, if any. Only neighbours whose
/// current state disagrees with the plan get a decision; handlers that
/// already match stay untouched and no redundant frames go out.
pub fn plan_round<T: Rng>(
    summaries: &[NeighbourSummary],
    preferred_count: usize,
    optimistic: Option<PeerId>,
    rng: &mut T,
) -> Vec<ChokeDecision> {
    let preferred: Vec<PeerId> = rank_by_speed(summaries, rng)
        .into_iter()
        .take(preferred_count)
        .collect();

    let mut decisions = Vec::new();
    for summary in summaries {
        if summary.state.is_shutdown() || !summary.state.is_interested() {
            continue;
        }
        let want_unchoked =
            preferred.contains(&summary.peer_id) || optimistic == Some(summary.peer_id);
        let is_unchoked = summary.state == CooperativeState::UnchokedAndInterested;
        if want_unchoked != is_unchoked {
            decisions.push(ChokeDecision {
                peer_id: summary.peer_id,
                choke: !want_unchoked,
            });
        }
    }
    decisions
}

/// Pick the optimistic unchoke candidate
///
/// A uniform random choice among choked-and-interested neighbours. The
/// previous optimistic pick is excluded so the slot actually rotates.
pub fn pick_optimistic<T: Rng>(
    summaries: &[NeighbourSummary],
    previous: Option<PeerId>,
    rng: &mut T,
) -> Option<PeerId> {
    let candidates: Vec<PeerId> = summaries
        .iter()
        .filter(|s| s.state == CooperativeState::ChokedAndInterested && Some(s.peer_id) != previous)
        .map(|s| s.peer_id)
        .collect();
    candidates.choose(rng).copied()
}

/// Periodic choke/unchoke driver
pub struct ChokeScheduler {
    registry: Arc<NeighbourRegistry>,
    preferred_count: usize,
    unchoke_interval: Duration,
    optimistic_interval: Duration,
    optimistic_peer: Option<PeerId>,
}

impl ChokeScheduler {
    pub fn new(
        registry: Arc<NeighbourRegistry>,
        preferred_count: usize,
        unchoke_interval: Duration,
        optimistic_interval: Duration,
    ) -> Self {
        Self {
            registry,
            preferred_count,
            unchoke_interval,
            optimistic_interval,
            optimistic_peer: None,
        }
    }

    /// Run both timers until the session shuts the task down
    pub async fn run(mut self) {
        info!(
            "Choke scheduler started ({} preferred, every {:?}, optimistic every {:?})",
            self.preferred_count, self.unchoke_interval, self.optimistic_interval
        );
        let mut unchoke_tick = tokio::time::interval(self.unchoke_interval);
        let mut optimistic_tick = tokio::time::interval(self.optimistic_interval);
        // First tick of a tokio interval fires immediately; skip it so
        // neighbours get a chance to declare interest first
        unchoke_tick.tick().await;
        optimistic_tick.tick().await;

        loop {
            tokio::select! {
                _ = unchoke_tick.tick() => self.unchoke_round().await,
                _ = optimistic_tick.tick() => self.optimistic_round().await,
            }
        }
    }

    /// One regular round: re-rank and issue the changed decisions
    async fn unchoke_round(&mut self) {
        let summaries = self.registry.summaries().await;

        // An optimistic pick that shut down or lost interest frees the slot
        if let Some(peer_id) = self.optimistic_peer {
            let still_eligible = summaries
                .iter()
                .any(|s| s.peer_id == peer_id && s.state.is_interested() && !s.state.is_shutdown());
            if !still_eligible {
                debug!("Optimistic slot for peer {} released", peer_id);
                self.optimistic_peer = None;
            }
        }

        let decisions = {
            let mut rng = rand::thread_rng();
            plan_round(&summaries, self.preferred_count, self.optimistic_peer, &mut rng)
        };
        trace!("Unchoke round: {} decisions", decisions.len());
        self.issue(decisions).await;
    }

    /// One optimistic round: rotate the extra unchoke slot
    async fn optimistic_round(&mut self) {
        let summaries = self.registry.summaries().await;
        let pick = {
            let mut rng = rand::thread_rng();
            pick_optimistic(&summaries, self.optimistic_peer, &mut rng)
        };
        let Some(peer_id) = pick else {
            return;
        };
        info!("Optimistically unchoking peer {}", peer_id);
        self.optimistic_peer = Some(peer_id);
        self.issue(vec![ChokeDecision { peer_id, choke: false }]).await;
    }

    async fn issue(&self, decisions: Vec<ChokeDecision>) {
        for decision in decisions {
            debug!(
                "Scheduler {} peer {}",
                if decision.choke { "chokes" } else { "unchokes" },
                decision.peer_id
            );
            self.registry
                .force_transition(
                    decision.peer_id,
                    ProtocolState::SendChokeOrUnchoke { choke: decision.choke },
                )
                .await;
        }
    }
}
