//! Active subscription set
//!
//! Holds the bounded working set of instruments subscribed on the feed.
//! Pinned instruments are always kept (while they resolve); the rest of the
//! capacity is filled by trailing turnover rank and periodically rotated.
//!
//! Rotation only ever reports deltas so the feed is never asked to
//! re-subscribe an instrument that stayed in the set.

use std::cmp::Reverse;
use std::collections::{BTreeMap, BTreeSet, VecDeque};

use rust_decimal::Decimal;
use tracing::{info, warn};
use types::ids::{InstrumentToken, Symbol};

use crate::config::RotationConfig;
use crate::directory::InstrumentDirectory;

/// Resolve pinned symbols to tokens, in symbol order, dropping any the
/// directory does not know.
pub fn resolve_pinned(pinned: &BTreeSet<Symbol>, directory: &InstrumentDirectory) -> Vec<InstrumentToken> {
    let mut seen = BTreeSet::new();
    pinned
        .iter()
        .filter_map(|sym| directory.resolve_token(sym))
        .filter(|token| seen.insert(*token))
        .collect()
}

/// The current subscription set, split into pinned and filler members.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ActiveSet {
    pinned: BTreeSet<InstrumentToken>,
    filler: BTreeSet<InstrumentToken>,
}

impl ActiveSet {
    pub fn contains(&self, token: InstrumentToken) -> bool {
        self.pinned.contains(&token) || self.filler.contains(&token)
    }

    pub fn len(&self) -> usize {
        self.pinned.len() + self.filler.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn pinned(&self) -> &BTreeSet<InstrumentToken> {
        &self.pinned
    }

    pub fn filler(&self) -> &BTreeSet<InstrumentToken> {
        &self.filler
    }

    /// All members in ascending token order.
    pub fn tokens(&self) -> BTreeSet<InstrumentToken> {
        self.pinned.union(&self.filler).copied().collect()
    }
}

/// Select pinned tokens first, then fill up to `limit` from `ranked` in the
/// given order.
fn fill(
    pinned: &[InstrumentToken],
    ranked: impl IntoIterator<Item = InstrumentToken>,
    limit: usize,
) -> ActiveSet {
    if pinned.len() > limit {
        warn!(
            pinned = pinned.len(),
            limit, "More pinned instruments than the universe limit, truncating"
        );
    }
    let pinned: BTreeSet<InstrumentToken> = pinned.iter().copied().take(limit).collect();
    let room = limit - pinned.len();
    let mut filler = BTreeSet::new();
    for token in ranked {
        if filler.len() >= room {
            break;
        }
        if !pinned.contains(&token) {
            filler.insert(token);
        }
    }
    ActiveSet { pinned, filler }
}

/// Initial active set: pinned first, then the lowest known tokens up to
/// `limit`.
pub fn compute_active(
    pinned: &[InstrumentToken],
    all_known: impl IntoIterator<Item = InstrumentToken>,
    limit: usize,
) -> ActiveSet {
    let ordered: BTreeSet<InstrumentToken> = all_known.into_iter().collect();
    fill(pinned, ordered, limit)
}

/// Subscription changes produced by a rotation.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RotationDelta {
    pub to_add: Vec<InstrumentToken>,
    pub to_remove: Vec<InstrumentToken>,
}

impl RotationDelta {
    /// Changes that turn `from` into `to`.
    pub fn between(from: &BTreeSet<InstrumentToken>, to: &BTreeSet<InstrumentToken>) -> Self {
        Self {
            to_add: to.difference(from).copied().collect(),
            to_remove: from.difference(to).copied().collect(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.to_add.is_empty() && self.to_remove.is_empty()
    }
}

/// Trailing per-minute turnover per instrument.
#[derive(Debug, Default)]
pub struct TurnoverTracker {
    window: usize,
    history: BTreeMap<InstrumentToken, VecDeque<Decimal>>,
}

impl TurnoverTracker {
    pub fn new(window: usize) -> Self {
        Self {
            window,
            history: BTreeMap::new(),
        }
    }

    pub fn record(&mut self, token: InstrumentToken, turnover: Decimal) {
        let buf = self.history.entry(token).or_default();
        buf.push_back(turnover);
        while buf.len() > self.window {
            buf.pop_front();
        }
    }

    /// Summed turnover over the trailing window, zero when unknown.
    pub fn total(&self, token: InstrumentToken) -> Decimal {
        self.history
            .get(&token)
            .map(|buf| buf.iter().copied().sum())
            .unwrap_or(Decimal::ZERO)
    }

    pub fn discard(&mut self, token: InstrumentToken) {
        self.history.remove(&token);
    }

    pub fn tracked(&self) -> usize {
        self.history.len()
    }
}

/// Owns the active set, its turnover ranking and the rotation schedule.
pub struct SubscriptionManager {
    config: RotationConfig,
    active: ActiveSet,
    turnover: TurnoverTracker,
    /// Interval slot of the last rotation, so one window rotates once.
    last_slot: Option<i64>,
    rotations: u64,
}

impl SubscriptionManager {
    pub fn new(config: RotationConfig, initial: ActiveSet) -> Self {
        let turnover = TurnoverTracker::new(config.rank_window_min);
        Self {
            config,
            active: initial,
            turnover,
            last_slot: None,
            rotations: 0,
        }
    }

    pub fn active(&self) -> &ActiveSet {
        &self.active
    }

    pub fn turnover(&self) -> &TurnoverTracker {
        &self.turnover
    }

    /// Record the turnover of a finalized bar for an active instrument.
    pub fn record_turnover(&mut self, token: InstrumentToken, turnover: Decimal) {
        if self.active.contains(token) {
            self.turnover.record(token, turnover);
        }
    }

    /// Whether `now_secs` falls in a rotation window not yet used.
    pub fn rotation_due(&self, now_secs: i64) -> bool {
        let interval = self.config.interval_secs.max(1);
        now_secs.rem_euclid(interval) < self.config.window_secs
            && self.last_slot != Some(now_secs.div_euclid(interval))
    }

    /// Re-rank and replace the active set.
    ///
    /// Candidates are every pinned token plus the best of `universe` ranked
    /// by trailing turnover (descending), current members first on ties,
    /// then ascending token.
    pub fn rotate(
        &mut self,
        now_secs: i64,
        pinned: &[InstrumentToken],
        universe: impl IntoIterator<Item = InstrumentToken>,
        limit: usize,
    ) -> RotationDelta {
        self.last_slot = Some(now_secs.div_euclid(self.config.interval_secs.max(1)));

        let mut ranked: Vec<(Decimal, bool, InstrumentToken)> = universe
            .into_iter()
            .map(|t| (self.turnover.total(t), self.active.contains(t), t))
            .collect();
        ranked.sort_by_key(|(turnover, current, token)| (Reverse(*turnover), Reverse(*current), *token));
        let candidate = fill(pinned, ranked.into_iter().map(|(_, _, t)| t), limit);

        let delta = RotationDelta::between(&self.active.tokens(), &candidate.tokens());
        for token in &delta.to_remove {
            self.turnover.discard(*token);
        }
        self.active = candidate;
        self.rotations += 1;

        info!(
            added = delta.to_add.len(),
            removed = delta.to_remove.len(),
            active = self.active.len(),
            "Active set rotated"
        );
        delta
    }

    pub fn rotations(&self) -> u64 {
        self.rotations
    }
}
