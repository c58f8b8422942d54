//! Shard-to-team bookkeeping and the team-collection seam.

use std::collections::{BTreeMap, BTreeSet};

use tokio::sync::mpsc;

use strand_core::{Key, KeyRange, Uid};

/// One replica team in one region.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Team {
    pub servers: Vec<Uid>,
    pub primary: bool,
}

impl Team {
    pub fn new(servers: Vec<Uid>, primary: bool) -> Self {
        Self { servers, primary }
    }
}

/// Tracks which teams serve which shards so a team failure can be mapped
/// back to the ranges it affects. Mutated by the supervisor during seeding
/// and by the team collections afterwards.
pub struct ShardsAffectedByTeamFailure {
    // Shard begin key -> teams currently serving it.
    shard_teams: BTreeMap<Key, (KeyRange, Vec<Team>)>,
    team_shards: BTreeMap<Team, BTreeSet<Key>>,
    restart_tx: mpsc::UnboundedSender<KeyRange>,
}

impl ShardsAffectedByTeamFailure {
    /// Returns the tracker restart stream alongside the structure; the
    /// shard tracker consumes it when a restored data move redefines a
    /// range.
    pub fn new() -> (Self, mpsc::UnboundedReceiver<KeyRange>) {
        let (restart_tx, restart_rx) = mpsc::unbounded_channel();
        (
            Self {
                shard_teams: BTreeMap::new(),
                team_shards: BTreeMap::new(),
                restart_tx,
            },
            restart_rx,
        )
    }

    pub fn shard_count(&self) -> usize {
        self.shard_teams.len()
    }

    /// Register `range` as one tracked shard, clearing any previous team
    /// assignment for the same begin key.
    pub fn define_shard(&mut self, range: &KeyRange) {
        if let Some((_, teams)) = self.shard_teams.insert(range.begin.clone(), (range.clone(), Vec::new())) {
            for team in teams {
                if let Some(shards) = self.team_shards.get_mut(&team) {
                    shards.remove(&range.begin);
                }
            }
        }
    }

    /// Assign `teams` as the servers of the shard at `range`.
    pub fn move_shard(&mut self, range: &KeyRange, teams: Vec<Team>) {
        let entry = self
            .shard_teams
            .entry(range.begin.clone())
            .or_insert_with(|| (range.clone(), Vec::new()));
        let previous = std::mem::replace(&mut entry.1, teams.clone());
        for team in previous {
            if let Some(shards) = self.team_shards.get_mut(&team) {
                shards.remove(&range.begin);
            }
        }
        for team in teams {
            self.team_shards
                .entry(team)
                .or_default()
                .insert(range.begin.clone());
        }
    }

    pub fn teams_for(&self, begin: &[u8]) -> Vec<Team> {
        self.shard_teams
            .get(begin)
            .map(|(_, teams)| teams.clone())
            .unwrap_or_default()
    }

    pub fn shards_for(&self, team: &Team) -> Vec<KeyRange> {
        self.team_shards
            .get(team)
            .map(|begins| {
                begins
                    .iter()
                    .filter_map(|b| self.shard_teams.get(b).map(|(r, _)| r.clone()))
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Ask the shard tracker to restart tracking of `range`.
    pub fn restart_shard_tracker(&self, range: KeyRange) {
        let _ = self.restart_tx.send(range);
    }
}

/// Perpetual-wiggle phase of one region, as reported to operators.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum WigglerState {
    Invalid,
    Run,
    Pause,
}

/// The per-region team collection, as seen from this crate. The real actor
/// recruits servers and builds teams elsewhere; the supervisor spawns it
/// through the pipeline seam and the request handlers only read from it.
pub trait TeamCollection: Send + Sync {
    fn is_primary(&self) -> bool;

    fn team_count(&self) -> usize;

    /// Safe iff no remaining team would lose all of its servers.
    fn exclusion_safety_check(&self, excluded: &[Uid]) -> bool;

    /// A healthy team not containing `exclude`, used to rehost ranges
    /// dropped with a failed server.
    fn random_healthy_team(&self, exclude: Uid) -> Vec<Uid>;

    /// Current wiggle phase and the unix time of its last change.
    fn wiggler_state(&self) -> (WigglerState, u64);
}
