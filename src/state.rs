use crate::error::AppError;
use crate::estimation::estimator::LevelEstimate;
use crate::estimation::series::{Bucket, DaySummary};
use crate::traffic::TrafficReading;
use crate::vote::{Checkpoint, CheckpointId, Vote};
use std::collections::HashMap;
use tokio::sync::watch;

/// Latest computed view of one checkpoint.
#[derive(Debug, Clone, PartialEq)]
pub struct CheckpointSnapshot {
    pub checkpoint_id: CheckpointId,
    pub estimate: LevelEstimate,
    pub series: Vec<Bucket>,
    pub summary: DaySummary,
    pub traffic: Option<TrafficReading>,
    pub day_start_ms: i64,
    pub computed_at_ms: i64,
}

pub type SnapshotMap = HashMap<CheckpointId, CheckpointSnapshot>;

#[derive(Debug)]
pub struct AppState {
    checkpoints: Vec<Checkpoint>,
    votes: HashMap<CheckpointId, Vec<Vote>>,
    snapshots: SnapshotMap,
    snapshots_tx: watch::Sender<SnapshotMap>,
}

impl AppState {
    pub fn new(checkpoints: Vec<Checkpoint>) -> Self {
        let (snapshots_tx, _snapshots_rx) = watch::channel(HashMap::new());
        let votes = checkpoints
            .iter()
            .map(|checkpoint| (checkpoint.id.clone(), Vec::new()))
            .collect();
        Self {
            checkpoints,
            votes,
            snapshots: HashMap::new(),
            snapshots_tx,
        }
    }

    pub fn checkpoints(&self) -> &[Checkpoint] {
        &self.checkpoints
    }

    pub fn checkpoint(&self, checkpoint_id: &str) -> Option<&Checkpoint> {
        self.checkpoints.iter().find(|c| c.id == checkpoint_id)
    }

    pub fn record_vote(&mut self, vote: Vote) -> Result<(), AppError> {
        let votes = self
            .votes
            .get_mut(&vote.checkpoint_id)
            .ok_or_else(|| AppError::UnknownCheckpoint(vote.checkpoint_id.clone()))?;
        votes.push(vote);
        Ok(())
    }

    pub fn votes_for(&self, checkpoint_id: &str) -> &[Vote] {
        self.votes
            .get(checkpoint_id)
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    /// Drop votes recorded before `cutoff_ms`. Returns how many were removed.
    pub fn prune_votes_before(&mut self, cutoff_ms: i64) -> usize {
        let mut removed = 0;
        for votes in self.votes.values_mut() {
            let before = votes.len();
            votes.retain(|vote| vote.timestamp_ms >= cutoff_ms);
            removed += before - votes.len();
        }
        removed
    }

    pub fn snapshot(&self, checkpoint_id: &str) -> Option<&CheckpointSnapshot> {
        self.snapshots.get(checkpoint_id)
    }

    pub fn snapshots(&self) -> &SnapshotMap {
        &self.snapshots
    }

    pub fn subscribe_snapshots(&self) -> watch::Receiver<SnapshotMap> {
        self.snapshots_tx.subscribe()
    }

    pub fn set_snapshot(&mut self, snapshot: CheckpointSnapshot) -> Result<(), AppError> {
        if self.checkpoint(&snapshot.checkpoint_id).is_none() {
            return Err(AppError::UnknownCheckpoint(snapshot.checkpoint_id));
        }
        self.snapshots
            .insert(snapshot.checkpoint_id.clone(), snapshot);
        self.snapshots_tx.send_replace(self.snapshots.clone());
        Ok(())
    }
}
