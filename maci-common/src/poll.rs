use anyhow::{ensure, Result};
use serde::{Deserialize, Serialize};

use crate::keys::PubKey;
use crate::tree::TREE_ARITY;

/// Deepest supported vote option tree (15625 options). Every ballot holds
/// one weight per option, so this also bounds ballot size.
pub const MAX_VOTE_OPTION_TREE_DEPTH: usize = 6;

/// Packed command fields are 50 bits wide.
pub const MAX_TREE_DEPTH: usize = 21;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TreeDepths {
    pub state_tree_depth: usize,
    pub int_state_tree_depth: usize,
    pub message_tree_sub_depth: usize,
    pub message_tree_depth: usize,
    pub vote_option_tree_depth: usize,
}

impl TreeDepths {
    /// Messages per processing batch.
    pub fn message_batch_size(&self) -> usize {
        TREE_ARITY.pow(self.message_tree_sub_depth as u32)
    }

    /// Ballots per tally batch.
    pub fn tally_batch_size(&self) -> usize {
        TREE_ARITY.pow(self.int_state_tree_depth as u32)
    }

    pub fn validate(&self) -> Result<()> {
        ensure!(self.state_tree_depth > 0, "state tree depth must be positive");
        ensure!(
            self.message_tree_sub_depth <= self.message_tree_depth,
            "message subtree depth {} exceeds message tree depth {}",
            self.message_tree_sub_depth,
            self.message_tree_depth
        );
        ensure!(
            self.int_state_tree_depth <= self.state_tree_depth,
            "intermediate state tree depth {} exceeds state tree depth {}",
            self.int_state_tree_depth,
            self.state_tree_depth
        );
        ensure!(
            self.state_tree_depth <= MAX_TREE_DEPTH && self.message_tree_depth <= MAX_TREE_DEPTH,
            "tree depths beyond {} levels are not supported",
            MAX_TREE_DEPTH
        );
        ensure!(
            self.vote_option_tree_depth > 0
                && self.vote_option_tree_depth <= MAX_VOTE_OPTION_TREE_DEPTH,
            "vote option tree depth {} is outside 1..={}",
            self.vote_option_tree_depth,
            MAX_VOTE_OPTION_TREE_DEPTH
        );
        Ok(())
    }

    /// Leaves of the vote option tree, saturating for depths `validate`
    /// rejects.
    pub fn vote_option_capacity(&self) -> usize {
        TREE_ARITY
            .checked_pow(self.vote_option_tree_depth as u32)
            .unwrap_or(usize::MAX)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MaxValues {
    pub max_messages: u64,
    pub max_vote_options: u64,
}

/// Read-only poll parameters, captured once per run.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PollInfo {
    pub poll_id: u64,
    pub deploy_time: u64,
    pub duration: u64,
    pub tree_depths: TreeDepths,
    pub max_values: MaxValues,
    pub coordinator_pub_key: PubKey,
}

impl PollInfo {
    pub fn end_time(&self) -> u64 {
        self.deploy_time.saturating_add(self.duration)
    }

    /// Reject parameters the coordinator cannot build trees or ballots for.
    pub fn validate(&self) -> Result<()> {
        self.tree_depths.validate()?;
        ensure!(
            self.max_values.max_vote_options <= self.tree_depths.vote_option_capacity() as u64,
            "max vote options {} exceed the vote option tree capacity {}",
            self.max_values.max_vote_options,
            self.tree_depths.vote_option_capacity()
        );
        Ok(())
    }
}
