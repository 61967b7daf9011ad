//! Rebuilds poll state from the contract's event log.

use futures::{stream, StreamExt, TryStreamExt};
use halo2curves_axiom::ff::Field;
use maci_common::{Fr, Message, PollInfo, QuinaryTree, StateLeaf};
use tracing::{debug, info};

use crate::chain::{decode_log, PollEndpoint, PollEvent, RawLog};
use crate::error::{CoordinatorError, CoordinatorResult};

pub const DEFAULT_FETCH_CONCURRENCY: usize = 4;

/// Poll state as recorded on chain: signups and messages in log order.
///
/// Built once per run and never mutated; processing works on its own copy.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ProtocolState {
    pub poll: PollInfo,
    /// State leaves by index. Index 0 is the blank leaf.
    pub state_leaves: Vec<StateLeaf>,
    pub messages: Vec<Message>,
    pub from_block: u64,
    pub to_block: u64,
}

impl ProtocolState {
    pub fn num_signups(&self) -> u64 {
        self.state_leaves.len().saturating_sub(1) as u64
    }

    pub fn num_messages(&self) -> u64 {
        self.messages.len() as u64
    }

    pub fn state_tree(&self) -> CoordinatorResult<QuinaryTree> {
        let mut tree = QuinaryTree::new(
            self.poll.tree_depths.state_tree_depth,
            StateLeaf::blank().hash(),
        );
        for leaf in &self.state_leaves {
            tree.insert(leaf.hash())
                .map_err(|e| CoordinatorError::ReplicationMismatch(e.to_string()))?;
        }
        Ok(tree)
    }

    pub fn message_tree(&self) -> CoordinatorResult<QuinaryTree> {
        let mut tree = QuinaryTree::new(self.poll.tree_depths.message_tree_depth, Fr::ZERO);
        for message in &self.messages {
            tree.insert(message.hash())
                .map_err(|e| CoordinatorError::ReplicationMismatch(e.to_string()))?;
        }
        Ok(tree)
    }

    /// Cross-check the replicated events against the contract's own
    /// counters and merged roots.
    pub async fn verify_against(&self, endpoint: &dyn PollEndpoint) -> CoordinatorResult<()> {
        let signups = endpoint.num_signups().await?;
        if signups != self.num_signups() {
            return Err(CoordinatorError::ReplicationMismatch(format!(
                "chain reports {} signups, replicated {}",
                signups,
                self.num_signups()
            )));
        }

        let messages = endpoint.num_messages().await?;
        if messages != self.num_messages() {
            return Err(CoordinatorError::ReplicationMismatch(format!(
                "chain reports {} messages, replicated {}",
                messages,
                self.num_messages()
            )));
        }

        let state_root = endpoint.merged_state_root().await?;
        if state_root != self.state_tree()?.root() {
            return Err(CoordinatorError::ReplicationMismatch(
                "replicated state root differs from the merged state root".into(),
            ));
        }

        let depth = self.poll.tree_depths.message_tree_depth;
        let message_root = endpoint.message_aq_main_root(depth).await?;
        if message_root != self.message_tree()?.root() {
            return Err(CoordinatorError::ReplicationMismatch(
                "replicated message root differs from the merged message root".into(),
            ));
        }

        debug!("Replicated state matches chain counters and roots");
        Ok(())
    }
}

/// Split `[start, end]` into consecutive windows of at most `size` blocks.
pub fn block_windows(start: u64, end: u64, size: u64) -> Vec<(u64, u64)> {
    let mut windows = Vec::new();
    if size == 0 || start > end {
        return windows;
    }
    let mut from = start;
    loop {
        let to = from.saturating_add(size - 1).min(end);
        windows.push((from, to));
        if to == end {
            break;
        }
        from = to + 1;
    }
    windows
}

pub struct ChainStateReplicator {
    blocks_per_batch: u64,
    concurrency: usize,
}

impl ChainStateReplicator {
    pub fn new(blocks_per_batch: u64, concurrency: usize) -> CoordinatorResult<Self> {
        if blocks_per_batch == 0 {
            return Err(CoordinatorError::Config(
                "blocks per batch must be greater than 0".into(),
            ));
        }
        Ok(Self {
            blocks_per_batch,
            concurrency: concurrency.max(1),
        })
    }

    /// Fetch every poll log in `[start_block, end_block]` and fold it into
    /// a [`ProtocolState`].
    pub async fn replicate(
        &self,
        endpoint: &dyn PollEndpoint,
        start_block: u64,
        end_block: u64,
    ) -> CoordinatorResult<ProtocolState> {
        let poll = endpoint.poll_info().await?;
        poll.validate().map_err(|e| {
            CoordinatorError::Precondition(format!("poll {} parameters rejected: {:#}", poll.poll_id, e))
        })?;
        let windows = block_windows(start_block, end_block, self.blocks_per_batch);
        debug!(
            "Fetching {} log windows of {} blocks with concurrency {}",
            windows.len(),
            self.blocks_per_batch,
            self.concurrency
        );

        // `buffered` keeps window order even when later windows finish first.
        let batches: Vec<Vec<RawLog>> = stream::iter(windows)
            .map(|(from, to)| endpoint.fetch_logs(from, to))
            .buffered(self.concurrency)
            .try_collect()
            .await?;

        let mut logs: Vec<RawLog> = batches.into_iter().flatten().collect();
        logs.sort_by_key(RawLog::position);
        logs.dedup_by_key(|log| log.position());

        let mut state_leaves = vec![StateLeaf::blank()];
        let mut messages = Vec::new();
        for log in &logs {
            match decode_log(log)? {
                PollEvent::SignUp {
                    state_index,
                    pub_key,
                    voice_credit_balance,
                    timestamp,
                } => {
                    let expected = state_leaves.len() as u64;
                    if state_index != expected {
                        return Err(CoordinatorError::ReplicationMismatch(format!(
                            "signup at block {} has state index {}, expected {}",
                            log.block_number, state_index, expected
                        )));
                    }
                    state_leaves.push(StateLeaf::new(pub_key, voice_credit_balance, timestamp));
                }
                PollEvent::PublishMessage(message) => messages.push(message),
            }
        }

        info!(
            "Replicated {} signups and {} messages from blocks {}..={}",
            state_leaves.len() - 1,
            messages.len(),
            start_block,
            end_block
        );

        Ok(ProtocolState {
            poll,
            state_leaves,
            messages,
            from_block: start_block,
            to_block: end_block,
        })
    }
}

/// One-shot replication with the default fetch concurrency.
pub async fn replicate(
    endpoint: &dyn PollEndpoint,
    start_block: u64,
    end_block: u64,
    blocks_per_batch: u64,
) -> CoordinatorResult<ProtocolState> {
    ChainStateReplicator::new(blocks_per_batch, DEFAULT_FETCH_CONCURRENCY)?
        .replicate(endpoint, start_block, end_block)
        .await
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn windows_cover_range_without_overlap() {
        assert_eq!(block_windows(0, 9, 5), vec![(0, 4), (5, 9)]);
        assert_eq!(block_windows(3, 10, 4), vec![(3, 6), (7, 10)]);
        assert_eq!(block_windows(7, 7, 50), vec![(7, 7)]);
        assert!(block_windows(8, 7, 5).is_empty());
        assert!(block_windows(0, 7, 0).is_empty());
    }

    #[test]
    fn windows_do_not_overflow_at_the_top() {
        let windows = block_windows(u64::MAX - 2, u64::MAX, 2);
        assert_eq!(windows, vec![(u64::MAX - 2, u64::MAX - 1), (u64::MAX, u64::MAX)]);
    }

    #[test]
    fn zero_window_size_is_a_config_error() {
        assert!(matches!(
            ChainStateReplicator::new(0, 1),
            Err(CoordinatorError::Config(_))
        ));
    }
}
