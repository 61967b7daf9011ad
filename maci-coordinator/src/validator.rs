//! Finalization gate: both accumulator queues must be merged before any
//! proof is attempted.

use halo2curves_axiom::ff::Field;
use maci_common::Fr;
use tracing::{debug, warn};

use crate::chain::PollEndpoint;
use crate::error::{CoordinatorError, CoordinatorResult};

/// Check the state queue first, then the message queue's main root at the
/// poll's message tree depth. A zero root means the queue is unmerged.
pub async fn assert_preconditions(endpoint: &dyn PollEndpoint) -> CoordinatorResult<()> {
    if !endpoint.state_aq_merged().await? {
        warn!("State queue is not merged");
        return Err(CoordinatorError::StateTreeUnmerged);
    }

    let depth = endpoint.tree_depths().await?.message_tree_depth;
    let root = endpoint.message_aq_main_root(depth).await?;
    if root == Fr::ZERO {
        warn!("Message queue main root at depth {} is zero", depth);
        return Err(CoordinatorError::MessageTreeUnmerged);
    }

    debug!("Both accumulator queues are merged");
    Ok(())
}
