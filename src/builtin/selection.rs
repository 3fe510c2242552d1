//! Selection actions shipped with the host.

use crate::module::{ActionOutcome, SelectionActionModule, StageResult};
use crate::tree::{NodeIdx, Tree};

/// Puts the names of every leaf under the selected node in the outcome message.
pub struct CopyLeafNames;

impl SelectionActionModule for CopyLeafNames {
    fn is_available(&self, tree: &Tree, node: NodeIdx) -> bool {
        tree.get(node).is_some()
    }

    fn perform(&self, tree: &Tree, node: NodeIdx) -> StageResult<ActionOutcome> {
        let names: Vec<String> = tree
            .leaves(node)
            .into_iter()
            .filter_map(|leaf| tree.get(leaf).and_then(|n| n.name.clone()))
            .collect();
        Ok(ActionOutcome {
            further_transformations: Vec::new(),
            message: Some(names.join("\n")),
        })
    }
}
