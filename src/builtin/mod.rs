//! First-party native modules.
//!
//! These are compiled into the host, so they are registered directly and
//! never pass through signature verification. Their ids are fixed so that
//! serialized pipelines keep referring to the same module across releases.

pub mod coordinates;
pub mod input;
pub mod plots;
pub mod selection;
pub mod transforms;

use crate::module::{LoadedModule, ModuleImpl};
use serde_json::json;
use std::sync::Arc;
use uuid::Uuid;

pub const NEWICK_ID: Uuid = Uuid::from_u128(0x8a8b0f2e_5c1d_4e4a_9f3b_1b6a0c7d2e01);
pub const LOAD_ALL_TREES_ID: Uuid = Uuid::from_u128(0x8a8b0f2e_5c1d_4e4a_9f3b_1b6a0c7d2e02);
pub const SELECT_TREE_ID: Uuid = Uuid::from_u128(0x8a8b0f2e_5c1d_4e4a_9f3b_1b6a0c7d2e03);
pub const CHANGE_ATTRIBUTE_ID: Uuid = Uuid::from_u128(0x8a8b0f2e_5c1d_4e4a_9f3b_1b6a0c7d2e04);
pub const SORT_NODES_ID: Uuid = Uuid::from_u128(0x8a8b0f2e_5c1d_4e4a_9f3b_1b6a0c7d2e05);
pub const SCALE_BRANCHES_ID: Uuid = Uuid::from_u128(0x8a8b0f2e_5c1d_4e4a_9f3b_1b6a0c7d2e06);
pub const RECTANGULAR_ID: Uuid = Uuid::from_u128(0x8a8b0f2e_5c1d_4e4a_9f3b_1b6a0c7d2e07);
pub const BRANCHES_ID: Uuid = Uuid::from_u128(0x8a8b0f2e_5c1d_4e4a_9f3b_1b6a0c7d2e08);
pub const LABELS_ID: Uuid = Uuid::from_u128(0x8a8b0f2e_5c1d_4e4a_9f3b_1b6a0c7d2e09);
pub const ATTACHMENT_IMAGE_ID: Uuid = Uuid::from_u128(0x8a8b0f2e_5c1d_4e4a_9f3b_1b6a0c7d2e0a);
pub const COPY_LEAF_NAMES_ID: Uuid = Uuid::from_u128(0x8a8b0f2e_5c1d_4e4a_9f3b_1b6a0c7d2e0b);

/// Every built-in module, ready for [`Registry::register_builtin`](crate::module::Registry::register_builtin).
pub fn all() -> Vec<LoadedModule> {
    vec![
        LoadedModule::builtin(NEWICK_ID, "Newick", ModuleImpl::FileType(Arc::new(input::NewickFileType)))
            .with_help("Reads one or more trees in Newick format."),
        LoadedModule::builtin(
            LOAD_ALL_TREES_ID,
            "Load all trees",
            ModuleImpl::LoadFile(Arc::new(input::LoadAllTrees)),
        )
        .with_help("Keeps every tree found in the file."),
        LoadedModule::builtin(
            SELECT_TREE_ID,
            "Select tree",
            ModuleImpl::Transformer(Arc::new(input::SelectTree)),
        )
        .with_help("Picks one tree out of the loaded collection."),
        LoadedModule::builtin(
            CHANGE_ATTRIBUTE_ID,
            "Change attribute",
            ModuleImpl::FurtherTransformation(Arc::new(transforms::ChangeAttribute)),
        )
        .with_help("Sets an attribute on the node that is the LCA of the selected names."),
        LoadedModule::builtin(
            SORT_NODES_ID,
            "Sort nodes",
            ModuleImpl::FurtherTransformation(Arc::new(transforms::SortNodes)),
        ),
        LoadedModule::builtin(
            SCALE_BRANCHES_ID,
            "Scale branches",
            ModuleImpl::FurtherTransformation(Arc::new(transforms::ScaleBranches)),
        ),
        LoadedModule::builtin(
            RECTANGULAR_ID,
            "Rectangular",
            ModuleImpl::Coordinates(Arc::new(coordinates::Rectangular)),
        )
        .with_default_setting("Default width", json!(coordinates::DEFAULT_WIDTH)),
        LoadedModule::builtin(BRANCHES_ID, "Branches", ModuleImpl::PlotAction(Arc::new(plots::Branches))),
        LoadedModule::builtin(LABELS_ID, "Labels", ModuleImpl::PlotAction(Arc::new(plots::Labels)))
            .with_default_setting("Default font size", json!(crate::params::Font::default().size)),
        LoadedModule::builtin(
            ATTACHMENT_IMAGE_ID,
            "Attachment image",
            ModuleImpl::PlotAction(Arc::new(plots::AttachmentImage)),
        ),
        LoadedModule::builtin(
            COPY_LEAF_NAMES_ID,
            "Copy leaf names",
            ModuleImpl::SelectionAction(Arc::new(selection::CopyLeafNames)),
        ),
    ]
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn test_ids_are_unique() {
        let modules = all();
        let ids: HashSet<Uuid> = modules.iter().map(|m| m.id).collect();
        assert_eq!(ids.len(), modules.len());
    }
}
