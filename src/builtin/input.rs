//! Reading trees: the Newick file type, the Load stage and tree selection.

use crate::module::{FileTypeModule, LoadFileModule, Progress, StageError, StageResult, TransformerModule};
use crate::params::{ControlKind, ParameterChange, ParameterMap, ParameterSpec, ParameterValue};
use crate::tree::{parse_newick_collection, Tree, TreeCollection};

const NEWICK_EXTENSIONS: &[&str] = &["tre", "tree", "trees", "nwk", "newick", "treefile"];

pub const TREE_INDEX: &str = "Tree index";

pub struct NewickFileType;

impl FileTypeModule for NewickFileType {
    fn extensions(&self) -> Vec<String> {
        NEWICK_EXTENSIONS.iter().map(|e| e.to_string()).collect()
    }

    fn is_supported(&self, file_name: &str, header: &str) -> i64 {
        let extension_matches = std::path::Path::new(file_name)
            .extension()
            .and_then(|e| e.to_str())
            .is_some_and(|e| NEWICK_EXTENSIONS.contains(&e.to_ascii_lowercase().as_str()));
        let looks_like_newick = header.trim_start().starts_with('(');
        match (extension_matches, looks_like_newick) {
            (true, true) => 100,
            (false, true) => 50,
            (true, false) => 10,
            (false, false) => 0,
        }
    }

    fn open(&self, file_name: &str, text: &str, progress: Progress<'_>) -> StageResult<Vec<Tree>> {
        let trees = parse_newick_collection(text)
            .map_err(|e| StageError::new(format!("{}: {}", file_name, e)))?
            .into_vec();
        progress(1.0);
        tracing::debug!("Read {} trees from {}", trees.len(), file_name);
        Ok(trees)
    }
}

pub struct LoadAllTrees;

impl LoadFileModule for LoadAllTrees {
    fn load(&self, trees: Vec<Tree>, _params: &ParameterMap, progress: Progress<'_>) -> StageResult<TreeCollection> {
        if trees.is_empty() {
            return Err(StageError::new("the file does not contain any tree"));
        }
        progress(1.0);
        Ok(TreeCollection::new(trees))
    }
}

/// Transformer picking one tree (1-based) from the collection.
pub struct SelectTree;

impl TransformerModule for SelectTree {
    fn get_parameters(&self, trees: &TreeCollection) -> Vec<ParameterSpec> {
        vec![ParameterSpec::new(
            TREE_INDEX,
            ControlKind::Integer {
                min: 1,
                max: trees.len().max(1) as i64,
            },
            ParameterValue::Int(1),
        )]
    }

    fn on_parameter_change(&self, trees: &TreeCollection, _previous: &ParameterMap, current: &ParameterMap) -> ParameterChange {
        match current.get_int(TREE_INDEX) {
            Some(i) if i >= 1 && (i as usize) <= trees.len() => ParameterChange::accept(),
            _ => ParameterChange::reject(),
        }
    }

    fn transform(&self, trees: &TreeCollection, params: &ParameterMap, progress: Progress<'_>) -> StageResult<Tree> {
        let index = params.get_int(TREE_INDEX).unwrap_or(1);
        let tree = usize::try_from(index - 1)
            .ok()
            .and_then(|i| trees.get(i))
            .ok_or_else(|| StageError::new(format!("tree {} does not exist ({} loaded)", index, trees.len())))?;
        progress(1.0);
        Ok(tree.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_newick_confidence() {
        let newick = NewickFileType;
        assert_eq!(newick.is_supported("a.nwk", "((A,B),C);"), 100);
        assert_eq!(newick.is_supported("a.txt", "  ((A,B),C);"), 50);
        assert_eq!(newick.is_supported("a.txt", "#NEXUS"), 0);
    }

    #[test]
    fn test_open_reads_every_tree() {
        let trees = NewickFileType.open("two.nwk", "(A,B);\n(C,D);", &|_| {}).unwrap();
        assert_eq!(trees.len(), 2);
        assert!(NewickFileType.open("bad.nwk", "((A,B;", &|_| {}).is_err());
    }

    #[test]
    fn test_select_tree_bounds() {
        let trees = TreeCollection::new(vec![Tree::new(), Tree::new()]);
        let second = ParameterMap::new().with(TREE_INDEX, ParameterValue::Int(2));
        assert!(SelectTree.transform(&trees, &second, &|_| {}).is_ok());

        let third = ParameterMap::new().with(TREE_INDEX, ParameterValue::Int(3));
        assert!(SelectTree.transform(&trees, &third, &|_| {}).is_err());
        assert!(!SelectTree.on_parameter_change(&trees, &second, &third).valid);
    }
}
