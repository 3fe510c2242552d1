//! Further transformations shipped with the host.

use crate::module::{FurtherTransformationModule, Progress, StageError, StageResult};
use crate::params::{ControlKind, ControlStatus, ParameterChange, ParameterMap, ParameterSpec, ParameterValue};
use crate::tree::{AttributeValue, Tree, ATTR_LENGTH, ATTR_NAME, ATTR_SUPPORT};

pub const NODE: &str = "Node";
pub const ATTRIBUTE: &str = "Attribute";
pub const ATTRIBUTE_TYPE: &str = "Attribute type";
pub const NEW_VALUE: &str = "New value";
pub const ORDER: &str = "Order";
pub const FACTOR: &str = "Factor";

const ATTRIBUTE_TYPES: [&str; 2] = ["String", "Number"];

/// Sets one attribute on the LCA of the selected node names.
pub struct ChangeAttribute;

impl ChangeAttribute {
    fn fixed_type(attribute: &str) -> Option<i64> {
        match attribute {
            ATTR_NAME => Some(0),
            ATTR_LENGTH | ATTR_SUPPORT => Some(1),
            _ => None,
        }
    }
}

impl FurtherTransformationModule for ChangeAttribute {
    fn get_parameters(&self, tree: &Tree) -> Vec<ParameterSpec> {
        let default_node = tree
            .leaves(tree.root())
            .first()
            .and_then(|&leaf| tree.get(leaf))
            .and_then(|node| node.name.clone())
            .map(|name| vec![name])
            .unwrap_or_default();
        vec![
            ParameterSpec::new(NODE, ControlKind::NodeSelector, ParameterValue::StringArray(default_node)),
            ParameterSpec::new(
                ATTRIBUTE,
                ControlKind::AttributeSelector,
                ParameterValue::String(ATTR_NAME.to_string()),
            ),
            ParameterSpec::new(
                ATTRIBUTE_TYPE,
                ControlKind::Choice {
                    options: ATTRIBUTE_TYPES.iter().map(|s| s.to_string()).collect(),
                },
                ParameterValue::Int(0),
            ),
            ParameterSpec::new(NEW_VALUE, ControlKind::Text, ParameterValue::String(String::new())),
        ]
    }

    fn on_parameter_change(&self, _tree: &Tree, _previous: &ParameterMap, current: &ParameterMap) -> ParameterChange {
        let attribute = current.get_str(ATTRIBUTE).unwrap_or_default();
        match Self::fixed_type(attribute) {
            Some(kind) => ParameterChange::accept()
                .with_status(ATTRIBUTE_TYPE, ControlStatus::Disabled)
                .with_change(ATTRIBUTE_TYPE, ParameterValue::Int(kind)),
            None => ParameterChange::accept().with_status(ATTRIBUTE_TYPE, ControlStatus::Available),
        }
    }

    fn execute(&self, tree: &mut Tree, params: &ParameterMap, progress: Progress<'_>) -> StageResult<()> {
        let names = params.get_strings(NODE).unwrap_or_default();
        if names.is_empty() {
            return Err(StageError::new("no node selected"));
        }
        let node = tree
            .lca_of_names(names)
            .ok_or_else(|| StageError::new(format!("could not find the node defined by {}", names.join(", "))))?;

        let attribute = params.get_str(ATTRIBUTE).unwrap_or(ATTR_NAME);
        let raw = params.get_str(NEW_VALUE).unwrap_or_default();
        let is_number = Self::fixed_type(attribute)
            .or_else(|| params.get_int(ATTRIBUTE_TYPE))
            .unwrap_or(0)
            == 1;

        let value = if raw.is_empty() {
            None
        } else if is_number {
            let number = raw
                .trim()
                .parse::<f64>()
                .map_err(|_| StageError::new(format!("'{}' is not a number", raw)))?;
            Some(AttributeValue::Number(number))
        } else {
            Some(AttributeValue::Text(raw.to_string()))
        };

        tree.set_attribute(node, attribute, value).map_err(StageError::new)?;
        progress(1.0);
        Ok(())
    }
}

/// Ladderizes the tree by clade size.
pub struct SortNodes;

impl FurtherTransformationModule for SortNodes {
    fn get_parameters(&self, _tree: &Tree) -> Vec<ParameterSpec> {
        vec![ParameterSpec::new(
            ORDER,
            ControlKind::Choice {
                options: vec!["Ascending".to_string(), "Descending".to_string()],
            },
            ParameterValue::Int(1),
        )]
    }

    fn execute(&self, tree: &mut Tree, params: &ParameterMap, progress: Progress<'_>) -> StageResult<()> {
        tree.ladderize(params.get_int(ORDER).unwrap_or(1) == 1);
        progress(1.0);
        Ok(())
    }
}

/// Multiplies every branch length by a constant factor.
pub struct ScaleBranches;

impl FurtherTransformationModule for ScaleBranches {
    fn get_parameters(&self, _tree: &Tree) -> Vec<ParameterSpec> {
        vec![ParameterSpec::new(
            FACTOR,
            ControlKind::Numeric {
                min: 0.0,
                max: f64::MAX,
            },
            ParameterValue::Double(1.0),
        )]
    }

    fn on_parameter_change(&self, _tree: &Tree, _previous: &ParameterMap, current: &ParameterMap) -> ParameterChange {
        match current.get_f64(FACTOR) {
            Some(f) if f.is_finite() && f >= 0.0 => ParameterChange::accept(),
            _ => ParameterChange::reject(),
        }
    }

    fn execute(&self, tree: &mut Tree, params: &ParameterMap, progress: Progress<'_>) -> StageResult<()> {
        let factor = params.get_f64(FACTOR).unwrap_or(1.0);
        if !factor.is_finite() || factor < 0.0 {
            return Err(StageError::new(format!("invalid scale factor {}", factor)));
        }
        for idx in tree.preorder() {
            if let Some(node) = tree.get_mut(idx) {
                node.length = node.length.map(|l| l * factor);
            }
        }
        progress(1.0);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tree::parse_newick;

    fn rename(names: &[&str], value: &str) -> ParameterMap {
        ParameterMap::new()
            .with(NODE, ParameterValue::StringArray(names.iter().map(|s| s.to_string()).collect()))
            .with(ATTRIBUTE, ParameterValue::String(ATTR_NAME.to_string()))
            .with(NEW_VALUE, ParameterValue::String(value.to_string()))
    }

    #[test]
    fn test_rename_leaf() {
        let mut tree = parse_newick("((A,B),(C,D),E);").unwrap();
        ChangeAttribute.execute(&mut tree, &rename(&["B"], "B2"), &|_| {}).unwrap();
        assert_eq!(tree.find_by_name("B2").len(), 1);
        assert!(tree.find_by_name("B").is_empty());
    }

    #[test]
    fn test_set_attribute_on_lca() {
        let mut tree = parse_newick("((A,B),(C,D));").unwrap();
        let params = ParameterMap::new()
            .with(NODE, ParameterValue::StringArray(vec!["A".into(), "B".into()]))
            .with(ATTRIBUTE, ParameterValue::String("Clade".into()))
            .with(ATTRIBUTE_TYPE, ParameterValue::Int(1))
            .with(NEW_VALUE, ParameterValue::String("7".into()));
        ChangeAttribute.execute(&mut tree, &params, &|_| {}).unwrap();

        let a = tree.find_by_name("A")[0];
        let clade = tree.parent(a).unwrap();
        assert_eq!(tree.attribute(clade, "Clade"), Some(AttributeValue::Number(7.0)));
    }

    #[test]
    fn test_missing_node_fails() {
        let mut tree = parse_newick("(A,B);").unwrap();
        let err = ChangeAttribute.execute(&mut tree, &rename(&["Z"], "Z2"), &|_| {}).unwrap_err();
        assert!(err.message.contains("Z"));
    }

    #[test]
    fn test_builtin_attributes_lock_type() {
        let tree = Tree::new();
        let current = ParameterMap::new().with(ATTRIBUTE, ParameterValue::String(ATTR_LENGTH.into()));
        let change = ChangeAttribute.on_parameter_change(&tree, &ParameterMap::new(), &current);
        assert_eq!(change.control_status.get(ATTRIBUTE_TYPE), Some(&ControlStatus::Disabled));
        assert_eq!(change.parameters_to_change.get_int(ATTRIBUTE_TYPE), Some(1));
    }

    #[test]
    fn test_scale_branches() {
        let mut tree = parse_newick("(A:1,B:2);").unwrap();
        let params = ParameterMap::new().with(FACTOR, ParameterValue::Double(0.5));
        ScaleBranches.execute(&mut tree, &params, &|_| {}).unwrap();
        let b = tree.find_by_name("B")[0];
        assert_eq!(tree.get(b).unwrap().length, Some(1.0));

        let negative = ParameterMap::new().with(FACTOR, ParameterValue::Double(-1.0));
        assert!(ScaleBranches.execute(&mut tree, &negative, &|_| {}).is_err());
    }

    #[test]
    fn test_sort_nodes_descending() {
        let mut tree = parse_newick("(A,(B,C));").unwrap();
        SortNodes
            .execute(&mut tree, &ParameterMap::new().with(ORDER, ParameterValue::Int(1)), &|_| {})
            .unwrap();
        let first = tree.children(tree.root())[0];
        assert_eq!(tree.children(first).len(), 2);
    }
}
