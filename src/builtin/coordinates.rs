//! Rectangular tree layout.
//!
//! Leaves are spaced evenly along y in preorder; an internal node sits at the
//! mean y of its children. x is the root distance when the tree has branch
//! lengths, otherwise the node depth, scaled so the deepest node lands at
//! `Width`.

use crate::module::{Coordinates, CoordinatesModule, Progress, StageError, StageResult};
use crate::params::{ControlKind, ParameterMap, ParameterSpec, ParameterValue};
use crate::render::Point;
use crate::tree::Tree;

pub const WIDTH: &str = "Width";
pub const LEAF_SPACING: &str = "Leaf spacing";

pub const DEFAULT_WIDTH: f64 = 500.0;
const DEFAULT_LEAF_SPACING: f64 = 20.0;

pub struct Rectangular;

impl CoordinatesModule for Rectangular {
    fn get_parameters(&self, _tree: &Tree) -> Vec<ParameterSpec> {
        vec![
            ParameterSpec::new(
                WIDTH,
                ControlKind::Numeric {
                    min: 1.0,
                    max: f64::MAX,
                },
                ParameterValue::Double(DEFAULT_WIDTH),
            ),
            ParameterSpec::new(
                LEAF_SPACING,
                ControlKind::Numeric {
                    min: 1.0,
                    max: f64::MAX,
                },
                ParameterValue::Double(DEFAULT_LEAF_SPACING),
            ),
        ]
    }

    fn compute(&self, tree: &Tree, params: &ParameterMap, progress: Progress<'_>) -> StageResult<Coordinates> {
        let width = params.get_f64(WIDTH).unwrap_or(DEFAULT_WIDTH);
        let spacing = params.get_f64(LEAF_SPACING).unwrap_or(DEFAULT_LEAF_SPACING);
        if !(width > 0.0 && spacing > 0.0) {
            return Err(StageError::new("width and leaf spacing must be positive"));
        }

        let use_lengths = tree.has_branch_lengths();
        let mut x = vec![0.0; tree.len()];
        for idx in tree.preorder() {
            if let Some(parent) = tree.parent(idx) {
                let step = if use_lengths {
                    tree.get(idx).and_then(|n| n.length).unwrap_or(0.0)
                } else {
                    1.0
                };
                x[idx.index()] = x[parent.index()] + step;
            }
        }
        let max_x = x.iter().cloned().fold(0.0, f64::max);
        let scale = if max_x > 0.0 { width / max_x } else { 0.0 };

        let mut y = vec![0.0; tree.len()];
        let mut next_leaf = 0.0;
        for idx in tree.postorder() {
            let children = tree.children(idx);
            y[idx.index()] = if children.is_empty() {
                let leaf_y = next_leaf;
                next_leaf += spacing;
                leaf_y
            } else {
                children.iter().map(|c| y[c.index()]).sum::<f64>() / children.len() as f64
            };
        }

        let coordinates = tree
            .preorder()
            .into_iter()
            .filter_map(|idx| {
                let node = tree.get(idx)?;
                Some((node.id.clone(), Point::new(x[idx.index()] * scale, y[idx.index()])))
            })
            .collect();
        progress(1.0);
        Ok(coordinates)
    }
}
