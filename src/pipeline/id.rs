//! Stage identity within a pipeline.

use crate::module::ModuleKind;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Position of a stage in the fixed pipeline shape.
///
/// The derived ordering is execution order: every `Further` index comes after
/// `Transform` and before `Coordinates`, every `Plot` index after
/// `Coordinates`.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum StageIndex {
    Load,
    Transform,
    Further(usize),
    Coordinates,
    Plot(usize),
}

impl StageIndex {
    /// The module kind a stage at this position must have.
    pub fn module_kind(self) -> ModuleKind {
        match self {
            StageIndex::Load => ModuleKind::LoadFile,
            StageIndex::Transform => ModuleKind::Transformer,
            StageIndex::Further(_) => ModuleKind::FurtherTransformation,
            StageIndex::Coordinates => ModuleKind::Coordinates,
            StageIndex::Plot(_) => ModuleKind::PlotAction,
        }
    }

    /// Whether recomputing from `self` also recomputes `other`.
    ///
    /// A plot run only touches its own layer.
    #[inline]
    pub fn covers(self, other: StageIndex) -> bool {
        match self {
            StageIndex::Plot(j) => other == StageIndex::Plot(j),
            _ => other >= self,
        }
    }
}

impl fmt::Debug for StageIndex {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StageIndex::Load => write!(f, "Load"),
            StageIndex::Transform => write!(f, "Transform"),
            StageIndex::Further(i) => write!(f, "Further({})", i),
            StageIndex::Coordinates => write!(f, "Coordinates"),
            StageIndex::Plot(j) => write!(f, "Plot({})", j),
        }
    }
}

impl fmt::Display for StageIndex {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}
