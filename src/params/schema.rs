//! Parameter schemas and control status.
//!
//! Modules describe their parameters with [`ParameterSpec`]s. When a value
//! changes, the module answers with a [`ParameterChange`]: per-control
//! visibility plus any parameters the host must overwrite before running.

use super::{ParameterMap, ParameterValue};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Kind of control a parameter is edited with.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ControlKind {
    Checkbox,
    Integer { min: i64, max: i64 },
    Numeric { min: f64, max: f64 },
    Text,
    Choice { options: Vec<String> },
    /// Node picked by the names of leaves it is the LCA of
    NodeSelector,
    /// One of the attribute names currently present in the tree
    AttributeSelector,
    Font,
    Point,
    Colour,
    Dash,
    Formatter,
    Attachment,
    /// Display-only text; carries no value
    Label,
}

impl ControlKind {
    /// Whether this control's choices depend on the current tree's attributes.
    pub fn tracks_attributes(&self) -> bool {
        matches!(self, ControlKind::AttributeSelector)
    }
}

/// One declared parameter.
#[derive(Debug, Clone, PartialEq)]
pub struct ParameterSpec {
    pub name: String,
    pub control: ControlKind,
    pub default: ParameterValue,
}

impl ParameterSpec {
    pub fn new(name: impl Into<String>, control: ControlKind, default: ParameterValue) -> Self {
        Self {
            name: name.into(),
            control,
            default,
        }
    }

    /// Defaults of every spec as a map; labels are skipped.
    pub fn defaults(specs: &[ParameterSpec]) -> ParameterMap {
        specs
            .iter()
            .filter(|s| s.control != ControlKind::Label)
            .map(|s| (s.name.clone(), s.default.clone()))
            .collect()
    }
}

/// Visibility of a parameter control.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum ControlStatus {
    #[default]
    Available,
    Hidden,
    Disabled,
}

impl ControlStatus {
    pub fn parse(s: &str) -> Option<ControlStatus> {
        match s.to_ascii_lowercase().as_str() {
            "available" => Some(ControlStatus::Available),
            "hidden" => Some(ControlStatus::Hidden),
            "disabled" => Some(ControlStatus::Disabled),
            _ => None,
        }
    }
}

/// A module's answer to a parameter change.
#[derive(Debug, Clone, PartialEq)]
pub struct ParameterChange {
    /// `false` rejects the change; the host keeps the previous values
    pub valid: bool,
    pub control_status: BTreeMap<String, ControlStatus>,
    pub parameters_to_change: ParameterMap,
}

impl Default for ParameterChange {
    fn default() -> Self {
        Self::accept()
    }
}

impl ParameterChange {
    pub fn accept() -> Self {
        Self {
            valid: true,
            control_status: BTreeMap::new(),
            parameters_to_change: ParameterMap::new(),
        }
    }

    pub fn reject() -> Self {
        Self {
            valid: false,
            ..Self::accept()
        }
    }

    pub fn with_status(mut self, name: impl Into<String>, status: ControlStatus) -> Self {
        self.control_status.insert(name.into(), status);
        self
    }

    pub fn with_change(mut self, name: impl Into<String>, value: ParameterValue) -> Self {
        self.parameters_to_change.insert(name, value);
        self
    }
}
