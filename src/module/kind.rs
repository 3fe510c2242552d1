//! The closed set of module kinds and the script entry points each one binds.

use serde::{Deserialize, Serialize};

/// Named script function a module of a given kind may define.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EntryPoint {
    pub name: &'static str,
    pub arity: usize,
    pub required: bool,
}

const fn required(name: &'static str, arity: usize) -> EntryPoint {
    EntryPoint {
        name,
        arity,
        required: true,
    }
}

const fn optional(name: &'static str, arity: usize) -> EntryPoint {
    EntryPoint {
        name,
        arity,
        required: false,
    }
}

/// Optional on every kind: module default settings.
pub const GLOBAL_SETTINGS: EntryPoint = optional("global_settings", 0);

/// Capability contract a module implements.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum ModuleKind {
    /// Recognises and parses a tree file format.
    FileType,
    /// Turns parsed trees into the loaded collection (Load stage).
    LoadFile,
    /// Reduces the collection to one tree (Transform stage).
    Transformer,
    /// Mutates the working tree (FurtherTransform stages).
    FurtherTransformation,
    /// Assigns a position to every node (Coordinate stage).
    Coordinates,
    /// Draws one layer (Plot stages).
    PlotAction,
    /// Acts on the selected node.
    SelectionAction,
    /// Host-triggered action on the current tree.
    Action,
    /// Menu-triggered action on the current tree.
    MenuAction,
}

impl ModuleKind {
    /// Get the display name for this kind.
    pub fn display_name(&self) -> &'static str {
        match self {
            ModuleKind::FileType => "File type",
            ModuleKind::LoadFile => "Load file",
            ModuleKind::Transformer => "Transformer",
            ModuleKind::FurtherTransformation => "Further transformation",
            ModuleKind::Coordinates => "Coordinates",
            ModuleKind::PlotAction => "Plot action",
            ModuleKind::SelectionAction => "Selection action",
            ModuleKind::Action => "Action",
            ModuleKind::MenuAction => "Menu action",
        }
    }

    /// Get all module kinds.
    pub fn all() -> &'static [ModuleKind] {
        &[
            ModuleKind::FileType,
            ModuleKind::LoadFile,
            ModuleKind::Transformer,
            ModuleKind::FurtherTransformation,
            ModuleKind::Coordinates,
            ModuleKind::PlotAction,
            ModuleKind::SelectionAction,
            ModuleKind::Action,
            ModuleKind::MenuAction,
        ]
    }

    /// Check if modules of this kind occupy a pipeline stage.
    pub fn is_stage(&self) -> bool {
        matches!(
            self,
            ModuleKind::LoadFile
                | ModuleKind::Transformer
                | ModuleKind::FurtherTransformation
                | ModuleKind::Coordinates
                | ModuleKind::PlotAction
        )
    }

    /// Settings namespace module defaults are merged into.
    pub fn settings_namespace(&self) -> &'static str {
        self.display_name()
    }

    /// Get a detailed description of what modules of this kind do.
    pub fn description(&self) -> &'static str {
        match self {
            ModuleKind::FileType => {
                "Recognises a tree file format.\n\
                 Reports a confidence for a file name and header.\n\
                 Parses file text into trees."
            }
            ModuleKind::LoadFile => {
                "Produces the loaded tree collection.\n\
                 Runs once per full recompute."
            }
            ModuleKind::Transformer => {
                "Reduces the loaded collection to a single tree.\n\
                 For example by picking one tree or building a consensus."
            }
            ModuleKind::FurtherTransformation => {
                "Edits the working tree.\n\
                 Runs in order; each stage sees the previous stage's output."
            }
            ModuleKind::Coordinates => {
                "Computes a position for every node of the final tree."
            }
            ModuleKind::PlotAction => {
                "Draws one layer from the final tree and its coordinates."
            }
            ModuleKind::SelectionAction => {
                "Acts on the currently selected node."
            }
            ModuleKind::Action => {
                "Performs an action on the current tree.\n\
                 May request extra further transformations."
            }
            ModuleKind::MenuAction => {
                "Performs a menu action on the current tree.\n\
                 May request extra further transformations."
            }
        }
    }

    /// Script functions bound for this kind, excluding [`GLOBAL_SETTINGS`].
    pub fn entry_points(&self) -> &'static [EntryPoint] {
        match self {
            ModuleKind::FileType => FILE_TYPE_ENTRY_POINTS,
            ModuleKind::LoadFile => LOAD_FILE_ENTRY_POINTS,
            ModuleKind::Transformer | ModuleKind::FurtherTransformation => TRANSFORM_ENTRY_POINTS,
            ModuleKind::Coordinates => COORDINATES_ENTRY_POINTS,
            ModuleKind::PlotAction => PLOT_ENTRY_POINTS,
            ModuleKind::SelectionAction => SELECTION_ACTION_ENTRY_POINTS,
            ModuleKind::Action | ModuleKind::MenuAction => ACTION_ENTRY_POINTS,
        }
    }
}

const FILE_TYPE_ENTRY_POINTS: &[EntryPoint] = &[
    required("extensions", 0),
    required("is_supported", 2),
    required("open", 2),
];

const LOAD_FILE_ENTRY_POINTS: &[EntryPoint] = &[
    optional("get_parameters", 1),
    optional("on_parameter_change", 3),
    required("load", 2),
];

const TRANSFORM_ENTRY_POINTS: &[EntryPoint] = &[
    required("get_parameters", 1),
    optional("on_parameter_change", 3),
    required("transform", 2),
];

const COORDINATES_ENTRY_POINTS: &[EntryPoint] = &[
    required("get_parameters", 1),
    optional("on_parameter_change", 3),
    required("coordinates", 2),
];

const PLOT_ENTRY_POINTS: &[EntryPoint] = &[
    required("get_parameters", 1),
    optional("on_parameter_change", 3),
    required("plot", 3),
];

const SELECTION_ACTION_ENTRY_POINTS: &[EntryPoint] = &[optional("is_available", 2), required("perform", 2)];

const ACTION_ENTRY_POINTS: &[EntryPoint] = &[optional("is_enabled", 1), required("perform", 1)];

impl std::fmt::Display for ModuleKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.display_name())
    }
}
