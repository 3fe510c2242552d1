//! Rhai-backed modules.
//!
//! A compiled module is bound to its kind's contract by checking that every
//! required entry point exists with the right arity. A missing required entry
//! point is a load error; optional ones fall back to the trait defaults.
//!
//! Values cross the boundary as Rhai maps and arrays:
//!
//! - parameter specs: `#{ name, kind, value, min, max, options }`, where
//!   `value` is the default value (`default` is reserved in Rhai but is
//!   accepted as a quoted key)
//! - parameter changes: `#{ valid, status: #{ name: "Hidden" }, changes: #{ name: value } }`
//! - coordinates: `#{ node_id: [x, y] }`
//! - plot primitives: `#{ type: "line", from: [x, y], to: [x, y], colour: [r, g, b, a], width }`,
//!   `#{ type: "circle", centre, radius, colour }`, `#{ type: "text", at, text, size, colour }`
//! - action outcomes: `#{ further_transformations: ["uuid"], message }` or a string

use super::compile::CompiledModule;
use super::contracts::*;
use super::descriptor::ModuleDescriptor;
use super::kind::{ModuleKind, GLOBAL_SETTINGS};
use super::ModuleError;
use crate::params::{
    Colour, ControlKind, ControlStatus, Dash, Font, Formatter, ParameterChange, ParameterMap, ParameterSpec,
    ParameterValue,
};
use crate::render::{LayerContent, Point, Primitive, Primitives};
use crate::scripting::{dynamic_to_json, json_to_dynamic, ScriptEngine};
use crate::tree::{NodeIdx, Tree, TreeCollection};
use rhai::{Array, Dynamic, FuncArgs, Scope, AST};
use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::Arc;
use uuid::Uuid;

/// A compiled script bound to one module kind.
pub struct ScriptModule {
    name: String,
    engine: Arc<ScriptEngine>,
    compiled: CompiledModule,
}

impl ScriptModule {
    fn ast(&self) -> &AST {
        self.compiled.ast()
    }

    fn has(&self, name: &str, arity: usize) -> bool {
        self.compiled.defines(name, arity)
    }

    fn call(&self, name: &str, args: impl FuncArgs) -> StageResult<Dynamic> {
        tracing::trace!("Calling {}::{}", self.name, name);
        self.engine
            .engine()
            .call_fn::<Dynamic>(&mut Scope::new(), self.ast(), name, args)
            .map_err(|e| StageError::new(format!("{}: {}", name, e)))
    }

    fn call_tree(&self, name: &str, args: impl FuncArgs) -> StageResult<Tree> {
        let result = self.call(name, args)?;
        let type_name = result.type_name();
        result
            .try_cast::<Tree>()
            .ok_or_else(|| StageError::new(format!("{} returned {} instead of a Tree", name, type_name)))
    }

    fn call_trees(&self, name: &str, args: impl FuncArgs) -> StageResult<Vec<Tree>> {
        let result = self.call(name, args)?;
        let items = result
            .try_cast::<Array>()
            .ok_or_else(|| StageError::new(format!("{} must return an array of trees", name)))?;
        items
            .into_iter()
            .map(|item| {
                item.try_cast::<Tree>()
                    .ok_or_else(|| StageError::new(format!("{} returned a non-tree element", name)))
            })
            .collect()
    }

    fn parameters(&self, input: Dynamic) -> Vec<ParameterSpec> {
        if !self.has("get_parameters", 1) {
            return Vec::new();
        }
        match self.call("get_parameters", (input,)) {
            Ok(result) => match dynamic_to_json(&result) {
                Value::Array(items) => items.iter().filter_map(spec_from_json).collect(),
                other => {
                    tracing::warn!("{}: get_parameters returned {}, expected an array", self.name, other);
                    Vec::new()
                }
            },
            Err(e) => {
                tracing::warn!("{}: {}", self.name, e);
                Vec::new()
            }
        }
    }

    fn parameter_change(&self, input: Dynamic, previous: &ParameterMap, current: &ParameterMap) -> ParameterChange {
        if !self.has("on_parameter_change", 3) {
            return ParameterChange::accept();
        }
        let prev = json_to_dynamic(&previous.to_json_object());
        let curr = json_to_dynamic(&current.to_json_object());
        match self.call("on_parameter_change", (input, prev, curr)) {
            Ok(result) => change_from_json(&dynamic_to_json(&result), current),
            Err(e) => {
                tracing::warn!("{}: {}", self.name, e);
                ParameterChange::accept()
            }
        }
    }

    fn outcome(&self, result: Dynamic) -> StageResult<ActionOutcome> {
        outcome_from_json(&dynamic_to_json(&result))
    }

    fn params_arg(params: &ParameterMap) -> Dynamic {
        json_to_dynamic(&params.to_json_object())
    }

    fn trees_arg(trees: impl IntoIterator<Item = Tree>) -> Dynamic {
        Dynamic::from_array(trees.into_iter().map(Dynamic::from).collect())
    }

    fn optional_tree_arg(tree: Option<&Tree>) -> Dynamic {
        tree.cloned().map(Dynamic::from).unwrap_or(Dynamic::UNIT)
    }
}

// ===== Conversions =====

fn point_from_json(value: &Value) -> Option<Point> {
    match value {
        Value::Array(xy) if xy.len() == 2 => Some(Point::new(xy[0].as_f64()?, xy[1].as_f64()?)),
        Value::Object(_) => Some(Point::new(value.get("x")?.as_f64()?, value.get("y")?.as_f64()?)),
        _ => None,
    }
}

fn colour_from_json(value: Option<&Value>) -> Colour {
    value
        .and_then(|v| serde_json::from_value::<Vec<u8>>(v.clone()).ok())
        .map(|c| match c.as_slice() {
            [r, g, b] => Colour::rgb(*r, *g, *b),
            [r, g, b, a] => Colour {
                r: *r,
                g: *g,
                b: *b,
                a: *a,
            },
            _ => Colour::BLACK,
        })
        .unwrap_or(Colour::BLACK)
}

/// Parse one `#{ name, kind, value, ... }` spec.
pub(crate) fn spec_from_json(value: &Value) -> Option<ParameterSpec> {
    let name = value.get("name")?.as_str()?.to_string();
    let kind = value.get("kind").and_then(Value::as_str).unwrap_or("text");
    let default = value
        .get("value")
        .or_else(|| value.get("default"))
        .unwrap_or(&Value::Null);
    let f64_or = |key: &str, d: f64| value.get(key).and_then(Value::as_f64).unwrap_or(d);
    let i64_or = |key: &str, d: i64| value.get(key).and_then(Value::as_i64).unwrap_or(d);

    let (control, template) = match kind {
        "checkbox" => (ControlKind::Checkbox, ParameterValue::Bool(false)),
        "integer" => (
            ControlKind::Integer {
                min: i64_or("min", i64::MIN),
                max: i64_or("max", i64::MAX),
            },
            ParameterValue::Int(0),
        ),
        "numeric" => (
            ControlKind::Numeric {
                min: f64_or("min", f64::MIN),
                max: f64_or("max", f64::MAX),
            },
            ParameterValue::Double(0.0),
        ),
        "choice" => (
            ControlKind::Choice {
                options: value
                    .get("options")
                    .and_then(|o| serde_json::from_value(o.clone()).ok())
                    .unwrap_or_default(),
            },
            ParameterValue::Int(0),
        ),
        "node" => (ControlKind::NodeSelector, ParameterValue::StringArray(Vec::new())),
        "attribute" => (ControlKind::AttributeSelector, ParameterValue::String(String::new())),
        "font" => (ControlKind::Font, ParameterValue::Font(Font::default())),
        "point" => (ControlKind::Point, ParameterValue::Point(Point::ORIGIN)),
        "colour" => (ControlKind::Colour, ParameterValue::Colour(Colour::BLACK)),
        "dash" => (ControlKind::Dash, ParameterValue::Dash(Dash::default())),
        "formatter" => {
            let formatter = match default {
                Value::String(source) => Formatter::script(source.clone()),
                Value::Object(_) => default
                    .get("decimals")
                    .and_then(Value::as_u64)
                    .map(|d| Formatter::decimals(d as usize))
                    .unwrap_or_default(),
                _ => Formatter::safe_default(),
            };
            return Some(ParameterSpec::new(name, ControlKind::Formatter, ParameterValue::Formatter(formatter)));
        }
        "attachment" => (ControlKind::Attachment, ParameterValue::Attachment(String::new())),
        "label" => return Some(ParameterSpec::new(name, ControlKind::Label, ParameterValue::Null)),
        _ => (ControlKind::Text, ParameterValue::String(String::new())),
    };

    let default = if default.is_null() {
        template
    } else {
        ParameterValue::from_json_like(&template, default).unwrap_or(template)
    };
    Some(ParameterSpec::new(name, control, default))
}

fn change_from_json(value: &Value, current: &ParameterMap) -> ParameterChange {
    let mut change = ParameterChange::accept();
    if let Some(valid) = value.get("valid").and_then(Value::as_bool) {
        change.valid = valid;
    }
    if let Some(Value::Object(status)) = value.get("status") {
        for (name, s) in status {
            if let Some(s) = s.as_str().and_then(ControlStatus::parse) {
                change.control_status.insert(name.clone(), s);
            }
        }
    }
    if let Some(Value::Object(changes)) = value.get("changes") {
        for (name, v) in changes {
            let converted = current
                .get(name)
                .and_then(|template| ParameterValue::from_json_like(template, v));
            match converted {
                Some(p) => {
                    change.parameters_to_change.insert(name.clone(), p);
                }
                None => tracing::warn!("Ignoring change to unknown or mistyped parameter '{}'", name),
            }
        }
    }
    change
}

fn outcome_from_json(value: &Value) -> StageResult<ActionOutcome> {
    match value {
        Value::Null => Ok(ActionOutcome::default()),
        Value::String(s) => Ok(ActionOutcome {
            further_transformations: Vec::new(),
            message: Some(s.clone()),
        }),
        Value::Object(_) => {
            let further_transformations = value
                .get("further_transformations")
                .and_then(Value::as_array)
                .map(|ids| {
                    ids.iter()
                        .filter_map(Value::as_str)
                        .map(|s| Uuid::parse_str(s).map_err(|e| StageError::new(format!("bad module id {}: {}", s, e))))
                        .collect::<StageResult<Vec<_>>>()
                })
                .transpose()?
                .unwrap_or_default();
            Ok(ActionOutcome {
                further_transformations,
                message: value.get("message").and_then(Value::as_str).map(str::to_string),
            })
        }
        other => Err(StageError::new(format!("unexpected action result {}", other))),
    }
}

fn primitive_from_json(value: &Value) -> Option<Primitive> {
    let colour = colour_from_json(value.get("colour"));
    match value.get("type")?.as_str()? {
        "line" => Some(Primitive::Line {
            from: point_from_json(value.get("from")?)?,
            to: point_from_json(value.get("to")?)?,
            colour,
            width: value.get("width").and_then(Value::as_f64).unwrap_or(1.0),
        }),
        "circle" => Some(Primitive::Circle {
            centre: point_from_json(value.get("centre")?)?,
            radius: value.get("radius").and_then(Value::as_f64).unwrap_or(2.0),
            colour,
        }),
        "text" => Some(Primitive::Text {
            at: point_from_json(value.get("at")?)?,
            text: value.get("text")?.as_str()?.to_string(),
            font: Font {
                size: value.get("size").and_then(Value::as_f64).unwrap_or(Font::default().size),
                ..Font::default()
            },
            colour,
        }),
        _ => None,
    }
}

// ===== Contract implementations =====

impl FileTypeModule for ScriptModule {
    fn extensions(&self) -> Vec<String> {
        self.call("extensions", ())
            .map(|r| match dynamic_to_json(&r) {
                Value::Array(items) => items.iter().filter_map(|v| v.as_str().map(str::to_string)).collect(),
                _ => Vec::new(),
            })
            .unwrap_or_default()
    }

    fn is_supported(&self, file_name: &str, header: &str) -> i64 {
        self.call("is_supported", (file_name.to_string(), header.to_string()))
            .ok()
            .and_then(|r| r.as_int().ok())
            .unwrap_or(0)
    }

    fn open(&self, file_name: &str, text: &str, progress: Progress<'_>) -> StageResult<Vec<Tree>> {
        let trees = self.call_trees("open", (file_name.to_string(), text.to_string()))?;
        progress(1.0);
        Ok(trees)
    }
}

impl LoadFileModule for ScriptModule {
    fn get_parameters(&self, file_name: &str) -> Vec<ParameterSpec> {
        self.parameters(Dynamic::from(file_name.to_string()))
    }

    fn on_parameter_change(&self, previous: &ParameterMap, current: &ParameterMap) -> ParameterChange {
        self.parameter_change(Dynamic::UNIT, previous, current)
    }

    fn load(&self, trees: Vec<Tree>, params: &ParameterMap, progress: Progress<'_>) -> StageResult<TreeCollection> {
        let loaded = self.call_trees("load", (Self::trees_arg(trees), Self::params_arg(params)))?;
        progress(1.0);
        Ok(TreeCollection::new(loaded))
    }
}

impl TransformerModule for ScriptModule {
    fn get_parameters(&self, trees: &TreeCollection) -> Vec<ParameterSpec> {
        self.parameters(Self::trees_arg(trees.iter().cloned()))
    }

    fn on_parameter_change(&self, trees: &TreeCollection, previous: &ParameterMap, current: &ParameterMap) -> ParameterChange {
        self.parameter_change(Self::trees_arg(trees.iter().cloned()), previous, current)
    }

    fn transform(&self, trees: &TreeCollection, params: &ParameterMap, progress: Progress<'_>) -> StageResult<Tree> {
        let tree = self.call_tree("transform", (Self::trees_arg(trees.iter().cloned()), Self::params_arg(params)))?;
        progress(1.0);
        Ok(tree)
    }
}

impl FurtherTransformationModule for ScriptModule {
    fn get_parameters(&self, tree: &Tree) -> Vec<ParameterSpec> {
        self.parameters(Dynamic::from(tree.clone()))
    }

    fn on_parameter_change(&self, tree: &Tree, previous: &ParameterMap, current: &ParameterMap) -> ParameterChange {
        self.parameter_change(Dynamic::from(tree.clone()), previous, current)
    }

    fn execute(&self, tree: &mut Tree, params: &ParameterMap, progress: Progress<'_>) -> StageResult<()> {
        *tree = self.call_tree("transform", (tree.clone(), Self::params_arg(params)))?;
        progress(1.0);
        Ok(())
    }
}

impl CoordinatesModule for ScriptModule {
    fn get_parameters(&self, tree: &Tree) -> Vec<ParameterSpec> {
        self.parameters(Dynamic::from(tree.clone()))
    }

    fn on_parameter_change(&self, tree: &Tree, previous: &ParameterMap, current: &ParameterMap) -> ParameterChange {
        self.parameter_change(Dynamic::from(tree.clone()), previous, current)
    }

    fn compute(&self, tree: &Tree, params: &ParameterMap, progress: Progress<'_>) -> StageResult<Coordinates> {
        let result = self.call("coordinates", (tree.clone(), Self::params_arg(params)))?;
        let Value::Object(entries) = dynamic_to_json(&result) else {
            return Err(StageError::new("coordinates must return a map of node id to [x, y]"));
        };
        let mut coordinates = Coordinates::new();
        for (id, value) in &entries {
            let point = point_from_json(value)
                .ok_or_else(|| StageError::new(format!("invalid coordinates for node {}", id)))?;
            coordinates.insert(id.clone(), point);
        }
        progress(1.0);
        Ok(coordinates)
    }
}

impl PlotActionModule for ScriptModule {
    fn get_parameters(&self, tree: &Tree) -> Vec<ParameterSpec> {
        self.parameters(Dynamic::from(tree.clone()))
    }

    fn on_parameter_change(&self, tree: &Tree, previous: &ParameterMap, current: &ParameterMap) -> ParameterChange {
        self.parameter_change(Dynamic::from(tree.clone()), previous, current)
    }

    fn plot(&self, context: &PlotContext<'_>, params: &ParameterMap, progress: Progress<'_>) -> StageResult<Arc<dyn LayerContent>> {
        let coords: serde_json::Map<String, Value> = context
            .coordinates
            .iter()
            .map(|(id, p)| (id.clone(), serde_json::json!([p.x, p.y])))
            .collect();
        let result = self.call(
            "plot",
            (context.tree.clone(), json_to_dynamic(&Value::Object(coords)), Self::params_arg(params)),
        )?;
        let Value::Array(items) = dynamic_to_json(&result) else {
            return Err(StageError::new("plot must return an array of primitives"));
        };
        let mut primitives = Primitives::new();
        for item in &items {
            match primitive_from_json(item) {
                Some(p) => primitives.push(p),
                None => return Err(StageError::new(format!("invalid primitive {}", item))),
            }
        }
        progress(1.0);
        Ok(Arc::new(primitives))
    }
}

impl SelectionActionModule for ScriptModule {
    fn is_available(&self, tree: &Tree, node: NodeIdx) -> bool {
        if !self.has("is_available", 2) {
            return true;
        }
        self.call("is_available", (tree.clone(), node.0 as i64))
            .ok()
            .and_then(|r| r.as_bool().ok())
            .unwrap_or(false)
    }

    fn perform(&self, tree: &Tree, node: NodeIdx) -> StageResult<ActionOutcome> {
        let result = self.call("perform", (tree.clone(), node.0 as i64))?;
        self.outcome(result)
    }
}

fn enabled(module: &ScriptModule, tree: Option<&Tree>) -> bool {
    if !module.has("is_enabled", 1) {
        return true;
    }
    module
        .call("is_enabled", (ScriptModule::optional_tree_arg(tree),))
        .ok()
        .and_then(|r| r.as_bool().ok())
        .unwrap_or(false)
}

impl ActionModule for ScriptModule {
    fn is_enabled(&self, tree: Option<&Tree>) -> bool {
        enabled(self, tree)
    }

    fn perform(&self, tree: Option<&Tree>) -> StageResult<ActionOutcome> {
        let result = self.call("perform", (Self::optional_tree_arg(tree),))?;
        self.outcome(result)
    }
}

impl MenuActionModule for ScriptModule {
    fn is_enabled(&self, tree: Option<&Tree>) -> bool {
        enabled(self, tree)
    }

    fn perform(&self, tree: Option<&Tree>) -> StageResult<ActionOutcome> {
        let result = self.call("perform", (Self::optional_tree_arg(tree),))?;
        self.outcome(result)
    }
}

// ===== Binding =====

/// Bind `compiled` to its descriptor's kind.
///
/// Returns the implementation and the module's default settings.
pub fn bind(
    engine: Arc<ScriptEngine>,
    descriptor: &ModuleDescriptor,
    compiled: CompiledModule,
) -> Result<(ModuleImpl, BTreeMap<String, Value>), ModuleError> {
    for entry in descriptor.kind.entry_points() {
        if entry.required && !compiled.has_entry_point(entry) {
            return Err(ModuleError::MissingEntryPoint {
                module: descriptor.name.clone(),
                name: entry.name.to_string(),
                arity: entry.arity,
            });
        }
    }

    let module = Arc::new(ScriptModule {
        name: descriptor.name.clone(),
        engine,
        compiled,
    });

    let defaults = if module.has(GLOBAL_SETTINGS.name, GLOBAL_SETTINGS.arity) {
        match module.call(GLOBAL_SETTINGS.name, ()).map(|r| dynamic_to_json(&r)) {
            Ok(Value::Object(map)) => map.into_iter().collect(),
            Ok(_) => BTreeMap::new(),
            Err(e) => {
                tracing::warn!("{}: {}", descriptor.name, e);
                BTreeMap::new()
            }
        }
    } else {
        BTreeMap::new()
    };

    let implementation = match descriptor.kind {
        ModuleKind::FileType => ModuleImpl::FileType(module),
        ModuleKind::LoadFile => ModuleImpl::LoadFile(module),
        ModuleKind::Transformer => ModuleImpl::Transformer(module),
        ModuleKind::FurtherTransformation => ModuleImpl::FurtherTransformation(module),
        ModuleKind::Coordinates => ModuleImpl::Coordinates(module),
        ModuleKind::PlotAction => ModuleImpl::PlotAction(module),
        ModuleKind::SelectionAction => ModuleImpl::SelectionAction(module),
        ModuleKind::Action => ModuleImpl::Action(module),
        ModuleKind::MenuAction => ModuleImpl::MenuAction(module),
    };
    tracing::debug!("Bound {} as {}", descriptor.name, descriptor.kind);
    Ok((implementation, defaults))
}
