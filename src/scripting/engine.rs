//! Rhai Script Engine Implementation
//!
//! This module provides the engine shared by every script module and script
//! formatter. It registers the tree API and sets safety limits.
//!
//! ## Tree API
//!
//! Node handles are integer indices; `-1` means "no node".
//!
//! - `new_tree()` / `parse_newick(text)` / `tree.to_newick()`
//! - `tree.root()`, `tree.node_count()`, `tree.children(n)`, `tree.parent(n)`
//! - `tree.add_child(n, name)`, `tree.is_leaf(n)`, `tree.leaves(n)`
//! - `tree.name(n)`, `tree.set_name(n, name)`, `tree.length(n)`, `tree.set_length(n, x)`
//! - `tree.get_attribute(n, attr)`, `tree.set_attribute(n, attr, value)`
//! - `tree.attribute_names()`, `tree.find_by_name(name)`, `tree.node_id(n)`
//! - `tree.root_distance(n)`

use crate::tree::{parse_newick, write_newick, AttributeValue, NodeIdx, Tree, ATTR_LENGTH};
use rhai::{Array, Dynamic, Engine, EvalAltResult, Map, Position};

type FnResult<T> = Result<T, Box<EvalAltResult>>;

fn runtime_error(message: impl Into<String>) -> Box<EvalAltResult> {
    EvalAltResult::ErrorRuntime(Dynamic::from(message.into()), Position::NONE).into()
}

fn node_handle(tree: &Tree, n: i64) -> FnResult<NodeIdx> {
    if n < 0 || n as usize >= tree.len() {
        return Err(runtime_error(format!(
            "node {} out of range (tree has {} nodes)",
            n,
            tree.len()
        )));
    }
    Ok(NodeIdx(n as u32))
}

fn handles(nodes: impl IntoIterator<Item = NodeIdx>) -> Array {
    nodes
        .into_iter()
        .map(|i| Dynamic::from(i.0 as i64))
        .collect()
}

/// Convert an attribute to a script value; `()` for none.
pub fn attribute_to_dynamic(value: Option<AttributeValue>) -> Dynamic {
    match value {
        Some(AttributeValue::Text(s)) => Dynamic::from(s),
        Some(AttributeValue::Number(n)) => Dynamic::from(n),
        None => Dynamic::UNIT,
    }
}

/// Convert a script value to an attribute; `()` clears it.
pub fn dynamic_to_attribute(value: Dynamic) -> Option<AttributeValue> {
    if value.is_unit() {
        None
    } else if let Ok(n) = value.as_float() {
        Some(AttributeValue::Number(n))
    } else if let Ok(n) = value.as_int() {
        Some(AttributeValue::Number(n as f64))
    } else {
        Some(AttributeValue::Text(value.to_string()))
    }
}

/// Convert JSON to a script value: objects become maps, arrays arrays.
pub fn json_to_dynamic(value: &serde_json::Value) -> Dynamic {
    use serde_json::Value;
    match value {
        Value::Null => Dynamic::UNIT,
        Value::Bool(b) => Dynamic::from(*b),
        Value::Number(n) => match n.as_i64() {
            Some(i) => Dynamic::from(i),
            None => Dynamic::from(n.as_f64().unwrap_or(0.0)),
        },
        Value::String(s) => Dynamic::from(s.clone()),
        Value::Array(items) => Dynamic::from_array(items.iter().map(json_to_dynamic).collect()),
        Value::Object(fields) => {
            let mut map = Map::new();
            for (k, v) in fields {
                map.insert(k.as_str().into(), json_to_dynamic(v));
            }
            Dynamic::from_map(map)
        }
    }
}

/// Convert a script value to JSON. Custom types become their display string.
pub fn dynamic_to_json(value: &Dynamic) -> serde_json::Value {
    use serde_json::Value;
    if value.is_unit() {
        Value::Null
    } else if let Ok(b) = value.as_bool() {
        Value::Bool(b)
    } else if let Ok(i) = value.as_int() {
        Value::from(i)
    } else if let Ok(f) = value.as_float() {
        Value::from(f)
    } else if value.is_string() || value.is_char() {
        Value::String(value.to_string())
    } else if let Some(items) = value.clone().try_cast::<Array>() {
        Value::Array(items.iter().map(dynamic_to_json).collect())
    } else if let Some(map) = value.clone().try_cast::<Map>() {
        Value::Object(
            map.iter()
                .map(|(k, v)| (k.to_string(), dynamic_to_json(v)))
                .collect(),
        )
    } else {
        Value::String(value.to_string())
    }
}

/// The script engine shared by all script modules.
pub struct ScriptEngine {
    /// The Rhai engine instance
    engine: Engine,
}

impl ScriptEngine {
    /// Create a new script engine with the tree API registered
    pub fn new() -> Self {
        let mut engine = Engine::new();
        Self::configure_engine(&mut engine);
        Self { engine }
    }

    /// Access the underlying Rhai engine
    pub fn engine(&self) -> &Engine {
        &self.engine
    }

    /// Check that `source` parses
    pub fn validate(&self, source: &str) -> crate::error::Result<()> {
        self.engine
            .compile(source)
            .map(|_| ())
            .map_err(|e| crate::error::TreeVisError::Script(format!("Compilation error: {}", e)))
    }

    /// Configure the Rhai engine with the tree API and safety limits
    fn configure_engine(engine: &mut Engine) {
        // Set safety limits
        engine.set_max_expr_depths(128, 128);
        engine.set_max_call_levels(64);
        engine.set_max_operations(10_000_000);
        engine.set_max_string_size(10_000_000);
        engine.set_max_array_size(1_000_000);
        engine.set_max_map_size(1_000_000);

        engine.register_type_with_name::<Tree>("Tree");

        engine.register_fn("new_tree", Tree::new);
        engine.register_fn("parse_newick", |text: &str| -> FnResult<Tree> {
            parse_newick(text).map_err(|e| runtime_error(e.to_string()))
        });
        engine.register_fn("to_newick", |tree: &mut Tree| -> String { write_newick(tree) });

        // ===== Structure =====

        engine.register_fn("root", |tree: &mut Tree| -> i64 { tree.root().0 as i64 });
        engine.register_fn("node_count", |tree: &mut Tree| -> i64 { tree.len() as i64 });
        engine.register_fn("children", |tree: &mut Tree, n: i64| -> FnResult<Array> {
            let idx = node_handle(tree, n)?;
            Ok(handles(tree.children(idx).iter().copied()))
        });
        engine.register_fn("parent", |tree: &mut Tree, n: i64| -> FnResult<i64> {
            let idx = node_handle(tree, n)?;
            Ok(tree.parent(idx).map(|p| p.0 as i64).unwrap_or(-1))
        });
        engine.register_fn("is_leaf", |tree: &mut Tree, n: i64| -> FnResult<bool> {
            let idx = node_handle(tree, n)?;
            Ok(tree.children(idx).is_empty())
        });
        engine.register_fn("leaves", |tree: &mut Tree, n: i64| -> FnResult<Array> {
            let idx = node_handle(tree, n)?;
            Ok(handles(tree.leaves(idx)))
        });
        engine.register_fn(
            "add_child",
            |tree: &mut Tree, n: i64, name: &str| -> FnResult<i64> {
                let idx = node_handle(tree, n)?;
                Ok(tree.add_named_child(idx, name).0 as i64)
            },
        );
        engine.register_fn("find_by_name", |tree: &mut Tree, name: &str| -> Array {
            handles(tree.find_by_name(name))
        });
        engine.register_fn("node_id", |tree: &mut Tree, n: i64| -> FnResult<String> {
            let idx = node_handle(tree, n)?;
            Ok(tree.get(idx).map(|node| node.id.clone()).unwrap_or_default())
        });
        engine.register_fn("root_distance", |tree: &mut Tree, n: i64| -> FnResult<f64> {
            let idx = node_handle(tree, n)?;
            Ok(tree.root_distance(idx))
        });

        // ===== Attributes =====

        engine.register_fn("name", |tree: &mut Tree, n: i64| -> FnResult<Dynamic> {
            let idx = node_handle(tree, n)?;
            Ok(tree
                .get(idx)
                .and_then(|node| node.name.clone())
                .map(Dynamic::from)
                .unwrap_or(Dynamic::UNIT))
        });
        engine.register_fn(
            "set_name",
            |tree: &mut Tree, n: i64, name: &str| -> FnResult<()> {
                let idx = node_handle(tree, n)?;
                if let Some(node) = tree.get_mut(idx) {
                    node.name = Some(name.to_string());
                }
                Ok(())
            },
        );
        engine.register_fn("length", |tree: &mut Tree, n: i64| -> FnResult<Dynamic> {
            let idx = node_handle(tree, n)?;
            Ok(attribute_to_dynamic(tree.attribute(idx, ATTR_LENGTH)))
        });
        engine.register_fn(
            "set_length",
            |tree: &mut Tree, n: i64, length: f64| -> FnResult<()> {
                let idx = node_handle(tree, n)?;
                if let Some(node) = tree.get_mut(idx) {
                    node.length = Some(length);
                }
                Ok(())
            },
        );
        engine.register_fn(
            "get_attribute",
            |tree: &mut Tree, n: i64, attr: &str| -> FnResult<Dynamic> {
                let idx = node_handle(tree, n)?;
                Ok(attribute_to_dynamic(tree.attribute(idx, attr)))
            },
        );
        engine.register_fn(
            "set_attribute",
            |tree: &mut Tree, n: i64, attr: &str, value: Dynamic| -> FnResult<()> {
                let idx = node_handle(tree, n)?;
                tree.set_attribute(idx, attr, dynamic_to_attribute(value))
                    .map_err(runtime_error)
            },
        );
        engine.register_fn("attribute_names", |tree: &mut Tree| -> Array {
            tree.attribute_names().into_iter().map(Dynamic::from).collect()
        });
    }
}

impl Default for ScriptEngine {
    fn default() -> Self {
        Self::new()
    }
}
