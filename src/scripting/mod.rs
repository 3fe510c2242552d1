//! Rhai scripting for stage modules and label formatters
//!
//! Module source code and reference libraries are Rhai scripts compiled by the
//! shared [`ScriptEngine`]. Scripts see the tree through an index-based API
//! (see [`engine`]).
//!
//! ## Example: a further transformation module
//!
//! ```rhai
//! fn get_parameters(tree) {
//!     [ #{ name: "Suffix", kind: "text", value: "_x" } ]
//! }
//!
//! fn on_parameter_change(tree, previous, current) {
//!     #{ valid: true }
//! }
//!
//! fn transform(tree, params) {
//!     for leaf in tree.leaves(tree.root()) {
//!         tree.set_name(leaf, tree.name(leaf) + params["Suffix"]);
//!     }
//!     tree
//! }
//! ```
//!
//! ## Example: a formatter
//!
//! ```rhai
//! fn format(value) {
//!     if value == () { () } else { "~" + value }
//! }
//! ```

mod engine;

pub use engine::{
    attribute_to_dynamic, dynamic_to_attribute, dynamic_to_json, json_to_dynamic, ScriptEngine,
};
