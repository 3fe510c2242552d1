//! Stage parameters
//!
//! Every stage carries a [`ParameterMap`]. At the serialization boundary each
//! parameter is a `[name, typeTag, serializedValue]` triple where `typeTag` is
//! one of the closed set in [`TypeTag`] and `serializedValue` is always a
//! string. Decoding never aborts: a malformed entry is reported as a
//! [`ParameterDecodeError`] and the caller substitutes the schema default.
//!
//! Formatter parameters decode to an *inert* form. Their source only becomes
//! executable through [`ParameterMap::authorize_formatters`].

pub mod formatter;
pub mod schema;

pub use formatter::{Formatter, ScriptFormatter};
pub use schema::{ControlKind, ControlStatus, ParameterChange, ParameterSpec};

use crate::render::Point;
use crate::scripting::ScriptEngine;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::fmt;
use thiserror::Error;

/// A font choice.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Font {
    pub family: String,
    pub size: f64,
}

impl Default for Font {
    fn default() -> Self {
        Self {
            family: "Helvetica".to_string(),
            size: 10.0,
        }
    }
}

/// RGBA colour, 8 bits per channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Colour {
    pub r: u8,
    pub g: u8,
    pub b: u8,
    pub a: u8,
}

impl Colour {
    pub const BLACK: Colour = Colour::rgb(0, 0, 0);

    pub const fn rgb(r: u8, g: u8, b: u8) -> Self {
        Self { r, g, b, a: 255 }
    }
}

/// Line dash pattern.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct Dash {
    pub units_on: f64,
    pub units_off: f64,
    pub phase: f64,
}

/// The closed set of parameter type tags.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TypeTag {
    Null,
    Bool,
    Int,
    Double,
    String,
    StringArray,
    Font,
    Point,
    Colour,
    Dash,
    Formatter,
    Attachment,
}

impl TypeTag {
    pub fn as_str(self) -> &'static str {
        match self {
            TypeTag::Null => "null",
            TypeTag::Bool => "bool",
            TypeTag::Int => "int",
            TypeTag::Double => "double",
            TypeTag::String => "string",
            TypeTag::StringArray => "string[]",
            TypeTag::Font => "font",
            TypeTag::Point => "point",
            TypeTag::Colour => "colour",
            TypeTag::Dash => "dash",
            TypeTag::Formatter => "formatter",
            TypeTag::Attachment => "attachment",
        }
    }

    pub fn parse(tag: &str) -> Option<TypeTag> {
        Some(match tag {
            "null" => TypeTag::Null,
            "bool" => TypeTag::Bool,
            "int" => TypeTag::Int,
            "double" => TypeTag::Double,
            "string" => TypeTag::String,
            "string[]" => TypeTag::StringArray,
            "font" => TypeTag::Font,
            "point" => TypeTag::Point,
            "colour" => TypeTag::Colour,
            "dash" => TypeTag::Dash,
            "formatter" => TypeTag::Formatter,
            "attachment" => TypeTag::Attachment,
            _ => return None,
        })
    }
}

impl fmt::Display for TypeTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A single parameter value.
#[derive(Debug, Clone, PartialEq)]
pub enum ParameterValue {
    Null,
    Bool(bool),
    Int(i64),
    Double(f64),
    String(String),
    StringArray(Vec<String>),
    Font(Font),
    Point(Point),
    Colour(Colour),
    Dash(Dash),
    Formatter(Formatter),
    /// Name of an attachment stored with the pipeline
    Attachment(String),
}

impl ParameterValue {
    pub fn type_tag(&self) -> TypeTag {
        match self {
            ParameterValue::Null => TypeTag::Null,
            ParameterValue::Bool(_) => TypeTag::Bool,
            ParameterValue::Int(_) => TypeTag::Int,
            ParameterValue::Double(_) => TypeTag::Double,
            ParameterValue::String(_) => TypeTag::String,
            ParameterValue::StringArray(_) => TypeTag::StringArray,
            ParameterValue::Font(_) => TypeTag::Font,
            ParameterValue::Point(_) => TypeTag::Point,
            ParameterValue::Colour(_) => TypeTag::Colour,
            ParameterValue::Dash(_) => TypeTag::Dash,
            ParameterValue::Formatter(_) => TypeTag::Formatter,
            ParameterValue::Attachment(_) => TypeTag::Attachment,
        }
    }

    /// Serialize the value part of the `[name, tag, value]` triple.
    pub fn serialize_value(&self) -> String {
        match self {
            ParameterValue::Null => String::new(),
            ParameterValue::Bool(b) => b.to_string(),
            ParameterValue::Int(i) => i.to_string(),
            ParameterValue::Double(d) => d.to_string(),
            ParameterValue::String(s) | ParameterValue::Attachment(s) => s.clone(),
            ParameterValue::StringArray(v) => json_string(v),
            ParameterValue::Font(f) => json_string(f),
            ParameterValue::Point(p) => json_string(&[p.x, p.y]),
            ParameterValue::Colour(c) => json_string(&[c.r, c.g, c.b, c.a]),
            ParameterValue::Dash(d) => json_string(&[d.units_on, d.units_off, d.phase]),
            ParameterValue::Formatter(f) => json_string(&f.to_record()),
        }
    }

    /// Parse the value part of a triple.
    pub fn deserialize_value(tag: TypeTag, raw: &str) -> Result<ParameterValue, String> {
        let value = match tag {
            TypeTag::Null => ParameterValue::Null,
            TypeTag::Bool => ParameterValue::Bool(raw.parse().map_err(|e| format!("{}", e))?),
            TypeTag::Int => ParameterValue::Int(raw.parse().map_err(|e| format!("{}", e))?),
            TypeTag::Double => ParameterValue::Double(raw.parse().map_err(|e| format!("{}", e))?),
            TypeTag::String => ParameterValue::String(raw.to_string()),
            TypeTag::Attachment => ParameterValue::Attachment(raw.to_string()),
            TypeTag::StringArray => ParameterValue::StringArray(from_json(raw)?),
            TypeTag::Font => ParameterValue::Font(from_json(raw)?),
            TypeTag::Point => {
                let [x, y]: [f64; 2] = from_json(raw)?;
                ParameterValue::Point(Point::new(x, y))
            }
            TypeTag::Colour => {
                let [r, g, b, a]: [u8; 4] = from_json(raw)?;
                ParameterValue::Colour(Colour { r, g, b, a })
            }
            TypeTag::Dash => {
                let [units_on, units_off, phase]: [f64; 3] = from_json(raw)?;
                ParameterValue::Dash(Dash {
                    units_on,
                    units_off,
                    phase,
                })
            }
            TypeTag::Formatter => ParameterValue::Formatter(Formatter::from_record(from_json(raw)?)),
        };
        Ok(value)
    }

    /// Convert to a JSON value for script modules and settings.
    pub fn to_json(&self) -> Value {
        match self {
            ParameterValue::Null => Value::Null,
            ParameterValue::Bool(b) => Value::Bool(*b),
            ParameterValue::Int(i) => Value::from(*i),
            ParameterValue::Double(d) => Value::from(*d),
            ParameterValue::String(s) | ParameterValue::Attachment(s) => Value::String(s.clone()),
            ParameterValue::StringArray(v) => Value::from(v.clone()),
            ParameterValue::Font(f) => serde_json::json!({ "family": f.family, "size": f.size }),
            ParameterValue::Point(p) => serde_json::json!({ "x": p.x, "y": p.y }),
            ParameterValue::Colour(c) => serde_json::json!([c.r, c.g, c.b, c.a]),
            ParameterValue::Dash(d) => serde_json::json!([d.units_on, d.units_off, d.phase]),
            ParameterValue::Formatter(f) => serde_json::to_value(f.to_record()).unwrap_or(Value::Null),
        }
    }

    /// Convert a JSON value to a parameter of the same type as `template`.
    pub fn from_json_like(template: &ParameterValue, value: &Value) -> Option<ParameterValue> {
        Some(match template {
            ParameterValue::Null => ParameterValue::Null,
            ParameterValue::Bool(_) => ParameterValue::Bool(value.as_bool()?),
            ParameterValue::Int(_) => ParameterValue::Int(
                value.as_i64().or_else(|| value.as_f64().map(|f| f.round() as i64))?,
            ),
            ParameterValue::Double(_) => ParameterValue::Double(value.as_f64()?),
            ParameterValue::String(_) => ParameterValue::String(value.as_str()?.to_string()),
            ParameterValue::Attachment(_) => ParameterValue::Attachment(value.as_str()?.to_string()),
            ParameterValue::StringArray(_) => ParameterValue::StringArray(
                serde_json::from_value(value.clone()).ok()?,
            ),
            ParameterValue::Font(_) => ParameterValue::Font(serde_json::from_value(value.clone()).ok()?),
            ParameterValue::Point(_) => {
                let x = value.get("x")?.as_f64()?;
                let y = value.get("y")?.as_f64()?;
                ParameterValue::Point(Point::new(x, y))
            }
            ParameterValue::Colour(_) => {
                let [r, g, b, a]: [u8; 4] = serde_json::from_value(value.clone()).ok()?;
                ParameterValue::Colour(Colour { r, g, b, a })
            }
            ParameterValue::Dash(_) => {
                let [units_on, units_off, phase]: [f64; 3] = serde_json::from_value(value.clone()).ok()?;
                ParameterValue::Dash(Dash {
                    units_on,
                    units_off,
                    phase,
                })
            }
            // Formatters never come back from scripts in executable form
            ParameterValue::Formatter(_) => ParameterValue::Formatter(Formatter::from_record(
                serde_json::from_value(value.clone()).ok()?,
            )),
        })
    }
}

fn json_string<T: Serialize + ?Sized>(value: &T) -> String {
    serde_json::to_string(value).unwrap_or_default()
}

fn from_json<T: for<'de> Deserialize<'de>>(raw: &str) -> Result<T, String> {
    serde_json::from_str(raw).map_err(|e| e.to_string())
}

/// Failure to decode one encoded parameter.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ParameterDecodeError {
    #[error("parameter list is not a JSON array")]
    NotAnArray,

    #[error("entry {index} is not a [name, type, value] triple")]
    MalformedEntry { index: usize },

    #[error("parameter '{name}' has unknown type tag '{tag}'")]
    UnknownType { name: String, tag: String },

    #[error("parameter '{name}' ({tag}) has an invalid value: {message}")]
    InvalidValue {
        name: String,
        tag: TypeTag,
        message: String,
    },
}

impl ParameterDecodeError {
    /// Name of the parameter this error refers to, if known.
    pub fn parameter_name(&self) -> Option<&str> {
        match self {
            ParameterDecodeError::UnknownType { name, .. }
            | ParameterDecodeError::InvalidValue { name, .. } => Some(name),
            _ => None,
        }
    }
}

/// Named parameters of one stage.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct ParameterMap {
    values: BTreeMap<String, ParameterValue>,
}

impl ParameterMap {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    pub fn get(&self, name: &str) -> Option<&ParameterValue> {
        self.values.get(name)
    }

    pub fn insert(&mut self, name: impl Into<String>, value: ParameterValue) -> Option<ParameterValue> {
        self.values.insert(name.into(), value)
    }

    /// Builder-style insert.
    pub fn with(mut self, name: impl Into<String>, value: ParameterValue) -> Self {
        self.insert(name, value);
        self
    }

    pub fn contains(&self, name: &str) -> bool {
        self.values.contains_key(name)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &ParameterValue)> {
        self.values.iter()
    }

    pub fn get_bool(&self, name: &str) -> Option<bool> {
        match self.get(name)? {
            ParameterValue::Bool(b) => Some(*b),
            _ => None,
        }
    }

    pub fn get_int(&self, name: &str) -> Option<i64> {
        match self.get(name)? {
            ParameterValue::Int(i) => Some(*i),
            ParameterValue::Double(d) => Some(d.round() as i64),
            _ => None,
        }
    }

    pub fn get_f64(&self, name: &str) -> Option<f64> {
        match self.get(name)? {
            ParameterValue::Double(d) => Some(*d),
            ParameterValue::Int(i) => Some(*i as f64),
            _ => None,
        }
    }

    pub fn get_str(&self, name: &str) -> Option<&str> {
        match self.get(name)? {
            ParameterValue::String(s) => Some(s),
            _ => None,
        }
    }

    pub fn get_strings(&self, name: &str) -> Option<&[String]> {
        match self.get(name)? {
            ParameterValue::StringArray(v) => Some(v),
            _ => None,
        }
    }

    pub fn get_formatter(&self, name: &str) -> Option<&Formatter> {
        match self.get(name)? {
            ParameterValue::Formatter(f) => Some(f),
            _ => None,
        }
    }

    pub fn get_colour(&self, name: &str) -> Option<Colour> {
        match self.get(name)? {
            ParameterValue::Colour(c) => Some(*c),
            _ => None,
        }
    }

    pub fn get_font(&self, name: &str) -> Option<&Font> {
        match self.get(name)? {
            ParameterValue::Font(f) => Some(f),
            _ => None,
        }
    }

    pub fn get_attachment(&self, name: &str) -> Option<&str> {
        match self.get(name)? {
            ParameterValue::Attachment(a) => Some(a),
            _ => None,
        }
    }

    /// Overwrite every entry present in `changes`.
    pub fn apply(&mut self, changes: &ParameterMap) {
        for (name, value) in changes.iter() {
            self.values.insert(name.clone(), value.clone());
        }
    }

    /// Fill in entries missing from this map with `defaults`.
    pub fn fill_defaults(&mut self, defaults: &ParameterMap) {
        for (name, value) in defaults.iter() {
            self.values.entry(name.clone()).or_insert_with(|| value.clone());
        }
    }

    /// Names whose values differ between `self` and `other` (either side).
    pub fn changed_names(&self, other: &ParameterMap) -> Vec<String> {
        let mut names: Vec<String> = self
            .values
            .iter()
            .filter(|(k, v)| other.get(k) != Some(*v))
            .map(|(k, _)| k.clone())
            .collect();
        for k in other.values.keys() {
            if !self.values.contains_key(k) {
                names.push(k.clone());
            }
        }
        names.sort();
        names
    }

    /// Encode as a JSON array of `[name, typeTag, serializedValue]` triples.
    pub fn encode(&self) -> Value {
        Value::Array(
            self.values
                .iter()
                .map(|(name, value)| {
                    serde_json::json!([name, value.type_tag().as_str(), value.serialize_value()])
                })
                .collect(),
        )
    }

    /// Decode triples; bad entries are skipped and reported.
    pub fn decode(encoded: &Value) -> (ParameterMap, Vec<ParameterDecodeError>) {
        let mut map = ParameterMap::new();
        let mut errors = Vec::new();

        let Some(entries) = encoded.as_array() else {
            errors.push(ParameterDecodeError::NotAnArray);
            return (map, errors);
        };

        for (index, entry) in entries.iter().enumerate() {
            let triple = entry.as_array().filter(|t| t.len() == 3);
            let (Some(name), Some(tag), Some(raw)) = (
                triple.and_then(|t| t[0].as_str()),
                triple.and_then(|t| t[1].as_str()),
                triple.and_then(|t| t[2].as_str()),
            ) else {
                errors.push(ParameterDecodeError::MalformedEntry { index });
                continue;
            };

            let Some(type_tag) = TypeTag::parse(tag) else {
                errors.push(ParameterDecodeError::UnknownType {
                    name: name.to_string(),
                    tag: tag.to_string(),
                });
                continue;
            };

            match ParameterValue::deserialize_value(type_tag, raw) {
                Ok(value) => {
                    map.insert(name, value);
                }
                Err(message) => errors.push(ParameterDecodeError::InvalidValue {
                    name: name.to_string(),
                    tag: type_tag,
                    message,
                }),
            }
        }

        (map, errors)
    }

    /// Decode triples, substituting `defaults` for bad or missing entries.
    pub fn decode_with_defaults(encoded: &Value, defaults: &ParameterMap) -> ParameterMap {
        let (mut map, errors) = Self::decode(encoded);
        for error in &errors {
            tracing::warn!("Using default for undecodable parameter: {}", error);
        }
        map.fill_defaults(defaults);
        map
    }

    /// Make formatter parameters executable, or replace them with safe defaults.
    ///
    /// With `granted == false` no formatter source is compiled and every script
    /// formatter becomes [`Formatter::safe_default`].
    pub fn authorize_formatters(&mut self, engine: &ScriptEngine, granted: bool) {
        for (name, value) in self.values.iter_mut() {
            if let ParameterValue::Formatter(formatter) = value {
                if let Err(e) = formatter.authorize(engine, granted) {
                    tracing::warn!("Formatter '{}' replaced with default: {}", name, e);
                }
            }
        }
    }

    /// Whether any parameter carries script source.
    pub fn has_script_formatters(&self) -> bool {
        self.values
            .values()
            .any(|v| matches!(v, ParameterValue::Formatter(Formatter::Script(_))))
    }

    /// Convert to a JSON object (name -> value) for script modules.
    pub fn to_json_object(&self) -> Value {
        Value::Object(
            self.values
                .iter()
                .map(|(k, v)| (k.clone(), v.to_json()))
                .collect(),
        )
    }
}

impl FromIterator<(String, ParameterValue)> for ParameterMap {
    fn from_iter<T: IntoIterator<Item = (String, ParameterValue)>>(iter: T) -> Self {
        Self {
            values: iter.into_iter().collect(),
        }
    }
}
