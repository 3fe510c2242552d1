//! Label formatters.
//!
//! A formatter turns an attribute value into display text. The default kind is
//! plain data; the script kind carries Rhai source defining `fn format(value)`.
//! Script source is inert until [`Formatter::authorize`] compiles it, and a
//! formatter that was never authorized formats exactly like the safe default.

use crate::error::{Result, TreeVisError};
use crate::scripting::{attribute_to_dynamic, ScriptEngine};
use crate::tree::AttributeValue;
use rhai::{Dynamic, Scope, AST};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// Entry point a script formatter must define.
pub const FORMAT_FN: &str = "format";

/// Serialized form of a formatter parameter.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum FormatterRecord {
    Default {
        #[serde(default)]
        decimals: Option<usize>,
        #[serde(default)]
        prefix: String,
        #[serde(default)]
        suffix: String,
    },
    Script {
        source: String,
    },
}

/// Non-script formatting options.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct DefaultFormatter {
    /// Fixed number of decimals for numeric values
    pub decimals: Option<usize>,
    pub prefix: String,
    pub suffix: String,
}

impl DefaultFormatter {
    pub fn format(&self, value: Option<&AttributeValue>) -> Option<String> {
        let body = match value? {
            AttributeValue::Text(s) => s.clone(),
            AttributeValue::Number(n) => match self.decimals {
                Some(d) => format!("{:.*}", d, n),
                None => n.to_string(),
            },
        };
        Some(format!("{}{}{}", self.prefix, body, self.suffix))
    }
}

/// Formatter backed by Rhai source.
#[derive(Clone)]
pub struct ScriptFormatter {
    source: String,
    compiled: Option<Arc<AST>>,
}

impl ScriptFormatter {
    pub fn source(&self) -> &str {
        &self.source
    }

    pub fn is_compiled(&self) -> bool {
        self.compiled.is_some()
    }
}

impl PartialEq for ScriptFormatter {
    fn eq(&self, other: &Self) -> bool {
        self.source == other.source
    }
}

impl std::fmt::Debug for ScriptFormatter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ScriptFormatter")
            .field("source_len", &self.source.len())
            .field("compiled", &self.compiled.is_some())
            .finish()
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Formatter {
    Default(DefaultFormatter),
    Script(ScriptFormatter),
}

impl Default for Formatter {
    fn default() -> Self {
        Self::safe_default()
    }
}

impl Formatter {
    /// The formatter substituted whenever script source is not permitted.
    pub fn safe_default() -> Self {
        Formatter::Default(DefaultFormatter::default())
    }

    /// Inert script formatter; call [`Formatter::authorize`] before use.
    pub fn script(source: impl Into<String>) -> Self {
        Formatter::Script(ScriptFormatter {
            source: source.into(),
            compiled: None,
        })
    }

    pub fn decimals(decimals: usize) -> Self {
        Formatter::Default(DefaultFormatter {
            decimals: Some(decimals),
            ..Default::default()
        })
    }

    pub fn is_executable(&self) -> bool {
        matches!(self, Formatter::Script(s) if s.is_compiled())
    }

    pub fn to_record(&self) -> FormatterRecord {
        match self {
            Formatter::Default(d) => FormatterRecord::Default {
                decimals: d.decimals,
                prefix: d.prefix.clone(),
                suffix: d.suffix.clone(),
            },
            Formatter::Script(s) => FormatterRecord::Script {
                source: s.source.clone(),
            },
        }
    }

    pub fn from_record(record: FormatterRecord) -> Self {
        match record {
            FormatterRecord::Default {
                decimals,
                prefix,
                suffix,
            } => Formatter::Default(DefaultFormatter {
                decimals,
                prefix,
                suffix,
            }),
            FormatterRecord::Script { source } => Formatter::script(source),
        }
    }

    /// Compile script source if `granted`, otherwise fall back to the safe default.
    ///
    /// A compile failure also falls back and is returned as an error.
    pub fn authorize(&mut self, engine: &ScriptEngine, granted: bool) -> Result<()> {
        let Formatter::Script(script) = self else {
            return Ok(());
        };
        if script.is_compiled() {
            return Ok(());
        }
        if !granted {
            tracing::debug!("Script formatter not permitted, using safe default");
            *self = Formatter::safe_default();
            return Ok(());
        }

        let compiled = engine
            .engine()
            .compile(&script.source)
            .map_err(|e| TreeVisError::Script(format!("Formatter compilation error: {}", e)))
            .and_then(|ast| {
                let has_entry = ast
                    .iter_functions()
                    .any(|f| f.name == FORMAT_FN && f.params.len() == 1);
                if has_entry {
                    Ok(ast)
                } else {
                    Err(TreeVisError::Script(format!(
                        "Formatter does not define fn {}(value)",
                        FORMAT_FN
                    )))
                }
            });

        match compiled {
            Ok(ast) => {
                script.compiled = Some(Arc::new(ast));
                Ok(())
            }
            Err(e) => {
                *self = Formatter::safe_default();
                Err(e)
            }
        }
    }

    /// Format `value`; script errors and `()` results yield the default text.
    pub fn format(&self, engine: &ScriptEngine, value: Option<&AttributeValue>) -> Option<String> {
        let fallback = || DefaultFormatter::default().format(value);
        match self {
            Formatter::Default(d) => d.format(value),
            Formatter::Script(ScriptFormatter {
                compiled: Some(ast),
                ..
            }) => {
                let arg = attribute_to_dynamic(value.cloned());
                match engine
                    .engine()
                    .call_fn::<Dynamic>(&mut Scope::new(), ast, FORMAT_FN, (arg,))
                {
                    Ok(result) if result.is_unit() => None,
                    Ok(result) => Some(result.to_string()),
                    Err(e) => {
                        tracing::trace!("Formatter script failed: {}", e);
                        fallback()
                    }
                }
            }
            Formatter::Script(_) => fallback(),
        }
    }
}
