//! Pipeline serialization.
//!
//! A pipeline is stored as a JSON array of stage groups in fixed kind order:
//!
//! ```text
//! [
//!   ["#signature", {"signature": "...", "publicKey": {...}}],   optional
//!   [[loadId, params]],
//!   [[transformId, params]],
//!   [[furtherId, params], ...],
//!   [[coordinatesId, params]],
//!   [[plotId, params], ...],
//!   ["#attachments", {"name": "base64", ...}]                    optional
//! ]
//! ```
//!
//! `params` is the encoded [`ParameterMap`]. The signature covers the compact
//! JSON text of the array without the signature group.
//!
//! Formatter parameters decode inert. [`ParsedPipeline::authorize`] compiles
//! them only when the signature verifies or the user grants permission;
//! otherwise they become the safe default formatter.

use crate::builtin;
use crate::module::{Attachments, ModuleLoader, PrivateKeyRecord, Provenance, PublicKeyRecord};
use crate::params::ParameterMap;
use crate::pipeline::error::{PipelineError, PipelineResult};
use crate::pipeline::id::StageIndex;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::sync::Arc;
use uuid::Uuid;

const SIGNATURE_TAG: &str = "#signature";
const ATTACHMENTS_TAG: &str = "#attachments";
const STAGE_GROUPS: usize = 5;

/// Subject shown when asking to run formatter code from an unverified file.
pub const FORMATTER_SUBJECT: &str = "pipeline formatters";

/// One stage: the module to run and its parameters.
#[derive(Debug, Clone, PartialEq)]
pub struct StageConfig {
    pub module_id: Uuid,
    pub parameters: ParameterMap,
}

impl StageConfig {
    pub fn new(module_id: Uuid) -> Self {
        Self {
            module_id,
            parameters: ParameterMap::new(),
        }
    }

    pub fn with_parameters(mut self, parameters: ParameterMap) -> Self {
        self.parameters = parameters;
        self
    }

    fn to_json(&self) -> Value {
        json!([self.module_id.to_string(), self.parameters.encode()])
    }

    fn from_json(value: &Value) -> PipelineResult<Self> {
        let pair = value
            .as_array()
            .filter(|p| p.len() == 2)
            .ok_or_else(|| PipelineError::InvalidConfig("stage must be [moduleId, parameters]".into()))?;
        let id = pair[0]
            .as_str()
            .and_then(|s| Uuid::parse_str(s).ok())
            .ok_or_else(|| PipelineError::InvalidConfig(format!("invalid module id {}", pair[0])))?;
        let (parameters, errors) = ParameterMap::decode(&pair[1]);
        for error in errors {
            tracing::warn!("Stage {}: dropping parameter, default will be used: {}", id, error);
        }
        Ok(Self {
            module_id: id,
            parameters,
        })
    }
}

/// The full stage chain of a pipeline plus its attachments.
#[derive(Debug, Clone, PartialEq)]
pub struct PipelineConfig {
    pub load: StageConfig,
    pub transform: StageConfig,
    pub further: Vec<StageConfig>,
    pub coordinates: StageConfig,
    pub plots: Vec<StageConfig>,
    pub attachments: Attachments,
}

impl Default for PipelineConfig {
    /// Built-in modules: load every tree, keep the first, rectangular layout,
    /// branches and labels.
    fn default() -> Self {
        Self {
            load: StageConfig::new(builtin::LOAD_ALL_TREES_ID),
            transform: StageConfig::new(builtin::SELECT_TREE_ID),
            further: Vec::new(),
            coordinates: StageConfig::new(builtin::RECTANGULAR_ID),
            plots: vec![
                StageConfig::new(builtin::BRANCHES_ID),
                StageConfig::new(builtin::LABELS_ID),
            ],
            attachments: Attachments::new(),
        }
    }
}

#[derive(Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SignatureRecord {
    signature: String,
    public_key: PublicKeyRecord,
}

impl PipelineConfig {
    pub fn stage(&self, index: StageIndex) -> Option<&StageConfig> {
        match index {
            StageIndex::Load => Some(&self.load),
            StageIndex::Transform => Some(&self.transform),
            StageIndex::Further(i) => self.further.get(i),
            StageIndex::Coordinates => Some(&self.coordinates),
            StageIndex::Plot(j) => self.plots.get(j),
        }
    }

    pub fn stage_mut(&mut self, index: StageIndex) -> Option<&mut StageConfig> {
        match index {
            StageIndex::Load => Some(&mut self.load),
            StageIndex::Transform => Some(&mut self.transform),
            StageIndex::Further(i) => self.further.get_mut(i),
            StageIndex::Coordinates => Some(&mut self.coordinates),
            StageIndex::Plot(j) => self.plots.get_mut(j),
        }
    }

    /// All stages with their indices, in execution order.
    pub fn stages(&self) -> impl Iterator<Item = (StageIndex, &StageConfig)> {
        let head = [(StageIndex::Load, &self.load), (StageIndex::Transform, &self.transform)];
        let further = self
            .further
            .iter()
            .enumerate()
            .map(|(i, s)| (StageIndex::Further(i), s));
        let plots = self.plots.iter().enumerate().map(|(j, s)| (StageIndex::Plot(j), s));
        head.into_iter()
            .chain(further)
            .chain(std::iter::once((StageIndex::Coordinates, &self.coordinates)))
            .chain(plots)
    }

    fn stages_mut(&mut self) -> Vec<&mut StageConfig> {
        let mut stages = vec![&mut self.load, &mut self.transform, &mut self.coordinates];
        stages.extend(self.further.iter_mut());
        stages.extend(self.plots.iter_mut());
        stages
    }

    pub fn has_script_formatters(&self) -> bool {
        self.stages().any(|(_, s)| s.parameters.has_script_formatters())
    }

    fn body(&self) -> Vec<Value> {
        let group = |stages: &[StageConfig]| Value::Array(stages.iter().map(StageConfig::to_json).collect());
        let mut body = vec![
            group(std::slice::from_ref(&self.load)),
            group(std::slice::from_ref(&self.transform)),
            group(&self.further),
            group(std::slice::from_ref(&self.coordinates)),
            group(&self.plots),
        ];
        if !self.attachments.is_empty() {
            let encoded: serde_json::Map<String, Value> = self
                .attachments
                .iter()
                .map(|(name, bytes)| (name.clone(), Value::String(BASE64.encode(bytes))))
                .collect();
            body.push(json!([ATTACHMENTS_TAG, encoded]));
        }
        body
    }

    /// Text covered by a signature.
    pub fn signed_text(&self) -> String {
        Value::Array(self.body()).to_string()
    }

    /// Unsigned serialization.
    pub fn to_json(&self) -> String {
        self.signed_text()
    }

    /// Serialization with a leading signature group.
    pub fn to_signed_json(&self, key: &PrivateKeyRecord) -> PipelineResult<String> {
        let signature = key.sign(&self.signed_text())?;
        let record = SignatureRecord {
            signature,
            public_key: key.public(),
        };
        let mut document = vec![json!([SIGNATURE_TAG, serde_json::to_value(record)?])];
        document.extend(self.body());
        Ok(Value::Array(document).to_string())
    }

    /// Parse and authorize in one step.
    pub fn from_json(text: &str, loader: &ModuleLoader) -> PipelineResult<(Self, Option<Provenance>)> {
        ParsedPipeline::parse(text)?.authorize(loader)
    }
}

/// A parsed pipeline whose formatters have not been authorized yet.
#[derive(Debug, Clone)]
pub struct ParsedPipeline {
    pub config: PipelineConfig,
    signature: Option<(String, PublicKeyRecord)>,
    signed_text: String,
}

impl ParsedPipeline {
    pub fn parse(text: &str) -> PipelineResult<Self> {
        let document: Value = serde_json::from_str(text)?;
        let Value::Array(mut groups) = document else {
            return Err(PipelineError::InvalidConfig("pipeline must be a JSON array".into()));
        };

        let mut signature = None;
        if tagged(groups.first(), SIGNATURE_TAG).is_some() {
            let group = groups.remove(0);
            let record: SignatureRecord = serde_json::from_value(group[1].clone())?;
            signature = Some((record.signature, record.public_key));
        }
        let signed_text = Value::Array(groups.clone()).to_string();

        let mut attachments = Attachments::new();
        if let Some(encoded) = tagged(groups.last(), ATTACHMENTS_TAG) {
            let encoded = encoded
                .as_object()
                .ok_or_else(|| PipelineError::InvalidConfig("attachments must be an object".into()))?;
            for (name, data) in encoded {
                let bytes = data
                    .as_str()
                    .and_then(|s| BASE64.decode(s).ok())
                    .ok_or_else(|| PipelineError::InvalidConfig(format!("attachment '{}' is not base64", name)))?;
                attachments.insert(name.clone(), Arc::from(bytes));
            }
            groups.pop();
        }

        if groups.len() != STAGE_GROUPS {
            return Err(PipelineError::InvalidConfig(format!(
                "expected {} stage groups, found {}",
                STAGE_GROUPS,
                groups.len()
            )));
        }

        let mut parsed = groups
            .iter()
            .map(|group| {
                group
                    .as_array()
                    .ok_or_else(|| PipelineError::InvalidConfig("stage group must be an array".into()))?
                    .iter()
                    .map(StageConfig::from_json)
                    .collect::<PipelineResult<Vec<_>>>()
            })
            .collect::<PipelineResult<Vec<_>>>()?;

        let plots = parsed.pop().unwrap_or_default();
        let coordinates = single(parsed.pop(), "coordinates")?;
        let further = parsed.pop().unwrap_or_default();
        let transform = single(parsed.pop(), "transform")?;
        let load = single(parsed.pop(), "load")?;

        Ok(Self {
            config: PipelineConfig {
                load,
                transform,
                further,
                coordinates,
                plots,
                attachments,
            },
            signature,
            signed_text,
        })
    }

    pub fn is_signed(&self) -> bool {
        self.signature.is_some()
    }

    /// Decide whether formatter code may run and prepare every formatter.
    ///
    /// Permission is only asked for when some stage carries script
    /// formatters. Returns the provenance of the formatter code, or `None`
    /// when it was refused or there was none.
    pub fn authorize(self, loader: &ModuleLoader) -> PipelineResult<(PipelineConfig, Option<Provenance>)> {
        let mut config = self.config;
        if !config.has_script_formatters() {
            return Ok((config, None));
        }

        let signed = self.signature.as_ref().map(|(sig, key)| (sig.as_str(), key));
        let provenance = loader.verify_document(FORMATTER_SUBJECT, &self.signed_text, signed)?;
        let granted = provenance.is_some();
        if !granted {
            tracing::warn!("Formatter code in pipeline not authorized; using default formatters");
        }

        let engine = loader.engine();
        for stage in config.stages_mut() {
            stage.parameters.authorize_formatters(engine, granted);
        }
        Ok((config, provenance))
    }
}

fn tagged<'a>(group: Option<&'a Value>, tag: &str) -> Option<&'a Value> {
    let pair = group?.as_array().filter(|p| p.len() == 2)?;
    (pair[0].as_str() == Some(tag)).then(|| &pair[1])
}

fn single(group: Option<Vec<StageConfig>>, name: &str) -> PipelineResult<StageConfig> {
    let mut group = group.unwrap_or_default();
    if group.len() != 1 {
        return Err(PipelineError::InvalidConfig(format!(
            "{} group must hold exactly one stage, found {}",
            name,
            group.len()
        )));
    }
    Ok(group.remove(0))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ModuleRoots;
    use crate::module::crypto::test_keys;
    use crate::module::permission::MockCodePermission;
    use crate::module::{
        FirstPartyKeys, PermissionDecision, PermissionSession, ReferenceResolver, TrustedKeyRing,
    };
    use crate::params::{Formatter, ParameterValue};
    use crate::scripting::ScriptEngine;

    fn loader(decision: PermissionDecision, expected_asks: usize) -> ModuleLoader {
        let mut permission = MockCodePermission::new();
        permission
            .expect_ask_for_code_permission()
            .times(expected_asks)
            .return_const(decision);
        ModuleLoader::new(
            Arc::new(ScriptEngine::new()),
            ReferenceResolver::new(ModuleRoots::from_data_dir(std::env::temp_dir().join("treevis-unused"))),
            FirstPartyKeys::custom(Vec::new()),
            TrustedKeyRing::in_memory(),
            PermissionSession::new(Arc::new(permission)),
        )
    }

    fn with_script_label() -> PipelineConfig {
        let mut config = PipelineConfig::default();
        config.plots[1].parameters = ParameterMap::new().with(
            "Formatter",
            ParameterValue::Formatter(Formatter::script(r#"fn format(v) { "[" + v + "]" }"#)),
        );
        config
    }

    fn label_formatter(config: &PipelineConfig) -> &Formatter {
        config.plots[1].parameters.get_formatter("Formatter").unwrap()
    }

    #[test]
    fn test_parse_back_stage_chain() {
        let mut config = PipelineConfig::default();
        config.further.push(
            StageConfig::new(builtin::SCALE_BRANCHES_ID)
                .with_parameters(ParameterMap::new().with("Factor", ParameterValue::Double(2.0))),
        );
        config.attachments.insert("logo.png".into(), Arc::from(vec![1u8, 2, 3]));

        let parsed = ParsedPipeline::parse(&config.to_json()).unwrap();
        assert!(!parsed.is_signed());
        assert_eq!(parsed.config, config);
    }

    #[test]
    fn test_rejects_wrong_group_count() {
        let err = ParsedPipeline::parse("[[], []]").unwrap_err();
        assert!(matches!(err, PipelineError::InvalidConfig(_)));
    }

    #[test]
    fn test_bad_parameter_dropped() {
        let text = format!(
            r#"[[["{}", []]], [["{}", [["Tree index", "int", "many"]]]], [], [["{}", []]], []]"#,
            builtin::LOAD_ALL_TREES_ID,
            builtin::SELECT_TREE_ID,
            builtin::RECTANGULAR_ID
        );
        let parsed = ParsedPipeline::parse(&text).unwrap();
        assert!(parsed.config.transform.parameters.is_empty());
        assert!(parsed.config.plots.is_empty());
    }

    #[test]
    fn test_no_formatters_no_question() {
        let loader = loader(PermissionDecision::Denied, 0);
        let (config, provenance) = PipelineConfig::from_json(&PipelineConfig::default().to_json(), &loader).unwrap();
        assert_eq!(config, PipelineConfig::default());
        assert_eq!(provenance, None);
    }

    #[test]
    fn test_denied_formatters_become_default() {
        let loader = loader(PermissionDecision::Denied, 1);
        let (config, provenance) = PipelineConfig::from_json(&with_script_label().to_json(), &loader).unwrap();
        assert_eq!(provenance, None);
        assert_eq!(label_formatter(&config), &Formatter::safe_default());
    }

    #[test]
    fn test_granted_formatters_compile() {
        let loader = loader(PermissionDecision::Granted, 1);
        let (config, provenance) = PipelineConfig::from_json(&with_script_label().to_json(), &loader).unwrap();
        assert_eq!(provenance, Some(Provenance::UserPermitted));
        assert!(label_formatter(&config).is_executable());
    }

    #[test]
    fn test_trusted_signature_needs_no_permission() {
        let pair = test_keys::pair(0);
        let loader = loader(PermissionDecision::Denied, 0);
        loader.key_ring().write().trust(pair.public.clone()).unwrap();

        let text = with_script_label().to_signed_json(&pair.private).unwrap();
        let (config, provenance) = PipelineConfig::from_json(&text, &loader).unwrap();
        assert_eq!(provenance, Some(Provenance::TrustedKey));
        assert!(label_formatter(&config).is_executable());
    }

    #[test]
    fn test_tampered_signed_pipeline_asks() {
        let pair = test_keys::pair(0);
        let loader = loader(PermissionDecision::Denied, 1);
        loader.key_ring().write().trust(pair.public.clone()).unwrap();

        let text = with_script_label()
            .to_signed_json(&pair.private)
            .unwrap()
            .replace("fn format(v)", "fn format(value)");
        let (config, provenance) = PipelineConfig::from_json(&text, &loader).unwrap();
        assert_eq!(provenance, None);
        assert_eq!(label_formatter(&config), &Formatter::safe_default());
    }
}
