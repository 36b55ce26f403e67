//! YAML schema types for workflow definitions.
//!
//! A definition names a workflow type and its ordered steps:
//!
//! ```yaml
//! name: cataloging
//! description: "Turn a product photo into a published catalog entry"
//! version: "1.0"
//!
//! steps:
//!   - name: intake
//!     next: classify
//!   - name: classify
//!     ai_costly: true
//!     tier: BALANCED
//!     capabilities: [vision]
//!     timeout_secs: 120
//!   - name: publish
//!     high_risk: true
//! ```

use std::collections::{BTreeSet, HashMap, HashSet};
use std::path::Path;

use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::json;

use crate::error::EngineError;
use crate::models::{ModelTier, WorkflowData, CAP_FUNCTION_CALLING, CAP_VISION};

const NAME_PATTERN: &str = r"^[a-z][a-z0-9_\-]*$";

/// Name of the definition shipped with the engine.
pub const CATALOGING: &str = "cataloging";

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct WorkflowDefinition {
    /// The workflow type tag
    pub name: String,

    #[serde(default)]
    pub description: Option<String>,

    #[serde(default = "default_version")]
    pub version: String,

    /// Ordered; the first step is where every instance starts
    pub steps: Vec<StepDefinition>,
}

fn default_version() -> String {
    "1.0".to_string()
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct StepDefinition {
    pub name: String,

    #[serde(default)]
    pub description: Option<String>,

    /// Gate at the ApprovalGate before the step runs
    #[serde(default)]
    pub high_risk: bool,

    /// Refused while the tenant is over budget (under `block_costly`)
    #[serde(default)]
    pub ai_costly: bool,

    #[serde(default)]
    pub tier: Option<ModelTier>,

    #[serde(default)]
    pub capabilities: BTreeSet<String>,

    /// Overrides the engine's default step timeout
    #[serde(default)]
    pub timeout_secs: Option<u64>,

    /// Successor; defaults to the following step in the list
    #[serde(default)]
    pub next: Option<String>,

    /// Values merged into workflow data by the definition-walking executor
    #[serde(default)]
    pub output: WorkflowData,
}

impl StepDefinition {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            description: None,
            high_risk: false,
            ai_costly: false,
            tier: None,
            capabilities: BTreeSet::new(),
            timeout_secs: None,
            next: None,
            output: WorkflowData::new(),
        }
    }

    /// Tier to resolve a provider at, or `None` for steps that need no model.
    ///
    /// AI-costly steps and steps declaring capabilities default to BALANCED.
    pub fn model_tier(&self) -> Option<ModelTier> {
        match self.tier {
            Some(tier) => Some(tier),
            None if self.ai_costly || !self.capabilities.is_empty() => Some(ModelTier::Balanced),
            None => None,
        }
    }
}

impl WorkflowDefinition {
    /// Parse and validate a definition from a YAML string.
    pub fn from_yaml(yaml: &str) -> Result<Self, EngineError> {
        let def: Self = serde_yaml::from_str(yaml)
            .map_err(|e| EngineError::Config(format!("Failed to parse workflow YAML: {}", e)))?;
        def.validate()?;
        Ok(def)
    }

    /// Load a definition from a file path.
    pub fn from_file(path: &str) -> Result<Self, EngineError> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| EngineError::Config(format!("Failed to read workflow file '{}': {}", path, e)))?;
        Self::from_yaml(&content)
    }

    pub fn validate(&self) -> Result<(), EngineError> {
        let re = Regex::new(NAME_PATTERN)
            .map_err(|e| EngineError::Internal(format!("bad name pattern: {}", e)))?;
        if !re.is_match(&self.name) {
            return Err(EngineError::Config(format!(
                "workflow name '{}' must match {}",
                self.name, NAME_PATTERN
            )));
        }
        if self.steps.is_empty() {
            return Err(EngineError::Config(format!("workflow '{}' has no steps", self.name)));
        }

        let mut seen = HashSet::new();
        for step in &self.steps {
            if !re.is_match(&step.name) {
                return Err(EngineError::Config(format!(
                    "step name '{}' in '{}' must match {}",
                    step.name, self.name, NAME_PATTERN
                )));
            }
            if !seen.insert(step.name.as_str()) {
                return Err(EngineError::Config(format!(
                    "duplicate step '{}' in '{}'",
                    step.name, self.name
                )));
            }
            if step.timeout_secs == Some(0) {
                return Err(EngineError::Config(format!(
                    "step '{}' in '{}' has a zero timeout",
                    step.name, self.name
                )));
            }
        }
        for step in &self.steps {
            if let Some(ref next) = step.next {
                if !seen.contains(next.as_str()) {
                    return Err(EngineError::Config(format!(
                        "step '{}' in '{}' points at unknown step '{}'",
                        step.name, self.name, next
                    )));
                }
            }
        }
        Ok(())
    }

    pub fn first_step(&self) -> Option<&StepDefinition> {
        self.steps.first()
    }

    pub fn step(&self, name: &str) -> Option<&StepDefinition> {
        self.steps.iter().find(|s| s.name == name)
    }

    /// The step after `name`: its explicit `next`, else the following step
    /// in declaration order, else `None` (end of workflow).
    pub fn successor(&self, name: &str) -> Option<&StepDefinition> {
        let idx = self.steps.iter().position(|s| s.name == name)?;
        match self.steps[idx].next {
            Some(ref next) => self.step(next),
            None => self.steps.get(idx + 1),
        }
    }

    /// Product cataloging: intake → classify → enrich → publish.
    pub fn cataloging() -> Self {
        let mut intake = StepDefinition::new("intake");
        intake.description = Some("Accept the product submission".to_string());
        intake.output.insert("intake".to_string(), json!({ "received": true }));

        let mut classify = StepDefinition::new("classify");
        classify.description = Some("Identify the product category from its image".to_string());
        classify.ai_costly = true;
        classify.tier = Some(ModelTier::Balanced);
        classify.capabilities = [CAP_VISION.to_string()].into_iter().collect();
        classify.timeout_secs = Some(120);
        classify.output.insert("classification".to_string(), json!({ "category": "uncategorized" }));

        let mut enrich = StepDefinition::new("enrich");
        enrich.description = Some("Write the description and SEO tags".to_string());
        enrich.ai_costly = true;
        enrich.tier = Some(ModelTier::Fast);
        enrich.capabilities = [CAP_FUNCTION_CALLING.to_string()].into_iter().collect();
        enrich.output.insert("enrichment".to_string(), json!({ "tags": [] }));

        let mut publish = StepDefinition::new("publish");
        publish.description = Some("Write the catalog entry".to_string());
        publish.high_risk = true;
        publish.output.insert("published".to_string(), json!(true));

        Self {
            name: CATALOGING.to_string(),
            description: Some("Turn a product photo into a published catalog entry".to_string()),
            version: default_version(),
            steps: vec![intake, classify, enrich, publish],
        }
    }
}

/// Registered workflow types.
#[derive(Debug, Clone, Default)]
pub struct DefinitionRegistry {
    definitions: HashMap<String, WorkflowDefinition>,
}

impl DefinitionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// A registry holding the built-in `cataloging` definition.
    pub fn with_builtins() -> Self {
        let mut registry = Self::new();
        registry
            .definitions
            .insert(CATALOGING.to_string(), WorkflowDefinition::cataloging());
        registry
    }

    /// Validate and add a definition, replacing any of the same name.
    pub fn register(&mut self, definition: WorkflowDefinition) -> Result<(), EngineError> {
        definition.validate()?;
        self.definitions.insert(definition.name.clone(), definition);
        Ok(())
    }

    /// Register every `*.yaml` / `*.yml` file in `dir`. Returns the names loaded.
    pub fn load_dir(&mut self, dir: &Path) -> Result<Vec<String>, EngineError> {
        let entries = std::fs::read_dir(dir).map_err(|e| {
            EngineError::Config(format!("Failed to read definitions dir '{}': {}", dir.display(), e))
        })?;
        let mut paths: Vec<_> = entries
            .filter_map(|e| e.ok())
            .map(|e| e.path())
            .filter(|p| matches!(p.extension().and_then(|e| e.to_str()), Some("yaml" | "yml")))
            .collect();
        paths.sort();

        let mut loaded = Vec::new();
        for path in paths {
            let def = WorkflowDefinition::from_file(&path.to_string_lossy())?;
            tracing::debug!("[Definitions] Loaded '{}' from {}", def.name, path.display());
            loaded.push(def.name.clone());
            self.register(def)?;
        }
        Ok(loaded)
    }

    pub fn get(&self, workflow_type: &str) -> Option<&WorkflowDefinition> {
        self.definitions.get(workflow_type)
    }

    /// Registered type names, sorted.
    pub fn types(&self) -> Vec<String> {
        let mut names: Vec<String> = self.definitions.keys().cloned().collect();
        names.sort();
        names
    }
}
