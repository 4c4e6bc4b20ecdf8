//! Template domain model: step pipelines and configuration schemas

use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::{Arc, OnceLock};

/// Kind of external operation a step executes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum OperationKind {
    /// Produce application code and deployment manifests
    GenerateArtifacts,
    /// Build the container image
    BuildImage,
    /// Push the image to the registry
    PushImage,
    /// Commit generated manifests and push to the GitOps repo
    GitCommitPush,
    /// Open a pull request against the GitOps repo
    CreatePullRequest,
    /// Wait for CI checks on the pull request
    WaitForChecks,
    /// Merge the pull request
    MergePullRequest,
    /// Trigger the GitOps sync for the service
    TriggerSync,
}

impl fmt::Display for OperationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            OperationKind::GenerateArtifacts => "generate-artifacts",
            OperationKind::BuildImage => "build-image",
            OperationKind::PushImage => "push-image",
            OperationKind::GitCommitPush => "git-commit-push",
            OperationKind::CreatePullRequest => "create-pull-request",
            OperationKind::WaitForChecks => "wait-for-checks",
            OperationKind::MergePullRequest => "merge-pull-request",
            OperationKind::TriggerSync => "trigger-sync",
        };
        f.write_str(s)
    }
}

/// One step in a template's pipeline
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepDefinition {
    /// Step name, unique within the template
    pub name: String,

    /// External operation backing this step
    pub kind: OperationKind,

    /// Whether the operation can be safely re-run
    #[serde(default = "default_idempotent")]
    pub idempotent: bool,

    /// Maximum step duration before it is failed
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,

    /// Automatic retries on transient failures (idempotent steps only;
    /// non-idempotent steps are retried at most once)
    #[serde(default = "default_max_retries")]
    pub max_retries: usize,
}

fn default_idempotent() -> bool {
    true
}

fn default_timeout_secs() -> u64 {
    300
}

fn default_max_retries() -> usize {
    3
}

impl StepDefinition {
    pub fn new(name: &str, kind: OperationKind) -> Self {
        StepDefinition {
            name: name.to_string(),
            kind,
            idempotent: default_idempotent(),
            timeout_secs: default_timeout_secs(),
            max_retries: default_max_retries(),
        }
    }

    pub fn non_idempotent(mut self) -> Self {
        self.idempotent = false;
        self
    }

    pub fn with_timeout(mut self, secs: u64) -> Self {
        self.timeout_secs = secs;
        self
    }
}

/// Expected type of a configuration field
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FieldKind {
    String,
    Integer,
    /// Integer constrained to 1..=65535
    Port,
    Bool,
}

/// One field in a template's configuration schema
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FieldSpec {
    pub key: String,
    pub kind: FieldKind,
    #[serde(default)]
    pub required: bool,
    #[serde(default)]
    pub default: Option<Value>,
}

impl FieldSpec {
    pub fn new(key: &str, kind: FieldKind) -> Self {
        FieldSpec {
            key: key.to_string(),
            kind,
            required: false,
            default: None,
        }
    }

    pub fn required(mut self) -> Self {
        self.required = true;
        self
    }

    pub fn with_default(mut self, value: Value) -> Self {
        self.default = Some(value);
        self
    }

    fn check(&self, value: &Value) -> Option<String> {
        match self.kind {
            FieldKind::String => {
                if !value.is_string() {
                    return Some(format!("{} must be a string", self.key));
                }
            }
            FieldKind::Integer => {
                if !value.is_i64() && !value.is_u64() {
                    return Some(format!("{} must be an integer", self.key));
                }
            }
            FieldKind::Port => match value.as_i64() {
                Some(p) if (1..=65535).contains(&p) => {}
                _ => return Some(format!("{} must be between 1 and 65535", self.key)),
            },
            FieldKind::Bool => {
                if !value.is_boolean() {
                    return Some(format!("{} must be a boolean", self.key));
                }
            }
        }
        None
    }
}

/// Configuration schema for a template
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ConfigSchema {
    #[serde(default)]
    pub fields: Vec<FieldSpec>,
}

impl ConfigSchema {
    /// Validate a configuration against the schema, applying defaults for
    /// missing optional fields. All errors are collected and reported
    /// together.
    pub fn validate(&self, config: &mut BTreeMap<String, Value>) -> Result<(), Vec<String>> {
        let mut errors = Vec::new();

        for field in &self.fields {
            match config.get(&field.key) {
                Some(value) => {
                    if let Some(err) = field.check(value) {
                        errors.push(err);
                    }
                }
                None => {
                    if let Some(default) = &field.default {
                        config.insert(field.key.clone(), default.clone());
                    } else if field.required {
                        errors.push(format!("{} is required", field.key));
                    }
                }
            }
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(errors)
        }
    }
}

/// A named, ordered workflow definition for one class of service
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Template {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub description: String,
    pub steps: Vec<StepDefinition>,
    #[serde(default)]
    pub schema: ConfigSchema,
}

impl Template {
    /// Validate structural invariants: a non-empty step list with unique
    /// step names.
    pub fn check(&self) -> Result<(), String> {
        if self.steps.is_empty() {
            return Err(format!("template {} has no steps", self.id));
        }
        let mut seen = std::collections::HashSet::new();
        for step in &self.steps {
            if !seen.insert(step.name.as_str()) {
                return Err(format!(
                    "template {} has duplicate step name {}",
                    self.id, step.name
                ));
            }
        }
        Ok(())
    }
}

/// Catalog of known templates, looked up by identifier
#[derive(Debug, Clone, Default)]
pub struct TemplateCatalog {
    templates: HashMap<String, Arc<Template>>,
}

impl TemplateCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Catalog with the built-in templates.
    pub fn builtin() -> Self {
        let mut catalog = TemplateCatalog::new();
        catalog.insert(simple_service_template());
        catalog.insert(go_service_template());
        catalog
    }

    /// Load additional template definitions from a YAML document
    /// (a sequence of templates) on top of the built-ins.
    pub fn from_yaml(yaml: &str) -> Result<Self, String> {
        let templates: Vec<Template> =
            serde_yaml::from_str(yaml).map_err(|e| format!("invalid template catalog: {}", e))?;
        let mut catalog = TemplateCatalog::builtin();
        for template in templates {
            template.check()?;
            catalog.insert(template);
        }
        Ok(catalog)
    }

    pub fn insert(&mut self, template: Template) {
        self.templates
            .insert(template.id.clone(), Arc::new(template));
    }

    pub fn get(&self, id: &str) -> Option<Arc<Template>> {
        self.templates.get(id).cloned()
    }

    pub fn ids(&self) -> Vec<String> {
        let mut ids: Vec<_> = self.templates.keys().cloned().collect();
        ids.sort();
        ids
    }
}

/// Service names must be DNS labels: lowercase alphanumerics and hyphens,
/// at most 63 characters.
pub fn validate_service_name(name: &str) -> Result<(), String> {
    static NAME_RE: OnceLock<Regex> = OnceLock::new();
    if name.is_empty() || name.len() > 63 {
        return Err("service name must be 1-63 characters".to_string());
    }
    let re = NAME_RE
        .get_or_init(|| Regex::new(r"^[a-z0-9]([a-z0-9-]*[a-z0-9])?$").expect("static regex"));
    if !re.is_match(name) {
        return Err(
            "service name must contain only lowercase alphanumerics and hyphens".to_string(),
        );
    }
    Ok(())
}

fn simple_service_template() -> Template {
    Template {
        id: "simple-service".to_string(),
        name: "Simple Service".to_string(),
        description: "Generate, build and publish a basic HTTP service".to_string(),
        steps: vec![
            StepDefinition::new("generate", OperationKind::GenerateArtifacts),
            StepDefinition::new("build", OperationKind::BuildImage).with_timeout(600),
            StepDefinition::new("publish", OperationKind::PushImage),
        ],
        schema: ConfigSchema {
            fields: vec![
                FieldSpec::new("port", FieldKind::Port).with_default(Value::from(8080)),
                FieldSpec::new("replicas", FieldKind::Integer).with_default(Value::from(1)),
            ],
        },
    }
}

fn go_service_template() -> Template {
    Template {
        id: "go-service".to_string(),
        name: "Go Service".to_string(),
        description: "Go HTTP service delivered through the GitOps flow".to_string(),
        steps: vec![
            StepDefinition::new("generate", OperationKind::GenerateArtifacts),
            StepDefinition::new("build", OperationKind::BuildImage).with_timeout(600),
            StepDefinition::new("push", OperationKind::PushImage),
            StepDefinition::new("commit", OperationKind::GitCommitPush),
            StepDefinition::new("pull-request", OperationKind::CreatePullRequest)
                .non_idempotent(),
            StepDefinition::new("checks", OperationKind::WaitForChecks).with_timeout(1800),
            StepDefinition::new("merge", OperationKind::MergePullRequest).non_idempotent(),
            StepDefinition::new("sync", OperationKind::TriggerSync),
        ],
        schema: ConfigSchema {
            fields: vec![
                FieldSpec::new("port", FieldKind::Port).with_default(Value::from(8080)),
                FieldSpec::new("replicas", FieldKind::Integer).with_default(Value::from(2)),
                FieldSpec::new("environment", FieldKind::String)
                    .with_default(Value::from("dev")),
                FieldSpec::new("enable_health_check", FieldKind::Bool)
                    .with_default(Value::from(true)),
            ],
        },
    }
}
