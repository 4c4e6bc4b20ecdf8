//! Artifact generator boundary
//!
//! Generation logic is selected per template kind through a registry
//! lookup, never by inspecting types at runtime. The orchestrator consumes
//! this as an opaque "produce artifacts from validated config" capability.

use crate::runner::OperationContext;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum GeneratorError {
    #[error("artifact validation failed: {0}")]
    Validation(String),
}

/// One generated file, relative to either the code or the manifest tree
#[derive(Debug, Clone)]
pub struct GeneratedFile {
    pub path: String,
    pub contents: String,
    /// Manifests land in the GitOps tree, code in the app workspace
    pub is_manifest: bool,
}

/// Set of artifacts produced for one service
#[derive(Debug, Clone, Default)]
pub struct ArtifactSet {
    pub files: Vec<GeneratedFile>,
}

/// Capability interface implemented per template kind
pub trait ArtifactGenerator: Send + Sync {
    fn generate(&self, ctx: &OperationContext) -> Result<ArtifactSet, GeneratorError>;
}

/// Template-id -> generator lookup
#[derive(Default)]
pub struct GeneratorRegistry {
    generators: HashMap<String, Arc<dyn ArtifactGenerator>>,
}

impl GeneratorRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry serving the built-in templates.
    pub fn builtin() -> Self {
        let mut registry = GeneratorRegistry::new();
        let manifests: Arc<dyn ArtifactGenerator> = Arc::new(ManifestGenerator);
        registry.register("simple-service", manifests.clone());
        registry.register("go-service", manifests);
        registry
    }

    pub fn register(&mut self, template_id: &str, generator: Arc<dyn ArtifactGenerator>) {
        self.generators.insert(template_id.to_string(), generator);
    }

    pub fn lookup(&self, template_id: &str) -> Option<Arc<dyn ArtifactGenerator>> {
        self.generators.get(template_id).cloned()
    }
}

/// Substitute `{{ key }}` placeholders with values.
fn render(template: &str, vars: &HashMap<String, String>) -> String {
    let mut out = template.to_string();
    for (key, value) in vars {
        let placeholder = format!("{{{{ {} }}}}", key);
        out = out.replace(&placeholder, value);
    }
    out
}

fn value_as_string(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

/// Built-in generator: Kubernetes manifests plus a GitOps application file.
pub struct ManifestGenerator;

impl ManifestGenerator {
    fn vars(ctx: &OperationContext) -> HashMap<String, String> {
        let mut vars: HashMap<String, String> = ctx
            .config
            .iter()
            .map(|(k, v)| (k.clone(), value_as_string(v)))
            .collect();
        vars.insert("name".to_string(), ctx.service_name.clone());
        vars.insert("namespace".to_string(), ctx.namespace.clone());
        vars.entry("port".to_string()).or_insert_with(|| "8080".to_string());
        vars.entry("replicas".to_string()).or_insert_with(|| "1".to_string());
        vars
    }
}

const NAMESPACE_YAML: &str = r#"apiVersion: v1
kind: Namespace
metadata:
  name: {{ namespace }}
  labels:
    app: {{ name }}
    managed-by: opsforge
"#;

const DEPLOYMENT_YAML: &str = r#"apiVersion: apps/v1
kind: Deployment
metadata:
  name: {{ name }}
  namespace: {{ namespace }}
spec:
  replicas: {{ replicas }}
  selector:
    matchLabels:
      app: {{ name }}
  template:
    metadata:
      labels:
        app: {{ name }}
    spec:
      containers:
        - name: {{ name }}
          image: {{ image }}
          ports:
            - containerPort: {{ port }}
"#;

const SERVICE_YAML: &str = r#"apiVersion: v1
kind: Service
metadata:
  name: {{ name }}
  namespace: {{ namespace }}
spec:
  selector:
    app: {{ name }}
  ports:
    - port: 80
      targetPort: {{ port }}
"#;

const APPLICATION_YAML: &str = r#"apiVersion: argoproj.io/v1alpha1
kind: Application
metadata:
  name: {{ name }}
  namespace: argocd
spec:
  project: default
  source:
    repoURL: {{ repo_url }}
    targetRevision: HEAD
    path: manifests/{{ name }}
  destination:
    server: https://kubernetes.default.svc
    namespace: {{ namespace }}
  syncPolicy:
    automated:
      prune: true
      selfHeal: true
    syncOptions:
      - CreateNamespace=true
"#;

impl ArtifactGenerator for ManifestGenerator {
    fn generate(&self, ctx: &OperationContext) -> Result<ArtifactSet, GeneratorError> {
        if ctx.service_name.is_empty() {
            return Err(GeneratorError::Validation(
                "service name is required".to_string(),
            ));
        }

        let mut vars = Self::vars(ctx);
        vars.entry("image".to_string())
            .or_insert_with(|| format!("{}:v1.0", ctx.service_name));
        vars.entry("repo_url".to_string()).or_insert_with(|| {
            ctx.env
                .get("OPSFORGE_GIT_INFRA_REPO")
                .cloned()
                .unwrap_or_else(|| "git@example.com:infra.git".to_string())
        });

        let files = vec![
            GeneratedFile {
                path: "namespace.yaml".to_string(),
                contents: render(NAMESPACE_YAML, &vars),
                is_manifest: true,
            },
            GeneratedFile {
                path: "deployment.yaml".to_string(),
                contents: render(DEPLOYMENT_YAML, &vars),
                is_manifest: true,
            },
            GeneratedFile {
                path: "service.yaml".to_string(),
                contents: render(SERVICE_YAML, &vars),
                is_manifest: true,
            },
            GeneratedFile {
                path: "application.yaml".to_string(),
                contents: render(APPLICATION_YAML, &vars),
                is_manifest: true,
            },
        ];

        Ok(ArtifactSet { files })
    }
}
