//! Process-backed operation runner
//!
//! Maps each operation kind to one external tool invocation, spawned
//! through the shell with stdout/stderr streamed line-by-line to the sink.

use crate::core::{LogLevel, OperationKind, StepDefinition};
use crate::generator::GeneratorRegistry;
use crate::runner::{
    LineSink, OperationContext, OperationOutput, OperationRunner, OutputLine, RunnerError,
};
use async_trait::async_trait;
use regex::Regex;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::Command;
use tracing::{debug, warn};

/// Paths and settings for the external tools the runner drives
#[derive(Debug, Clone)]
pub struct ToolConfig {
    /// Container image registry prefix (e.g. "registry.local:5000")
    pub image_registry: String,

    /// Working directory for generated application code
    pub workspace_dir: PathBuf,

    /// Local checkout of the GitOps repository
    pub gitops_dir: PathBuf,
}

impl Default for ToolConfig {
    fn default() -> Self {
        ToolConfig {
            image_registry: "localhost:5000".to_string(),
            workspace_dir: PathBuf::from("workspace"),
            gitops_dir: PathBuf::from("workspace/gitops"),
        }
    }
}

impl ToolConfig {
    /// Image name for a service, tagged the way the provisioning flow
    /// expects it.
    pub fn image_name(&self, service_name: &str) -> String {
        format!("{}/{}:v1.0", self.image_registry, service_name)
    }

    fn code_dir(&self, service_name: &str) -> PathBuf {
        self.workspace_dir.join("apps").join(service_name)
    }

    fn manifests_dir(&self, service_name: &str) -> PathBuf {
        self.gitops_dir.join("manifests").join(service_name)
    }
}

/// Runner that shells out to docker/git/gh/kubectl per operation kind.
///
/// `generate-artifacts` is the one exception: it is served by the artifact
/// generator capability instead of a subprocess.
pub struct ProcessRunner {
    tools: ToolConfig,
    generators: Arc<GeneratorRegistry>,
    transient: Regex,
    permanent: Regex,
}

impl ProcessRunner {
    pub fn new(tools: ToolConfig, generators: Arc<GeneratorRegistry>) -> Self {
        ProcessRunner {
            tools,
            generators,
            transient: Regex::new(
                r"(?i)(timed? ?out|timeout|rate limit|too many requests|connection (refused|reset)|temporarily unavailable|503|network is unreachable)",
            )
            .expect("static regex"),
            permanent: Regex::new(
                r"(?i)(unauthorized|forbidden|authentication|permission denied|access denied|invalid|not found)",
            )
            .expect("static regex"),
        }
    }

    fn script_for(&self, kind: OperationKind, ctx: &OperationContext) -> String {
        let name = &ctx.service_name;
        let image = self.tools.image_name(name);
        let code_dir = self.tools.code_dir(name).display().to_string();
        let gitops = self.tools.gitops_dir.display().to_string();

        match kind {
            OperationKind::GenerateArtifacts => unreachable!("handled by the generator"),
            OperationKind::BuildImage => format!("docker build -t {} {}", image, code_dir),
            OperationKind::PushImage => format!("docker push {}", image),
            OperationKind::GitCommitPush => format!(
                "git -C {gitops} add -A && git -C {gitops} commit -m 'provision {name}' && git -C {gitops} push origin HEAD",
            ),
            OperationKind::CreatePullRequest => {
                format!("cd {} && gh pr create --fill", gitops)
            }
            OperationKind::WaitForChecks => {
                // bounded-interval polling; the overall bound comes from
                // the step timeout
                format!("cd {} && gh pr checks --watch --interval 10", gitops)
            }
            OperationKind::MergePullRequest => {
                format!("cd {} && gh pr merge --squash", gitops)
            }
            OperationKind::TriggerSync => format!(
                "kubectl annotate application {} -n argocd argocd.argoproj.io/refresh=normal --overwrite",
                name
            ),
        }
    }

    /// Classify a non-zero exit by scanning the stderr tail.
    fn classify_failure(&self, kind: OperationKind, exit_code: i32, stderr_tail: &str) -> RunnerError {
        let detail = format!(
            "{} exited with code {}: {}",
            kind,
            exit_code,
            stderr_tail.trim()
        );
        if self.transient.is_match(stderr_tail) && !self.permanent.is_match(stderr_tail) {
            RunnerError::Transient(detail)
        } else {
            RunnerError::Permanent(detail)
        }
    }

    async fn generate(
        &self,
        ctx: &OperationContext,
        sink: &dyn LineSink,
    ) -> Result<OperationOutput, RunnerError> {
        let generator = self
            .generators
            .lookup(&ctx.template_id)
            .ok_or_else(|| {
                RunnerError::Permanent(format!("no generator for template {}", ctx.template_id))
            })?;

        let artifacts = generator
            .generate(ctx)
            .map_err(|e| RunnerError::Permanent(e.to_string()))?;

        let mut emitted = 0;
        for file in &artifacts.files {
            let path = if file.is_manifest {
                self.tools.manifests_dir(&ctx.service_name).join(&file.path)
            } else {
                self.tools.code_dir(&ctx.service_name).join(&file.path)
            };
            if let Some(parent) = path.parent() {
                tokio::fs::create_dir_all(parent)
                    .await
                    .map_err(|e| RunnerError::Permanent(format!("mkdir failed: {}", e)))?;
            }
            tokio::fs::write(&path, &file.contents)
                .await
                .map_err(|e| RunnerError::Permanent(format!("write failed: {}", e)))?;

            sink.on_line(&OutputLine::classify(
                format!("Created {}", file.path),
                LogLevel::Info,
            ));
            emitted += 1;
        }

        sink.on_line(&OutputLine::classify(
            format!("✅ Generated {} artifacts", artifacts.files.len()),
            LogLevel::Info,
        ));
        Ok(OperationOutput::success(emitted + 1))
    }
}

#[async_trait]
impl OperationRunner for ProcessRunner {
    async fn execute(
        &self,
        step: &StepDefinition,
        ctx: &OperationContext,
        sink: &dyn LineSink,
    ) -> Result<OperationOutput, RunnerError> {
        if step.kind == OperationKind::GenerateArtifacts {
            return self.generate(ctx, sink).await;
        }

        let script = self.script_for(step.kind, ctx);
        debug!("spawning operation {}: {}", step.kind, script);

        let mut child = Command::new("sh")
            .arg("-c")
            .arg(&script)
            .envs(ctx.env.iter())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| RunnerError::Permanent(format!("failed to spawn {}: {}", step.kind, e)))?;

        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| RunnerError::Permanent("no stdout handle".to_string()))?;
        let stderr = child
            .stderr
            .take()
            .ok_or_else(|| RunnerError::Permanent("no stderr handle".to_string()))?;

        // Stream both pipes concurrently so progress is never held back.
        let stdout_task = async {
            let mut lines = BufReader::new(stdout).lines();
            let mut count = 0usize;
            while let Ok(Some(text)) = lines.next_line().await {
                if text.trim().is_empty() {
                    continue;
                }
                sink.on_line(&OutputLine::classify(text, LogLevel::Info));
                count += 1;
            }
            count
        };
        let stderr_task = async {
            let mut lines = BufReader::new(stderr).lines();
            let mut count = 0usize;
            let mut tail: Vec<String> = Vec::new();
            while let Ok(Some(text)) = lines.next_line().await {
                if text.trim().is_empty() {
                    continue;
                }
                sink.on_line(&OutputLine::classify(text.clone(), LogLevel::Error));
                if tail.len() >= 20 {
                    tail.remove(0);
                }
                tail.push(text);
                count += 1;
            }
            (count, tail)
        };

        let (out_count, (err_count, stderr_tail)) = tokio::join!(stdout_task, stderr_task);

        let status = child
            .wait()
            .await
            .map_err(|e| RunnerError::Permanent(format!("wait failed: {}", e)))?;

        let exit_code = status.code().unwrap_or(-1);
        if status.success() {
            Ok(OperationOutput {
                exit_code,
                lines_emitted: out_count + err_count,
            })
        } else {
            warn!("operation {} exited with code {}", step.kind, exit_code);
            Err(self.classify_failure(step.kind, exit_code, &stderr_tail.join("\n")))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn runner() -> ProcessRunner {
        ProcessRunner::new(ToolConfig::default(), Arc::new(GeneratorRegistry::builtin()))
    }

    #[test]
    fn test_classify_transient() {
        let r = runner();
        let err = r.classify_failure(
            OperationKind::PushImage,
            1,
            "error: connection reset by peer",
        );
        assert!(err.is_transient());

        let err = r.classify_failure(OperationKind::PushImage, 1, "429 too many requests");
        assert!(err.is_transient());
    }

    #[test]
    fn test_classify_permanent() {
        let r = runner();
        let err = r.classify_failure(
            OperationKind::PushImage,
            1,
            "unauthorized: authentication required",
        );
        assert!(!err.is_transient());

        // auth failure wins even when a transient word appears
        let err = r.classify_failure(
            OperationKind::PushImage,
            1,
            "unauthorized: token timed out, authentication required",
        );
        assert!(!err.is_transient());

        let err = r.classify_failure(OperationKind::BuildImage, 2, "syntax error in Dockerfile");
        assert!(!err.is_transient());
    }

    #[test]
    fn test_image_name() {
        let tools = ToolConfig::default();
        assert_eq!(tools.image_name("my-api"), "localhost:5000/my-api:v1.0");
    }
}
