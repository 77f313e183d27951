use anyhow::{Context, Result, bail};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Top-level configuration, parsed from `mender.toml`.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    #[serde(default)]
    pub config_version: i64,
    #[serde(default)]
    pub db_path: String,
    #[serde(default)]
    pub repos_root: String,
    #[serde(default)]
    pub log_level: String,
    #[serde(default)]
    pub log_file: String,

    #[serde(default)]
    pub daemon: DaemonConfig,
    #[serde(default)]
    pub tokens: TokensConfig,
    #[serde(default)]
    pub sentry: SentryConfig,
    #[serde(default)]
    pub llm: LlmConfig,

    #[serde(default)]
    pub projects: Vec<ProjectConfig>,

    /// Directory of the config file; relative paths resolve against it.
    #[serde(skip)]
    pub base_dir: PathBuf,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct DaemonConfig {
    #[serde(default)]
    pub webhook_port: u16,
    #[serde(default)]
    pub webhook_secret: String,
    #[serde(default)]
    pub max_workers: usize,
    #[serde(default)]
    pub max_iterations: i64,
    #[serde(default)]
    pub sync_interval: String,
    #[serde(default)]
    pub pid_file: String,
    #[serde(default)]
    pub auto_pr: bool,
    #[serde(default)]
    pub ci_check_interval: String,
    #[serde(default)]
    pub ci_check_timeout: String,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TokensConfig {
    #[serde(default)]
    pub gitlab: String,
    #[serde(default)]
    pub github: String,
    #[serde(default)]
    pub sentry: String,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SentryConfig {
    #[serde(default)]
    pub base_url: String,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct LlmConfig {
    #[serde(default)]
    pub provider: String,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ProjectConfig {
    pub name: String,
    #[serde(default)]
    pub repo_url: String,
    #[serde(default)]
    pub test_cmd: String,
    #[serde(default)]
    pub base_branch: String,
    pub gitlab: Option<ProjectGitlab>,
    pub github: Option<ProjectGithub>,
    pub sentry: Option<ProjectSentry>,
    pub prompts: Option<ProjectPrompts>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ProjectGitlab {
    #[serde(default)]
    pub base_url: String,
    pub project_id: String,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ProjectGithub {
    pub owner: String,
    pub repo: String,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ProjectSentry {
    pub org: String,
    pub project: String,
}

/// Per-project prompt template file paths. Empty entries fall back to the
/// built-in templates.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ProjectPrompts {
    #[serde(default)]
    pub plan: String,
    #[serde(default)]
    pub implement: String,
    #[serde(default)]
    pub code_review: String,
}

impl Config {
    /// Load, default, env-override, validate, and resolve paths.
    pub fn load(path: &Path) -> Result<Config> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("read config {}", path.display()))?;
        let mut cfg: Config =
            toml::from_str(&raw).with_context(|| format!("decode config {}", path.display()))?;
        cfg.base_dir = path.parent().unwrap_or(Path::new(".")).to_path_buf();
        cfg.apply_defaults();
        cfg.apply_env_overrides();
        cfg.warn_tokens_in_file();
        cfg.validate()?;
        cfg.resolve_paths();
        Ok(cfg)
    }

    fn apply_defaults(&mut self) {
        if self.db_path.is_empty() {
            self.db_path = "mender.db".into();
        }
        if self.repos_root.is_empty() {
            self.repos_root = ".repos".into();
        }
        if self.log_level.is_empty() {
            self.log_level = "info".into();
        }
        if self.daemon.webhook_port == 0 {
            self.daemon.webhook_port = 8080;
        }
        if self.daemon.max_workers == 0 {
            self.daemon.max_workers = 3;
        }
        if self.daemon.max_iterations == 0 {
            self.daemon.max_iterations = 3;
        }
        if self.daemon.sync_interval.is_empty() {
            self.daemon.sync_interval = "5m".into();
        }
        if self.daemon.pid_file.is_empty() {
            self.daemon.pid_file = "mender.pid".into();
        }
        if self.daemon.ci_check_interval.is_empty() {
            self.daemon.ci_check_interval = "30s".into();
        }
        if self.daemon.ci_check_timeout.is_empty() {
            self.daemon.ci_check_timeout = "30m".into();
        }
        if self.sentry.base_url.is_empty() {
            self.sentry.base_url = "https://sentry.io".into();
        }
        if self.llm.provider.is_empty() {
            self.llm.provider = "claude".into();
        }
        for project in &mut self.projects {
            if project.base_branch.is_empty() {
                project.base_branch = "main".into();
            }
        }
    }

    fn apply_env_overrides(&mut self) {
        if let Ok(v) = std::env::var("MENDER_WEBHOOK_SECRET") {
            if !v.is_empty() {
                self.daemon.webhook_secret = v;
            }
        }
        if let Ok(v) = std::env::var("GITLAB_TOKEN") {
            if !v.is_empty() {
                self.tokens.gitlab = v;
            }
        }
        if let Ok(v) = std::env::var("GITHUB_TOKEN") {
            if !v.is_empty() {
                self.tokens.github = v;
            }
        }
        if let Ok(v) = std::env::var("SENTRY_TOKEN") {
            if !v.is_empty() {
                self.tokens.sentry = v;
            }
        }
    }

    fn warn_tokens_in_file(&self) {
        if !self.tokens.gitlab.is_empty() && std::env::var("GITLAB_TOKEN").is_err() {
            tracing::warn!("gitlab token found in config file; prefer GITLAB_TOKEN env var");
        }
        if !self.tokens.github.is_empty() && std::env::var("GITHUB_TOKEN").is_err() {
            tracing::warn!("github token found in config file; prefer GITHUB_TOKEN env var");
        }
        if !self.tokens.sentry.is_empty() && std::env::var("SENTRY_TOKEN").is_err() {
            tracing::warn!("sentry token found in config file; prefer SENTRY_TOKEN env var");
        }
    }

    fn validate(&self) -> Result<()> {
        match self.llm.provider.as_str() {
            "claude" | "codex" => {}
            other => bail!("unsupported llm.provider: {other:?} (must be claude or codex)"),
        }
        match self.log_level.as_str() {
            "debug" | "info" | "warn" | "error" => {}
            other => bail!("unsupported log_level: {other:?}"),
        }
        parse_duration(&self.daemon.sync_interval)
            .with_context(|| format!("invalid daemon.sync_interval {:?}", self.daemon.sync_interval))?;
        if self.projects.is_empty() {
            bail!("at least one [[projects]] entry is required");
        }
        for (i, project) in self.projects.iter().enumerate() {
            if project.name.is_empty() {
                bail!("projects[{i}]: name is required");
            }
            if project.repo_url.is_empty() {
                bail!("project {:?}: repo_url is required", project.name);
            }
            if project.test_cmd.is_empty() {
                bail!("project {:?}: test_cmd is required", project.name);
            }
            if project.gitlab.is_none() && project.github.is_none() && project.sentry.is_none() {
                bail!(
                    "project {:?}: at least one source (gitlab/github/sentry) is required",
                    project.name
                );
            }
        }
        Ok(())
    }

    fn resolve_paths(&mut self) {
        self.db_path = abs_path(&self.base_dir, &self.db_path);
        self.repos_root = abs_path(&self.base_dir, &self.repos_root);
        self.daemon.pid_file = abs_path(&self.base_dir, &self.daemon.pid_file);
        if !self.log_file.is_empty() {
            self.log_file = abs_path(&self.base_dir, &self.log_file);
        }
        for project in &mut self.projects {
            if let Some(prompts) = &mut project.prompts {
                for path in [
                    &mut prompts.plan,
                    &mut prompts.implement,
                    &mut prompts.code_review,
                ] {
                    if !path.is_empty() {
                        *path = abs_path(&self.base_dir, path);
                    }
                }
            }
        }
    }

    pub fn project_by_name(&self, name: &str) -> Option<&ProjectConfig> {
        self.projects.iter().find(|p| p.name == name)
    }

    pub fn sync_interval(&self) -> Duration {
        parse_duration(&self.daemon.sync_interval).unwrap_or(Duration::from_secs(300))
    }

    /// Local bare-clone path for a project.
    pub fn local_repo_path(&self, project_name: &str) -> PathBuf {
        Path::new(&self.repos_root).join(sanitize(project_name))
    }

    /// Per-job working-copy path.
    pub fn worktree_path(&self, job_id: &str) -> PathBuf {
        Path::new(&self.repos_root).join("worktrees").join(job_id)
    }
}

fn abs_path(base: &Path, path: &str) -> String {
    let p = Path::new(path);
    if p.is_absolute() {
        path.to_string()
    } else {
        base.join(p).to_string_lossy().into_owned()
    }
}

/// Filesystem-safe project directory name.
pub fn sanitize(s: &str) -> String {
    let cleaned: String = s
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.') {
                c
            } else {
                '-'
            }
        })
        .collect();
    let trimmed = cleaned.trim_matches('-');
    if trimmed.is_empty() {
        "default".into()
    } else {
        trimmed.to_string()
    }
}

/// Parse duration strings like `30s`, `5m`, `2h`, `500ms`.
pub fn parse_duration(s: &str) -> Result<Duration> {
    let s = s.trim();
    let split = s
        .find(|c: char| !c.is_ascii_digit())
        .ok_or_else(|| anyhow::anyhow!("missing unit in duration {s:?}"))?;
    let (digits, unit) = s.split_at(split);
    let value: u64 = digits
        .parse()
        .with_context(|| format!("invalid duration {s:?}"))?;
    match unit {
        "ms" => Ok(Duration::from_millis(value)),
        "s" => Ok(Duration::from_secs(value)),
        "m" => Ok(Duration::from_secs(value * 60)),
        "h" => Ok(Duration::from_secs(value * 3600)),
        other => bail!("unknown duration unit {other:?} in {s:?}"),
    }
}
