mod daemon;
mod pid;

use anyhow::{Context, Result, bail};
use clap::{Parser, Subcommand};
use mender_core::config::{Config, parse_duration};
use mender_core::job::{JobState, display_state, short_id, truncate};
use mender_core::migrate::migrate_config_file;
use mender_core::session::TokenSummary;
use mender_db::jobs::{JobFilter, JobSort, StateFilter};
use mender_db::{Store, StoreError};
use std::collections::HashMap;
use std::path::{Path, PathBuf};

#[derive(Parser)]
#[command(name = "mender", about = "Autonomous issue-to-pull-request daemon", version)]
struct Cli {
    /// Path to the configuration file.
    #[arg(long, default_value = "mender.toml", global = true)]
    config: PathBuf,

    /// Machine-readable JSON output.
    #[arg(long, global = true)]
    json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the daemon in the foreground.
    Start,
    /// Stop a running daemon.
    Stop,
    /// Write a starter config and create the database.
    Init,
    /// Show daemon liveness and job counts.
    Status,
    /// List jobs with filters.
    List {
        /// Filter by project name.
        #[arg(long)]
        project: Option<String>,
        /// Filter by state (all, active, merged, or a concrete state).
        #[arg(long, default_value = "all")]
        state: String,
        /// Sort by field: updated_at, created_at, state, or project.
        #[arg(long, default_value = "updated_at")]
        sort: String,
        /// Sort in ascending order.
        #[arg(long)]
        asc: bool,
        /// Sort in descending order (default).
        #[arg(long)]
        desc: bool,
        /// Page number (1-based); enables pagination.
        #[arg(long)]
        page: Option<usize>,
        /// Rows per page.
        #[arg(long)]
        page_size: Option<usize>,
        /// Disable pagination and show everything.
        #[arg(long)]
        all: bool,
        /// Show a token-usage column.
        #[arg(long)]
        cost: bool,
        /// Refresh output periodically.
        #[arg(long)]
        watch: bool,
        /// Refresh interval for --watch (e.g. 5s, 500ms).
        #[arg(long, default_value = "5s")]
        interval: String,
    },
    /// Show the session log for a job (accepts a unique id prefix).
    Logs { job: String },
    /// Approve a job that is ready.
    Approve { job: String },
    /// Reject a job that is ready.
    Reject {
        job: String,
        /// Why the job was rejected.
        #[arg(long)]
        reason: String,
    },
    /// Re-queue a failed or rejected job.
    Retry { job: String },
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    let json = cli.json;
    if let Err(e) = run(cli).await {
        if json {
            println!("{}", serde_json::json!({"error": format!("{e:#}")}));
        } else {
            eprintln!("error: {e:#}");
        }
        std::process::exit(1);
    }
}

async fn run(cli: Cli) -> Result<()> {
    if matches!(cli.command, Commands::Init) {
        return cmd_init(&cli.config, cli.json);
    }

    migrate_config_file(&cli.config)?;
    let cfg = Config::load(&cli.config)?;
    init_logging(&cfg, matches!(cli.command, Commands::Start))?;

    match cli.command {
        Commands::Init => unreachable!("handled above"),
        Commands::Start => daemon::run(cfg).await,
        Commands::Stop => cmd_stop(&cfg, cli.json),
        Commands::Status => cmd_status(&cfg, cli.json),
        Commands::List {
            project,
            state,
            sort,
            asc,
            desc,
            page,
            page_size,
            all,
            cost,
            watch,
            interval,
        } => {
            let options = ListOptions {
                project,
                state,
                sort,
                asc,
                desc,
                page,
                page_size,
                all,
                cost,
            };
            if watch {
                let interval = parse_duration(&interval).context("invalid --interval")?;
                let store = open_store(&cfg)?;
                loop {
                    cmd_list(&store, &options, cli.json)?;
                    tokio::time::sleep(interval).await;
                    if !cli.json {
                        println!();
                    }
                }
            }
            let store = open_store(&cfg)?;
            cmd_list(&store, &options, cli.json)
        }
        Commands::Logs { job } => cmd_logs(&cfg, &job, cli.json),
        Commands::Approve { job } => cmd_approve(&cfg, &job, cli.json),
        Commands::Reject { job, reason } => cmd_reject(&cfg, &job, &reason, cli.json),
        Commands::Retry { job } => cmd_retry(&cfg, &job, cli.json),
    }
}

fn init_logging(cfg: &Config, is_daemon: bool) -> Result<()> {
    use tracing_subscriber::EnvFilter;

    // CLI commands stay quiet unless asked; the daemon honors log_level.
    let default_level = if is_daemon {
        cfg.log_level.as_str()
    } else {
        "warn"
    };
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(format!("mender={default_level},{default_level}")));

    if is_daemon && !cfg.log_file.is_empty() {
        let file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&cfg.log_file)
            .with_context(|| format!("open log file {}", cfg.log_file))?;
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_writer(std::sync::Mutex::new(file))
            .with_ansi(false)
            .init();
    } else {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_writer(std::io::stderr)
            .init();
    }
    Ok(())
}

fn open_store(cfg: &Config) -> Result<Store> {
    Store::open(Path::new(&cfg.db_path))
        .with_context(|| format!("open store {}", cfg.db_path))
}

const CONFIG_TEMPLATE: &str = r#"# mender configuration
config_version = 1

db_path = "mender.db"
repos_root = ".repos"
log_level = "info"
# log_file = "mender.log"

[daemon]
webhook_port = 8080
# webhook_secret = ""   # prefer the MENDER_WEBHOOK_SECRET env var
max_workers = 3
max_iterations = 3
sync_interval = "5m"
pid_file = "mender.pid"
auto_pr = false
ci_check_interval = "30s"   # How often to poll CI check-runs
ci_check_timeout = "30m"    # Max wait for CI checks before rejecting

[tokens]
# gitlab = ""   # prefer GITLAB_TOKEN
# github = ""   # prefer GITHUB_TOKEN
# sentry = ""   # prefer SENTRY_TOKEN

[sentry]
base_url = "https://sentry.io"

[llm]
provider = "claude"   # claude | codex

[[projects]]
name = "myproject"
repo_url = "https://github.com/org/repo.git"
test_cmd = "cargo test"
base_branch = "main"

[projects.github]
owner = "org"
repo = "repo"
"#;

fn cmd_init(config_path: &Path, json: bool) -> Result<()> {
    if config_path.exists() {
        bail!("config already exists at {}", config_path.display());
    }
    std::fs::write(config_path, CONFIG_TEMPLATE)
        .with_context(|| format!("write config {}", config_path.display()))?;

    // Create the database next to it so `start` finds a ready store.
    let db_path = config_path
        .parent()
        .unwrap_or(Path::new("."))
        .join("mender.db");
    Store::open(&db_path).context("initialize store")?;

    if json {
        println!(
            "{}",
            serde_json::json!({
                "config": config_path.to_string_lossy(),
                "db_path": db_path.to_string_lossy(),
            })
        );
    } else {
        println!("Wrote {}", config_path.display());
        println!("Initialized store at {}", db_path.display());
        println!("Edit the [[projects]] section, then run 'mender start'.");
    }
    Ok(())
}

fn cmd_stop(cfg: &Config, json: bool) -> Result<()> {
    let pid_path = Path::new(&cfg.daemon.pid_file);
    if !pid::is_running(pid_path) {
        pid::remove_pid(pid_path);
        if json {
            println!("{}", serde_json::json!({"stopped": false, "running": false}));
        } else {
            println!("Daemon is not running.");
        }
        return Ok(());
    }
    let daemon_pid = pid::read_pid(pid_path)?;
    nix::sys::signal::kill(
        nix::unistd::Pid::from_raw(daemon_pid),
        nix::sys::signal::Signal::SIGTERM,
    )
    .context("send SIGTERM")?;
    if json {
        println!("{}", serde_json::json!({"stopped": true, "pid": daemon_pid}));
    } else {
        println!("Sent SIGTERM to pid {daemon_pid}.");
    }
    Ok(())
}

fn cmd_status(cfg: &Config, json: bool) -> Result<()> {
    let store = open_store(cfg)?;
    let counts = store.count_jobs_by_state()?;
    let running = pid::is_running(Path::new(&cfg.daemon.pid_file));
    let total: i64 = counts.iter().map(|(_, n)| n).sum();

    if json {
        let by_state: serde_json::Map<String, serde_json::Value> = counts
            .iter()
            .map(|(state, n)| (state.as_str().to_string(), serde_json::json!(n)))
            .collect();
        println!(
            "{}",
            serde_json::json!({
                "daemon_running": running,
                "total_jobs": total,
                "jobs_by_state": by_state,
            })
        );
        return Ok(());
    }

    println!(
        "Daemon: {}",
        if running { "running" } else { "stopped" }
    );
    println!("Jobs: {total}");
    for (state, n) in counts {
        println!("  {:<20} {n}", state.as_str());
    }
    Ok(())
}

struct ListOptions {
    project: Option<String>,
    state: String,
    sort: String,
    asc: bool,
    desc: bool,
    page: Option<usize>,
    page_size: Option<usize>,
    all: bool,
    cost: bool,
}

fn normalize_state_filter(state: &str) -> Result<StateFilter> {
    // `resolving` is accepted shorthand.
    let state = if state == "resolving" {
        "resolving_conflicts"
    } else {
        state
    };
    match state {
        "all" => Ok(StateFilter::All),
        "active" => Ok(StateFilter::Active),
        "merged" => Ok(StateFilter::Merged),
        other => other
            .parse::<JobState>()
            .map(StateFilter::Exact)
            .map_err(|_| {
                anyhow::anyhow!(
                    "invalid --state {other:?} (expected all, active, merged, or a job state)"
                )
            }),
    }
}

fn normalize_sort(sort: &str) -> Result<JobSort> {
    match sort {
        "updated_at" => Ok(JobSort::UpdatedAt),
        "created_at" => Ok(JobSort::CreatedAt),
        "state" => Ok(JobSort::State),
        "project" => Ok(JobSort::Project),
        other => bail!(
            "invalid --sort {other:?} (expected one of: updated_at, created_at, state, project)"
        ),
    }
}

fn format_tokens(summary: &TokenSummary) -> String {
    fn compact(n: i64) -> String {
        if n >= 10_000 {
            format!("{}k", n / 1000)
        } else {
            n.to_string()
        }
    }
    format!(
        "{}/{}",
        compact(summary.total_input_tokens),
        compact(summary.total_output_tokens)
    )
}

fn cmd_list(store: &Store, options: &ListOptions, json: bool) -> Result<()> {
    if options.asc && options.desc {
        bail!("--asc and --desc cannot be used together");
    }
    let sort = normalize_sort(&options.sort)?;
    let filter = JobFilter {
        project: options.project.clone(),
        state: normalize_state_filter(&options.state)?,
    };
    let paginate = !options.all && (options.page.is_some() || options.page_size.is_some());
    let page = options.page.unwrap_or(1);
    let page_size = options.page_size.unwrap_or(20);
    if paginate {
        if page < 1 {
            bail!("invalid --page value {page}; expected >= 1");
        }
        if page_size < 1 {
            bail!("invalid --page-size value {page_size}; expected >= 1");
        }
    }

    let (jobs, total) = if paginate {
        store.list_jobs_page(&filter, sort, options.asc, page, page_size)?
    } else {
        let jobs = store.list_jobs(&filter, sort, options.asc)?;
        let total = jobs.len();
        (jobs, total)
    };

    let cost_map: HashMap<String, TokenSummary> = if options.cost && !jobs.is_empty() {
        let ids: Vec<String> = jobs.iter().map(|j| j.id.clone()).collect();
        store.aggregate_tokens_for_jobs(&ids).unwrap_or_default()
    } else {
        HashMap::new()
    };

    if json {
        if paginate {
            println!(
                "{}",
                serde_json::json!({
                    "jobs": jobs,
                    "page": page,
                    "page_size": page_size,
                    "total": total,
                })
            );
        } else {
            println!("{}", serde_json::to_string(&jobs)?);
        }
        return Ok(());
    }

    if paginate {
        let pages = total.div_ceil(page_size);
        println!("Page {page}/{pages}, total rows: {total}");
    }
    if jobs.is_empty() && !paginate {
        println!("No jobs found. Run 'mender start' to begin processing issues.");
        return Ok(());
    }

    if options.cost {
        println!(
            "{:<14} {:<20} {:<13} {:<13} {:<5} {:<10} {:<40} {}",
            "JOB", "STATE", "PROJECT", "SOURCE", "RETRY", "TOKENS", "ISSUE", "UPDATED"
        );
    } else {
        println!(
            "{:<14} {:<20} {:<13} {:<13} {:<5} {:<50} {}",
            "JOB", "STATE", "PROJECT", "SOURCE", "RETRY", "ISSUE", "UPDATED"
        );
    }
    println!("{}", "-".repeat(136));

    let (mut queued, mut active, mut failed, mut merged) = (0, 0, 0, 0);
    for job in &jobs {
        let source = if !job.issue_source.is_empty() && !job.source_issue_id.is_empty() {
            format!("{} #{}", capitalize(&job.issue_source), job.source_issue_id)
        } else {
            String::new()
        };
        let state_display = display_state(
            job.state,
            job.pr_merged_at.as_deref(),
            job.pr_closed_at.as_deref(),
        );
        let retry = format!("{}/{}", job.iteration, job.max_iterations);

        if options.cost {
            let tokens = cost_map
                .get(&job.id)
                .filter(|s| s.session_count > 0)
                .map(format_tokens)
                .unwrap_or_else(|| "-".to_string());
            println!(
                "{:<14} {:<20} {:<13} {:<13} {:<5} {:<10} {:<40} {}",
                short_id(&job.id),
                state_display,
                truncate(&job.project_name, 12),
                source,
                retry,
                tokens,
                truncate(&job.issue_title, 40),
                job.updated_at
            );
        } else {
            println!(
                "{:<14} {:<20} {:<13} {:<13} {:<5} {:<50} {}",
                short_id(&job.id),
                state_display,
                truncate(&job.project_name, 12),
                source,
                retry,
                truncate(&job.issue_title, 50),
                job.updated_at
            );
        }

        if job.state == JobState::Queued {
            queued += 1;
        }
        if job.state.is_in_flight() {
            active += 1;
        }
        if matches!(
            job.state,
            JobState::Failed | JobState::Rejected | JobState::Cancelled
        ) {
            failed += 1;
        }
        if job.state == JobState::Approved && job.pr_merged_at.as_deref().is_some_and(|t| !t.is_empty())
        {
            merged += 1;
        }
    }
    println!(
        "Total: {} jobs ({queued} queued, {active} active, {failed} failed, {merged} merged)",
        jobs.len()
    );
    Ok(())
}

fn cmd_logs(cfg: &Config, job_ref: &str, json: bool) -> Result<()> {
    let store = open_store(cfg)?;
    let job_id = resolve_job(&store, job_ref)?;
    let job = store.get_job(&job_id)?;
    let sessions = store.list_sessions_by_job(&job_id)?;

    if json {
        println!(
            "{}",
            serde_json::json!({"job": job, "sessions": sessions})
        );
        return Ok(());
    }

    println!(
        "Job {} [{}] {} — {}",
        short_id(&job.id),
        job.state,
        job.project_name,
        job.issue_title
    );
    if let Some(error) = &job.error_message {
        println!("Error: {error}");
    }
    if sessions.is_empty() {
        println!("No sessions recorded.");
        return Ok(());
    }
    for session in &sessions {
        println!(
            "\n[{}] {} iter={} provider={} status={} tokens={}/{} duration={}ms",
            session.created_at,
            session.step,
            session.iteration,
            session.provider,
            session.status.as_str(),
            session.input_tokens,
            session.output_tokens,
            session.duration_ms
        );
        if let Some(error) = &session.error_message {
            println!("  error: {error}");
        }
        if !session.response.is_empty() {
            println!("  {}", truncate(&session.response.replace('\n', " "), 200));
        }
    }
    Ok(())
}

fn cmd_approve(cfg: &Config, job_ref: &str, json: bool) -> Result<()> {
    let store = open_store(cfg)?;
    let job_id = resolve_job(&store, job_ref)?;
    store
        .transition_state(&job_id, JobState::Ready, JobState::Approved)
        .map_err(|e| match e {
            StoreError::IllegalTransition { from, .. } => {
                anyhow::anyhow!("job {} is {from}, not ready", short_id(&job_id))
            }
            other => other.into(),
        })?;
    if json {
        println!("{}", serde_json::json!({"job": job_id, "state": "approved"}));
    } else {
        println!("Approved {}.", short_id(&job_id));
    }
    Ok(())
}

fn cmd_reject(cfg: &Config, job_ref: &str, reason: &str, json: bool) -> Result<()> {
    let store = open_store(cfg)?;
    let job_id = resolve_job(&store, job_ref)?;
    store
        .transition_state(&job_id, JobState::Ready, JobState::Rejected)
        .map_err(|e| match e {
            StoreError::IllegalTransition { from, .. } => {
                anyhow::anyhow!("job {} is {from}, not ready", short_id(&job_id))
            }
            other => other.into(),
        })?;
    store.update_job_field(&job_id, "reject_reason", Some(reason))?;
    if json {
        println!(
            "{}",
            serde_json::json!({"job": job_id, "state": "rejected", "reason": reason})
        );
    } else {
        println!("Rejected {}.", short_id(&job_id));
    }
    Ok(())
}

fn cmd_retry(cfg: &Config, job_ref: &str, json: bool) -> Result<()> {
    let store = open_store(cfg)?;
    let job_id = resolve_job(&store, job_ref)?;
    store.retry_job(&job_id).map_err(|e| match e {
        StoreError::IllegalTransition { from, .. } => anyhow::anyhow!(
            "job {} is {from}; only failed or rejected jobs can be retried",
            short_id(&job_id)
        ),
        other => other.into(),
    })?;
    if json {
        println!("{}", serde_json::json!({"job": job_id, "state": "queued"}));
    } else {
        println!(
            "Re-queued {}; the daemon will pick it up on its next sync pass.",
            short_id(&job_id)
        );
    }
    Ok(())
}

fn resolve_job(store: &Store, job_ref: &str) -> Result<String> {
    store.resolve_job_id(job_ref).map_err(|e| match e {
        StoreError::AmbiguousId(prefix) => {
            anyhow::anyhow!("job id prefix {prefix:?} matches multiple jobs; add more characters")
        }
        StoreError::NotFound(_) => anyhow::anyhow!("no job matches {job_ref:?}"),
        other => other.into(),
    })
}

fn capitalize(s: &str) -> String {
    let mut chars = s.chars();
    match chars.next() {
        Some(first) => first.to_uppercase().collect::<String>() + chars.as_str(),
        None => String::new(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn state_filter_normalization() {
        assert!(matches!(
            normalize_state_filter("all").unwrap(),
            StateFilter::All
        ));
        assert!(matches!(
            normalize_state_filter("active").unwrap(),
            StateFilter::Active
        ));
        assert!(matches!(
            normalize_state_filter("merged").unwrap(),
            StateFilter::Merged
        ));
        assert!(matches!(
            normalize_state_filter("resolving").unwrap(),
            StateFilter::Exact(JobState::ResolvingConflicts)
        ));
        assert!(matches!(
            normalize_state_filter("queued").unwrap(),
            StateFilter::Exact(JobState::Queued)
        ));
        assert!(normalize_state_filter("bogus").is_err());
    }

    #[test]
    fn sort_normalization() {
        assert!(matches!(normalize_sort("updated_at").unwrap(), JobSort::UpdatedAt));
        assert!(matches!(normalize_sort("project").unwrap(), JobSort::Project));
        assert!(normalize_sort("title").is_err());
    }

    #[test]
    fn config_template_parses_and_is_current() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("mender.toml");
        std::fs::write(&path, CONFIG_TEMPLATE).unwrap();

        let cfg = Config::load(&path).unwrap();
        assert_eq!(cfg.config_version, mender_core::migrate::CURRENT_CONFIG_VERSION);
        assert_eq!(cfg.projects.len(), 1);

        // A freshly written template needs no migration.
        assert!(!migrate_config_file(&path).unwrap());
    }

    #[test]
    fn token_formatting() {
        let summary = TokenSummary {
            total_input_tokens: 123,
            total_output_tokens: 45_600,
            session_count: 3,
            provider: "claude".into(),
        };
        assert_eq!(format_tokens(&summary), "123/45k");
    }
}
