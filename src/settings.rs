use std::env;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

pub const ENV_PROFILE: &str = "NEUP_ENV";
pub const ENV_STATE_DIR: &str = "NEUP_STATE_DIR";
pub const ENV_DB_URL: &str = "NEUP_DB_URL";
pub const ENV_HTTP_ADDR: &str = "NEUP_HTTP_ADDR";
pub const ENV_WORKERS: &str = "NEUP_WORKERS";
pub const ENV_QUEUE_DEPTH: &str = "NEUP_QUEUE_DEPTH";
pub const ENV_TASK_TIMEOUT_SECS: &str = "NEUP_TASK_TIMEOUT_SECS";
pub const ENV_STALE_AFTER_SECS: &str = "NEUP_STALE_AFTER_SECS";
pub const ENV_FINISH_RETRY_ATTEMPTS: &str = "NEUP_FINISH_RETRY_ATTEMPTS";
pub const ENV_FINISH_RETRY_DELAY_MS: &str = "NEUP_FINISH_RETRY_DELAY_MS";
pub const ENV_TASK_LIST_LIMIT: &str = "NEUP_TASK_LIST_LIMIT";
pub const ENV_STRICT_CONFIG: &str = "NEUP_STRICT_CONFIG";
pub const ENV_EXECUTOR: &str = "NEUP_EXECUTOR";
pub const ENV_TOOL_CMD: &str = "NEUP_TOOL_CMD";
pub const ENV_TOOL_ARGS: &str = "NEUP_TOOL_ARGS";
pub const ENV_TOOL_SSH_TARGET: &str = "NEUP_TOOL_SSH_TARGET";
pub const ENV_TOOL_STOP_GRACE_SECS: &str = "NEUP_TOOL_STOP_GRACE_SECS";
pub const ENV_DRY_RUN_STEP_MS: &str = "NEUP_DRY_RUN_STEP_MS";
pub const ENV_LOG_LEVEL: &str = "NEUP_LOG_LEVEL";
pub const ENV_LOG_FORMAT: &str = "NEUP_LOG_FORMAT";

const DEFAULT_STATE_DIR: &str = "/srv/ne-upgrade-orchestrator";
const DEFAULT_DB_FILE: &str = "data/ne-upgrade-orchestrator.db";
const DEFAULT_HTTP_ADDR: &str = "0.0.0.0:8000";
const DEFAULT_WORKERS: u64 = 4;
const DEFAULT_QUEUE_DEPTH: u64 = 16;
const DEFAULT_TASK_TIMEOUT_SECS: u64 = 7_200; // 2 hours
const DEFAULT_STALE_AFTER_SECS: u64 = 600;
const DEFAULT_FINISH_RETRY_ATTEMPTS: u64 = 3;
const DEFAULT_FINISH_RETRY_DELAY_MS: u64 = 500;
const DEFAULT_TASK_LIST_LIMIT: u64 = 6;
const DEFAULT_TOOL_CMD: &str = "ssh_cli";
const DEFAULT_TOOL_STOP_GRACE_SECS: u64 = 5;
const DEFAULT_DRY_RUN_STEP_MS: u64 = 0;

#[derive(Debug, Error)]
pub enum SettingsError {
    #[error("invalid {name}={value}: expected {expected}")]
    Invalid {
        name: &'static str,
        value: String,
        expected: &'static str,
    },
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ExecutorMode {
    Command,
    DryRun,
}

impl ExecutorMode {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Command => "command",
            Self::DryRun => "dry-run",
        }
    }
}

#[derive(Clone, Debug)]
pub struct ToolSettings {
    pub program: String,
    pub base_args: Vec<String>,
    pub ssh_target: Option<String>,
    pub stop_grace: Duration,
    /// Pause between dry-run progress lines.
    pub dry_run_step: Duration,
}

#[derive(Clone, Debug)]
pub struct LifecycleSettings {
    pub workers: usize,
    pub queue_depth: usize,
    /// `None` disables the upper bound on a single upgrade run.
    pub task_timeout: Option<Duration>,
    pub stale_after: Duration,
    pub finish_retry_attempts: u32,
    pub finish_retry_delay: Duration,
    pub strict_config: bool,
}

impl Default for LifecycleSettings {
    fn default() -> Self {
        Self {
            workers: DEFAULT_WORKERS as usize,
            queue_depth: DEFAULT_QUEUE_DEPTH as usize,
            task_timeout: Some(Duration::from_secs(DEFAULT_TASK_TIMEOUT_SECS)),
            stale_after: Duration::from_secs(DEFAULT_STALE_AFTER_SECS),
            finish_retry_attempts: DEFAULT_FINISH_RETRY_ATTEMPTS as u32,
            finish_retry_delay: Duration::from_millis(DEFAULT_FINISH_RETRY_DELAY_MS),
            strict_config: false,
        }
    }
}

#[derive(Clone, Debug)]
pub struct Settings {
    pub profile: String,
    pub db_url: String,
    pub http_addr: String,
    pub task_list_limit: usize,
    pub executor: ExecutorMode,
    pub tool: ToolSettings,
    pub lifecycle: LifecycleSettings,
}

impl Settings {
    pub fn load() -> Result<Self, SettingsError> {
        let executor = match env_string(ENV_EXECUTOR).as_deref() {
            None | Some("command") => ExecutorMode::Command,
            Some("dry-run") | Some("dry_run") => ExecutorMode::DryRun,
            Some(other) => {
                return Err(SettingsError::Invalid {
                    name: ENV_EXECUTOR,
                    value: other.to_string(),
                    expected: "command or dry-run",
                });
            }
        };

        let timeout_secs = env_u64(ENV_TASK_TIMEOUT_SECS, DEFAULT_TASK_TIMEOUT_SECS)?;
        let workers = env_u64(ENV_WORKERS, DEFAULT_WORKERS)?.max(1);

        Ok(Self {
            profile: profile(),
            db_url: env_string(ENV_DB_URL).unwrap_or_else(default_db_url),
            http_addr: env_string(ENV_HTTP_ADDR).unwrap_or_else(|| DEFAULT_HTTP_ADDR.to_string()),
            task_list_limit: env_u64(ENV_TASK_LIST_LIMIT, DEFAULT_TASK_LIST_LIMIT)?.clamp(1, 100)
                as usize,
            executor,
            tool: ToolSettings {
                program: env_string(ENV_TOOL_CMD).unwrap_or_else(|| DEFAULT_TOOL_CMD.to_string()),
                base_args: env_string(ENV_TOOL_ARGS)
                    .map(|raw| raw.split_whitespace().map(str::to_string).collect())
                    .unwrap_or_default(),
                ssh_target: env_string(ENV_TOOL_SSH_TARGET),
                stop_grace: Duration::from_secs(env_u64(
                    ENV_TOOL_STOP_GRACE_SECS,
                    DEFAULT_TOOL_STOP_GRACE_SECS,
                )?),
                dry_run_step: Duration::from_millis(env_u64(
                    ENV_DRY_RUN_STEP_MS,
                    DEFAULT_DRY_RUN_STEP_MS,
                )?),
            },
            lifecycle: LifecycleSettings {
                workers: workers as usize,
                queue_depth: env_u64(ENV_QUEUE_DEPTH, DEFAULT_QUEUE_DEPTH)? as usize,
                task_timeout: (timeout_secs > 0).then(|| Duration::from_secs(timeout_secs)),
                stale_after: Duration::from_secs(env_u64(
                    ENV_STALE_AFTER_SECS,
                    DEFAULT_STALE_AFTER_SECS,
                )?),
                finish_retry_attempts: env_u64(
                    ENV_FINISH_RETRY_ATTEMPTS,
                    DEFAULT_FINISH_RETRY_ATTEMPTS,
                )?
                .max(1) as u32,
                finish_retry_delay: Duration::from_millis(env_u64(
                    ENV_FINISH_RETRY_DELAY_MS,
                    DEFAULT_FINISH_RETRY_DELAY_MS,
                )?),
                strict_config: env_flag(ENV_STRICT_CONFIG),
            },
        })
    }
}

pub fn profile() -> String {
    env::var(ENV_PROFILE)
        .unwrap_or_else(|_| "dev".to_string())
        .trim()
        .to_ascii_lowercase()
}

/// Fills profile-dependent defaults for variables that are unset or empty.
///
/// `NEUP_ENV` selects a coarse runtime profile:
/// - "test": in-memory database and the dry-run executor
/// - "demo": dry-run executor, state under the working directory
/// - "prod" / "dev" / anything else: real tool, file-backed database
///
/// Must run in `main` before any other thread is spawned.
pub fn apply_env_profile_defaults() {
    let profile = profile();

    let ensure = |key: &str, value: String| {
        if env_string(key).is_none() {
            // SAFETY: called once at process start, before any other threads exist.
            unsafe {
                env::set_var(key, value);
            }
        }
    };

    match profile.as_str() {
        "test" | "testing" => {
            ensure(ENV_DB_URL, "sqlite::memory:".to_string());
            ensure(ENV_EXECUTOR, ExecutorMode::DryRun.as_str().to_string());
        }
        other => {
            if other == "demo" {
                ensure(ENV_EXECUTOR, ExecutorMode::DryRun.as_str().to_string());
            }
            if env_string(ENV_STATE_DIR).is_none() {
                if let Ok(cwd) = env::current_dir() {
                    ensure(ENV_STATE_DIR, cwd.to_string_lossy().into_owned());
                }
            }
        }
    }
}

fn default_db_url() -> String {
    let state_dir = env_string(ENV_STATE_DIR).unwrap_or_else(|| DEFAULT_STATE_DIR.to_string());
    let path: PathBuf = Path::new(&state_dir).join(DEFAULT_DB_FILE);
    format!("sqlite://{}", path.to_string_lossy())
}

fn env_string(name: &str) -> Option<String> {
    env::var(name)
        .ok()
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

pub fn env_flag(name: &str) -> bool {
    env_string(name)
        .map(|v| matches!(v.to_ascii_lowercase().as_str(), "1" | "true" | "yes"))
        .unwrap_or(false)
}

fn env_u64(name: &'static str, default: u64) -> Result<u64, SettingsError> {
    match env_string(name) {
        None => Ok(default),
        Some(raw) => raw.parse().map_err(|_| SettingsError::Invalid {
            name,
            value: raw,
            expected: "a non-negative integer",
        }),
    }
}
