use std::{fmt, path::PathBuf, time::Duration};

use chrono::Local;
use clap::{ArgAction, Parser, Subcommand};
use grader_core::{
    compiler::Toolchains,
    judge::common::JudgeSettings,
    run::{IsolationPolicy, ResourceLimits},
};
use std::io::Write;
use uuid::Uuid;

use crate::agent::hostinfo;
use crate::reporter::RetryPolicy;

#[derive(Parser, Debug, Clone)]
#[command(name = "grader", version, about = "Autonomous grading executor")]
pub struct GraderOpt {
    /// For loading Opt from .env file
    #[arg(long, default_value = ".env")]
    pub env_path: PathBuf,
    #[arg(long, default_value = "override.env")]
    pub override_env_path: PathBuf,
    #[arg(long, global = true, env = "RUST_LOG", default_value = "info")]
    pub log_level: String,

    #[command(subcommand)]
    pub cmd: GraderCommand,

    #[arg(
        long,
        global = true,
        env = "GRADER_SERVER_URL",
        default_value = "http://localhost:8000/"
    )]
    pub server_url: String,
    #[arg(
        long,
        global = true,
        env = "GRADER_SECRET",
        default_value = "",
        hide_env_values = true
    )]
    pub secret: String,
    /// Defaults to an id derived from the hostname
    #[arg(long, global = true, env = "GRADER_EXECUTOR_UUID")]
    pub executor_uuid: Option<Uuid>,
    /// Absolute directory job workspaces are created in
    #[arg(long, global = true, env = "GRADER_WORK_DIR", default_value = "/tmp/grader")]
    pub work_dir: PathBuf,
    #[arg(long, global = true, env = "GRADER_SPOOL_DIR", default_value = "spool")]
    pub spool_dir: PathBuf,
    /// Number of jobs graded in parallel
    #[arg(long, global = true, env = "GRADER_SLOTS", default_value_t = 1)]
    pub slots: usize,
    /// Seconds between polls while idle
    #[arg(long, global = true, env = "GRADER_POLL_INTERVAL", default_value_t = 10)]
    pub poll_interval: u64,
    /// Ceiling in seconds for one build
    #[arg(long, global = true, env = "GRADER_BUILD_TIMEOUT", default_value_t = 60)]
    pub build_timeout: u64,
    /// Bytes kept of every log and explanation sent to the server
    #[arg(long, global = true, env = "GRADER_MESSAGE_SIZE", default_value_t = 10000)]
    pub message_size: usize,
    /// Remove job workspaces once reported
    #[arg(
        long,
        global = true,
        env = "GRADER_CLEANUP",
        default_value_t = true,
        action = ArgAction::Set
    )]
    pub cleanup: bool,
    #[arg(long, global = true, env = "GRADER_REPORT_ATTEMPTS", default_value_t = 5)]
    pub report_attempts: u32,
    /// Seconds before an HTTP request to the server is abandoned
    #[arg(long, global = true, env = "GRADER_HTTP_TIMEOUT", default_value_t = 30)]
    pub http_timeout: u64,
    /// best-effort, strict or off
    #[arg(long, global = true, env = "GRADER_ISOLATION", default_value = "best-effort")]
    pub isolation: IsolationPolicy,
    /// YAML file overriding the built-in toolchains
    #[arg(long, global = true, env = "GRADER_TOOLCHAINS")]
    pub toolchains: Option<PathBuf>,
    /// Serve the status API on this port
    #[arg(long, global = true, env = "GRADER_STATUS_PORT")]
    pub status_port: Option<u16>,
}

#[derive(Subcommand, Debug, Clone)]
pub enum GraderCommand {
    /// Pull jobs from the server and grade them until interrupted
    Serve,
    /// Grade a local directory holding `job.json` and the submission files
    Judge { dir: PathBuf },
    /// Check the configuration, list toolchains and register this host
    Configure,
    /// Deliver spooled reports
    Flush,
}

pub struct Secret(String);

impl Secret {
    pub fn expose(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for Secret {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self.0.is_empty() {
            true => write!(f, "\"\""),
            false => write!(f, "\"***\""),
        }
    }
}

/// Immutable executor settings, built once from the options.
#[derive(Debug)]
pub struct ExecutorConfig {
    pub server_url: String,
    pub secret: Secret,
    pub executor_uuid: Uuid,
    pub hostname: String,
    pub work_dir: PathBuf,
    pub spool_dir: PathBuf,
    pub slots: usize,
    pub poll_interval: Duration,
    pub message_size: usize,
    pub cleanup: bool,
    pub retry: RetryPolicy,
    pub http_timeout: Duration,
    pub status_port: Option<u16>,
}

impl GraderOpt {
    pub fn executor_config(&self) -> anyhow::Result<ExecutorConfig> {
        if !self.work_dir.is_absolute() {
            anyhow::bail!("GRADER_WORK_DIR must be absolute, got {:?}", self.work_dir);
        }
        if self.slots == 0 {
            anyhow::bail!("GRADER_SLOTS must be at least 1");
        }
        if self.report_attempts == 0 {
            anyhow::bail!("GRADER_REPORT_ATTEMPTS must be at least 1");
        }
        let hostname = hostinfo::hostname();
        Ok(ExecutorConfig {
            server_url: self.server_url.clone(),
            secret: Secret(self.secret.clone()),
            executor_uuid: self
                .executor_uuid
                .unwrap_or_else(|| hostinfo::default_executor_uuid(&hostname)),
            hostname,
            work_dir: self.work_dir.clone(),
            spool_dir: self.spool_dir.clone(),
            slots: self.slots,
            poll_interval: Duration::from_secs(self.poll_interval.max(1)),
            message_size: self.message_size,
            cleanup: self.cleanup,
            retry: RetryPolicy {
                attempts: self.report_attempts,
                ..RetryPolicy::default()
            },
            http_timeout: Duration::from_secs(self.http_timeout.max(1)),
            status_port: self.status_port,
        })
    }

    pub fn judge_settings(&self) -> JudgeSettings {
        JudgeSettings {
            build_limits: ResourceLimits::for_build(self.build_timeout),
            isolation: self.isolation,
            log_limit: self.message_size,
        }
    }

    pub fn load_toolchains(&self) -> anyhow::Result<Toolchains> {
        match &self.toolchains {
            Some(path) => {
                log::info!("Loading toolchain overrides from {:?}", path);
                Ok(Toolchains::from_yaml_file(path)?)
            }
            None => Ok(Toolchains::default()),
        }
    }
}

/// Try to load env from a .env file, if not found, fallback to ENV
pub fn load_option() -> GraderOpt {
    // First load env_path from Args
    let opt = GraderOpt::parse();
    if opt.env_path.exists() {
        eprintln!("loading env from file: {:?}", opt.env_path);
        dotenv::from_path(&opt.env_path).ok();
    } else {
        dotenv::dotenv().ok();
    }
    if opt.override_env_path.exists() {
        eprintln!(
            "loading override env from file: {:?}",
            opt.override_env_path
        );
        dotenv::from_path(&opt.override_env_path).ok();
    }

    // Load opt again with ENV
    let opt = GraderOpt::parse();
    setup_logger(&opt.log_level);
    log::debug!("load opt: {:?}", opt.cmd);
    opt
}

fn setup_logger(level: &str) {
    let env = env_logger::Env::default().default_filter_or(level);
    env_logger::Builder::from_env(env)
        .format(|buf, record| {
            writeln!(
                buf,
                "{} {:5} [{}:{}] {}",
                Local::now().format("%Y-%m-%d %H:%M:%S"),
                record.level(),
                record.file().unwrap_or("<unknown>"),
                record.line().unwrap_or(0),
                &record.args()
            )
        })
        .init();
}
