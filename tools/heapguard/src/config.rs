use crate::ops::budget::{DEFAULT_STACK_KIB, DEFAULT_THREAD_COUNT};
use anyhow::{anyhow, bail, Context, Result};
use clap::Args;
use std::path::PathBuf;
use std::time::Duration;

pub const DEFAULT_DUMP_DIR: &str = "/tmp/dumps";

/// Every setting, read once from flags or the environment.
///
/// Which fields are required depends on the mode; [`Settings::launch`] and
/// [`Settings::upload_target`] validate the relevant subset.
#[derive(Args, Debug, Clone)]
pub struct Settings {
    /// Active application profile, passed through as `spring.profiles.active`.
    #[arg(long, env = "APP_PROFILE", global = true)]
    pub profile: Option<String>,

    /// Application jar to run.
    #[arg(long, env = "APP_ARTIFACT", global = true)]
    pub artifact: Option<PathBuf>,

    /// Bucket receiving OOM dump archives.
    #[arg(long, env = "DUMP_BUCKET", global = true)]
    pub bucket: Option<String>,

    /// Application tag used as the directory under `JAVA_APP_DUMPS/` in the bucket.
    #[arg(long, env = "APP_TAG", global = true)]
    pub app_tag: Option<String>,

    /// Expected number of runtime threads, used to reserve stack memory.
    #[arg(long, env = "THREAD_COUNT", global = true, default_value_t = DEFAULT_THREAD_COUNT)]
    pub thread_count: u64,

    /// Per-thread stack size in KiB.
    #[arg(long, env = "STACK_SIZE_KIB", global = true, default_value_t = DEFAULT_STACK_KIB)]
    pub stack_kib: u64,

    /// Runtime binary, resolved through PATH when it is a bare name.
    #[arg(long, env = "JAVA_BIN", global = true, default_value = "java")]
    pub java_bin: String,

    /// Extra runtime options (whitespace separated), appended after the computed flags.
    #[arg(long, env = "JAVA_EXTRA_OPTS", global = true)]
    pub extra_opts: Option<String>,

    /// Where the runtime writes its own heap dump and where captures are staged.
    #[arg(long, env = "DUMP_DIR", global = true, default_value = DEFAULT_DUMP_DIR)]
    pub dump_dir: PathBuf,

    #[arg(long, env = "JATTACH_BIN", global = true, default_value = "jattach")]
    pub jattach_bin: String,

    #[arg(long, env = "JCMD_BIN", global = true, default_value = "jcmd")]
    pub jcmd_bin: String,

    /// Upper bound for each thread/heap capture.
    #[arg(long, env = "DUMP_TOOL_TIMEOUT_SECS", global = true, default_value_t = 120)]
    pub tool_timeout_secs: u64,

    /// Upper bound for a single upload attempt.
    #[arg(long, env = "UPLOAD_TIMEOUT_SECS", global = true, default_value_t = 300)]
    pub upload_timeout_secs: u64,

    /// Upload attempts before giving up (backoff doubles from 2s).
    #[arg(long, env = "UPLOAD_ATTEMPTS", global = true, default_value_t = 3)]
    pub upload_attempts: u32,

    /// S3-compatible endpoint for HTTP PUT uploads. Uses the `aws` CLI when unset.
    #[arg(long, env = "STORAGE_ENDPOINT", global = true)]
    pub storage_endpoint: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LaunchConfig {
    pub profile: String,
    pub artifact: PathBuf,
    pub java_bin: PathBuf,
    pub thread_count: u64,
    pub stack_kib: u64,
    pub extra_opts: Vec<String>,
    pub dump_dir: PathBuf,
    /// Triggered-mode settings appended to the OOM hook command line.
    pub hook_args: Vec<String>,
}

/// Capture and kill settings. Always available; nothing here can be missing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DumpConfig {
    pub dump_dir: PathBuf,
    pub jattach_bin: String,
    pub jcmd_bin: String,
    pub tool_timeout: Duration,
    pub upload: UploadPolicy,
}

/// Where archives go. Absent when the bucket or app tag is not configured.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UploadTarget {
    pub bucket: String,
    pub app_tag: String,
    pub storage_endpoint: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UploadPolicy {
    pub attempts: u32,
    pub timeout: Duration,
    pub initial_backoff: Duration,
}

impl Settings {
    /// Validate the launch-mode subset. Missing runtime or artifact is fatal.
    pub fn launch(&self) -> Result<LaunchConfig> {
        let profile = required(&self.profile, "APP_PROFILE")?;
        let artifact = self
            .artifact
            .clone()
            .ok_or_else(|| anyhow!("APP_ARTIFACT is not set"))?;

        if !artifact.is_file() {
            bail!("application artifact {} not found", artifact.display());
        }

        let java_bin = which::which(&self.java_bin)
            .with_context(|| format!("locate runtime binary {:?}", self.java_bin))?;

        Ok(LaunchConfig {
            profile,
            artifact,
            java_bin,
            thread_count: self.thread_count,
            stack_kib: self.stack_kib,
            extra_opts: split_opts(self.extra_opts.as_deref()),
            dump_dir: self.dump_dir.clone(),
            hook_args: self.hook_args(),
        })
    }

    pub fn dump(&self) -> DumpConfig {
        DumpConfig {
            dump_dir: self.dump_dir.clone(),
            jattach_bin: self.jattach_bin.clone(),
            jcmd_bin: self.jcmd_bin.clone(),
            tool_timeout: Duration::from_secs(self.tool_timeout_secs),
            upload: UploadPolicy {
                attempts: self.upload_attempts.max(1),
                timeout: Duration::from_secs(self.upload_timeout_secs),
                initial_backoff: Duration::from_secs(2),
            },
        }
    }

    /// Validate the upload subset. An error here disables upload, nothing else.
    pub fn upload_target(&self) -> Result<UploadTarget> {
        let bucket = required(&self.bucket, "DUMP_BUCKET")?;
        let app_tag = required(&self.app_tag, "APP_TAG")?;

        if app_tag.contains('/') {
            bail!("APP_TAG must not contain '/': {app_tag:?}");
        }

        Ok(UploadTarget {
            bucket,
            app_tag,
            storage_endpoint: self
                .storage_endpoint
                .as_deref()
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(|s| s.trim_end_matches('/').to_string()),
        })
    }

    /// Flags that carry this invocation's triggered-mode settings into `heapguard oom`.
    ///
    /// The hook process inherits the runtime's environment but not our argv, so
    /// anything given as a flag at launch has to be spelled out again.
    pub fn hook_args(&self) -> Vec<String> {
        let mut args = vec![
            "--dump-dir".to_string(),
            self.dump_dir.display().to_string(),
            "--jattach-bin".to_string(),
            self.jattach_bin.clone(),
            "--jcmd-bin".to_string(),
            self.jcmd_bin.clone(),
            "--tool-timeout-secs".to_string(),
            self.tool_timeout_secs.to_string(),
            "--upload-timeout-secs".to_string(),
            self.upload_timeout_secs.to_string(),
            "--upload-attempts".to_string(),
            self.upload_attempts.to_string(),
        ];

        let optional = [
            ("--bucket", &self.bucket),
            ("--app-tag", &self.app_tag),
            ("--storage-endpoint", &self.storage_endpoint),
        ];
        for (flag, value) in optional {
            if let Some(value) = value {
                args.push(flag.to_string());
                args.push(value.clone());
            }
        }
        args
    }
}

fn required(value: &Option<String>, name: &str) -> Result<String> {
    value
        .as_deref()
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .map(str::to_string)
        .ok_or_else(|| anyhow!("{name} is not set"))
}

fn split_opts(raw: Option<&str>) -> Vec<String> {
    raw.map(|s| s.split_whitespace().map(str::to_string).collect())
        .unwrap_or_default()
}
