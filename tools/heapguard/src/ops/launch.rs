use crate::config::{LaunchConfig, Settings};
use crate::ops::budget::MemoryBudget;
use crate::ops::limits::LimitInspector;
use anyhow::{Context, Result};
use std::os::unix::process::CommandExt;
use std::path::{Path, PathBuf};
use std::process::Command;

/// First argument the runtime's OOM hook passes back to us.
pub const TRIGGER_KEYWORD: &str = "oom";

/// The runtime replaces this with the failing process id when running the hook.
const PID_PLACEHOLDER: &str = "%p";

/// Runtime program and arguments, fixed before exec.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LaunchSpec {
    pub program: PathBuf,
    pub args: Vec<String>,
}

impl LaunchSpec {
    pub fn build(budget: &MemoryBudget, cfg: &LaunchConfig, self_exe: &Path) -> Self {
        let mut args = vec![
            "-XX:+UseContainerSupport".to_string(),
            format!("-Xms{}m", budget.init_heap_mib),
            format!("-Xmx{}m", budget.max_heap_mib),
            format!("-XX:MaxMetaspaceSize={}m", budget.metaspace_mib),
            format!("-XX:MaxDirectMemorySize={}m", budget.direct_mib),
            format!("-XX:ReservedCodeCacheSize={}m", budget.code_cache_mib),
            format!(
                "-XX:CompressedClassSpaceSize={}m",
                budget.compressed_class_space_mib
            ),
            format!("-Xss{}k", cfg.stack_kib),
            "-XX:+UseG1GC".to_string(),
            "-XX:+UseStringDeduplication".to_string(),
            "-XX:+HeapDumpOnOutOfMemoryError".to_string(),
            format!("-XX:HeapDumpPath={}", cfg.dump_dir.display()),
            format!(
                "-XX:OnOutOfMemoryError={}",
                oom_hook(self_exe, &cfg.hook_args)
            ),
        ];

        args.extend(cfg.extra_opts.iter().cloned());
        args.push(format!("-Dspring.profiles.active={}", cfg.profile));
        args.push("-jar".to_string());
        args.push(cfg.artifact.display().to_string());

        Self {
            program: cfg.java_bin.clone(),
            args,
        }
    }

    pub fn command(&self) -> Command {
        let mut cmd = Command::new(&self.program);
        cmd.args(&self.args);
        cmd
    }

    /// Replace this process with the runtime. Only returns on failure.
    pub fn exec(&self) -> anyhow::Error {
        let err = self.command().exec();
        anyhow::Error::new(err).context(format!("exec {}", self.program.display()))
    }

    pub fn display(&self) -> String {
        std::iter::once(self.program.display().to_string())
            .chain(self.args.iter().map(|a| shell_quote(a)))
            .collect::<Vec<_>>()
            .join(" ")
    }
}

/// Command the runtime runs on OOM: `<self> oom %p [settings...]`.
///
/// The runtime hands the string to `sh -c`, so every word is shell-quoted.
pub fn oom_hook(self_exe: &Path, forwarded: &[String]) -> String {
    let exe = self_exe.display().to_string();
    [exe.as_str(), TRIGGER_KEYWORD, PID_PLACEHOLDER]
        .into_iter()
        .chain(forwarded.iter().map(String::as_str))
        .map(shell_quote)
        .collect::<Vec<_>>()
        .join(" ")
}

/// Everything up to exec: read the limit, size the budget, build the command line.
pub fn prepare(
    cfg: &LaunchConfig,
    inspector: &LimitInspector,
    self_exe: &Path,
) -> Result<LaunchSpec> {
    let limit = inspector.read_limit().context("read memory limit")?;
    let budget = MemoryBudget::compute(limit.bytes, cfg.thread_count, cfg.stack_kib)?;
    Ok(LaunchSpec::build(&budget, cfg, self_exe))
}

pub fn run(settings: &Settings, dry_run: bool) -> Result<()> {
    let cfg = settings.launch().context("launch configuration")?;

    if let Err(err) = settings.upload_target() {
        tracing::warn!(
            error = %format!("{err:#}"),
            "dump upload is not configured; OOM archives will stay on local disk"
        );
    }

    let self_exe = std::env::current_exe().context("resolve own executable path")?;
    let spec = prepare(&cfg, &LimitInspector::default(), &self_exe)?;

    if dry_run {
        println!("{}", spec.display());
        return Ok(());
    }

    std::fs::create_dir_all(&cfg.dump_dir)
        .with_context(|| format!("create dump dir {}", cfg.dump_dir.display()))?;

    tracing::info!(program = %spec.program.display(), "launching runtime");
    Err(spec.exec())
}

fn shell_quote(arg: &str) -> String {
    let plain = arg
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || "-_=+:./,%@".contains(c));
    if plain && !arg.is_empty() {
        arg.to_string()
    } else {
        format!("'{}'", arg.replace('\'', r"'\''"))
    }
}
