use crate::config::DumpConfig;
use crate::ops::util;
use anyhow::{Context, Result};
use serde::Serialize;
use std::fs::File;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use std::time::Duration;

/// Identity shared by every artifact of one triggered invocation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DumpSession {
    pub pid: i32,
    pub host_id: String,
    pub timestamp: String,
    pub dir: PathBuf,
}

impl DumpSession {
    pub fn new(pid: i32, dir: impl Into<PathBuf>) -> Self {
        Self {
            pid,
            host_id: util::host_id(),
            timestamp: chrono::Utc::now().format("%Y%m%dT%H%M%SZ").to_string(),
            dir: dir.into(),
        }
    }

    fn path(&self, suffix: &str) -> PathBuf {
        self.dir.join(format!("{}{}", self.host_id, suffix))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum ArtifactKind {
    ThreadDump,
    HeapDump,
}

/// How a capture tool delivers its artifact.
#[derive(Debug, Clone, PartialEq, Eq)]
enum Sink {
    /// The tool prints the artifact; stdout is redirected into the file.
    Stdout,
    /// The tool writes the file itself (the path is one of its arguments).
    ToolWrites,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CaptureStep {
    pub name: &'static str,
    pub kind: ArtifactKind,
    pub program: String,
    pub args: Vec<String>,
    pub output: PathBuf,
    sink: Sink,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "kebab-case")]
pub enum CaptureOutcome {
    Captured { path: PathBuf, bytes: u64 },
    Failed { reason: String },
    TimedOut { after_secs: u64 },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CaptureRecord {
    pub name: String,
    pub kind: ArtifactKind,
    #[serde(flatten)]
    pub outcome: CaptureOutcome,
}

/// Result of one triggered collection: every attempt, successful or not.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DumpManifest {
    pub host_id: String,
    pub pid: i32,
    pub timestamp: String,
    pub records: Vec<CaptureRecord>,
}

impl DumpManifest {
    /// Files that exist and can go into the archive.
    pub fn files(&self) -> Vec<&Path> {
        self.records
            .iter()
            .filter_map(|r| match &r.outcome {
                CaptureOutcome::Captured { path, .. } => Some(path.as_path()),
                _ => None,
            })
            .collect()
    }
}

/// The four redundant captures, in the order they run.
///
/// jattach goes first because it needs nothing but the socket; jcmd is the fallback
/// for runtimes where the attach listener misbehaves.
pub fn plan(session: &DumpSession, jattach: &str, jcmd: &str) -> Vec<CaptureStep> {
    let pid = session.pid.to_string();

    let jattach_tdump = session.path(".tdump");
    let jattach_hprof = session.path(".hprof");
    let jcmd_hprof = session.path("-jcmd.hprof");
    let jcmd_tdump = session.path("-jcmd.tdump");

    vec![
        CaptureStep {
            name: "jattach-threaddump",
            kind: ArtifactKind::ThreadDump,
            program: jattach.to_string(),
            args: vec![pid.clone(), "threaddump".to_string()],
            output: jattach_tdump,
            sink: Sink::Stdout,
        },
        CaptureStep {
            name: "jattach-dumpheap",
            kind: ArtifactKind::HeapDump,
            program: jattach.to_string(),
            args: vec![
                pid.clone(),
                "dumpheap".to_string(),
                jattach_hprof.display().to_string(),
            ],
            output: jattach_hprof,
            sink: Sink::ToolWrites,
        },
        CaptureStep {
            name: "jcmd-heap-dump",
            kind: ArtifactKind::HeapDump,
            program: jcmd.to_string(),
            args: vec![
                pid.clone(),
                "GC.heap_dump".to_string(),
                jcmd_hprof.display().to_string(),
            ],
            output: jcmd_hprof,
            sink: Sink::ToolWrites,
        },
        CaptureStep {
            name: "jcmd-thread-print",
            kind: ArtifactKind::ThreadDump,
            program: jcmd.to_string(),
            args: vec![pid, "Thread.print".to_string()],
            output: jcmd_tdump,
            sink: Sink::Stdout,
        },
    ]
}

/// Run one capture. Never fails; problems are recorded in the outcome.
pub fn run_step(step: &CaptureStep, timeout: Duration) -> CaptureRecord {
    let outcome = match try_step(step, timeout) {
        Ok(outcome) => outcome,
        Err(err) if util::is_timeout(&err) => CaptureOutcome::TimedOut {
            after_secs: timeout.as_secs(),
        },
        Err(err) => CaptureOutcome::Failed {
            reason: format!("{err:#}"),
        },
    };

    match &outcome {
        CaptureOutcome::Captured { path, bytes } => {
            tracing::info!(step = step.name, path = %path.display(), bytes, "captured");
        }
        CaptureOutcome::Failed { reason } => {
            tracing::warn!(step = step.name, %reason, "capture failed");
        }
        CaptureOutcome::TimedOut { after_secs } => {
            tracing::warn!(step = step.name, after_secs, "capture timed out");
        }
    }

    if !matches!(outcome, CaptureOutcome::Captured { .. }) {
        // Don't ship a truncated dump.
        let _ = std::fs::remove_file(&step.output);
    }

    CaptureRecord {
        name: step.name.to_string(),
        kind: step.kind,
        outcome,
    }
}

fn try_step(step: &CaptureStep, timeout: Duration) -> Result<CaptureOutcome> {
    let mut cmd = Command::new(&step.program);
    cmd.args(&step.args).stdin(Stdio::null());

    match step.sink {
        Sink::Stdout => {
            let file = File::create(&step.output)
                .with_context(|| format!("create {}", step.output.display()))?;
            cmd.stdout(file);
        }
        Sink::ToolWrites => {
            // jcmd refuses to overwrite, and a stale file would mask a failed capture.
            let _ = std::fs::remove_file(&step.output);
            cmd.stdout(Stdio::null());
        }
    }

    util::run_ok_with_timeout(&mut cmd, timeout)?;

    let bytes = std::fs::metadata(&step.output)
        .map(|m| m.len())
        .unwrap_or(0);
    if bytes == 0 {
        return Ok(CaptureOutcome::Failed {
            reason: format!("{} produced no output", step.program),
        });
    }

    Ok(CaptureOutcome::Captured {
        path: step.output.clone(),
        bytes,
    })
}

/// File names `-XX:+HeapDumpOnOutOfMemoryError` uses inside a directory
/// `HeapDumpPath`; the `.gz` form appears when `-XX:HeapDumpGzipLevel` is set.
fn runtime_dump_names(pid: i32) -> [String; 2] {
    [format!("java_pid{pid}.hprof"), format!("java_pid{pid}.hprof.gz")]
}

/// Heap dumps the runtime wrote itself before running the hook.
pub fn runtime_heap_dumps(session: &DumpSession) -> Vec<CaptureRecord> {
    runtime_dump_names(session.pid)
        .into_iter()
        .filter_map(|name| {
            let path = session.dir.join(name);
            let bytes = std::fs::metadata(&path).ok()?.len();
            if bytes == 0 {
                return None;
            }

            tracing::info!(path = %path.display(), bytes, "found runtime heap dump");
            Some(CaptureRecord {
                name: "runtime-heap-dump".to_string(),
                kind: ArtifactKind::HeapDump,
                outcome: CaptureOutcome::Captured { path, bytes },
            })
        })
        .collect()
}

pub fn collect(session: &DumpSession, cfg: &DumpConfig) -> DumpManifest {
    if let Err(err) = std::fs::create_dir_all(&session.dir) {
        tracing::warn!(dir = %session.dir.display(), error = %err, "cannot create dump dir");
    }

    let mut records: Vec<CaptureRecord> = plan(session, &cfg.jattach_bin, &cfg.jcmd_bin)
        .iter()
        .map(|step| run_step(step, cfg.tool_timeout))
        .collect();

    records.extend(runtime_heap_dumps(session));

    DumpManifest {
        host_id: session.host_id.clone(),
        pid: session.pid,
        timestamp: session.timestamp.clone(),
        records,
    }
}
