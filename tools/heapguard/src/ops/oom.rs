use crate::config::{DumpConfig, Settings, UploadTarget};
use crate::ops::archive;
use crate::ops::dump::{self, DumpSession};
use crate::ops::terminate;
use crate::ops::upload::{self, ObjectStore};

/// What happened during one triggered invocation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OomReport {
    pub captured: usize,
    pub archive: Option<std::path::PathBuf>,
    pub uploaded: bool,
    pub terminated: bool,
}

/// Entry point for `heapguard oom <pid>`, run by the runtime's OOM hook.
///
/// Nothing here is fatal. A missing or unusable upload target only skips the
/// upload; the target is always killed.
pub fn run(settings: &Settings, pid: i32) -> OomReport {
    let cfg = settings.dump();
    tracing::warn!(pid, "runtime reported OutOfMemoryError; collecting diagnostics");

    let target = match settings.upload_target() {
        Ok(target) => Some(target),
        Err(err) => {
            tracing::error!(
                error = %format!("{err:#}"),
                "upload not configured; keeping archive local"
            );
            None
        }
    };
    let store = target
        .as_ref()
        .and_then(|t| match upload::store_for(t, cfg.upload.timeout) {
            Ok(store) => Some(store),
            Err(err) => {
                tracing::error!(error = %format!("{err:#}"), "no usable upload target");
                None
            }
        });

    let session = DumpSession::new(pid, &cfg.dump_dir);
    let report = handle(&session, &cfg, target.as_ref().zip(store.as_deref()));
    tracing::info!(
        pid,
        captured = report.captured,
        archive = ?report.archive,
        uploaded = report.uploaded,
        terminated = report.terminated,
        "oom handling finished"
    );
    report
}

/// collect -> bundle -> upload -> terminate.
pub fn handle(
    session: &DumpSession,
    cfg: &DumpConfig,
    destination: Option<(&UploadTarget, &dyn ObjectStore)>,
) -> OomReport {
    let manifest = dump::collect(session, cfg);
    let captured = manifest.files().len();

    let artifact = match archive::bundle(&manifest, session) {
        Ok(artifact) => Some(artifact),
        Err(err) => {
            tracing::error!(error = %format!("{err:#}"), "could not bundle dump archive");
            None
        }
    };

    let uploaded = match (&artifact, destination) {
        (Some(artifact), Some((target, store))) => {
            tracing::info!(
                remote = %upload::remote_path(&target.bucket, &target.app_tag, &artifact.file_name()),
                "uploading dump archive"
            );
            upload::upload(store, artifact, &target.app_tag, &cfg.upload)
        }
        _ => false,
    };

    let terminated = terminate::terminate(session.pid);

    OomReport {
        captured,
        archive: artifact.map(|a| a.path),
        uploaded,
        terminated,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::UploadPolicy;
    use anyhow::{bail, Result};
    use clap::Parser;
    use flate2::read::GzDecoder;
    use std::cell::RefCell;
    use std::os::unix::process::ExitStatusExt;
    use std::path::{Path, PathBuf};
    use std::process::Command;
    use std::time::Duration;

    #[derive(Default)]
    struct RecordingStore {
        fail: bool,
        keys: RefCell<Vec<String>>,
    }

    impl ObjectStore for RecordingStore {
        fn put(&self, file: &Path, key: &str) -> Result<()> {
            assert!(file.is_file());
            self.keys.borrow_mut().push(key.to_string());
            if self.fail {
                bail!("bucket unreachable");
            }
            Ok(())
        }

        fn describe(&self, key: &str) -> String {
            format!("mem://{key}")
        }
    }

    /// Stands in for jattach/jcmd: prints for thread dumps, writes the named file for heap dumps.
    fn fake_tool(dir: &Path) -> PathBuf {
        use std::os::unix::fs::PermissionsExt;

        let path = dir.join("fake-tool");
        std::fs::write(
            &path,
            "#!/bin/sh\ncase \"$2\" in\n  threaddump|Thread.print) echo '\"main\" #1 prio=5' ;;\n  dumpheap|GC.heap_dump) printf 'JAVA PROFILE' > \"$3\" ;;\n  *) exit 2 ;;\nesac\n",
        )
        .unwrap();
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
        path
    }

    fn upload_target() -> UploadTarget {
        UploadTarget {
            bucket: "dump-bucket".to_string(),
            app_tag: "orders".to_string(),
            storage_endpoint: None,
        }
    }

    fn config(dir: &Path, tool: &str) -> DumpConfig {
        DumpConfig {
            dump_dir: dir.to_path_buf(),
            jattach_bin: tool.to_string(),
            jcmd_bin: tool.to_string(),
            tool_timeout: Duration::from_secs(10),
            upload: UploadPolicy {
                attempts: 2,
                timeout: Duration::from_secs(1),
                initial_backoff: Duration::ZERO,
            },
        }
    }

    fn archive_entries(path: &Path) -> Vec<String> {
        let mut archive = tar::Archive::new(GzDecoder::new(std::fs::File::open(path).unwrap()));
        archive
            .entries()
            .unwrap()
            .map(|e| e.unwrap().path().unwrap().display().to_string())
            .collect()
    }

    fn archives_in(dir: &Path) -> Vec<PathBuf> {
        std::fs::read_dir(dir)
            .unwrap()
            .map(|e| e.unwrap().path())
            .filter(|p| p.to_string_lossy().ends_with(".dump.tar.gz"))
            .collect()
    }

    #[test]
    fn full_pipeline_captures_uploads_and_kills() {
        let dir = tempfile::tempdir().unwrap();
        let tool = fake_tool(dir.path());
        let cfg = config(dir.path(), tool.to_str().unwrap());

        let mut target = Command::new("sleep").arg("30").spawn().unwrap();
        let session = DumpSession {
            pid: target.id() as i32,
            host_id: "orders-7c9f".to_string(),
            timestamp: "20261016T120000Z".to_string(),
            dir: dir.path().to_path_buf(),
        };
        let store = RecordingStore::default();

        let report = handle(&session, &cfg, Some((&upload_target(), &store as &dyn ObjectStore)));

        assert_eq!(report.captured, 4);
        assert!(report.uploaded);
        assert!(report.terminated);
        assert_eq!(target.wait().unwrap().signal(), Some(libc::SIGKILL));

        let archive = report.archive.unwrap();
        assert_eq!(archives_in(dir.path()), vec![archive.clone()]);
        assert_eq!(
            archive.file_name().unwrap(),
            "orders-7c9f-20261016T120000Z.dump.tar.gz"
        );

        let mut entries = archive_entries(&archive);
        entries.sort();
        assert_eq!(
            entries,
            vec![
                "orders-7c9f-jcmd.hprof",
                "orders-7c9f-jcmd.tdump",
                "orders-7c9f-manifest.json",
                "orders-7c9f.hprof",
                "orders-7c9f.tdump",
            ]
        );

        assert_eq!(
            *store.keys.borrow(),
            vec!["JAVA_APP_DUMPS/orders/orders-7c9f-20261016T120000Z.dump.tar.gz".to_string()]
        );
    }

    #[test]
    fn upload_failure_does_not_spare_the_target() {
        let dir = tempfile::tempdir().unwrap();
        let cfg = config(dir.path(), "heapguard-test-no-such-tool");

        let mut target = Command::new("sleep").arg("30").spawn().unwrap();
        let session = DumpSession {
            pid: target.id() as i32,
            host_id: "h".to_string(),
            timestamp: "t".to_string(),
            dir: dir.path().to_path_buf(),
        };
        let store = RecordingStore {
            fail: true,
            ..Default::default()
        };

        let report = handle(&session, &cfg, Some((&upload_target(), &store as &dyn ObjectStore)));

        assert_eq!(report.captured, 0);
        assert!(!report.uploaded);
        assert!(report.terminated);
        assert_eq!(store.keys.borrow().len(), 2);
        assert_eq!(target.wait().unwrap().signal(), Some(libc::SIGKILL));
        assert_eq!(archives_in(dir.path()).len(), 1);
    }

    #[test]
    fn missing_store_still_terminates() {
        let dir = tempfile::tempdir().unwrap();
        let cfg = config(dir.path(), "heapguard-test-no-such-tool");

        let mut target = Command::new("sleep").arg("30").spawn().unwrap();
        let session = DumpSession::new(target.id() as i32, dir.path());

        let report = handle(&session, &cfg, None);
        assert!(!report.uploaded);
        assert!(report.terminated);
        assert_eq!(target.wait().unwrap().signal(), Some(libc::SIGKILL));
    }

    #[derive(Parser)]
    struct TestCli {
        #[command(flatten)]
        settings: Settings,
    }

    #[test]
    fn unconfigured_bucket_still_captures_and_kills() {
        let dir = tempfile::tempdir().unwrap();
        let tool = fake_tool(dir.path());
        let tool = tool.to_str().unwrap();
        let dump_dir = dir.path().join("dumps");

        let settings = TestCli::try_parse_from([
            "heapguard",
            "--dump-dir",
            dump_dir.to_str().unwrap(),
            "--jattach-bin",
            tool,
            "--jcmd-bin",
            tool,
            "--app-tag",
            "orders",
        ])
        .unwrap()
        .settings;

        let mut target = Command::new("sleep").arg("30").spawn().unwrap();
        let report = run(&settings, target.id() as i32);

        assert_eq!(target.wait().unwrap().signal(), Some(libc::SIGKILL));
        assert!(report.terminated);
        assert!(!report.uploaded);
        assert_eq!(report.captured, 4);
        assert_eq!(archives_in(&dump_dir), vec![report.archive.unwrap()]);
    }
}
