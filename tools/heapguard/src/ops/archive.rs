use crate::ops::dump::{DumpManifest, DumpSession};
use anyhow::{anyhow, Context, Result};
use flate2::write::GzEncoder;
use flate2::Compression;
use std::fs::File;
use std::path::{Path, PathBuf};

/// One compressed bundle of everything captured for a single OOM event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArchiveArtifact {
    pub path: PathBuf,
    pub host_id: String,
    pub timestamp: String,
}

impl ArchiveArtifact {
    pub fn file_name(&self) -> String {
        archive_name(&self.host_id, &self.timestamp)
    }
}

pub fn archive_name(host_id: &str, timestamp: &str) -> String {
    format!("{host_id}-{timestamp}.dump.tar.gz")
}

/// Write `<dir>/<host>-<timestamp>.dump.tar.gz` holding every captured file plus a
/// JSON copy of the manifest. Entries are stored by file name only.
pub fn bundle(manifest: &DumpManifest, session: &DumpSession) -> Result<ArchiveArtifact> {
    let artifact = ArchiveArtifact {
        path: session
            .dir
            .join(archive_name(&session.host_id, &session.timestamp)),
        host_id: session.host_id.clone(),
        timestamp: session.timestamp.clone(),
    };

    let file = File::create(&artifact.path)
        .with_context(|| format!("create {}", artifact.path.display()))?;
    let mut builder = tar::Builder::new(GzEncoder::new(file, Compression::default()));

    let manifest_json =
        serde_json::to_vec_pretty(manifest).context("serialize dump manifest")?;
    let mut header = tar::Header::new_gnu();
    header.set_size(manifest_json.len() as u64);
    header.set_mode(0o644);
    header.set_mtime(chrono::Utc::now().timestamp().max(0) as u64);
    header.set_cksum();
    builder
        .append_data(
            &mut header,
            format!("{}-manifest.json", session.host_id),
            manifest_json.as_slice(),
        )
        .context("append manifest")?;

    for path in manifest.files() {
        let name = entry_name(path)?;
        match builder.append_path_with_name(path, name) {
            Ok(()) => tracing::debug!(path = %path.display(), "archived"),
            // A file that vanished since capture shouldn't cost us the rest.
            Err(err) => tracing::warn!(path = %path.display(), error = %err, "skipping file"),
        }
    }

    builder
        .into_inner()
        .context("finish tar stream")?
        .finish()
        .context("finish gzip stream")?;

    tracing::info!(
        archive = %artifact.path.display(),
        files = manifest.files().len(),
        "bundled dump archive"
    );
    Ok(artifact)
}

fn entry_name(path: &Path) -> Result<&std::ffi::OsStr> {
    path.file_name()
        .ok_or_else(|| anyhow!("no file name in {}", path.display()))
}
