use crate::config::{UploadPolicy, UploadTarget};
use crate::ops::archive::ArchiveArtifact;
use crate::ops::util;
use anyhow::{bail, Context, Result};
use std::fs::File;
use std::path::Path;
use std::process::{Command, Stdio};
use std::time::Duration;

/// Top-level prefix downstream postmortem tooling lists under.
pub const DUMP_PREFIX: &str = "JAVA_APP_DUMPS";

/// `JAVA_APP_DUMPS/<app_tag>/<archive_name>`, relative to the bucket.
pub fn object_key(app_tag: &str, archive_name: &str) -> String {
    format!("{DUMP_PREFIX}/{app_tag}/{archive_name}")
}

/// `<bucket>/JAVA_APP_DUMPS/<app_tag>/<archive_name>`.
pub fn remote_path(bucket: &str, app_tag: &str, archive_name: &str) -> String {
    format!("{}/{}", bare_bucket(bucket), object_key(app_tag, archive_name))
}

fn bare_bucket(bucket: &str) -> &str {
    bucket.trim_start_matches("s3://").trim_end_matches('/')
}

pub trait ObjectStore {
    fn put(&self, file: &Path, key: &str) -> Result<()>;

    fn describe(&self, key: &str) -> String;
}

/// Uploads with `aws s3 cp`, relying on the ambient credential chain.
pub struct AwsCliStore {
    bucket: String,
    timeout: Duration,
}

impl AwsCliStore {
    pub fn new(bucket: &str, timeout: Duration) -> Self {
        Self {
            bucket: bare_bucket(bucket).to_string(),
            timeout,
        }
    }
}

impl ObjectStore for AwsCliStore {
    fn put(&self, file: &Path, key: &str) -> Result<()> {
        let mut cmd = Command::new("aws");
        cmd.arg("s3")
            .arg("cp")
            .arg("--only-show-errors")
            .arg(file)
            .arg(self.describe(key))
            .stdin(Stdio::null());

        util::run_ok_with_timeout(&mut cmd, self.timeout)
    }

    fn describe(&self, key: &str) -> String {
        format!("s3://{}/{}", self.bucket, key)
    }
}

/// Path-style `PUT <endpoint>/<bucket>/<key>` against an S3-compatible endpoint
/// that accepts unsigned writes (or sits behind a signing proxy).
pub struct HttpStore {
    client: reqwest::blocking::Client,
    endpoint: String,
    bucket: String,
}

impl HttpStore {
    pub fn new(endpoint: &str, bucket: &str, timeout: Duration) -> Result<Self> {
        let client = reqwest::blocking::Client::builder()
            .timeout(timeout)
            .build()
            .context("build HTTP client")?;

        Ok(Self {
            client,
            endpoint: endpoint.trim_end_matches('/').to_string(),
            bucket: bare_bucket(bucket).to_string(),
        })
    }
}

impl ObjectStore for HttpStore {
    fn put(&self, file: &Path, key: &str) -> Result<()> {
        let url = self.describe(key);
        let body = File::open(file).with_context(|| format!("open {}", file.display()))?;

        let response = self
            .client
            .put(&url)
            .header("Content-Type", "application/gzip")
            .body(body)
            .send()
            .with_context(|| format!("PUT {url}"))?;

        if !response.status().is_success() {
            bail!("PUT {url} returned {}", response.status());
        }
        Ok(())
    }

    fn describe(&self, key: &str) -> String {
        format!("{}/{}/{}", self.endpoint, self.bucket, key)
    }
}

pub fn store_for(target: &UploadTarget, timeout: Duration) -> Result<Box<dyn ObjectStore>> {
    Ok(match &target.storage_endpoint {
        Some(endpoint) => Box::new(HttpStore::new(endpoint, &target.bucket, timeout)?),
        None => Box::new(AwsCliStore::new(&target.bucket, timeout)),
    })
}

/// Push the archive, retrying with doubling backoff. Returns whether it landed.
///
/// Failure is logged, never returned: termination must not wait on storage.
pub fn upload(
    store: &dyn ObjectStore,
    artifact: &ArchiveArtifact,
    app_tag: &str,
    policy: &UploadPolicy,
) -> bool {
    let key = object_key(app_tag, &artifact.file_name());
    let destination = store.describe(&key);
    let mut backoff = policy.initial_backoff;

    for attempt in 1..=policy.attempts {
        match store.put(&artifact.path, &key) {
            Ok(()) => {
                tracing::info!(%destination, attempt, "uploaded dump archive");
                return true;
            }
            Err(err) => {
                tracing::warn!(
                    %destination,
                    attempt,
                    attempts = policy.attempts,
                    error = %format!("{err:#}"),
                    "upload failed"
                );
            }
        }

        if attempt < policy.attempts {
            std::thread::sleep(backoff);
            backoff = backoff.saturating_mul(2);
        }
    }

    tracing::error!(
        %destination,
        archive = %artifact.path.display(),
        "giving up on upload; archive left on local disk"
    );
    false
}
