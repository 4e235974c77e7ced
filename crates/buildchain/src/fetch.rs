use std::fs;
use std::io::Write;
use std::path::Path;
use std::time::Duration;

use crate::error::{Error, Result};

/// Downloads one URL to a local file.
pub trait Fetcher: Send + Sync {
    fn fetch(&self, url: &str, dest: &Path) -> Result<()>;
}

pub struct HttpFetcher {
    client: reqwest::blocking::Client,
}

impl HttpFetcher {
    pub fn new(timeout_secs: u64) -> Result<Self> {
        let client = reqwest::blocking::Client::builder()
            .timeout(Duration::from_secs(timeout_secs))
            .build()
            .map_err(|e| Error::transport(format!("failed to build HTTP client: {e}")))?;
        Ok(Self { client })
    }
}

impl Fetcher for HttpFetcher {
    fn fetch(&self, url: &str, dest: &Path) -> Result<()> {
        tracing::debug!(url, dest = %dest.display(), "downloading");
        let mut res = self
            .client
            .get(url)
            .send()
            .map_err(|e| Error::transport(format!("GET {url} failed: {e}")))?;
        if !res.status().is_success() {
            return Err(Error::transport(format!(
                "GET {url} failed with status {}",
                res.status()
            )));
        }

        let dir = crate::fsutil::parent_dir(dest);
        let mut tmp = tempfile::NamedTempFile::new_in(dir)
            .map_err(|e| Error::io(format!("failed to create temp file in {}: {e}", dir.display())))?;
        let bytes = res
            .copy_to(&mut tmp)
            .map_err(|e| Error::transport(format!("GET {url} failed while reading body: {e}")))?;
        tmp.flush()
            .map_err(|e| Error::io(format!("failed to flush {}: {e}", dest.display())))?;
        tmp.persist(dest)
            .map_err(|e| Error::io(format!("failed to write {}: {e}", dest.display())))?;
        tracing::info!(url, dest = %dest.display(), bytes, "downloaded");
        Ok(())
    }
}

/// Fetch every entry of `plan` into `dir`; the first failure aborts.
pub fn fetch_all(fetcher: &dyn Fetcher, plan: &crate::rpm::SourcePlan, dir: &Path) -> Result<()> {
    fs::create_dir_all(dir)
        .map_err(|e| Error::io(format!("failed to create {}: {e}", dir.display())))?;
    for (name, url) in plan.iter() {
        fetcher
            .fetch(url, &dir.join(name))
            .map_err(|e| e.context(format!("failed to download {name}")))?;
    }
    Ok(())
}
