//! Fetching raw source bytes and computing freshness tokens

use std::io::Read;
use std::path::{Path, PathBuf};
use std::time::Duration;

use ureq::Agent;
use url::Url;

use super::backend::Fetcher;
use super::keys::SourceKey;
use super::request::RenderFault;

/// Upper bound on a remote document body
const MAX_REMOTE_BYTES: u64 = 512 * 1024 * 1024;

/// Local path a source location refers to, if it is local
///
/// `file://` URLs map to their path (query dropped); anything that does not
/// parse as an absolute URL is taken as a plain path.
#[must_use]
pub fn local_path(location: &str) -> Option<PathBuf> {
    match Url::parse(location) {
        Ok(url) if url.scheme() == "file" => url.to_file_path().ok(),
        // Windows drive letters parse as one-letter schemes.
        Ok(url) if url.scheme().len() == 1 => Some(PathBuf::from(location)),
        Ok(_) => None,
        Err(_) => Some(PathBuf::from(location)),
    }
}

/// Freshness token for a local file: hex MD5 of its contents
pub fn asset_hash(path: &Path) -> std::io::Result<String> {
    let bytes = std::fs::read(path)?;
    Ok(format!("{:x}", md5::compute(bytes)))
}

/// Reads local files
#[derive(Clone, Copy, Debug, Default)]
pub struct FsFetcher;

impl Fetcher for FsFetcher {
    fn fetch(&self, source: &SourceKey) -> Result<Vec<u8>, RenderFault> {
        let path = local_path(source.as_str())
            .ok_or_else(|| RenderFault::fetch(source.as_str(), "not a local source"))?;
        std::fs::read(&path).map_err(|e| RenderFault::fetch(source.as_str(), e))
    }
}

/// Fetches `http`/`https` sources
pub struct HttpFetcher {
    agent: Agent,
}

impl HttpFetcher {
    #[must_use]
    pub fn new(timeout: Duration) -> Self {
        let agent: Agent = Agent::config_builder()
            .timeout_global(Some(timeout))
            .build()
            .into();
        Self { agent }
    }
}

impl Fetcher for HttpFetcher {
    fn fetch(&self, source: &SourceKey) -> Result<Vec<u8>, RenderFault> {
        log::debug!("GET {source}");
        let response = self
            .agent
            .get(source.as_str())
            .call()
            .map_err(|e| RenderFault::fetch(source.as_str(), e))?;

        let (_parts, body) = response.into_parts();
        let mut bytes = Vec::new();
        body.into_reader()
            .take(MAX_REMOTE_BYTES)
            .read_to_end(&mut bytes)
            .map_err(|e| RenderFault::fetch(source.as_str(), e))?;
        Ok(bytes)
    }
}

/// Dispatches on the source scheme
pub struct SourceFetcher {
    local: FsFetcher,
    remote: HttpFetcher,
}

impl SourceFetcher {
    #[must_use]
    pub fn new(http_timeout: Duration) -> Self {
        Self {
            local: FsFetcher,
            remote: HttpFetcher::new(http_timeout),
        }
    }
}

impl Fetcher for SourceFetcher {
    fn fetch(&self, source: &SourceKey) -> Result<Vec<u8>, RenderFault> {
        match Url::parse(source.as_str()) {
            Ok(url) if matches!(url.scheme(), "http" | "https") => self.remote.fetch(source),
            _ => self.local.fetch(source),
        }
    }
}
