use crate::error::Error;
use crate::promise::Promise;
use log::debug;
use std::path::PathBuf;
use std::rc::Rc;
use url::Url;

/// Collaborator retrieving raw template text.
///
/// Returns a promise in place of success/error callbacks. When `blocking`
/// is true the caller is on a synchronous render path and expects the
/// promise to be settled before `fetch` returns, if the transport can
/// manage it at all; a fetcher that defers anyway makes that render fail
/// with [`Error::NotReady`].
pub trait TemplateFetcher {
    fn fetch(&self, url: &str, blocking: bool) -> Promise<String>;
}

/// Collaborator remapping dependency-style template paths (the part after a
/// leading `//`) before fetch. The seam exists so bundler-managed layouts
/// can be supported without the core knowing about bundlers.
pub trait PathResolver {
    fn resolve(&self, path: &str) -> String;
}

/// Default path resolver: returns the path unchanged.
#[derive(Debug, Default)]
pub struct PassthroughResolver;

impl PathResolver for PassthroughResolver {
    fn resolve(&self, path: &str) -> String {
        path.to_string()
    }
}

/// Reads template text from the local filesystem, relative to a root
/// directory. Always settles before returning.
pub struct FileFetcher {
    root: PathBuf,
}

impl FileFetcher {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        FileFetcher { root: root.into() }
    }
}

impl TemplateFetcher for FileFetcher {
    fn fetch(&self, url: &str, _blocking: bool) -> Promise<String> {
        // Remote URLs belong to an HTTP-capable fetcher.
        if let Ok(parsed) = Url::parse(url) {
            if parsed.scheme() == "http" || parsed.scheme() == "https" {
                return Promise::rejected(Rc::new(Error::FetchError {
                    url: url.to_string(),
                    reason: "FileFetcher cannot fetch remote URLs".to_string(),
                }));
            }
        }
        let path = self.root.join(url);
        debug!("reading template from {}", path.display());
        match std::fs::read_to_string(&path) {
            Ok(text) => Promise::resolved(text),
            Err(e) => Promise::rejected(Rc::new(Error::IoError(e))),
        }
    }
}

/// Fetches template text over HTTP with a blocking client. The `blocking`
/// flag is ignored: requests complete before the promise is returned either
/// way, which satisfies both render paths.
#[cfg(feature = "http")]
pub struct HttpFetcher {
    client: reqwest::blocking::Client,
}

#[cfg(feature = "http")]
impl HttpFetcher {
    /// Creates a fetcher with the specified request timeout.
    pub fn new(timeout: std::time::Duration) -> crate::error::Result<Self> {
        let client = reqwest::blocking::Client::builder().timeout(timeout).build()?;
        Ok(HttpFetcher { client })
    }
}

#[cfg(feature = "http")]
impl TemplateFetcher for HttpFetcher {
    fn fetch(&self, url: &str, _blocking: bool) -> Promise<String> {
        debug!("fetching template from {}", url);
        let response = self
            .client
            .get(url)
            .send()
            .and_then(|response| response.error_for_status())
            .and_then(|response| response.text());
        match response {
            Ok(text) => Promise::resolved(text),
            Err(e) => Promise::rejected(Rc::new(Error::HttpError(e))),
        }
    }
}
