use crate::cache::to_id;
use crate::engine::RendererWrapper;
use crate::error::{Error, Result};
use crate::promise::Promise;
use crate::view::Views;
use log::{debug, warn};
use regex::Regex;
use std::rc::Rc;
use std::sync::OnceLock;

/// A template request, normalized by [`Views::resolve`].
pub enum TemplateRef {
    /// A resource URL, or `#id` referencing an inline template.
    Url(String),
    /// A URL with an explicit engine suffix that overrides derivation.
    WithEngine { url: String, engine: String },
    /// An already-compiled renderer; resolves immediately.
    Renderer(RendererWrapper),
}

impl From<&str> for TemplateRef {
    fn from(url: &str) -> Self {
        TemplateRef::Url(url.to_string())
    }
}

impl From<String> for TemplateRef {
    fn from(url: String) -> Self {
        TemplateRef::Url(url)
    }
}

impl From<RendererWrapper> for TemplateRef {
    fn from(renderer: RendererWrapper) -> Self {
        TemplateRef::Renderer(renderer)
    }
}

/// The outcome of resolving a [`TemplateRef`]: the promised renderer, the
/// cache id it is reachable under (when cached), and the final URL for
/// diagnostics. `view_id` is what lets the dispatcher bypass the promise
/// through the cache's resolved side channel.
pub(crate) struct Resolution {
    pub(crate) promise: Promise<RendererWrapper>,
    pub(crate) view_id: Option<String>,
    pub(crate) url: String,
}

fn suffix_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"\.[\w\d]+$").unwrap())
}

fn content_type_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"/(x-)?(.+)").unwrap())
}

impl Views {
    /// Resolves `request` to a promised renderer.
    ///
    /// `allow_async` mirrors the render paths: `false` asks the fetch
    /// collaborator to settle before returning, for synchronous renders.
    /// Failures reachable at this point surface as an already-rejected
    /// promise.
    pub fn resolve(&self, request: TemplateRef, allow_async: bool) -> Promise<RendererWrapper> {
        match self.resolve_renderer(request, !allow_async) {
            Ok(resolution) => resolution.promise,
            Err(e) => Promise::rejected(Rc::new(e)),
        }
    }

    pub(crate) fn resolve_renderer(
        &self,
        request: TemplateRef,
        blocking: bool,
    ) -> Result<Resolution> {
        let (mut url, explicit_suffix) = match request {
            TemplateRef::Renderer(renderer) => {
                return Ok(Resolution {
                    promise: Promise::resolved(renderer),
                    view_id: None,
                    url: "<renderer>".to_string(),
                });
            }
            TemplateRef::Url(url) => (url, None),
            TemplateRef::WithEngine { url, engine } => {
                (url, Some(engine.trim_start_matches('.').to_string()))
            }
        };

        // Explicit suffix wins; otherwise derive from the trailing extension.
        let mut suffix = explicit_suffix.or_else(|| {
            suffix_regex()
                .find(&url)
                .map(|m| m.as_str().trim_start_matches('.').to_string())
        });

        // A '#' prefix names an inline template rather than a resource.
        if let Some(rest) = url.strip_prefix('#') {
            url = rest.to_string();
        }
        let inline = self.inline_template(&url);
        if let Some(entry) = &inline {
            if let Some(caps) = content_type_regex().captures(&entry.content_type) {
                suffix = Some(caps[2].to_string());
            }
        }

        // Still no suffix and not already cached: append the default one.
        if suffix.is_none() && !self.cache_contains(&to_id(&url)) {
            let ext = self.default_ext();
            url = format!("{}.{}", url, ext);
            suffix = Some(ext);
        }

        let id = to_id(&url);

        // Dependency-style absolute URLs are remapped before fetch.
        let fetch_url = match url.strip_prefix("//") {
            Some(rest) => self.resolve_path(rest),
            None => url.clone(),
        };

        if let Some(promise) = self.cached_promise(&id) {
            debug!("template cache hit for '{}'", id);
            return Ok(Resolution { promise, view_id: Some(id), url });
        }

        let suffix = suffix.unwrap_or_else(|| self.default_ext());
        let info = self
            .engine_info(&suffix)
            .ok_or(Error::MissingEngine { suffix: suffix.clone() })?;

        if let Some(entry) = inline {
            if entry.text.is_empty() {
                return Err(Error::EmptyTemplate { url });
            }
            debug!("resolving inline template '{}'", id);
            let wrapper = RendererWrapper::lazy(info, Some(id.clone()), entry.text);
            let promise = self.preload_wrapper(&id, wrapper);
            return Ok(Resolution { promise, view_id: Some(id), url });
        }

        // Remote template: fetch the raw text through the collaborator.
        let promise: Promise<RendererWrapper> = Promise::new();
        let caching = self.caching();
        if caching {
            // Cached while still in flight, so concurrent requests for the
            // same identifier share one promise.
            self.cache_insert(&id, promise.clone());
        }
        let views = self.clone();
        let text_promise = self.fetcher().fetch(&fetch_url, blocking);
        {
            let promise = promise.clone();
            let id = id.clone();
            let url = url.clone();
            text_promise.then(move |outcome| match outcome {
                Ok(text) if text.is_empty() => {
                    warn!("no template or empty template at {}", url);
                    if caching {
                        views.cache_remove(&id);
                    }
                    promise.reject(Rc::new(Error::EmptyTemplate { url }));
                }
                Ok(text) => {
                    let wrapper = RendererWrapper::lazy(info, Some(id.clone()), text);
                    if caching {
                        views.cache_set_renderer(&id, wrapper.clone());
                    }
                    promise.resolve(wrapper);
                }
                Err(reason) => {
                    warn!("failed to fetch template at {}: {}", url, reason);
                    if caching {
                        views.cache_remove(&id);
                    }
                    promise.reject(reason);
                }
            });
        }
        let view_id = caching.then_some(id);
        Ok(Resolution { promise, view_id, url })
    }
}
