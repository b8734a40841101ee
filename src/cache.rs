use crate::engine::RendererWrapper;
use crate::promise::Promise;
use indexmap::IndexMap;
use log::debug;
use std::cell::{Cell, RefCell};

/// Converts a path-like source reference into a stable cache identifier.
///
/// Splits on `/`, `.` and `#`, drops empty segments, joins with `_`. Pure:
/// the same input always yields the same id. Two distinct source paths can
/// normalize identically (`a/b.ejs` and `a.b.ejs` both become `a_b_ejs`);
/// they share a cache entry, a documented risk rather than a detected one.
pub fn to_id(src: &str) -> String {
    src.split(['/', '.', '#'])
        .filter(|part| !part.is_empty())
        .collect::<Vec<_>>()
        .join("_")
}

/// The process-wide template cache: one tier of promised renderers plus a
/// parallel side channel of already-resolved wrappers.
///
/// The side channel exists for reentrancy: a render issued from inside a
/// promise's own resolution callbacks must not depend on late continuation
/// delivery, so resolved renderers stay reachable through a plain map the
/// dispatcher can read synchronously.
///
/// Owned, injectable state with no hidden globals; entries persist for the
/// life of the owning [`Views`](crate::view::Views) unless overwritten by
/// re-registration or cleared wholesale via [`TemplateCache::reset`].
#[derive(Default)]
pub struct TemplateCache {
    entries: RefCell<IndexMap<String, Promise<RendererWrapper>>>,
    renderers: RefCell<IndexMap<String, RendererWrapper>>,
    caching: Cell<bool>,
}

impl TemplateCache {
    pub fn new() -> Self {
        TemplateCache {
            entries: RefCell::new(IndexMap::new()),
            renderers: RefCell::new(IndexMap::new()),
            caching: Cell::new(true),
        }
    }

    /// Whether remotely fetched templates are cached. Inline and preloaded
    /// templates are cached regardless, since their identity is static.
    pub fn caching(&self) -> bool {
        self.caching.get()
    }

    pub fn set_caching(&self, caching: bool) {
        self.caching.set(caching);
    }

    /// The promised renderer for `id`, resolved or still in flight.
    pub fn get(&self, id: &str) -> Option<Promise<RendererWrapper>> {
        self.entries.borrow().get(id).cloned()
    }

    pub fn contains(&self, id: &str) -> bool {
        self.entries.borrow().contains_key(id)
    }

    pub fn insert(&self, id: &str, promise: Promise<RendererWrapper>) {
        self.entries.borrow_mut().insert(id.to_string(), promise);
    }

    /// Drops a cache entry, both tiers. Used when an in-flight fetch fails,
    /// so the failure is not cached forever.
    pub fn remove(&self, id: &str) {
        self.entries.borrow_mut().shift_remove(id);
        self.renderers.borrow_mut().shift_remove(id);
    }

    /// The synchronously-readable resolved renderer for `id`.
    pub fn renderer_for(&self, id: &str) -> Option<RendererWrapper> {
        self.renderers.borrow().get(id).cloned()
    }

    pub fn set_renderer(&self, id: &str, renderer: RendererWrapper) {
        self.renderers.borrow_mut().insert(id.to_string(), renderer);
    }

    /// Seeds both tiers with an already-resolved entry. Used by the
    /// precompiled-template bootstrap and by inline registration; ignores
    /// the caching toggle.
    pub fn preload(&self, id: &str, renderer: RendererWrapper) -> Promise<RendererWrapper> {
        debug!("preloading template '{}' into cache", id);
        let promise = Promise::resolved(renderer.clone());
        self.insert(id, promise.clone());
        self.set_renderer(id, renderer);
        promise
    }

    /// Clears every entry. For tests that need a pristine cache without a
    /// fresh process.
    pub fn reset(&self) {
        self.entries.borrow_mut().clear();
        self.renderers.borrow_mut().clear();
    }
}
