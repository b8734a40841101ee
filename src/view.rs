use crate::cache::{to_id, TemplateCache};
use crate::engine::{
    minijinja as minijinja_engine, EngineInfo, Helpers, RenderValue, RendererWrapper,
    Registry, StringRenderer,
};
use crate::error::{Error, Result};
use crate::fetch::{FileFetcher, PassthroughResolver, PathResolver, TemplateFetcher};
use crate::fragment::{Element, Fragment, FragmentBuilder, MarkupBuilder};
use crate::hookup::{HookupFn, HookupRegistry};
use crate::promise::{Promise, SettleState};
use crate::resolver::TemplateRef;
use indexmap::IndexMap;
use log::warn;
use serde_json::Value;
use std::cell::{Cell, RefCell};
use std::rc::Rc;

/// Output mode of a render call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputFormat {
    String,
    Fragment,
}

/// One entry of a data context: a plain value or a pending one that must
/// settle before the template renders.
pub enum ContextValue {
    Value(Value),
    Pending(Promise<Value>),
}

impl From<Value> for ContextValue {
    fn from(value: Value) -> Self {
        ContextValue::Value(value)
    }
}

impl From<Promise<Value>> for ContextValue {
    fn from(promise: Promise<Value>) -> Self {
        ContextValue::Pending(promise)
    }
}

/// A data context with per-key values. Pending discovery is shallow: only
/// these top-level entries are inspected, never values nested inside them.
pub type Context = IndexMap<String, ContextValue>;

/// The data argument of a render call.
pub enum TemplateData {
    /// An arbitrary value with no pending parts.
    Value(Value),
    /// A keyed context, zero or more entries pending.
    Context(Context),
    /// The whole context is pending.
    Pending(Promise<Value>),
}

impl From<Value> for TemplateData {
    fn from(value: Value) -> Self {
        TemplateData::Value(value)
    }
}

impl From<Context> for TemplateData {
    fn from(context: Context) -> Self {
        TemplateData::Context(context)
    }
}

impl From<Promise<Value>> for TemplateData {
    fn from(promise: Promise<Value>) -> Self {
        TemplateData::Pending(promise)
    }
}

/// A finished render.
#[derive(Clone)]
pub enum Rendered {
    Text(String),
    Fragment(Fragment),
    /// No data was supplied, so the renderer itself is the result.
    Renderer(RendererWrapper),
}

impl Rendered {
    pub fn as_text(&self) -> Option<&str> {
        match self {
            Rendered::Text(text) => Some(text),
            _ => None,
        }
    }

    pub fn as_fragment(&self) -> Option<&Fragment> {
        match self {
            Rendered::Fragment(fragment) => Some(fragment),
            _ => None,
        }
    }

    pub fn as_renderer(&self) -> Option<&RendererWrapper> {
        match self {
            Rendered::Renderer(renderer) => Some(renderer),
            _ => None,
        }
    }
}

/// What a render call hands back: an immediate result when nothing had to
/// be awaited, otherwise a promise of `(result, substituted data)`.
pub enum RenderOutcome {
    Ready(Rendered),
    Deferred(Promise<(Rendered, Value)>),
}

impl RenderOutcome {
    pub fn ready(self) -> Option<Rendered> {
        match self {
            RenderOutcome::Ready(rendered) => Some(rendered),
            RenderOutcome::Deferred(_) => None,
        }
    }

    pub fn deferred(self) -> Option<Promise<(Rendered, Value)>> {
        match self {
            RenderOutcome::Ready(_) => None,
            RenderOutcome::Deferred(promise) => Some(promise),
        }
    }
}

/// Completion callback: receives the rendered result and the (substituted)
/// data context, `Value::Null` when no data was supplied.
pub type RenderCallback = Box<dyn FnOnce(&Rendered, &Value)>;

/// Policy unwrapping a settled pending value before substitution. The
/// default accommodates resource fetches that resolve to a
/// `[value, "success"]` pair; callers with other conventions install their
/// own adapter.
pub type SettledAdapter = Rc<dyn Fn(Value) -> Value>;

fn default_settled_adapter(value: Value) -> Value {
    if let Value::Array(items) = &value {
        if items.len() == 2 && items[1] == "success" {
            return items[0].clone();
        }
    }
    value
}

#[derive(Clone)]
pub(crate) struct InlineTemplate {
    pub(crate) content_type: String,
    pub(crate) text: String,
}

struct ViewsInner {
    registry: RefCell<Registry>,
    cache: TemplateCache,
    hookups: HookupRegistry,
    inline: RefCell<IndexMap<String, InlineTemplate>>,
    default_ext: RefCell<String>,
    fetcher: RefCell<Rc<dyn TemplateFetcher>>,
    paths: RefCell<Rc<dyn PathResolver>>,
    builder: RefCell<Rc<dyn FragmentBuilder>>,
    settled: RefCell<SettledAdapter>,
}

/// The rendering facade: engine registry, template cache, hookup registry
/// and collaborator seams behind one cloneable handle. Clones share state;
/// the state lives as long as any handle does, with no implicit teardown.
#[derive(Clone)]
pub struct Views {
    inner: Rc<ViewsInner>,
}

impl Views {
    /// A fresh instance with no engines registered. The fetch collaborator
    /// defaults to a [`FileFetcher`] rooted at the current directory.
    pub fn new() -> Self {
        Views {
            inner: Rc::new(ViewsInner {
                registry: RefCell::new(Registry::new()),
                cache: TemplateCache::new(),
                hookups: HookupRegistry::new(),
                inline: RefCell::new(IndexMap::new()),
                default_ext: RefCell::new(minijinja_engine::SUFFIX.to_string()),
                fetcher: RefCell::new(Rc::new(FileFetcher::new("."))),
                paths: RefCell::new(Rc::new(PassthroughResolver)),
                builder: RefCell::new(Rc::new(MarkupBuilder)),
                settled: RefCell::new(Rc::new(default_settled_adapter)),
            }),
        }
    }

    /// A fresh instance with the bundled MiniJinja engine registered.
    pub fn with_minijinja() -> Self {
        let views = Views::new();
        if let Err(e) = views.register(minijinja_engine::engine_info()) {
            warn!("failed to register bundled engine: {}", e);
        }
        views
    }

    // engine registration -------------------------------------------------

    /// Registers a template engine. A suffix that already exists is
    /// overwritten, no merge and no warning. Returns the per-suffix
    /// convenience constructor.
    pub fn register(&self, info: EngineInfo) -> Result<EngineHandle> {
        let suffix = info.suffix.clone();
        self.inner.registry.borrow_mut().insert(info)?;
        Ok(EngineHandle { views: self.clone(), suffix })
    }

    pub(crate) fn engine_info(&self, suffix: &str) -> Option<Rc<EngineInfo>> {
        self.inner.registry.borrow().get(suffix)
    }

    // configuration -------------------------------------------------------

    /// Whether remotely fetched templates are cached (on by default).
    pub fn caching(&self) -> bool {
        self.inner.cache.caching()
    }

    pub fn set_caching(&self, caching: bool) {
        self.inner.cache.set_caching(caching);
    }

    /// The suffix appended to extensionless template URLs.
    pub fn default_ext(&self) -> String {
        self.inner.default_ext.borrow().clone()
    }

    pub fn set_default_ext(&self, ext: &str) {
        *self.inner.default_ext.borrow_mut() = ext.trim_start_matches('.').to_string();
    }

    pub fn set_fetcher(&self, fetcher: Rc<dyn TemplateFetcher>) {
        *self.inner.fetcher.borrow_mut() = fetcher;
    }

    pub fn set_path_resolver(&self, paths: Rc<dyn PathResolver>) {
        *self.inner.paths.borrow_mut() = paths;
    }

    pub fn set_fragment_builder(&self, builder: Rc<dyn FragmentBuilder>) {
        *self.inner.builder.borrow_mut() = builder;
    }

    pub fn set_settled_adapter(&self, adapter: SettledAdapter) {
        *self.inner.settled.borrow_mut() = adapter;
    }

    /// The template cache, exposed so tests can reset state between cases.
    pub fn cache(&self) -> &TemplateCache {
        &self.inner.cache
    }

    /// Registers an inline template, the stand-in for an embedded
    /// `<script type="text/x-...">` element. Resolvable as `#id`.
    pub fn add_inline(&self, id: &str, content_type: &str, text: &str) {
        self.inner.inline.borrow_mut().insert(
            id.to_string(),
            InlineTemplate {
                content_type: content_type.to_string(),
                text: text.to_string(),
            },
        );
    }

    // resolver support ----------------------------------------------------

    pub(crate) fn inline_template(&self, id: &str) -> Option<InlineTemplate> {
        self.inner.inline.borrow().get(id).cloned()
    }

    pub(crate) fn cache_contains(&self, id: &str) -> bool {
        self.inner.cache.contains(id)
    }

    pub(crate) fn cached_promise(&self, id: &str) -> Option<Promise<RendererWrapper>> {
        self.inner.cache.get(id)
    }

    pub(crate) fn cache_insert(&self, id: &str, promise: Promise<RendererWrapper>) {
        self.inner.cache.insert(id, promise);
    }

    pub(crate) fn cache_remove(&self, id: &str) {
        self.inner.cache.remove(id);
    }

    pub(crate) fn cache_set_renderer(&self, id: &str, renderer: RendererWrapper) {
        self.inner.cache.set_renderer(id, renderer);
    }

    pub(crate) fn preload_wrapper(
        &self,
        id: &str,
        wrapper: RendererWrapper,
    ) -> Promise<RendererWrapper> {
        self.inner.cache.preload(id, wrapper)
    }

    pub(crate) fn fetcher(&self) -> Rc<dyn TemplateFetcher> {
        self.inner.fetcher.borrow().clone()
    }

    pub(crate) fn resolve_path(&self, path: &str) -> String {
        self.inner.paths.borrow().resolve(path)
    }

    fn settled_adapter(&self) -> SettledAdapter {
        self.inner.settled.borrow().clone()
    }

    // preloading ----------------------------------------------------------

    /// Seeds the cache with an already-built renderer under `id`. The
    /// bootstrap path build tooling uses to ship precompiled templates.
    pub fn preload(&self, id: &str, renderer: RendererWrapper) -> RendererWrapper {
        self.inner.cache.preload(&to_id(id), renderer.clone());
        renderer
    }

    /// [`Views::preload`] for a bare string renderer.
    pub fn preload_string(&self, id: &str, renderer: StringRenderer) -> RendererWrapper {
        self.preload(id, RendererWrapper::from_string_renderer(renderer))
    }

    /// Compiles template text to its shippable source form through the
    /// engine registered for `suffix`.
    pub fn compiled_source(&self, suffix: &str, id: &str, text: &str) -> Result<String> {
        let info = self
            .engine_info(suffix)
            .ok_or(Error::MissingEngine { suffix: suffix.to_string() })?;
        let compile = info.compile_to_source.as_ref().ok_or_else(|| {
            Error::TemplateError(format!("engine '{}' cannot compile to source", suffix))
        })?;
        compile(Some(&to_id(id)), text)
    }

    // hookups & fragments -------------------------------------------------

    /// Registers a one-shot post-attachment callback and returns the marker
    /// attribute to embed on the target element.
    pub fn hook(&self, callback: HookupFn) -> String {
        HookupRegistry::marker(self.inner.hookups.hook(callback))
    }

    pub fn hookups(&self) -> &HookupRegistry {
        &self.inner.hookups
    }

    /// Runs the hookup walk over `fragment`. See [`HookupRegistry::attach`].
    pub fn attach(&self, fragment: &mut Fragment, parent: Option<&Element>) {
        self.inner.hookups.attach(fragment, parent);
    }

    /// Builds a fragment from markup and attaches it in one step.
    pub fn frag(&self, markup: &str) -> Result<Fragment> {
        let builder = self.inner.builder.borrow().clone();
        let mut fragment = builder.build(markup)?;
        self.attach(&mut fragment, None);
        Ok(fragment)
    }

    // rendering -----------------------------------------------------------

    /// Renders a template to string form.
    ///
    /// Returns [`RenderOutcome::Ready`] when the template is resolvable
    /// synchronously and no data value is pending; otherwise a deferred
    /// outcome whose promise resolves to `(result, substituted data)`.
    /// Supplying a callback forces the asynchronous path; the callback
    /// receives the rendered output once everything has settled.
    pub fn render(
        &self,
        template: impl Into<TemplateRef>,
        data: Option<TemplateData>,
        helpers: Option<Helpers>,
        callback: Option<RenderCallback>,
    ) -> Result<RenderOutcome> {
        self.render_as(OutputFormat::String, template.into(), data, helpers, callback)
    }

    /// Renders a template to fragment form, running hookups on the result.
    pub fn view(
        &self,
        template: impl Into<TemplateRef>,
        data: Option<TemplateData>,
        helpers: Option<Helpers>,
        callback: Option<RenderCallback>,
    ) -> Result<RenderOutcome> {
        self.render_as(OutputFormat::Fragment, template.into(), data, helpers, callback)
    }

    /// Renders with an explicit output format.
    pub fn render_as(
        &self,
        format: OutputFormat,
        template: TemplateRef,
        data: Option<TemplateData>,
        helpers: Option<Helpers>,
        callback: Option<RenderCallback>,
    ) -> Result<RenderOutcome> {
        // Discover pending values, one level deep.
        let mut pending = Vec::new();
        let data = match data {
            Some(TemplateData::Context(context)) => {
                for value in context.values() {
                    if let ContextValue::Pending(promise) = value {
                        pending.push(promise.clone());
                    }
                }
                Some(TemplateData::Context(context))
            }
            Some(TemplateData::Pending(promise)) => {
                pending.push(promise.clone());
                Some(TemplateData::Pending(promise))
            }
            other => other,
        };

        if !pending.is_empty() {
            // data is present: pending values came from it.
            let data = match data {
                Some(data) => data,
                None => return Err(Error::TemplateError("pending values without data".into())),
            };
            return self.render_deferred(format, template, data, pending, helpers, callback);
        }

        // No pending values: pick the fast path.
        let data_value = match data {
            None => None,
            Some(TemplateData::Value(value)) => Some(value),
            Some(TemplateData::Context(context)) => Some(plain_context_value(context)),
            Some(TemplateData::Pending(_)) => None,
        };

        if let Some(callback) = callback {
            return self.render_async(format, template, data_value, helpers, callback);
        }
        self.render_sync(format, template, data_value, helpers)
    }

    /// The combined-future path: waits on every pending data value plus the
    /// renderer, substitutes settled values into a shallow copy of the
    /// context, then renders.
    fn render_deferred(
        &self,
        format: OutputFormat,
        template: TemplateRef,
        data: TemplateData,
        pending: Vec<Promise<Value>>,
        helpers: Option<Helpers>,
        callback: Option<RenderCallback>,
    ) -> Result<RenderOutcome> {
        let outer: Promise<(Rendered, Value)> = Promise::new();
        let resolution = match self.resolve_renderer(template, false) {
            Ok(resolution) => resolution,
            Err(e) => {
                outer.reject(Rc::new(e));
                return Ok(RenderOutcome::Deferred(outer));
            }
        };

        let settled: Rc<RefCell<Vec<Option<Value>>>> =
            Rc::new(RefCell::new(vec![None; pending.len()]));
        let renderer_slot: Rc<RefCell<Option<RendererWrapper>>> = Rc::new(RefCell::new(None));
        // The renderer promise counts as the last waited item.
        let remaining = Rc::new(Cell::new(pending.len() + 1));
        let callback = Rc::new(RefCell::new(callback));
        let original = Rc::new(data);
        let helpers = Rc::new(helpers);

        let finish: Rc<dyn Fn()> = {
            let views = self.clone();
            let outer = outer.clone();
            let settled = Rc::clone(&settled);
            let renderer_slot = Rc::clone(&renderer_slot);
            let callback = Rc::clone(&callback);
            let original = Rc::clone(&original);
            let helpers = Rc::clone(&helpers);
            Rc::new(move || {
                if outer.state() != SettleState::Pending {
                    return;
                }
                let Some(renderer) = renderer_slot.borrow_mut().take() else { return };
                let data_value = substitute(&views.settled_adapter(), &original, &settled.borrow());
                match views.render_to(format, &renderer, &data_value, (*helpers).as_ref()) {
                    Ok(result) => {
                        // Continuations chained on the outer promise run
                        // before the completion callback.
                        outer.resolve((result.clone(), data_value.clone()));
                        if let Some(cb) = callback.borrow_mut().take() {
                            cb(&result, &data_value);
                        }
                    }
                    Err(e) => outer.reject(Rc::new(e)),
                }
            })
        };

        for (index, promise) in pending.iter().enumerate() {
            let outer = outer.clone();
            let settled = Rc::clone(&settled);
            let remaining = Rc::clone(&remaining);
            let finish = Rc::clone(&finish);
            promise.then(move |outcome| match outcome {
                Ok(value) => {
                    settled.borrow_mut()[index] = Some(value);
                    remaining.set(remaining.get() - 1);
                    if remaining.get() == 0 {
                        finish();
                    }
                }
                Err(reason) => outer.reject(reason),
            });
        }
        {
            let outer = outer.clone();
            let remaining = Rc::clone(&remaining);
            let finish = Rc::clone(&finish);
            resolution.promise.then(move |outcome| match outcome {
                Ok(renderer) => {
                    *renderer_slot.borrow_mut() = Some(renderer);
                    remaining.set(remaining.get() - 1);
                    if remaining.get() == 0 {
                        finish();
                    }
                }
                Err(reason) => outer.reject(reason),
            });
        }

        Ok(RenderOutcome::Deferred(outer))
    }

    /// Callback supplied, nothing pending: resolve asynchronously and fire
    /// the callback with the rendered output, or with the bare renderer
    /// when no data was given.
    fn render_async(
        &self,
        format: OutputFormat,
        template: TemplateRef,
        data_value: Option<Value>,
        helpers: Option<Helpers>,
        callback: RenderCallback,
    ) -> Result<RenderOutcome> {
        let outer: Promise<(Rendered, Value)> = Promise::new();
        let resolution = match self.resolve_renderer(template, false) {
            Ok(resolution) => resolution,
            Err(e) => {
                outer.reject(Rc::new(e));
                return Ok(RenderOutcome::Deferred(outer));
            }
        };

        let views = self.clone();
        let outer_clone = outer.clone();
        resolution.promise.then(move |outcome| match outcome {
            Ok(renderer) => {
                let rendered = match &data_value {
                    Some(data) => views.render_to(format, &renderer, data, helpers.as_ref()),
                    None => Ok(Rendered::Renderer(renderer)),
                };
                match rendered {
                    Ok(result) => {
                        let data_value = data_value.unwrap_or(Value::Null);
                        callback(&result, &data_value);
                        outer_clone.resolve((result, data_value));
                    }
                    Err(e) => outer_clone.reject(Rc::new(e)),
                }
            }
            Err(reason) => outer_clone.reject(reason),
        });
        Ok(RenderOutcome::Deferred(outer))
    }

    /// No callback, nothing pending: the synchronous path. A cached,
    /// already-resolved template renders without going through promise
    /// continuations at all (see the cache's resolved side channel); an
    /// uncached one must still be deliverable before this returns, or the
    /// call fails with [`Error::NotReady`].
    fn render_sync(
        &self,
        format: OutputFormat,
        template: TemplateRef,
        data_value: Option<Value>,
        helpers: Option<Helpers>,
    ) -> Result<RenderOutcome> {
        let resolution = self.resolve_renderer(template, true)?;

        // Bypass the promise when a resolved renderer is reachable through
        // the cache side channel. A promise observed "resolved" from inside
        // its own resolution callbacks cannot be trusted to fire another
        // continuation in every promise implementation, so cache-backed
        // entries are read directly instead.
        if resolution.promise.state() == SettleState::Resolved {
            if let Some(current) = resolution
                .view_id
                .as_ref()
                .and_then(|id| self.inner.cache.renderer_for(id))
            {
                let rendered = match &data_value {
                    Some(data) => self.render_to(format, &current, data, helpers.as_ref())?,
                    None => Rendered::Renderer(current),
                };
                return Ok(RenderOutcome::Ready(rendered));
            }
        }

        let views = self.clone();
        let slot: Rc<RefCell<Option<std::result::Result<Rendered, Rc<Error>>>>> =
            Rc::new(RefCell::new(None));
        let slot_in = Rc::clone(&slot);
        resolution.promise.then(move |outcome| {
            let result = match outcome {
                Ok(renderer) => match &data_value {
                    Some(data) => views
                        .render_to(format, &renderer, data, helpers.as_ref())
                        .map_err(Rc::new),
                    None => Ok(Rendered::Renderer(renderer)),
                },
                Err(reason) => Err(reason),
            };
            *slot_in.borrow_mut() = Some(result);
        });

        // The continuation must have fired by now for a settled promise.
        let taken = slot.borrow_mut().take();
        match taken {
            Some(Ok(rendered)) => Ok(RenderOutcome::Ready(rendered)),
            Some(Err(reason)) => Err(Error::from_shared(reason)),
            None => Err(Error::NotReady { url: resolution.url }),
        }
    }

    /// Invokes `renderer` in the requested output format. String format
    /// forces the string form; fragment format converts string output
    /// through the fragment builder and runs hookups either way.
    pub fn render_to(
        &self,
        format: OutputFormat,
        renderer: &RendererWrapper,
        data: &Value,
        helpers: Option<&Helpers>,
    ) -> Result<Rendered> {
        match format {
            OutputFormat::String => {
                Ok(Rendered::Text(renderer.render_string(data, helpers)?))
            }
            OutputFormat::Fragment => match renderer.call(data, helpers)? {
                RenderValue::Text(markup) => Ok(Rendered::Fragment(self.frag(&markup)?)),
                RenderValue::Nodes(mut fragment) => {
                    self.attach(&mut fragment, None);
                    Ok(Rendered::Fragment(fragment))
                }
            },
        }
    }
}

impl Default for Views {
    fn default() -> Self {
        Views::new()
    }
}

/// Per-suffix convenience constructor produced by [`Views::register`].
pub struct EngineHandle {
    views: Views,
    suffix: String,
}

impl EngineHandle {
    pub fn suffix(&self) -> &str {
        &self.suffix
    }

    /// Compiles `text` under `id` and seeds the cache with the result, so
    /// later renders of `id` hit the resolved entry.
    pub fn compile(&self, id: &str, text: &str) -> Result<RendererWrapper> {
        let info = self.engine()?;
        let id = to_id(id);
        let wrapper = RendererWrapper::lazy(info, Some(id.clone()), text.to_string());
        self.views.preload_wrapper(&id, wrapper.clone());
        Ok(wrapper)
    }

    /// Compiles `text` into an anonymous, uncached wrapper, for inline
    /// template strings that never get an identity.
    pub fn compile_inline(&self, text: &str) -> Result<RendererWrapper> {
        Ok(RendererWrapper::lazy(self.engine()?, None, text.to_string()))
    }

    fn engine(&self) -> Result<Rc<EngineInfo>> {
        self.views
            .engine_info(&self.suffix)
            .ok_or(Error::MissingEngine { suffix: self.suffix.clone() })
    }
}

/// Shallow substitution: each originally-pending entry is replaced by its
/// settled value (run through the adapter), plain siblings copied over in
/// the context's own key order.
fn substitute(
    adapter: &SettledAdapter,
    original: &TemplateData,
    settled: &[Option<Value>],
) -> Value {
    match original {
        TemplateData::Pending(_) => {
            adapter(settled.first().cloned().flatten().unwrap_or(Value::Null))
        }
        TemplateData::Context(context) => {
            let mut copy = serde_json::Map::new();
            let mut next = 0;
            for (key, value) in context {
                let value = match value {
                    ContextValue::Value(value) => value.clone(),
                    ContextValue::Pending(_) => {
                        let value = settled.get(next).cloned().flatten().unwrap_or(Value::Null);
                        next += 1;
                        adapter(value)
                    }
                };
                copy.insert(key.clone(), value);
            }
            Value::Object(copy)
        }
        TemplateData::Value(value) => value.clone(),
    }
}

fn plain_context_value(context: Context) -> Value {
    let mut map = serde_json::Map::new();
    for (key, value) in context {
        if let ContextValue::Value(value) = value {
            map.insert(key, value);
        }
    }
    Value::Object(map)
}
