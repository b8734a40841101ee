//! Renderer-engine registration: the registry of template engines and the
//! lazily-built renderer wrappers handed out to callers.

pub mod minijinja;

use crate::error::{Error, Result};
use crate::fragment::Fragment;
use indexmap::IndexMap;
use log::debug;
use serde_json::Value;
use std::cell::OnceCell;
use std::rc::Rc;

/// Helper values merged over the data context before rendering.
pub type Helpers = serde_json::Map<String, Value>;

/// A compiled renderer producing markup text.
pub type StringRenderer = Box<dyn Fn(&Value, Option<&Helpers>) -> Result<String>>;

/// A compiled renderer producing a node fragment directly, skipping the
/// string round-trip.
pub type FragmentRenderer = Box<dyn Fn(&Value, Option<&Helpers>) -> Result<Fragment>>;

/// Factory building a [`StringRenderer`] from `(id, template text)`.
pub type StringFactory = Box<dyn Fn(Option<&str>, &str) -> Result<StringRenderer>>;

/// Factory building a [`FragmentRenderer`] from `(id, template text)`.
pub type FragmentFactory = Box<dyn Fn(Option<&str>, &str) -> Result<FragmentRenderer>>;

/// Compiles template text into a source form suitable for build-time
/// preloading.
pub type SourceCompiler = Box<dyn Fn(Option<&str>, &str) -> Result<String>>;

/// A registered template engine.
///
/// At least one of `build_string` / `build_fragment` must be present;
/// fragment capability takes priority when both are.
pub struct EngineInfo {
    /// Suffix (without the dot) this engine claims, e.g. `j2`.
    pub suffix: String,
    pub build_string: Option<StringFactory>,
    pub build_fragment: Option<FragmentFactory>,
    pub compile_to_source: Option<SourceCompiler>,
}

impl EngineInfo {
    pub fn has_factory(&self) -> bool {
        self.build_string.is_some() || self.build_fragment.is_some()
    }
}

/// The primary output of a renderer call.
#[derive(Clone)]
pub enum RenderValue {
    Text(String),
    Nodes(Fragment),
}

/// The engine shape, fixed once when the wrapper is first built.
enum Compiled {
    Text(StringRenderer),
    Nodes(FragmentRenderer),
}

struct WrapperInner {
    cell: OnceCell<Compiled>,
    build: Box<dyn Fn() -> Result<Compiled>>,
}

/// The callable handed out for a template: a build-once cell around the
/// engine factory. Built on first invocation, never rebuilt. Cloning is a
/// cheap handle copy; all clones share the compiled renderer.
#[derive(Clone)]
pub struct RendererWrapper {
    inner: Rc<WrapperInner>,
}

impl RendererWrapper {
    /// A wrapper that compiles `text` through `info`'s factories on first use.
    /// Fragment factories win over string factories when both are present.
    pub fn lazy(info: Rc<EngineInfo>, id: Option<String>, text: String) -> Self {
        let build = Box::new(move || {
            if let Some(factory) = &info.build_fragment {
                Ok(Compiled::Nodes(factory(id.as_deref(), &text)?))
            } else if let Some(factory) = &info.build_string {
                Ok(Compiled::Text(factory(id.as_deref(), &text)?))
            } else {
                Err(Error::TemplateError(format!(
                    "engine '{}' has no renderer factory",
                    info.suffix
                )))
            }
        });
        RendererWrapper { inner: Rc::new(WrapperInner { cell: OnceCell::new(), build }) }
    }

    /// A wrapper around an already-compiled string renderer, used when
    /// build tooling ships precompiled templates.
    pub fn from_string_renderer(renderer: StringRenderer) -> Self {
        Self::from_compiled(Compiled::Text(renderer))
    }

    /// A wrapper around an already-compiled fragment renderer.
    pub fn from_fragment_renderer(renderer: FragmentRenderer) -> Self {
        Self::from_compiled(Compiled::Nodes(renderer))
    }

    fn from_compiled(compiled: Compiled) -> Self {
        let inner = WrapperInner {
            cell: OnceCell::new(),
            build: Box::new(|| {
                Err(Error::TemplateError("precompiled renderer cannot be rebuilt".into()))
            }),
        };
        let _ = inner.cell.set(compiled);
        RendererWrapper { inner: Rc::new(inner) }
    }

    fn compiled(&self) -> Result<&Compiled> {
        if let Some(existing) = self.inner.cell.get() {
            return Ok(existing);
        }
        let built = (self.inner.build)()?;
        Ok(self.inner.cell.get_or_init(|| built))
    }

    /// Invokes the renderer in its primary form.
    pub fn call(&self, data: &Value, helpers: Option<&Helpers>) -> Result<RenderValue> {
        match self.compiled()? {
            Compiled::Text(renderer) => Ok(RenderValue::Text(renderer(data, helpers)?)),
            Compiled::Nodes(renderer) => Ok(RenderValue::Nodes(renderer(data, helpers)?)),
        }
    }

    /// Forces the string form, even for fragment-based engines. Used when a
    /// template is included as a sub-template, where re-entrant fragment
    /// hookups are unwanted.
    pub fn render_string(&self, data: &Value, helpers: Option<&Helpers>) -> Result<String> {
        match self.compiled()? {
            Compiled::Text(renderer) => renderer(data, helpers),
            Compiled::Nodes(renderer) => Ok(renderer(data, helpers)?.to_markup()),
        }
    }

    /// Whether the underlying engine produces fragments natively.
    pub fn is_fragment_based(&self) -> Result<bool> {
        Ok(matches!(self.compiled()?, Compiled::Nodes(_)))
    }

    pub fn ptr_eq(&self, other: &Self) -> bool {
        Rc::ptr_eq(&self.inner, &other.inner)
    }
}

/// Registered engines keyed by suffix. Re-registering a suffix overwrites
/// the previous engine, no merge and no warning.
#[derive(Default)]
pub struct Registry {
    engines: IndexMap<String, Rc<EngineInfo>>,
}

impl Registry {
    pub fn new() -> Self {
        Registry::default()
    }

    pub fn insert(&mut self, info: EngineInfo) -> Result<Rc<EngineInfo>> {
        if !info.has_factory() {
            return Err(Error::TemplateError(format!(
                "engine '{}' must provide at least one renderer factory",
                info.suffix
            )));
        }
        debug!("registering engine for suffix '{}'", info.suffix);
        let info = Rc::new(info);
        self.engines.insert(info.suffix.clone(), Rc::clone(&info));
        Ok(info)
    }

    pub fn get(&self, suffix: &str) -> Option<Rc<EngineInfo>> {
        self.engines.get(suffix.trim_start_matches('.')).cloned()
    }
}
