//! vellum is a template-rendering abstraction layer: given a template
//! reference (inline source, a resource URL, or an already-compiled
//! renderer) and a data context, it produces a string or a node fragment,
//! transparently waiting on any pending values embedded in the context.
//! Fragment output supports one-shot "hookup" callbacks that run when the
//! rendered nodes are attached.

/// Template identifier normalization and the two-tier template cache.
pub mod cache;

/// Renderer-engine registration and the bundled MiniJinja adapter.
pub mod engine;

/// Defines custom error types.
pub mod error;

/// Template-text fetch and path-resolution collaborators.
pub mod fetch;

/// The owned fragment node tree and the markup-to-nodes builder seam.
pub mod fragment;

/// One-shot post-attachment hookup callbacks.
pub mod hookup;

/// Single-threaded promises with synchronous continuation delivery.
pub mod promise;

/// Template request normalization and resolution.
pub mod resolver;

/// The rendering facade: dispatcher, async data coordination, preloading.
pub mod view;
