use crate::fragment::{Element, Fragment, Node};
use indexmap::IndexMap;
use log::{debug, warn};
use std::cell::{Cell, RefCell};

/// The reserved attribute carrying a hookup token in rendered markup.
pub const DATA_VIEW_ID: &str = "data-view-id";

/// Handle linking a marker in rendered markup to its one-shot callback.
pub type HookupToken = u64;

/// Callback fired once when the marked element is attached. Receives the
/// element, the parent node the fragment is being attached under (if any),
/// and the consumed token.
pub type HookupFn = Box<dyn FnOnce(&mut Element, Option<&Element>, HookupToken)>;

/// One-shot post-attachment callbacks keyed by generated token.
///
/// Tokens increase monotonically from 1 for the life of the registry. An
/// entry is consumed the first time a matching marker is found during an
/// attach walk; a token whose marker never reaches a fragment leaks its
/// entry, a documented limitation of the protocol.
#[derive(Default)]
pub struct HookupRegistry {
    next_token: Cell<HookupToken>,
    pending: RefCell<IndexMap<HookupToken, HookupFn>>,
}

impl HookupRegistry {
    pub fn new() -> Self {
        HookupRegistry { next_token: Cell::new(1), pending: RefCell::new(IndexMap::new()) }
    }

    /// Allocates the next token and stores `callback` under it.
    pub fn hook(&self, callback: HookupFn) -> HookupToken {
        let token = self.next_token.get();
        self.next_token.set(token + 1);
        self.pending.borrow_mut().insert(token, callback);
        token
    }

    /// The attribute string to embed on the element the callback should
    /// receive, e.g. ` data-view-id='3'`.
    pub fn marker(token: HookupToken) -> String {
        format!(" {}='{}'", DATA_VIEW_ID, token)
    }

    /// Number of callbacks still waiting for their marker.
    pub fn pending_len(&self) -> usize {
        self.pending.borrow().len()
    }

    /// Walks every element of `fragment` (roots and descendants, document
    /// order) and fires the callback for each live marker found, consuming
    /// the registry entry and stripping the marker attribute. A token fires
    /// at most once, ever. Returns nothing; the fragment is mutated in
    /// place and stays usable for chaining.
    pub fn attach(&self, fragment: &mut Fragment, parent: Option<&Element>) {
        for node in &mut fragment.nodes {
            self.visit(node, parent);
        }
    }

    fn visit(&self, node: &mut Node, parent: Option<&Element>) {
        let Node::Element(element) = node else { return };
        if let Some(value) = element.attr(DATA_VIEW_ID).map(str::to_string) {
            match value.parse::<HookupToken>() {
                Ok(token) => {
                    let callback = self.pending.borrow_mut().shift_remove(&token);
                    if let Some(callback) = callback {
                        debug!("firing hookup {} on <{}>", token, element.tag);
                        // The callback still sees the marker; it is stripped
                        // only after the callback returns.
                        callback(element, parent, token);
                        element.remove_attr(DATA_VIEW_ID);
                    }
                }
                Err(_) => warn!("ignoring non-numeric {} '{}'", DATA_VIEW_ID, value),
            }
        }
        for child in &mut element.children {
            self.visit(child, parent);
        }
    }
}
