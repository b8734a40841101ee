use regex::Regex;
use serde_json::{json, Value};
use std::cell::{Cell, RefCell};
use std::collections::HashMap;
use std::io::Write as _;
use std::rc::Rc;
use test_log::test;
use vellum::engine::{EngineInfo, Helpers};
use vellum::error::Error;
use vellum::fetch::{FileFetcher, TemplateFetcher};
use vellum::fragment::{FragmentBuilder, MarkupBuilder, Node};
use vellum::promise::{Promise, SettleState};
use vellum::resolver::TemplateRef;
use vellum::view::{Context, ContextValue, RenderCallback, Rendered, TemplateData, Views};

/// Test fetcher: hands out one promise per URL and records every call, so
/// tests can settle fetches on their own schedule.
#[derive(Default)]
struct ManualFetcher {
    calls: RefCell<Vec<String>>,
    promises: RefCell<HashMap<String, Promise<String>>>,
}

impl ManualFetcher {
    fn promise_for(&self, url: &str) -> Promise<String> {
        self.promises
            .borrow_mut()
            .entry(url.to_string())
            .or_insert_with(Promise::new)
            .clone()
    }

    fn call_count(&self) -> usize {
        self.calls.borrow().len()
    }
}

impl TemplateFetcher for ManualFetcher {
    fn fetch(&self, url: &str, _blocking: bool) -> Promise<String> {
        self.calls.borrow_mut().push(url.to_string());
        self.promise_for(url)
    }
}

/// A minimal `<%= name %>` interpolation engine, string-only.
fn ejs_engine() -> EngineInfo {
    EngineInfo {
        suffix: "ejs".to_string(),
        build_string: Some(Box::new(|_, text| {
            let text = text.to_string();
            let pattern = Regex::new(r"<%=\s*(\w+)\s*%>").unwrap();
            Ok(Box::new(move |data, _| {
                Ok(pattern
                    .replace_all(&text, |caps: &regex::Captures| {
                        match data.get(&caps[1]) {
                            Some(Value::String(s)) => s.clone(),
                            Some(other) => other.to_string(),
                            None => String::new(),
                        }
                    })
                    .into_owned())
            }))
        })),
        build_fragment: None,
        compile_to_source: Some(Box::new(|_, text| Ok(text.to_string()))),
    }
}

/// A fragment-capable engine: parses the template markup once and clones
/// the node tree per render.
fn nodes_engine() -> EngineInfo {
    EngineInfo {
        suffix: "nodes".to_string(),
        build_string: None,
        build_fragment: Some(Box::new(|_, text| {
            let master = MarkupBuilder.build(text)?;
            Ok(Box::new(move |_, _| Ok(master.clone())))
        })),
        compile_to_source: None,
    }
}

fn manual_views() -> (Views, Rc<ManualFetcher>) {
    let views = Views::with_minijinja();
    let fetcher = Rc::new(ManualFetcher::default());
    views.set_fetcher(fetcher.clone());
    (views, fetcher)
}

#[test]
fn test_cached_identifier_reuses_promise_without_fetch() {
    let (views, fetcher) = manual_views();
    let handle = views.register(vellum::engine::minijinja::engine_info()).unwrap();
    handle.compile("pre.j2", "hi").unwrap();

    let first = views.resolve(TemplateRef::from("pre.j2"), true);
    let second = views.resolve(TemplateRef::from("pre.j2"), true);
    assert!(first.ptr_eq(&second));
    assert_eq!(first.state(), SettleState::Resolved);
    assert_eq!(fetcher.call_count(), 0);
}

#[test]
fn test_sync_render_matches_engine_direct() {
    let (views, _) = manual_views();
    let handle = views.register(vellum::engine::minijinja::engine_info()).unwrap();
    let wrapper = handle.compile("greet.j2", "Hello {{ name }}").unwrap();

    let direct = wrapper.render_string(&json!({"name": "world"}), None).unwrap();
    let outcome = views
        .render("greet.j2", Some(json!({"name": "world"}).into()), None, None)
        .unwrap();
    let rendered = outcome.ready().expect("no pending values, must be synchronous");
    assert_eq!(rendered.as_text().unwrap(), direct);
    assert_eq!(direct, "Hello world");
}

#[test]
fn test_render_without_data_returns_renderer() {
    let (views, _) = manual_views();
    let handle = views.register(vellum::engine::minijinja::engine_info()).unwrap();
    handle.compile("greet.j2", "Hello {{ name }}").unwrap();

    let outcome = views.render("greet.j2", None, None, None).unwrap();
    let rendered = outcome.ready().unwrap();
    let renderer = rendered.as_renderer().expect("bare renderer expected");
    let text = renderer.render_string(&json!({"name": "again"}), None).unwrap();
    assert_eq!(text, "Hello again");
}

#[test]
fn test_inline_template_resolves_synchronously() {
    let (views, fetcher) = manual_views();
    views.add_inline("greeting", "text/x-j2", "Hi {{ who }}");

    let outcome =
        views.render("#greeting", Some(json!({"who": "you"}).into()), None, None).unwrap();
    assert_eq!(outcome.ready().unwrap().as_text().unwrap(), "Hi you");
    assert_eq!(fetcher.call_count(), 0);
    assert!(views.cache().contains("greeting"));
}

#[test]
fn test_default_ext_appended_to_extensionless_url() {
    let (views, _) = manual_views();
    let handle = views.register(vellum::engine::minijinja::engine_info()).unwrap();
    handle.compile("plain.j2", "ok").unwrap();

    let outcome = views.render("plain", Some(json!({}).into()), None, None).unwrap();
    assert_eq!(outcome.ready().unwrap().as_text().unwrap(), "ok");
}

#[test]
fn test_remote_render_via_callback() {
    let (views, fetcher) = manual_views();
    views.register(ejs_engine()).unwrap();

    let seen = Rc::new(RefCell::new(None));
    let seen_in = Rc::clone(&seen);
    let outcome = views
        .render(
            "greet.ejs",
            Some(json!({"name": "world"}).into()),
            None,
            Some(Box::new(move |rendered, _| {
                *seen_in.borrow_mut() = Some(rendered.as_text().unwrap().to_string());
            })),
        )
        .unwrap();
    let promise = outcome.deferred().expect("callback forces the async path");

    assert!(seen.borrow().is_none());
    fetcher.promise_for("greet.ejs").resolve("Hello <%= name %>".to_string());
    assert_eq!(seen.borrow().as_deref(), Some("Hello world"));
    assert_eq!(promise.state(), SettleState::Resolved);
}

#[test]
fn test_inflight_identifier_shares_one_fetch() {
    let (views, fetcher) = manual_views();
    views.register(ejs_engine()).unwrap();

    let hits = Rc::new(Cell::new(0));
    let make_callback = |hits: &Rc<Cell<u32>>| -> RenderCallback {
        let hits = Rc::clone(hits);
        Box::new(move |rendered: &Rendered, _: &Value| {
            assert_eq!(rendered.as_text().unwrap(), "Hello world");
            hits.set(hits.get() + 1);
        })
    };

    for _ in 0..2 {
        views
            .render(
                "greet.ejs",
                Some(json!({"name": "world"}).into()),
                None,
                Some(make_callback(&hits)),
            )
            .unwrap();
    }
    assert_eq!(fetcher.call_count(), 1);

    // Resolving the identifier again while the fetch is in flight hands
    // back the same pending promise.
    let first = views.resolve(TemplateRef::from("greet.ejs"), true);
    let second = views.resolve(TemplateRef::from("greet.ejs"), true);
    assert_eq!(first.state(), SettleState::Pending);
    assert!(first.ptr_eq(&second));

    fetcher.promise_for("greet.ejs").resolve("Hello <%= name %>".to_string());
    assert_eq!(hits.get(), 2);
}

#[test]
fn test_caching_disabled_refetches_remote_templates() {
    let (views, fetcher) = manual_views();
    views.register(ejs_engine()).unwrap();
    views.set_caching(false);
    fetcher.promise_for("greet.ejs").resolve("Hi <%= name %>".to_string());

    for _ in 0..2 {
        let outcome = views
            .render("greet.ejs", Some(json!({"name": "x"}).into()), None, None)
            .unwrap();
        assert_eq!(outcome.ready().unwrap().as_text().unwrap(), "Hi x");
    }
    assert_eq!(fetcher.call_count(), 2);
    assert!(!views.cache().contains("greet_ejs"));
}

#[test]
fn test_sync_render_of_unsettled_fetch_is_not_ready() {
    let (views, _fetcher) = manual_views();
    views.register(ejs_engine()).unwrap();

    let result = views.render("slow.ejs", Some(json!({}).into()), None, None);
    assert!(matches!(result, Err(Error::NotReady { .. })));
}

#[test]
fn test_empty_remote_template_rejects_with_url() {
    let (views, fetcher) = manual_views();
    views.register(ejs_engine()).unwrap();

    let outcome = views
        .render("void.ejs", Some(json!({}).into()), None, Some(Box::new(|_, _| {})))
        .unwrap();
    let promise = outcome.deferred().unwrap();
    fetcher.promise_for("void.ejs").resolve(String::new());

    let reason = promise.error().expect("empty template must reject");
    assert!(matches!(&*reason, Error::EmptyTemplate { url } if url == "void.ejs"));
}

#[test]
fn test_empty_file_template_errors_synchronously() {
    let dir = tempfile::tempdir().unwrap();
    std::fs::File::create(dir.path().join("blank.j2")).unwrap();

    let views = Views::with_minijinja();
    views.set_fetcher(Rc::new(FileFetcher::new(dir.path())));
    let result = views.render("blank.j2", Some(json!({}).into()), None, None);
    assert!(matches!(result, Err(Error::EmptyTemplate { .. })));
}

#[test]
fn test_file_fetched_template_renders_synchronously() {
    let dir = tempfile::tempdir().unwrap();
    let mut file = std::fs::File::create(dir.path().join("greet.j2")).unwrap();
    write!(file, "Hello {{{{ name }}}}").unwrap();

    let views = Views::with_minijinja();
    views.set_fetcher(Rc::new(FileFetcher::new(dir.path())));
    let outcome = views
        .render("greet.j2", Some(json!({"name": "disk"}).into()), None, None)
        .unwrap();
    assert_eq!(outcome.ready().unwrap().as_text().unwrap(), "Hello disk");
}

#[test]
fn test_missing_engine_suffix_errors() {
    let (views, _) = manual_views();
    let result = views.render("page.unknown", Some(json!({}).into()), None, None);
    assert!(matches!(result, Err(Error::MissingEngine { suffix }) if suffix == "unknown"));
}

#[test]
fn test_pending_values_substitute_in_key_order() {
    let (views, _) = manual_views();
    let handle = views.register(vellum::engine::minijinja::engine_info()).unwrap();
    handle.compile("row.j2", "{{ a }} {{ b }} {{ c }}").unwrap();

    let b = Promise::new();
    let mut context = Context::new();
    context.insert("a".to_string(), ContextValue::Value(json!("1")));
    context.insert("b".to_string(), ContextValue::Pending(b.clone()));
    context.insert("c".to_string(), ContextValue::Value(json!("3")));

    let outcome = views.render("row.j2", Some(context.into()), None, None).unwrap();
    let promise = outcome.deferred().expect("pending value forces a deferred outcome");
    assert_eq!(promise.state(), SettleState::Pending);

    b.resolve(json!("2"));
    let (rendered, data) = promise.value().expect("all values settled");
    assert_eq!(rendered.as_text().unwrap(), "1 2 3");
    let keys: Vec<_> = data.as_object().unwrap().keys().cloned().collect();
    assert_eq!(keys, vec!["a", "b", "c"]);
    assert_eq!(data["b"], json!("2"));
}

#[test]
fn test_multiple_pending_values_and_callback_pair() {
    let (views, _) = manual_views();
    let handle = views.register(vellum::engine::minijinja::engine_info()).unwrap();
    handle.compile("pair.j2", "{{ x }}+{{ y }}").unwrap();

    let x = Promise::new();
    let y = Promise::new();
    let mut context = Context::new();
    context.insert("x".to_string(), ContextValue::Pending(x.clone()));
    context.insert("y".to_string(), ContextValue::Pending(y.clone()));

    let seen = Rc::new(RefCell::new(None));
    let seen_in = Rc::clone(&seen);
    views
        .render(
            "pair.j2",
            Some(context.into()),
            None,
            Some(Box::new(move |rendered, data| {
                *seen_in.borrow_mut() =
                    Some((rendered.as_text().unwrap().to_string(), data.clone()));
            })),
        )
        .unwrap();

    // Settlement order differs from key order; substitution must not care.
    y.resolve(json!("b"));
    x.resolve(json!("a"));
    let seen = seen.borrow();
    let (text, data) = seen.as_ref().unwrap();
    assert_eq!(text, "a+b");
    assert_eq!(data["x"], json!("a"));
    assert_eq!(data["y"], json!("b"));
}

#[test]
fn test_outer_promise_settles_before_completion_callback() {
    let (views, _) = manual_views();
    let handle = views.register(vellum::engine::minijinja::engine_info()).unwrap();
    handle.compile("order.j2", "{{ v }}").unwrap();

    let pending = Promise::new();
    let mut context = Context::new();
    context.insert("v".to_string(), ContextValue::Pending(pending.clone()));

    let order = Rc::new(RefCell::new(Vec::new()));
    let order_cb = Rc::clone(&order);
    let outcome = views
        .render(
            "order.j2",
            Some(context.into()),
            None,
            Some(Box::new(move |_, _| order_cb.borrow_mut().push("callback"))),
        )
        .unwrap();
    let promise = outcome.deferred().unwrap();
    let order_then = Rc::clone(&order);
    promise.then(move |_| order_then.borrow_mut().push("continuation"));

    pending.resolve(json!("x"));
    assert_eq!(*order.borrow(), vec!["continuation", "callback"]);
    assert_eq!(promise.state(), SettleState::Resolved);
}

#[test]
fn test_pending_rejection_aborts_render() {
    let (views, _) = manual_views();
    let renders = Rc::new(Cell::new(0));
    let renders_in = Rc::clone(&renders);
    let counting = EngineInfo {
        suffix: "count".to_string(),
        build_string: Some(Box::new(move |_, _| {
            let renders = Rc::clone(&renders_in);
            Ok(Box::new(move |_, _| {
                renders.set(renders.get() + 1);
                Ok(String::new())
            }))
        })),
        build_fragment: None,
        compile_to_source: None,
    };
    let handle = views.register(counting).unwrap();
    handle.compile("doomed.count", "-").unwrap();

    let bad = Promise::new();
    let good = Promise::new();
    let mut context = Context::new();
    context.insert("ok".to_string(), ContextValue::Pending(good.clone()));
    context.insert("bad".to_string(), ContextValue::Pending(bad.clone()));

    let outcome = views.render("doomed.count", Some(context.into()), None, None).unwrap();
    let promise = outcome.deferred().unwrap();

    let reason = Rc::new(Error::TemplateError("load failed".into()));
    bad.reject(Rc::clone(&reason));
    good.resolve(json!(1));

    let rejection = promise.error().expect("rejection must propagate");
    assert!(Rc::ptr_eq(&rejection, &reason));
    assert_eq!(renders.get(), 0, "renderer must never run after a rejection");
}

#[test]
fn test_whole_context_pending_unwraps_success_pair() {
    let (views, _) = manual_views();
    let handle = views.register(vellum::engine::minijinja::engine_info()).unwrap();
    handle.compile("whole.j2", "Hello {{ name }}").unwrap();

    let data = Promise::new();
    let outcome = views
        .render("whole.j2", Some(TemplateData::Pending(data.clone())), None, None)
        .unwrap();
    let promise = outcome.deferred().unwrap();

    data.resolve(json!([{ "name": "world" }, "success"]));
    let (rendered, substituted) = promise.value().unwrap();
    assert_eq!(rendered.as_text().unwrap(), "Hello world");
    assert_eq!(substituted, json!({"name": "world"}));
}

#[test]
fn test_custom_settled_adapter_replaces_unwrap_policy() {
    let (views, _) = manual_views();
    let handle = views.register(vellum::engine::minijinja::engine_info()).unwrap();
    handle.compile("raw.j2", "{{ value[0] }}").unwrap();
    // Identity adapter: tagged pairs pass through untouched.
    views.set_settled_adapter(Rc::new(|value| value));

    let pending = Promise::new();
    let mut context = Context::new();
    context.insert("value".to_string(), ContextValue::Pending(pending.clone()));
    let outcome = views.render("raw.j2", Some(context.into()), None, None).unwrap();
    let promise = outcome.deferred().unwrap();

    pending.resolve(json!(["kept", "success"]));
    let (rendered, data) = promise.value().unwrap();
    // The pair was not unwrapped: the template still sees both elements.
    assert_eq!(rendered.as_text().unwrap(), "kept");
    assert_eq!(data["value"], json!(["kept", "success"]));
}

#[test]
fn test_helpers_are_available_to_the_template() {
    let (views, _) = manual_views();
    let handle = views.register(vellum::engine::minijinja::engine_info()).unwrap();
    handle.compile("help.j2", "{{ name }}{{ suffix }}").unwrap();

    let mut helpers = Helpers::new();
    helpers.insert("suffix".to_string(), json!("!"));
    let outcome = views
        .render("help.j2", Some(json!({"name": "hi"}).into()), Some(helpers), None)
        .unwrap();
    assert_eq!(outcome.ready().unwrap().as_text().unwrap(), "hi!");
}

#[test]
fn test_renderer_reference_resolves_immediately() {
    let (views, fetcher) = manual_views();
    let handle = views.register(vellum::engine::minijinja::engine_info()).unwrap();
    let wrapper = handle.compile_inline("[{{ n }}]").unwrap();

    let outcome = views
        .render(TemplateRef::Renderer(wrapper), Some(json!({"n": 9}).into()), None, None)
        .unwrap();
    assert_eq!(outcome.ready().unwrap().as_text().unwrap(), "[9]");
    assert_eq!(fetcher.call_count(), 0);
}

#[test]
fn test_string_engine_in_fragment_mode() {
    let (views, _) = manual_views();
    let handle = views.register(vellum::engine::minijinja::engine_info()).unwrap();
    handle.compile("item.j2", "<li>{{ n }}</li>").unwrap();

    let outcome = views.view("item.j2", Some(json!({"n": 4}).into()), None, None).unwrap();
    let rendered = outcome.ready().unwrap();
    let fragment = rendered.as_fragment().unwrap();
    assert!(matches!(&fragment.nodes[0], Node::Element(el) if el.tag == "li"));
    assert_eq!(fragment.to_markup(), "<li>4</li>");
}

#[test]
fn test_fragment_engine_hookup_fires_exactly_once() {
    let (views, _) = manual_views();
    let handle = views.register(nodes_engine()).unwrap();

    let fired = Rc::new(RefCell::new(Vec::new()));
    let fired_in = Rc::clone(&fired);
    let marker = views.hook(Box::new(move |el, _, token| {
        fired_in.borrow_mut().push((el.tag.clone(), token));
    }));
    handle.compile("card.nodes", &format!("<div{}>hi</div>", marker)).unwrap();

    let outcome = views.view("card.nodes", Some(json!({}).into()), None, None).unwrap();
    let rendered = outcome.ready().unwrap();
    assert!(!rendered.as_fragment().unwrap().to_markup().contains("data-view-id"));
    assert_eq!(fired.borrow().len(), 1);

    // A second render carries the marker again, but the token is spent.
    views.view("card.nodes", Some(json!({}).into()), None, None).unwrap();
    assert_eq!(fired.borrow().len(), 1);
    assert_eq!(views.hookups().pending_len(), 0);
}

#[test]
fn test_hookup_marker_via_string_template() {
    let (views, _) = manual_views();
    let handle = views.register(vellum::engine::minijinja::engine_info()).unwrap();
    handle.compile("wired.j2", "<span{{ marker }}>x</span>").unwrap();

    let fired = Rc::new(Cell::new(0));
    let fired_in = Rc::clone(&fired);
    let marker = views.hook(Box::new(move |_, _, _| fired_in.set(fired_in.get() + 1)));

    let outcome = views
        .view("wired.j2", Some(json!({"marker": marker}).into()), None, None)
        .unwrap();
    assert_eq!(fired.get(), 1);
    assert_eq!(outcome.ready().unwrap().as_fragment().unwrap().to_markup(), "<span>x</span>");
}

#[test]
fn test_preload_string_renderer_bootstrap() {
    let (views, fetcher) = manual_views();
    views.preload_string(
        "built/ahead.j2",
        Box::new(|data, _| Ok(format!("built: {}", data["n"]))),
    );

    let outcome = views
        .render("built/ahead.j2", Some(json!({"n": 5}).into()), None, None)
        .unwrap();
    assert_eq!(outcome.ready().unwrap().as_text().unwrap(), "built: 5");
    assert_eq!(fetcher.call_count(), 0);
}

#[test]
fn test_compiled_source_round_trip() {
    let (views, _) = manual_views();
    let source = views.compiled_source("j2", "a/b.j2", "{{ x }}").unwrap();
    assert_eq!(source, "{{ x }}");
    assert!(matches!(
        views.compiled_source("nope", "a", "t"),
        Err(Error::MissingEngine { .. })
    ));
}

#[test]
fn test_cache_reset_clears_entries() {
    let (views, _) = manual_views();
    let handle = views.register(vellum::engine::minijinja::engine_info()).unwrap();
    handle.compile("tmp.j2", "x").unwrap();
    assert!(views.cache().contains("tmp_j2"));
    views.cache().reset();
    assert!(!views.cache().contains("tmp_j2"));
}

#[test]
fn test_custom_fragment_builder_seam() {
    // A builder that wraps everything in a single <root> element.
    struct WrappingBuilder;
    impl FragmentBuilder for WrappingBuilder {
        fn build(&self, markup: &str) -> vellum::error::Result<vellum::fragment::Fragment> {
            MarkupBuilder.build(&format!("<root>{}</root>", markup))
        }
    }

    let (views, _) = manual_views();
    views.set_fragment_builder(Rc::new(WrappingBuilder));
    let handle = views.register(vellum::engine::minijinja::engine_info()).unwrap();
    handle.compile("wrap.j2", "<b>x</b>").unwrap();

    let outcome = views.view("wrap.j2", Some(json!({}).into()), None, None).unwrap();
    let rendered = outcome.ready().unwrap();
    assert_eq!(rendered.as_fragment().unwrap().to_markup(), "<root><b>x</b></root>");
}
