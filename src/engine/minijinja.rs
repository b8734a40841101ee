//! Bundled MiniJinja string-engine adapter, registered under suffix `j2`.

use super::{EngineInfo, Helpers};
use minijinja::Environment;
use serde_json::Value;

pub const SUFFIX: &str = "j2";

/// Builds the [`EngineInfo`] for the MiniJinja adapter.
///
/// MiniJinja is interpreted, so `compile_to_source` returns the template
/// text unchanged; preloaded sources are recompiled through the same
/// factory at bootstrap.
pub fn engine_info() -> EngineInfo {
    EngineInfo {
        suffix: SUFFIX.to_string(),
        build_string: Some(Box::new(|id, text| {
            let mut env = Environment::new();
            let name = id.unwrap_or("inline").to_string();
            env.add_template_owned(name.clone(), text.to_string())?;
            Ok(Box::new(move |data, helpers| {
                let template = env.get_template(&name)?;
                Ok(template.render(merge_helpers(data, helpers))?)
            }))
        })),
        build_fragment: None,
        compile_to_source: Some(Box::new(|_, text| Ok(text.to_string()))),
    }
}

/// Merges helper entries over the data context, the helpers winning on
/// collision. Non-object data is passed through untouched when there are
/// no helpers to merge.
fn merge_helpers(data: &Value, helpers: Option<&Helpers>) -> Value {
    match helpers {
        None => data.clone(),
        Some(helpers) => {
            let mut merged = match data {
                Value::Object(map) => map.clone(),
                Value::Null => serde_json::Map::new(),
                other => {
                    let mut map = serde_json::Map::new();
                    map.insert("value".to_string(), other.clone());
                    map
                }
            };
            for (key, value) in helpers {
                merged.insert(key.clone(), value.clone());
            }
            Value::Object(merged)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::RendererWrapper;
    use serde_json::json;
    use std::rc::Rc;

    #[test]
    fn test_renders_with_data() {
        let wrapper = RendererWrapper::lazy(
            Rc::new(engine_info()),
            Some("greet".into()),
            "Hello {{ name }}".into(),
        );
        let out = wrapper.render_string(&json!({"name": "world"}), None).unwrap();
        assert_eq!(out, "Hello world");
    }

    #[test]
    fn test_helpers_shadow_data_keys() {
        let wrapper = RendererWrapper::lazy(
            Rc::new(engine_info()),
            None,
            "{{ greeting }} {{ name }}".into(),
        );
        let mut helpers = Helpers::new();
        helpers.insert("greeting".into(), json!("Hi"));
        let data = json!({"greeting": "Hello", "name": "world"});
        assert_eq!(wrapper.render_string(&data, Some(&helpers)).unwrap(), "Hi world");
    }

    #[test]
    fn test_compile_to_source_is_the_template_text() {
        let info = engine_info();
        let compile = info.compile_to_source.as_ref().unwrap();
        assert_eq!(compile(Some("id"), "{{ x }}").unwrap(), "{{ x }}");
    }

    #[test]
    fn test_invalid_template_surfaces_engine_error() {
        let wrapper =
            RendererWrapper::lazy(Rc::new(engine_info()), None, "{% if %}".into());
        assert!(wrapper.render_string(&json!({}), None).is_err());
    }
}
