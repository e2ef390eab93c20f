//! The smallest real [`TemplatingEngine`] implementation: `{{key}}`
//! substitution against a flat JSON object. The "external templating
//! engine" spec §1 names as a collaborator is otherwise out of scope; this
//! exists so `viewloop-server` is runnable without one.

use serde_json::Value;
use viewloop_core::{TemplatingEngine, TemplatingError};

#[derive(Debug, Default, Clone, Copy)]
pub struct StringTemplates;

impl TemplatingEngine for StringTemplates {
    fn render(&self, template: &str, context: &Value) -> Result<String, TemplatingError> {
        let object = context
            .as_object()
            .ok_or_else(|| TemplatingError { template: template.to_string(), message: "template context must be a JSON object".to_string() })?;

        let mut rendered = String::with_capacity(template.len());
        let mut rest = template;

        while let Some(start) = rest.find("{{") {
            let Some(end) = rest[start..].find("}}") else {
                rendered.push_str(rest);
                rest = "";
                break;
            };

            rendered.push_str(&rest[..start]);
            let key = rest[start + 2..start + end].trim();

            match object.get(key) {
                Some(Value::String(s)) => rendered.push_str(s),
                Some(other) => rendered.push_str(&other.to_string()),
                None => return Err(TemplatingError { template: template.to_string(), message: format!("unknown template key {key:?}") }),
            }

            rest = &rest[start + end + 2..];
        }

        rendered.push_str(rest);
        Ok(rendered)
    }
}
