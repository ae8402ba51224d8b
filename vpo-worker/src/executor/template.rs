//! Destination path templates for move jobs.
//!
//! A template such as `"{year}/{title}"` is split on `/` first, so the
//! directory structure comes only from the template literal. Each segment is
//! then rendered and sanitized on its own; a `/` inside a metadata value can
//! never introduce an extra directory level.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::LazyLock;

use regex::{Captures, Regex};
use serde_json::Value;

use crate::utils::filename::{EMPTY_COMPONENT, sanitize_component};

static PLACEHOLDER_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\{([A-Za-z0-9_]+)\}").unwrap());

/// Values and fallbacks used to fill a template.
#[derive(Debug, Clone, Copy)]
pub struct TemplateContext<'a> {
    pub metadata: &'a HashMap<String, Value>,
    pub fallbacks: &'a HashMap<String, String>,
    pub fallback: &'a str,
}

impl<'a> TemplateContext<'a> {
    /// Text for `name`: the metadata value if present and non-empty, then the
    /// per-placeholder fallback, then the global fallback.
    pub fn resolve(&self, name: &str) -> String {
        if let Some(value) = self.metadata.get(name).and_then(value_text) {
            return value;
        }
        if let Some(fallback) = self.fallbacks.get(name).filter(|f| !f.trim().is_empty()) {
            return fallback.clone();
        }
        if self.fallback.trim().is_empty() {
            EMPTY_COMPONENT.to_string()
        } else {
            self.fallback.to_string()
        }
    }

    /// Render one segment without sanitizing it.
    fn render_segment(&self, segment: &str) -> String {
        PLACEHOLDER_RE
            .replace_all(segment, |caps: &Captures<'_>| self.resolve(&caps[1]))
            .into_owned()
    }
}

fn value_text(value: &Value) -> Option<String> {
    let text = match value {
        Value::String(s) => s.trim().to_string(),
        Value::Number(n) => n.to_string(),
        Value::Bool(b) => b.to_string(),
        Value::Null | Value::Array(_) | Value::Object(_) => return None,
    };
    (!text.is_empty()).then_some(text)
}

/// Render a directory template into a relative path.
///
/// Empty segments (leading, trailing or doubled `/`) are dropped. A template
/// with no segments renders to an empty path.
pub fn render_path(template: &str, ctx: &TemplateContext<'_>) -> PathBuf {
    template
        .split('/')
        .filter(|segment| !segment.trim().is_empty())
        .map(|segment| sanitize_component(&ctx.render_segment(segment)))
        .collect()
}

/// Render a single file name component, e.g. a file stem template.
pub fn render_component(template: &str, ctx: &TemplateContext<'_>) -> String {
    sanitize_component(&ctx.render_segment(template))
}
