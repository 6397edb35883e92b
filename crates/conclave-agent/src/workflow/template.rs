use std::borrow::Cow;
use std::sync::OnceLock;

use regex::{Captures, Regex};
use serde_json::Value;

use super::blackboard::RunBlackboard;

fn placeholder() -> Option<&'static Regex> {
    static PLACEHOLDER: OnceLock<Option<Regex>> = OnceLock::new();
    PLACEHOLDER
        .get_or_init(|| Regex::new(r"\{\{\s*([\w.\-]+)\s*\}\}").ok())
        .as_ref()
}

/// Replace `{{dotted.key}}` placeholders with blackboard values.
///
/// Strings are inserted raw, other values as compact JSON. Placeholders
/// whose key is missing stay in the text untouched.
pub fn interpolate<'a>(template: &'a str, board: &RunBlackboard) -> Cow<'a, str> {
    let Some(re) = placeholder() else {
        return Cow::Borrowed(template);
    };
    re.replace_all(template, |caps: &Captures<'_>| match board.lookup(&caps[1]) {
        Some(Value::String(s)) => s.clone(),
        Some(value) => value.to_string(),
        None => caps[0].to_string(),
    })
}
