//! Dot-path lookup into JSON bodies.
//!
//! Supports nested keys (`meta.next_cursor`), bracket indexing
//! (`links[0].href`) and numeric segments (`pages.0.cursor`). A leading `$.`
//! is accepted and ignored.

use serde_json::Value;

pub struct PathMapper;

impl PathMapper {
    pub fn get_path<'a>(obj: &'a Value, path: &str) -> Option<&'a Value> {
        let normalized = path.trim().trim_start_matches("$.");
        if normalized.is_empty() {
            return None;
        }

        let mut current = obj;
        for part in normalized.split('.') {
            if part.is_empty() {
                return None;
            }
            current = match part.find('[') {
                Some(bracket) => {
                    let key = &part[..bracket];
                    let idx = part[bracket + 1..].trim_end_matches(']');
                    let base = if key.is_empty() {
                        current
                    } else {
                        current.as_object()?.get(key)?
                    };
                    index(base, idx)?
                }
                None => match current {
                    Value::Object(map) => map.get(part)?,
                    Value::Array(_) => index(current, part)?,
                    _ => return None,
                },
            };
        }
        Some(current)
    }

    /// Scalar at `path` rendered as a string. `null`, objects and arrays yield `None`.
    pub fn get_string(obj: &Value, path: &str) -> Option<String> {
        match Self::get_path(obj, path)? {
            Value::String(s) => Some(s.clone()),
            Value::Number(n) => Some(n.to_string()),
            Value::Bool(b) => Some(b.to_string()),
            _ => None,
        }
    }
}

fn index<'a>(value: &'a Value, idx: &str) -> Option<&'a Value> {
    let arr = value.as_array()?;
    if idx == "*" {
        return arr.first();
    }
    arr.get(idx.parse::<usize>().ok()?)
}
