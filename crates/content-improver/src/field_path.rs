/// Addressing of values inside a content document.
///
/// A path is a dot-separated list of object keys with optional bracketed array indices:
/// `hero.title`, `features[2].body`, `features.2.body`. A bare numeric segment indexes an
/// array and falls back to a string key on objects. Keys that contain `.`, `[`, `]` or `"`,
/// or that are empty or padded with whitespace, are written as a bracketed JSON string:
/// `faq["q.1"]`.
use std::fmt;
use std::ops::Range;
use std::sync::LazyLock;

use regex::Regex;
use serde_json::Value;

use crate::error::AppError;

static TOKEN_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"^(\.)?(?:([^.\[\]"]+)|\[(\d+)\]|\[("(?:[^"\\]|\\.)*")\])"#)
        .expect("valid regex")
});

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Segment {
    Key(String),
    Index(usize),
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Hash)]
pub struct FieldPath {
    segments: Vec<Segment>,
}

impl FieldPath {
    pub fn root() -> Self {
        Self::default()
    }

    pub fn parse(raw: &str) -> Result<Self, AppError> {
        let raw = raw.trim();
        if raw.is_empty() {
            return Err(AppError::InvalidFieldPath("empty field path".to_string()));
        }
        let invalid = || AppError::InvalidFieldPath(raw.to_string());

        let mut segments = Vec::new();
        let mut pos = 0;
        while pos < raw.len() {
            let caps = TOKEN_RE.captures(&raw[pos..]).ok_or_else(invalid)?;
            let dotted = caps.get(1).is_some();
            if dotted && pos == 0 {
                return Err(invalid());
            }
            if let Some(key) = caps.get(2) {
                if pos > 0 && !dotted {
                    return Err(invalid());
                }
                segments.push(Segment::Key(key.as_str().to_string()));
            } else if let Some(index) = caps.get(3) {
                let n = index.as_str().parse::<usize>().map_err(|_| invalid())?;
                segments.push(Segment::Index(n));
            } else if let Some(quoted) = caps.get(4) {
                let key = serde_json::from_str::<String>(quoted.as_str()).map_err(|_| invalid())?;
                segments.push(Segment::Key(key));
            }
            pos += caps[0].len();
        }
        Ok(Self { segments })
    }

pub fn segments(&self) -> &[Segment] {
        &self.segments
    }

    pub fn key(&self, key: &str) -> Self {
        let mut next = self.clone();
        next.segments.push(Segment::Key(key.to_string()));
        next
    }

    pub fn index(&self, index: usize) -> Self {
        let mut next = self.clone();
        next.segments.push(Segment::Index(index));
        next
    }

    pub fn get<'a>(&self, doc: &'a Value) -> Option<&'a Value> {
        self.segments
            .iter()
            .try_fold(doc, |current, segment| step(current, segment))
    }

    /// Replace the value at this path and return the previous one. The path must already
    /// exist; nothing is created implicitly.
    pub fn replace(&self, doc: &mut Value, value: Value) -> Result<Value, AppError> {
        let mut current = doc;
        for segment in &self.segments {
            current = step_mut(current, segment)
                .ok_or_else(|| AppError::NotFound(format!("field {self}")))?;
        }
        Ok(std::mem::replace(current, value))
    }
}

impl FieldPath {
    /// Byte range of the value at this path inside `text`, the source of a parsed document.
    /// Lookup follows the same rules as `get`; with duplicate keys the last one wins, as it
    /// does when parsing.
    pub fn locate(&self, text: &str) -> Option<Range<usize>> {
        let bytes = text.as_bytes();
        let mut start = skip_ws(bytes, 0);
        for segment in &self.segments {
            start = match bytes.get(start)? {
                b'{' => {
                    let key = match segment {
                        Segment::Key(k) => k.clone(),
                        Segment::Index(i) => i.to_string(),
                    };
                    find_member(text, start, &key)?
                }
                b'[' => {
                    let index = match segment {
                        Segment::Index(i) => *i,
                        Segment::Key(k) => k.parse().ok()?,
                    };
                    find_element(bytes, start, index)?
                }
                _ => return None,
            };
        }
        Some(start..value_end(bytes, start)?)
    }
}

fn needs_quotes(key: &str) -> bool {
    key.is_empty() || key.trim() != key || key.contains(['.', '[', ']', '"'])
}

fn skip_ws(bytes: &[u8], mut pos: usize) -> usize {
    while bytes.get(pos).is_some_and(|b| b.is_ascii_whitespace()) {
        pos += 1;
    }
    pos
}

fn string_end(bytes: &[u8], start: usize) -> Option<usize> {
    if bytes.get(start) != Some(&b'"') {
        return None;
    }
    let mut pos = start + 1;
    loop {
        match bytes.get(pos)? {
            b'\\' => pos += 2,
            b'"' => return Some(pos + 1),
            _ => pos += 1,
        }
    }
}

/// End of the value starting at `start`, exclusive.
fn value_end(bytes: &[u8], start: usize) -> Option<usize> {
    match bytes.get(start)? {
        b'"' => string_end(bytes, start),
        b'{' | b'[' => {
            let mut depth = 0usize;
            let mut pos = start;
            while pos < bytes.len() {
                match bytes[pos] {
                    b'"' => {
                        pos = string_end(bytes, pos)?;
                        continue;
                    }
                    b'{' | b'[' => depth += 1,
                    b'}' | b']' => {
                        depth -= 1;
                        if depth == 0 {
                            return Some(pos + 1);
                        }
                    }
                    _ => {}
                }
                pos += 1;
            }
            None
        }
        _ => {
            let len = bytes[start..]
                .iter()
                .position(|b| matches!(b, b',' | b'}' | b']') || b.is_ascii_whitespace())
                .unwrap_or(bytes.len() - start);
            (len > 0).then_some(start + len)
        }
    }
}

fn find_member(text: &str, open: usize, key: &str) -> Option<usize> {
    let bytes = text.as_bytes();
    let mut pos = skip_ws(bytes, open + 1);
    if bytes.get(pos) == Some(&b'}') {
        return None;
    }
    let mut found = None;
    loop {
        let name_end = string_end(bytes, pos)?;
        let name = serde_json::from_str::<String>(&text[pos..name_end]).ok()?;
        pos = skip_ws(bytes, name_end);
        if bytes.get(pos) != Some(&b':') {
            return None;
        }
        let value_start = skip_ws(bytes, pos + 1);
        if name == key {
            found = Some(value_start);
        }
        pos = skip_ws(bytes, value_end(bytes, value_start)?);
        match bytes.get(pos)? {
            b',' => pos = skip_ws(bytes, pos + 1),
            b'}' => return found,
            _ => return None,
        }
    }
}

fn find_element(bytes: &[u8], open: usize, index: usize) -> Option<usize> {
    let mut pos = skip_ws(bytes, open + 1);
    if bytes.get(pos) == Some(&b']') {
        return None;
    }
    for _ in 0..index {
        pos = skip_ws(bytes, value_end(bytes, pos)?);
        if bytes.get(pos)? != &b',' {
            return None;
        }
        pos = skip_ws(bytes, pos + 1);
    }
    Some(pos)
}

fn step<'a>(value: &'a Value, segment: &Segment) -> Option<&'a Value> {
    match (value, segment) {
        (Value::Object(map), Segment::Key(k)) => map.get(k),
        (Value::Object(map), Segment::Index(i)) => map.get(&i.to_string()),
        (Value::Array(items), Segment::Index(i)) => items.get(*i),
        (Value::Array(items), Segment::Key(k)) => items.get(k.parse::<usize>().ok()?),
        _ => None,
    }
}

fn step_mut<'a>(value: &'a mut Value, segment: &Segment) -> Option<&'a mut Value> {
    match (value, segment) {
        (Value::Object(map), Segment::Key(k)) => map.get_mut(k),
        (Value::Object(map), Segment::Index(i)) => map.get_mut(&i.to_string()),
        (Value::Array(items), Segment::Index(i)) => items.get_mut(*i),
        (Value::Array(items), Segment::Key(k)) => items.get_mut(k.parse::<usize>().ok()?),
        _ => None,
    }
}

impl fmt::Display for FieldPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, segment) in self.segments.iter().enumerate() {
            match segment {
                Segment::Key(k) if needs_quotes(k) => {
                    let quoted = serde_json::to_string(k).map_err(|_| fmt::Error)?;
                    write!(f, "[{quoted}]")?
                }
                Segment::Key(k) if i == 0 => write!(f, "{k}")?,
                Segment::Key(k) => write!(f, ".{k}")?,
                Segment::Index(n) => write!(f, "[{n}]")?,
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn parses_dotted_and_bracketed_forms() {
        let a = FieldPath::parse("features[2].body").unwrap();
        assert_eq!(
            a.segments(),
            &[
                Segment::Key("features".into()),
                Segment::Index(2),
                Segment::Key("body".into())
            ]
        );
        assert_eq!(a.to_string(), "features[2].body");

        let b = FieldPath::parse("grid[0][1]").unwrap();
        assert_eq!(b.to_string(), "grid[0][1]");
    }

    #[test]
    fn rejects_malformed_paths() {
        for raw in ["", "a..b", "a[x]", "a]b", ".", ".a", "a[0]b", r#"a["x]"#] {
            assert!(FieldPath::parse(raw).is_err(), "{raw:?} should be rejected");
        }
    }

    #[test]
    fn keys_with_separators_round_trip_through_quoting() {
        let path = FieldPath::root().key("faq").key("q.1").key("Pricing [monthly]");
        let text = path.to_string();
        assert_eq!(text, r#"faq["q.1"]["Pricing [monthly]"]"#);
        assert_eq!(FieldPath::parse(&text).unwrap(), path);

        let doc = json!({"q.1": "Old answer", "q": {"1": "other"}});
        let dotted = FieldPath::root().key("q.1");
        let reparsed = FieldPath::parse(&dotted.to_string()).unwrap();
        assert_eq!(reparsed.get(&doc), Some(&json!("Old answer")));

        let odd = FieldPath::root().key("").key(" padded").key("say \"hi\"");
        assert_eq!(FieldPath::parse(&odd.to_string()).unwrap(), odd);
    }

    #[test]
    fn locate_finds_the_source_span_of_a_value() {
        let text = r#"{"hero": {"title" : "Old", "tags":[1, 2]}, "q.1":"a\"b", "n":1.50}"#;
        let span = |raw: &str| {
            let path = FieldPath::parse(raw).unwrap();
            path.locate(text).map(|r| &text[r])
        };
        assert_eq!(span("hero.title"), Some(r#""Old""#));
        assert_eq!(span("hero.tags"), Some("[1, 2]"));
        assert_eq!(span("hero.tags[1]"), Some("2"));
        assert_eq!(span(r#"["q.1"]"#), Some(r#""a\"b""#));
        assert_eq!(span("n"), Some("1.50"));
        assert_eq!(span("hero"), Some(r#"{"title" : "Old", "tags":[1, 2]}"#));
        assert_eq!(span("hero.missing"), None);
        assert_eq!(span("hero.tags[2]"), None);
    }

    #[test]
    fn locate_matches_escaped_keys_and_last_duplicate() {
        let text = r#"{"caf\u00e9": "x", "d": 1, "d": 2}"#;
        let cafe = FieldPath::root().key("café").locate(text).unwrap();
        assert_eq!(&text[cafe], r#""x""#);
        let dup = FieldPath::root().key("d").locate(text).unwrap();
        assert_eq!(&text[dup], "2");
    }

    #[test]
    fn numeric_segments_index_arrays_and_key_objects() {
        let doc = json!({"items": [{"t": "zero"}, {"t": "one"}], "years": {"2024": "y"}});
        let by_dot = FieldPath::parse("items.1.t").unwrap();
        let by_bracket = FieldPath::parse("items[1].t").unwrap();
        assert_eq!(by_dot.get(&doc), Some(&json!("one")));
        assert_eq!(by_bracket.get(&doc), Some(&json!("one")));
        assert_eq!(
            FieldPath::parse("years.2024").unwrap().get(&doc),
            Some(&json!("y"))
        );
        assert_eq!(FieldPath::parse("items[5].t").unwrap().get(&doc), None);
    }

    #[test]
    fn replace_touches_only_the_target() {
        let mut doc = json!({"hero": {"title": "Old", "cta": "Go"}, "footer": "f"});
        let old = FieldPath::parse("hero.title")
            .unwrap()
            .replace(&mut doc, json!("New"))
            .unwrap();
        assert_eq!(old, json!("Old"));
        assert_eq!(doc, json!({"hero": {"title": "New", "cta": "Go"}, "footer": "f"}));
    }

    #[test]
    fn replace_does_not_create_missing_fields() {
        let mut doc = json!({"hero": {}});
        let err = FieldPath::parse("hero.title")
            .unwrap()
            .replace(&mut doc, json!("x"))
            .unwrap_err();
        assert!(matches!(err, AppError::NotFound(_)));
        assert_eq!(doc, json!({"hero": {}}));
    }
}
