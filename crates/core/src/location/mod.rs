//! Small URL toolkit shared by the resolver and the router.
//!
//! Covers what the host needs from a browser location: splitting a URL into
//! its parts, resolving references against a base (RFC 3986 section 5.2) and
//! editing a single query parameter.

use std::fmt;

/// A parsed absolute or relative URL reference.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Href {
    pub scheme: Option<String>,
    pub authority: Option<String>,
    pub path: String,
    pub query: Option<String>,
    pub fragment: Option<String>,
}

impl Href {
    pub fn parse(input: &str) -> Self {
        let (rest, fragment) = match input.split_once('#') {
            Some((rest, fragment)) => (rest, Some(fragment.to_string())),
            None => (input, None),
        };
        let (rest, query) = match rest.split_once('?') {
            Some((rest, query)) => (rest, Some(query.to_string())),
            None => (rest, None),
        };
        let (scheme, rest) = match split_scheme(rest) {
            Some((scheme, rest)) => (Some(scheme.to_ascii_lowercase()), rest),
            None => (None, rest),
        };
        let (authority, path) = match rest.strip_prefix("//") {
            Some(after) => {
                let end = after.find('/').unwrap_or(after.len());
                (Some(after[..end].to_string()), after[end..].to_string())
            }
            None => (None, rest.to_string()),
        };

        Self {
            scheme,
            authority,
            path,
            query,
            fragment,
        }
    }

    /// Resolves `reference` against `self` as the base URL.
    pub fn join(&self, reference: &str) -> Self {
        let reference = Href::parse(reference);
        if reference.scheme.is_some() {
            return Self {
                path: remove_dot_segments(&reference.path),
                ..reference
            };
        }
        if reference.authority.is_some() {
            return Self {
                scheme: self.scheme.clone(),
                path: remove_dot_segments(&reference.path),
                ..reference
            };
        }

        let (path, query) = if reference.path.is_empty() {
            (
                self.path.clone(),
                reference.query.or_else(|| self.query.clone()),
            )
        } else if reference.path.starts_with('/') {
            (remove_dot_segments(&reference.path), reference.query)
        } else {
            (
                remove_dot_segments(&self.merge(&reference.path)),
                reference.query,
            )
        };

        Self {
            scheme: self.scheme.clone(),
            authority: self.authority.clone(),
            path,
            query,
            fragment: reference.fragment,
        }
    }

    /// Path plus query, the part of a URL a same-origin import needs.
    pub fn path_and_query(&self) -> String {
        let path = if self.path.is_empty() { "/" } else { &self.path };
        match &self.query {
            Some(query) if !query.is_empty() => format!("{path}?{query}"),
            _ => path.to_string(),
        }
    }

    /// Returns the decoded value of the first `name` parameter.
    pub fn query_param(&self, name: &str) -> Option<String> {
        let query = self.query.as_deref()?;
        query
            .split('&')
            .filter(|pair| !pair.is_empty())
            .map(|pair| pair.split_once('=').unwrap_or((pair, "")))
            .find(|(key, _)| decode_component(key) == name)
            .map(|(_, value)| decode_component(value))
    }

    /// Sets `name` to `value`, replacing every existing occurrence in place.
    pub fn set_query_param(&mut self, name: &str, value: &str) {
        let encoded = format!("{}={}", encode_component(name), encode_component(value));
        let mut pairs = self.other_pairs(name);
        let position = self
            .query_pairs()
            .iter()
            .position(|pair| pair_name(pair) == name)
            .unwrap_or(pairs.len())
            .min(pairs.len());
        pairs.insert(position, encoded);
        self.query = Some(pairs.join("&"));
    }

    /// Removes every occurrence of `name`. Returns whether any was present.
    pub fn remove_query_param(&mut self, name: &str) -> bool {
        let before = self.query_pairs().len();
        let pairs = self.other_pairs(name);
        let removed = pairs.len() != before;
        self.query = if pairs.is_empty() {
            None
        } else {
            Some(pairs.join("&"))
        };
        removed
    }

    fn query_pairs(&self) -> Vec<String> {
        self.query
            .as_deref()
            .map(|query| {
                query
                    .split('&')
                    .filter(|pair| !pair.is_empty())
                    .map(str::to_string)
                    .collect()
            })
            .unwrap_or_default()
    }

    fn other_pairs(&self, name: &str) -> Vec<String> {
        self.query_pairs()
            .into_iter()
            .filter(|pair| pair_name(pair) != name)
            .collect()
    }

    fn merge(&self, reference: &str) -> String {
        if self.authority.is_some() && self.path.is_empty() {
            return format!("/{reference}");
        }
        match self.path.rfind('/') {
            Some(index) => format!("{}{}", &self.path[..=index], reference),
            None => reference.to_string(),
        }
    }
}

impl fmt::Display for Href {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Some(scheme) = &self.scheme {
            write!(f, "{scheme}:")?;
        }
        if let Some(authority) = &self.authority {
            write!(f, "//{authority}")?;
        }
        f.write_str(&self.path)?;
        if let Some(query) = &self.query {
            write!(f, "?{query}")?;
        }
        if let Some(fragment) = &self.fragment {
            write!(f, "#{fragment}")?;
        }
        Ok(())
    }
}

/// True for `./x`, `../x`, `.` and `..`.
pub fn is_relative_path(key: &str) -> bool {
    key == "." || key == ".." || key.starts_with("./") || key.starts_with("../")
}

/// True for root-relative paths and URLs with a scheme.
pub fn looks_absolute(key: &str) -> bool {
    key.starts_with('/') || split_scheme(key).is_some()
}

fn split_scheme(input: &str) -> Option<(&str, &str)> {
    let (scheme, rest) = input.split_once(':')?;
    let mut chars = scheme.chars();
    let first = chars.next()?;
    // Single letters are Windows drive prefixes, not schemes.
    if scheme.len() < 2 || !first.is_ascii_alphabetic() {
        return None;
    }
    if chars.all(|c| c.is_ascii_alphanumeric() || matches!(c, '+' | '-' | '.')) {
        Some((scheme, rest))
    } else {
        None
    }
}

fn pair_name(pair: &str) -> String {
    decode_component(pair.split_once('=').map(|(key, _)| key).unwrap_or(pair))
}

fn remove_dot_segments(path: &str) -> String {
    let mut output: Vec<&str> = Vec::new();
    let absolute = path.starts_with('/');
    let segments: Vec<&str> = path.split('/').collect();
    let last = segments.len().saturating_sub(1);

    for (index, segment) in segments.iter().enumerate() {
        match *segment {
            "." => {
                if index == last {
                    output.push("");
                }
            }
            ".." => {
                if output.len() > usize::from(absolute) {
                    output.pop();
                }
                if index == last {
                    output.push("");
                }
            }
            other => output.push(other),
        }
    }

    let joined = output.join("/");
    if absolute && !joined.starts_with('/') {
        format!("/{joined}")
    } else {
        joined
    }
}

/// Percent-encodes everything except RFC 3986 unreserved characters.
pub fn encode_component(input: &str) -> String {
    let mut encoded = String::with_capacity(input.len());
    for byte in input.bytes() {
        match byte {
            b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'-' | b'_' | b'.' | b'~' => {
                encoded.push(byte as char)
            }
            _ => encoded.push_str(&format!("%{byte:02X}")),
        }
    }
    encoded
}

/// Decodes `%XX` escapes and `+` as space. Invalid escapes are kept verbatim.
pub fn decode_component(input: &str) -> String {
    let bytes = input.as_bytes();
    let mut decoded = Vec::with_capacity(bytes.len());
    let mut index = 0;
    while index < bytes.len() {
        match bytes[index] {
            b'+' => {
                decoded.push(b' ');
                index += 1;
            }
            b'%' if index + 2 < bytes.len() => {
                match (hex_value(bytes[index + 1]), hex_value(bytes[index + 2])) {
                    (Some(high), Some(low)) => {
                        decoded.push(high << 4 | low);
                        index += 3;
                    }
                    _ => {
                        decoded.push(b'%');
                        index += 1;
                    }
                }
            }
            other => {
                decoded.push(other);
                index += 1;
            }
        }
    }
    String::from_utf8_lossy(&decoded).into_owned()
}

fn hex_value(byte: u8) -> Option<u8> {
    match byte {
        b'0'..=b'9' => Some(byte - b'0'),
        b'a'..=b'f' => Some(byte - b'a' + 10),
        b'A'..=b'F' => Some(byte - b'A' + 10),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_components() {
        let href = Href::parse("https://example.com:8080/site/index.html?toy=demo&x=1#top");

        assert_eq!(href.scheme.as_deref(), Some("https"));
        assert_eq!(href.authority.as_deref(), Some("example.com:8080"));
        assert_eq!(href.path, "/site/index.html");
        assert_eq!(href.query.as_deref(), Some("toy=demo&x=1"));
        assert_eq!(href.fragment.as_deref(), Some("top"));
        assert_eq!(
            href.to_string(),
            "https://example.com:8080/site/index.html?toy=demo&x=1#top"
        );
    }

    #[test]
    fn joins_references_like_a_browser() {
        let base = Href::parse("http://example.com/site/page.html?q=1");

        assert_eq!(base.join("a.123.js").path, "/site/a.123.js");
        assert_eq!(base.join("./assets/a.js").path, "/site/assets/a.js");
        assert_eq!(base.join("../a.js").path, "/a.js");
        assert_eq!(base.join("../../../a.js").path, "/a.js");
        assert_eq!(base.join("/root.js").path, "/root.js");
        assert_eq!(base.join("").query.as_deref(), Some("q=1"));
        assert_eq!(
            base.join("https://cdn.example.org/x/../y.js").to_string(),
            "https://cdn.example.org/y.js"
        );
        assert_eq!(
            base.join("//cdn.example.org/z.js").to_string(),
            "http://cdn.example.org/z.js"
        );
    }

    #[test]
    fn join_against_bare_origin() {
        let base = Href::parse("http://example.com");
        assert_eq!(base.join("a.js").path, "/a.js");
        assert_eq!(base.join("a.js").path_and_query(), "/a.js");
    }

    #[test]
    fn edits_query_parameters() {
        let mut href = Href::parse("http://example.com/?x=1");
        assert_eq!(href.query_param("toy"), None);

        href.set_query_param("toy", "demo");
        assert_eq!(href.to_string(), "http://example.com/?x=1&toy=demo");
        assert_eq!(href.query_param("toy").as_deref(), Some("demo"));

        href.set_query_param("toy", "two words");
        assert_eq!(href.query.as_deref(), Some("x=1&toy=two%20words"));
        assert_eq!(href.query_param("toy").as_deref(), Some("two words"));

        assert!(href.remove_query_param("toy"));
        assert!(!href.remove_query_param("toy"));
        assert_eq!(href.to_string(), "http://example.com/?x=1");

        assert!(href.remove_query_param("x"));
        assert_eq!(href.to_string(), "http://example.com/");
    }

    #[test]
    fn set_replaces_in_place() {
        let mut href = Href::parse("/?toy=a&x=1");
        href.set_query_param("toy", "b");
        assert_eq!(href.query.as_deref(), Some("toy=b&x=1"));
    }

    #[test]
    fn classifies_keys() {
        assert!(is_relative_path("./a.ts"));
        assert!(is_relative_path("../a.ts"));
        assert!(!is_relative_path("a.ts"));
        assert!(looks_absolute("/a.ts"));
        assert!(looks_absolute("https://x.test/a.ts"));
        assert!(!looks_absolute("a.ts"));
        assert!(!looks_absolute("c:/a.ts"));
    }

    #[test]
    fn decodes_escapes_leniently() {
        assert_eq!(decode_component("a%20b+c"), "a b c");
        assert_eq!(decode_component("100%"), "100%");
        assert_eq!(decode_component("%zz"), "%zz");
    }
}
