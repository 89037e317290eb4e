//! HTTP header map with case-insensitive name lookup.
//!
//! Headers are an ordered multimap: insertion order is preserved, lookup is
//! case-insensitive, and the casing of the first-seen name is what
//! serialization writes back out. Multiple values for one name are joined
//! by a comma on single-value reads, or listable individually.

use std::fmt;

/// An ordered, case-insensitive, multi-value HTTP header map.
///
/// # Examples
///
/// ```
/// use squall::http::Headers;
///
/// let mut headers = Headers::new();
/// headers.add("Content-Type", "text/html");
/// headers.add("Set-Cookie", "a=1");
/// headers.add("Set-Cookie", "b=2");
///
/// assert_eq!(headers.get("content-type").as_deref(), Some("text/html"));
/// assert_eq!(headers.get("set-cookie").as_deref(), Some("a=1,b=2"));
/// assert_eq!(headers.get_list("SET-COOKIE"), vec!["a=1", "b=2"]);
/// ```
#[derive(Debug, Clone, Default)]
pub struct Headers {
    entries: Vec<(String, String)>,
}

impl Headers {
    /// Creates an empty header map.
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a header map with pre-allocated capacity for `capacity`
    /// entries.
    pub fn with_capacity(capacity: usize) -> Self {
        Headers {
            entries: Vec::with_capacity(capacity),
        }
    }

    /// Appends a value for the given name. Earlier values are kept; the
    /// first-seen casing of the name wins for serialization.
    pub fn add(&mut self, name: impl Into<String>, value: impl Into<String>) {
        let name = name.into();
        let name = match self.first_seen_casing(&name) {
            Some(existing) => existing.to_owned(),
            None => name,
        };
        self.entries.push((name, value.into()));
    }

    /// Replaces all values for the given name with a single one.
    pub fn set(&mut self, name: impl Into<String>, value: impl Into<String>) {
        let name = name.into();
        self.remove(&name);
        self.entries.push((name, value.into()));
    }

    /// Returns the value for the given name, joining multiple values with a
    /// comma. `None` if the name is absent.
    pub fn get(&self, name: &str) -> Option<String> {
        let mut joined: Option<String> = None;
        for (k, v) in &self.entries {
            if k.eq_ignore_ascii_case(name) {
                match &mut joined {
                    None => joined = Some(v.clone()),
                    Some(s) => {
                        s.push(',');
                        s.push_str(v);
                    }
                }
            }
        }
        joined
    }

    /// Returns all values for the given name individually, in insertion
    /// order.
    pub fn get_list(&self, name: &str) -> Vec<&str> {
        self.entries
            .iter()
            .filter(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
            .collect()
    }

    /// Removes all entries with the given name. Returns `true` if any were
    /// removed.
    pub fn remove(&mut self, name: &str) -> bool {
        let before = self.entries.len();
        self.entries.retain(|(k, _)| !k.eq_ignore_ascii_case(name));
        self.entries.len() < before
    }

    /// Returns `true` if at least one entry has the given name.
    pub fn contains(&self, name: &str) -> bool {
        self.entries.iter().any(|(k, _)| k.eq_ignore_ascii_case(name))
    }

    /// Returns the total number of entries (not unique names).
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Iterates over all `(name, value)` pairs in insertion order. Names
    /// carry their first-seen casing.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.entries.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    fn first_seen_casing(&self, name: &str) -> Option<&str> {
        self.entries
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(k, _)| k.as_str())
    }
}

impl fmt::Display for Headers {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (name, value) in &self.entries {
            write!(f, "{name}: {value}\r\n")?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn case_insensitive_get() {
        let mut h = Headers::new();
        h.add("Content-Type", "text/plain");
        assert_eq!(h.get("content-type").as_deref(), Some("text/plain"));
        assert_eq!(h.get("CONTENT-TYPE").as_deref(), Some("text/plain"));
    }

    #[test]
    fn multi_value_joined_and_listed() {
        let mut h = Headers::new();
        h.add("Set-Cookie", "a=1");
        h.add("set-cookie", "b=2");
        assert_eq!(h.get("Set-Cookie").as_deref(), Some("a=1,b=2"));
        assert_eq!(h.get_list("set-cookie"), vec!["a=1", "b=2"]);
    }

    #[test]
    fn first_seen_casing_wins() {
        let mut h = Headers::new();
        h.add("X-CuStOm", "1");
        h.add("x-custom", "2");
        let names: Vec<_> = h.iter().map(|(k, _)| k).collect();
        assert_eq!(names, vec!["X-CuStOm", "X-CuStOm"]);
    }

    #[test]
    fn set_replaces_all_values() {
        let mut h = Headers::new();
        h.add("X-Foo", "1");
        h.add("X-Foo", "2");
        h.set("x-foo", "3");
        assert_eq!(h.get("X-Foo").as_deref(), Some("3"));
        assert_eq!(h.len(), 1);
    }

    #[test]
    fn remove_and_contains() {
        let mut h = Headers::new();
        h.add("Authorization", "Bearer t");
        assert!(h.contains("authorization"));
        assert!(h.remove("AUTHORIZATION"));
        assert!(!h.contains("authorization"));
        assert!(!h.remove("authorization"));
    }

    #[test]
    fn display_preserves_order() {
        let mut h = Headers::new();
        h.add("B", "2");
        h.add("A", "1");
        h.add("B", "3");
        assert_eq!(h.to_string(), "B: 2\r\nA: 1\r\nB: 3\r\n");
    }
}
