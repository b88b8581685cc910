//! Typed, ordered header mapping for outbound messages.
//!
//! Headers keep their original order and the case of their names, lookups
//! are case-insensitive as required by RFC 5322. Values are always stored
//! trimmed and unfolded.

/// Ordered list of `(name, value)` header pairs.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HeaderMap {
    entries: Vec<(String, String)>,
}

impl HeaderMap {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the first header value matching `name` (case-insensitive).
    pub fn get(&self, name: &str) -> Option<&str> {
        self.entries
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    /// Returns whether a header with the given name exists.
    pub fn contains(&self, name: &str) -> bool {
        self.get(name).is_some()
    }

    /// Appends a header at the end, keeping any existing header of the same name.
    pub fn append(&mut self, name: &str, value: &str) {
        self.entries
            .push((name.trim().to_string(), value.trim().to_string()));
    }

    /// Prepends a header to the beginning of the list.
    pub fn prepend(&mut self, name: &str, value: &str) {
        self.entries
            .insert(0, (name.trim().to_string(), value.trim().to_string()));
    }

    /// Sets a header, replacing the first existing occurrence in place and
    /// dropping any later duplicates. Appends when no such header exists.
    pub fn set(&mut self, name: &str, value: &str) {
        let name = name.trim();
        let value = value.trim();
        match self
            .entries
            .iter()
            .position(|(k, _)| k.eq_ignore_ascii_case(name))
        {
            Some(index) => {
                self.entries[index] = (name.to_string(), value.to_string());
                let mut position = 0;
                self.entries.retain(|(k, _)| {
                    let keep = position <= index || !k.eq_ignore_ascii_case(name);
                    position += 1;
                    keep
                });
            }
            None => self.entries.push((name.to_string(), value.to_string())),
        }
    }

    /// Removes every header with the given name, returning the first removed value.
    pub fn remove(&mut self, name: &str) -> Option<String> {
        let first = self.get(name).map(str::to_string);
        self.entries.retain(|(k, _)| !k.eq_ignore_ascii_case(name));
        first
    }

    /// Keeps only the headers for which `keep(name, value)` returns true.
    pub fn retain(&mut self, mut keep: impl FnMut(&str, &str) -> bool) {
        self.entries.retain(|(k, v)| keep(k, v));
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.entries.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl From<Vec<(String, String)>> for HeaderMap {
    fn from(entries: Vec<(String, String)>) -> Self {
        Self { entries }
    }
}

impl<'a> IntoIterator for &'a HeaderMap {
    type Item = &'a (String, String);
    type IntoIter = std::slice::Iter<'a, (String, String)>;

    fn into_iter(self) -> Self::IntoIter {
        self.entries.iter()
    }
}
