//! Path macro substitution
//!
//! Stored paths use symbolic `$NAME$` tokens for machine-specific directories
//! so configuration files stay portable. Tokens are expanded on read and
//! collapsed back on write. Tokens that have no definition pass through
//! untouched and are remembered per component so they can be reported and
//! invalidated once the macro becomes defined.

use std::collections::{BTreeSet, HashMap};

use parking_lot::RwLock;
use serde_json::Value;
use tracing::{debug, warn};

use crate::constants::macros::DELIMITER;
use crate::error::{Result, StoreError};

/// Ordered macro name → expansion mapping
#[derive(Debug, Clone, Default)]
pub struct MacroTable {
    entries: Vec<(String, String)>,
}

impl MacroTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, name: &str) -> Option<&str> {
        self.entries
            .iter()
            .find(|(n, _)| n == name)
            .map(|(_, v)| v.as_str())
    }

    pub fn contains(&self, name: &str) -> bool {
        self.get(name).is_some()
    }

    /// Add a new definition. Existing names are never overwritten here.
    pub fn add(&mut self, name: &str, value: &str) -> Result<()> {
        if self.contains(name) {
            return Err(StoreError::MacroAlreadyDefined(name.to_string()));
        }
        self.entries
            .push((name.to_string(), normalize_expansion(value)));
        Ok(())
    }

    /// Overwrite (or add) a definition, returning the previous expansion.
    pub fn replace(&mut self, name: &str, value: &str) -> Option<String> {
        let value = normalize_expansion(value);
        match self.entries.iter_mut().find(|(n, _)| n == name) {
            Some((_, existing)) => Some(std::mem::replace(existing, value)),
            None => {
                self.entries.push((name.to_string(), value));
                None
            }
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.entries.iter().map(|(n, v)| (n.as_str(), v.as_str()))
    }
}

/// Trailing separators would break boundary matching during collapse
fn normalize_expansion(value: &str) -> String {
    let trimmed = value.trim_end_matches(['/', '\\']);
    if trimmed.is_empty() {
        value.to_string()
    } else {
        trimmed.to_string()
    }
}

/// Bidirectional macro ↔ component index of unresolved macros
#[derive(Debug, Default)]
struct UnknownMacroIndex {
    by_macro: HashMap<String, BTreeSet<String>>,
    by_component: HashMap<String, BTreeSet<String>>,
}

/// Expands and collapses path macros, and tracks unknown ones.
#[derive(Debug)]
pub struct PathMacroSubstitutor {
    table: RwLock<MacroTable>,
    unknown: RwLock<UnknownMacroIndex>,
    case_sensitive: bool,
}

impl Default for PathMacroSubstitutor {
    fn default() -> Self {
        Self::new(host_case_sensitive())
    }
}

/// Case sensitivity of the host filesystem
pub fn host_case_sensitive() -> bool {
    !cfg!(any(windows, target_os = "macos"))
}

impl PathMacroSubstitutor {
    pub fn new(case_sensitive: bool) -> Self {
        Self {
            table: RwLock::new(MacroTable::new()),
            unknown: RwLock::new(UnknownMacroIndex::default()),
            case_sensitive,
        }
    }

    pub fn with_table(table: MacroTable, case_sensitive: bool) -> Self {
        Self {
            table: RwLock::new(table),
            unknown: RwLock::new(UnknownMacroIndex::default()),
            case_sensitive,
        }
    }

    pub fn is_case_sensitive(&self) -> bool {
        self.case_sensitive
    }

    pub fn add_macro(&self, name: &str, value: &str) -> Result<()> {
        self.table.write().add(name, value)?;
        debug!(name = %name, value = %value, "Macro defined");
        Ok(())
    }

    pub fn replace_macro(&self, name: &str, value: &str) -> Option<String> {
        let previous = self.table.write().replace(name, value);
        debug!(name = %name, value = %value, replaced = previous.is_some(), "Macro replaced");
        previous
    }

    pub fn macro_value(&self, name: &str) -> Option<String> {
        self.table.read().get(name).map(str::to_string)
    }

    pub fn table(&self) -> MacroTable {
        self.table.read().clone()
    }

    /// Replace every defined `$NAME$` token. Undefined tokens pass through.
    pub fn expand(&self, text: &str) -> String {
        let table = self.table.read();
        expand_with(&table, text, &mut |_| {})
    }

    /// Like [`expand`](Self::expand), recording undefined tokens against `component`.
    pub fn expand_for(&self, component: &str, text: &str) -> String {
        let mut missing = BTreeSet::new();
        let expanded = {
            let table = self.table.read();
            expand_with(&table, text, &mut |name| {
                missing.insert(name.to_string());
            })
        };
        if !missing.is_empty() {
            self.add_unknown_macros(component, missing);
        }
        expanded
    }

    /// Replace known expansions with their `$NAME$` token, longest first.
    pub fn collapse(&self, text: &str) -> String {
        let table = self.table.read();
        let mut candidates: Vec<(&str, &str)> =
            table.iter().filter(|(_, v)| !v.is_empty()).collect();
        candidates.sort_by(|a, b| b.1.len().cmp(&a.1.len()));

        let bytes = text.as_bytes();
        let mut out = String::with_capacity(text.len());
        let mut i = 0;
        'scan: while i < text.len() {
            if text.is_char_boundary(i) && (i == 0 || !is_word_byte(bytes[i - 1])) {
                for (name, value) in &candidates {
                    let end = i + value.len();
                    if end > text.len() || !text.is_char_boundary(end) {
                        continue;
                    }
                    let matched = if self.case_sensitive {
                        &bytes[i..end] == value.as_bytes()
                    } else {
                        bytes[i..end].eq_ignore_ascii_case(value.as_bytes())
                    };
                    if matched && (end == text.len() || matches!(bytes[end], b'/' | b'\\')) {
                        out.push(DELIMITER);
                        out.push_str(name);
                        out.push(DELIMITER);
                        i = end;
                        continue 'scan;
                    }
                }
            }
            let ch_len = text[i..].chars().next().map(char::len_utf8).unwrap_or(1);
            out.push_str(&text[i..i + ch_len]);
            i += ch_len;
        }
        out
    }

    /// Expand every string value of a state tree in place.
    pub fn expand_tree(&self, tree: &mut Value) {
        let table = self.table.read();
        walk_strings(tree, &mut |s| expand_with(&table, s, &mut |_| {}));
    }

    /// Expand a state tree in place, recording undefined tokens against `component`.
    pub fn expand_tree_for(&self, component: &str, tree: &mut Value) {
        let mut missing = BTreeSet::new();
        {
            let table = self.table.read();
            walk_strings(tree, &mut |s| {
                expand_with(&table, s, &mut |name| {
                    missing.insert(name.to_string());
                })
            });
        }
        if !missing.is_empty() {
            self.add_unknown_macros(component, missing);
        }
    }

    /// Collapse every string value of a state tree in place.
    pub fn collapse_tree(&self, tree: &mut Value) {
        walk_strings(tree, &mut |s| self.collapse(s));
    }

    pub fn add_unknown_macros<I>(&self, component: &str, macros: I)
    where
        I: IntoIterator<Item = String>,
    {
        let mut index = self.unknown.write();
        let mut added = Vec::new();
        for name in macros {
            index
                .by_macro
                .entry(name.clone())
                .or_default()
                .insert(component.to_string());
            if index
                .by_component
                .entry(component.to_string())
                .or_default()
                .insert(name.clone())
            {
                added.push(name);
            }
        }
        if !added.is_empty() {
            warn!(component = %component, macros = ?added, "Unknown path macros");
        }
    }

    /// Unknown macros of one component, or of every component when `None`.
    pub fn get_unknown_macros(&self, component: Option<&str>) -> BTreeSet<String> {
        let index = self.unknown.read();
        match component {
            Some(name) => index.by_component.get(name).cloned().unwrap_or_default(),
            None => index.by_macro.keys().cloned().collect(),
        }
    }

    /// Forget the given macros, returning the components that referenced them.
    pub fn invalidate_unknown_macros(&self, macros: &BTreeSet<String>) -> BTreeSet<String> {
        let mut index = self.unknown.write();
        let mut affected = BTreeSet::new();
        for name in macros {
            let Some(components) = index.by_macro.remove(name) else {
                continue;
            };
            for component in components {
                if let Some(set) = index.by_component.get_mut(&component) {
                    set.remove(name);
                    if set.is_empty() {
                        index.by_component.remove(&component);
                    }
                }
                affected.insert(component);
            }
        }
        affected
    }
}

/// Every syntactically valid `$NAME$` token in `text`, defined or not
pub fn referenced_macros(text: &str) -> BTreeSet<String> {
    let mut names = BTreeSet::new();
    expand_with(&MacroTable::new(), text, &mut |name| {
        names.insert(name.to_string());
    });
    names
}

fn is_word_byte(b: u8) -> bool {
    b.is_ascii_alphanumeric() || b == b'_' || b == b'.' || b == b'-'
}

fn is_macro_name(name: &str) -> bool {
    !name.is_empty() && name.chars().all(|c| c.is_ascii_alphanumeric() || c == '_')
}

fn expand_with(table: &MacroTable, text: &str, on_unknown: &mut dyn FnMut(&str)) -> String {
    if !text.contains(DELIMITER) {
        return text.to_string();
    }
    let mut out = String::with_capacity(text.len());
    let mut rest = text;
    while let Some(start) = rest.find(DELIMITER) {
        out.push_str(&rest[..start]);
        let after = &rest[start + 1..];
        match after.find(DELIMITER) {
            Some(end) if is_macro_name(&after[..end]) => {
                let name = &after[..end];
                match table.get(name) {
                    Some(value) => out.push_str(value),
                    None => {
                        on_unknown(name);
                        out.push(DELIMITER);
                        out.push_str(name);
                        out.push(DELIMITER);
                    }
                }
                rest = &after[end + 1..];
            }
            _ => {
                out.push(DELIMITER);
                rest = after;
            }
        }
    }
    out.push_str(rest);
    out
}

fn walk_strings(tree: &mut Value, f: &mut dyn FnMut(&str) -> String) {
    match tree {
        Value::String(s) => *s = f(s),
        Value::Array(items) => items.iter_mut().for_each(|item| walk_strings(item, f)),
        Value::Object(map) => map.values_mut().for_each(|item| walk_strings(item, f)),
        _ => {}
    }
}
