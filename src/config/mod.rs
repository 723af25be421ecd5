//! Scoped, hierarchical configuration store (§4.5 "Scoped Configuration").
//!
//! A [`Scope`] is a node in a tree: reads fall through to the parent when a
//! key is absent locally, writes are always local. The process root scope
//! additionally falls through to the environment (`${APP_ID}_<KEY>` or
//! bare `<KEY>`, upper-cased) when nothing in the tree has the key, and is
//! immutable once a key has been set on it (§3 Invariants: "the root
//! config scope is immutable after construction").
use std::cell::RefCell;
use std::collections::BTreeMap;
use std::env;
use std::fmt;
use std::rc::Rc;

use serde::Serialize;

use crate::diagnostics::{Diagnostic, Value};

const LIST_SEPARATORS: [char; 3] = [';', ':', ','];

#[derive(Debug, Clone, Serialize)]
enum Setting {
    Text(String),
    List(Vec<String>),
    Bool(bool),
}

impl Setting {
    fn as_text(&self) -> String {
        match self {
            Setting::Text(s) => s.clone(),
            Setting::List(items) => items.join(";"),
            Setting::Bool(b) => b.to_string(),
        }
    }

    /// Coerces to a list per §4.5 "List coercion": strings split on the
    /// platform path-list separators, scalars wrap as a single-element
    /// list, lists pass through unchanged.
    fn as_list(&self) -> Vec<String> {
        match self {
            Setting::Text(s) => s
                .split(|c| LIST_SEPARATORS.contains(&c))
                .map(|p| p.trim().to_owned())
                .filter(|p| !p.is_empty())
                .collect(),
            Setting::List(items) => items.clone(),
            Setting::Bool(b) => vec![b.to_string()],
        }
    }
}

impl From<&str> for Setting {
    fn from(s: &str) -> Self {
        Setting::Text(s.to_owned())
    }
}

impl From<String> for Setting {
    fn from(s: String) -> Self {
        Setting::Text(s)
    }
}

impl From<Vec<String>> for Setting {
    fn from(items: Vec<String>) -> Self {
        Setting::List(items)
    }
}

impl From<bool> for Setting {
    fn from(b: bool) -> Self {
        Setting::Bool(b)
    }
}

struct Inner {
    parent: RefCell<Option<Scope>>,
    vars: RefCell<BTreeMap<String, Setting>>,
    is_root: bool,
}

/// A node in the configuration tree. Cheap to clone (reference-counted);
/// clones refer to the same underlying scope.
#[derive(Clone)]
pub struct Scope {
    inner: Rc<Inner>,
}

impl fmt::Debug for Scope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Scope")
            .field("is_root", &self.inner.is_root)
            .field("vars", &self.inner.vars.borrow().keys().collect::<Vec<_>>())
            .finish()
    }
}

impl Scope {
    /// Creates a fresh root scope with no parent. Most programs use
    /// [`root`] instead, which returns the process-wide thread-local root.
    pub fn new_root() -> Self {
        Scope {
            inner: Rc::new(Inner {
                parent: RefCell::new(None),
                vars: RefCell::new(BTreeMap::new()),
                is_root: true,
            }),
        }
    }

    /// Creates a child scope. Reads that miss locally fall through to
    /// `self`; writes on the child never affect `self`.
    pub fn child(&self) -> Scope {
        Scope {
            inner: Rc::new(Inner {
                parent: RefCell::new(Some(self.clone())),
                vars: RefCell::new(BTreeMap::new()),
                is_root: false,
            }),
        }
    }

    /// Alias for [`child`](Self::child) (§4.5: "a scope exposes `new_child`...").
    pub fn new_child(&self) -> Scope {
        self.child()
    }

    /// Returns the parent scope, if any (`None` for the root).
    pub fn parent(&self) -> Option<Scope> {
        self.inner.parent.borrow().clone()
    }

    /// Alias for [`parent`](Self::parent).
    pub fn get_parent(&self) -> Option<Scope> {
        self.parent()
    }

    /// Rewires this scope's parent link, so subsequent reads that miss
    /// locally fall through to `parent` instead of whatever scope this was
    /// previously attached to (§4.5 "a scope exposes... `set_parent`").
    /// Has no effect on the root scope's env fallback, since the root has
    /// no parent link to rewire.
    pub fn set_parent(&self, parent: Scope) {
        *self.inner.parent.borrow_mut() = Some(parent);
    }

    /// Inserts a fresh, empty scope between `self` and its current parent,
    /// returning the new scope (§4.5 "a scope exposes... `new_parent`").
    /// `self` now falls through to the new scope, which in turn falls
    /// through to whatever `self`'s parent was before the call.
    pub fn new_parent(&self) -> Scope {
        let grandparent = self.inner.parent.borrow().clone();
        let fresh = Scope {
            inner: Rc::new(Inner {
                parent: RefCell::new(grandparent),
                vars: RefCell::new(BTreeMap::new()),
                is_root: false,
            }),
        };
        self.set_parent(fresh.clone());
        fresh
    }

    /// Sets `key` to `value` in this scope, overwriting any existing local
    /// value (and shadowing, without modifying, any parent or environment
    /// value). On the root scope, re-setting an already-defined key raises
    /// a `config_error` (§3 Invariants: "the root config scope is
    /// immutable after construction"; §8 "Setting a root constant twice
    /// raises").
    pub fn set(&self, key: &str, value: impl Into<Setting>) -> Result<(), Diagnostic> {
        if self.inner.is_root && self.inner.vars.borrow().contains_key(key) {
            return Err(Diagnostic::new(
                "config_error: root configuration constant '${1}' is already set",
                vec![Value::from(key)],
            ));
        }
        self.inner.vars.borrow_mut().insert(key.to_owned(), value.into());
        Ok(())
    }

    /// Like [`set`](Self::set), but panics instead of returning an error —
    /// convenient for child scopes (which are never immutable) and for
    /// test setup.
    pub fn insert(&self, key: &str, value: impl Into<Setting>) {
        self.set(key, value).expect("scope key already set");
    }

    fn lookup(&self, key: &str) -> Option<Setting> {
        if let Some(v) = self.inner.vars.borrow().get(key) {
            return Some(v.clone());
        }
        match self.inner.parent.borrow().clone() {
            Some(parent) => parent.lookup(key),
            None if self.inner.is_root => env_setting(key),
            None => None,
        }
    }

    /// Returns the raw string value of `key`, if visible in this scope, an
    /// ancestor, or (for the root scope) the environment.
    pub fn get(&self, key: &str) -> Option<String> {
        self.lookup(key).map(|s| s.as_text())
    }

    /// Returns `key`'s value coerced to a list (§4.5 "List coercion"): a
    /// string is split on `;`/`:`/`,`, a scalar boolean wraps as a single
    /// element, a list passes through. Unset keys yield the empty list.
    pub fn get_list(&self, key: &str) -> Vec<String> {
        self.lookup(key).map(|s| s.as_list()).unwrap_or_default()
    }

    /// Like [`get_list`](Self::get_list), additionally de-duplicating
    /// while preserving first occurrence.
    pub fn get_unique_list(&self, key: &str) -> Vec<String> {
        let mut seen = std::collections::BTreeSet::new();
        self.get_list(key)
            .into_iter()
            .filter(|item| seen.insert(item.clone()))
            .collect()
    }

    /// Coerces `key`'s value to a boolean (§4.5 "Bool coercion"):
    /// `1/on/true/y/yes` (case-insensitive) are truthy, `0/off/false/n/no`
    /// are falsy, and an unset key is falsy.
    pub fn get_bool(&self, key: &str) -> bool {
        match self.get(key) {
            Some(v) => matches!(
                v.to_lowercase().as_str(),
                "1" | "on" | "true" | "y" | "yes"
            ),
            None => false,
        }
    }

    /// Like [`get`](Self::get), but raises a `config_error` diagnostic
    /// instead of returning `None` when the key is unset.
    pub fn require(&self, key: &str) -> Result<String, Diagnostic> {
        self.get(key).ok_or_else(|| {
            Diagnostic::new(
                "config_error: missing required configuration key '${1}'",
                vec![Value::from(key)],
            )
        })
    }

    /// Inserts `value` into the list-valued key `key` at `pos` (appending
    /// if `None`), mutating the local scope's copy in place (§4.5
    /// "`insert(k,v,pos?)`... mutate in place"). The key is read through
    /// the full list-coercion rules first, so a scalar or unset key
    /// becomes a one- or zero-element list before the insertion.
    pub fn insert_list(&self, key: &str, value: impl Into<String>, pos: Option<usize>) {
        let mut list = self.get_list(key);
        let value = value.into();
        match pos {
            Some(i) => list.insert(i.min(list.len()), value),
            None => list.push(value),
        }
        self.inner
            .vars
            .borrow_mut()
            .insert(key.to_owned(), Setting::List(list));
    }

    /// Like [`insert_list`](Self::insert_list), but if `value` is already
    /// present in the list it is *moved* to `pos` (or left at the end if
    /// `pos` is `None`) rather than inserted a second time (§4.5
    /// "`insert_unique`... moves (not re-inserts) if `v` already
    /// present"; §8: `insert_unique` into `[]` with `(2),(5),(2)` →
    /// `[2,5]`; `(5, pos=1)` → `[5,2]`).
    pub fn insert_unique_list(&self, key: &str, value: impl Into<String>, pos: Option<usize>) {
        let value = value.into();
        let mut list = self.get_list(key);
        if let Some(existing) = list.iter().position(|v| *v == value) {
            list.remove(existing);
        }
        match pos {
            Some(i) => list.insert(i.min(list.len()), value),
            None => list.push(value),
        }
        self.inner
            .vars
            .borrow_mut()
            .insert(key.to_owned(), Setting::List(list));
    }

    /// Iterates every key visible from this scope: local keys first
    /// (shadowing ancestors), then ancestor keys not already seen, and for
    /// the root scope, environment variables under the `${APP_ID}_`
    /// prefix not already seen. Keys are yielded in sorted order within
    /// each level, alongside the id of the scope they were found in and
    /// whether a descendant scope shadows them (§4.5 "Iteration").
    pub fn list_vars(&self) -> Vec<VarEntry> {
        let mut seen = std::collections::BTreeSet::new();
        let mut out = Vec::new();
        self.collect_vars(self.id(), &mut seen, &mut out);
        out
    }

    /// A stable identity for this scope, used by [`list_vars`](Self::list_vars).
    pub fn id(&self) -> usize {
        Rc::as_ptr(&self.inner) as usize
    }

    fn collect_vars(&self, origin: usize, seen: &mut std::collections::BTreeSet<String>, out: &mut Vec<VarEntry>) {
        for (key, value) in self.inner.vars.borrow().iter() {
            let overridden = !seen.insert(key.clone());
            out.push(VarEntry {
                key: key.clone(),
                value: value.as_text(),
                scope_id: self.id(),
                overridden,
            });
        }
        let _ = origin;
        match self.inner.parent.borrow().clone() {
            Some(parent) => parent.collect_vars(origin, seen, out),
            None if self.inner.is_root => {
                for (key, value) in env_vars() {
                    let overridden = !seen.insert(key.clone());
                    out.push(VarEntry {
                        key,
                        value,
                        scope_id: self.id(),
                        overridden,
                    });
                }
            }
            None => {}
        }
    }
}

/// One entry yielded by [`Scope::list_vars`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VarEntry {
    pub key: String,
    pub value: String,
    pub scope_id: usize,
    /// True if a descendant scope already reported this key (i.e. this
    /// entry is shadowed and not the value a plain [`Scope::get`] would
    /// return).
    pub overridden: bool,
}

fn app_id() -> String {
    env::var("LIFT_APP_ID").unwrap_or_else(|_| "LIFT".to_owned())
}

fn env_key(key: &str) -> String {
    key.to_uppercase().replace(['.', '-'], "_")
}

/// Resolves `key` against the environment as `${APP_ID}_<KEY>` first, then
/// bare `<KEY>` (§4.5 "Scopes": "resolves a key `K` as the first of
/// `getenv(\"${APP_ID}_${K}\")` or `getenv(K)`").
fn env_setting(key: &str) -> Option<Setting> {
    let upper = env_key(key);
    let prefixed = format!("{}_{}", app_id(), upper);
    env::var(&prefixed)
        .or_else(|_| env::var(&upper))
        .ok()
        .map(Setting::Text)
}

fn env_vars() -> Vec<(String, String)> {
    let prefix = format!("{}_", app_id());
    env::vars()
        .filter_map(|(k, v)| k.strip_prefix(&prefix).map(|rest| (rest.to_lowercase(), v)))
        .collect()
}

thread_local! {
    static ROOT: Scope = Scope::new_root();
}

/// The process-wide (thread-local) root configuration scope.
pub fn root() -> Scope {
    ROOT.with(|r| r.clone())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn child_reads_fall_through_to_parent() {
        let parent = Scope::new_root();
        parent.insert("level", "warn");
        let child = parent.child();
        assert_eq!(child.get("level"), Some("warn".to_owned()));
        child.insert("level", "debug");
        assert_eq!(child.get("level"), Some("debug".to_owned()));
        assert_eq!(parent.get("level"), Some("warn".to_owned()));
    }

    #[test]
    fn setting_a_root_constant_twice_raises() {
        let root = Scope::new_root();
        root.set("retries", "3").unwrap();
        let err = root.set("retries", "5").unwrap_err();
        assert_eq!(err.kind(), "config_error");
        assert_eq!(root.get("retries"), Some("3".to_owned()));
    }

    #[test]
    fn child_scopes_may_be_rewritten_freely() {
        let parent = Scope::new_root();
        let child = parent.child();
        child.set("retries", "3").unwrap();
        child.set("retries", "5").unwrap();
        assert_eq!(child.get("retries"), Some("5".to_owned()));
    }

    #[test]
    fn get_list_splits_on_any_path_list_separator() {
        let scope = Scope::new_root();
        scope.insert("a", "a;b:c,d");
        assert_eq!(scope.get_list("a"), vec!["a", "b", "c", "d"]);
        // Repeated reads return an equivalent list each time.
        assert_eq!(scope.get_list("a"), scope.get_list("a"));
    }

    #[test]
    fn get_unique_list_deduplicates_preserving_first_occurrence() {
        let scope = Scope::new_root();
        scope.insert("a", "x;y;x;z;y");
        assert_eq!(scope.get_unique_list("a"), vec!["x", "y", "z"]);
    }

    #[test]
    fn bool_coercion() {
        let scope = Scope::new_root();
        for truthy in ["1", "on", "TRUE", "y", "Yes"] {
            scope.insert("enabled", truthy);
            assert!(scope.get_bool("enabled"), "{truthy} should be truthy");
        }
        for falsy in ["0", "off", "false", "n", "no"] {
            scope.insert("enabled", falsy);
            assert!(!scope.get_bool("enabled"), "{falsy} should be falsy");
        }
    }

    #[test]
    fn require_raises_config_error_when_missing() {
        let scope = Scope::new_root();
        let err = scope.require("missing").unwrap_err();
        assert_eq!(err.kind(), "config_error");
        assert!(err.message().contains("missing"));
    }

    #[test]
    fn insert_unique_list_matches_the_documented_walkthrough() {
        // §8: insert_unique into [] with (2),(5),(2) -> [2,5]; (5, pos=1) -> [5,2].
        let scope = Scope::new_root();
        scope.insert_unique_list("nums", "2", None);
        scope.insert_unique_list("nums", "5", None);
        scope.insert_unique_list("nums", "2", None);
        assert_eq!(scope.get_list("nums"), vec!["2", "5"]);
        scope.insert_unique_list("nums", "5", Some(0));
        assert_eq!(scope.get_list("nums"), vec!["5", "2"]);
    }

    #[test]
    fn insert_list_inserts_at_position_or_appends() {
        let scope = Scope::new_root();
        scope.insert_list("path", "a", None);
        scope.insert_list("path", "b", None);
        scope.insert_list("path", "first", Some(0));
        assert_eq!(scope.get_list("path"), vec!["first", "a", "b"]);
    }

    #[test]
    fn set_parent_rewires_which_scope_reads_fall_through_to() {
        let old_parent = Scope::new_root();
        old_parent.insert("source", "old");
        let new_parent = Scope::new_root();
        new_parent.insert("source", "new");

        let scope = old_parent.new_child();
        assert_eq!(scope.get("source"), Some("old".to_owned()));
        scope.set_parent(new_parent.clone());
        assert_eq!(scope.get_parent().unwrap().id(), new_parent.id());
        assert_eq!(scope.get("source"), Some("new".to_owned()));
    }

    #[test]
    fn new_parent_splices_a_scope_in_between() {
        let grandparent = Scope::new_root();
        grandparent.insert("a", "1");
        let scope = grandparent.new_child();
        let middle = scope.new_parent();
        middle.insert("b", "2");
        assert_eq!(scope.get_parent().unwrap().id(), middle.id());
        assert_eq!(middle.get_parent().unwrap().id(), grandparent.id());
        assert_eq!(scope.get("a"), Some("1".to_owned()));
        assert_eq!(scope.get("b"), Some("2".to_owned()));
    }

    #[test]
    fn list_vars_shadows_and_merges_and_flags_overrides() {
        let parent = Scope::new_root();
        parent.insert("a", "1");
        let child = parent.child();
        child.insert("a", "override");
        child.insert("b", "2");
        let vars = child.list_vars();
        let a_entries: Vec<_> = vars.iter().filter(|v| v.key == "a").collect();
        assert_eq!(a_entries.len(), 2);
        assert!(a_entries.iter().any(|v| v.value == "override" && !v.overridden));
        assert!(a_entries.iter().any(|v| v.value == "1" && v.overridden));
        assert!(vars.iter().any(|v| v.key == "b" && v.value == "2"));
    }
}
