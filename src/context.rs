//! Coverage contexts: named tags attached to every registered element so a
//! report can filter, say, everything inside `catch` blocks or every
//! trivial getter.
//!
//! Builtin contexts occupy the low bits of a [`ContextSet`]; custom regex
//! contexts from the configuration follow them.

use std::collections::HashMap;

use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::config::InstrumentationConfig;
use crate::error::Error;

pub const MAX_CONTEXTS: usize = u64::BITS as usize;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ContextSet(u64);

impl ContextSet {
    pub const EMPTY: ContextSet = ContextSet(0);

    pub fn with(self, index: usize) -> Self {
        debug_assert!(index < MAX_CONTEXTS);
        Self(self.0 | (1 << index))
    }

    pub fn without(self, index: usize) -> Self {
        Self(self.0 & !(1 << index))
    }

    pub fn contains(self, index: usize) -> bool {
        index < MAX_CONTEXTS && self.0 & (1 << index) != 0
    }

    pub fn union(self, other: ContextSet) -> Self {
        Self(self.0 | other.0)
    }

    pub fn is_empty(self) -> bool {
        self.0 == 0
    }

    pub fn has(self, builtin: Builtin) -> bool {
        self.contains(builtin.index())
    }

    pub fn indices(self) -> impl Iterator<Item = usize> {
        (0..MAX_CONTEXTS).filter(move |&i| self.contains(i))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Builtin {
    Static,
    Instance,
    Constructor,
    Method,
    Switch,
    While,
    Do,
    For,
    If,
    Else,
    Try,
    Catch,
    Finally,
    Sync,
    Assert,
    Deprecated,
    PrivateMethod,
    PropertyAccessor,
    Off,
    Lambda,
    Case,
}

impl Builtin {
    pub const ALL: [Builtin; 21] = [
        Builtin::Static,
        Builtin::Instance,
        Builtin::Constructor,
        Builtin::Method,
        Builtin::Switch,
        Builtin::While,
        Builtin::Do,
        Builtin::For,
        Builtin::If,
        Builtin::Else,
        Builtin::Try,
        Builtin::Catch,
        Builtin::Finally,
        Builtin::Sync,
        Builtin::Assert,
        Builtin::Deprecated,
        Builtin::PrivateMethod,
        Builtin::PropertyAccessor,
        Builtin::Off,
        Builtin::Lambda,
        Builtin::Case,
    ];

    pub fn index(self) -> usize {
        self as usize
    }

    pub fn name(self) -> &'static str {
        match self {
            Builtin::Static => "static",
            Builtin::Instance => "instance",
            Builtin::Constructor => "constructor",
            Builtin::Method => "method",
            Builtin::Switch => "switch",
            Builtin::While => "while",
            Builtin::Do => "do",
            Builtin::For => "for",
            Builtin::If => "if",
            Builtin::Else => "else",
            Builtin::Try => "try",
            Builtin::Catch => "catch",
            Builtin::Finally => "finally",
            Builtin::Sync => "sync",
            Builtin::Assert => "assert",
            Builtin::Deprecated => "@deprecated",
            Builtin::PrivateMethod => "private",
            Builtin::PropertyAccessor => "property",
            Builtin::Off => "stitch:off",
            Builtin::Lambda => "lambda",
            Builtin::Case => "case",
        }
    }
}

#[derive(Debug)]
pub struct RegexContext {
    pub index: usize,
    pub name: String,
    pub regex: Regex,
}

/// Builtin names plus the compiled custom contexts of one run.
#[derive(Debug, Default)]
pub struct ContextStore {
    method: Vec<RegexContext>,
    statement: Vec<RegexContext>,
}

impl ContextStore {
    pub fn from_config(config: &InstrumentationConfig) -> Result<Self, Error> {
        let mut next = Builtin::ALL.len();
        let mut compile = |defs: &[crate::config::NamedContext]| -> Result<Vec<RegexContext>, Error> {
            defs.iter()
                .map(|def| {
                    if next >= MAX_CONTEXTS {
                        return Err(Error::InvalidConfig(format!(
                            "too many contexts: at most {} custom contexts are supported",
                            MAX_CONTEXTS - Builtin::ALL.len()
                        )));
                    }
                    if Builtin::ALL.iter().any(|b| b.name() == def.name) {
                        return Err(Error::InvalidConfig(format!(
                            "context name '{}' is reserved",
                            def.name
                        )));
                    }
                    // Contexts match the whole normalized text.
                    let regex = Regex::new(&format!("^(?:{})$", def.pattern)).map_err(|source| {
                        Error::InvalidContext {
                            name: def.name.clone(),
                            source,
                        }
                    })?;
                    let index = next;
                    next += 1;
                    Ok(RegexContext {
                        index,
                        name: def.name.clone(),
                        regex,
                    })
                })
                .collect()
        };
        let method = compile(&config.method_contexts)?;
        let statement = compile(&config.statement_contexts)?;
        Ok(Self { method, statement })
    }

    pub fn method_contexts(&self) -> &[RegexContext] {
        &self.method
    }

    pub fn statement_contexts(&self) -> &[RegexContext] {
        &self.statement
    }

    /// Every context name, positioned at its bit index.
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = Builtin::ALL.iter().map(|b| b.name().to_owned()).collect();
        let mut custom: Vec<&RegexContext> = self.method.iter().chain(&self.statement).collect();
        custom.sort_by_key(|c| c.index);
        names.extend(custom.into_iter().map(|c| c.name.clone()));
        names
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ContextNode(u32);

/// Interning table for context sets.
///
/// Nested scopes keep deriving the same handful of sets (`method+if`,
/// `method+if+try`, ...). The tree hands out one node per distinct set and
/// caches each parent/child step, so walking into a scope is a map lookup.
/// It lives for a whole run and is shared by every file.
#[derive(Debug)]
pub struct ContextTree {
    sets: Vec<ContextSet>,
    by_set: HashMap<ContextSet, ContextNode>,
    edges: HashMap<(ContextNode, usize), ContextNode>,
}

impl Default for ContextTree {
    fn default() -> Self {
        Self::new()
    }
}

impl ContextTree {
    pub fn new() -> Self {
        let mut tree = Self {
            sets: Vec::new(),
            by_set: HashMap::new(),
            edges: HashMap::new(),
        };
        tree.intern(ContextSet::EMPTY);
        tree
    }

    pub fn root(&self) -> ContextNode {
        ContextNode(0)
    }

    pub fn set(&self, node: ContextNode) -> ContextSet {
        self.sets[node.0 as usize]
    }

    pub fn intern(&mut self, set: ContextSet) -> ContextNode {
        if let Some(&node) = self.by_set.get(&set) {
            return node;
        }
        let node = ContextNode(self.sets.len() as u32);
        self.sets.push(set);
        self.by_set.insert(set, node);
        node
    }

    /// The node for `parent`'s set plus `builtin`.
    pub fn enter(&mut self, parent: ContextNode, builtin: Builtin) -> ContextNode {
        let key = (parent, builtin.index());
        if let Some(&child) = self.edges.get(&key) {
            return child;
        }
        let child = self.intern(self.set(parent).with(builtin.index()));
        self.edges.insert(key, child);
        child
    }

    /// Number of distinct sets seen so far.
    pub fn len(&self) -> usize {
        self.sets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sets.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::NamedContext;

    #[test]
    fn set_operations() {
        let set = ContextSet::EMPTY
            .with(Builtin::If.index())
            .with(Builtin::Method.index());
        assert!(set.has(Builtin::If));
        assert!(!set.has(Builtin::Else));
        assert!(!set.without(Builtin::If.index()).has(Builtin::If));
        assert_eq!(
            set.indices().collect::<Vec<_>>(),
            vec![Builtin::Method.index(), Builtin::If.index()]
        );
    }

    #[test]
    fn tree_interns_equal_paths() {
        let mut tree = ContextTree::new();
        let root = tree.root();
        let a = tree.enter(root, Builtin::Method);
        let a_if = tree.enter(a, Builtin::If);
        let b = tree.enter(root, Builtin::Method);
        let b_if = tree.enter(b, Builtin::If);
        assert_eq!(a_if, b_if);
        assert_eq!(tree.len(), 3);

        // Entering a context already present is the same node.
        assert_eq!(tree.enter(a_if, Builtin::If), a_if);
    }

    #[test]
    fn custom_contexts_follow_builtins() {
        let config = InstrumentationConfig {
            method_contexts: vec![NamedContext {
                name: "getter".into(),
                pattern: "get\\w+".into(),
            }],
            statement_contexts: vec![NamedContext {
                name: "log".into(),
                pattern: "LOG\\.".into(),
            }],
            ..Default::default()
        };
        let store = ContextStore::from_config(&config).unwrap();
        assert_eq!(store.method_contexts()[0].index, Builtin::ALL.len());
        assert_eq!(store.statement_contexts()[0].index, Builtin::ALL.len() + 1);
        let names = store.names();
        assert_eq!(names[Builtin::ALL.len()], "getter");
        assert_eq!(names.last().map(String::as_str), Some("log"));
    }

    #[test]
    fn bad_regex_names_the_context() {
        let config = InstrumentationConfig {
            statement_contexts: vec![NamedContext {
                name: "broken".into(),
                pattern: "(".into(),
            }],
            ..Default::default()
        };
        let err = ContextStore::from_config(&config).unwrap_err();
        assert!(err.to_string().contains("broken"), "got: {err}");
    }

    #[test]
    fn reserved_names_are_rejected() {
        let config = InstrumentationConfig {
            method_contexts: vec![NamedContext {
                name: "catch".into(),
                pattern: ".*".into(),
            }],
            ..Default::default()
        };
        assert!(ContextStore::from_config(&config).is_err());
    }
}
