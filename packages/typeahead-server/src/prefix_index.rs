//! PrefixIndex - ordered trie over string keys
//!
//! Each node owns its children outright (no parent pointers); edges are kept
//! in the order they were first inserted, so a depth-first walk over an
//! unmodified index always enumerates keys in the same sequence.
//!
//! The server builds one index at startup from a newline-delimited word list
//! and shares it read-only between all search sessions:
//!
//! ```no_run
//! use std::ops::ControlFlow;
//! use typeahead::prefix_index::PrefixIndex;
//!
//! let index = PrefixIndex::<()>::load("words.txt").unwrap();
//! index.walk_leaves("ca", |key, _| {
//!     println!("{key}");
//!     ControlFlow::Continue(())
//! });
//! ```

use std::fs::File;
use std::io::{self, BufRead, BufReader};
use std::ops::ControlFlow;
use std::path::Path;

use indexmap::IndexMap;

/// How a walk ended.
///
/// A visitor asking to stop is a normal outcome (page full, session
/// superseded), not a failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WalkOutcome {
    /// Every matching key was visited.
    Completed,
    /// The visitor returned `ControlFlow::Break`.
    Stopped,
}

impl From<ControlFlow<()>> for WalkOutcome {
    fn from(flow: ControlFlow<()>) -> Self {
        match flow {
            ControlFlow::Continue(()) => WalkOutcome::Completed,
            ControlFlow::Break(()) => WalkOutcome::Stopped,
        }
    }
}

#[derive(Debug, Clone)]
struct Node<V> {
    /// Present iff this node terminates a stored key.
    value: Option<V>,
    /// Edge character -> child, iterated in first-insertion order.
    children: IndexMap<char, Node<V>>,
}

impl<V> Default for Node<V> {
    fn default() -> Self {
        Self {
            value: None,
            children: IndexMap::new(),
        }
    }
}

impl<V> Node<V> {
    fn descend(&self, path: &str) -> Option<&Node<V>> {
        let mut node = self;
        for c in path.chars() {
            node = node.children.get(&c)?;
        }
        Some(node)
    }

    /// Clear the value at the end of `rest`, pruning children that end up
    /// with neither a value nor children of their own. The recursion stack
    /// doubles as the ancestor path.
    fn remove(&mut self, mut rest: std::str::Chars<'_>) -> Option<V> {
        let Some(c) = rest.next() else {
            return self.value.take();
        };

        let child = self.children.get_mut(&c)?;
        let removed = child.remove(rest)?;
        if child.is_prunable() {
            self.children.shift_remove(&c);
        }
        Some(removed)
    }

    fn is_prunable(&self) -> bool {
        self.value.is_none() && self.children.is_empty()
    }
}

/// Ordered trie mapping string keys to values.
#[derive(Debug, Clone)]
pub struct PrefixIndex<V> {
    root: Node<V>,
    len: usize,
}

impl<V> Default for PrefixIndex<V> {
    fn default() -> Self {
        Self::new()
    }
}

impl<V> PrefixIndex<V> {
    pub fn new() -> Self {
        Self {
            root: Node::default(),
            len: 0,
        }
    }

    /// Number of stored keys.
    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Insert `value` at `key`, replacing any existing value.
    ///
    /// Returns `true` if the key had no value before.
    pub fn put(&mut self, key: &str, value: V) -> bool {
        let mut node = &mut self.root;
        for c in key.chars() {
            node = node.children.entry(c).or_default();
        }

        let is_new = node.value.replace(value).is_none();
        if is_new {
            self.len += 1;
        }
        is_new
    }

    /// Exact lookup. Internal nodes have no value and report `None`.
    pub fn get(&self, key: &str) -> Option<&V> {
        self.root.descend(key)?.value.as_ref()
    }

    pub fn contains_key(&self, key: &str) -> bool {
        self.get(key).is_some()
    }

    /// Remove the value stored at `key`, pruning any ancestor chain left
    /// without values or children.
    pub fn remove(&mut self, key: &str) -> Option<V> {
        let removed = self.root.remove(key.chars())?;
        self.len -= 1;
        Some(removed)
    }

    /// Visit every stored key that starts with `prefix`, depth first.
    ///
    /// A node's own key is visited before its children, and children are
    /// visited in edge-insertion order. An unknown prefix visits nothing and
    /// still completes.
    pub fn walk_leaves<F>(&self, prefix: &str, mut visit: F) -> WalkOutcome
    where
        F: FnMut(&str, &V) -> ControlFlow<()>,
    {
        for (key, value) in self.leaves(prefix) {
            if visit(&key, value).is_break() {
                return WalkOutcome::Stopped;
            }
        }
        WalkOutcome::Completed
    }

    /// Iterator over every stored key under `prefix`, in `walk_leaves` order.
    ///
    /// Keeps its own stack, so depth is bounded by memory rather than the
    /// thread's stack.
    pub fn leaves(&self, prefix: &str) -> Leaves<'_, V> {
        match self.root.descend(prefix) {
            Some(node) => Leaves {
                key: String::from(prefix),
                pending: node.value.as_ref(),
                stack: vec![node.children.iter()],
            },
            None => Leaves {
                key: String::new(),
                pending: None,
                stack: Vec::new(),
            },
        }
    }

    /// Visit every stored key.
    pub fn walk<F>(&self, visit: F) -> WalkOutcome
    where
        F: FnMut(&str, &V) -> ControlFlow<()>,
    {
        self.walk_leaves("", visit)
    }

    /// Visit every stored key that is a prefix of `key`, shortest first
    /// (the empty key, if stored, comes first).
    pub fn walk_path<F>(&self, key: &str, mut visit: F) -> WalkOutcome
    where
        F: FnMut(&str, &V) -> ControlFlow<()>,
    {
        let mut node = &self.root;
        if let Some(value) = &node.value {
            if visit("", value).is_break() {
                return WalkOutcome::Stopped;
            }
        }

        for (i, c) in key.char_indices() {
            match node.children.get(&c) {
                Some(next) => node = next,
                None => return WalkOutcome::Completed,
            }
            if let Some(value) = &node.value {
                let end = i + c.len_utf8();
                if visit(&key[..end], value).is_break() {
                    return WalkOutcome::Stopped;
                }
            }
        }

        WalkOutcome::Completed
    }
}

impl<V> Drop for PrefixIndex<V> {
    // Dismantle level by level; dropping a deep chain recursively could
    // exhaust the stack.
    fn drop(&mut self) {
        let mut stack: Vec<Node<V>> = std::mem::take(&mut self.root.children)
            .into_values()
            .collect();
        while let Some(mut node) = stack.pop() {
            stack.extend(std::mem::take(&mut node.children).into_values());
        }
    }
}

/// Depth-first iterator returned by [`PrefixIndex::leaves`].
pub struct Leaves<'a, V> {
    /// Key of the node whose children the top frame iterates.
    key: String,
    /// Value of the node just entered, emitted before its children.
    pending: Option<&'a V>,
    stack: Vec<indexmap::map::Iter<'a, char, Node<V>>>,
}

impl<'a, V> Iterator for Leaves<'a, V> {
    type Item = (String, &'a V);

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            if let Some(value) = self.pending.take() {
                return Some((self.key.clone(), value));
            }

            let frame = self.stack.last_mut()?;
            match frame.next() {
                Some((&c, child)) => {
                    self.key.push(c);
                    self.pending = child.value.as_ref();
                    self.stack.push(child.children.iter());
                }
                None => {
                    self.stack.pop();
                    // the bottom frame belongs to the prefix itself
                    if !self.stack.is_empty() {
                        self.key.pop();
                    }
                }
            }
        }
    }
}

impl<K: AsRef<str>, V> FromIterator<(K, V)> for PrefixIndex<V> {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        let mut index = Self::new();
        for (key, value) in iter {
            index.put(key.as_ref(), value);
        }
        index
    }
}

impl PrefixIndex<()> {
    /// Build a key set from one key per line.
    ///
    /// Trailing `\r` is stripped and empty lines are skipped.
    pub fn from_reader<R: BufRead>(reader: R) -> io::Result<Self> {
        let mut index = Self::new();
        for line in reader.lines() {
            let line = line?;
            let key = line.strip_suffix('\r').unwrap_or(&line);
            if key.is_empty() {
                continue;
            }
            index.put(key, ());
        }
        Ok(index)
    }

    /// Load a newline-delimited dictionary file.
    pub fn load(path: impl AsRef<Path>) -> io::Result<Self> {
        let file = File::open(path)?;
        Self::from_reader(BufReader::new(file))
    }
}
