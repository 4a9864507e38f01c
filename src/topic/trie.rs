//! Topic Trie for subscription matching
//!
//! A prefix tree keyed by topic level. Filters with `+` and `#` are stored
//! on dedicated wildcard edges so a publish topic is resolved by walking at
//! most three branches per level.
//!
//! - Levels are stored as `CompactString`, which keeps short levels inline
//! - Empty branches are pruned on removal so long-lived brokers do not
//!   accumulate dead nodes

use ahash::AHashMap;
use compact_str::CompactString;
use smallvec::SmallVec;

/// Node in the topic trie
#[derive(Debug)]
struct TrieNode<V> {
    /// Value for a filter ending exactly at this node
    value: Option<V>,
    /// Children indexed by literal topic level
    children: AHashMap<CompactString, TrieNode<V>>,
    /// Single-level wildcard (+) child
    single_wildcard: Option<Box<TrieNode<V>>>,
    /// Value for a filter ending in `#` below this node
    multi_wildcard: Option<V>,
}

impl<V> TrieNode<V> {
    fn new() -> Self {
        Self {
            value: None,
            children: AHashMap::new(),
            single_wildcard: None,
            multi_wildcard: None,
        }
    }

    fn is_empty(&self) -> bool {
        self.value.is_none()
            && self.multi_wildcard.is_none()
            && self.single_wildcard.is_none()
            && self.children.is_empty()
    }
}

impl<V> Default for TrieNode<V> {
    fn default() -> Self {
        Self::new()
    }
}

/// Topic Trie mapping topic filters to values
#[derive(Debug)]
pub struct TopicTrie<V> {
    root: TrieNode<V>,
}

impl<V> TopicTrie<V> {
    pub fn new() -> Self {
        Self {
            root: TrieNode::new(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.root.is_empty()
    }

    /// Get the value slot for a filter, creating intermediate nodes
    pub fn entry(&mut self, filter: &str) -> &mut Option<V> {
        let mut node = &mut self.root;
        let mut levels = filter.split('/').peekable();

        while let Some(level) = levels.next() {
            if level == "#" {
                return &mut node.multi_wildcard;
            }

            node = if level == "+" {
                &mut **node
                    .single_wildcard
                    .get_or_insert_with(|| Box::new(TrieNode::new()))
            } else {
                node.children.entry(CompactString::new(level)).or_default()
            };

            if levels.peek().is_none() {
                break;
            }
        }

        &mut node.value
    }

    /// Insert a topic filter with associated value, returning the old value
    pub fn insert(&mut self, filter: &str, value: V) -> Option<V> {
        self.entry(filter).replace(value)
    }

    /// Get a reference to the value stored for an exact filter
    pub fn get(&self, filter: &str) -> Option<&V> {
        let mut node = &self.root;
        let mut levels = filter.split('/').peekable();

        while let Some(level) = levels.next() {
            if level == "#" {
                return if levels.peek().is_none() {
                    node.multi_wildcard.as_ref()
                } else {
                    None
                };
            }
            node = if level == "+" {
                node.single_wildcard.as_deref()?
            } else {
                node.children.get(level)?
            };
            if levels.peek().is_none() {
                break;
            }
        }

        node.value.as_ref()
    }

    /// Get a mutable reference to the value stored for an exact filter
    pub fn get_mut(&mut self, filter: &str) -> Option<&mut V> {
        let mut node = &mut self.root;
        let mut levels = filter.split('/').peekable();

        while let Some(level) = levels.next() {
            if level == "#" {
                return if levels.peek().is_none() {
                    node.multi_wildcard.as_mut()
                } else {
                    None
                };
            }
            node = if level == "+" {
                node.single_wildcard.as_deref_mut()?
            } else {
                node.children.get_mut(level)?
            };
            if levels.peek().is_none() {
                break;
            }
        }

        node.value.as_mut()
    }

    /// Remove a filter from the trie, pruning branches left empty
    pub fn remove(&mut self, filter: &str) -> Option<V> {
        let levels: SmallVec<[&str; 8]> = filter.split('/').collect();
        Self::remove_recursive(&mut self.root, &levels)
    }

    fn remove_recursive(node: &mut TrieNode<V>, levels: &[&str]) -> Option<V> {
        let Some((&level, rest)) = levels.split_first() else {
            return node.value.take();
        };

        match level {
            "#" if rest.is_empty() => node.multi_wildcard.take(),
            "#" => None,
            "+" => {
                let child = node.single_wildcard.as_deref_mut()?;
                let removed = Self::remove_recursive(child, rest);
                if child.is_empty() {
                    node.single_wildcard = None;
                }
                removed
            }
            _ => {
                let child = node.children.get_mut(level)?;
                let removed = Self::remove_recursive(child, rest);
                if child.is_empty() {
                    node.children.remove(level);
                }
                removed
            }
        }
    }

    /// Remove entries for which the predicate returns true
    ///
    /// The predicate may also mutate the value in place, e.g. to drop one
    /// subscriber from a list and report whether the list is now empty.
    pub fn remove_by_predicate<F>(&mut self, mut pred: F)
    where
        F: FnMut(&mut V) -> bool,
    {
        Self::remove_by_predicate_recursive(&mut self.root, &mut pred);
    }

    fn remove_by_predicate_recursive<F>(node: &mut TrieNode<V>, pred: &mut F)
    where
        F: FnMut(&mut V) -> bool,
    {
        if node.value.as_mut().is_some_and(|v| pred(v)) {
            node.value = None;
        }
        if node.multi_wildcard.as_mut().is_some_and(|v| pred(v)) {
            node.multi_wildcard = None;
        }

        if let Some(child) = node.single_wildcard.as_deref_mut() {
            Self::remove_by_predicate_recursive(child, pred);
            if child.is_empty() {
                node.single_wildcard = None;
            }
        }

        node.children.retain(|_, child| {
            Self::remove_by_predicate_recursive(child, pred);
            !child.is_empty()
        });
    }

    /// Visit every stored value
    pub fn for_each<F>(&self, mut callback: F)
    where
        F: FnMut(&V),
    {
        Self::for_each_recursive(&self.root, &mut callback);
    }

    fn for_each_recursive<F>(node: &TrieNode<V>, callback: &mut F)
    where
        F: FnMut(&V),
    {
        if let Some(ref v) = node.value {
            callback(v);
        }
        if let Some(ref v) = node.multi_wildcard {
            callback(v);
        }
        if let Some(ref child) = node.single_wildcard {
            Self::for_each_recursive(child, callback);
        }
        for child in node.children.values() {
            Self::for_each_recursive(child, callback);
        }
    }

    /// Find all values whose filter matches a topic name
    ///
    /// Topics beginning with `$` are not matched by `+` or `#` in the first
    /// level.
    pub fn matches<F>(&self, topic: &str, mut callback: F)
    where
        F: FnMut(&V),
    {
        let is_system_topic = topic.starts_with('$');
        let levels: SmallVec<[&str; 8]> = topic.split('/').collect();
        Self::matches_recursive(&self.root, &levels, 0, is_system_topic, &mut callback);
    }

    fn matches_recursive<F>(
        node: &TrieNode<V>,
        levels: &[&str],
        index: usize,
        is_system_topic: bool,
        callback: &mut F,
    ) where
        F: FnMut(&V),
    {
        let wildcards_allowed = !(is_system_topic && index == 0);

        // `#` also matches the parent level, so check it before the end test
        if wildcards_allowed {
            if let Some(ref v) = node.multi_wildcard {
                callback(v);
            }
        }

        if index >= levels.len() {
            if let Some(ref v) = node.value {
                callback(v);
            }
            return;
        }

        if wildcards_allowed {
            if let Some(ref child) = node.single_wildcard {
                Self::matches_recursive(child, levels, index + 1, is_system_topic, callback);
            }
        }

        if let Some(child) = node.children.get(levels[index]) {
            Self::matches_recursive(child, levels, index + 1, is_system_topic, callback);
        }
    }
}

impl<V> Default for TopicTrie<V> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn collect(trie: &TopicTrie<i32>, topic: &str) -> Vec<i32> {
        let mut matches = Vec::new();
        trie.matches(topic, |v| matches.push(*v));
        matches.sort();
        matches
    }

    #[test]
    fn test_exact_match() {
        let mut trie = TopicTrie::new();
        trie.insert("test/topic", 1);

        assert_eq!(collect(&trie, "test/topic"), vec![1]);
        assert!(collect(&trie, "test/other").is_empty());
        assert!(collect(&trie, "test").is_empty());
    }

    #[test]
    fn test_single_wildcard() {
        let mut trie = TopicTrie::new();
        trie.insert("test/+", 1);
        trie.insert("+/topic", 2);
        trie.insert("+/+", 3);

        assert_eq!(collect(&trie, "test/topic"), vec![1, 2, 3]);
        assert!(collect(&trie, "test/topic/deep").is_empty());
        // `+` matches an empty level
        assert_eq!(collect(&trie, "test/"), vec![1, 3]);
    }

    #[test]
    fn test_multi_wildcard_matches_parent() {
        let mut trie = TopicTrie::new();
        trie.insert("#", 1);
        trie.insert("a/#", 2);

        assert_eq!(collect(&trie, "a/b/c"), vec![1, 2]);
        assert_eq!(collect(&trie, "a"), vec![1, 2]);
        assert_eq!(collect(&trie, "ab"), vec![1]);
    }

    #[test]
    fn test_empty_levels_are_significant() {
        let mut trie = TopicTrie::new();
        trie.insert("a//b", 1);
        trie.insert("a/+/b", 2);

        assert_eq!(collect(&trie, "a//b"), vec![1, 2]);
        assert_eq!(collect(&trie, "a/x/b"), vec![2]);
    }

    #[test]
    fn test_system_topics() {
        let mut trie = TopicTrie::new();
        trie.insert("#", 1);
        trie.insert("+/test", 2);
        trie.insert("$rule/#", 3);
        trie.insert("$rule/+", 4);

        assert_eq!(collect(&trie, "$rule/test"), vec![3, 4]);
        assert_eq!(collect(&trie, "x/test"), vec![1, 2]);
    }

    #[test]
    fn test_insert_replaces() {
        let mut trie = TopicTrie::new();
        assert_eq!(trie.insert("a/b", 1), None);
        assert_eq!(trie.insert("a/b", 2), Some(1));
        assert_eq!(trie.get("a/b"), Some(&2));
    }

    #[test]
    fn test_remove_prunes() {
        let mut trie = TopicTrie::new();
        trie.insert("test/topic", 1);
        trie.insert("test/+/x", 2);
        trie.insert("test/#", 3);

        assert_eq!(trie.remove("test/topic"), Some(1));
        assert_eq!(trie.remove("test/+/x"), Some(2));
        assert_eq!(trie.remove("test/#"), Some(3));
        assert_eq!(trie.remove("test/#"), None);
        assert!(trie.is_empty());
    }

    #[test]
    fn test_levels_after_multi_wildcard_address_nothing() {
        let mut trie = TopicTrie::new();
        trie.insert("#", 1);
        trie.insert("a/#", 2);

        assert_eq!(trie.get("#/x"), None);
        assert_eq!(trie.get_mut("a/#/b"), None);
        assert_eq!(trie.remove("#/x"), None);
        assert_eq!(trie.remove("a/#/b"), None);
        assert_eq!(collect(&trie, "a/b"), vec![1, 2]);
    }

    #[test]
    fn test_remove_by_predicate() {
        let mut trie = TopicTrie::new();
        trie.insert("a", vec![1, 2]);
        trie.insert("b/#", vec![2]);

        trie.remove_by_predicate(|v| {
            v.retain(|x| *x != 2);
            v.is_empty()
        });

        assert_eq!(trie.get("a"), Some(&vec![1]));
        assert_eq!(trie.get("b/#"), None);

        let mut count = 0;
        trie.for_each(|_| count += 1);
        assert_eq!(count, 1);
    }
}
