use std::sync::Arc;

use crate::node::{common_prefix, writable, Leaf, Node};
use crate::tree::Tree;
use crate::watch::Watch;

/// A batch of mutations producing the next version of a [`Tree`].
///
/// Nodes shared with the tree the batch started from are copied on first
/// touch and their watches recorded; nodes the batch created are mutated in
/// place, so a long batch does not allocate a new path per operation.
pub struct Txn<V> {
    root: Arc<Node<V>>,
    len: usize,
    watches: Vec<Watch>,
}

impl<V> Txn<V> {
    pub(crate) fn new(root: Arc<Node<V>>, len: usize) -> Self {
        Self {
            root,
            len,
            watches: Vec::new(),
        }
    }

    /// Number of keys in the tree as modified so far.
    pub fn len(&self) -> usize {
        self.len
    }

    /// Returns `true` if the modified tree holds no keys.
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Look up a key in the modified tree.
    pub fn get(&self, key: &[u8]) -> Option<&V> {
        crate::tree::lookup(&self.root, key)
    }
}

impl<V: Clone> Txn<V> {
    /// Insert or replace a value, returning the previous one.
    pub fn insert(&mut self, key: &[u8], value: V) -> Option<V> {
        let old = insert_at(&mut self.root, key, key, value, &mut self.watches);
        if old.is_none() {
            self.len += 1;
        }
        old
    }

    /// Remove a key, returning its value if it existed.
    pub fn delete(&mut self, key: &[u8]) -> Option<V> {
        // Missing keys must not copy nodes or record watches.
        self.get(key)?;
        let old = delete_at(&mut self.root, key, &mut self.watches);
        if old.is_some() {
            self.len -= 1;
        }
        old
    }

    /// Finish the batch and close the watches of every superseded node.
    pub fn commit(self) -> Tree<V> {
        let (tree, watches) = self.commit_only();
        for watch in &watches {
            watch.close();
        }
        tree
    }

    /// Finish the batch without notifying anyone.
    ///
    /// The returned watches belong to superseded nodes; the caller closes
    /// them once the new tree has been published.
    pub fn commit_only(self) -> (Tree<V>, Vec<Watch>) {
        (Tree::from_parts(self.root, self.len), self.watches)
    }
}

fn insert_at<V: Clone>(
    node: &mut Arc<Node<V>>,
    search: &[u8],
    key: &[u8],
    value: V,
    watches: &mut Vec<Watch>,
) -> Option<V> {
    let n = writable(node, watches);
    let Some(&first) = search.first() else {
        let leaf = Leaf {
            key: key.into(),
            value,
        };
        return n.leaf.replace(leaf).map(|old| old.value);
    };

    let idx = match n.find_child(first) {
        Ok(idx) => idx,
        Err(idx) => {
            n.children.insert(idx, Arc::new(Node::leaf(search, key, value)));
            return None;
        }
    };

    let common = common_prefix(&n.children[idx].label, search);
    if common == n.children[idx].label.len() {
        return insert_at(&mut n.children[idx], &search[common..], key, value, watches);
    }

    // The new key diverges inside the child's label: split the edge.
    let mut existing = n.children.remove(idx);
    let suffix: Box<[u8]> = existing.label[common..].into();
    writable(&mut existing, watches).label = suffix;

    let mut split = Node::with_label(&search[..common]);
    let rest = &search[common..];
    if rest.is_empty() {
        split.leaf = Some(Leaf {
            key: key.into(),
            value,
        });
        split.children.push(existing);
    } else {
        let fresh = Arc::new(Node::leaf(rest, key, value));
        if existing.label[0] < rest[0] {
            split.children.extend([existing, fresh]);
        } else {
            split.children.extend([fresh, existing]);
        }
    }
    n.children.insert(idx, Arc::new(split));
    None
}

/// Remove `search` below `node`. The caller has checked the key exists.
fn delete_at<V: Clone>(
    node: &mut Arc<Node<V>>,
    search: &[u8],
    watches: &mut Vec<Watch>,
) -> Option<V> {
    let n = writable(node, watches);
    let Some(&first) = search.first() else {
        return n.leaf.take().map(|leaf| leaf.value);
    };

    let idx = n.find_child(first).ok()?;
    let label_len = n.children[idx].label.len();
    let old = delete_at(&mut n.children[idx], &search[label_len..], watches);

    // Compact the child: drop it when empty, merge it with a single child.
    let child = &n.children[idx];
    if child.leaf.is_none() {
        match child.children.len() {
            0 => {
                n.children.remove(idx);
            }
            1 => {
                let c = writable(&mut n.children[idx], watches);
                if let Some(mut grandchild) = c.children.pop() {
                    let merged: Box<[u8]> = [&c.label[..], &grandchild.label[..]].concat().into();
                    writable(&mut grandchild, watches).label = merged;
                    n.children[idx] = grandchild;
                }
            }
            _ => {}
        }
    }
    old
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn batch_tracks_len() {
        let tree = Tree::new();
        let mut txn = tree.txn();
        assert!(txn.is_empty());
        txn.insert(b"a", 1);
        txn.insert(b"b", 2);
        txn.insert(b"a", 3);
        assert_eq!(txn.len(), 2);
        assert_eq!(txn.delete(b"a"), Some(3));
        assert_eq!(txn.delete(b"a"), None);
        assert_eq!(txn.len(), 1);
        assert_eq!(txn.get(b"b"), Some(&2));
    }

    #[test]
    fn nodes_created_in_batch_are_not_recorded() {
        let tree = Tree::<u32>::new();
        let mut txn = tree.txn();
        for i in 0u32..50 {
            txn.insert(&i.to_be_bytes(), i);
        }
        let (tree, watches) = txn.commit_only();
        // Only the original empty root was shared with a published version.
        assert_eq!(watches.len(), 1);
        assert!(!tree.root_watch().is_closed());
    }

    #[test]
    fn missing_delete_records_nothing() {
        let tree: Tree<u32> = [(b"abc".as_slice(), 1)].into_iter().collect();
        let mut txn = tree.txn();
        assert_eq!(txn.delete(b"abd"), None);
        let (_, watches) = txn.commit_only();
        assert!(watches.is_empty());
    }

    #[test]
    fn commit_closes_superseded_watches() {
        let tree: Tree<u32> = [(b"abc".as_slice(), 1), (b"xyz".as_slice(), 2)]
            .into_iter()
            .collect();
        let abc = tree.prefix_watch(b"ab");
        let xyz = tree.prefix_watch(b"xy");
        let root = tree.root_watch();

        let mut txn = tree.txn();
        txn.insert(b"abd", 3);
        let next = txn.commit();

        assert!(root.is_closed());
        assert!(abc.is_closed());
        assert!(!xyz.is_closed());
        assert!(!next.root_watch().is_closed());
    }

    #[test]
    fn merging_closes_grandchild_watch() {
        let tree: Tree<u32> = [(b"ab".as_slice(), 1), (b"abcd".as_slice(), 2)]
            .into_iter()
            .collect();
        let below = tree.prefix_watch(b"abc");
        let (next, old) = tree.delete(b"ab");
        assert_eq!(old, Some(1));
        assert!(below.is_closed());
        assert_eq!(next.get(b"abcd"), Some(&2));
        assert_eq!(next.len(), 1);
    }
}
