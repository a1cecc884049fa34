use std::cmp::Ordering;
use std::fmt;
use std::sync::Arc;

use crate::iter::Iter;
use crate::node::Node;
use crate::txn::Txn;
use crate::watch::Watch;

/// A published, immutable version of a radix tree.
///
/// Cloning is O(1): clones share the root. Mutations ([`Tree::insert`],
/// [`Tree::delete`], or a [`Txn`]) leave `self` untouched and return a new
/// version that shares every subtree off the modified path.
pub struct Tree<V> {
    root: Arc<Node<V>>,
    len: usize,
}

impl<V> Tree<V> {
    /// Create an empty tree.
    pub fn new() -> Self {
        Self {
            root: Arc::new(Node::root()),
            len: 0,
        }
    }

    pub(crate) fn from_parts(root: Arc<Node<V>>, len: usize) -> Self {
        Self { root, len }
    }

    /// Number of keys in the tree.
    pub fn len(&self) -> usize {
        self.len
    }

    /// Returns `true` if the tree holds no keys.
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Look up the value stored under `key`.
    pub fn get(&self, key: &[u8]) -> Option<&V> {
        lookup(&self.root, key)
    }

    /// Iterate every entry in key order.
    pub fn iter(&self) -> Iter<'_, V> {
        Iter::from_stack(vec![&*self.root])
    }

    /// Iterate the entries whose key starts with `prefix`, in key order.
    pub fn prefix(&self, prefix: &[u8]) -> Iter<'_, V> {
        match self.seek_prefix(prefix) {
            (Some(node), _) => Iter::from_stack(vec![node]),
            (None, _) => Iter::empty(),
        }
    }

    /// Iterate the entries whose key is greater than or equal to `key`, in
    /// key order.
    pub fn lower_bound(&self, key: &[u8]) -> Iter<'_, V> {
        let mut stack = Vec::new();
        let mut node = &*self.root;
        let mut search = key;
        loop {
            let Some(&first) = search.first() else {
                // Everything below this node has `key` as a prefix.
                stack.push(node);
                break;
            };
            // The node's own leaf is a proper prefix of `key` and sorts
            // before it. Children starting with a larger byte sort after.
            let larger = node.children.partition_point(|c| c.label[0] <= first);
            stack.extend(node.children[larger..].iter().rev().map(|c| &**c));

            let Ok(idx) = node.find_child(first) else {
                break;
            };
            let child = &*node.children[idx];
            let n = child.label.len().min(search.len());
            match child.label[..n].cmp(&search[..n]) {
                Ordering::Less => break,
                Ordering::Greater => {
                    stack.push(child);
                    break;
                }
                Ordering::Equal if child.label.len() > search.len() => {
                    stack.push(child);
                    break;
                }
                Ordering::Equal => {
                    search = &search[child.label.len()..];
                    node = child;
                }
            }
        }
        Iter::from_stack(stack)
    }

    /// Watch closed when anything in the tree changes.
    pub fn root_watch(&self) -> Watch {
        self.root.watch.clone()
    }

    /// Watch closed when any key starting with `prefix` is inserted, replaced
    /// or removed.
    ///
    /// This is the watch of the node covering the prefix, or of the deepest
    /// node on the way to it when no key has the prefix yet.
    pub fn prefix_watch(&self, prefix: &[u8]) -> Watch {
        let (covering, deepest) = self.seek_prefix(prefix);
        covering.unwrap_or(deepest).watch.clone()
    }

    /// Returns `true` if both trees are the same version.
    pub fn ptr_eq(&self, other: &Tree<V>) -> bool {
        Arc::ptr_eq(&self.root, &other.root)
    }

    /// Find the node whose subtree holds exactly the keys starting with
    /// `prefix`, together with the deepest node visited.
    fn seek_prefix(&self, prefix: &[u8]) -> (Option<&Node<V>>, &Node<V>) {
        let mut node = &*self.root;
        let mut search = prefix;
        loop {
            let Some(&first) = search.first() else {
                return (Some(node), node);
            };
            let Ok(idx) = node.find_child(first) else {
                return (None, node);
            };
            let child = &*node.children[idx];
            if let Some(rest) = search.strip_prefix(&*child.label) {
                search = rest;
                node = child;
            } else if child.label.starts_with(search) {
                return (Some(child), child);
            } else {
                return (None, node);
            }
        }
    }
}

impl<V: Clone> Tree<V> {
    /// Start a batch of mutations on top of this version.
    pub fn txn(&self) -> Txn<V> {
        self.clone().into_txn()
    }

    /// Start a batch of mutations, giving up this handle.
    ///
    /// When this was the last handle on the version, the batch can reuse its
    /// nodes instead of copying them.
    pub fn into_txn(self) -> Txn<V> {
        Txn::new(self.root, self.len)
    }

    /// Return a new version with `key` set to `value`, and the value it
    /// replaced.
    pub fn insert(&self, key: &[u8], value: V) -> (Tree<V>, Option<V>) {
        let mut txn = self.txn();
        let old = txn.insert(key, value);
        (txn.commit(), old)
    }

    /// Return a new version without `key`, and the removed value. `None`
    /// means the key did not exist and the returned tree is this version.
    pub fn delete(&self, key: &[u8]) -> (Tree<V>, Option<V>) {
        let mut txn = self.txn();
        match txn.delete(key) {
            Some(old) => (txn.commit(), Some(old)),
            None => (self.clone(), None),
        }
    }
}

pub(crate) fn lookup<'a, V>(root: &'a Node<V>, key: &[u8]) -> Option<&'a V> {
    let mut node = root;
    let mut search = key;
    loop {
        let Some(&first) = search.first() else {
            return node.leaf.as_ref().map(|leaf| &leaf.value);
        };
        let idx = node.find_child(first).ok()?;
        let child = &*node.children[idx];
        search = search.strip_prefix(&*child.label)?;
        node = child;
    }
}

impl<V> Clone for Tree<V> {
    fn clone(&self) -> Self {
        Self {
            root: Arc::clone(&self.root),
            len: self.len,
        }
    }
}

impl<V> Default for Tree<V> {
    fn default() -> Self {
        Self::new()
    }
}

impl<V> fmt::Debug for Tree<V> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Tree").field("len", &self.len).finish()
    }
}

impl<K: AsRef<[u8]>, V: Clone> FromIterator<(K, V)> for Tree<V> {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        let mut txn = Tree::new().into_txn();
        for (key, value) in iter {
            txn.insert(key.as_ref(), value);
        }
        txn.commit()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use std::collections::BTreeMap;

    fn keys<V>(iter: Iter<'_, V>) -> Vec<Vec<u8>> {
        iter.map(|(k, _)| k.to_vec()).collect()
    }

    fn sample() -> Tree<u32> {
        [
            "alpha", "alpine", "al", "beta", "bet", "gamma", "", "a", "alphabet",
        ]
        .into_iter()
        .enumerate()
        .map(|(i, k)| (k, i as u32))
        .collect()
    }

    // -----------------------------------------------------------------------
    // Point operations
    // -----------------------------------------------------------------------

    #[test]
    fn get_finds_every_inserted_key() {
        let tree = sample();
        assert_eq!(tree.len(), 9);
        assert_eq!(tree.get(b"alpha"), Some(&0));
        assert_eq!(tree.get(b"al"), Some(&2));
        assert_eq!(tree.get(b""), Some(&6));
        assert_eq!(tree.get(b"alphabet"), Some(&8));
        assert_eq!(tree.get(b"alp"), None);
        assert_eq!(tree.get(b"alphabets"), None);
        assert_eq!(tree.get(b"zeta"), None);
    }

    #[test]
    fn insert_returns_previous_value() {
        let tree = sample();
        let (next, old) = tree.insert(b"beta", 100);
        assert_eq!(old, Some(3));
        assert_eq!(next.get(b"beta"), Some(&100));
        assert_eq!(next.len(), tree.len());
        assert_eq!(tree.get(b"beta"), Some(&3));
    }

    #[test]
    fn delete_reports_existence() {
        let tree = sample();
        let (next, old) = tree.delete(b"alp");
        assert_eq!(old, None);
        assert!(next.ptr_eq(&tree));

        let (next, old) = tree.delete(b"alpha");
        assert_eq!(old, Some(0));
        assert_eq!(next.len(), tree.len() - 1);
        assert_eq!(next.get(b"alpha"), None);
        assert_eq!(next.get(b"alphabet"), Some(&8));
        assert_eq!(next.get(b"alpine"), Some(&1));
    }

    #[test]
    fn deleting_everything_leaves_empty_tree() {
        let tree = sample();
        let mut txn = tree.txn();
        for key in keys(tree.iter()) {
            assert!(txn.delete(&key).is_some());
        }
        let empty = txn.commit();
        assert!(empty.is_empty());
        assert_eq!(empty.iter().count(), 0);
        assert!(empty.root.children.is_empty());
    }

    // -----------------------------------------------------------------------
    // Iteration
    // -----------------------------------------------------------------------

    #[test]
    fn iteration_is_sorted() {
        let tree = sample();
        let got = keys(tree.iter());
        let mut want = got.clone();
        want.sort();
        assert_eq!(got, want);
        assert_eq!(got.len(), 9);
    }

    #[test]
    fn prefix_iteration() {
        let tree = sample();
        let got: Vec<_> = keys(tree.prefix(b"alp"));
        assert_eq!(
            got,
            vec![b"alpha".to_vec(), b"alphabet".to_vec(), b"alpine".to_vec()]
        );
        assert_eq!(keys(tree.prefix(b"alphab")), vec![b"alphabet".to_vec()]);
        assert_eq!(keys(tree.prefix(b"b")).len(), 2);
        assert_eq!(keys(tree.prefix(b"")).len(), 9);
        assert!(keys(tree.prefix(b"alq")).is_empty());
        assert!(keys(tree.prefix(b"zz")).is_empty());
    }

    #[test]
    fn lower_bound_iteration() {
        let tree = sample();
        assert_eq!(
            keys(tree.lower_bound(b"alpi")),
            vec![
                b"alpine".to_vec(),
                b"bet".to_vec(),
                b"beta".to_vec(),
                b"gamma".to_vec()
            ]
        );
        assert_eq!(keys(tree.lower_bound(b"")).len(), 9);
        assert_eq!(keys(tree.lower_bound(b"beta")).len(), 2);
        assert!(keys(tree.lower_bound(b"h")).is_empty());
    }

    #[test]
    fn lower_bound_on_big_endian_numbers() {
        let tree: Tree<u64> = (0u64..300).map(|i| (i.to_be_bytes(), i)).collect();
        let got: Vec<u64> = tree.lower_bound(&250u64.to_be_bytes()).map(|(_, v)| *v).collect();
        assert_eq!(got, (250..300).collect::<Vec<_>>());
    }

    #[test]
    fn iteration_is_restartable() {
        let tree = sample();
        let first = keys(tree.iter());
        let _ = tree.insert(b"zzz", 1);
        assert_eq!(keys(tree.iter()), first);
    }

    // -----------------------------------------------------------------------
    // Structural sharing
    // -----------------------------------------------------------------------

    #[test]
    fn insert_shares_untouched_subtrees() {
        let tree = sample();
        let (next, _) = tree.insert(b"alpaca", 42);

        let b_old = &tree.root.children[tree.root.find_child(b'b').unwrap()];
        let b_new = &next.root.children[next.root.find_child(b'b').unwrap()];
        assert!(Arc::ptr_eq(b_old, b_new));

        let a_old = &tree.root.children[tree.root.find_child(b'a').unwrap()];
        let a_new = &next.root.children[next.root.find_child(b'a').unwrap()];
        assert!(!Arc::ptr_eq(a_old, a_new));
        assert_eq!(tree.get(b"alpaca"), None);
    }

    #[test]
    fn old_version_survives_batch() {
        let tree = sample();
        let before: Vec<_> = tree.iter().map(|(k, v)| (k.to_vec(), *v)).collect();
        let mut txn = tree.txn();
        txn.insert(b"alpha", 1000);
        txn.delete(b"beta");
        txn.insert(b"delta", 7);
        let _next = txn.commit();
        let after: Vec<_> = tree.iter().map(|(k, v)| (k.to_vec(), *v)).collect();
        assert_eq!(before, after);
    }

    // -----------------------------------------------------------------------
    // Watches
    // -----------------------------------------------------------------------

    #[test]
    fn prefix_watch_without_match_uses_deepest_node() {
        let tree = sample();
        // "betz" has no keys; the deepest node on the way is "bet".
        let w = tree.prefix_watch(b"betz");
        let _ = tree.insert(b"gamma-ray", 1);
        assert!(!w.is_closed());
        let _ = tree.insert(b"betz1", 1);
        assert!(w.is_closed());
    }

    // -----------------------------------------------------------------------
    // Model check against BTreeMap
    // -----------------------------------------------------------------------

    #[derive(Clone, Debug)]
    enum Op {
        Insert(Vec<u8>, u32),
        Delete(Vec<u8>),
    }

    fn op() -> impl Strategy<Value = Op> {
        let key = prop::collection::vec(0u8..4, 0..6);
        prop_oneof![
            (key.clone(), any::<u32>()).prop_map(|(k, v)| Op::Insert(k, v)),
            key.prop_map(Op::Delete),
        ]
    }

    proptest! {
        #[test]
        fn behaves_like_btreemap(
            ops in prop::collection::vec(op(), 0..200),
            probe in prop::collection::vec(0u8..4, 0..6),
        ) {
            let mut model = BTreeMap::new();
            let mut tree = Tree::new();
            let mut versions = Vec::new();

            for op in ops {
                versions.push((tree.clone(), model.clone()));
                match op {
                    Op::Insert(k, v) => {
                        let (next, old) = tree.insert(&k, v);
                        prop_assert_eq!(old, model.insert(k, v));
                        tree = next;
                    }
                    Op::Delete(k) => {
                        let (next, old) = tree.delete(&k);
                        prop_assert_eq!(old, model.remove(&k));
                        tree = next;
                    }
                }
                prop_assert_eq!(tree.len(), model.len());
            }

            let got: Vec<_> = tree.iter().map(|(k, v)| (k.to_vec(), *v)).collect();
            let want: Vec<_> = model.iter().map(|(k, v)| (k.clone(), *v)).collect();
            prop_assert_eq!(got, want);

            let got: Vec<_> = tree.prefix(&probe).map(|(k, _)| k.to_vec()).collect();
            let want: Vec<_> = model.keys().filter(|k| k.starts_with(&probe)).cloned().collect();
            prop_assert_eq!(got, want);

            let got: Vec<_> = tree.lower_bound(&probe).map(|(k, _)| k.to_vec()).collect();
            let want: Vec<_> = model.range(probe.clone()..).map(|(k, _)| k.clone()).collect();
            prop_assert_eq!(got, want);

            // Every earlier version still reads exactly as it did.
            for (old_tree, old_model) in versions {
                let got: Vec<_> = old_tree.iter().map(|(k, v)| (k.to_vec(), *v)).collect();
                let want: Vec<_> = old_model.into_iter().collect();
                prop_assert_eq!(got, want);
            }
        }
    }
}
