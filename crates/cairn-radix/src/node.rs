use std::sync::Arc;

use crate::watch::Watch;

/// A stored key/value pair. The full key is kept so iteration never has to
/// reassemble it from edge labels.
#[derive(Clone)]
pub(crate) struct Leaf<V> {
    pub key: Box<[u8]>,
    pub value: V,
}

/// A tree node.
///
/// `label` is the edge segment consumed from the parent; it is empty only for
/// the root. Children are sorted by the first byte of their label, and no two
/// children share a first byte.
pub(crate) struct Node<V> {
    pub label: Box<[u8]>,
    pub leaf: Option<Leaf<V>>,
    pub children: Vec<Arc<Node<V>>>,
    pub watch: Watch,
}

impl<V> Node<V> {
    pub fn root() -> Self {
        Self::with_label(&[])
    }

    pub fn with_label(label: &[u8]) -> Self {
        Self {
            label: label.into(),
            leaf: None,
            children: Vec::new(),
            watch: Watch::new(),
        }
    }

    pub fn leaf(label: &[u8], key: &[u8], value: V) -> Self {
        let mut node = Self::with_label(label);
        node.leaf = Some(Leaf {
            key: key.into(),
            value,
        });
        node
    }

    /// Position of the child whose label starts with `byte`, or the insertion
    /// point that keeps children sorted.
    pub fn find_child(&self, byte: u8) -> Result<usize, usize> {
        self.children.binary_search_by(|c| c.label[0].cmp(&byte))
    }
}

/// Copying a node gives the copy its own fresh watch: the copy is a new
/// version and must be observable independently of the original.
impl<V: Clone> Clone for Node<V> {
    fn clone(&self) -> Self {
        Self {
            label: self.label.clone(),
            leaf: self.leaf.clone(),
            children: self.children.clone(),
            watch: Watch::new(),
        }
    }
}

/// Get mutable access to a node, copying it first if it is shared.
///
/// A shared node belongs to some published version; its watch is recorded so
/// the caller can close it once the new version is visible. A node owned only
/// by the running batch was created by it and is mutated in place.
pub(crate) fn writable<'a, V: Clone>(
    node: &'a mut Arc<Node<V>>,
    watches: &mut Vec<Watch>,
) -> &'a mut Node<V> {
    if Arc::strong_count(node) > 1 {
        watches.push(node.watch.clone());
    }
    Arc::make_mut(node)
}

pub(crate) fn common_prefix(a: &[u8], b: &[u8]) -> usize {
    a.iter().zip(b).take_while(|(x, y)| x == y).count()
}
