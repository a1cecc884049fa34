use crate::node::Node;

/// Ordered iterator over `(key, value)` pairs of a tree.
///
/// Keys come out in byte-lexicographic order. The iterator borrows an
/// immutable tree, so iterating the same tree again always yields the same
/// sequence.
pub struct Iter<'a, V> {
    stack: Vec<&'a Node<V>>,
}

impl<'a, V> Iter<'a, V> {
    /// Iterate the whole subtree below each of `nodes`; the last node is
    /// visited first.
    pub(crate) fn from_stack(stack: Vec<&'a Node<V>>) -> Self {
        Self { stack }
    }

    pub(crate) fn empty() -> Self {
        Self { stack: Vec::new() }
    }
}

impl<'a, V> Iterator for Iter<'a, V> {
    type Item = (&'a [u8], &'a V);

    fn next(&mut self) -> Option<Self::Item> {
        while let Some(node) = self.stack.pop() {
            self.stack
                .extend(node.children.iter().rev().map(|child| &**child));
            if let Some(leaf) = &node.leaf {
                return Some((&*leaf.key, &leaf.value));
            }
        }
        None
    }
}
