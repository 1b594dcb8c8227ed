//! Node tree
//!
//! The output tree of a computation. Nodes live in a slotmap arena and are
//! linked as parent / first child / prev / next, so splices are O(1) and a
//! node id stays valid until the node is disposed.
//!
//! During a recomputation pass every node carries an incremental cursor: the
//! last child confirmed in this pass. Scopes drive the cursor through two
//! operations:
//!
//! - [`NodeTree::incremental_update_skip`] confirms `n` unchanged children in
//!   place.
//! - [`NodeTree::incremental_update_done`] confirms one recomputed child,
//!   splicing it after the cursor if it is new or out of order.
//!
//! Children after the cursor at the end of a pass are stale; the scope layer
//! detaches them.

use slotmap::{new_key_type, SlotMap};
use std::any::Any;
use tracing::trace;

use crate::error::{Result, RuntimeError};

new_key_type! {
    /// Unique identifier for a tree node
    pub struct NodeId;
}

/// Kind tag used to match recycled scopes with their nodes
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
pub struct NodeKind(pub u32);

impl NodeKind {
    /// Scope without a node
    pub const NONE: NodeKind = NodeKind(0);
    pub const DEFAULT: NodeKind = NodeKind(1);
}

/// Downcasting support for node contents
pub trait AsAny {
    fn as_any(&self) -> &dyn Any;
    fn as_any_mut(&mut self) -> &mut dyn Any;
}

impl<T: Any> AsAny for T {
    fn as_any(&self) -> &dyn Any {
        self
    }

    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }
}

/// Payload of a tree node.
///
/// The hooks are called while the node's own content is taken out of the
/// arena, so they receive the child content by reference and must not reach
/// back into the tree.
pub trait NodeContent: AsAny {
    fn kind(&self) -> NodeKind {
        NodeKind::DEFAULT
    }

    /// A child was spliced under this node
    fn on_child_inserted(&mut self, _child: NodeId, _content: &dyn NodeContent) {}

    /// A child was detached from this node
    fn on_child_removed(&mut self, _child: NodeId, _content: &dyn NodeContent) {}

    /// This node is being disposed
    fn on_dispose(&mut self) {}
}

impl NodeContent for () {}

struct NodeSlot {
    content: Option<Box<dyn NodeContent>>,
    kind: NodeKind,
    parent: Option<NodeId>,
    first_child: Option<NodeId>,
    prev: Option<NodeId>,
    next: Option<NodeId>,
    incremental: Option<NodeId>,
    child_count: usize,
}

/// Arena of tree nodes
pub struct NodeTree {
    nodes: SlotMap<NodeId, NodeSlot>,
}

impl NodeTree {
    pub fn new() -> Self {
        Self {
            nodes: SlotMap::with_key(),
        }
    }

    // =========================================================================
    // CREATION / ACCESS
    // =========================================================================

    /// Create a detached node
    pub fn create<N: NodeContent + 'static>(&mut self, content: N) -> NodeId {
        self.create_boxed(Box::new(content))
    }

    pub(crate) fn create_boxed(&mut self, content: Box<dyn NodeContent>) -> NodeId {
        let kind = content.kind();
        self.nodes.insert(NodeSlot {
            content: Some(content),
            kind,
            parent: None,
            first_child: None,
            prev: None,
            next: None,
            incremental: None,
            child_count: 0,
        })
    }

    pub fn contains(&self, id: NodeId) -> bool {
        self.nodes.contains_key(id)
    }

    pub fn is_disposed(&self, id: NodeId) -> bool {
        !self.contains(id)
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn kind(&self, id: NodeId) -> Option<NodeKind> {
        self.nodes.get(id).map(|slot| slot.kind)
    }

    pub fn parent(&self, id: NodeId) -> Option<NodeId> {
        self.nodes.get(id).and_then(|slot| slot.parent)
    }

    pub fn first_child(&self, id: NodeId) -> Option<NodeId> {
        self.nodes.get(id).and_then(|slot| slot.first_child)
    }

    pub fn next_sibling(&self, id: NodeId) -> Option<NodeId> {
        self.nodes.get(id).and_then(|slot| slot.next)
    }

    pub fn prev_sibling(&self, id: NodeId) -> Option<NodeId> {
        self.nodes.get(id).and_then(|slot| slot.prev)
    }

    pub fn child_count(&self, id: NodeId) -> usize {
        self.nodes.get(id).map_or(0, |slot| slot.child_count)
    }

    pub fn children(&self, id: NodeId) -> Children<'_> {
        Children {
            tree: self,
            next: self.first_child(id),
        }
    }

    /// Borrow the content of a node as its concrete type
    pub fn content<N: 'static>(&self, id: NodeId) -> Option<&N> {
        self.nodes
            .get(id)?
            .content
            .as_deref()?
            .as_any()
            .downcast_ref::<N>()
    }

    pub fn content_mut<N: 'static>(&mut self, id: NodeId) -> Option<&mut N> {
        self.nodes
            .get_mut(id)?
            .content
            .as_deref_mut()?
            .as_any_mut()
            .downcast_mut::<N>()
    }

    /// Child indices from the root down to `id`
    pub fn path(&self, id: NodeId) -> Vec<usize> {
        let mut path = Vec::new();
        let mut current = id;
        while let Some(parent) = self.parent(current) {
            let mut index = 0;
            let mut sibling = self.prev_sibling(current);
            while let Some(prev) = sibling {
                index += 1;
                sibling = self.prev_sibling(prev);
            }
            path.push(index);
            current = parent;
        }
        path.reverse();
        path
    }

    // =========================================================================
    // STRUCTURE
    // =========================================================================

    /// Remove a node from its parent without disposing it
    pub fn detach(&mut self, id: NodeId) -> Result<()> {
        if !self.contains(id) {
            return Err(RuntimeError::DisposedNode);
        }
        self.unlink(id);
        Ok(())
    }

    /// Detach a node and drop it with its whole subtree, children first.
    /// Returns the ids of every disposed node.
    pub fn dispose(&mut self, id: NodeId) -> Vec<NodeId> {
        let mut disposed = Vec::new();
        if self.contains(id) {
            self.unlink(id);
            self.dispose_subtree(id, &mut disposed);
        }
        disposed
    }

    fn dispose_subtree(&mut self, id: NodeId, disposed: &mut Vec<NodeId>) {
        let children: Vec<NodeId> = self.children(id).collect();
        for child in children {
            self.dispose_subtree(child, disposed);
        }
        if let Some(mut slot) = self.nodes.remove(id) {
            if let Some(content) = slot.content.as_mut() {
                content.on_dispose();
            }
            trace!("node disposed: {:?}", id);
            disposed.push(id);
        }
    }

    fn unlink(&mut self, id: NodeId) {
        let Some(slot) = self.nodes.get_mut(id) else {
            return;
        };
        let Some(parent) = slot.parent.take() else {
            return;
        };
        let prev = slot.prev.take();
        let next = slot.next.take();

        if let Some(next) = next.and_then(|next| self.nodes.get_mut(next)) {
            next.prev = prev;
        }
        match prev {
            Some(prev) => {
                if let Some(prev) = self.nodes.get_mut(prev) {
                    prev.next = next;
                }
            }
            None => {
                if let Some(parent) = self.nodes.get_mut(parent) {
                    parent.first_child = next;
                }
            }
        }
        if let Some(parent) = self.nodes.get_mut(parent) {
            parent.child_count -= 1;
            if parent.incremental == Some(id) {
                parent.incremental = prev;
            }
        }
        trace!("node {:?} removed from {:?}", id, parent);
        self.notify(parent, id, false);
    }

    /// Link `child` after `prev` (or first when `prev` is `None`)
    fn splice_after(&mut self, parent: NodeId, prev: Option<NodeId>, child: NodeId) {
        let next = match prev {
            Some(prev) => self.next_sibling(prev),
            None => self.first_child(parent),
        };
        if let Some(slot) = self.nodes.get_mut(child) {
            slot.parent = Some(parent);
            slot.prev = prev;
            slot.next = next;
        }
        if let Some(next) = next.and_then(|next| self.nodes.get_mut(next)) {
            next.prev = Some(child);
        }
        match prev {
            Some(prev) => {
                if let Some(prev) = self.nodes.get_mut(prev) {
                    prev.next = Some(child);
                }
            }
            None => {
                if let Some(parent) = self.nodes.get_mut(parent) {
                    parent.first_child = Some(child);
                }
            }
        }
        if let Some(parent) = self.nodes.get_mut(parent) {
            parent.child_count += 1;
        }
        trace!("node {:?} inserted into {:?}", child, parent);
        self.notify(parent, child, true);
    }

    fn notify(&mut self, parent: NodeId, child: NodeId, inserted: bool) {
        let Some(mut content) = self.nodes.get_mut(parent).and_then(|slot| slot.content.take())
        else {
            return;
        };
        if let Some(child_content) = self.nodes.get(child).and_then(|slot| slot.content.as_deref())
        {
            if inserted {
                content.on_child_inserted(child, child_content);
            } else {
                content.on_child_removed(child, child_content);
            }
        }
        if let Some(slot) = self.nodes.get_mut(parent) {
            slot.content = Some(content);
        }
    }

    // =========================================================================
    // INCREMENTAL UPDATE
    // =========================================================================

    /// Start a pass over the children of `id`
    pub fn reset_cursor(&mut self, id: NodeId) {
        if let Some(slot) = self.nodes.get_mut(id) {
            slot.incremental = None;
        }
    }

    /// Confirm `count` children after the cursor as unchanged
    pub fn incremental_update_skip(&mut self, parent: NodeId, count: usize) -> Result<()> {
        if count == 0 {
            return Err(RuntimeError::InvalidSkip(count));
        }
        let mut cursor = self
            .nodes
            .get(parent)
            .ok_or(RuntimeError::DisposedNode)?
            .incremental;
        for _ in 0..count {
            let next = match cursor {
                Some(cursor) => self.next_sibling(cursor),
                None => self.first_child(parent),
            };
            cursor = Some(next.ok_or(RuntimeError::ChildExpected)?);
        }
        if let Some(slot) = self.nodes.get_mut(parent) {
            slot.incremental = cursor;
        }
        Ok(())
    }

    /// Confirm a recomputed node. With a parent the node ends up right after
    /// the parent's cursor; without one only its own cursor is reset.
    pub fn incremental_update_done(&mut self, node: NodeId, parent: Option<NodeId>) -> Result<()> {
        let current_parent = {
            let slot = self.nodes.get_mut(node).ok_or(RuntimeError::DisposedNode)?;
            slot.incremental = None;
            slot.parent
        };
        let Some(parent) = parent else {
            return Ok(());
        };
        let prev = self
            .nodes
            .get(parent)
            .ok_or(RuntimeError::DisposedNode)?
            .incremental;
        if prev == Some(node) {
            return Ok(());
        }
        let expected = match prev {
            Some(prev) => self.next_sibling(prev),
            None => self.first_child(parent),
        };
        match current_parent {
            Some(owner) if owner != parent => return Err(RuntimeError::ForeignChild),
            Some(_) if expected == Some(node) => {}
            Some(_) => {
                self.unlink(node);
                self.splice_after(parent, prev, node);
            }
            None => self.splice_after(parent, prev, node),
        }
        if let Some(slot) = self.nodes.get_mut(parent) {
            slot.incremental = Some(node);
        }
        Ok(())
    }
}

impl Default for NodeTree {
    fn default() -> Self {
        Self::new()
    }
}

/// Iterator over the children of a node
pub struct Children<'a> {
    tree: &'a NodeTree,
    next: Option<NodeId>,
}

impl Iterator for Children<'_> {
    type Item = NodeId;

    fn next(&mut self) -> Option<NodeId> {
        let current = self.next?;
        self.next = self.tree.next_sibling(current);
        Some(current)
    }
}
