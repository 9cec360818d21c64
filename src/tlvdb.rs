//! An ownership-aware tree of TLV elements.
//!
//! A [`TlvDb`] owns one or more arenas of bytes and a flat list of nodes. Every node
//! refers to its value as an (arena, offset, length) triple, and to its relatives by
//! [`NodeId`], so there are no pointers into the arenas and no reference cycles:
//!
//! - A parsed tree copies the input once into an owned arena; every node aliases it.
//! - A fixed tree copies the caller's value into its own single-node arena.
//! - An external tree borrows the caller's value, which must outlive the tree.
//!
//! [`TlvDb::add`] moves another tree's arenas and nodes into this one and links its
//! top-level chain after this tree's last top-level sibling. Dropping the tree drops
//! every owned arena at once; borrowed arenas are left alone.

use crate::ber::{self, Tag, Tlv};
use crate::errors::{Error, Result};

/// Index of a node within its [`TlvDb`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct NodeId(usize);

#[derive(Debug)]
enum Arena<'a> {
    Owned(Vec<u8>),
    External(&'a [u8]),
}

impl<'a> Arena<'a> {
    fn bytes(&self) -> &[u8] {
        match self {
            Self::Owned(buf) => buf.as_slice(),
            Self::External(buf) => buf,
        }
    }
}

#[derive(Debug, Clone)]
struct Node {
    tag: Tag,
    arena: usize,
    offset: usize,
    len: usize,
    parent: Option<NodeId>,
    children: Option<NodeId>,
    next: Option<NodeId>,
}

#[derive(Debug)]
pub struct TlvDb<'a> {
    arenas: Vec<Arena<'a>>,
    nodes: Vec<Node>,
}

impl<'a> TlvDb<'a> {
    /// Parses exactly one TLV (and, if constructed, its descendants) from `buf`.
    /// Fails if anything is left over after it.
    pub fn parse(buf: &[u8]) -> Result<Self> {
        let mut db = Self::empty(Arena::Owned(buf.to_vec()));
        let (_, end) = db.parse_one(buf, 0, buf.len(), None)?;
        if end != buf.len() {
            return Err(Error::TrailingData(buf.len() - end));
        }
        Ok(db)
    }

    /// Parses every TLV in `buf`; the second and later top-level TLVs become siblings
    /// of the first.
    pub fn parse_multi(buf: &[u8]) -> Result<Self> {
        let mut db = Self::empty(Arena::Owned(buf.to_vec()));
        let (mut tail, mut pos) = db.parse_one(buf, 0, buf.len(), None)?;
        while pos < buf.len() {
            let (id, end) = db.parse_one(buf, pos, buf.len(), None)?;
            db.nodes[tail.0].next = Some(id);
            tail = id;
            pos = end;
        }
        Ok(db)
    }

    /// A single node holding a private copy of `value`.
    pub fn fixed(tag: Tag, value: &[u8]) -> Self {
        Self::single(tag, Arena::Owned(value.to_vec()))
    }

    /// A single node whose value borrows `value` without copying.
    pub fn external(tag: Tag, value: &'a [u8]) -> Self {
        Self::single(tag, Arena::External(value))
    }

    fn empty(arena: Arena<'a>) -> Self {
        Self {
            arenas: vec![arena],
            nodes: Vec::new(),
        }
    }

    fn single(tag: Tag, arena: Arena<'a>) -> Self {
        let len = arena.bytes().len();
        let mut db = Self::empty(arena);
        db.push(Node {
            tag,
            arena: 0,
            offset: 0,
            len,
            parent: None,
            children: None,
            next: None,
        });
        db
    }

    fn push_arena(&mut self, value: &[u8]) -> usize {
        self.arenas.push(Arena::Owned(value.to_vec()));
        self.arenas.len() - 1
    }

    fn push(&mut self, node: Node) -> NodeId {
        self.nodes.push(node);
        NodeId(self.nodes.len() - 1)
    }

    /// Parses one element of `data[pos..end]` into arena 0, which holds a copy of `data`.
    /// Returns the new node and the offset just past it.
    fn parse_one(
        &mut self,
        data: &[u8],
        pos: usize,
        end: usize,
        parent: Option<NodeId>,
    ) -> Result<(NodeId, usize)> {
        let (rest, (tag, len)) = ber::parse_tl(&data[pos..end])?;
        let offset = end - rest.len();
        if len > rest.len() {
            return Err(Error::LengthOverrun {
                declared: len,
                available: rest.len(),
            });
        }

        let id = self.push(Node {
            tag,
            arena: 0,
            offset,
            len,
            parent,
            children: None,
            next: None,
        });
        if ber::is_constructed(tag) && len != 0 {
            let first = self.parse_children(data, offset, offset + len, id)?;
            self.nodes[id.0].children = Some(first);
        }
        Ok((id, offset + len))
    }

    fn parse_children(
        &mut self,
        data: &[u8],
        mut pos: usize,
        end: usize,
        parent: NodeId,
    ) -> Result<NodeId> {
        let (first, next_pos) = self.parse_one(data, pos, end, Some(parent))?;
        let mut prev = first;
        pos = next_pos;
        while pos < end {
            let (id, next_pos) = self.parse_one(data, pos, end, Some(parent))?;
            self.nodes[prev.0].next = Some(id);
            prev = id;
            pos = next_pos;
        }
        Ok(first)
    }

    /// The first top-level node.
    pub fn root(&self) -> NodeId {
        NodeId(0)
    }

    /// Number of nodes, including any no longer linked into the tree (the children of an
    /// element replaced by [`change_or_add`](Self::change_or_add)).
    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn tlv(&self, id: NodeId) -> Tlv<'_> {
        let node = &self.nodes[id.0];
        Tlv {
            tag: node.tag,
            value: &self.arenas[node.arena].bytes()[node.offset..node.offset + node.len],
        }
    }

    pub fn tag(&self, id: NodeId) -> Tag {
        self.nodes[id.0].tag
    }

    pub fn next(&self, id: NodeId) -> Option<NodeId> {
        self.nodes[id.0].next
    }

    pub fn children(&self, id: NodeId) -> Option<NodeId> {
        self.nodes[id.0].children
    }

    pub fn parent(&self, id: NodeId) -> Option<NodeId> {
        self.nodes[id.0].parent
    }

    fn last_sibling(&self, mut id: NodeId) -> NodeId {
        while let Some(next) = self.nodes[id.0].next {
            id = next;
        }
        id
    }

    /// Takes ownership of `other` and appends its top-level chain after this tree's last
    /// top-level sibling. Returns the id `other`'s root now has in this tree.
    pub fn add(&mut self, other: TlvDb<'a>) -> NodeId {
        let arena_base = self.arenas.len();
        let node_base = self.nodes.len();
        let shift = |id: Option<NodeId>| id.map(|NodeId(i)| NodeId(i + node_base));

        self.arenas.extend(other.arenas);
        self.nodes.extend(other.nodes.into_iter().map(|node| Node {
            arena: node.arena + arena_base,
            parent: shift(node.parent),
            children: shift(node.children),
            next: shift(node.next),
            ..node
        }));

        let added = NodeId(node_base);
        let tail = self.last_sibling(self.root());
        self.nodes[tail.0].next = Some(added);
        added
    }

    /// Scans `from` and its following siblings (not their children) for `tag`.
    pub fn find(&self, from: NodeId, tag: Tag) -> Option<NodeId> {
        let mut cur = Some(from);
        while let Some(id) = cur {
            if self.nodes[id.0].tag == tag {
                return Some(id);
            }
            cur = self.nodes[id.0].next;
        }
        None
    }

    /// Like [`find`](Self::find), starting after `from`.
    pub fn find_next(&self, from: NodeId, tag: Tag) -> Option<NodeId> {
        self.find(self.nodes[from.0].next?, tag)
    }

    /// Depth-first search of `from`, its following siblings, and all their descendants.
    pub fn find_full(&self, from: NodeId, tag: Tag) -> Option<NodeId> {
        self.walk(from)
            .map(|(id, _)| id)
            .find(|id| self.nodes[id.0].tag == tag)
    }

    /// Finds `path[0]` among `from`'s siblings, then `path[1]` among that node's children,
    /// and so on. An empty path returns `from`.
    pub fn find_path(&self, from: NodeId, path: &[Tag]) -> Option<NodeId> {
        let mut cur = from;
        for (i, tag) in path.iter().enumerate() {
            let found = self.find(cur, *tag)?;
            if i + 1 == path.len() {
                return Some(found);
            }
            cur = self.nodes[found.0].children?;
        }
        Some(cur)
    }

    /// The node after `id` in a flattened pre-order walk: its first child, else its next
    /// sibling, else the next sibling of the closest ancestor that has one.
    fn next_preorder(&self, id: NodeId) -> Option<NodeId> {
        if let Some(child) = self.nodes[id.0].children {
            return Some(child);
        }
        let mut cur = Some(id);
        while let Some(id) = cur {
            if let Some(next) = self.nodes[id.0].next {
                return Some(next);
            }
            cur = self.nodes[id.0].parent;
        }
        None
    }

    /// Finds `tag` anywhere in the tree. Pass the previous match as `prev` to continue
    /// from just after it, which iterates over repeated tags.
    pub fn get(&self, tag: Tag, prev: Option<NodeId>) -> Option<NodeId> {
        self.get_from(self.root(), tag, prev)
    }

    /// Like [`get`](Self::get), with the walk starting at `start`.
    pub fn get_from(&self, start: NodeId, tag: Tag, prev: Option<NodeId>) -> Option<NodeId> {
        let mut cur = match prev {
            Some(prev) => self.next_preorder(prev),
            None => Some(start),
        };
        while let Some(id) = cur {
            if self.nodes[id.0].tag == tag {
                return Some(id);
            }
            cur = self.next_preorder(id);
        }
        None
    }

    /// Like [`get_from`](Self::get_from), starting at `node`'s first child.
    pub fn get_inchild(&self, node: NodeId, tag: Tag, prev: Option<NodeId>) -> Option<NodeId> {
        self.get_from(self.nodes[node.0].children?, tag, prev)
    }

    /// Shorthand for the first element with `tag` anywhere in the tree.
    pub fn get_tlv(&self, tag: Tag) -> Option<Tlv<'_>> {
        self.get(tag, None).map(|id| self.tlv(id))
    }

    /// Pre-order walk over `from`, its following siblings and all their descendants,
    /// yielding each node with its depth relative to `from`.
    pub fn walk(&self, from: NodeId) -> Walk<'_, 'a> {
        Walk {
            db: self,
            stack: vec![(from, 0)],
        }
    }

    /// Calls `f(tlv, level, is_leaf)` for every node [`walk`](Self::walk) reaches.
    pub fn visit<F>(&self, from: NodeId, mut f: F)
    where
        F: FnMut(Tlv<'_>, usize, bool),
    {
        for (id, level) in self.walk(from) {
            f(self.tlv(id), level, self.nodes[id.0].children.is_none());
        }
    }

    /// Replaces the value of the first `tag` in the tree (dropping its children), or appends
    /// a new fixed element if there is none. Does nothing if the value is already equal.
    ///
    /// A value the element has to itself is overwritten in place, so repeated updates don't
    /// grow the tree. Dropped children keep their slots until the tree is dropped.
    pub fn change_or_add(&mut self, tag: Tag, value: &[u8]) -> NodeId {
        let Some(id) = self.find_full(self.root(), tag) else {
            return self.add(TlvDb::fixed(tag, value));
        };
        if self.tlv(id).value == value {
            return id;
        }

        let arena = self.nodes[id.0].arena;
        let sole_user = self.nodes.iter().filter(|node| node.arena == arena).count() == 1;
        let reused = match &mut self.arenas[arena] {
            Arena::Owned(buf) if sole_user => {
                buf.clear();
                buf.extend_from_slice(value);
                true
            }
            _ => false,
        };
        if !reused {
            self.nodes[id.0].arena = self.push_arena(value);
        }
        let node = &mut self.nodes[id.0];
        node.offset = 0;
        node.len = value.len();
        node.children = None;
        id
    }
}

/// Iterator returned by [`TlvDb::walk`].
pub struct Walk<'d, 'a> {
    db: &'d TlvDb<'a>,
    stack: Vec<(NodeId, usize)>,
}

impl<'d, 'a> Iterator for Walk<'d, 'a> {
    type Item = (NodeId, usize);

    fn next(&mut self) -> Option<Self::Item> {
        let (id, level) = self.stack.pop()?;
        let node = &self.db.nodes[id.0];
        if let Some(next) = node.next {
            self.stack.push((next, level));
        }
        if let Some(child) = node.children {
            self.stack.push((child, level + 1));
        }
        Some((id, level))
    }
}
