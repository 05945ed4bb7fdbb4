//! Per-shard recency list.
//!
//! A doubly linked list over an arena of nodes addressed by stable indices,
//! with a sentinel head. The front is the most-recently-released end, the
//! back the least-recently-released. Splice and unlink are O(1); lookups
//! scan, which is what the cache does anyway.

/// Cache identity of one slot, owned by whichever shard's list currently
/// holds it. Moves between shards by value when a slot is stolen.
#[derive(Debug, Clone, Copy)]
pub(crate) struct Entry {
    /// Arena index of the slot this entry describes.
    pub slot: usize,
    /// Device id of the cached block.
    pub dev: u32,
    /// Block number of the cached block.
    pub blockno: u32,
    /// Number of outstanding holders; 0 means the slot is reusable.
    pub refcnt: u32,
}

#[derive(Debug)]
struct Node {
    prev: usize,
    next: usize,
    entry: Option<Entry>,
}

/// Sentinel node index. `head.next` is the front (MRU), `head.prev` the back.
const HEAD: usize = 0;

#[derive(Debug)]
pub(crate) struct RecencyList {
    nodes: Vec<Node>,
    /// Recycled node indices available for reuse.
    vacant: Vec<usize>,
    len: usize,
}

impl RecencyList {
    pub fn new() -> Self {
        Self {
            nodes: vec![Node {
                prev: HEAD,
                next: HEAD,
                entry: None,
            }],
            vacant: Vec::new(),
            len: 0,
        }
    }

    fn alloc_node(&mut self, entry: Entry) -> usize {
        if let Some(idx) = self.vacant.pop() {
            self.nodes[idx].entry = Some(entry);
            idx
        } else {
            self.nodes.push(Node {
                prev: HEAD,
                next: HEAD,
                entry: Some(entry),
            });
            self.nodes.len() - 1
        }
    }

    fn link_after(&mut self, at: usize, node: usize) {
        let next = self.nodes[at].next;
        self.nodes[node].prev = at;
        self.nodes[node].next = next;
        self.nodes[next].prev = node;
        self.nodes[at].next = node;
    }

    fn unlink(&mut self, node: usize) {
        let prev = self.nodes[node].prev;
        let next = self.nodes[node].next;
        self.nodes[prev].next = next;
        self.nodes[next].prev = prev;
    }

    /// Inserts an entry at the most-recently-used end and returns its node.
    pub fn push_front(&mut self, entry: Entry) -> usize {
        let node = self.alloc_node(entry);
        self.link_after(HEAD, node);
        self.len += 1;
        node
    }

    /// Unlinks a node and returns its entry. The node index is recycled.
    pub fn remove(&mut self, node: usize) -> Entry {
        debug_assert_ne!(node, HEAD, "cannot remove the sentinel");
        self.unlink(node);
        self.len -= 1;
        self.vacant.push(node);
        self.nodes[node].entry.take().expect("removed a vacant node")
    }

    /// Moves a linked node to the most-recently-used end.
    pub fn move_to_front(&mut self, node: usize) {
        self.unlink(node);
        self.link_after(HEAD, node);
    }

    pub fn entry(&self, node: usize) -> &Entry {
        self.nodes[node].entry.as_ref().expect("vacant node")
    }

    pub fn entry_mut(&mut self, node: usize) -> &mut Entry {
        self.nodes[node].entry.as_mut().expect("vacant node")
    }

    /// Scans front to back, returning the first node matching `pred`.
    pub fn find(&self, mut pred: impl FnMut(&Entry) -> bool) -> Option<usize> {
        let mut cur = self.nodes[HEAD].next;
        while cur != HEAD {
            if pred(self.entry(cur)) {
                return Some(cur);
            }
            cur = self.nodes[cur].next;
        }
        None
    }

    /// Scans back to front (least-recently-used first), returning the first
    /// node matching `pred`.
    pub fn rfind(&self, mut pred: impl FnMut(&Entry) -> bool) -> Option<usize> {
        let mut cur = self.nodes[HEAD].prev;
        while cur != HEAD {
            if pred(self.entry(cur)) {
                return Some(cur);
            }
            cur = self.nodes[cur].prev;
        }
        None
    }

    pub fn len(&self) -> usize {
        self.len
    }
}
