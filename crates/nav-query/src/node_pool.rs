//! Node pool and open list used by the sliced A* search

use std::collections::HashMap;

use glam::Vec3;

use super::PolyRef;

/// Node flags for pathfinding state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct NodeFlags(u8);

impl NodeFlags {
    pub const OPEN: NodeFlags = NodeFlags(0x01);
    pub const CLOSED: NodeFlags = NodeFlags(0x02);

    pub fn contains(&self, flag: NodeFlags) -> bool {
        self.0 & flag.0 != 0
    }

    pub fn insert(&mut self, flag: NodeFlags) {
        self.0 |= flag.0;
    }

    pub fn remove(&mut self, flag: NodeFlags) {
        self.0 &= !flag.0;
    }
}

/// Node in the pathfinding graph
#[derive(Debug, Clone)]
pub struct Node {
    /// Position the node was entered at
    pub pos: Vec3,
    /// Cost from the start to this node
    pub cost: f32,
    /// Cost plus heuristic
    pub total: f32,
    /// Index of the parent node
    pub parent: Option<usize>,
    pub flags: NodeFlags,
    pub id: PolyRef,
}

/// Bounded node storage with lookup by polygon reference
#[derive(Debug, Clone)]
pub struct NodePool {
    nodes: Vec<Node>,
    lookup: HashMap<PolyRef, usize>,
    max_nodes: usize,
}

impl NodePool {
    pub fn new(max_nodes: usize) -> Self {
        Self {
            nodes: Vec::with_capacity(max_nodes),
            lookup: HashMap::with_capacity(max_nodes),
            max_nodes,
        }
    }

    pub fn clear(&mut self) {
        self.nodes.clear();
        self.lookup.clear();
    }

    /// Returns the index of the node for `id`, allocating one if needed.
    /// `None` when the pool is exhausted.
    pub fn get_node(&mut self, id: PolyRef) -> Option<usize> {
        if let Some(&idx) = self.lookup.get(&id) {
            return Some(idx);
        }
        if self.nodes.len() >= self.max_nodes {
            return None;
        }
        let idx = self.nodes.len();
        self.nodes.push(Node {
            pos: Vec3::ZERO,
            cost: 0.0,
            total: 0.0,
            parent: None,
            flags: NodeFlags::default(),
            id,
        });
        self.lookup.insert(id, idx);
        Some(idx)
    }

    pub fn find_node(&self, id: PolyRef) -> Option<usize> {
        self.lookup.get(&id).copied()
    }

    pub fn node(&self, idx: usize) -> &Node {
        &self.nodes[idx]
    }

    pub fn node_mut(&mut self, idx: usize) -> &mut Node {
        &mut self.nodes[idx]
    }

    pub fn nodes(&self) -> &[Node] {
        &self.nodes
    }

    pub fn node_count(&self) -> usize {
        self.nodes.len()
    }

    pub fn max_nodes(&self) -> usize {
        self.max_nodes
    }
}

/// Binary min-heap of node indices ordered by node total cost
#[derive(Debug, Clone, Default)]
pub struct NodeQueue {
    heap: Vec<usize>,
}

impl NodeQueue {
    pub fn new(capacity: usize) -> Self {
        Self {
            heap: Vec::with_capacity(capacity),
        }
    }

    pub fn clear(&mut self) {
        self.heap.clear();
    }

    pub fn is_empty(&self) -> bool {
        self.heap.is_empty()
    }

    pub fn push(&mut self, idx: usize, nodes: &[Node]) {
        self.heap.push(idx);
        self.bubble_up(self.heap.len() - 1, nodes);
    }

    pub fn pop(&mut self, nodes: &[Node]) -> Option<usize> {
        if self.heap.is_empty() {
            return None;
        }
        let top = self.heap.swap_remove(0);
        if !self.heap.is_empty() {
            self.trickle_down(0, nodes);
        }
        Some(top)
    }

    /// Restores heap order after the total of `idx` decreased
    pub fn modify(&mut self, idx: usize, nodes: &[Node]) {
        if let Some(pos) = self.heap.iter().position(|&n| n == idx) {
            self.bubble_up(pos, nodes);
        }
    }

    fn bubble_up(&mut self, mut i: usize, nodes: &[Node]) {
        while i > 0 {
            let parent = (i - 1) / 2;
            if nodes[self.heap[parent]].total <= nodes[self.heap[i]].total {
                break;
            }
            self.heap.swap(parent, i);
            i = parent;
        }
    }

    fn trickle_down(&mut self, mut i: usize, nodes: &[Node]) {
        let len = self.heap.len();
        loop {
            let left = i * 2 + 1;
            if left >= len {
                break;
            }
            let right = left + 1;
            let mut child = left;
            if right < len && nodes[self.heap[right]].total < nodes[self.heap[left]].total {
                child = right;
            }
            if nodes[self.heap[i]].total <= nodes[self.heap[child]].total {
                break;
            }
            self.heap.swap(i, child);
            i = child;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pool_reuses_and_caps() {
        let mut pool = NodePool::new(2);
        let a = pool.get_node(PolyRef::new(1));
        assert_eq!(a, Some(0));
        assert_eq!(pool.get_node(PolyRef::new(1)), Some(0));
        assert_eq!(pool.get_node(PolyRef::new(2)), Some(1));
        assert_eq!(pool.get_node(PolyRef::new(3)), None);
        assert_eq!(pool.find_node(PolyRef::new(2)), Some(1));
    }

    #[test]
    fn queue_pops_cheapest_first() {
        let mut pool = NodePool::new(8);
        let mut queue = NodeQueue::new(8);
        for (i, total) in [5.0, 1.0, 3.0, 4.0].iter().enumerate() {
            let idx = pool.get_node(PolyRef::new(i as u32 + 1)).unwrap();
            pool.node_mut(idx).total = *total;
            queue.push(idx, pool.nodes());
        }

        // Decrease a key in place.
        pool.node_mut(0).total = 0.5;
        queue.modify(0, pool.nodes());

        let mut order = Vec::new();
        while let Some(idx) = queue.pop(pool.nodes()) {
            order.push(pool.node(idx).total);
        }
        assert_eq!(order, vec![0.5, 1.0, 3.0, 4.0]);
    }
}
