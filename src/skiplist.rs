use std::cmp::Ordering;
use std::ops::Bound;
use std::sync::{Arc, Weak};

use bytes::Bytes;
use parking_lot::RwLock;
use rand::Rng;

use crate::block::TRANC_ID_SIZE;
use crate::key::{KeyBytes, TRANC_ID_RANGE_BEGIN};

pub const DEFAULT_MAX_LEVEL: usize = 16;

/// One version of one key.
///
/// Forward pointers own their successors; backward pointers are weak
/// so the chain of nodes never forms an `Arc` cycle. The pointer
/// cells use locks only because nodes are shared; the memtable
/// serializes writers above this level.
struct SkipNode {
    key: Bytes,
    tranc_id: u64,
    value: RwLock<Bytes>,
    forward: Vec<RwLock<Option<Arc<SkipNode>>>>,
    backward: Vec<RwLock<Weak<SkipNode>>>,
}

impl SkipNode {
    fn new(key: Bytes, value: Bytes, tranc_id: u64, height: usize) -> Arc<Self> {
        Arc::new(Self {
            key,
            tranc_id,
            value: RwLock::new(value),
            forward: (0..height).map(|_| RwLock::new(None)).collect(),
            backward: (0..height).map(|_| RwLock::new(Weak::new())).collect(),
        })
    }

    fn height(&self) -> usize {
        self.forward.len()
    }

    /// Composite order: key ascending, tranc_id descending. A node is
    /// "before" the query when it sorts strictly less.
    fn is_before(&self, key: &[u8], tranc_id: u64) -> bool {
        match self.key.as_ref().cmp(key) {
            Ordering::Less => true,
            Ordering::Greater => false,
            Ordering::Equal => self.tranc_id > tranc_id,
        }
    }

    fn next_at(&self, level: usize) -> Option<Arc<SkipNode>> {
        self.forward[level].read().clone()
    }
}

/// Ordered in-memory index with MVCC duplicates: every `put` of a
/// distinct (key, tranc_id) pair is its own node, and the versions of
/// a key are visited newest-first.
pub struct SkipList {
    head: Arc<SkipNode>,
    max_level: usize,
    current_level: usize,
    size_bytes: usize,
}

impl Default for SkipList {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_LEVEL)
    }
}

impl SkipList {
    pub fn new(max_level: usize) -> Self {
        assert!(max_level >= 1);
        Self {
            head: SkipNode::new(Bytes::new(), Bytes::new(), 0, max_level),
            max_level,
            current_level: 1,
            size_bytes: 0,
        }
    }

    /// Coin-flip level: each extra level has probability 1/2.
    fn random_level(&self) -> usize {
        let mut rng = rand::thread_rng();
        let mut level = 1;
        while level < self.max_level && rng.gen_bool(0.5) {
            level += 1;
        }
        level
    }

    /// Descend from the top level towards the first node whose
    /// composite key is >= (key, tranc_id). `prev[l]` ends up as the
    /// last node strictly before the target at level `l`, which is
    /// exactly the splice point for an insert.
    fn find_greater_or_equal(
        &self,
        key: &[u8],
        tranc_id: u64,
    ) -> (Option<Arc<SkipNode>>, Vec<Arc<SkipNode>>) {
        let mut prev = vec![self.head.clone(); self.max_level];
        let mut cur = self.head.clone();
        let mut result = None;
        for level in (0..self.current_level).rev() {
            loop {
                let next = cur.next_at(level);
                match next {
                    Some(n) if n.is_before(key, tranc_id) => cur = n,
                    other => {
                        prev[level] = cur.clone();
                        if level == 0 {
                            result = other;
                        }
                        break;
                    }
                }
            }
        }
        (result, prev)
    }

    /// Insert or update. An existing node with the same key and the
    /// same tranc_id is overwritten in place; anything else becomes a
    /// new node spliced at a random height.
    pub fn put(&mut self, key: &[u8], value: &[u8], tranc_id: u64) {
        let (found, prev) = self.find_greater_or_equal(key, tranc_id);
        if let Some(node) = found {
            if node.key == key && node.tranc_id == tranc_id {
                let mut slot = node.value.write();
                self.size_bytes = self.size_bytes - slot.len() + value.len();
                *slot = Bytes::copy_from_slice(value);
                return;
            }
        }

        let height = self.random_level();
        let node = SkipNode::new(
            Bytes::copy_from_slice(key),
            Bytes::copy_from_slice(value),
            tranc_id,
            height,
        );
        for level in 0..height {
            if level >= self.current_level {
                *self.head.forward[level].write() = Some(node.clone());
                *node.backward[level].write() = Arc::downgrade(&self.head);
            } else {
                let next = prev[level].next_at(level);
                *node.forward[level].write() = next.clone();
                *node.backward[level].write() = Arc::downgrade(&prev[level]);
                *prev[level].forward[level].write() = Some(node.clone());
                if let Some(n) = next {
                    *n.backward[level].write() = Arc::downgrade(&node);
                }
            }
        }
        self.current_level = self.current_level.max(height);
        self.size_bytes += key.len() + value.len() + TRANC_ID_SIZE;
    }

    /// Iterator at the version of `key` visible to `tranc_id`
    /// (0 means newest). Invalid iterator on a miss.
    pub fn get(&self, key: &[u8], tranc_id: u64) -> SkipListIterator {
        let (found, _) = self.find_greater_or_equal(key, TRANC_ID_RANGE_BEGIN);
        let mut cur = found;
        if tranc_id != 0 {
            while let Some(n) = cur.clone() {
                if n.key == key && n.tranc_id > tranc_id {
                    cur = n.next_at(0);
                } else {
                    break;
                }
            }
        }
        match cur {
            Some(n) if n.key == key => SkipListIterator { current: Some(n) },
            _ => SkipListIterator { current: None },
        }
    }

    /// Physically unlink every version of `key`. The engine deletes
    /// through tombstones; this exists for direct tests of the list.
    pub fn remove(&mut self, key: &[u8]) {
        loop {
            let (found, prev) = self.find_greater_or_equal(key, TRANC_ID_RANGE_BEGIN);
            match found {
                Some(node) if node.key == key => self.unlink(node, &prev),
                _ => break,
            }
        }
    }

    fn unlink(&mut self, node: Arc<SkipNode>, prev: &[Arc<SkipNode>]) {
        for level in 0..node.height() {
            let next = node.next_at(level);
            let mut slot = prev[level].forward[level].write();
            if slot
                .as_ref()
                .map(|n| Arc::ptr_eq(n, &node))
                .unwrap_or(false)
            {
                *slot = next.clone();
                drop(slot);
                if let Some(n) = next {
                    *n.backward[level].write() = Arc::downgrade(&prev[level]);
                }
            }
        }
        self.size_bytes -= node.key.len() + node.value.read().len() + TRANC_ID_SIZE;
        while self.current_level > 1 && self.head.next_at(self.current_level - 1).is_none() {
            self.current_level -= 1;
        }
    }

    /// Drain in composite order: the exact feed an SST builder needs.
    pub fn flush(&self) -> Vec<(Bytes, Bytes, u64)> {
        let mut out = Vec::new();
        let mut cur = self.head.next_at(0);
        while let Some(n) = cur {
            out.push((n.key.clone(), n.value.read().clone(), n.tranc_id));
            cur = n.next_at(0);
        }
        out
    }

    /// All versions whose user key falls inside the bounds.
    pub fn range_entries(
        &self,
        lower: Bound<&[u8]>,
        upper: Bound<&[u8]>,
    ) -> Vec<(KeyBytes, Bytes)> {
        let mut cur = match lower {
            Bound::Included(k) => self.find_greater_or_equal(k, TRANC_ID_RANGE_BEGIN).0,
            Bound::Excluded(k) => {
                let mut c = self.find_greater_or_equal(k, TRANC_ID_RANGE_BEGIN).0;
                while let Some(n) = c.clone() {
                    if n.key == k {
                        c = n.next_at(0);
                    } else {
                        break;
                    }
                }
                c
            }
            Bound::Unbounded => self.head.next_at(0),
        };

        let mut out = Vec::new();
        while let Some(n) = cur {
            let within = match upper {
                Bound::Included(k) => n.key.as_ref() <= k,
                Bound::Excluded(k) => n.key.as_ref() < k,
                Bound::Unbounded => true,
            };
            if !within {
                break;
            }
            out.push((
                KeyBytes::from_bytes(n.key.clone(), n.tranc_id),
                n.value.read().clone(),
            ));
            cur = n.next_at(0);
        }
        out
    }

    /// Locate the contiguous region where a monotone predicate is 0:
    /// the top levels bracket any node inside the region, then level 0
    /// is walked backward to the inclusive begin and forward to the
    /// exclusive end.
    fn predicate_region(
        &self,
        predicate: &dyn Fn(&[u8]) -> i32,
    ) -> Option<(Arc<SkipNode>, Arc<SkipNode>, Option<Arc<SkipNode>>)> {
        let mut seed: Option<Arc<SkipNode>> = None;
        'levels: for level in (0..self.current_level).rev() {
            let mut cur = self.head.next_at(level);
            while let Some(n) = cur {
                match predicate(&n.key) {
                    0 => {
                        seed = Some(n);
                        break 'levels;
                    }
                    r if r > 0 => cur = n.next_at(level),
                    _ => break,
                }
            }
        }
        let seed = seed?;

        let mut first = seed.clone();
        loop {
            let prev = first.backward[0].read().upgrade();
            match prev {
                Some(p) if !Arc::ptr_eq(&p, &self.head) && predicate(&p.key) == 0 => first = p,
                _ => break,
            }
        }

        let mut last = seed;
        let mut end = last.next_at(0);
        while let Some(n) = end.clone() {
            if predicate(&n.key) == 0 {
                last = n.clone();
                end = n.next_at(0);
            } else {
                break;
            }
        }

        Some((first, last, end))
    }

    /// Half-open iterator pair over the predicate's zero region, or
    /// `None` when no key satisfies it.
    pub fn iters_monotony_predicate(
        &self,
        predicate: &dyn Fn(&[u8]) -> i32,
    ) -> Option<(SkipListIterator, SkipListIterator)> {
        let (first, _, end) = self.predicate_region(predicate)?;
        Some((
            SkipListIterator {
                current: Some(first),
            },
            SkipListIterator { current: end },
        ))
    }

    /// First and last user key matching the predicate, for scan-bound
    /// derivation.
    pub fn predicate_key_range(&self, predicate: &dyn Fn(&[u8]) -> i32) -> Option<(Bytes, Bytes)> {
        let (first, last, _) = self.predicate_region(predicate)?;
        Some((first.key.clone(), last.key.clone()))
    }

    pub fn begin(&self) -> SkipListIterator {
        SkipListIterator {
            current: self.head.next_at(0),
        }
    }

    pub fn end(&self) -> SkipListIterator {
        SkipListIterator { current: None }
    }

    /// Running byte total: key_len + val_len + 8 per version.
    pub fn get_size(&self) -> usize {
        self.size_bytes
    }

    pub fn is_empty(&self) -> bool {
        self.head.next_at(0).is_none()
    }

    pub fn clear(&mut self) {
        self.head = SkipNode::new(Bytes::new(), Bytes::new(), 0, self.max_level);
        self.current_level = 1;
        self.size_bytes = 0;
    }
}

/// Node-granular cursor over a skiplist. Holding the iterator keeps
/// its node alive; advancing follows the level-0 chain.
pub struct SkipListIterator {
    current: Option<Arc<SkipNode>>,
}

impl SkipListIterator {
    pub fn is_valid(&self) -> bool {
        self.current.is_some()
    }

    pub fn key(&self) -> &[u8] {
        self.current.as_ref().unwrap().key.as_ref()
    }

    pub fn value(&self) -> Bytes {
        self.current.as_ref().unwrap().value.read().clone()
    }

    pub fn tranc_id(&self) -> u64 {
        self.current.as_ref().unwrap().tranc_id
    }

    pub fn next(&mut self) {
        if let Some(n) = self.current.take() {
            self.current = n.next_at(0);
        }
    }
}

impl PartialEq for SkipListIterator {
    fn eq(&self, other: &Self) -> bool {
        match (&self.current, &other.current) {
            (None, None) => true,
            (Some(a), Some(b)) => Arc::ptr_eq(a, b),
            _ => false,
        }
    }
}
