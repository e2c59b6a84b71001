use sha2::{Digest, Sha256};

use crate::digest::TreeDigest;

/// Result of finalizing a [`TreeHasher`]: the root digest plus the ordered
/// leaf-level digests it was combined from. Keeping the leaves around lets a
/// caller re-derive a larger tree (e.g. the whole-archive hash from per-chunk
/// leaves) without touching the bytes again.
#[derive(Debug, Clone)]
pub struct TreeHashOutput {
    pub digest: TreeDigest,
    pub leaf_digests: Vec<TreeDigest>,
}

/// Incremental tree hasher. Feed bytes in arbitrary pieces; leaves are cut at
/// fixed `leaf_size` boundaries regardless of how `update` calls line up.
pub struct TreeHasher {
    leaf_size: usize,
    leaves: Vec<TreeDigest>,
    current: Sha256,
    current_len: usize,
}

impl TreeHasher {
    pub fn new(leaf_size: usize) -> Self {
        assert!(leaf_size > 0, "leaf size must be positive");
        Self {
            leaf_size,
            leaves: Vec::new(),
            current: Sha256::new(),
            current_len: 0,
        }
    }

    pub fn update(&mut self, mut data: &[u8]) {
        while !data.is_empty() {
            let room = self.leaf_size - self.current_len;
            let take = room.min(data.len());
            self.current.update(&data[..take]);
            self.current_len += take;
            data = &data[take..];

            if self.current_len == self.leaf_size {
                self.cut_leaf();
            }
        }
    }

    pub fn finalize(mut self) -> TreeHashOutput {
        if self.current_len > 0 || self.leaves.is_empty() {
            // The final leaf may be short; an empty input hashes as one
            // empty leaf.
            self.cut_leaf();
        }
        let digest = combine(&self.leaves);
        TreeHashOutput {
            digest,
            leaf_digests: self.leaves,
        }
    }

    fn cut_leaf(&mut self) {
        let hasher = std::mem::take(&mut self.current);
        self.leaves.push(TreeDigest::from_bytes(hasher.finalize().into()));
        self.current_len = 0;
    }
}

/// Combines ordered leaf-level digests bottom-up into the root digest.
/// At each level adjacent digests are paired and the concatenation hashed;
/// an odd trailing digest is carried up unmodified.
pub fn combine(leaves: &[TreeDigest]) -> TreeDigest {
    if leaves.is_empty() {
        return TreeDigest::from_bytes(Sha256::digest([]).into());
    }

    let mut level: Vec<TreeDigest> = leaves.to_vec();
    while level.len() > 1 {
        let mut next = Vec::with_capacity(level.len().div_ceil(2));
        for pair in level.chunks(2) {
            match pair {
                [left, right] => {
                    let mut hasher = Sha256::new();
                    hasher.update(left.as_bytes());
                    hasher.update(right.as_bytes());
                    next.push(TreeDigest::from_bytes(hasher.finalize().into()));
                },
                [odd] => next.push(*odd),
                _ => unreachable!(),
            }
        }
        level = next;
    }
    level[0]
}

/// Computes the tree hash of `data` with the given leaf size.
pub fn compute(data: &[u8], leaf_size: usize) -> TreeDigest {
    let mut hasher = TreeHasher::new(leaf_size);
    hasher.update(data);
    hasher.finalize().digest
}

/// Returns the ordered leaf-level digests of `data`.
pub fn leaf_digests(data: &[u8], leaf_size: usize) -> Vec<TreeDigest> {
    let mut hasher = TreeHasher::new(leaf_size);
    hasher.update(data);
    hasher.finalize().leaf_digests
}

/// Checks `data` against an expected root digest.
pub fn verify(data: &[u8], leaf_size: usize, expected: &TreeDigest) -> bool {
    compute(data, leaf_size) == *expected
}
