// Copyright (c) 2024-present, fjall-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

//! On-disk layout for a single [`super::BTree`] node cell.

use super::CAP;
use byteorder::{ByteOrder, LittleEndian};
use std::io;

const TAG_LEAF: u8 = 0;
const TAG_BRANCH: u8 = 1;

const LEAF_SIZE: usize = 1 + 2 + 8 + 8 + CAP * 16;
const BRANCH_SIZE: usize = 1 + 2 + CAP * 8 + (CAP + 1) * 8;

const BIG_TAG_LEAF: u8 = 0;
const BIG_TAG_BRANCH: u8 = 1;

const BIG_LEAF_SIZE: usize = 1 + 2 + 8 + 8 + CAP * 8;
const BIG_BRANCH_SIZE: usize = 1 + 2 + CAP * 8 + (CAP + 1) * 8;

/// Fixed cell size shared by leaf and branch nodes; whichever is larger
/// dictates the entry size registered with the backing
/// [`crate::equi_blobs_file::EquiBlobsFile`].
pub const ENTRY_SIZE: u32 = if LEAF_SIZE > BRANCH_SIZE {
    LEAF_SIZE as u32
} else {
    BRANCH_SIZE as u32
};

#[derive(Debug, Clone)]
pub struct Leaf {
    pub entries: Vec<(u64, u64)>,
    pub prev: u64,
    pub next: u64,
}

#[derive(Debug, Clone)]
pub struct Branch {
    pub keys: Vec<u64>,
    pub children: Vec<u64>,
}

#[derive(Debug, Clone)]
pub enum Node {
    Leaf(Leaf),
    Branch(Branch),
}

impl Node {
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = vec![0u8; ENTRY_SIZE as usize];

        match self {
            Node::Leaf(leaf) => {
                buf[0] = TAG_LEAF;
                LittleEndian::write_u16(&mut buf[1..3], leaf.entries.len() as u16);
                LittleEndian::write_u64(&mut buf[3..11], leaf.prev);
                LittleEndian::write_u64(&mut buf[11..19], leaf.next);

                let mut offset = 19;
                for &(k, v) in &leaf.entries {
                    LittleEndian::write_u64(&mut buf[offset..offset + 8], k);
                    LittleEndian::write_u64(&mut buf[offset + 8..offset + 16], v);
                    offset += 16;
                }
            }
            Node::Branch(branch) => {
                buf[0] = TAG_BRANCH;
                LittleEndian::write_u16(&mut buf[1..3], branch.keys.len() as u16);

                let keys_offset = 3;
                for (i, &k) in branch.keys.iter().enumerate() {
                    LittleEndian::write_u64(
                        &mut buf[keys_offset + i * 8..keys_offset + i * 8 + 8],
                        k,
                    );
                }

                let children_offset = 3 + CAP * 8;
                for (i, &c) in branch.children.iter().enumerate() {
                    LittleEndian::write_u64(
                        &mut buf[children_offset + i * 8..children_offset + i * 8 + 8],
                        c,
                    );
                }
            }
        }

        buf
    }

    pub fn decode(buf: &[u8]) -> io::Result<Self> {
        let count = LittleEndian::read_u16(&buf[1..3]) as usize;

        match buf[0] {
            TAG_LEAF => {
                let prev = LittleEndian::read_u64(&buf[3..11]);
                let next = LittleEndian::read_u64(&buf[11..19]);

                let mut entries = Vec::with_capacity(count);
                let mut offset = 19;
                for _ in 0..count {
                    let k = LittleEndian::read_u64(&buf[offset..offset + 8]);
                    let v = LittleEndian::read_u64(&buf[offset + 8..offset + 16]);
                    entries.push((k, v));
                    offset += 16;
                }

                Ok(Node::Leaf(Leaf { entries, prev, next }))
            }
            TAG_BRANCH => {
                let keys_offset = 3;
                let mut keys = Vec::with_capacity(count);
                for i in 0..count {
                    keys.push(LittleEndian::read_u64(
                        &buf[keys_offset + i * 8..keys_offset + i * 8 + 8],
                    ));
                }

                let children_offset = 3 + CAP * 8;
                let mut children = Vec::with_capacity(count + 1);
                for i in 0..=count {
                    children.push(LittleEndian::read_u64(
                        &buf[children_offset + i * 8..children_offset + i * 8 + 8],
                    ));
                }

                Ok(Node::Branch(Branch { keys, children }))
            }
            other => Err(io::Error::new(
                io::ErrorKind::InvalidData,
                format!("corrupt btree node tag {other}"),
            )),
        }
    }
}

/// Fixed cell size shared by [`BigTreeNode::Leaf`] and
/// [`BigTreeNode::Branch`]; registered as the entry size of the backing
/// [`crate::equi_blobs_file::EquiBlobsFile`] for a positional tree.
pub const BIG_TREE_NODE_ENTRY_SIZE: u32 = if BIG_LEAF_SIZE > BIG_BRANCH_SIZE {
    BIG_LEAF_SIZE as u32
} else {
    BIG_BRANCH_SIZE as u32
};

/// The node shape a `BigArray`-style positional list is built from: unlike
/// [`Node`], entries carry no explicit key, and branches separate children
/// by the number of elements held in each subtree rather than by a
/// separator key, so a position (not a key) drives descent. The core
/// provides this shape and the cumulative-offset convention only; it does
/// not implement the list itself (§4.4).
#[derive(Debug, Clone)]
pub enum BigTreeNode {
    /// Up to [`super::CAP`] values in position order, threaded with
    /// leaf-chain links for sequential traversal.
    Leaf {
        /// Values held by this leaf, in position order.
        values: Vec<u64>,
        /// Previous leaf in position order, or [`crate::equi_blobs_file::NULL_ADDRESS`].
        prev: u64,
        /// Next leaf in position order, or [`crate::equi_blobs_file::NULL_ADDRESS`].
        next: u64,
    },
    /// A branch keyed by cumulative child element counts: `child_counts[i]`
    /// is the number of elements in the subtree rooted at `children[i]`.
    /// Descending to position `p` means walking `child_counts` left to
    /// right, subtracting each count from `p` until the subtree holding
    /// position `p` is found.
    Branch {
        /// Number of elements in each child's subtree, in child order.
        child_counts: Vec<u64>,
        /// Child cell addresses, one more than `child_counts`.
        children: Vec<u64>,
    },
}

impl BigTreeNode {
    /// Total element count this node (and its subtree, for a branch) holds.
    #[must_use]
    pub fn element_count(&self) -> u64 {
        match self {
            Self::Leaf { values, .. } => values.len() as u64,
            Self::Branch { child_counts, .. } => child_counts.iter().sum(),
        }
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut buf = vec![0u8; BIG_TREE_NODE_ENTRY_SIZE as usize];

        match self {
            Self::Leaf { values, prev, next } => {
                buf[0] = BIG_TAG_LEAF;
                LittleEndian::write_u16(&mut buf[1..3], values.len() as u16);
                LittleEndian::write_u64(&mut buf[3..11], *prev);
                LittleEndian::write_u64(&mut buf[11..19], *next);

                let mut offset = 19;
                for &v in values {
                    LittleEndian::write_u64(&mut buf[offset..offset + 8], v);
                    offset += 8;
                }
            }
            Self::Branch { child_counts, children } => {
                buf[0] = BIG_TAG_BRANCH;
                LittleEndian::write_u16(&mut buf[1..3], child_counts.len() as u16);

                let counts_offset = 3;
                for (i, &c) in child_counts.iter().enumerate() {
                    LittleEndian::write_u64(
                        &mut buf[counts_offset + i * 8..counts_offset + i * 8 + 8],
                        c,
                    );
                }

                let children_offset = 3 + CAP * 8;
                for (i, &c) in children.iter().enumerate() {
                    LittleEndian::write_u64(
                        &mut buf[children_offset + i * 8..children_offset + i * 8 + 8],
                        c,
                    );
                }
            }
        }

        buf
    }

    pub fn decode(buf: &[u8]) -> io::Result<Self> {
        let count = LittleEndian::read_u16(&buf[1..3]) as usize;

        match buf[0] {
            BIG_TAG_LEAF => {
                let prev = LittleEndian::read_u64(&buf[3..11]);
                let next = LittleEndian::read_u64(&buf[11..19]);

                let mut values = Vec::with_capacity(count);
                let mut offset = 19;
                for _ in 0..count {
                    values.push(LittleEndian::read_u64(&buf[offset..offset + 8]));
                    offset += 8;
                }

                Ok(Self::Leaf { values, prev, next })
            }
            BIG_TAG_BRANCH => {
                let counts_offset = 3;
                let mut child_counts = Vec::with_capacity(count);
                for i in 0..count {
                    child_counts.push(LittleEndian::read_u64(
                        &buf[counts_offset + i * 8..counts_offset + i * 8 + 8],
                    ));
                }

                let children_offset = 3 + CAP * 8;
                let mut children = Vec::with_capacity(count + 1);
                for i in 0..=count {
                    children.push(LittleEndian::read_u64(
                        &buf[children_offset + i * 8..children_offset + i * 8 + 8],
                    ));
                }

                Ok(Self::Branch { child_counts, children })
            }
            other => Err(io::Error::new(
                io::ErrorKind::InvalidData,
                format!("corrupt big tree node tag {other}"),
            )),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_log::test;

    #[test]
    fn big_tree_leaf_roundtrips() -> io::Result<()> {
        let node = BigTreeNode::Leaf {
            values: vec![10, 20, 30],
            prev: 5,
            next: 9,
        };

        let decoded = BigTreeNode::decode(&node.encode())?;
        match decoded {
            BigTreeNode::Leaf { values, prev, next } => {
                assert_eq!(values, vec![10, 20, 30]);
                assert_eq!(prev, 5);
                assert_eq!(next, 9);
            }
            BigTreeNode::Branch { .. } => panic!("expected leaf"),
        }

        Ok(())
    }

    #[test]
    fn big_tree_branch_roundtrips() -> io::Result<()> {
        let node = BigTreeNode::Branch {
            child_counts: vec![3, 4],
            children: vec![100, 200, 300],
        };

        let decoded = BigTreeNode::decode(&node.encode())?;
        match decoded {
            BigTreeNode::Branch { child_counts, children } => {
                assert_eq!(child_counts, vec![3, 4]);
                assert_eq!(children, vec![100, 200, 300]);
            }
            BigTreeNode::Leaf { .. } => panic!("expected branch"),
        }

        Ok(())
    }

    #[test]
    fn big_tree_branch_element_count_sums_children() {
        let node = BigTreeNode::Branch {
            child_counts: vec![3, 4, 2],
            children: vec![1, 2, 3, 4],
        };
        assert_eq!(node.element_count(), 9);
    }
}
