use serde::{Deserialize, Serialize};
use serde_bytes::ByteBuf;

use crate::{CanopyTreeError, Entry, node::{Child, KeyRef, TreeNode}};

/// Magic string stored in the header record at sequence 0.
pub(crate) const HEADER_MAGIC: &str = "canopy-tree";

/// Protocol revision understood by this crate.
pub(crate) const PROTOCOL_VERSION: u32 = 1;

/// The format header written as record 0 of every log, before any
/// tree blocks.
#[derive(Debug, Serialize, Deserialize)]
pub(crate) struct Header {
    magic: String,
    protocol: u32,
}

impl Header {
    pub fn new() -> Self {
        Self {
            magic: HEADER_MAGIC.into(),
            protocol: PROTOCOL_VERSION,
        }
    }

    pub fn encode(&self) -> Result<Vec<u8>, CanopyTreeError> {
        serde_ipld_dagcbor::to_vec(self)
            .map_err(|error| CanopyTreeError::MalformedBlock(format!("{error}")))
    }

    /// Decode record 0 and verify that it describes a log this crate
    /// can operate on.
    pub fn decode(bytes: &[u8]) -> Result<Self, CanopyTreeError> {
        let header: Header = serde_ipld_dagcbor::from_slice(bytes).map_err(|error| {
            CanopyTreeError::MalformedBlock(format!("Could not decode header: {error}"))
        })?;
        if header.magic != HEADER_MAGIC {
            return Err(CanopyTreeError::MalformedBlock(format!(
                "Unrecognized header magic {:?}",
                header.magic
            )));
        }
        if header.protocol != PROTOCOL_VERSION {
            return Err(CanopyTreeError::MalformedBlock(format!(
                "Unsupported protocol revision {}",
                header.protocol
            )));
        }
        Ok(header)
    }
}

/// A pointer from an index node to a child node, either in this block
/// (`seq` 0 on the wire) or in an earlier one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub(crate) struct IndexChild {
    pub seq: u64,
    pub offset: u64,
}

/// The serialized form of one tree node: key references by sequence
/// number, and child pointers. Leaves have no children; internal
/// nodes have exactly one more child than keys.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub(crate) struct IndexNode {
    pub keys: Vec<u64>,
    pub children: Vec<IndexChild>,
}

#[derive(Debug, Serialize, Deserialize)]
struct WireBlock {
    key: ByteBuf,
    value: Option<ByteBuf>,
    index: Vec<IndexNode>,
}

/// One record of the log beyond the header: a single write (or
/// deletion) together with the tree nodes rewritten on its account.
///
/// The node at index offset 0 is the root of the tree as of this
/// block's version. On the wire, references with sequence number 0
/// mean "this block"; they are normalized to the block's actual
/// sequence number on decode so in-memory references are absolute.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct Block {
    pub seq: u64,
    pub key: Vec<u8>,
    pub value: Option<Vec<u8>>,
    pub index: Vec<IndexNode>,
}

impl Block {
    pub fn encode(&self) -> Result<Vec<u8>, CanopyTreeError> {
        let wire = WireBlock {
            key: ByteBuf::from(self.key.clone()),
            value: self.value.clone().map(ByteBuf::from),
            index: self.index.clone(),
        };
        serde_ipld_dagcbor::to_vec(&wire)
            .map_err(|error| CanopyTreeError::MalformedBlock(format!("{error}")))
    }

    pub fn decode(seq: u64, bytes: &[u8]) -> Result<Self, CanopyTreeError> {
        let wire: WireBlock = serde_ipld_dagcbor::from_slice(bytes).map_err(|error| {
            CanopyTreeError::MalformedBlock(format!(
                "Could not decode block at sequence {seq}: {error}"
            ))
        })?;
        for node in &wire.index {
            if !node.children.is_empty() && node.children.len() != node.keys.len() + 1 {
                return Err(CanopyTreeError::MalformedBlock(format!(
                    "Node with {} keys and {} children at sequence {seq}",
                    node.keys.len(),
                    node.children.len()
                )));
            }
        }
        Ok(Self {
            seq,
            key: wire.key.into_vec(),
            value: wire.value.map(ByteBuf::into_vec),
            index: wire.index,
        })
    }

    /// The write this block recorded.
    pub fn entry(&self) -> Entry {
        Entry::new(self.seq, self.key.clone(), self.value.clone())
    }

    /// Materialize the node stored at `offset` within this block,
    /// normalizing wire-sentinel references to absolute sequence
    /// numbers. The key this block itself introduced is resolved
    /// eagerly since its bytes are already at hand.
    pub fn node(&self, offset: u64) -> Result<TreeNode, CanopyTreeError> {
        let descriptor = self.index.get(offset as usize).ok_or_else(|| {
            CanopyTreeError::MalformedBlock(format!(
                "Index offset {offset} out of range for block at sequence {}",
                self.seq
            ))
        })?;
        let keys = descriptor
            .keys
            .iter()
            .map(|&key_seq| {
                let key_seq = if key_seq == 0 { self.seq } else { key_seq };
                if key_seq == self.seq {
                    KeyRef::with_bytes(key_seq, self.key.clone())
                } else {
                    KeyRef::new(key_seq)
                }
            })
            .collect();
        let children = descriptor
            .children
            .iter()
            .map(|child| Child::Stored {
                seq: if child.seq == 0 { self.seq } else { child.seq },
                offset: child.offset,
            })
            .collect();
        Ok(TreeNode { keys, children })
    }
}
