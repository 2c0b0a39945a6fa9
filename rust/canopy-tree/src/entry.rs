/// A key/value pair as observed at some version of the tree.
///
/// `seq` is the log sequence number of the block that recorded this
/// write, which doubles as the version the write was committed at. A
/// `value` of `None` marks a deletion.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Entry {
    /// Sequence number of the block holding this entry.
    pub seq: u64,
    /// The key, ordered byte-lexicographically within the tree.
    pub key: Vec<u8>,
    /// The value, or `None` for a deletion.
    pub value: Option<Vec<u8>>,
}

impl Entry {
    /// Construct an [`Entry`].
    pub fn new(seq: u64, key: Vec<u8>, value: Option<Vec<u8>>) -> Self {
        Self { seq, key, value }
    }
}
