//! Journal frame types and serialization.

use crate::error::{CoreError, CoreResult};
use crate::types::{BlockId, FileRef};

/// Size of the fixed frame header:
/// type (4) + payload capacity (4) + file ref (4) + block id (4).
pub const FRAME_HEADER_SIZE: usize = 16;

/// Size of the trailing checksum.
pub(crate) const CHECKSUM_SIZE: usize = 4;

/// Encoding of "no block id" in the header.
const NO_BLOCK: u32 = u32::MAX;

/// Type of a journal frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum FrameType {
    /// Image of one block of a storage component.
    Block = 1,
    /// Commit marker: the durable linearization point of a transaction.
    Commit = 2,
    /// Abort marker: the preceding section must be discarded on replay.
    Abort = 3,
    /// Checkpoint marker: no replay effect.
    Checkpoint = 4,
}

impl FrameType {
    /// Converts a wire value to a frame type.
    pub fn from_u32(v: u32) -> Option<Self> {
        match v {
            1 => Some(Self::Block),
            2 => Some(Self::Commit),
            3 => Some(Self::Abort),
            4 => Some(Self::Checkpoint),
            _ => None,
        }
    }

    /// Converts the frame type to its wire value.
    #[must_use]
    pub const fn as_u32(self) -> u32 {
        self as u32
    }

    /// Whether frames of this type carry a payload.
    #[must_use]
    pub const fn has_payload(self) -> bool {
        matches!(self, Self::Block)
    }
}

/// One record in the journal: a block image or a control marker.
///
/// `payload` always holds the full allocated capacity; for control frames
/// it is empty.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    /// Frame type.
    pub ftype: FrameType,
    /// Storage component the payload belongs to.
    pub file_ref: FileRef,
    /// Block the payload is an image of, if any.
    pub block_id: Option<BlockId>,
    /// Payload bytes at full capacity (empty for control frames).
    pub payload: Vec<u8>,
}

impl Frame {
    /// Creates a block-image frame.
    ///
    /// `bytes` is the logical content; it is zero-padded to `capacity`
    /// before checksumming and writing.
    ///
    /// # Errors
    ///
    /// Returns an error if `bytes` is longer than `capacity`.
    pub fn block(
        file_ref: FileRef,
        block_id: BlockId,
        bytes: &[u8],
        capacity: usize,
    ) -> CoreResult<Self> {
        if bytes.len() > capacity {
            return Err(CoreError::invalid_operation(format!(
                "block image of {} bytes exceeds capacity {}",
                bytes.len(),
                capacity
            )));
        }
        let mut payload = vec![0u8; capacity];
        payload[..bytes.len()].copy_from_slice(bytes);
        Ok(Self {
            ftype: FrameType::Block,
            file_ref,
            block_id: Some(block_id),
            payload,
        })
    }

    /// Creates the payload-less commit marker.
    #[must_use]
    pub fn commit_marker() -> Self {
        Self::control(FrameType::Commit)
    }

    /// Creates a payload-less abort marker.
    #[must_use]
    pub fn abort_marker() -> Self {
        Self::control(FrameType::Abort)
    }

    /// Creates a payload-less checkpoint marker.
    #[must_use]
    pub fn checkpoint_marker() -> Self {
        Self::control(FrameType::Checkpoint)
    }

    fn control(ftype: FrameType) -> Self {
        Self {
            ftype,
            file_ref: FileRef::JOURNAL,
            block_id: None,
            payload: Vec::new(),
        }
    }

    /// Total on-disk extent of this frame: header + payload + checksum.
    #[must_use]
    pub fn extent(&self) -> u64 {
        (FRAME_HEADER_SIZE + self.payload.len() + CHECKSUM_SIZE) as u64
    }

    /// Serializes the frame, checksum included.
    #[must_use]
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(self.extent() as usize);
        buf.extend_from_slice(&self.ftype.as_u32().to_be_bytes());
        buf.extend_from_slice(&(self.payload.len() as u32).to_be_bytes());
        buf.extend_from_slice(&self.file_ref.as_u32().to_be_bytes());
        let block = self.block_id.map_or(NO_BLOCK, BlockId::as_u32);
        buf.extend_from_slice(&block.to_be_bytes());
        buf.extend_from_slice(&self.payload);
        let crc = checksum(&buf);
        buf.extend_from_slice(&crc.to_be_bytes());
        buf
    }

    /// Deserializes a frame from `header` and `rest`, where `rest` holds
    /// the payload (at the capacity declared in the header) followed by
    /// the stored checksum.
    ///
    /// # Errors
    ///
    /// Returns a corruption error for an unknown type and a checksum
    /// mismatch error if the recomputed checksum disagrees.
    pub fn decode(header: &[u8; FRAME_HEADER_SIZE], rest: &[u8]) -> CoreResult<Self> {
        let ftype_raw = u32::from_be_bytes([header[0], header[1], header[2], header[3]]);
        let capacity = u32::from_be_bytes([header[4], header[5], header[6], header[7]]) as usize;
        let file_ref = u32::from_be_bytes([header[8], header[9], header[10], header[11]]);
        let block = u32::from_be_bytes([header[12], header[13], header[14], header[15]]);

        let ftype = FrameType::from_u32(ftype_raw).ok_or_else(|| {
            CoreError::journal_corruption(format!("unknown frame type {ftype_raw}"))
        })?;
        if rest.len() != capacity + CHECKSUM_SIZE {
            return Err(CoreError::journal_corruption(format!(
                "frame body of {} bytes, expected {}",
                rest.len(),
                capacity + CHECKSUM_SIZE
            )));
        }
        let payload = &rest[..capacity];
        let stored = u32::from_be_bytes([
            rest[capacity],
            rest[capacity + 1],
            rest[capacity + 2],
            rest[capacity + 3],
        ]);

        let mut hasher = crc32fast::Hasher::new();
        hasher.update(header);
        hasher.update(payload);
        let actual = hasher.finalize();
        if actual != stored {
            return Err(CoreError::ChecksumMismatch {
                expected: stored,
                actual,
            });
        }

        Ok(Self {
            ftype,
            file_ref: FileRef::new(file_ref),
            block_id: (block != NO_BLOCK).then_some(BlockId::new(block)),
            payload: payload.to_vec(),
        })
    }
}

/// CRC-32 over header bytes followed by the full (padded) payload.
fn checksum(data: &[u8]) -> u32 {
    crc32fast::hash(data)
}
