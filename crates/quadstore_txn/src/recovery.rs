//! Journal recovery at dataset open.

use crate::block::BlockStore;
use crate::error::{CoreError, CoreResult};
use crate::journal::{FrameType, Journal};
use crate::types::BlockId;
use tracing::info;

/// What a recovery pass did.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RecoveryStats {
    /// Committed sections replayed into the base state.
    pub applied_sections: usize,
    /// Frames discarded from aborted or uncommitted sections.
    pub discarded_frames: usize,
}

/// Replays the journal into the base block store.
///
/// Frames are scanned in file order. Block images accumulate until a
/// commit marker seals the section, at which point they are applied; an
/// abort marker discards the section, and a section still pending at
/// end-of-file (a crash before its marker became durable) is discarded
/// too. Afterwards the base store is synced and the journal is reset.
///
/// Runs before the coordinator exists, so applied images bypass the
/// version history.
///
/// # Errors
///
/// A checksum mismatch or truncated frame aborts recovery with an error -
/// corruption is never silently skipped.
pub fn recover(journal: &Journal, blocks: &BlockStore) -> CoreResult<RecoveryStats> {
    let mut stats = RecoveryStats::default();
    if journal.size()? == 0 {
        return Ok(stats);
    }

    let mut pending: Vec<(BlockId, Vec<u8>)> = Vec::new();
    for entry in journal.entries(0)? {
        let (offset, frame) = entry?;
        match frame.ftype {
            FrameType::Block => {
                let id = frame.block_id.ok_or_else(|| {
                    CoreError::journal_corruption(format!(
                        "block frame without a block id at offset {offset}"
                    ))
                })?;
                pending.push((id, frame.payload));
            }
            FrameType::Commit => {
                for (id, image) in pending.drain(..) {
                    blocks.recovery_apply(id, &image)?;
                }
                stats.applied_sections += 1;
            }
            FrameType::Abort => {
                stats.discarded_frames += pending.len();
                pending.clear();
            }
            FrameType::Checkpoint => {}
        }
    }
    // A section without its commit marker never happened.
    stats.discarded_frames += pending.len();

    blocks.sync()?;
    journal.truncate(0)?;
    info!(
        applied = stats.applied_sections,
        discarded = stats.discarded_frames,
        "journal recovered"
    );
    Ok(stats)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::journal::Frame;
    use crate::types::{FileRef, Version};
    use quadstore_storage::MemBackend;

    const BS: usize = 8;

    fn setup() -> (Journal, BlockStore) {
        (
            Journal::open(Box::new(MemBackend::new())).unwrap(),
            BlockStore::open(Box::new(MemBackend::new()), BS).unwrap(),
        )
    }

    fn block_frame(id: u32, fill: u8) -> Frame {
        Frame::block(FileRef::new(2), BlockId::new(id), &[fill; BS], BS).unwrap()
    }

    #[test]
    fn empty_journal_recovers_to_nothing() {
        let (journal, blocks) = setup();
        let stats = recover(&journal, &blocks).unwrap();
        assert_eq!(stats, RecoveryStats::default());
    }

    #[test]
    fn committed_section_is_applied() {
        let (journal, blocks) = setup();
        journal.write(&block_frame(0, 0xAA)).unwrap();
        journal.write(&block_frame(1, 0xBB)).unwrap();
        journal.write(&Frame::commit_marker()).unwrap();

        let stats = recover(&journal, &blocks).unwrap();
        assert_eq!(stats.applied_sections, 1);
        assert_eq!(
            blocks
                .read_at_version(BlockId::new(0), Version::ZERO)
                .unwrap(),
            Some(vec![0xAA; BS])
        );
        assert_eq!(journal.size().unwrap(), 0);
    }

    #[test]
    fn uncommitted_tail_is_discarded() {
        let (journal, blocks) = setup();
        journal.write(&block_frame(0, 0xAA)).unwrap();
        journal.write(&Frame::commit_marker()).unwrap();
        // Crash before this section's marker.
        journal.write(&block_frame(1, 0xBB)).unwrap();

        let stats = recover(&journal, &blocks).unwrap();
        assert_eq!(stats.applied_sections, 1);
        assert_eq!(stats.discarded_frames, 1);
        assert_eq!(
            blocks
                .read_at_version(BlockId::new(1), Version::ZERO)
                .unwrap(),
            None
        );
    }

    #[test]
    fn aborted_section_is_skipped() {
        let (journal, blocks) = setup();
        journal.write(&block_frame(0, 0xAA)).unwrap();
        journal.write(&Frame::abort_marker()).unwrap();
        journal.write(&block_frame(1, 0xBB)).unwrap();
        journal.write(&Frame::commit_marker()).unwrap();

        let stats = recover(&journal, &blocks).unwrap();
        assert_eq!(stats.applied_sections, 1);
        assert_eq!(stats.discarded_frames, 1);
        assert_eq!(
            blocks
                .read_at_version(BlockId::new(0), Version::ZERO)
                .unwrap(),
            None
        );
        assert_eq!(
            blocks
                .read_at_version(BlockId::new(1), Version::ZERO)
                .unwrap(),
            Some(vec![0xBB; BS])
        );
    }

    #[test]
    fn checkpoint_frames_are_inert() {
        let (journal, blocks) = setup();
        journal.write(&Frame::checkpoint_marker()).unwrap();
        journal.write(&block_frame(0, 0x11)).unwrap();
        journal.write(&Frame::commit_marker()).unwrap();

        let stats = recover(&journal, &blocks).unwrap();
        assert_eq!(stats.applied_sections, 1);
    }

    #[test]
    fn corruption_stops_recovery() {
        let (journal, _) = setup();
        journal.write(&block_frame(0, 0xAA)).unwrap();
        journal.write(&Frame::commit_marker()).unwrap();

        // Re-encode the frames with one payload byte flipped.
        let mut raw = Vec::new();
        for entry in journal.entries(0).unwrap() {
            let (_, frame) = entry.unwrap();
            raw.extend_from_slice(&frame.encode());
        }
        raw[20] ^= 0x01;

        let corrupted = Journal::open(Box::new(MemBackend::with_data(raw))).unwrap();
        let blocks = BlockStore::open(Box::new(MemBackend::new()), BS).unwrap();
        assert!(recover(&corrupted, &blocks).is_err());
    }
}
