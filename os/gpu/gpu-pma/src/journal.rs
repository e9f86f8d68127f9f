//! Undo log for multi-page bitmap transitions.

use crate::PageStatus;
use crate::region::Region;
use alloc::vec::Vec;

#[derive(Debug, Copy, Clone)]
struct Entry {
    region: usize,
    frame: u64,
    len: u64,
    prior: PageStatus,
    mask: PageStatus,
}

/// Records the prior status of every frame changed through it, so a failed
/// operation can put back the bits it wrote.
///
/// Only the planes under each change's mask are restored; bits other paths
/// set in the meantime (a frame blacklisted while the lock was released)
/// survive the rollback. Consecutive frames with the same prior status and
/// mask share one entry.
#[derive(Debug, Default)]
pub(crate) struct FrameJournal {
    entries: Vec<Entry>,
}

impl FrameJournal {
    pub fn new() -> Self {
        Self::default()
    }

    #[cfg(test)]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Writes `new` under `mask` to `len` frames of `regions[region]`,
    /// remembering what was there before.
    pub fn change(
        &mut self,
        regions: &mut [Region],
        region: usize,
        frame: u64,
        len: u64,
        new: PageStatus,
        mask: PageStatus,
    ) {
        let map = &mut regions[region].map;
        for f in frame..frame + len {
            let prior = map.read(f, true);
            match self.entries.last_mut() {
                Some(last)
                    if last.region == region
                        && last.frame + last.len == f
                        && last.prior == prior
                        && last.mask == mask =>
                {
                    last.len += 1;
                }
                _ => self.entries.push(Entry {
                    region,
                    frame: f,
                    len: 1,
                    prior,
                    mask,
                }),
            }
        }
        map.change_block_state_attrib(frame, len, new, mask);
    }

    /// Restores the masked bits of every recorded frame, newest change first.
    pub fn rollback(self, regions: &mut [Region]) {
        for entry in self.entries.into_iter().rev() {
            regions[entry.region].map.change_block_state_attrib(
                entry.frame,
                entry.len,
                entry.prior,
                entry.mask,
            );
        }
    }
}
