//! Physical frame allocator (§4.1).
//!
//! A bitmap of 2^20 bits, one per 4 KiB physical frame — enough to cover the
//! entire 32-bit physical address space. `start_search` is a hint, not an
//! authoritative lower bound: `put_page` only pulls it backwards, it is
//! never required to equal the true lowest free index.

use crate::error::{KernelError, KernelResult};
use crate::platform::{FrameIndex, PhysAddr};
use crate::sync::{GlobalState, IrqSpinlock};

pub const TOTAL_FRAMES: usize = 1 << 20;
const WORDS: usize = TOTAL_FRAMES / 64;

struct Bitmap {
    words: [u64; WORDS],
    start_search: usize,
    free_count: usize,
}

impl Bitmap {
    fn is_set(&self, index: usize) -> bool {
        self.words[index / 64] & (1 << (index % 64)) != 0
    }

    fn set(&mut self, index: usize) {
        self.words[index / 64] |= 1 << (index % 64);
    }

    fn clear(&mut self, index: usize) {
        self.words[index / 64] &= !(1 << (index % 64));
    }

    fn get_page(&mut self) -> Option<FrameIndex> {
        let found = (self.start_search..TOTAL_FRAMES)
            .find(|&i| !self.is_set(i))
            .or_else(|| (0..self.start_search).find(|&i| !self.is_set(i)))?;
        self.set(found);
        self.free_count -= 1;
        self.start_search = found + 1;
        Some(FrameIndex::from_raw(found as u32))
    }

    fn put_page(&mut self, frame: FrameIndex) {
        let index = frame.raw() as usize;
        if self.is_set(index) {
            self.clear(index);
            self.free_count += 1;
            if index < self.start_search {
                self.start_search = index;
            }
        }
    }
}

/// One usable physical memory region, as reported by the multiboot memory
/// map (§6).
#[derive(Debug, Clone, Copy)]
pub struct MemoryRegion {
    pub base: PhysAddr,
    pub length: u32,
    pub usable: bool,
}

static ALLOCATOR: GlobalState<IrqSpinlock<Bitmap>> = GlobalState::new();

/// Build the initial bitmap from the boot memory map: every frame outside a
/// `usable` region starts allocated. The caller is still responsible for
/// calling [`reserve`] for frames the map reports as usable but which are
/// already spoken for (kernel image, initial page tables, RAM-disk image).
pub fn init(regions: &[MemoryRegion]) {
    let mut bitmap = Bitmap {
        words: [u64::MAX; WORDS],
        start_search: 0,
        free_count: 0,
    };
    for region in regions {
        if !region.usable {
            continue;
        }
        let start = region.base.frame_index().raw() as usize;
        let frames = (region.length / crate::mm::layout::PAGE_SIZE) as usize;
        for i in start..(start + frames).min(TOTAL_FRAMES) {
            if bitmap.is_set(i) {
                bitmap.clear(i);
                bitmap.free_count += 1;
            }
        }
    }
    let _ = ALLOCATOR.init(IrqSpinlock::new(bitmap));
}

/// Mark a frame as permanently in use without associating it with a PTE
/// (kernel image, boot page tables, RAM-disk image).
pub fn reserve(frame: FrameIndex) {
    ALLOCATOR.with_mut(|lock| {
        let mut bitmap = lock.lock();
        let index = frame.raw() as usize;
        if !bitmap.is_set(index) {
            bitmap.set(index);
            bitmap.free_count -= 1;
        }
    });
}

/// Allocate one physical frame.
pub fn get_page() -> KernelResult<FrameIndex> {
    ALLOCATOR
        .with_mut(|lock| lock.lock().get_page())
        .flatten()
        .ok_or(KernelError::OutOfMemory {
            requested: crate::mm::layout::PAGE_SIZE as usize,
            available: free_frames(),
        })
}

/// Release a physical frame back to the pool.
pub fn put_page(frame: FrameIndex) {
    ALLOCATOR.with_mut(|lock| lock.lock().put_page(frame));
}

pub fn free_frames() -> usize {
    ALLOCATOR.with(|lock| lock.lock().free_count).unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fresh() -> IrqSpinlock<Bitmap> {
        IrqSpinlock::new(Bitmap {
            words: [0; WORDS],
            start_search: 0,
            free_count: TOTAL_FRAMES,
        })
    }

    #[test]
    fn get_then_put_is_pointwise_identity() {
        let bitmap = fresh();
        let before: u64 = bitmap.lock().words.iter().sum();
        let frame = bitmap.lock().get_page().unwrap();
        bitmap.lock().put_page(frame);
        let after: u64 = bitmap.lock().words.iter().sum();
        assert_eq!(before, after);
    }

    #[test]
    fn put_page_pulls_cursor_backwards() {
        let bitmap = fresh();
        let a = bitmap.lock().get_page().unwrap();
        let _b = bitmap.lock().get_page().unwrap();
        bitmap.lock().put_page(a);
        assert_eq!(bitmap.lock().start_search, a.raw() as usize);
    }

    #[test]
    fn exhaustion_reports_out_of_memory() {
        let bitmap = IrqSpinlock::new(Bitmap {
            words: [u64::MAX; WORDS],
            start_search: 0,
            free_count: 0,
        });
        assert!(bitmap.lock().get_page().is_none());
    }
}
