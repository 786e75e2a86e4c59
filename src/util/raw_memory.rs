use crate::util::constants::*;
use crate::util::Address;
use std::ops::Range;
use std::sync::atomic::{AtomicUsize, Ordering};

/// A contiguous, word-addressable region of the managed heap.
///
/// Every word is an `AtomicUsize`, so mutators and collector threads can
/// share a region without `unsafe`. The region is identified by a virtual
/// base address; `Address` values inside `[start, end)` map to word indices.
/// Memory is zero-initialized, which means every fresh reference field reads
/// as null.
pub struct RawMemory {
    start: Address,
    words: Box<[AtomicUsize]>,
}

impl RawMemory {
    /// Create a zeroed region of `bytes` (rounded up to words) starting at `start`.
    pub fn new(start: Address, bytes: usize) -> Self {
        debug_assert!(start.is_aligned_to(BYTES_IN_WORD));
        let n = crate::util::conversions::bytes_to_words_up(bytes);
        let words: Box<[AtomicUsize]> = (0..n).map(|_| AtomicUsize::new(0)).collect();
        RawMemory { start, words }
    }

    pub fn start(&self) -> Address {
        self.start
    }

    pub fn end(&self) -> Address {
        self.start + self.words.len() * BYTES_IN_WORD
    }

    pub fn bytes(&self) -> usize {
        self.words.len() * BYTES_IN_WORD
    }

    pub fn contains(&self, addr: Address) -> bool {
        addr >= self.start && addr < self.end()
    }

    #[inline(always)]
    fn index(&self, addr: Address) -> usize {
        debug_assert!(
            self.contains(addr),
            "{} is outside of [{}, {})",
            addr,
            self.start,
            self.end()
        );
        debug_assert!(addr.is_aligned_to(BYTES_IN_WORD));
        (addr - self.start) >> LOG_BYTES_IN_WORD
    }

    #[inline(always)]
    pub fn load(&self, addr: Address, order: Ordering) -> usize {
        self.words[self.index(addr)].load(order)
    }

    #[inline(always)]
    pub fn store(&self, addr: Address, value: usize, order: Ordering) {
        self.words[self.index(addr)].store(value, order)
    }

    #[inline(always)]
    pub fn fetch_or(&self, addr: Address, bits: usize, order: Ordering) -> usize {
        self.words[self.index(addr)].fetch_or(bits, order)
    }

    #[inline(always)]
    pub fn fetch_and(&self, addr: Address, bits: usize, order: Ordering) -> usize {
        self.words[self.index(addr)].fetch_and(bits, order)
    }

    #[inline(always)]
    pub fn compare_exchange(
        &self,
        addr: Address,
        current: usize,
        new: usize,
        success: Ordering,
        failure: Ordering,
    ) -> Result<usize, usize> {
        self.words[self.index(addr)].compare_exchange(current, new, success, failure)
    }

    /// Zero every word in the range.
    pub fn zero(&self, range: Range<Address>) {
        if range.start >= range.end {
            return;
        }
        let from = self.index(range.start);
        let to = from + ((range.end - range.start) >> LOG_BYTES_IN_WORD);
        for word in &self.words[from..to] {
            word.store(0, Ordering::Relaxed);
        }
    }

    /// Copy `words` words from `from` to `to` within this region. The copy runs
    /// in ascending order, so it is safe for overlapping ranges when `to <= from`.
    pub fn copy_within(&self, from: Address, to: Address, words: usize) {
        debug_assert!(to <= from || to >= from + words * BYTES_IN_WORD);
        let src = self.index(from);
        let dst = self.index(to);
        for i in 0..words {
            let v = self.words[src + i].load(Ordering::Relaxed);
            self.words[dst + i].store(v, Ordering::Relaxed);
        }
    }

    /// Copy `words` words from `from` in `source` to `to` in this region.
    pub fn copy_from(&self, source: &RawMemory, from: Address, to: Address, words: usize) {
        let src = source.index(from);
        let dst = self.index(to);
        for i in 0..words {
            let v = source.words[src + i].load(Ordering::Relaxed);
            self.words[dst + i].store(v, Ordering::Relaxed);
        }
    }
}

impl std::fmt::Debug for RawMemory {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(f, "RawMemory[{}, {})", self.start, self.end())
    }
}
