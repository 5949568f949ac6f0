//! Coalescing best-fit allocator over a fixed word region.
//!
//! Every chunk starts with one header word:
//!
//! ```text
//!  63            36 35 34      28 27            0
//! +----------------+--+----------+---------------+
//! |   prev size    |M |   kind   |     size      |
//! +----------------+--+----------+---------------+
//! ```
//!
//! Sizes are in words and include the header. `prev size` is the size of the
//! physically preceding chunk (zero for the first one), which together with
//! `size` links chunks in both directions for coalescing. Free chunks keep
//! their free-list links in the first two payload words.

use crate::cell::{Cell, Ref};

pub const WORD_BYTES: usize = 8;
pub const HEADER_WORDS: usize = 1;
/// Header plus the two free-list links.
pub const MIN_CHUNK_WORDS: usize = 3;
pub const MAX_CHUNK_WORDS: usize = (1 << 28) - 1;

const SIZE_MASK: u64 = (1 << 28) - 1;
const KIND_SHIFT: u32 = 28;
const KIND_MASK: u64 = 0x7f;
const MARK_BIT: u64 = 1 << 35;
const PREV_SHIFT: u32 = 36;

/// Tag of a heap chunk. Only Java-visible data lives on the heap: utf
/// names, method and field metadata and constant pools are plain Rust
/// values in the `ClassPool`, interned strings are indexed by the
/// `Vm::strings` table, and static fields sit in each class's `ClassData`
/// chunk.
#[repr(u8)]
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum AllocKind {
    Free = 0,
    Object = 1,
    RefArray = 2,
    PrimArray = 3,
    ClassData = 4,
    StackSegment = 5,
    WeakRef = 6,
}

impl AllocKind {
    fn from_bits(bits: u64) -> Self {
        match bits {
            1 => AllocKind::Object,
            2 => AllocKind::RefArray,
            3 => AllocKind::PrimArray,
            4 => AllocKind::ClassData,
            5 => AllocKind::StackSegment,
            6 => AllocKind::WeakRef,
            _ => AllocKind::Free,
        }
    }
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
struct Header(u64);

impl Header {
    fn new(size: usize, kind: AllocKind, prev_size: usize) -> Self {
        debug_assert!(size <= MAX_CHUNK_WORDS && prev_size <= MAX_CHUNK_WORDS);
        Self(size as u64 | ((kind as u64) << KIND_SHIFT) | ((prev_size as u64) << PREV_SHIFT))
    }

    fn size(self) -> usize {
        (self.0 & SIZE_MASK) as usize
    }

    fn kind(self) -> AllocKind {
        AllocKind::from_bits((self.0 >> KIND_SHIFT) & KIND_MASK)
    }

    fn marked(self) -> bool {
        self.0 & MARK_BIT != 0
    }

    fn prev_size(self) -> usize {
        (self.0 >> PREV_SHIFT) as usize
    }

    fn with_prev_size(self, prev: usize) -> Self {
        Self((self.0 & ((1 << PREV_SHIFT) - 1)) | ((prev as u64) << PREV_SHIFT))
    }
}

#[derive(Debug, Default, Copy, Clone, PartialEq, Eq)]
pub struct HeapStats {
    pub capacity_words: usize,
    pub free_words: usize,
    pub allocated_words: usize,
    pub header_words: usize,
    pub chunks: usize,
    pub free_chunks: usize,
    pub largest_free: usize,
}

impl HeapStats {
    pub fn is_balanced(&self) -> bool {
        self.free_words + self.allocated_words + self.header_words == self.capacity_words
    }
}

#[derive(Debug, Default, Copy, Clone, PartialEq, Eq)]
pub struct SweepStats {
    pub freed_chunks: usize,
    pub freed_words: usize,
    pub live_chunks: usize,
}

pub struct Heap {
    words: Vec<u64>,
    // one bit per word, set where a chunk header lives
    starts: Vec<u64>,
    free_head: usize,
}

impl Heap {
    pub fn new(bytes: usize) -> Self {
        let len = (bytes / WORD_BYTES).max(MIN_CHUNK_WORDS + 1);
        let mut heap = Self {
            words: vec![0; len],
            starts: vec![0; len.div_ceil(64)],
            free_head: 0,
        };
        let size = len - 1;
        heap.write_header(1, Header::new(size, AllocKind::Free, 0));
        heap.set_start(1, true);
        heap.link_free(1);
        heap
    }

    #[inline]
    pub fn len_words(&self) -> usize {
        self.words.len()
    }

    // ── Raw word access ─────────────────────────────────────────────

    #[inline]
    pub fn cell(&self, index: usize) -> Cell {
        Cell(self.words[index])
    }

    #[inline]
    pub fn set_cell(&mut self, index: usize, value: Cell) {
        self.words[index] = value.0;
    }

    #[inline]
    pub fn field(&self, chunk: Ref, offset: usize) -> Cell {
        Cell(self.words[chunk.index() + offset])
    }

    #[inline]
    pub fn set_field(&mut self, chunk: Ref, offset: usize, value: Cell) {
        self.words[chunk.index() + offset] = value.0;
    }

    pub fn copy_cells(&mut self, src: usize, dst: usize, count: usize) {
        self.words.copy_within(src..src + count, dst);
    }

    pub fn fill_cells(&mut self, start: usize, count: usize, value: Cell) {
        self.words[start..start + count].fill(value.0);
    }

    /// Reads a `width`-byte element of a packed primitive region starting at
    /// word `base`. The result is zero-extended.
    pub fn load_packed(&self, base: usize, index: usize, width: usize) -> u64 {
        let byte = index * width;
        let word = self.words[base + byte / WORD_BYTES];
        if width == WORD_BYTES {
            return word;
        }
        let shift = (byte % WORD_BYTES) * 8;
        (word >> shift) & ((1u64 << (width * 8)) - 1)
    }

    pub fn store_packed(&mut self, base: usize, index: usize, width: usize, value: u64) {
        let byte = index * width;
        let slot = &mut self.words[base + byte / WORD_BYTES];
        if width == WORD_BYTES {
            *slot = value;
            return;
        }
        let shift = (byte % WORD_BYTES) * 8;
        let mask = ((1u64 << (width * 8)) - 1) << shift;
        *slot = (*slot & !mask) | ((value << shift) & mask);
    }

    // ── Chunk metadata ──────────────────────────────────────────────

    #[inline]
    fn header(&self, at: usize) -> Header {
        Header(self.words[at])
    }

    #[inline]
    fn write_header(&mut self, at: usize, header: Header) {
        self.words[at] = header.0;
    }

    #[inline]
    fn is_start(&self, at: usize) -> bool {
        self.starts[at / 64] & (1 << (at % 64)) != 0
    }

    #[inline]
    fn set_start(&mut self, at: usize, value: bool) {
        if value {
            self.starts[at / 64] |= 1 << (at % 64);
        } else {
            self.starts[at / 64] &= !(1 << (at % 64));
        }
    }

    pub fn kind(&self, chunk: Ref) -> AllocKind {
        self.header(chunk.index() - HEADER_WORDS).kind()
    }

    /// Payload capacity of a chunk in words. May exceed the requested size.
    pub fn payload_words(&self, chunk: Ref) -> usize {
        self.header(chunk.index() - HEADER_WORDS).size() - HEADER_WORDS
    }

    /// Conservative check used when scanning stack cells: does `raw` name the
    /// payload of an allocated chunk?
    pub fn live_chunk(&self, raw: u64) -> Option<AllocKind> {
        let index = usize::try_from(raw).ok()?;
        if index <= HEADER_WORDS || index >= self.words.len() {
            return None;
        }
        let at = index - HEADER_WORDS;
        if !self.is_start(at) {
            return None;
        }
        match self.header(at).kind() {
            AllocKind::Free => None,
            kind => Some(kind),
        }
    }

    pub fn is_marked(&self, chunk: Ref) -> bool {
        self.header(chunk.index() - HEADER_WORDS).marked()
    }

    /// Sets the mark bit, returning `true` if it was previously clear.
    pub fn mark(&mut self, chunk: Ref) -> bool {
        let at = chunk.index() - HEADER_WORDS;
        if self.words[at] & MARK_BIT != 0 {
            return false;
        }
        self.words[at] |= MARK_BIT;
        true
    }

    // ── Free list ───────────────────────────────────────────────────

    fn link_free(&mut self, at: usize) {
        let head = self.free_head;
        self.words[at + 1] = head as u64;
        self.words[at + 2] = 0;
        if head != 0 {
            self.words[head + 2] = at as u64;
        }
        self.free_head = at;
    }

    fn unlink_free(&mut self, at: usize) {
        let next = self.words[at + 1] as usize;
        let prev = self.words[at + 2] as usize;
        if prev == 0 {
            self.free_head = next;
        } else {
            self.words[prev + 1] = next as u64;
        }
        if next != 0 {
            self.words[next + 2] = prev as u64;
        }
    }

    fn fix_next_prev_size(&mut self, at: usize, size: usize) {
        let next = at + size;
        if next < self.words.len() {
            let header = self.header(next).with_prev_size(size);
            self.write_header(next, header);
        }
    }

    // ── Allocation ──────────────────────────────────────────────────

    /// Best-fit allocation of `payload` zeroed words. `None` when no free chunk
    /// is large enough; the caller decides whether to collect and retry.
    pub fn alloc(&mut self, payload: usize, kind: AllocKind) -> Option<Ref> {
        debug_assert!(kind != AllocKind::Free);
        let need = (payload + HEADER_WORDS).max(MIN_CHUNK_WORDS);
        if need > MAX_CHUNK_WORDS {
            return None;
        }

        let mut best = 0;
        let mut best_size = usize::MAX;
        let mut cursor = self.free_head;
        while cursor != 0 {
            let size = self.header(cursor).size();
            if size >= need && size < best_size {
                best = cursor;
                best_size = size;
                if size == need {
                    break;
                }
            }
            cursor = self.words[cursor + 1] as usize;
        }
        if best == 0 {
            return None;
        }

        self.unlink_free(best);
        let prev_size = self.header(best).prev_size();
        let mut size = best_size;
        let remainder = best_size - need;
        if remainder >= MIN_CHUNK_WORDS {
            size = need;
            let rest = best + need;
            self.write_header(rest, Header::new(remainder, AllocKind::Free, need));
            self.set_start(rest, true);
            self.fix_next_prev_size(rest, remainder);
            self.link_free(rest);
        }
        self.write_header(best, Header::new(size, kind, prev_size));
        self.words[best + HEADER_WORDS..best + size].fill(0);
        Some(Ref::from_index(best + HEADER_WORDS))
    }

    /// Returns a chunk to the free list, merging it with free neighbours.
    pub fn free(&mut self, chunk: Ref) {
        let mut at = chunk.index() - HEADER_WORDS;
        let header = self.header(at);
        debug_assert!(header.kind() != AllocKind::Free, "double free of {chunk:?}");
        let mut size = header.size();
        let mut prev_size = header.prev_size();

        let next = at + size;
        if next < self.words.len() && self.header(next).kind() == AllocKind::Free {
            size += self.header(next).size();
            self.unlink_free(next);
            self.set_start(next, false);
        }
        if prev_size != 0 {
            let prev = at - prev_size;
            let prev_header = self.header(prev);
            if prev_header.kind() == AllocKind::Free {
                self.unlink_free(prev);
                self.set_start(at, false);
                size += prev_header.size();
                prev_size = prev_header.prev_size();
                at = prev;
            }
        }
        self.write_header(at, Header::new(size, AllocKind::Free, prev_size));
        self.fix_next_prev_size(at, size);
        self.link_free(at);
    }

    // ── Collection support ──────────────────────────────────────────

    /// Walks every chunk in physical order. Unmarked chunks are released and
    /// merged with adjacent free space; marked chunks are unmarked.
    /// `on_free` sees each released chunk before its payload is reused.
    pub fn sweep(&mut self, on_free: &mut dyn FnMut(&Heap, Ref, AllocKind)) -> SweepStats {
        let mut stats = SweepStats::default();
        let len = self.words.len();
        self.free_head = 0;
        let mut at = HEADER_WORDS;
        let mut prev_size = 0;

        while at < len {
            let header = self.header(at);
            if header.kind() != AllocKind::Free && header.marked() {
                self.write_header(
                    at,
                    Header::new(header.size(), header.kind(), prev_size),
                );
                stats.live_chunks += 1;
                prev_size = header.size();
                at += header.size();
                continue;
            }

            let run_start = at;
            let mut run = 0;
            while at < len {
                let header = self.header(at);
                let kind = header.kind();
                if kind != AllocKind::Free && header.marked() {
                    break;
                }
                if kind != AllocKind::Free {
                    on_free(self, Ref::from_index(at + HEADER_WORDS), kind);
                    stats.freed_chunks += 1;
                    stats.freed_words += header.size();
                }
                if at != run_start {
                    self.set_start(at, false);
                }
                run += header.size();
                at += header.size();
            }
            self.write_header(run_start, Header::new(run, AllocKind::Free, prev_size));
            self.link_free(run_start);
            prev_size = run;
        }
        stats
    }

    pub fn stats(&self) -> HeapStats {
        let mut stats = HeapStats {
            capacity_words: self.words.len() - HEADER_WORDS,
            ..Default::default()
        };
        let mut at = HEADER_WORDS;
        while at < self.words.len() {
            let header = self.header(at);
            stats.chunks += 1;
            stats.header_words += HEADER_WORDS;
            let payload = header.size() - HEADER_WORDS;
            if header.kind() == AllocKind::Free {
                stats.free_chunks += 1;
                stats.free_words += payload;
                stats.largest_free = stats.largest_free.max(payload);
            } else {
                stats.allocated_words += payload;
            }
            at += header.size();
        }
        stats
    }

    /// Checks the physical chain: sizes tile the region, back links agree, and
    /// no two free chunks are adjacent.
    pub fn verify(&self) -> Result<(), String> {
        let mut at = HEADER_WORDS;
        let mut prev_size = 0;
        let mut prev_free = false;
        while at < self.words.len() {
            let header = self.header(at);
            if header.size() < MIN_CHUNK_WORDS.min(HEADER_WORDS + 1) {
                return Err(format!("chunk at {at} has size {}", header.size()));
            }
            if header.prev_size() != prev_size {
                return Err(format!(
                    "chunk at {at} records prev size {} but previous is {prev_size}",
                    header.prev_size()
                ));
            }
            if !self.is_start(at) {
                return Err(format!("chunk at {at} missing from start bitmap"));
            }
            let free = header.kind() == AllocKind::Free;
            if free && prev_free {
                return Err(format!("adjacent free chunks at {at}"));
            }
            prev_free = free;
            prev_size = header.size();
            at += header.size();
        }
        if at != self.words.len() {
            return Err(format!("chunks overrun heap end: {at}"));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn alloc_zeroes_and_splits() {
        let mut heap = Heap::new(1024);
        let a = heap.alloc(4, AllocKind::Object).unwrap();
        heap.set_field(a, 0, Cell(7));
        heap.free(a);
        let b = heap.alloc(4, AllocKind::Object).unwrap();
        assert_eq!(heap.field(b, 0), Cell::ZERO);
        assert_eq!(heap.kind(b), AllocKind::Object);
        assert!(heap.stats().is_balanced());
        heap.verify().unwrap();
    }

    #[test]
    fn best_fit_prefers_smallest_hole() {
        let mut heap = Heap::new(4096);
        let a = heap.alloc(20, AllocKind::Object).unwrap();
        let _pin1 = heap.alloc(1, AllocKind::Object).unwrap();
        let b = heap.alloc(6, AllocKind::Object).unwrap();
        let _pin2 = heap.alloc(1, AllocKind::Object).unwrap();
        heap.free(a);
        heap.free(b);
        let c = heap.alloc(5, AllocKind::Object).unwrap();
        assert_eq!(c, b);
    }

    #[test]
    fn free_coalesces_both_neighbours() {
        let mut heap = Heap::new(1024);
        let a = heap.alloc(4, AllocKind::Object).unwrap();
        let b = heap.alloc(4, AllocKind::Object).unwrap();
        let c = heap.alloc(4, AllocKind::Object).unwrap();
        heap.free(a);
        heap.free(c);
        heap.free(b);
        let stats = heap.stats();
        assert_eq!(stats.chunks, 1);
        assert_eq!(stats.free_chunks, 1);
        heap.verify().unwrap();
    }

    #[test]
    fn exhaustion_returns_none() {
        let mut heap = Heap::new(256);
        assert!(heap.alloc(100, AllocKind::PrimArray).is_none());
        let mut count = 0;
        while heap.alloc(2, AllocKind::Object).is_some() {
            count += 1;
        }
        assert!(count > 0);
        assert!(heap.stats().is_balanced());
    }

    #[test]
    fn sweep_releases_unmarked_and_clears_marks() {
        let mut heap = Heap::new(2048);
        let keep = heap.alloc(3, AllocKind::Object).unwrap();
        let drop1 = heap.alloc(3, AllocKind::ClassData).unwrap();
        let drop2 = heap.alloc(3, AllocKind::Object).unwrap();
        let keep2 = heap.alloc(3, AllocKind::RefArray).unwrap();
        heap.mark(keep);
        heap.mark(keep2);

        let mut seen = Vec::new();
        let stats = heap.sweep(&mut |_, chunk, kind| seen.push((chunk, kind)));
        assert_eq!(stats.freed_chunks, 2);
        assert_eq!(seen, vec![(drop1, AllocKind::ClassData), (drop2, AllocKind::Object)]);
        assert!(!heap.is_marked(keep));
        assert!(heap.live_chunk(drop1.index() as u64).is_none());
        assert_eq!(heap.live_chunk(keep2.index() as u64), Some(AllocKind::RefArray));
        heap.verify().unwrap();
        assert!(heap.stats().is_balanced());
    }

    #[test]
    fn every_tag_survives_the_header() {
        let mut heap = Heap::new(1024);
        let kinds = [
            AllocKind::Object,
            AllocKind::RefArray,
            AllocKind::PrimArray,
            AllocKind::ClassData,
            AllocKind::StackSegment,
            AllocKind::WeakRef,
        ];
        let chunks: Vec<_> = kinds.iter().map(|&k| heap.alloc(4, k).unwrap()).collect();
        for (&chunk, &kind) in chunks.iter().zip(&kinds) {
            assert_eq!(heap.kind(chunk), kind);
        }
        assert_eq!(AllocKind::from_bits(0x7f), AllocKind::Free);
    }

    #[test]
    fn conservative_lookup_rejects_interior_words() {
        let mut heap = Heap::new(1024);
        let a = heap.alloc(8, AllocKind::Object).unwrap();
        assert!(heap.live_chunk(a.index() as u64).is_some());
        assert!(heap.live_chunk(a.index() as u64 + 1).is_none());
        assert!(heap.live_chunk(0).is_none());
        assert!(heap.live_chunk(u64::MAX).is_none());
    }

    #[test]
    fn packed_elements() {
        let mut heap = Heap::new(1024);
        let a = heap.alloc(4, AllocKind::PrimArray).unwrap();
        let base = a.index();
        for i in 0..16 {
            heap.store_packed(base, i, 2, (i as u64) * 1000);
        }
        heap.store_packed(base, 3, 2, 0xffff);
        assert_eq!(heap.load_packed(base, 3, 2), 0xffff);
        assert_eq!(heap.load_packed(base, 4, 2), 4000);
        heap.store_packed(base, 1, 1, 0x1ff);
        assert_eq!(heap.load_packed(base, 1, 1), 0xff);
    }
}
