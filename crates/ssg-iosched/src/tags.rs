//! Hardware tag allocation contract and a bitmap reference allocator.
//!
//! Tags are split across `map_nr` words. A shallow depth limits how many bits
//! of each word an allocation attempt may use, so a shallow depth of `d`
//! caps the attempt at roughly `d * map_nr` tags in use.

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::request::Tag;

const MAX_BITS_PER_WORD: u32 = 64;

/// Shape of the hardware tag space.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TagGeometry {
    /// Total number of tags.
    pub depth: u32,
    /// Tags per bitmap word.
    pub bits_per_word: u32,
}

impl TagGeometry {
    /// Creates a geometry with an explicit word size.
    pub fn new(depth: u32, bits_per_word: u32) -> Self {
        assert!(
            bits_per_word > 0 && bits_per_word <= MAX_BITS_PER_WORD,
            "bits_per_word must be in 1..=64"
        );
        Self {
            depth,
            bits_per_word,
        }
    }

    /// Picks the word size so the tags spread over at least four words.
    /// Shallow depths derived from it grow with `depth` only while `map_nr`
    /// stays the same: depth 32 gives 4 words of 8, depth 33 gives 5 of 8.
    pub fn for_depth(depth: u32) -> Self {
        let mut shift = MAX_BITS_PER_WORD.trailing_zeros();
        if depth >= 4 {
            while shift > 0 && (4u32 << shift) > depth {
                shift -= 1;
            }
        }
        Self::new(depth, 1 << shift)
    }

    /// Number of bitmap words.
    #[inline]
    pub fn map_nr(&self) -> u32 {
        self.depth.div_ceil(self.bits_per_word).max(1)
    }

    /// `max(1, limit / map_nr)`: per-word depth admitting about `limit` tags.
    #[inline]
    pub fn shallow_depth_for(&self, limit: u32) -> u32 {
        (limit / self.map_nr()).max(1)
    }

    fn word_depth(&self, word: u32) -> u32 {
        let start = word * self.bits_per_word;
        self.depth.saturating_sub(start).min(self.bits_per_word)
    }
}

/// Source of hardware tags.
pub trait TagAllocator: Send + Sync {
    /// Current tag geometry.
    fn geometry(&self) -> TagGeometry;

    /// Allocates a tag, using at most `shallow_depth` bits per word when set.
    /// Returns `None` when the caller must wait and retry.
    fn allocate(&self, shallow_depth: Option<u32>) -> Option<Tag>;

    /// Returns a tag to the pool.
    fn free(&self, tag: Tag);
}

/// Word-split bitmap tag allocator.
#[derive(Debug)]
pub struct BitmapTagAllocator {
    geometry: TagGeometry,
    words: Mutex<Vec<u64>>,
}

impl BitmapTagAllocator {
    /// Creates an allocator with every tag free.
    pub fn new(geometry: TagGeometry) -> Self {
        Self {
            geometry,
            words: Mutex::new(vec![0; geometry.map_nr() as usize]),
        }
    }

    /// Number of tags currently allocated.
    pub fn in_use(&self) -> u32 {
        self.words.lock().iter().map(|w| w.count_ones()).sum()
    }
}

impl TagAllocator for BitmapTagAllocator {
    fn geometry(&self) -> TagGeometry {
        self.geometry
    }

    fn allocate(&self, shallow_depth: Option<u32>) -> Option<Tag> {
        let mut words = self.words.lock();
        for (idx, word) in words.iter_mut().enumerate() {
            let idx = idx as u32;
            let limit = match shallow_depth {
                Some(shallow) => shallow.min(self.geometry.word_depth(idx)),
                None => self.geometry.word_depth(idx),
            };
            for bit in 0..limit {
                if *word & (1u64 << bit) == 0 {
                    *word |= 1u64 << bit;
                    return Some(Tag(idx * self.geometry.bits_per_word + bit));
                }
            }
        }
        debug!(
            "Tag allocation deferred: shallow_depth={:?}, depth={}",
            shallow_depth, self.geometry.depth
        );
        None
    }

    fn free(&self, tag: Tag) {
        assert!(tag.0 < self.geometry.depth, "freeing out-of-range {:?}", tag);
        let word = (tag.0 / self.geometry.bits_per_word) as usize;
        let bit = tag.0 % self.geometry.bits_per_word;
        let mut words = self.words.lock();
        assert!(words[word] & (1u64 << bit) != 0, "double free of {:?}", tag);
        words[word] &= !(1u64 << bit);
    }
}
