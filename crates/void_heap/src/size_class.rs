//! Size-class table
//!
//! Maps a header-inclusive request size to a bucket index. The schedule
//! doubles up to 1 KiB, steps by 1 KiB up to 8 KiB, then doubles again up
//! to 1 MiB. The last class is a catch-all for anything larger.

/// Word alignment applied to every block
pub const WORD_ALIGN: usize = core::mem::size_of::<usize>();

/// Number of size classes, catch-all included
pub const NUM_BUCKETS: usize = 21;

/// Index of the catch-all class
pub const CATCH_ALL: usize = NUM_BUCKETS - 1;

/// Smallest class, header included
pub const MIN_CLASS_SIZE: usize = 32;

const DOUBLING_LIMIT: usize = 1024;
const ADDITIVE_STEP: usize = 1024;
const ADDITIVE_LIMIT: usize = 8 * 1024;

/// Static size schedule
#[derive(Clone, Debug)]
pub struct SizeClassTable {
    sizes: [usize; NUM_BUCKETS],
}

impl SizeClassTable {
    pub const fn new() -> Self {
        let mut sizes = [0usize; NUM_BUCKETS];
        let mut size = MIN_CLASS_SIZE;
        let mut i = 0;

        while i < CATCH_ALL {
            sizes[i] = size;
            size = if size < DOUBLING_LIMIT || size >= ADDITIVE_LIMIT {
                size * 2
            } else {
                size + ADDITIVE_STEP
            };
            i += 1;
        }
        sizes[CATCH_ALL] = usize::MAX;

        Self { sizes }
    }

    /// Nominal block size of a class. The catch-all reports `usize::MAX`.
    #[inline]
    pub fn block_size(&self, index: usize) -> usize {
        self.sizes[index]
    }

    /// Largest bounded class
    #[inline]
    pub fn largest(&self) -> usize {
        self.sizes[CATCH_ALL - 1]
    }

    #[inline]
    pub const fn is_catch_all(index: usize) -> bool {
        index == CATCH_ALL
    }

    /// First class whose block size is at least `size`
    pub fn classify(&self, size: usize) -> usize {
        self.sizes[..CATCH_ALL]
            .iter()
            .position(|block_size| *block_size >= size)
            .unwrap_or(CATCH_ALL)
    }

    /// Largest bounded class whose block size is at most `size`
    pub fn classify_floor(&self, size: usize) -> Option<usize> {
        self.sizes[..CATCH_ALL]
            .iter()
            .rposition(|block_size| *block_size <= size)
    }

    /// Iterate `(index, block_size)` over every class
    pub fn iter(&self) -> impl Iterator<Item = (usize, usize)> + '_ {
        self.sizes.iter().copied().enumerate()
    }
}

impl Default for SizeClassTable {
    fn default() -> Self {
        Self::new()
    }
}
