//! Packed bit-vector primitives used for per-block occupancy accounting.
//!
//! Blocks track their areas with two raw `u64` vectors (`used` and `stop`);
//! everything here operates on plain word slices so the hot paths stay free
//! of per-bit bookkeeping structures.

pub(crate) type BitWord = u64;

pub(crate) const BIT_WORD_BITS: usize = BitWord::BITS as usize;

/// Number of words needed to hold `bits` bits.
#[inline]
pub(crate) fn word_count_for(bits: usize) -> usize {
    bits.div_ceil(BIT_WORD_BITS)
}

/// Mask with the low `n` bits set (`n` in `0..=64`).
#[inline]
fn low_mask(n: usize) -> BitWord {
    debug_assert!(n <= BIT_WORD_BITS);
    if n >= BIT_WORD_BITS {
        BitWord::MAX
    } else {
        (1u64 << n) - 1
    }
}

#[inline]
pub(crate) fn get_bit(words: &[BitWord], index: usize) -> bool {
    (words[index / BIT_WORD_BITS] >> (index % BIT_WORD_BITS)) & 1 != 0
}

#[inline]
pub(crate) fn set_bit(words: &mut [BitWord], index: usize, value: bool) {
    let mask = 1u64 << (index % BIT_WORD_BITS);
    if value {
        words[index / BIT_WORD_BITS] |= mask;
    } else {
        words[index / BIT_WORD_BITS] &= !mask;
    }
}

/// Set `len` consecutive bits starting at `start`.
pub(crate) fn fill_range(words: &mut [BitWord], start: usize, len: usize) {
    let mut word = start / BIT_WORD_BITS;
    let mut bit = start % BIT_WORD_BITS;
    let mut remaining = len;
    while remaining > 0 {
        let n = (BIT_WORD_BITS - bit).min(remaining);
        words[word] |= low_mask(n) << bit;
        remaining -= n;
        word += 1;
        bit = 0;
    }
}

/// Clear `len` consecutive bits starting at `start`.
pub(crate) fn clear_range(words: &mut [BitWord], start: usize, len: usize) {
    let mut word = start / BIT_WORD_BITS;
    let mut bit = start % BIT_WORD_BITS;
    let mut remaining = len;
    while remaining > 0 {
        let n = (BIT_WORD_BITS - bit).min(remaining);
        words[word] &= !(low_mask(n) << bit);
        remaining -= n;
        word += 1;
        bit = 0;
    }
}

/// Index of the first set bit at or after `start`, if any.
///
/// This is the sentinel scan: allocation length is recovered on release by
/// finding the next `stop` bit instead of storing per-allocation metadata.
pub(crate) fn first_set_from(words: &[BitWord], start: usize) -> Option<usize> {
    let mut word_idx = start / BIT_WORD_BITS;
    if word_idx >= words.len() {
        return None;
    }
    let mut word = words[word_idx] & (BitWord::MAX << (start % BIT_WORD_BITS));
    loop {
        if word != 0 {
            return Some(word_idx * BIT_WORD_BITS + word.trailing_zeros() as usize);
        }
        word_idx += 1;
        if word_idx >= words.len() {
            return None;
        }
        word = words[word_idx];
    }
}

/// Total number of set bits.
pub(crate) fn count_ones(words: &[BitWord]) -> usize {
    words.iter().map(|w| w.count_ones() as usize).sum()
}

/// Iterator over maximal runs of "interesting" bits within a fixed half-open
/// window of a packed bit array.
///
/// The polarity is chosen at construction: [`BitRangeIter::ones`] yields runs
/// of 1-bits, [`BitRangeIter::zeros`] yields runs of 0-bits (implemented by
/// XOR-ing every loaded word with all-ones before the trailing-zero logic).
///
/// `next_range` takes a minimum-length hint: once the current run reaches the
/// hint the iterator stops extending it and reports the current end, even if
/// the run continues. This lets a best-fit search terminate as soon as a
/// large-enough run is known to exist. Pass `usize::MAX` (or use
/// [`BitRangeIter::next`]) to always receive maximal runs.
///
/// Yielded ranges are in global bit-array coordinates, ascending, disjoint,
/// and clamped to the window. After exhaustion every call returns `None`.
pub(crate) struct BitRangeIter<'a> {
    words: &'a [BitWord],
    xor_mask: BitWord,
    word_idx: usize,
    /// Global bit index of the current word's first bit.
    idx: usize,
    end: usize,
    bit_word: BitWord,
}

impl<'a> BitRangeIter<'a> {
    /// Iterate runs of 0-bits within `[start, end)`.
    pub(crate) fn zeros(words: &'a [BitWord], start: usize, end: usize) -> Self {
        Self::with_mask(words, BitWord::MAX, start, end)
    }

    /// Iterate runs of 1-bits within `[start, end)`.
    pub(crate) fn ones(words: &'a [BitWord], start: usize, end: usize) -> Self {
        Self::with_mask(words, 0, start, end)
    }

    fn with_mask(words: &'a [BitWord], xor_mask: BitWord, start: usize, end: usize) -> Self {
        debug_assert!(start <= end);
        debug_assert!(words.len() >= word_count_for(end));

        let idx = start - (start % BIT_WORD_BITS);
        let word_idx = idx / BIT_WORD_BITS;
        let bit_word = if idx < end {
            (words[word_idx] ^ xor_mask) & (BitWord::MAX << (start % BIT_WORD_BITS))
        } else {
            0
        };

        Self {
            words,
            xor_mask,
            word_idx,
            idx,
            end,
            bit_word,
        }
    }

    /// Next maximal run of interesting bits, or the current run cut short once
    /// it reaches `hint` bits.
    pub(crate) fn next_range(&mut self, hint: usize) -> Option<(usize, usize)> {
        // Skip words with no interesting bits.
        while self.bit_word == 0 {
            self.idx += BIT_WORD_BITS;
            if self.idx >= self.end {
                return None;
            }
            self.word_idx += 1;
            self.bit_word = self.words[self.word_idx] ^ self.xor_mask;
        }

        let i = self.bit_word.trailing_zeros() as usize;
        let start = self.idx + i;
        if start >= self.end {
            // The only interesting bits left in this word sit past the window.
            self.bit_word = 0;
            self.idx = self.end;
            return None;
        }

        // Invert the word with the consumed low bits cleared; trailing zeros
        // of the result locate the end of the run.
        self.bit_word = !(self.bit_word ^ !(BitWord::MAX << i));

        if self.bit_word == 0 {
            // Run reaches the end of the current word; extend across words
            // until it ends, the window ends, or the hint is satisfied.
            let mut range_end = (self.idx + BIT_WORD_BITS).min(self.end);
            while range_end - start < hint {
                self.idx += BIT_WORD_BITS;
                if self.idx >= self.end {
                    break;
                }
                self.word_idx += 1;
                self.bit_word = self.words[self.word_idx] ^ self.xor_mask;
                if self.bit_word != BitWord::MAX {
                    let j = (!self.bit_word).trailing_zeros() as usize;
                    range_end = (self.idx + j).min(self.end);
                    self.bit_word ^= !(BitWord::MAX << j);
                    break;
                }
                range_end = (self.idx + BIT_WORD_BITS).min(self.end);
                self.bit_word = 0;
            }
            Some((start, range_end))
        } else {
            let j = self.bit_word.trailing_zeros() as usize;
            let range_end = (self.idx + j).min(self.end);
            self.bit_word = !(self.bit_word ^ !(BitWord::MAX << j));
            Some((start, range_end))
        }
    }

    /// Next maximal run, without a length hint.
    pub(crate) fn next(&mut self) -> Option<(usize, usize)> {
        self.next_range(usize::MAX)
    }
}
