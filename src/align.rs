use std::mem;

/// Machine word size in bytes on the current target. 8 on the 64 bit
/// machines most code runs on these days.
pub(crate) const WORD_SIZE: usize = mem::size_of::<usize>();

/// Rounds `size` up to the next multiple of the machine word. Every payload
/// size the allocator hands out goes through this, which is also what keeps
/// all header, payload and footer addresses word aligned.
#[inline]
pub(crate) fn align(size: usize) -> usize {
    (size + WORD_SIZE - 1) & !(WORD_SIZE - 1)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rounds_up_to_word_multiples() {
        assert_eq!(align(0), 0);
        assert_eq!(align(1), WORD_SIZE);
        assert_eq!(align(WORD_SIZE - 1), WORD_SIZE);
        assert_eq!(align(WORD_SIZE), WORD_SIZE);
        assert_eq!(align(WORD_SIZE + 1), 2 * WORD_SIZE);

        for multiple in (WORD_SIZE..WORD_SIZE * 50).step_by(WORD_SIZE) {
            assert_eq!(align(multiple), multiple);
            assert_eq!(align(multiple - 1), multiple);
            assert_eq!(align(multiple + 1), multiple + WORD_SIZE);
        }
    }
}
