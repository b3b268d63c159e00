use memchr::memmem;

use super::BytePattern;

/// Lowest offset `>= start` at which `pattern` matches inside `haystack`.
///
/// A match never extends past the end of the buffer. Offset 0 is a valid
/// result.
pub fn find_pattern(haystack: &[u8], pattern: &BytePattern, start: usize) -> Option<usize> {
    let len = pattern.len();
    if start > haystack.len() || haystack.len() - start < len {
        return None;
    }
    let window = &haystack[start..];

    if pattern.is_exact() {
        return memmem::find(window, pattern.bytes()).map(|pos| start + pos);
    }

    window
        .windows(len)
        .position(|candidate| pattern.matches(candidate))
        .map(|pos| start + pos)
}

/// Iterate over non-overlapping matches in ascending order, starting at `start`.
pub fn find_all<'a>(haystack: &'a [u8], pattern: &'a BytePattern, start: usize) -> Matches<'a> {
    Matches {
        haystack,
        pattern,
        next: start,
    }
}

/// Iterator returned by [`find_all`]. Each search resumes at the end of the
/// previous match.
pub struct Matches<'a> {
    haystack: &'a [u8],
    pattern: &'a BytePattern,
    next: usize,
}

impl Iterator for Matches<'_> {
    type Item = usize;

    fn next(&mut self) -> Option<usize> {
        let pos = find_pattern(self.haystack, self.pattern, self.next)?;
        self.next = pos + self.pattern.len();
        Some(pos)
    }
}
