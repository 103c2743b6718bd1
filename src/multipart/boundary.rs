//! Delimiter search used by the multipart decoder.

/// Return the index of the first occurrence of `needle` in `haystack`.
///
/// A needle that only partially matches at the very end of the haystack is
/// reported as not found; callers keep that tail and retry once more bytes
/// have arrived (see [`partial_suffix_len`]).
pub fn find(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    if needle.is_empty() {
        return Some(0);
    }
    if haystack.len() < needle.len() {
        return None;
    }
    let first = needle[0];
    let last_start = haystack.len() - needle.len();
    let mut i = 0;
    while i <= last_start {
        if haystack[i] == first && &haystack[i..i + needle.len()] == needle {
            return Some(i);
        }
        i += 1;
    }
    None
}

/// Length of the longest proper prefix of `needle` that ends `haystack`.
///
/// Those bytes could be the start of a delimiter split across two reads and
/// must not be handed out yet.
pub fn partial_suffix_len(haystack: &[u8], needle: &[u8]) -> usize {
    let max = needle.len().saturating_sub(1).min(haystack.len());
    (1..=max)
        .rev()
        .find(|&len| haystack[haystack.len() - len..] == needle[..len])
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn finds_first_occurrence() {
        assert_eq!(find(b"abc--xyz--xyz", b"--xyz"), Some(3));
        assert_eq!(find(b"--xyz", b"--xyz"), Some(0));
    }

    #[test]
    fn missing_needle_is_not_found() {
        assert_eq!(find(b"hello world", b"--xyz"), None);
        assert_eq!(find(b"", b"--xyz"), None);
    }

    #[test]
    fn partial_match_at_tail_is_not_found() {
        assert_eq!(find(b"payload\r\n--xy", b"\r\n--xyz"), None);
        assert_eq!(partial_suffix_len(b"payload\r\n--xy", b"\r\n--xyz"), 6);
    }

    #[test]
    fn partial_suffix_ignores_unrelated_tail() {
        assert_eq!(partial_suffix_len(b"payload", b"\r\n--xyz"), 0);
        assert_eq!(partial_suffix_len(b"payload\r", b"\r\n--xyz"), 1);
    }

    #[test]
    fn partial_suffix_handles_short_haystacks() {
        assert_eq!(partial_suffix_len(b"", b"\r\n--xyz"), 0);
        assert_eq!(partial_suffix_len(b"\r\n", b"\r\n--xyz"), 2);
    }

    #[test]
    fn partial_suffix_prefers_longest_candidate() {
        assert_eq!(partial_suffix_len(b"x---", b"---b"), 3);
    }
}
