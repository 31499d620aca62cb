use std::ops::Range;

use memchr::memmem;

/// Byte ranges covering `<script ...>...</script>` and `<style ...>...</style>`
/// blocks. Element-name matching is case-insensitive; attributes are allowed;
/// the literal closing tag is required. A block without its closing tag
/// extends to the end of the body. Ranges are sorted and non-overlapping.
pub fn forbidden_ranges(body: &[u8]) -> Vec<Range<usize>> {
    let lower = body.to_ascii_lowercase();
    let mut ranges = Vec::new();
    let mut pos = 0usize;
    while pos < lower.len() {
        let script = memmem::find(&lower[pos..], b"<script").map(|i| (pos + i, b"</script>" as &[u8], 7));
        let style = memmem::find(&lower[pos..], b"<style").map(|i| (pos + i, b"</style>" as &[u8], 6));
        let (start, close_tag, open_len) = match (script, style) {
            (Some(s), Some(t)) => {
                if s.0 <= t.0 {
                    s
                } else {
                    t
                }
            }
            (Some(s), None) => s,
            (None, Some(t)) => t,
            (None, None) => break,
        };
        // `<scripted>` is not a script element: the tag name must be
        // terminated by whitespace, `>` or `/`.
        let after = lower.get(start + open_len).copied();
        let is_tag = matches!(after, None | Some(b' ' | b'\t' | b'\r' | b'\n' | b'>' | b'/'));
        if !is_tag {
            pos = start + 1;
            continue;
        }
        let end = match memmem::find(&lower[start..], close_tag) {
            Some(rel) => start + rel + close_tag.len(),
            None => lower.len(),
        };
        ranges.push(start..end);
        pos = end;
    }
    ranges
}

/// Applies `f` to every segment outside the forbidden ranges and reassembles
/// the body with the protected spans byte-identical.
pub fn apply_outside_ranges(
    body: &[u8],
    ranges: &[Range<usize>],
    mut f: impl FnMut(&[u8]) -> Vec<u8>,
) -> Vec<u8> {
    let mut out = Vec::with_capacity(body.len());
    let mut cursor = 0usize;
    for range in ranges {
        if cursor < range.start {
            out.extend_from_slice(&f(&body[cursor..range.start]));
        }
        out.extend_from_slice(&body[range.start..range.end]);
        cursor = range.end;
    }
    if cursor < body.len() {
        out.extend_from_slice(&f(&body[cursor..]));
    }
    out
}
