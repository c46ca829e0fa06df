use crate::model::TextEncoding;

pub const TRUNCATION_MARKER: &str = "...[truncated]";

const UTF8_BOM: &[u8] = b"\xEF\xBB\xBF";

pub fn strip_bom(bytes: &[u8]) -> &[u8] {
    bytes.strip_prefix(UTF8_BOM).unwrap_or(bytes)
}

// Longest prefix of at most `max` bytes that does not split a UTF-8 sequence
fn utf8_prefix(bytes: &[u8], max: usize) -> &[u8] {
    if bytes.len() <= max {
        return bytes;
    }
    let mut end = max;
    while end > 0 && max - end < 4 && (bytes[end] & 0xC0) == 0x80 {
        end -= 1;
    }
    &bytes[..end]
}

fn decode(bytes: &[u8], encoding: TextEncoding) -> String {
    match encoding {
        TextEncoding::Utf8 => String::from_utf8_lossy(bytes).into_owned(),
        TextEncoding::Latin1 => bytes.iter().map(|&b| b as char).collect(),
        TextEncoding::Ascii => bytes
            .iter()
            .map(|&b| if b.is_ascii() { b as char } else { char::REPLACEMENT_CHARACTER })
            .collect(),
    }
}

/// Decode one raw line (terminator already removed). Lines longer than
/// `max_line_bytes` are cut and get `TRUNCATION_MARKER` appended.
pub fn decode_line(raw: &[u8], encoding: TextEncoding, max_line_bytes: usize) -> String {
    let raw = raw.strip_suffix(b"\r").unwrap_or(raw);
    if raw.len() <= max_line_bytes {
        return decode(raw, encoding);
    }
    let cut = match encoding {
        TextEncoding::Utf8 => utf8_prefix(raw, max_line_bytes),
        _ => &raw[..max_line_bytes],
    };
    let mut line = decode(cut, encoding);
    line.push_str(TRUNCATION_MARKER);
    line
}

/// Same bound for lines that arrive already decoded (IPC tails).
pub fn truncate_str(line: &str, max_line_bytes: usize) -> String {
    if line.len() <= max_line_bytes {
        return line.to_string();
    }
    let mut end = max_line_bytes;
    while !line.is_char_boundary(end) {
        end -= 1;
    }
    format!("{}{}", &line[..end], TRUNCATION_MARKER)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn short_lines_pass_through() {
        assert_eq!(decode_line(b"hello\r", TextEncoding::Utf8, 64), "hello");
    }

    #[test]
    fn long_lines_are_cut_on_char_boundary() {
        // "é" is two bytes; a cut at 3 would split the second one
        let raw = "aéé".as_bytes();
        assert_eq!(
            decode_line(raw, TextEncoding::Utf8, 4),
            format!("aé{TRUNCATION_MARKER}")
        );
        assert_eq!(
            decode_line(raw, TextEncoding::Utf8, 3),
            format!("aé{TRUNCATION_MARKER}")
        );
    }

    #[test]
    fn latin1_and_ascii() {
        assert_eq!(decode_line(b"caf\xE9", TextEncoding::Latin1, 64), "café");
        assert_eq!(decode_line(b"caf\xE9", TextEncoding::Ascii, 64), "caf\u{FFFD}");
        assert_eq!(decode_line(b"caf\xE9", TextEncoding::Utf8, 64), "caf\u{FFFD}");
    }

    #[test]
    fn truncate_decoded() {
        assert_eq!(truncate_str("abc", 8), "abc");
        assert_eq!(truncate_str("aéé", 2), format!("a{TRUNCATION_MARKER}"));
    }

    #[test]
    fn bom_is_stripped() {
        assert_eq!(strip_bom(b"\xEF\xBB\xBFx"), b"x");
        assert_eq!(strip_bom(b"x"), b"x");
    }
}
