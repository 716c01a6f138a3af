//! Hex dump formatting for frame diagnostics.
//!
//! Used when logging malformed frames and raw ME replies. Output is the
//! classic 16-bytes-per-row layout with an offset column and a printable
//! gutter:
//!
//! ```text
//!           +0 +1 +2 +3 +4 +5 +6 +7  +8 +9 +A +B +C +D +E +F
//! 00000000  05 00 00 00 12 70 66 77  64 40 61 6D 74 2E 69 6E  |.....pfwd@amt.in|
//! ```

use std::fmt::Write;

const HEADER: &str = "          +0 +1 +2 +3 +4 +5 +6 +7  +8 +9 +A +B +C +D +E +F";

/// Format `data` as a multi-line hex dump.
pub fn hexdump(data: &[u8]) -> String {
    if data.is_empty() {
        return "hexdump: empty".to_owned();
    }

    let mut out = String::with_capacity(HEADER.len() + data.len() * 4);
    out.push_str(HEADER);

    for (row, chunk) in data.chunks(16).enumerate() {
        let _ = write!(out, "\n{:08X}  ", row * 16);
        for offset in 0..16 {
            match chunk.get(offset) {
                Some(b) => {
                    let _ = write!(out, "{b:02X} ");
                }
                None => out.push_str("   "),
            }
            if offset == 7 {
                out.push(' ');
            }
        }
        out.push_str(" |");
        for &b in chunk {
            if b.is_ascii_graphic() {
                out.push(b as char);
            } else {
                out.push('.');
            }
        }
        for _ in chunk.len()..16 {
            out.push(' ');
        }
        out.push('|');
    }

    out
}

/// Format `data` as a bare run of uppercase hex digits.
pub fn hex_string(data: &[u8]) -> String {
    let mut out = String::with_capacity(data.len() * 2);
    for b in data {
        let _ = write!(out, "{b:02X}");
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_input() {
        assert_eq!(hexdump(&[]), "hexdump: empty");
    }

    #[test]
    fn single_row_has_header_and_gutter() {
        let dump = hexdump(b"pfwd");
        let mut lines = dump.lines();
        assert_eq!(lines.next(), Some(HEADER));
        let row = lines.next().expect("one data row");
        assert!(row.starts_with("00000000  70 66 77 64"));
        assert!(row.ends_with("|pfwd            |"));
        assert_eq!(lines.next(), None);
    }

    #[test]
    fn non_printable_bytes_become_dots() {
        let dump = hexdump(&[0x00, 0x1F, 0x41]);
        assert!(dump.ends_with("|..A             |"));
    }

    #[test]
    fn multi_row_offsets() {
        let data: Vec<u8> = (0u8..40).collect();
        let dump = hexdump(&data);
        assert!(dump.contains("\n00000000  "));
        assert!(dump.contains("\n00000010  "));
        assert!(dump.contains("\n00000020  "));
    }

    #[test]
    fn hex_string_format() {
        assert_eq!(hex_string(&[0xDE, 0xAD, 0x01]), "DEAD01");
        assert_eq!(hex_string(&[]), "");
    }
}
