use crate::core::error::{ReaderError, Result};

/// Parse a hex string into bytes.
///
/// Accepts pure hex ("8070AB") as well as the usual separators
/// ("80 70 AB", "80:70:AB", "0x80,0x70,0xAB").
pub fn parse_hex(hex_str: &str) -> Result<Vec<u8>> {
    let cleaned = clean_hex_string(hex_str);

    if cleaned.is_empty() {
        return Ok(Vec::new());
    }

    if cleaned.len() % 2 != 0 {
        return Err(ReaderError::Config(format!(
            "hex string must have even number of characters: '{hex_str}'"
        )));
    }

    hex::decode(&cleaned)
        .map_err(|e| ReaderError::Config(format!("invalid hex string '{hex_str}': {e}")))
}

fn clean_hex_string(hex_str: &str) -> String {
    hex_str
        .trim()
        .replace("0x", "")
        .replace("0X", "")
        .replace([' ', ',', ':', '-', '\t', '\n', '\r'], "")
}

/// Format bytes as a hex string
pub fn format_hex(bytes: &[u8]) -> String {
    hex::encode_upper(bytes)
}

/// Format bytes as a hex string with spaces
pub fn format_hex_spaced(bytes: &[u8]) -> String {
    bytes
        .iter()
        .map(|b| format!("{b:02X}"))
        .collect::<Vec<_>>()
        .join(" ")
}

/// Format bytes in a hex dump style (both hex and ASCII)
pub fn format_hex_dump(bytes: &[u8]) -> String {
    const BYTES_PER_LINE: usize = 16;

    if bytes.is_empty() {
        return String::from("(empty)");
    }

    let mut result = String::new();

    for (i, chunk) in bytes.chunks(BYTES_PER_LINE).enumerate() {
        result.push_str(&format!("{:08X}: ", i * BYTES_PER_LINE));

        for &byte in chunk {
            result.push_str(&format!("{byte:02X} "));
        }
        result.push_str(&"   ".repeat(BYTES_PER_LINE - chunk.len()));

        result.push_str(" |");
        result.extend(chunk.iter().map(|&b| {
            if b.is_ascii_graphic() || b == b' ' {
                b as char
            } else {
                '.'
            }
        }));
        result.push_str("|\n");
    }

    result.trim_end().to_string()
}

/// Length of the smartcard section starting at `data`, header included.
///
/// Returns `None` when fewer than three header bytes are available.
pub fn sct_len(data: &[u8]) -> Option<usize> {
    match data {
        [_, hi, lo, ..] => Some(((((*hi as usize) & 0x0F) << 8) | *lo as usize) + 3),
        _ => None,
    }
}

/// Check that the section at `data` fits in `max_size` bytes when placed at
/// offset `off`.
pub fn check_sct_len(data: &[u8], off: usize, max_size: usize) -> Result<usize> {
    let len = sct_len(data).ok_or(ReaderError::SectionTooLong {
        len: data.len(),
        max: 3,
    })?;
    if len + off > max_size {
        log::debug!(
            "check_sct_len(): smartcard section too long {} > {}",
            len,
            max_size.saturating_sub(off)
        );
        return Err(ReaderError::SectionTooLong {
            len,
            max: max_size.saturating_sub(off),
        });
    }
    Ok(len)
}

/// Short description of the ISO 7816 status word ending a card response
pub fn describe_status_word(sw1: u8, sw2: u8) -> String {
    match (sw1, sw2) {
        (0x90, 0x00) => "Success".to_string(),
        (0x61, n) => format!("Success, {n} bytes available"),
        (0x62, _) | (0x63, _) => "Warning: state of non-volatile memory".to_string(),
        (0x67, 0x00) => "Error: Wrong length".to_string(),
        (0x69, 0x82) => "Error: Security status not satisfied".to_string(),
        (0x69, 0x85) => "Error: Conditions of use not satisfied".to_string(),
        (0x6A, 0x82) => "Error: File not found".to_string(),
        (0x6A, 0x86) => "Error: Incorrect parameters P1-P2".to_string(),
        (0x6C, n) => format!("Error: Wrong Le field, exact length: {n}"),
        (0x6D, 0x00) => "Error: Instruction code not supported or invalid".to_string(),
        (0x6E, 0x00) => "Error: Class not supported".to_string(),
        (0x6F, 0x00) => "Error: No precise diagnosis".to_string(),
        _ => format!("Unknown status: {sw1:02X} {sw2:02X}"),
    }
}
