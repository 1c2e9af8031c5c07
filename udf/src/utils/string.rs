//! OSTA compressed Unicode (CS0) strings
//!
//! Identifiers in volume descriptors are `dstring` fields: a compression id
//! (8 or 16) followed by the characters, with the used length stored in the
//! last byte of the field. They are decoded only for diagnostics.

use tracing::warn;

/// Decode a fixed-size `dstring` field
pub fn decode_dstring(field: &[u8]) -> String {
    if field.len() < 2 {
        return String::new();
    }
    let len = field[field.len() - 1] as usize;
    if len == 0 {
        return String::new();
    }
    let body = &field[..field.len() - 1];
    let used = len.min(body.len());
    decode_dchars(&body[..used])
}

/// Decode `dchars` whose first byte is the compression id
pub fn decode_dchars(chars: &[u8]) -> String {
    let Some((&comp_id, rest)) = chars.split_first() else {
        return String::new();
    };
    match comp_id {
        8 => rest.iter().map(|&b| b as char).collect(),
        16 => char::decode_utf16(
            rest.chunks_exact(2)
                .map(|pair| u16::from_be_bytes([pair[0], pair[1]])),
        )
        .map(|c| c.unwrap_or(char::REPLACEMENT_CHARACTER))
        .collect(),
        other => {
            warn!("unsupported CS0 compression id {}", other);
            String::new()
        }
    }
}

/// Encode an ASCII string into a `dstring` field of `field.len()` bytes
pub fn encode_dstring(field: &mut [u8], value: &str) {
    field.fill(0);
    if value.is_empty() || field.len() < 3 {
        return;
    }
    let max_chars = field.len() - 2;
    let bytes = &value.as_bytes()[..value.len().min(max_chars)];
    field[0] = 8;
    field[1..1 + bytes.len()].copy_from_slice(bytes);
    let last = field.len() - 1;
    field[last] = (bytes.len() + 1) as u8;
}

/// Trim trailing NUL and space padding from an identifier
pub fn trim_identifier(bytes: &[u8]) -> &[u8] {
    let mut end = bytes.len();
    while end > 0 && (bytes[end - 1] == 0 || bytes[end - 1] == b' ') {
        end -= 1;
    }
    &bytes[..end]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_dstring_8bit() {
        let mut field = [0u8; 32];
        encode_dstring(&mut field, "LinuxUDF");
        assert_eq!(field[0], 8);
        assert_eq!(field[31], 9);
        assert_eq!(decode_dstring(&field), "LinuxUDF");
    }

    #[test]
    fn test_dstring_16bit() {
        let mut field = [0u8; 16];
        field[0] = 16;
        field[1..5].copy_from_slice(&[0x00, b'O', 0x00, b'K']);
        field[15] = 5;
        assert_eq!(decode_dstring(&field), "OK");
    }

    #[test]
    fn test_empty_and_overlong() {
        assert_eq!(decode_dstring(&[0u8; 32]), "");
        let mut field = [b'A'; 8];
        field[0] = 8;
        field[7] = 200;
        assert_eq!(decode_dstring(&field), "AAAAAA");
    }

    #[test]
    fn test_trim_identifier() {
        assert_eq!(trim_identifier(b"*OSTA UDF Compliant\0\0\0\0"), b"*OSTA UDF Compliant");
    }
}
