use base64::Engine;
use base64::engine::general_purpose::STANDARD;

use crate::client::ContentsError;

/// Encodes text as UTF-8 bytes in standard base64, the transport form of file bodies.
pub fn encode_content(text: &str) -> String {
    STANDARD.encode(text.as_bytes())
}

/// Decodes a base64 file body back to text. The API wraps long bodies at 60
/// columns, so ASCII whitespace is ignored.
pub fn decode_content(encoded: &str) -> Result<String, ContentsError> {
    let compact: String = encoded
        .chars()
        .filter(|c| !c.is_ascii_whitespace())
        .collect();
    let bytes = STANDARD.decode(compact.as_bytes())?;
    Ok(String::from_utf8(bytes)?)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips_text_outside_the_basic_plane() {
        let text = "Sgt Müller 🎖️ 𝔘𝔫𝔦𝔠𝔬𝔡𝔢 ✓";
        assert_eq!(decode_content(&encode_content(text)).unwrap(), text);
    }

    #[test]
    fn decodes_line_wrapped_bodies() {
        let encoded = encode_content(&"x".repeat(120));
        let wrapped = encoded
            .as_bytes()
            .chunks(60)
            .map(|chunk| std::str::from_utf8(chunk).unwrap())
            .collect::<Vec<_>>()
            .join("\n");
        assert_eq!(decode_content(&wrapped).unwrap(), "x".repeat(120));
    }

    #[test]
    fn rejects_invalid_utf8() {
        let encoded = STANDARD.encode([0xff, 0xfe, 0xfd]);
        assert!(matches!(
            decode_content(&encoded),
            Err(ContentsError::Utf8(_))
        ));
    }
}
