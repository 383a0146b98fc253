//! Decoding of color telemetry frames.
//!
//! The detector sends one of two textual encodings, chosen by its firmware:
//! - key-tagged: `R:<int>,G:<int>,B:<int>`
//! - positional: `<int>,<int>,<int>[,<label>]`
//!
//! A frame either decodes into a fully valid sample or is rejected. Values are never clamped.

use std::str;
use std::time::SystemTime;

use crate::device::types::ColorSample;
use crate::error::DecodeError;

const CHANNEL_TAGS: [char; 3] = ['R', 'G', 'B'];

/// Decode a raw characteristic value into a color sample captured at `captured_at`.
pub fn decode_frame(payload: &[u8], captured_at: SystemTime) -> Result<ColorSample, DecodeError> {
    let text = str::from_utf8(payload).map_err(|_| DecodeError::NotText)?;
    // firmware strings may carry a trailing NUL terminator
    let text = text.trim_matches(|c: char| c.is_whitespace() || c == '\0');

    if text.is_empty() {
        return Err(DecodeError::Empty);
    }

    let tokens: Vec<&str> = text.split(',').map(str::trim).collect();

    let [r, g, b] = if is_key_tagged(tokens[0]) {
        decode_key_tagged(&tokens)?
    } else {
        decode_positional(&tokens)?
    };

    Ok(ColorSample::new(r, g, b, captured_at))
}

fn is_key_tagged(first_token: &str) -> bool {
    first_token
        .strip_prefix('R')
        .map(|rest| rest.trim_start().starts_with(':'))
        .unwrap_or(false)
}

fn decode_key_tagged(tokens: &[&str]) -> Result<[u8; 3], DecodeError> {
    if tokens.len() < 3 {
        return Err(DecodeError::MissingChannels { found: tokens.len() });
    }

    let mut channels = [0u8; 3];
    for (index, tag) in CHANNEL_TAGS.iter().enumerate() {
        let token = tokens[index];
        let value = token
            .strip_prefix(*tag)
            .and_then(|rest| rest.trim_start().strip_prefix(':'))
            .ok_or_else(|| DecodeError::MalformedTag { token: token.to_string() })?;

        channels[index] = parse_channel(*tag, value.trim())?;
    }

    Ok(channels)
}

fn decode_positional(tokens: &[&str]) -> Result<[u8; 3], DecodeError> {
    if tokens.len() < 3 {
        return Err(DecodeError::MissingChannels { found: tokens.len() });
    }

    // anything after the third token (such as a color label) is ignored
    let mut channels = [0u8; 3];
    for (index, tag) in CHANNEL_TAGS.iter().enumerate() {
        channels[index] = parse_channel(*tag, tokens[index])?;
    }

    Ok(channels)
}

fn parse_channel(channel: char, token: &str) -> Result<u8, DecodeError> {
    let value: i64 = token
        .parse()
        .map_err(|_| DecodeError::InvalidNumber { token: token.to_string() })?;

    u8::try_from(value).map_err(|_| DecodeError::OutOfRange { channel, value })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn decode(payload: &str) -> Result<(u8, u8, u8), DecodeError> {
        decode_frame(payload.as_bytes(), SystemTime::UNIX_EPOCH).map(|sample| sample.channels())
    }

    #[test]
    fn key_tagged_frame() {
        assert_eq!(decode("R:12,G:200,B:5"), Ok((12, 200, 5)));
    }

    #[test]
    fn key_tagged_frame_tolerates_whitespace() {
        assert_eq!(decode("  R : 12 , G: 200,B :5 \n"), Ok((12, 200, 5)));
    }

    #[test]
    fn positional_frame_ignores_label() {
        assert_eq!(decode("12,200,5,Red"), Ok((12, 200, 5)));
        assert_eq!(decode("12, 200, 5, Light Blue, extra"), Ok((12, 200, 5)));
    }

    #[test]
    fn positional_frame_without_label() {
        assert_eq!(decode("0,255,128"), Ok((0, 255, 128)));
    }

    #[test]
    fn trailing_nul_terminator_is_ignored() {
        let sample = decode_frame(b"1,2,3\0", SystemTime::UNIX_EPOCH).unwrap();
        assert_eq!(sample.channels(), (1, 2, 3));
    }

    #[test]
    fn out_of_range_channel_is_rejected() {
        assert_eq!(decode("300,5,5"), Err(DecodeError::OutOfRange { channel: 'R', value: 300 }));
        assert_eq!(decode("R:1,G:256,B:0"), Err(DecodeError::OutOfRange { channel: 'G', value: 256 }));
        assert_eq!(decode("1,2,-1"), Err(DecodeError::OutOfRange { channel: 'B', value: -1 }));
    }

    #[test]
    fn empty_payload_is_rejected() {
        assert_eq!(decode(""), Err(DecodeError::Empty));
        assert_eq!(decode("  \0"), Err(DecodeError::Empty));
    }

    #[test]
    fn too_few_channels_are_rejected() {
        assert_eq!(decode("12,200"), Err(DecodeError::MissingChannels { found: 2 }));
        assert_eq!(decode("R:12,G:200"), Err(DecodeError::MissingChannels { found: 2 }));
    }

    #[test]
    fn non_numeric_tokens_are_rejected() {
        assert_eq!(decode("12,abc,5"), Err(DecodeError::InvalidNumber { token: "abc".to_string() }));
        assert_eq!(decode("Red,12,200,5"), Err(DecodeError::InvalidNumber { token: "Red".to_string() }));
        assert_eq!(decode("12,,5"), Err(DecodeError::InvalidNumber { token: "".to_string() }));
    }

    #[test]
    fn wrong_tag_order_is_rejected() {
        assert_eq!(decode("R:1,B:2,G:3"), Err(DecodeError::MalformedTag { token: "B:2".to_string() }));
    }

    #[test]
    fn invalid_utf8_is_rejected() {
        assert_eq!(decode_frame(&[0xff, 0xfe, 0x2c], SystemTime::UNIX_EPOCH), Err(DecodeError::NotText));
    }

    #[test]
    fn decoding_is_deterministic() {
        let captured_at = SystemTime::UNIX_EPOCH;
        for payload in ["R:0,G:0,B:0", "255,255,255,White", "R:7,G:8,B:9"] {
            assert_eq!(
                decode_frame(payload.as_bytes(), captured_at),
                decode_frame(payload.as_bytes(), captured_at),
            );
        }
    }
}
