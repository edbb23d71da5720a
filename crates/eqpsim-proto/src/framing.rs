//! Byte-stream framing codec.
//!
//! Three interchangeable policies split an inbound byte stream into frames
//! and wrap outbound payloads:
//!
//! - `LineEnd`: frames are terminated by LF, CR, or CRLF.
//! - `StartEnd`: frames are bracketed by start/end byte sequences; bytes
//!   outside a bracket pair are discarded (resynchronization).
//! - `Pattern`: a regex applied to the whole accumulation buffer; each match
//!   is one frame. Offsets are byte offsets, so payloads must be ASCII-safe;
//!   non-ASCII traffic should use one of the other policies.
//!
//! Decode and encode always use the same policy for one piece of equipment.

use bytes::{Buf, Bytes, BytesMut};

/// Accumulation ceiling for the pattern policy. A buffer that grows past
/// this without a match is a protocol violation: the buffer is discarded
/// whole and the connection must be closed. Truncating instead would break
/// resynchronization.
pub const MAX_PATTERN_BUFFER: usize = 256 * 1024;

/// Errors from framing construction and decoding.
#[derive(Debug, thiserror::Error)]
pub enum FramingError {
    /// Pattern-policy buffer exceeded [`MAX_PATTERN_BUFFER`] without a match.
    #[error("pattern buffer overflow: {size} bytes with no frame match")]
    BufferOverflow {
        /// Buffered byte count at the time of the overflow.
        size: usize,
    },

    /// The pattern matched an empty span, which can never delimit a frame.
    #[error("pattern produced an empty match")]
    EmptyMatch,

    /// Start/end marker sequences must be non-empty.
    #[error("start/end marker must not be empty")]
    EmptyMarker,

    /// The pattern failed to compile.
    #[error("invalid frame pattern: {0}")]
    Pattern(#[from] regex::Error),

    /// Hex descriptor contained a token that is not a byte.
    #[error("invalid hex token: {token}")]
    InvalidHex {
        /// The offending token from the descriptor string.
        token: String,
    },

    /// Hex descriptor parsed to zero bytes.
    #[error("hex sequence is blank")]
    BlankHex,
}

/// Line terminator for the `LineEnd` policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LineEnding {
    /// `\n`
    Lf,
    /// `\r`
    Cr,
    /// `\r\n`
    Crlf,
}

impl LineEnding {
    /// The terminator byte sequence.
    pub fn as_bytes(self) -> &'static [u8] {
        match self {
            Self::Lf => b"\n",
            Self::Cr => b"\r",
            Self::Crlf => b"\r\n",
        }
    }
}

/// Framing policy for one piece of equipment. Exactly one policy applies to
/// both directions of a connection.
#[derive(Debug, Clone)]
pub enum FramingPolicy {
    /// Frames terminated by a line ending; decode strips it, encode appends it.
    LineEnd(LineEnding),
    /// Frames bracketed by start/end sequences; decode strips both, encode
    /// wraps with both.
    StartEnd {
        /// Opening marker, non-empty.
        start: Vec<u8>,
        /// Closing marker, non-empty.
        end: Vec<u8>,
    },
    /// Frames located by a regex over the buffered bytes; encode passes the
    /// payload through unchanged (the counterpart frames by pattern too).
    Pattern(regex::bytes::Regex),
}

impl FramingPolicy {
    /// Build a `StartEnd` policy, rejecting empty markers.
    pub fn start_end(start: Vec<u8>, end: Vec<u8>) -> Result<Self, FramingError> {
        if start.is_empty() || end.is_empty() {
            return Err(FramingError::EmptyMarker);
        }
        Ok(Self::StartEnd { start, end })
    }

    /// Build a `Pattern` policy, rejecting patterns that match the empty
    /// string (such a pattern could never delimit frames).
    pub fn pattern(pattern: &str) -> Result<Self, FramingError> {
        let re = regex::bytes::Regex::new(pattern)?;
        if re.find(b"").is_some() {
            return Err(FramingError::EmptyMatch);
        }
        Ok(Self::Pattern(re))
    }

    /// Wrap a payload with this policy's framing markers.
    pub fn encode(&self, payload: &[u8]) -> Bytes {
        match self {
            Self::LineEnd(ending) => {
                let delim = ending.as_bytes();
                let mut out = BytesMut::with_capacity(payload.len() + delim.len());
                out.extend_from_slice(payload);
                out.extend_from_slice(delim);
                out.freeze()
            },
            Self::StartEnd { start, end } => {
                let mut out = BytesMut::with_capacity(start.len() + payload.len() + end.len());
                out.extend_from_slice(start);
                out.extend_from_slice(payload);
                out.extend_from_slice(end);
                out.freeze()
            },
            Self::Pattern(_) => Bytes::copy_from_slice(payload),
        }
    }

    /// Prefix/suffix byte counts this policy adds around a payload. Used by
    /// corrupt-injection to keep bit flips away from framing markers.
    pub fn overhead(&self) -> (usize, usize) {
        match self {
            Self::LineEnd(ending) => (0, ending.as_bytes().len()),
            Self::StartEnd { start, end } => (start.len(), end.len()),
            Self::Pattern(_) => (0, 0),
        }
    }
}

/// Stateful decoder: feed it raw bytes as they arrive, get complete frames
/// out with the framing markers stripped.
#[derive(Debug)]
pub struct FrameDecoder {
    policy: FramingPolicy,
    buf: BytesMut,
}

impl FrameDecoder {
    /// Create a decoder for the given policy.
    pub fn new(policy: FramingPolicy) -> Self {
        Self { policy, buf: BytesMut::new() }
    }

    /// Bytes currently buffered awaiting a frame boundary.
    pub fn buffered(&self) -> usize {
        self.buf.len()
    }

    /// Append `data` and extract every complete frame now available.
    ///
    /// # Errors
    ///
    /// Returns [`FramingError::BufferOverflow`] when the pattern policy's
    /// buffer exceeds the ceiling with no match (the buffer is discarded and
    /// the caller must close the connection), or [`FramingError::EmptyMatch`]
    /// if the pattern matches an empty span.
    pub fn push(&mut self, data: &[u8]) -> Result<Vec<Bytes>, FramingError> {
        self.buf.extend_from_slice(data);

        let mut frames = Vec::new();
        loop {
            let before = self.buf.len();
            match &self.policy {
                FramingPolicy::LineEnd(ending) => {
                    if !decode_delimited(&mut self.buf, ending.as_bytes(), &mut frames) {
                        break;
                    }
                },
                FramingPolicy::StartEnd { start, end } => {
                    if !decode_bracketed(&mut self.buf, start, end, &mut frames) {
                        break;
                    }
                },
                FramingPolicy::Pattern(re) => {
                    if !decode_pattern(&mut self.buf, re, &mut frames)? {
                        break;
                    }
                },
            }
            // Each successful pass must consume bytes, or we would spin.
            debug_assert!(self.buf.len() < before);
        }
        Ok(frames)
    }
}

/// First occurrence of `needle` in `haystack` at or after `from`.
fn find_sequence(haystack: &[u8], needle: &[u8], from: usize) -> Option<usize> {
    if needle.is_empty() || haystack.len() < from + needle.len() {
        return None;
    }
    haystack[from..].windows(needle.len()).position(|w| w == needle).map(|i| i + from)
}

fn decode_delimited(buf: &mut BytesMut, delim: &[u8], frames: &mut Vec<Bytes>) -> bool {
    let Some(idx) = find_sequence(buf, delim, 0) else {
        return false;
    };
    let frame = buf.split_to(idx).freeze();
    buf.advance(delim.len());
    frames.push(frame);
    true
}

fn decode_bracketed(buf: &mut BytesMut, start: &[u8], end: &[u8], frames: &mut Vec<Bytes>) -> bool {
    if buf.is_empty() {
        return false;
    }

    let Some(start_idx) = find_sequence(buf, start, 0) else {
        // No start marker: keep only the last start.len()-1 bytes, which may
        // be a partial marker straddling this delivery and the next.
        let keep = (start.len() - 1).min(buf.len());
        let discard = buf.len() - keep;
        if discard > 0 {
            buf.advance(discard);
        }
        return false;
    };

    // Garbage before the marker is dropped for resynchronization.
    if start_idx > 0 {
        buf.advance(start_idx);
    }

    let payload_start = start.len();
    let Some(end_idx) = find_sequence(buf, end, payload_start) else {
        return false;
    };

    buf.advance(payload_start);
    let frame = buf.split_to(end_idx - payload_start).freeze();
    buf.advance(end.len());
    frames.push(frame);
    true
}

fn decode_pattern(
    buf: &mut BytesMut,
    re: &regex::bytes::Regex,
    frames: &mut Vec<Bytes>,
) -> Result<bool, FramingError> {
    if buf.is_empty() {
        return Ok(false);
    }

    let Some((start, end)) = re.find(buf).map(|m| (m.start(), m.end())) else {
        if buf.len() > MAX_PATTERN_BUFFER {
            let size = buf.len();
            buf.clear();
            return Err(FramingError::BufferOverflow { size });
        }
        return Ok(false);
    };

    if end <= start {
        return Err(FramingError::EmptyMatch);
    }

    buf.advance(start);
    let frame = buf.split_to(end - start).freeze();
    frames.push(frame);
    Ok(true)
}

/// Parse a hex byte-sequence descriptor such as `"02"`, `"0x02 0x03"`,
/// `"02,03"`, or a compact even-length run of hex digits (`"0203"`).
pub fn parse_hex_sequence(input: &str) -> Result<Vec<u8>, FramingError> {
    let normalized = input.replace(',', " ");
    let mut out = Vec::new();

    for token in normalized.split_whitespace() {
        let t = token.strip_prefix("0x").or_else(|| token.strip_prefix("0X")).unwrap_or(token);

        let all_hex = !t.is_empty() && t.bytes().all(|b| b.is_ascii_hexdigit());
        if !all_hex {
            return Err(FramingError::InvalidHex { token: token.to_string() });
        }

        if t.len() > 2 {
            // Compact form: an even-length run is split into byte pairs.
            if t.len() % 2 != 0 {
                return Err(FramingError::InvalidHex { token: token.to_string() });
            }
            for i in (0..t.len()).step_by(2) {
                out.push(parse_hex_byte(&t[i..i + 2], token)?);
            }
        } else {
            out.push(parse_hex_byte(t, token)?);
        }
    }

    if out.is_empty() {
        return Err(FramingError::BlankHex);
    }
    Ok(out)
}

fn parse_hex_byte(digits: &str, original: &str) -> Result<u8, FramingError> {
    u8::from_str_radix(digits, 16)
        .map_err(|_| FramingError::InvalidHex { token: original.to_string() })
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    fn line_decoder(ending: LineEnding) -> FrameDecoder {
        FrameDecoder::new(FramingPolicy::LineEnd(ending))
    }

    #[test]
    fn lf_splits_multiple_frames() {
        let mut dec = line_decoder(LineEnding::Lf);
        let frames = dec.push(b"A\nB\n").unwrap();
        assert_eq!(frames, vec![Bytes::from_static(b"A"), Bytes::from_static(b"B")]);
        assert_eq!(dec.buffered(), 0);
    }

    #[test]
    fn crlf_split_across_deliveries() {
        let mut dec = line_decoder(LineEnding::Crlf);
        // The CR arrives in one delivery and the LF in the next.
        assert!(dec.push(b"HELLO\r").unwrap().is_empty());
        let frames = dec.push(b"\nWORLD\r\n").unwrap();
        assert_eq!(frames, vec![Bytes::from_static(b"HELLO"), Bytes::from_static(b"WORLD")]);
    }

    #[test]
    fn cr_inside_crlf_frame_is_payload() {
        let mut dec = line_decoder(LineEnding::Crlf);
        let frames = dec.push(b"A\rB\r\n").unwrap();
        assert_eq!(frames, vec![Bytes::from_static(b"A\rB")]);
    }

    #[test]
    fn bracket_discards_leading_garbage() {
        let policy = FramingPolicy::start_end(vec![0x02], vec![0x03]).unwrap();
        let mut dec = FrameDecoder::new(policy);
        let frames = dec.push(b"junk\x02PAYLOAD\x03").unwrap();
        assert_eq!(frames, vec![Bytes::from_static(b"PAYLOAD")]);
    }

    #[test]
    fn bracket_waits_for_end_marker() {
        let policy = FramingPolicy::start_end(vec![0x02], vec![0x03]).unwrap();
        let mut dec = FrameDecoder::new(policy);
        assert!(dec.push(b"\x02PART").unwrap().is_empty());
        let frames = dec.push(b"IAL\x03").unwrap();
        assert_eq!(frames, vec![Bytes::from_static(b"PARTIAL")]);
    }

    #[test]
    fn bracket_keeps_partial_start_prefix() {
        // Two-byte start marker delivered split across pushes, with garbage
        // in front: the decoder must retain the first marker byte.
        let policy = FramingPolicy::start_end(vec![0x1B, 0x02], vec![0x03]).unwrap();
        let mut dec = FrameDecoder::new(policy);
        assert!(dec.push(b"xxxx\x1b").unwrap().is_empty());
        let frames = dec.push(b"\x02OK\x03").unwrap();
        assert_eq!(frames, vec![Bytes::from_static(b"OK")]);
    }

    #[test]
    fn bracket_rejects_empty_markers() {
        assert!(FramingPolicy::start_end(vec![], vec![0x03]).is_err());
        assert!(FramingPolicy::start_end(vec![0x02], vec![]).is_err());
    }

    #[test]
    fn pattern_extracts_frames_in_order() {
        let policy = FramingPolicy::pattern(r"\{[^}]+\}").unwrap();
        let mut dec = FrameDecoder::new(policy);
        let frames = dec.push(b"{A}{B}").unwrap();
        assert_eq!(frames, vec![Bytes::from_static(b"{A}"), Bytes::from_static(b"{B}")]);
    }

    #[test]
    fn pattern_overflow_discards_whole_buffer() {
        let policy = FramingPolicy::pattern(r"NEVERMATCHES99").unwrap();
        let mut dec = FrameDecoder::new(policy);
        let big = vec![b'x'; MAX_PATTERN_BUFFER + 1];
        let err = dec.push(&big).unwrap_err();
        assert!(matches!(err, FramingError::BufferOverflow { .. }));
        assert_eq!(dec.buffered(), 0);
    }

    #[test]
    fn pattern_rejects_empty_matching_regex() {
        assert!(FramingPolicy::pattern(r"x*").is_err());
    }

    #[test]
    fn encode_line_end_appends_delimiter() {
        let policy = FramingPolicy::LineEnd(LineEnding::Crlf);
        assert_eq!(policy.encode(b"CMD=X"), Bytes::from_static(b"CMD=X\r\n"));
    }

    #[test]
    fn encode_bracket_wraps_payload() {
        let policy = FramingPolicy::start_end(vec![0x02], vec![0x03]).unwrap();
        assert_eq!(policy.encode(b"P"), Bytes::from_static(b"\x02P\x03"));
    }

    #[test]
    fn encode_pattern_passes_through() {
        let policy = FramingPolicy::pattern(r"\{[^}]+\}").unwrap();
        assert_eq!(policy.encode(b"{A}"), Bytes::from_static(b"{A}"));
    }

    #[test]
    fn overhead_per_policy() {
        assert_eq!(FramingPolicy::LineEnd(LineEnding::Lf).overhead(), (0, 1));
        assert_eq!(FramingPolicy::LineEnd(LineEnding::Crlf).overhead(), (0, 2));
        let bracket = FramingPolicy::start_end(vec![0x02, 0x02], vec![0x03]).unwrap();
        assert_eq!(bracket.overhead(), (2, 1));
        assert_eq!(FramingPolicy::pattern(r"\{[^}]+\}").unwrap().overhead(), (0, 0));
    }

    #[test]
    fn hex_descriptor_forms() {
        assert_eq!(parse_hex_sequence("02").unwrap(), vec![0x02]);
        assert_eq!(parse_hex_sequence("0x02 0x03").unwrap(), vec![0x02, 0x03]);
        assert_eq!(parse_hex_sequence("02,03").unwrap(), vec![0x02, 0x03]);
        assert_eq!(parse_hex_sequence("0203").unwrap(), vec![0x02, 0x03]);
        assert_eq!(parse_hex_sequence("a").unwrap(), vec![0x0a]);
        assert!(parse_hex_sequence("zz").is_err());
        assert!(parse_hex_sequence("  ").is_err());
        assert!(parse_hex_sequence("123").is_err());
    }

    mod properties {
        use proptest::prelude::*;

        use super::*;

        proptest! {
            #[test]
            fn line_end_round_trip(payload in "[ -~]{0,64}") {
                for ending in [LineEnding::Lf, LineEnding::Cr, LineEnding::Crlf] {
                    let policy = FramingPolicy::LineEnd(ending);
                    let mut dec = FrameDecoder::new(policy.clone());
                    let frames = dec.push(&policy.encode(payload.as_bytes())).unwrap();
                    prop_assert_eq!(frames.len(), 1);
                    prop_assert_eq!(&frames[0][..], payload.as_bytes());
                }
            }

            #[test]
            fn bracket_round_trip(payload in proptest::collection::vec(4u8..=255, 0..64)) {
                let policy = FramingPolicy::start_end(vec![0x02], vec![0x03]).unwrap();
                let mut dec = FrameDecoder::new(policy.clone());
                let frames = dec.push(&policy.encode(&payload)).unwrap();
                prop_assert_eq!(frames.len(), 1);
                prop_assert_eq!(&frames[0][..], &payload[..]);
            }

            #[test]
            fn arbitrary_chunking_yields_same_frames(
                input in "([A-Z]{1,8}\r\n){1,5}",
                split in 0usize..16,
            ) {
                let policy = FramingPolicy::LineEnd(LineEnding::Crlf);

                let mut whole = FrameDecoder::new(policy.clone());
                let expected = whole.push(input.as_bytes()).unwrap();

                let mut chunked = FrameDecoder::new(policy);
                let cut = split.min(input.len());
                let mut got = chunked.push(&input.as_bytes()[..cut]).unwrap();
                got.extend(chunked.push(&input.as_bytes()[cut..]).unwrap());

                prop_assert_eq!(got, expected);
            }
        }
    }
}
