//! Streaming instruction decoder.
//!
//! Input arrives in arbitrary chunks (TCP segments, WebSocket frames, HTTP
//! bodies) that need not align with instruction boundaries — or even with
//! UTF-8 character boundaries. The decoder accumulates bytes in a growable
//! cursor buffer and scans for an unescaped terminator, persisting both the
//! scan position and the escape state across pushes so each byte is examined
//! exactly once.
//!
//! All separators are ASCII, so scanning bytes is safe regardless of where
//! multi-byte characters were split; elements are validated as UTF-8 only
//! once a complete instruction has been framed.

use crate::error::{GatewayError, Result};

use super::instruction::{unescape, Instruction};

/// Upper bound on a single instruction's wire length. Anything larger is a
/// protocol error rather than an unbounded allocation.
const MAX_INSTRUCTION_BYTES: usize = 512 * 1024;

/// Incremental decoder for the wire format.
///
/// Feed bytes with [`push`](Self::push), then drain completed instructions
/// with [`poll`](Self::poll): `Ok(Some(_))` per complete instruction,
/// `Ok(None)` when the terminator has not arrived yet, `Err(_)` on a framing
/// violation.
#[derive(Debug, Default)]
pub struct InstructionDecoder {
    buf: Vec<u8>,
    /// First byte not yet scanned for a terminator.
    scan_pos: usize,
    /// A backslash was the last scanned byte and its partner hasn't arrived.
    escaped: bool,
}

impl InstructionDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append raw bytes received from the transport.
    pub fn push(&mut self, bytes: &[u8]) {
        self.buf.extend_from_slice(bytes);
    }

    pub fn push_str(&mut self, text: &str) {
        self.push(text.as_bytes());
    }

    /// Bytes buffered but not yet framed into an instruction.
    pub fn pending(&self) -> usize {
        self.buf.len()
    }

    /// Try to frame the next complete instruction.
    pub fn poll(&mut self) -> Result<Option<Instruction>> {
        let Some(term) = self.scan_terminator() else {
            if self.buf.len() > MAX_INSTRUCTION_BYTES {
                return Err(GatewayError::Protocol(format!(
                    "instruction exceeds {MAX_INSTRUCTION_BYTES} bytes without terminator"
                )));
            }
            return Ok(None);
        };

        let raw: Vec<u8> = self.buf.drain(..=term).collect();
        self.scan_pos = 0;
        self.escaped = false;

        // Drop the trailing ';' and split on unescaped commas.
        decode_elements(&raw[..raw.len() - 1])
    }

    /// Scan forward for an unescaped `;`, remembering progress for the next
    /// call when none is found.
    fn scan_terminator(&mut self) -> Option<usize> {
        let mut i = self.scan_pos;
        while i < self.buf.len() {
            let b = self.buf[i];
            if self.escaped {
                self.escaped = false;
            } else if b == b'\\' {
                self.escaped = true;
            } else if b == b';' {
                self.scan_pos = i + 1;
                return Some(i);
            }
            i += 1;
        }
        self.scan_pos = i;
        None
    }
}

/// Split a terminator-stripped instruction body into unescaped elements.
fn decode_elements(raw: &[u8]) -> Result<Option<Instruction>> {
    let body = std::str::from_utf8(raw)
        .map_err(|e| GatewayError::Protocol(format!("instruction is not valid UTF-8: {e}")))?;

    let mut elements = Vec::new();
    let mut start = 0;
    let mut escaped = false;
    for (i, b) in body.bytes().enumerate() {
        if escaped {
            escaped = false;
        } else if b == b'\\' {
            escaped = true;
        } else if b == b',' {
            elements.push(unescape(&body[start..i])?);
            start = i + 1;
        }
    }
    elements.push(unescape(&body[start..])?);

    let mut iter = elements.into_iter();
    let opcode = iter.next().unwrap_or_default();
    if opcode.is_empty() {
        return Err(GatewayError::Protocol("empty opcode".into()));
    }
    Ok(Some(Instruction::new(opcode, iter.collect())))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn decode_all(decoder: &mut InstructionDecoder) -> Vec<Instruction> {
        let mut out = Vec::new();
        while let Some(ins) = decoder.poll().unwrap() {
            out.push(ins);
        }
        out
    }

    #[test]
    fn test_decode_simple() {
        let mut d = InstructionDecoder::new();
        d.push_str("mouse,10,20,1;");
        let ins = d.poll().unwrap().unwrap();
        assert_eq!(ins.opcode(), "mouse");
        assert_eq!(ins.args(), &["10", "20", "1"]);
        assert!(d.poll().unwrap().is_none());
    }

    #[test]
    fn test_decode_unescapes_comma() {
        let mut d = InstructionDecoder::new();
        d.push_str("clipboard,a\\cb;");
        let ins = d.poll().unwrap().unwrap();
        assert_eq!(ins.args(), &["a,b"]);
    }

    #[test]
    fn test_incomplete_returns_none_then_completes() {
        let mut d = InstructionDecoder::new();
        d.push_str("key,655");
        assert!(d.poll().unwrap().is_none());
        d.push_str("07,1;");
        let ins = d.poll().unwrap().unwrap();
        assert_eq!(ins.opcode(), "key");
        assert_eq!(ins.args(), &["65507", "1"]);
    }

    #[test]
    fn test_escape_state_survives_chunk_boundary() {
        // Split exactly between the backslash and its partner: the ';' that
        // follows in the second chunk is escaped, not a terminator.
        let mut d = InstructionDecoder::new();
        d.push_str("clipboard,x\\");
        assert!(d.poll().unwrap().is_none());
        d.push_str("sy;");
        let ins = d.poll().unwrap().unwrap();
        assert_eq!(ins.args(), &["x;y"]);
    }

    #[test]
    fn test_multiple_instructions_in_one_chunk() {
        let mut d = InstructionDecoder::new();
        d.push_str("mouse,1,2,0;key,97,1;");
        let all = decode_all(&mut d);
        assert_eq!(all.len(), 2);
        assert_eq!(all[0].opcode(), "mouse");
        assert_eq!(all[1].opcode(), "key");
    }

    #[test]
    fn test_empty_opcode_is_error() {
        let mut d = InstructionDecoder::new();
        d.push_str(";");
        assert!(d.poll().is_err());
    }

    #[test]
    fn test_utf8_split_across_chunks() {
        let encoded = Instruction::new("clipboard", vec!["héllo".into()]).encode();
        let bytes = encoded.as_bytes();
        // Split inside the two-byte 'é'.
        let split = encoded.find('é').unwrap() + 1;
        let mut d = InstructionDecoder::new();
        d.push(&bytes[..split]);
        assert!(d.poll().unwrap().is_none());
        d.push(&bytes[split..]);
        let ins = d.poll().unwrap().unwrap();
        assert_eq!(ins.args(), &["héllo"]);
    }

    #[test]
    fn test_round_trip_with_all_specials() {
        let original = Instruction::new(
            "clipboard",
            vec!["a,b".into(), "c;d".into(), "e\\f".into(), String::new()],
        );
        let mut d = InstructionDecoder::new();
        d.push_str(&original.encode());
        assert_eq!(d.poll().unwrap().unwrap(), original);
    }

    #[test]
    fn test_round_trip_byte_at_a_time() {
        let original = Instruction::new("clipboard", vec!["a,b;c\\d".into()]);
        let wire = original.encode();
        let mut d = InstructionDecoder::new();
        let mut decoded = None;
        for b in wire.as_bytes() {
            d.push(&[*b]);
            if let Some(ins) = d.poll().unwrap() {
                decoded = Some(ins);
            }
        }
        assert_eq!(decoded.unwrap(), original);
    }
}
