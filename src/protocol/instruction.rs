//! Wire-format instructions and their encoding.
//!
//! An instruction is a comma-separated sequence of elements terminated by
//! `;`. The first element is the opcode, the rest are arguments. Within an
//! element a literal `,` is escaped as `\c`, a literal `;` as `\s`, and the
//! escape character itself as `\\`. Binary payloads travel as a single
//! base64-encoded element.
//!
//! Opcodes beginning with `.` form the reserved tunnel-internal namespace:
//! those instructions are consumed by the transport layer and never reach
//! the backend.

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use uuid::Uuid;

use crate::error::{GatewayError, Result};

/// Element separator on the wire.
pub const SEP: char = ',';
/// Instruction terminator on the wire.
pub const TERM: char = ';';

/// Prefix marking tunnel-internal opcodes (never forwarded to the backend).
pub const INTERNAL_PREFIX: char = '.';
/// Announces a freshly created session's id to the frontend.
pub const OP_SESSION: &str = ".session";
/// Keepalive round-trip; the transport echoes it back verbatim.
pub const OP_PING: &str = ".ping";
/// Padding/keepalive filler; dropped on receipt.
pub const OP_NOP: &str = ".nop";

/// A single wire-protocol message: opcode plus ordered string arguments.
///
/// The opcode is never empty. Any element may contain arbitrary text,
/// including separators — escaping is applied on encode and removed on
/// decode, so `decode(encode(x)) == x` holds for every valid instruction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Instruction {
    opcode: String,
    args: Vec<String>,
}

impl Instruction {
    pub fn new(opcode: impl Into<String>, args: Vec<String>) -> Self {
        let opcode = opcode.into();
        debug_assert!(!opcode.is_empty(), "instruction opcode must be non-empty");
        Self { opcode, args }
    }

    /// Shorthand for an instruction with no arguments.
    pub fn bare(opcode: impl Into<String>) -> Self {
        Self::new(opcode, Vec::new())
    }

    /// Build an instruction carrying one binary payload as a base64 element.
    pub fn with_blob(opcode: impl Into<String>, payload: &[u8]) -> Self {
        Self::new(opcode, vec![BASE64.encode(payload)])
    }

    pub fn opcode(&self) -> &str {
        &self.opcode
    }

    pub fn args(&self) -> &[String] {
        &self.args
    }

    pub fn arg(&self, index: usize) -> Option<&str> {
        self.args.get(index).map(String::as_str)
    }

    /// Decode argument `index` as a base64 binary payload.
    pub fn blob_arg(&self, index: usize) -> Result<Vec<u8>> {
        let raw = self
            .arg(index)
            .ok_or_else(|| GatewayError::Protocol(format!("{}: missing arg {index}", self.opcode)))?;
        BASE64
            .decode(raw)
            .map_err(|e| GatewayError::Protocol(format!("{}: invalid base64 arg: {e}", self.opcode)))
    }

    /// Whether this opcode belongs to the reserved tunnel-internal namespace.
    pub fn is_internal(&self) -> bool {
        self.opcode.starts_with(INTERNAL_PREFIX)
    }

    /// Serialize to wire form, escaping separators within elements.
    pub fn encode(&self) -> String {
        let mut out = String::with_capacity(self.wire_len());
        self.encode_into(&mut out);
        out
    }

    /// Append the wire form to an existing buffer (used by the batcher).
    pub fn encode_into(&self, out: &mut String) {
        escape_into(out, &self.opcode);
        for arg in &self.args {
            out.push(SEP);
            escape_into(out, arg);
        }
        out.push(TERM);
    }

    fn wire_len(&self) -> usize {
        // Separators + terminator; escapes grow the estimate lazily.
        self.opcode.len() + self.args.iter().map(|a| a.len() + 1).sum::<usize>() + 1
    }
}

fn escape_into(out: &mut String, element: &str) {
    for ch in element.chars() {
        match ch {
            '\\' => out.push_str("\\\\"),
            ',' => out.push_str("\\c"),
            ';' => out.push_str("\\s"),
            other => out.push(other),
        }
    }
}

/// Restore one raw wire element to its literal value.
pub(super) fn unescape(raw: &str) -> Result<String> {
    let mut out = String::with_capacity(raw.len());
    let mut chars = raw.chars();
    while let Some(ch) = chars.next() {
        if ch != '\\' {
            out.push(ch);
            continue;
        }
        match chars.next() {
            Some('\\') => out.push('\\'),
            Some('c') => out.push(','),
            Some('s') => out.push(';'),
            Some(other) => {
                return Err(GatewayError::Protocol(format!(
                    "invalid escape sequence \\{other}"
                )));
            }
            None => {
                return Err(GatewayError::Protocol(
                    "dangling escape at end of element".into(),
                ));
            }
        }
    }
    Ok(out)
}

/// Typed view of the control opcodes the session loop and transport filter
/// dispatch on. Everything else is opaque protocol data and passes through
/// to the backend untouched.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ControlOp {
    Mouse { x: i32, y: i32, mask: u32 },
    Key { keysym: u32, pressed: bool },
    Clipboard,
    Pause,
    Disconnect,
    Connect,
    Resume { id: Uuid },
    /// Tunnel-internal keepalive round-trip.
    Ping,
    /// Tunnel-internal padding; dropped.
    Nop,
    /// Any other tunnel-internal opcode (ignored).
    Internal,
    /// Opaque protocol-data opcode; forwarded as-is.
    Passthrough,
}

impl ControlOp {
    /// Classify an instruction, converting string arguments to typed values.
    /// Conversion failures are client protocol errors.
    pub fn parse(ins: &Instruction) -> Result<Self> {
        match ins.opcode() {
            "mouse" => Ok(Self::Mouse {
                x: int_arg(ins, 0)?,
                y: int_arg(ins, 1)?,
                mask: int_arg(ins, 2)?,
            }),
            "key" => Ok(Self::Key {
                keysym: int_arg(ins, 0)?,
                pressed: int_arg::<u32>(ins, 1)? != 0,
            }),
            "clipboard" => {
                if ins.arg(0).is_none() {
                    return Err(GatewayError::Protocol("clipboard: missing data".into()));
                }
                Ok(Self::Clipboard)
            }
            "pause" => Ok(Self::Pause),
            "disconnect" => Ok(Self::Disconnect),
            "connect" => Ok(Self::Connect),
            "resume" => {
                let raw = ins
                    .arg(0)
                    .ok_or_else(|| GatewayError::Protocol("resume: missing session id".into()))?;
                let id = raw
                    .parse::<Uuid>()
                    .map_err(|_| GatewayError::Protocol(format!("resume: bad session id {raw}")))?;
                Ok(Self::Resume { id })
            }
            OP_PING => Ok(Self::Ping),
            OP_NOP => Ok(Self::Nop),
            op if op.starts_with(INTERNAL_PREFIX) => Ok(Self::Internal),
            _ => Ok(Self::Passthrough),
        }
    }
}

fn int_arg<T: std::str::FromStr>(ins: &Instruction, index: usize) -> Result<T> {
    let raw = ins.arg(index).ok_or_else(|| {
        GatewayError::Protocol(format!("{}: missing arg {index}", ins.opcode()))
    })?;
    raw.parse::<T>().map_err(|_| {
        GatewayError::Protocol(format!("{}: non-numeric arg {raw:?}", ins.opcode()))
    })
}
