//! Guacamole wire protocol: instruction model, escaping, streaming decode.

pub mod decoder;
pub mod instruction;

pub use decoder::InstructionDecoder;
pub use instruction::{ControlOp, Instruction, OP_NOP, OP_PING, OP_SESSION};
