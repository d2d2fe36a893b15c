//! Instruction set, decoding and encoding of method bodies.
//!
//! Method bodies are stored as a flat byte stream with inline operands. Branch operands
//! are signed byte offsets relative to the next instruction, so any transformation that
//! changes an instruction's size has to re-resolve every branch. To make that safe the
//! body is never edited in place:
//!
//! 1. [`decode_body`] turns the bytes into a `Vec<Instruction>` whose branch targets are
//!    instruction *indices*,
//! 2. callers transform the list,
//! 3. [`encode_body`] lays the list out again and recomputes every relative offset.
//!
//! # Example
//!
//! ```rust
//! use shadowbox::code::{decode_body, encode_body, Instruction};
//!
//! let body = vec![
//!     Instruction::Ldarg(0),
//!     Instruction::Brfalse(3),
//!     Instruction::Ret,
//!     Instruction::LdcI8(7),
//!     Instruction::Ret,
//! ];
//! let bytes = encode_body(&body)?;
//! assert_eq!(decode_body(&bytes)?, body);
//! # Ok::<(), shadowbox::Error>(())
//! ```

use std::fmt;

use strum::{Display, FromRepr};

use crate::{
    code::{CodeWriter, Parser},
    Result,
};

/// One-byte opcodes of the instruction set.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Display, FromRepr)]
#[repr(u8)]
pub enum Opcode {
    /// Do nothing
    #[strum(serialize = "nop")]
    Nop = 0x00,
    /// Push an `i64` constant
    #[strum(serialize = "ldc.i8")]
    LdcI8 = 0x01,
    /// Push a string constant
    #[strum(serialize = "ldstr")]
    Ldstr = 0x02,
    /// Push null
    #[strum(serialize = "ldnull")]
    Ldnull = 0x03,
    /// Push `true`
    #[strum(serialize = "ldtrue")]
    Ldtrue = 0x04,
    /// Push `false`
    #[strum(serialize = "ldfalse")]
    Ldfalse = 0x05,
    /// Push an argument (slot 0 is the receiver for instance methods)
    #[strum(serialize = "ldarg")]
    Ldarg = 0x06,
    /// Pop into an argument slot
    #[strum(serialize = "starg")]
    Starg = 0x07,
    /// Push a local
    #[strum(serialize = "ldloc")]
    Ldloc = 0x08,
    /// Pop into a local
    #[strum(serialize = "stloc")]
    Stloc = 0x09,
    /// Integer addition
    #[strum(serialize = "add")]
    Add = 0x0A,
    /// Integer subtraction
    #[strum(serialize = "sub")]
    Sub = 0x0B,
    /// Integer multiplication
    #[strum(serialize = "mul")]
    Mul = 0x0C,
    /// Equality comparison
    #[strum(serialize = "ceq")]
    Ceq = 0x0D,
    /// Integer less-than
    #[strum(serialize = "clt")]
    Clt = 0x0E,
    /// String concatenation of the two topmost values
    #[strum(serialize = "concat")]
    Concat = 0x0F,
    /// Discard the top value
    #[strum(serialize = "pop")]
    Pop = 0x10,
    /// Duplicate the top value
    #[strum(serialize = "dup")]
    Dup = 0x11,
    /// Unconditional branch
    #[strum(serialize = "br")]
    Br = 0x12,
    /// Branch if true / non-zero
    #[strum(serialize = "brtrue")]
    Brtrue = 0x13,
    /// Branch if false / zero / null
    #[strum(serialize = "brfalse")]
    Brfalse = 0x14,
    /// Load an object field
    #[strum(serialize = "ldfld")]
    Ldfld = 0x15,
    /// Store an object field
    #[strum(serialize = "stfld")]
    Stfld = 0x16,
    /// Static call
    #[strum(serialize = "call")]
    Call = 0x17,
    /// Instance call
    #[strum(serialize = "callvirt")]
    Callvirt = 0x18,
    /// Allocate and run a constructor
    #[strum(serialize = "newobj")]
    Newobj = 0x19,
    /// Return from the method
    #[strum(serialize = "ret")]
    Ret = 0x1A,
    /// Raise the top value as an error
    #[strum(serialize = "throw")]
    Throw = 0x1B,
    /// Rewritten call routed through the dispatch handler
    #[strum(serialize = "invoke")]
    Invoke = 0x30,
    /// Rewritten construction routed through the dispatch handler
    #[strum(serialize = "invoke.new")]
    InvokeNew = 0x31,
}

/// Whether a dispatched call carries a receiver.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Display, FromRepr)]
#[repr(u8)]
#[strum(serialize_all = "lowercase")]
pub enum CallKind {
    /// No receiver
    Static = 0,
    /// Receiver passed as the first stack operand
    Instance = 1,
}

/// A decoded instruction.
///
/// Branch targets are indices into the instruction list the instruction belongs to. Call
/// operands are indices into the class image's method-reference pool.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Instruction {
    /// `nop`
    Nop,
    /// `ldc.i8 <i64>`
    LdcI8(i64),
    /// `ldstr <str>`
    Ldstr(String),
    /// `ldnull`
    Ldnull,
    /// `ldtrue`
    Ldtrue,
    /// `ldfalse`
    Ldfalse,
    /// `ldarg <u8>`
    Ldarg(u8),
    /// `starg <u8>`
    Starg(u8),
    /// `ldloc <u8>`
    Ldloc(u8),
    /// `stloc <u8>`
    Stloc(u8),
    /// `add`
    Add,
    /// `sub`
    Sub,
    /// `mul`
    Mul,
    /// `ceq`
    Ceq,
    /// `clt`
    Clt,
    /// `concat`
    Concat,
    /// `pop`
    Pop,
    /// `dup`
    Dup,
    /// `br <target>`
    Br(usize),
    /// `brtrue <target>`
    Brtrue(usize),
    /// `brfalse <target>`
    Brfalse(usize),
    /// `ldfld <name>`
    Ldfld(String),
    /// `stfld <name>`
    Stfld(String),
    /// `call <ref>`
    Call(u16),
    /// `callvirt <ref>`
    Callvirt(u16),
    /// `newobj <ref>`
    Newobj(u16),
    /// `ret`
    Ret,
    /// `throw`
    Throw,
    /// `invoke <ref> <kind>`
    Invoke {
        /// Method-reference pool index of the original target
        method: u16,
        /// Whether a receiver is passed
        kind: CallKind,
    },
    /// `invoke.new <ref>`
    InvokeNew(u16),
}

impl Instruction {
    /// The opcode this instruction encodes to.
    #[must_use]
    pub fn opcode(&self) -> Opcode {
        match self {
            Instruction::Nop => Opcode::Nop,
            Instruction::LdcI8(_) => Opcode::LdcI8,
            Instruction::Ldstr(_) => Opcode::Ldstr,
            Instruction::Ldnull => Opcode::Ldnull,
            Instruction::Ldtrue => Opcode::Ldtrue,
            Instruction::Ldfalse => Opcode::Ldfalse,
            Instruction::Ldarg(_) => Opcode::Ldarg,
            Instruction::Starg(_) => Opcode::Starg,
            Instruction::Ldloc(_) => Opcode::Ldloc,
            Instruction::Stloc(_) => Opcode::Stloc,
            Instruction::Add => Opcode::Add,
            Instruction::Sub => Opcode::Sub,
            Instruction::Mul => Opcode::Mul,
            Instruction::Ceq => Opcode::Ceq,
            Instruction::Clt => Opcode::Clt,
            Instruction::Concat => Opcode::Concat,
            Instruction::Pop => Opcode::Pop,
            Instruction::Dup => Opcode::Dup,
            Instruction::Br(_) => Opcode::Br,
            Instruction::Brtrue(_) => Opcode::Brtrue,
            Instruction::Brfalse(_) => Opcode::Brfalse,
            Instruction::Ldfld(_) => Opcode::Ldfld,
            Instruction::Stfld(_) => Opcode::Stfld,
            Instruction::Call(_) => Opcode::Call,
            Instruction::Callvirt(_) => Opcode::Callvirt,
            Instruction::Newobj(_) => Opcode::Newobj,
            Instruction::Ret => Opcode::Ret,
            Instruction::Throw => Opcode::Throw,
            Instruction::Invoke { .. } => Opcode::Invoke,
            Instruction::InvokeNew(_) => Opcode::InvokeNew,
        }
    }

    /// Branch target index, if this is a branch.
    #[must_use]
    pub fn branch_target(&self) -> Option<usize> {
        match self {
            Instruction::Br(t) | Instruction::Brtrue(t) | Instruction::Brfalse(t) => Some(*t),
            _ => None,
        }
    }

    /// Method-reference pool index, if this instruction calls something.
    #[must_use]
    pub fn method_ref(&self) -> Option<u16> {
        match self {
            Instruction::Call(m)
            | Instruction::Callvirt(m)
            | Instruction::Newobj(m)
            | Instruction::InvokeNew(m)
            | Instruction::Invoke { method: m, .. } => Some(*m),
            _ => None,
        }
    }

    /// Returns `true` for the opcodes only the rewriter emits.
    #[must_use]
    pub fn is_dispatched(&self) -> bool {
        matches!(self, Instruction::Invoke { .. } | Instruction::InvokeNew(_))
    }

    /// Encoded size in bytes.
    fn encoded_size(&self) -> usize {
        match self {
            Instruction::LdcI8(_) => 9,
            Instruction::Ldstr(s) | Instruction::Ldfld(s) | Instruction::Stfld(s) => {
                1 + compressed_len(s.len()) + s.len()
            }
            Instruction::Ldarg(_)
            | Instruction::Starg(_)
            | Instruction::Ldloc(_)
            | Instruction::Stloc(_) => 2,
            Instruction::Br(_) | Instruction::Brtrue(_) | Instruction::Brfalse(_) => 5,
            Instruction::Call(_)
            | Instruction::Callvirt(_)
            | Instruction::Newobj(_)
            | Instruction::InvokeNew(_) => 3,
            Instruction::Invoke { .. } => 4,
            _ => 1,
        }
    }
}

fn compressed_len(len: usize) -> usize {
    match len {
        0..=0x7F => 1,
        0x80..=0x3FFF => 2,
        _ => 4,
    }
}

impl fmt::Display for Instruction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let op = self.opcode();
        match self {
            Instruction::LdcI8(v) => write!(f, "{op} {v}"),
            Instruction::Ldstr(s) => write!(f, "{op} {s:?}"),
            Instruction::Ldfld(s) | Instruction::Stfld(s) => write!(f, "{op} {s}"),
            Instruction::Ldarg(i)
            | Instruction::Starg(i)
            | Instruction::Ldloc(i)
            | Instruction::Stloc(i) => write!(f, "{op} {i}"),
            Instruction::Br(t) | Instruction::Brtrue(t) | Instruction::Brfalse(t) => {
                write!(f, "{op} IL_{t:04}")
            }
            Instruction::Call(m)
            | Instruction::Callvirt(m)
            | Instruction::Newobj(m)
            | Instruction::InvokeNew(m) => write!(f, "{op} ref#{m}"),
            Instruction::Invoke { method, kind } => write!(f, "{op} ref#{method} {kind}"),
            _ => write!(f, "{op}"),
        }
    }
}

/// Decodes a method body into an instruction list with index-based branch targets.
///
/// # Errors
///
/// Returns [`crate::Error::Malformed`] for unknown opcodes, invalid call kinds, and branches
/// that do not land on an instruction boundary inside the body, and
/// [`crate::Error::OutOfBounds`] for truncated operands.
pub fn decode_body(code: &[u8]) -> Result<Vec<Instruction>> {
    let mut parser = Parser::new(code);
    let mut offsets = Vec::new();
    // Branch targets hold absolute byte offsets until the second pass.
    let mut raw = Vec::new();

    while parser.has_more_data() {
        let start = parser.pos();
        let byte = parser.read_le::<u8>()?;
        let opcode = Opcode::from_repr(byte)
            .ok_or_else(|| malformed_error!("Unknown opcode 0x{:02X} at offset {}", byte, start))?;

        let instruction = match opcode {
            Opcode::Nop => Instruction::Nop,
            Opcode::LdcI8 => Instruction::LdcI8(parser.read_le()?),
            Opcode::Ldstr => Instruction::Ldstr(parser.read_prefixed_str()?.to_string()),
            Opcode::Ldnull => Instruction::Ldnull,
            Opcode::Ldtrue => Instruction::Ldtrue,
            Opcode::Ldfalse => Instruction::Ldfalse,
            Opcode::Ldarg => Instruction::Ldarg(parser.read_le()?),
            Opcode::Starg => Instruction::Starg(parser.read_le()?),
            Opcode::Ldloc => Instruction::Ldloc(parser.read_le()?),
            Opcode::Stloc => Instruction::Stloc(parser.read_le()?),
            Opcode::Add => Instruction::Add,
            Opcode::Sub => Instruction::Sub,
            Opcode::Mul => Instruction::Mul,
            Opcode::Ceq => Instruction::Ceq,
            Opcode::Clt => Instruction::Clt,
            Opcode::Concat => Instruction::Concat,
            Opcode::Pop => Instruction::Pop,
            Opcode::Dup => Instruction::Dup,
            Opcode::Br | Opcode::Brtrue | Opcode::Brfalse => {
                let rel = parser.read_le::<i32>()?;
                let target = absolute_target(parser.pos(), rel, start)?;
                match opcode {
                    Opcode::Br => Instruction::Br(target),
                    Opcode::Brtrue => Instruction::Brtrue(target),
                    _ => Instruction::Brfalse(target),
                }
            }
            Opcode::Ldfld => Instruction::Ldfld(parser.read_prefixed_str()?.to_string()),
            Opcode::Stfld => Instruction::Stfld(parser.read_prefixed_str()?.to_string()),
            Opcode::Call => Instruction::Call(parser.read_le()?),
            Opcode::Callvirt => Instruction::Callvirt(parser.read_le()?),
            Opcode::Newobj => Instruction::Newobj(parser.read_le()?),
            Opcode::Ret => Instruction::Ret,
            Opcode::Throw => Instruction::Throw,
            Opcode::Invoke => {
                let method = parser.read_le()?;
                let kind_byte = parser.read_le::<u8>()?;
                let kind = CallKind::from_repr(kind_byte).ok_or_else(|| {
                    malformed_error!("Invalid call kind {} at offset {}", kind_byte, start)
                })?;
                Instruction::Invoke { method, kind }
            }
            Opcode::InvokeNew => Instruction::InvokeNew(parser.read_le()?),
        };

        offsets.push(start);
        raw.push(instruction);
    }

    for instruction in &mut raw {
        let Some(offset) = instruction.branch_target() else {
            continue;
        };
        let index = offsets
            .binary_search(&offset)
            .map_err(|_| malformed_error!("Branch to offset {} is not an instruction", offset))?;
        match instruction {
            Instruction::Br(t) | Instruction::Brtrue(t) | Instruction::Brfalse(t) => *t = index,
            _ => {}
        }
    }

    Ok(raw)
}

fn absolute_target(next: usize, rel: i32, start: usize) -> Result<usize> {
    let next = i64::try_from(next).map_err(|_| malformed_error!("Body too large"))?;
    let target = next + i64::from(rel);
    usize::try_from(target)
        .map_err(|_| malformed_error!("Branch at offset {} jumps before the body", start))
}

/// Encodes an instruction list, resolving index-based branch targets to relative offsets.
///
/// Encoding is a pure function of the list: the same instructions always produce the same
/// bytes.
///
/// # Errors
///
/// Returns [`crate::Error::Malformed`] if a branch target index is outside the list or a
/// string operand is too long to encode.
pub fn encode_body(instructions: &[Instruction]) -> Result<Vec<u8>> {
    let mut offsets = Vec::with_capacity(instructions.len());
    let mut total = 0_usize;
    for instruction in instructions {
        offsets.push(total);
        total += instruction.encoded_size();
    }

    let mut writer = CodeWriter::new();
    for (index, instruction) in instructions.iter().enumerate() {
        writer.write_le(instruction.opcode() as u8);
        match instruction {
            Instruction::LdcI8(v) => writer.write_le(*v),
            Instruction::Ldstr(s) | Instruction::Ldfld(s) | Instruction::Stfld(s) => {
                writer.write_prefixed_str(s)?;
            }
            Instruction::Ldarg(i)
            | Instruction::Starg(i)
            | Instruction::Ldloc(i)
            | Instruction::Stloc(i) => writer.write_le(*i),
            Instruction::Br(t) | Instruction::Brtrue(t) | Instruction::Brfalse(t) => {
                let target = *offsets.get(*t).ok_or_else(|| {
                    malformed_error!("Branch at {} targets missing instruction {}", index, t)
                })?;
                let next = offsets[index] + instruction.encoded_size();
                let rel = i64::try_from(target).unwrap_or(i64::MAX)
                    - i64::try_from(next).unwrap_or(i64::MAX);
                let rel = i32::try_from(rel)
                    .map_err(|_| malformed_error!("Branch at {} is out of range", index))?;
                writer.write_le(rel);
            }
            Instruction::Call(m)
            | Instruction::Callvirt(m)
            | Instruction::Newobj(m)
            | Instruction::InvokeNew(m) => writer.write_le(*m),
            Instruction::Invoke { method, kind } => {
                writer.write_le(*method);
                writer.write_le(*kind as u8);
            }
            _ => {}
        }
    }

    Ok(writer.into_bytes())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Error;

    #[test]
    fn backward_branch_offsets() {
        // loop: ldarg 0; brtrue loop; ret
        let body = vec![Instruction::Ldarg(0), Instruction::Brtrue(0), Instruction::Ret];
        let bytes = encode_body(&body).unwrap();
        assert_eq!(bytes, vec![0x06, 0x00, 0x13, 0xF9, 0xFF, 0xFF, 0xFF, 0x1A]);
        assert_eq!(decode_body(&bytes).unwrap(), body);
    }

    #[test]
    fn resized_call_keeps_branches_valid() {
        let body = vec![
            Instruction::Br(2),
            Instruction::Call(0),
            Instruction::Ret,
        ];
        let mut rewritten = body.clone();
        rewritten[1] = Instruction::Invoke {
            method: 0,
            kind: CallKind::Static,
        };
        let original = encode_body(&body).unwrap();
        let resized = encode_body(&rewritten).unwrap();
        assert_eq!(resized.len(), original.len() + 1);
        assert_eq!(decode_body(&resized).unwrap(), rewritten);
    }

    #[test]
    fn unknown_opcode_is_malformed() {
        assert!(matches!(decode_body(&[0xEE]), Err(Error::Malformed { .. })));
    }

    #[test]
    fn branch_into_operand_is_malformed() {
        // br +(-3) lands in the middle of its own operand
        let bytes = [0x12, 0xFD, 0xFF, 0xFF, 0xFF];
        assert!(matches!(decode_body(&bytes), Err(Error::Malformed { .. })));
    }

    #[test]
    fn branch_before_body_is_malformed() {
        let bytes = [0x12, 0xF0, 0xFF, 0xFF, 0xFF];
        assert!(matches!(decode_body(&bytes), Err(Error::Malformed { .. })));
    }

    #[test]
    fn truncated_operand() {
        assert!(matches!(decode_body(&[0x01, 0x00]), Err(Error::OutOfBounds)));
    }

    #[test]
    fn encode_rejects_dangling_branch() {
        assert!(encode_body(&[Instruction::Br(5)]).is_err());
    }

    #[test]
    fn display_mnemonics() {
        assert_eq!(Instruction::LdcI8(3).to_string(), "ldc.i8 3");
        assert_eq!(
            Instruction::Invoke {
                method: 2,
                kind: CallKind::Instance
            }
            .to_string(),
            "invoke ref#2 instance"
        );
        assert_eq!(Instruction::InvokeNew(1).to_string(), "invoke.new ref#1");
    }
}
