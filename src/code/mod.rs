//! Code-object binary format.
//!
//! Everything the loader defines and the rewriter transforms is a class image in this
//! format. The module is split the usual way for a binary format:
//!
//! - [`io`] / [`Parser`] / [`CodeWriter`] - primitive reads and writes
//! - [`instruction`] - the instruction set and body decode / encode
//! - [`image`] - the class container
//! - [`builder`] - an assembler for producing images from code
//!
//! Decoding and encoding are pure functions; nothing here mutates an input buffer.

pub mod builder;
pub mod image;
pub mod instruction;
pub mod io;
mod parser;
mod writer;

pub use builder::{BodyAssembler, ClassBuilder, CONSTRUCTOR_NAME};
pub use image::{
    ClassFlags, ClassImage, MethodDef, MethodFlags, MethodRef, RefFlags, CLASS_MAGIC,
    CLASS_VERSION,
};
pub use instruction::{decode_body, encode_body, CallKind, Instruction, Opcode};
pub use io::{read_le_at, write_le, CodeIO};
pub use parser::Parser;
pub use writer::{CodeWriter, MAX_COMPRESSED_UINT};
