//! Assembler for class images.
//!
//! [`ClassBuilder`] produces the raw bytes a [`crate::runtime::ClassSource`] serves. Method
//! bodies are written through [`BodyAssembler`], which interns call targets into the class's
//! method-reference pool and resolves named labels into branch targets.
//!
//! # Examples
//!
//! ```rust
//! use shadowbox::code::{ClassBuilder, ClassImage};
//! use shadowbox::runtime::ValueKind;
//!
//! let bytes = ClassBuilder::new("app.Math")
//!     .static_method("abs", &[ValueKind::Int], ValueKind::Int, |asm| {
//!         asm.ldarg(0).ldc(0).clt().brfalse("positive")
//!             .ldc(0).ldarg(0).sub().ret()
//!             .label("positive")
//!             .ldarg(0).ret();
//!     })
//!     .build()?;
//!
//! let image = ClassImage::parse(&bytes)?;
//! assert_eq!(image.name, "app.Math");
//! # Ok::<(), shadowbox::Error>(())
//! ```

use std::collections::HashMap;

use crate::{
    code::{
        encode_body, ClassFlags, ClassImage, Instruction, MethodDef, MethodFlags, MethodRef,
        Opcode, RefFlags,
    },
    runtime::ValueKind,
    Error, Result,
};

/// Method name used for constructors.
pub const CONSTRUCTOR_NAME: &str = ".ctor";

enum Pending {
    Ready(Instruction),
    Branch(Opcode, String),
}

/// Instruction-level assembler for one method body.
pub struct BodyAssembler<'p> {
    pool: &'p mut Vec<MethodRef>,
    pending: Vec<Pending>,
    labels: HashMap<String, usize>,
    max_local: Option<u8>,
}

impl<'p> BodyAssembler<'p> {
    fn new(pool: &'p mut Vec<MethodRef>) -> Self {
        BodyAssembler {
            pool,
            pending: Vec::new(),
            labels: HashMap::new(),
            max_local: None,
        }
    }

    /// Emits an already-built instruction.
    pub fn emit(&mut self, instruction: Instruction) -> &mut Self {
        if let Instruction::Ldloc(slot) | Instruction::Stloc(slot) = instruction {
            self.max_local = Some(self.max_local.map_or(slot, |max| max.max(slot)));
        }
        self.pending.push(Pending::Ready(instruction));
        self
    }

    /// Marks the position of the next instruction with `name`.
    pub fn label(&mut self, name: &str) -> &mut Self {
        self.labels.insert(name.to_string(), self.pending.len());
        self
    }

    /// Emits `nop`.
    pub fn nop(&mut self) -> &mut Self {
        self.emit(Instruction::Nop)
    }

    /// Emits `ldc.i8`.
    pub fn ldc(&mut self, value: i64) -> &mut Self {
        self.emit(Instruction::LdcI8(value))
    }

    /// Emits `ldstr`.
    pub fn ldstr(&mut self, value: &str) -> &mut Self {
        self.emit(Instruction::Ldstr(value.to_string()))
    }

    /// Emits `ldnull`.
    pub fn ldnull(&mut self) -> &mut Self {
        self.emit(Instruction::Ldnull)
    }

    /// Emits `ldtrue`.
    pub fn ldtrue(&mut self) -> &mut Self {
        self.emit(Instruction::Ldtrue)
    }

    /// Emits `ldfalse`.
    pub fn ldfalse(&mut self) -> &mut Self {
        self.emit(Instruction::Ldfalse)
    }

    /// Emits `ldarg`.
    pub fn ldarg(&mut self, slot: u8) -> &mut Self {
        self.emit(Instruction::Ldarg(slot))
    }

    /// Emits `starg`.
    pub fn starg(&mut self, slot: u8) -> &mut Self {
        self.emit(Instruction::Starg(slot))
    }

    /// Emits `ldloc`.
    pub fn ldloc(&mut self, slot: u8) -> &mut Self {
        self.emit(Instruction::Ldloc(slot))
    }

    /// Emits `stloc`.
    pub fn stloc(&mut self, slot: u8) -> &mut Self {
        self.emit(Instruction::Stloc(slot))
    }

    /// Emits `add`.
    pub fn add(&mut self) -> &mut Self {
        self.emit(Instruction::Add)
    }

    /// Emits `sub`.
    pub fn sub(&mut self) -> &mut Self {
        self.emit(Instruction::Sub)
    }

    /// Emits `mul`.
    pub fn mul(&mut self) -> &mut Self {
        self.emit(Instruction::Mul)
    }

    /// Emits `ceq`.
    pub fn ceq(&mut self) -> &mut Self {
        self.emit(Instruction::Ceq)
    }

    /// Emits `clt`.
    pub fn clt(&mut self) -> &mut Self {
        self.emit(Instruction::Clt)
    }

    /// Emits `concat`.
    pub fn concat(&mut self) -> &mut Self {
        self.emit(Instruction::Concat)
    }

    /// Emits `pop`.
    pub fn pop(&mut self) -> &mut Self {
        self.emit(Instruction::Pop)
    }

    /// Emits `dup`.
    pub fn dup(&mut self) -> &mut Self {
        self.emit(Instruction::Dup)
    }

    /// Emits `ldfld`.
    pub fn ldfld(&mut self, field: &str) -> &mut Self {
        self.emit(Instruction::Ldfld(field.to_string()))
    }

    /// Emits `stfld`.
    pub fn stfld(&mut self, field: &str) -> &mut Self {
        self.emit(Instruction::Stfld(field.to_string()))
    }

    /// Emits `ret`.
    pub fn ret(&mut self) -> &mut Self {
        self.emit(Instruction::Ret)
    }

    /// Emits `throw`.
    pub fn throw(&mut self) -> &mut Self {
        self.emit(Instruction::Throw)
    }

    /// Unconditional branch to a label defined anywhere in the body.
    pub fn br(&mut self, label: &str) -> &mut Self {
        self.branch(Opcode::Br, label)
    }

    /// Branch to `label` if the popped value is true / non-zero.
    pub fn brtrue(&mut self, label: &str) -> &mut Self {
        self.branch(Opcode::Brtrue, label)
    }

    /// Branch to `label` if the popped value is false / zero / null.
    pub fn brfalse(&mut self, label: &str) -> &mut Self {
        self.branch(Opcode::Brfalse, label)
    }

    fn branch(&mut self, opcode: Opcode, label: &str) -> &mut Self {
        self.pending.push(Pending::Branch(opcode, label.to_string()));
        self
    }

    /// Static call into the loaded-module space.
    pub fn call(
        &mut self,
        owner: &str,
        name: &str,
        params: &[ValueKind],
        returns: ValueKind,
    ) -> &mut Self {
        let index = self.intern(owner, name, params, returns, RefFlags::empty());
        self.emit(Instruction::Call(index))
    }

    /// Instance call; the receiver is pushed before the arguments.
    pub fn callvirt(
        &mut self,
        owner: &str,
        name: &str,
        params: &[ValueKind],
        returns: ValueKind,
    ) -> &mut Self {
        let index = self.intern(owner, name, params, returns, RefFlags::empty());
        self.emit(Instruction::Callvirt(index))
    }

    /// Static call into code outside the loaded-module space.
    pub fn call_intrinsic(
        &mut self,
        owner: &str,
        name: &str,
        params: &[ValueKind],
        returns: ValueKind,
    ) -> &mut Self {
        let index = self.intern(owner, name, params, returns, RefFlags::INTRINSIC);
        self.emit(Instruction::Call(index))
    }

    /// Allocates an instance of `owner` and runs the constructor with `params`.
    pub fn newobj(&mut self, owner: &str, params: &[ValueKind]) -> &mut Self {
        let index = self.intern(
            owner,
            CONSTRUCTOR_NAME,
            params,
            ValueKind::Void,
            RefFlags::empty(),
        );
        self.emit(Instruction::Newobj(index))
    }

    fn intern(
        &mut self,
        owner: &str,
        name: &str,
        params: &[ValueKind],
        returns: ValueKind,
        flags: RefFlags,
    ) -> u16 {
        let entry = MethodRef {
            owner: owner.to_string(),
            name: name.to_string(),
            params: params.to_vec(),
            returns,
            flags,
        };
        let position = match self.pool.iter().position(|e| *e == entry) {
            Some(position) => position,
            None => {
                self.pool.push(entry);
                self.pool.len() - 1
            }
        };
        // Pools beyond u16 are rejected when the image is encoded.
        u16::try_from(position).unwrap_or(u16::MAX)
    }

    fn finish(self) -> Result<(Vec<u8>, u8)> {
        let mut instructions = Vec::with_capacity(self.pending.len());
        for pending in self.pending {
            let instruction = match pending {
                Pending::Ready(instruction) => instruction,
                Pending::Branch(opcode, label) => {
                    let target = *self
                        .labels
                        .get(&label)
                        .ok_or_else(|| malformed_error!("Undefined label '{}'", label))?;
                    match opcode {
                        Opcode::Br => Instruction::Br(target),
                        Opcode::Brtrue => Instruction::Brtrue(target),
                        _ => Instruction::Brfalse(target),
                    }
                }
            };
            instructions.push(instruction);
        }

        if instructions
            .iter()
            .filter_map(Instruction::branch_target)
            .any(|target| target >= instructions.len())
        {
            return Err(malformed_error!("Label placed after the last instruction"));
        }

        let locals = self.max_local.map_or(0, |max| max.saturating_add(1));
        Ok((encode_body(&instructions)?, locals))
    }
}

/// Fluent builder for a complete class image.
pub struct ClassBuilder {
    name: String,
    super_name: Option<String>,
    flags: ClassFlags,
    pool: Vec<MethodRef>,
    methods: Vec<MethodDef>,
    error: Option<Error>,
}

impl ClassBuilder {
    /// Starts a class called `name`.
    #[must_use]
    pub fn new(name: &str) -> Self {
        ClassBuilder {
            name: name.to_string(),
            super_name: None,
            flags: ClassFlags::empty(),
            pool: Vec::new(),
            methods: Vec::new(),
            error: None,
        }
    }

    /// Sets the super class.
    #[must_use]
    pub fn extends(mut self, super_name: &str) -> Self {
        self.super_name = Some(super_name.to_string());
        self
    }

    /// Overrides the class flags.
    #[must_use]
    pub fn flags(mut self, flags: ClassFlags) -> Self {
        self.flags = flags;
        self
    }

    /// Adds a method whose body is produced by `body`.
    ///
    /// The number of locals is derived from the highest local slot the body touches.
    #[must_use]
    pub fn method<F>(
        mut self,
        name: &str,
        flags: MethodFlags,
        params: &[ValueKind],
        returns: ValueKind,
        body: F,
    ) -> Self
    where
        F: FnOnce(&mut BodyAssembler<'_>),
    {
        let mut asm = BodyAssembler::new(&mut self.pool);
        body(&mut asm);
        match asm.finish() {
            Ok((code, locals)) => self.methods.push(MethodDef {
                name: name.to_string(),
                flags,
                params: params.to_vec(),
                returns,
                locals,
                code,
            }),
            Err(error) => {
                self.error.get_or_insert(error);
            }
        }
        self
    }

    /// Adds a static method.
    #[must_use]
    pub fn static_method<F>(
        self,
        name: &str,
        params: &[ValueKind],
        returns: ValueKind,
        body: F,
    ) -> Self
    where
        F: FnOnce(&mut BodyAssembler<'_>),
    {
        self.method(name, MethodFlags::STATIC, params, returns, body)
    }

    /// Adds an instance method. Argument slot 0 is the receiver.
    #[must_use]
    pub fn instance_method<F>(
        self,
        name: &str,
        params: &[ValueKind],
        returns: ValueKind,
        body: F,
    ) -> Self
    where
        F: FnOnce(&mut BodyAssembler<'_>),
    {
        self.method(name, MethodFlags::empty(), params, returns, body)
    }

    /// Adds a constructor. Argument slot 0 is the new instance.
    #[must_use]
    pub fn constructor<F>(self, params: &[ValueKind], body: F) -> Self
    where
        F: FnOnce(&mut BodyAssembler<'_>),
    {
        self.method(
            CONSTRUCTOR_NAME,
            MethodFlags::CONSTRUCTOR,
            params,
            ValueKind::Void,
            body,
        )
    }

    /// Adds a body-less method provided by the platform.
    #[must_use]
    pub fn native_method(
        mut self,
        name: &str,
        flags: MethodFlags,
        params: &[ValueKind],
        returns: ValueKind,
    ) -> Self {
        self.methods.push(MethodDef {
            name: name.to_string(),
            flags: flags | MethodFlags::NATIVE,
            params: params.to_vec(),
            returns,
            locals: 0,
            code: Vec::new(),
        });
        self
    }

    /// Finishes the image without encoding it.
    ///
    /// # Errors
    /// Returns the first assembly error, such as a branch to an undefined label.
    pub fn build_image(self) -> Result<ClassImage> {
        if let Some(error) = self.error {
            return Err(error);
        }
        Ok(ClassImage {
            flags: self.flags,
            name: self.name,
            super_name: self.super_name,
            pool: self.pool,
            methods: self.methods,
        })
    }

    /// Finishes and encodes the image.
    ///
    /// # Errors
    /// Returns the first assembly or encoding error.
    pub fn build(self) -> Result<Vec<u8>> {
        self.build_image()?.to_bytes()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pool_entries_are_interned() {
        let image = ClassBuilder::new("app.A")
            .static_method("f", &[], ValueKind::Int, |asm| {
                asm.call("app.B", "g", &[], ValueKind::Int)
                    .call("app.B", "g", &[], ValueKind::Int)
                    .add()
                    .ret();
            })
            .static_method("h", &[], ValueKind::Int, |asm| {
                asm.call("app.B", "g", &[], ValueKind::Int).ret();
            })
            .build_image()
            .unwrap();
        assert_eq!(image.pool.len(), 1);
    }

    #[test]
    fn intrinsic_and_regular_refs_are_distinct() {
        let image = ClassBuilder::new("app.A")
            .static_method("f", &[], ValueKind::Void, |asm| {
                asm.call("sys.Clock", "now", &[], ValueKind::Int)
                    .pop()
                    .call_intrinsic("sys.Clock", "now", &[], ValueKind::Int)
                    .pop()
                    .ret();
            })
            .build_image()
            .unwrap();
        assert_eq!(image.pool.len(), 2);
        assert!(image.pool[1].is_intrinsic());
    }

    #[test]
    fn locals_follow_highest_slot() {
        let image = ClassBuilder::new("app.A")
            .static_method("f", &[], ValueKind::Int, |asm| {
                asm.ldc(1).stloc(2).ldloc(2).ret();
            })
            .build_image()
            .unwrap();
        assert_eq!(image.methods[0].locals, 3);
    }

    #[test]
    fn undefined_label_fails_build() {
        let result = ClassBuilder::new("app.A")
            .static_method("f", &[], ValueKind::Void, |asm| {
                asm.br("nowhere").ret();
            })
            .build();
        assert!(result.is_err());
    }

    #[test]
    fn forward_branch_resolves() {
        let image = ClassBuilder::new("app.A")
            .static_method("f", &[ValueKind::Bool], ValueKind::Int, |asm| {
                asm.ldarg(0)
                    .brtrue("yes")
                    .ldc(0)
                    .ret()
                    .label("yes")
                    .ldc(1)
                    .ret();
            })
            .build_image()
            .unwrap();
        let body = image.methods[0].instructions().unwrap();
        assert_eq!(body[1], Instruction::Brtrue(4));
    }
}
