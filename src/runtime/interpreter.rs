//! Method body interpreter.
//!
//! The [`Interpreter`] runs one method body at a time. Each instruction is executed by
//! [`Interpreter::step`], which reports a [`StepResult`]; the driving loop in
//! [`Interpreter::execute`] advances the instruction index, follows branches, and performs
//! calls on behalf of the step. Keeping calls out of `step` lets one place decide how a
//! call is carried out:
//!
//! - `call` / `callvirt` / `newobj` (code the rewriter left alone) run the original target
//!   directly through the interpreter's own dispatch handler
//! - `invoke` / `invoke.new` (rewritten call sites) go through the dispatch handler bound
//!   to the current thread
//!
//! Call depth and the instruction budget are tracked per thread across nested calls,
//! including calls that pass through shadow code.

use std::{cell::Cell, sync::Arc};

use crate::{
    code::{CallKind, Instruction, MethodDef, MethodRef},
    dispatch::{CallTarget, DispatchHandler},
    runtime::{LoadedClass, ObjectRef, Value, ValueKind},
    sandbox::scope,
    DispatchError, Error, Result,
};

thread_local! {
    static CALL_DEPTH: Cell<usize> = const { Cell::new(0) };
    static EXECUTED: Cell<u64> = const { Cell::new(0) };
}

/// Execution limits enforced by the interpreter.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ExecutionLimits {
    /// Maximum nesting of interpreted method bodies
    pub max_call_depth: usize,
    /// Maximum instructions per outermost call, 0 for unlimited
    pub max_instructions: u64,
}

/// How a requested call is carried out.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CallMode {
    /// Run the original target without consulting dispatch
    Direct,
    /// Route through the current thread's dispatch handler
    Dispatched,
}

/// A call requested by an instruction.
#[derive(Clone, Debug)]
pub struct CallRequest {
    /// Original target
    pub target: CallTarget,
    /// Receiver for instance calls
    pub receiver: Option<ObjectRef>,
    /// Arguments, receiver excluded
    pub args: Vec<Value>,
    /// Direct or dispatched
    pub mode: CallMode,
    /// Allocate a new instance and run the target as its constructor
    pub construct: bool,
}

/// Outcome of executing one instruction.
#[derive(Debug)]
pub enum StepResult {
    /// Continue with the next instruction
    Continue,
    /// Continue at instruction index `target`
    Branch {
        /// Instruction index
        target: usize,
    },
    /// The method returned
    Return {
        /// Returned value, `Void` for void methods
        value: Value,
    },
    /// Perform a call and push its result
    Call(CallRequest),
}

struct DepthGuard;

impl DepthGuard {
    fn enter(limits: &ExecutionLimits) -> Result<Self> {
        let depth = CALL_DEPTH.with(Cell::get) + 1;
        if depth > limits.max_call_depth {
            return Err(DispatchError::CallDepthExceeded(limits.max_call_depth).into());
        }
        if depth == 1 {
            EXECUTED.with(|c| c.set(0));
        }
        CALL_DEPTH.with(|d| d.set(depth));
        Ok(DepthGuard)
    }
}

impl Drop for DepthGuard {
    fn drop(&mut self) {
        CALL_DEPTH.with(|d| d.set(d.get().saturating_sub(1)));
    }
}

/// Evaluation state of one method invocation.
#[derive(Debug)]
pub struct Frame {
    args: Vec<Value>,
    locals: Vec<Value>,
    stack: Vec<Value>,
}

impl Frame {
    /// Creates a frame with `args` and `locals` null-initialized local slots.
    #[must_use]
    pub fn new(args: Vec<Value>, locals: u8) -> Self {
        Frame {
            args,
            locals: vec![Value::Null; usize::from(locals)],
            stack: Vec::new(),
        }
    }

    fn push(&mut self, value: Value) {
        self.stack.push(value);
    }

    fn pop(&mut self) -> Result<Value> {
        self.stack
            .pop()
            .ok_or_else(|| DispatchError::StackUnderflow.into())
    }

    fn pop_n(&mut self, count: usize) -> Result<Vec<Value>> {
        if self.stack.len() < count {
            return Err(DispatchError::StackUnderflow.into());
        }
        Ok(self.stack.split_off(self.stack.len() - count))
    }

    fn slot(slots: &mut [Value], index: u8) -> Result<&mut Value> {
        slots
            .get_mut(usize::from(index))
            .ok_or_else(|| DispatchError::InvalidSlot(index).into())
    }
}

/// Interpreter for the method bodies of one module space.
pub struct Interpreter<'h> {
    handler: &'h DispatchHandler,
    limits: ExecutionLimits,
}

impl<'h> Interpreter<'h> {
    /// Creates an interpreter that performs direct calls through `handler`.
    #[must_use]
    pub fn new(handler: &'h DispatchHandler, limits: ExecutionLimits) -> Self {
        Interpreter { handler, limits }
    }

    /// Runs method `index` of `class` with `args` (receiver first for instance methods).
    ///
    /// Native methods have no body and return the default value of their return kind.
    ///
    /// # Errors
    ///
    /// Returns engine errors for malformed execution (stack underflow, bad slots, type
    /// mismatches, exceeded limits), and relays errors raised by callees unchanged.
    pub fn execute(&self, class: &Arc<LoadedClass>, index: usize, args: Vec<Value>) -> Result<Value> {
        let method = class
            .image()
            .methods
            .get(index)
            .ok_or_else(|| DispatchError::MethodNotFound(format!("{}#{}", class.name(), index)))?;

        let Some(body) = class.body(index) else {
            return Ok(method.returns.default_value());
        };

        let _depth = DepthGuard::enter(&self.limits)?;
        let mut frame = Frame::new(args, method.locals);
        let mut ip = 0_usize;

        while let Some(instruction) = body.get(ip) {
            self.count_instruction()?;
            match self.step(&mut frame, class, method, instruction)? {
                StepResult::Continue => ip += 1,
                StepResult::Branch { target } => ip = target,
                StepResult::Return { value } => return Ok(value),
                StepResult::Call(request) => {
                    let returns = request.target.returns;
                    let construct = request.construct;
                    let result = self.perform(request)?;
                    if construct || returns != ValueKind::Void {
                        frame.push(result);
                    }
                    ip += 1;
                }
            }
        }

        if method.returns == ValueKind::Void {
            return Ok(Value::Void);
        }
        Err(malformed_error!(
            "Method '{}::{}' ends without returning a value",
            class.name(),
            method.name
        ))
    }

    fn count_instruction(&self) -> Result<()> {
        let executed = EXECUTED.with(|c| {
            let next = c.get() + 1;
            c.set(next);
            next
        });
        if self.limits.max_instructions != 0 && executed > self.limits.max_instructions {
            return Err(DispatchError::InstructionLimitExceeded(self.limits.max_instructions).into());
        }
        Ok(())
    }

    fn perform(&self, request: CallRequest) -> Result<Value> {
        let CallRequest {
            target,
            receiver,
            args,
            mode,
            construct,
        } = request;

        match (mode, construct) {
            (CallMode::Direct, false) => self.handler.call_original(&target, receiver, args),
            (CallMode::Direct, true) => {
                Ok(Value::Object(self.handler.construct_original(&target, args)?))
            }
            (CallMode::Dispatched, false) => scope::current_handler()?.invoke(&target, receiver, args),
            (CallMode::Dispatched, true) => {
                Ok(Value::Object(scope::current_handler()?.construct(&target, args)?))
            }
        }
    }

    /// Executes a single instruction against `frame`.
    ///
    /// # Errors
    ///
    /// Returns an error for stack underflow, invalid slots, type mismatches, unknown
    /// objects, and `throw`.
    pub fn step(
        &self,
        frame: &mut Frame,
        class: &LoadedClass,
        method: &MethodDef,
        instruction: &Instruction,
    ) -> Result<StepResult> {
        match instruction {
            Instruction::Nop => {}
            Instruction::LdcI8(v) => frame.push(Value::Int(*v)),
            Instruction::Ldstr(s) => frame.push(Value::str(s)),
            Instruction::Ldnull => frame.push(Value::Null),
            Instruction::Ldtrue => frame.push(Value::Bool(true)),
            Instruction::Ldfalse => frame.push(Value::Bool(false)),
            Instruction::Ldarg(i) => {
                let value = Frame::slot(&mut frame.args, *i)?.clone();
                frame.push(value);
            }
            Instruction::Starg(i) => {
                let value = frame.pop()?;
                *Frame::slot(&mut frame.args, *i)? = value;
            }
            Instruction::Ldloc(i) => {
                let value = Frame::slot(&mut frame.locals, *i)?.clone();
                frame.push(value);
            }
            Instruction::Stloc(i) => {
                let value = frame.pop()?;
                *Frame::slot(&mut frame.locals, *i)? = value;
            }
            Instruction::Add | Instruction::Sub | Instruction::Mul => {
                let b = frame.pop()?.as_int()?;
                let a = frame.pop()?.as_int()?;
                frame.push(Value::Int(match instruction {
                    Instruction::Add => a.wrapping_add(b),
                    Instruction::Sub => a.wrapping_sub(b),
                    _ => a.wrapping_mul(b),
                }));
            }
            Instruction::Ceq => {
                let b = frame.pop()?;
                let a = frame.pop()?;
                frame.push(Value::Bool(a == b));
            }
            Instruction::Clt => {
                let b = frame.pop()?.as_int()?;
                let a = frame.pop()?.as_int()?;
                frame.push(Value::Bool(a < b));
            }
            Instruction::Concat => {
                let b = frame.pop()?;
                let a = frame.pop()?;
                frame.push(Value::str(format!("{}{}", text(&a), text(&b))));
            }
            Instruction::Pop => {
                frame.pop()?;
            }
            Instruction::Dup => {
                let value = frame.pop()?;
                frame.push(value.clone());
                frame.push(value);
            }
            Instruction::Br(target) => return Ok(StepResult::Branch { target: *target }),
            Instruction::Brtrue(target) | Instruction::Brfalse(target) => {
                let taken = truthy(&frame.pop()?) == matches!(instruction, Instruction::Brtrue(_));
                if taken {
                    return Ok(StepResult::Branch { target: *target });
                }
            }
            Instruction::Ldfld(field) => {
                let obj = frame.pop()?.as_object()?;
                let value = self.handler.heap().get_field(obj, field)?;
                frame.push(value);
            }
            Instruction::Stfld(field) => {
                let value = frame.pop()?;
                let obj = frame.pop()?.as_object()?;
                self.handler.heap().set_field(obj, field, value)?;
            }
            Instruction::Call(m) => {
                return self.call_request(frame, class, *m, CallKind::Static, CallMode::Direct)
            }
            Instruction::Callvirt(m) => {
                return self.call_request(frame, class, *m, CallKind::Instance, CallMode::Direct)
            }
            Instruction::Invoke { method: m, kind } => {
                return self.call_request(frame, class, *m, *kind, CallMode::Dispatched)
            }
            Instruction::Newobj(m) => return self.construct_request(frame, class, *m, CallMode::Direct),
            Instruction::InvokeNew(m) => {
                return self.construct_request(frame, class, *m, CallMode::Dispatched)
            }
            Instruction::Ret => {
                let value = if method.returns == ValueKind::Void {
                    Value::Void
                } else {
                    frame.pop()?
                };
                return Ok(StepResult::Return { value });
            }
            Instruction::Throw => return Err(Error::Thrown(frame.pop()?)),
        }
        Ok(StepResult::Continue)
    }

    fn pool_entry<'c>(class: &'c LoadedClass, index: u16) -> Result<&'c MethodRef> {
        class.image().pool.get(usize::from(index)).ok_or_else(|| {
            malformed_error!("Missing pool entry {} in '{}'", index, class.name())
        })
    }

    fn call_request(
        &self,
        frame: &mut Frame,
        class: &LoadedClass,
        index: u16,
        kind: CallKind,
        mode: CallMode,
    ) -> Result<StepResult> {
        let entry = Self::pool_entry(class, index)?;
        let target = CallTarget::from_ref(entry, kind);
        let args = frame.pop_n(entry.params.len())?;
        let receiver = match kind {
            CallKind::Static => None,
            CallKind::Instance => match frame.pop()? {
                Value::Object(obj) => Some(obj),
                _ => return Err(DispatchError::MissingReceiver(target.signature.to_string()).into()),
            },
        };
        Ok(StepResult::Call(CallRequest {
            target,
            receiver,
            args,
            mode,
            construct: false,
        }))
    }

    fn construct_request(
        &self,
        frame: &mut Frame,
        class: &LoadedClass,
        index: u16,
        mode: CallMode,
    ) -> Result<StepResult> {
        let entry = Self::pool_entry(class, index)?;
        let args = frame.pop_n(entry.params.len())?;
        Ok(StepResult::Call(CallRequest {
            target: CallTarget::from_ref(entry, CallKind::Instance),
            receiver: None,
            args,
            mode,
            construct: true,
        }))
    }
}

fn truthy(value: &Value) -> bool {
    match value {
        Value::Void | Value::Null => false,
        Value::Bool(b) => *b,
        Value::Int(v) => *v != 0,
        Value::Str(_) | Value::Object(_) => true,
    }
}

fn text(value: &Value) -> String {
    match value {
        Value::Void => String::new(),
        Value::Str(s) => s.to_string(),
        other => other.to_string(),
    }
}
