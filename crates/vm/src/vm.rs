/// Stack-based interpreter (C6): fetch/decode/dispatch over a compiled
/// [`XpliceProgram`].
use std::collections::HashMap;
use std::io::Write;

use xplice_compiler::ir::{Chunk, Errcode, Locator, Opcode, Region, Value, XpliceProgram};

use crate::builtins::NativeFn;

/// One call's bookkeeping. `callee_pos` is the caller's own resume point,
/// written by `call` just before the new frame is pushed; it is read back
/// once the callee's `ret` pops this frame off again.
#[derive(Debug, Clone)]
struct CallFrame {
    args: Vec<Value>,
    callee_id: i32,
    callee_pos: usize,
    callee_frame_base: usize,
}

/// Owns the program, the native registry, and all runtime state for one run.
pub struct Vm {
    program: XpliceProgram,
    natives: HashMap<i32, NativeFn>,
    frames: Vec<CallFrame>,
    values: Vec<Value>,
    iptr: usize,
    exit_status: Errcode,
    stdout: Box<dyn Write>,
}

impl Vm {
    pub fn new(program: XpliceProgram, natives: HashMap<i32, NativeFn>, stdout: Box<dyn Write>) -> Self {
        Vm {
            program,
            natives,
            frames: vec![],
            values: vec![],
            iptr: 0,
            exit_status: Errcode::General,
            stdout,
        }
    }

    /// Reads the current top of the operand stack without popping it. Part
    /// of the host-facing façade natives may use instead of their `args`
    /// slice.
    pub fn peek_stack_top(&self) -> Option<Value> {
        self.values.last().copied()
    }

    /// Pushes a native's single result value onto the operand stack.
    pub fn push_from_native(&mut self, v: Value) {
        self.values.push(v);
    }

    pub fn write_stdout(&mut self, s: &str) {
        let _ = write!(self.stdout, "{}", s);
    }

    /// Runs the program to completion, returning the final [`Errcode`].
    pub fn run(&mut self) -> Errcode {
        // The entry routine has no caller, so its sentinel sits at index 0
        // rather than `frame_base - 1` (the convention `call` uses for every
        // other frame); `frame_base = 1` keeps that convention uniform and
        // avoids the sentinel colliding with local slot 0.
        self.values.push(Value::Locator(Locator::new(Region::Routines, self.program.entry_func_id)));
        self.frames.push(CallFrame {
            args: vec![],
            callee_id: self.program.entry_func_id,
            callee_pos: 0,
            callee_frame_base: 1,
        });
        self.iptr = 0;

        while !self.frames.is_empty() {
            if let Err(e) = self.step() {
                self.exit_status = e;
                self.frames.clear();
                return self.exit_status;
            }
        }
        self.exit_status
    }

    fn current_chunk(&self) -> Result<&Chunk, Errcode> {
        let callee_id = self.frames.last().ok_or(Errcode::CallStack)?.callee_id;
        self.program.func_chunks.get(&callee_id).ok_or(Errcode::CallStack)
    }

    fn decode_locator(bytecode: &[u8], pos: usize) -> Result<(Locator, usize), Errcode> {
        Locator::decode(bytecode, pos)
    }

    fn step(&mut self) -> Result<(), Errcode> {
        let chunk = self.current_chunk()?;
        let bytecode = chunk.bytecode.clone();
        let op = Opcode::from_byte(*bytecode.get(self.iptr).ok_or(Errcode::CallStack)?).ok_or(Errcode::General)?;

        log::trace!("iptr={} op={:?}", self.iptr, op);

        match op {
            Opcode::Halt => {
                self.frames.clear();
                Ok(())
            }
            Opcode::Noop => {
                self.iptr += op.encoded_len();
                Ok(())
            }
            Opcode::Replace => {
                let (loc, _) = Self::decode_locator(&bytecode, self.iptr + 1)?;
                let v = self.pop()?;
                let base = self.frame()?.callee_frame_base;
                let idx = base + loc.id as usize;
                *self.values.get_mut(idx).ok_or(Errcode::TempStack)? = v;
                self.iptr += op.encoded_len();
                Ok(())
            }
            Opcode::Push | Opcode::Peek => {
                let (loc, _) = Self::decode_locator(&bytecode, self.iptr + 1)?;
                let v = self.resolve_push(loc)?;
                self.values.push(v);
                self.iptr += op.encoded_len();
                Ok(())
            }
            Opcode::LoadConst => {
                let (loc, _) = Self::decode_locator(&bytecode, self.iptr + 1)?;
                let v = *self.current_chunk()?.constants.get(&loc.id).ok_or(Errcode::Access)?;
                self.values.push(v);
                self.iptr += op.encoded_len();
                Ok(())
            }
            Opcode::Pop => {
                let (loc, _) = Self::decode_locator(&bytecode, self.iptr + 1)?;
                for _ in 0..loc.id.max(0) {
                    self.pop()?;
                }
                self.iptr += op.encoded_len();
                Ok(())
            }
            Opcode::Negate => {
                let v = self.pop()?;
                self.values.push(v.negate()?);
                self.iptr += op.encoded_len();
                Ok(())
            }
            Opcode::Add | Opcode::Sub | Opcode::Mul | Opcode::Div | Opcode::CmpEq | Opcode::CmpNe
            | Opcode::CmpLt | Opcode::CmpGt | Opcode::LogAnd | Opcode::LogOr => {
                // Codegen's per-operator evaluation order (`sub`/`div`/`cmp_lt`/
                // `cmp_gt` push right-then-left, everything else left-then-right)
                // guarantees the top-of-stack operand is always the source's
                // left operand. Applying the method to (top, next) therefore
                // computes `left OP right` uniformly across every opcode here.
                let top = self.pop()?;
                let under = self.pop()?;
                let result = match op {
                    Opcode::Add => top.add(under),
                    Opcode::Sub => top.sub(under),
                    Opcode::Mul => top.mul(under),
                    Opcode::Div => top.div(under),
                    Opcode::CmpEq => top.compare_eq(under),
                    Opcode::CmpNe => top.compare_ne(under),
                    Opcode::CmpLt => top.compare_lt(under),
                    Opcode::CmpGt => top.compare_gt(under),
                    Opcode::LogAnd => top.logical_and(under),
                    Opcode::LogOr => top.logical_or(under),
                    _ => unreachable!(),
                }?;
                self.values.push(result);
                self.iptr += op.encoded_len();
                Ok(())
            }
            Opcode::Jump => {
                let (loc, _) = Self::decode_locator(&bytecode, self.iptr + 1)?;
                self.iptr = loc.id as usize;
                Ok(())
            }
            Opcode::JumpNotIf => {
                let (loc, _) = Self::decode_locator(&bytecode, self.iptr + 1)?;
                let cond = self.pop()?;
                let truthy = matches!(cond, Value::Bool(true));
                if truthy {
                    self.iptr += op.encoded_len();
                } else {
                    self.iptr = loc.id as usize;
                }
                Ok(())
            }
            Opcode::Ret => {
                let (loc, _) = Self::decode_locator(&bytecode, self.iptr + 1)?;
                self.dispatch_ret(loc)
            }
            Opcode::Call => self.dispatch_call(&bytecode),
            Opcode::CallNative => self.dispatch_call_native(&bytecode),
            Opcode::MakeArray | Opcode::MakeTuple | Opcode::AccessField => Err(Errcode::General),
        }
    }

    fn frame(&self) -> Result<&CallFrame, Errcode> {
        self.frames.last().ok_or(Errcode::CallStack)
    }

    fn pop(&mut self) -> Result<Value, Errcode> {
        self.values.pop().ok_or(Errcode::TempStack)
    }

    fn resolve_push(&self, loc: Locator) -> Result<Value, Errcode> {
        let frame = self.frame()?;
        match loc.region {
            Region::Consts => {
                Ok(*self.current_chunk()?.constants.get(&loc.id).ok_or(Errcode::Access)?)
            }
            Region::TempStack => {
                let idx = frame.callee_frame_base + loc.id as usize;
                self.values.get(idx).copied().ok_or(Errcode::TempStack)
            }
            Region::Routines => Ok(Value::Locator(loc)),
            Region::FrameSlot => {
                frame.args.get(loc.id as usize).copied().ok_or(Errcode::TempStack)
            }
            Region::ObjHeap | Region::None => Err(Errcode::TempStack),
            Region::Natives => Err(Errcode::TempStack),
        }
    }

    fn dispatch_ret(&mut self, loc: Locator) -> Result<(), Errcode> {
        let frame = self.frame()?.clone();
        let ret_value = match loc.region {
            Region::None => self.values.last().copied().ok_or(Errcode::TempStack)?,
            Region::TempStack => {
                let idx = frame.callee_frame_base + loc.id as usize;
                self.values.get(idx).copied().ok_or(Errcode::TempStack)?
            }
            Region::Consts => *self.current_chunk()?.constants.get(&loc.id).ok_or(Errcode::Access)?,
            Region::FrameSlot => frame.args.get(loc.id as usize).copied().ok_or(Errcode::TempStack)?,
            Region::Routines => Value::Locator(loc),
            Region::ObjHeap | Region::Natives => return Err(Errcode::Access),
        };

        let sentinel_idx = frame.callee_frame_base.saturating_sub(1);
        self.values.truncate(sentinel_idx);
        self.values.push(ret_value);
        self.frames.pop();

        if let Some(caller) = self.frames.last() {
            self.iptr = caller.callee_pos;
        } else {
            self.iptr = 0;
            self.exit_status = match ret_value {
                Value::Int(0) => Errcode::Normal,
                _ => Errcode::General,
            };
        }
        Ok(())
    }

    fn dispatch_call(&mut self, bytecode: &[u8]) -> Result<(), Errcode> {
        let (callee, next) = Self::decode_locator(bytecode, self.iptr + 1)?;
        let (argc_loc, _) = Self::decode_locator(bytecode, next)?;
        let argc = argc_loc.id.max(0) as usize;

        let return_ip = self.iptr + Opcode::Call.encoded_len();
        if let Some(caller) = self.frames.last_mut() {
            caller.callee_pos = return_ip;
        }

        let mut args = Vec::with_capacity(argc);
        for _ in 0..argc {
            args.push(self.pop()?);
        }

        self.values.push(Value::Locator(callee));
        let callee_frame_base = self.values.len();
        self.frames.push(CallFrame {
            args,
            callee_id: callee.id,
            callee_pos: 0,
            callee_frame_base,
        });
        self.iptr = 0;
        Ok(())
    }

    fn dispatch_call_native(&mut self, bytecode: &[u8]) -> Result<(), Errcode> {
        let (_module, next) = Self::decode_locator(bytecode, self.iptr + 1)?;
        let (native_loc, next) = Self::decode_locator(bytecode, next)?;
        let (argc_loc, _) = Self::decode_locator(bytecode, next)?;
        let argc = argc_loc.id.max(0) as usize;

        let mut args = Vec::with_capacity(argc);
        for _ in 0..argc {
            args.push(self.pop()?);
        }

        let native = *self.natives.get(&native_loc.id).ok_or(Errcode::General)?;
        log::debug!("calling native id {}", native_loc.id);
        let result = native(self, &args);
        self.exit_status = result;
        self.iptr += Opcode::CallNative.encoded_len();
        if result != Errcode::Normal {
            return Err(result);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::builtins::registry;

    fn run_source(src: &str) -> (Errcode, String) {
        let program = xplice_compiler::compile(src).expect("program should compile");
        let out = std::sync::Arc::new(std::sync::Mutex::new(Vec::new()));
        let mut vm = Vm::new(program, registry(), Box::new(SharedBuf(out.clone())));
        let status = vm.run();
        let bytes = out.lock().expect("no panics while locked").clone();
        (status, String::from_utf8(bytes).expect("natives only print ASCII"))
    }

    /// `Write` sink that hands a clone of its buffer back to the test after
    /// the `Vm` (which owns the original) has already been consumed.
    struct SharedBuf(std::sync::Arc<std::sync::Mutex<Vec<u8>>>);

    impl Write for SharedBuf {
        fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
            self.0.lock().expect("no panics while locked").write(buf)
        }
        fn flush(&mut self) -> std::io::Result<()> {
            Ok(())
        }
    }

    #[test]
    fn trivial_return_is_normal() {
        let (status, _) = run_source("func main(): int { return 0; }");
        assert_eq!(status, Errcode::Normal);
    }

    #[test]
    fn nonzero_return_is_general() {
        let (status, _) = run_source("func main(): int { return 1; }");
        assert_eq!(status, Errcode::General);
    }

    #[test]
    fn print_int_writes_to_the_configured_sink() {
        let (status, out) = run_source(
            "use func print_int(x: int): int; func main(): int { print_int(7); return 0; }",
        );
        assert_eq!(status, Errcode::Normal);
        assert!(out.contains('7'), "expected '7' in output, got {:?}", out);
    }

    #[test]
    fn if_else_picks_the_true_branch() {
        let (status, _) = run_source(
            "func main(): int { if (1 < 2) { return 0; } else { return 1; } }",
        );
        assert_eq!(status, Errcode::Normal);
    }

    #[test]
    fn let_and_if_agree_on_the_bound_value() {
        let (status, _) = run_source(
            "func main(): int { let x: int = 3 + 4; if (x == 7) { return 0; } return 1; }",
        );
        assert_eq!(status, Errcode::Normal);
    }

    #[test]
    fn function_call_result_feeds_back_into_the_caller() {
        let (status, _) = run_source(
            "func f(a: int, b: int): int { return a - b; } func main(): int { return f(10, 3) - 7; }",
        );
        assert_eq!(status, Errcode::Normal);
    }

    #[test]
    fn division_by_zero_is_an_arithmetic_error() {
        let (status, _) = run_source("func main(): int { return 1 / 0; }");
        assert_eq!(status, Errcode::Arithmetic);
    }

    #[test]
    fn while_loop_accumulates_across_iterations() {
        let (status, _) = run_source(
            "func main(): int { let x: int = 0; while (x < 5) { x = x + 1; } if (x == 5) { return 0; } return 1; }",
        );
        assert_eq!(status, Errcode::Normal);
    }

    #[test]
    fn frame_stack_returns_to_its_pre_call_depth() {
        let program = xplice_compiler::compile(
            "func f(a: int): int { return a; } func main(): int { let y: int = f(1); return 0; }",
        )
        .expect("program should compile");
        let mut vm = Vm::new(program, registry(), Box::new(std::io::sink()));
        let status = vm.run();
        assert_eq!(status, Errcode::Normal);
        assert!(vm.frames.is_empty());
    }
}
