/// Bytecode emitter (EmitCodePass).
///
/// Linearizes each routine's `FlowGraph` into a byte stream, backpatching
/// forward branch targets as they become known. See `ir::Opcode::encoded_len`
/// for the wire layout.
use std::collections::{HashMap, HashSet};

use crate::ir::{Chunk, Errcode, FlowGraph, IrStore, Locator, Node, Opcode, Region, Step, XpliceProgram};

#[derive(Clone, Copy)]
enum PendingKind {
    SkipTruthy,
    SkipFalsy,
}

struct Pending {
    kind: PendingKind,
    jump_pos: usize,
}

/// Overwrites the 4-byte id field of the instruction at `jump_pos` (which
/// starts at `jump_pos + 2`: one opcode byte, one region byte) with `target`.
fn patch_target(bytecode: &mut [u8], jump_pos: usize, target: i32) {
    let at = jump_pos + 2;
    bytecode[at..at + 4].copy_from_slice(&target.to_le_bytes());
}

fn step_arity(step: &Step) -> u8 {
    match step {
        Step::Nonary(_) => 0,
        Step::Unary(..) => 1,
        Step::Binary(..) => 2,
        Step::Ternary(..) => 3,
    }
}

fn encode_step(buf: &mut Vec<u8>, step: Step) {
    match step {
        Step::Nonary(op) => buf.push(op as u8),
        Step::Unary(op, a) => {
            buf.push(op as u8);
            a.encode(buf);
        }
        Step::Binary(op, a, b) => {
            buf.push(op as u8);
            a.encode(buf);
            b.encode(buf);
        }
        Step::Ternary(op, a, b, c) => {
            buf.push(op as u8);
            a.encode(buf);
            b.encode(buf);
            c.encode(buf);
        }
    }
}

/// Emits one routine's graph into a flat byte stream.
///
/// Branch bookkeeping is a *stack* of pending backpatches rather than the
/// single-slot scheme sketched informally for a lone `if`: an `if` or `while`
/// nested inside another construct's branch keeps its own truthy/falsy pair on
/// top while the enclosing construct's pair waits underneath, so resolution
/// always pops the right entry regardless of nesting depth.
struct RoutineEmitter<'a> {
    graph: &'a FlowGraph,
    bytecode: Vec<u8>,
    node_offset: HashMap<i32, usize>,
    pending: Vec<Pending>,
}

impl<'a> RoutineEmitter<'a> {
    fn new(graph: &'a FlowGraph) -> Self {
        RoutineEmitter {
            graph,
            bytecode: vec![],
            node_offset: HashMap::new(),
            pending: vec![],
        }
    }

    fn emit(mut self) -> Result<Vec<u8>, Errcode> {
        if self.graph.is_empty() {
            return Ok(self.bytecode);
        }

        let mut visited = HashSet::new();
        let mut worklist = vec![0i32];

        while let Some(id) = worklist.pop() {
            if id == -1 || !visited.insert(id) {
                continue;
            }
            match self.graph.get(id) {
                Node::Unit { steps, next } => {
                    self.node_offset.insert(id, self.bytecode.len());
                    for step in steps {
                        self.emit_step(*step)?;
                    }
                    if *next != -1 {
                        worklist.push(*next);
                    }
                }
                Node::Juncture { left, right } => {
                    // Push falsy first so truthy (pushed second) pops and
                    // emits first — the ordering the backpatcher relies on.
                    if *right != -1 {
                        worklist.push(*right);
                    }
                    if *left != -1 {
                        worklist.push(*left);
                    }
                }
            }
        }

        if !self.pending.is_empty() {
            // A branch never reached its closing Jump/Noop — codegen-internal
            // contract violation, not something a well-formed CFG produces.
            return Err(Errcode::General);
        }
        Ok(self.bytecode)
    }

    fn emit_step(&mut self, step: Step) -> Result<(), Errcode> {
        if step.opcode().arity() != step_arity(&step) {
            encode_step(&mut self.bytecode, Step::Nonary(Opcode::Noop));
            return Ok(());
        }

        match step {
            Step::Unary(Opcode::JumpNotIf, _) => {
                let jump_pos = self.bytecode.len();
                encode_step(&mut self.bytecode, step);
                self.pending.push(Pending {
                    kind: PendingKind::SkipTruthy,
                    jump_pos,
                });
            }
            Step::Unary(Opcode::Jump, target) => {
                let jump_pos = self.bytecode.len();
                if target.region == Region::Routines {
                    // Back-edge: the header node was already emitted, so the
                    // target offset is resolved immediately, no backpatch.
                    let resolved = *self.node_offset.get(&target.id).ok_or(Errcode::General)?;
                    encode_step(
                        &mut self.bytecode,
                        Step::Unary(Opcode::Jump, Locator::new(Region::None, resolved as i32)),
                    );
                    self.resolve_pending(PendingKind::SkipTruthy);
                } else {
                    encode_step(&mut self.bytecode, Step::Unary(Opcode::Jump, Locator::new(Region::None, 0)));
                    self.resolve_pending(PendingKind::SkipTruthy);
                    self.pending.push(Pending {
                        kind: PendingKind::SkipFalsy,
                        jump_pos,
                    });
                }
            }
            Step::Nonary(Opcode::Noop) => {
                encode_step(&mut self.bytecode, step);
                self.resolve_pending(PendingKind::SkipFalsy);
            }
            _ => encode_step(&mut self.bytecode, step),
        }
        Ok(())
    }

    fn resolve_pending(&mut self, expected: PendingKind) {
        let matches_expected = matches!(
            (self.pending.last(), expected),
            (Some(Pending { kind: PendingKind::SkipTruthy, .. }), PendingKind::SkipTruthy)
                | (Some(Pending { kind: PendingKind::SkipFalsy, .. }), PendingKind::SkipFalsy)
        );
        if matches_expected {
            let p = self.pending.pop().expect("just matched Some above");
            let target = self.bytecode.len() as i32;
            patch_target(&mut self.bytecode, p.jump_pos, target);
        }
    }
}

/// Emits bytecode for every routine in `store`, producing the final program.
pub fn emit_program(store: &IrStore) -> Result<XpliceProgram, Errcode> {
    let mut func_chunks = HashMap::new();
    for (&func_id, graph) in &store.func_cfgs {
        let bytecode = RoutineEmitter::new(graph).emit()?;
        let const_map = store.const_chunks.get(func_id as usize).ok_or(Errcode::General)?;
        log::debug!("emitted {} bytes for func id {}", bytecode.len(), func_id);
        func_chunks.insert(
            func_id,
            Chunk {
                constants: const_map.as_map(),
                bytecode,
            },
        );
    }
    Ok(XpliceProgram {
        func_chunks,
        entry_func_id: store.main_func_id,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph_pass;
    use crate::ir::Value;
    use xplice_lang::front_end;

    fn emit_source(src: &str) -> XpliceProgram {
        let checked = front_end(src).expect("front end should accept well-formed source");
        let store = graph_pass::lower(&checked.program, &checked.natives).expect("lowering should succeed");
        emit_program(&store).expect("emission should succeed")
    }

    #[test]
    fn trivial_return_emits_load_const_then_ret() {
        let program = emit_source("func main(): int { return 0; }");
        let chunk = &program.func_chunks[&program.entry_func_id];
        assert_eq!(chunk.bytecode[0], Opcode::LoadConst as u8);
        let ret_pos = Opcode::LoadConst.encoded_len();
        assert_eq!(chunk.bytecode[ret_pos], Opcode::Ret as u8);
        assert_eq!(chunk.bytecode.len(), ret_pos + Opcode::Ret.encoded_len());
    }

    #[test]
    fn every_encoded_instruction_round_trips() {
        let program = emit_source(
            "func f(a: int, b: int): int { return a - b; } func main(): int { return f(10, 3) - 7; }",
        );
        for chunk in program.func_chunks.values() {
            let mut pos = 0;
            while pos < chunk.bytecode.len() {
                let op = Opcode::from_byte(chunk.bytecode[pos]).expect("valid opcode byte");
                let len = op.encoded_len();
                assert!(pos + len <= chunk.bytecode.len(), "instruction must not run past the chunk");
                for i in 0..op.arity() {
                    let arg_pos = pos + 1 + i as usize * 5;
                    let (_, next) = Locator::decode(&chunk.bytecode, arg_pos).unwrap();
                    assert_eq!(next, arg_pos + 5);
                }
                pos += len;
            }
            assert_eq!(pos, chunk.bytecode.len());
        }
    }

    #[test]
    fn if_else_backpatches_both_branches_in_bounds() {
        let program = emit_source("func main(): int { if (1 < 2) { return 0; } else { return 1; } }");
        let chunk = &program.func_chunks[&program.entry_func_id];
        let mut pos = 0;
        let mut saw_jump_not_if = false;
        let mut saw_jump = false;
        while pos < chunk.bytecode.len() {
            let op = Opcode::from_byte(chunk.bytecode[pos]).unwrap();
            if op == Opcode::JumpNotIf || op == Opcode::Jump {
                let (loc, _) = Locator::decode(&chunk.bytecode, pos + 1).unwrap();
                assert!(
                    loc.id >= 0 && (loc.id as usize) <= chunk.bytecode.len(),
                    "branch target must land inside the chunk"
                );
                if op == Opcode::JumpNotIf {
                    saw_jump_not_if = true;
                } else {
                    saw_jump = true;
                }
            }
            pos += op.encoded_len();
        }
        assert!(saw_jump_not_if && saw_jump);
    }

    #[test]
    fn if_without_else_has_no_unresolved_backpatch() {
        // Exercises RoutineEmitter::emit's trailing check directly: a
        // malformed graph with a dangling JumpNotIf would surface as
        // Err(Errcode::General) instead of silently truncating output.
        let program = emit_source("func main(): int { if (1 < 2) { return 0; } return 1; }");
        assert!(program.func_chunks.contains_key(&program.entry_func_id));
    }

    #[test]
    fn while_loop_back_edge_targets_header_offset_before_it() {
        let program = emit_source(
            "func main(): int { let x: int = 0; while (x < 3) { x = x + 1; } return x; }",
        );
        let chunk = &program.func_chunks[&program.entry_func_id];
        let mut pos = 0;
        let mut found_back_edge = false;
        while pos < chunk.bytecode.len() {
            let op = Opcode::from_byte(chunk.bytecode[pos]).unwrap();
            if op == Opcode::Jump {
                let (loc, _) = Locator::decode(&chunk.bytecode, pos + 1).unwrap();
                if (loc.id as usize) < pos {
                    found_back_edge = true;
                }
            }
            pos += op.encoded_len();
        }
        assert!(found_back_edge, "while must compile to a backward jump");
    }

    #[test]
    fn constant_ids_in_chunk_match_interned_ids() {
        let program = emit_source("func main(): int { let x: int = 41; return x + 1; }");
        let chunk = &program.func_chunks[&program.entry_func_id];
        assert_eq!(chunk.constants.get(&0), Some(&Value::Int(41)));
        assert_eq!(chunk.constants.get(&1), Some(&Value::Int(1)));
    }

    #[test]
    fn nested_if_inside_while_resolves_every_backpatch() {
        let program = emit_source(
            "func main(): int { let x: int = 0; while (x < 5) { if (x == 2) { x = x + 10; } else { x = x + 1; } } return x; }",
        );
        assert!(program.func_chunks.contains_key(&program.entry_func_id));
    }
}
