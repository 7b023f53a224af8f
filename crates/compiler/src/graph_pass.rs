/// AST-to-CFG lowering (GraphPass).
///
/// Walks the checked AST in declaration order and produces, per routine, a
/// `FlowGraph` plus a per-routine constant pool. Function ids are assigned
/// up front (a pre-pass over all `Item::Function`s) so calls to functions
/// declared later in the source still resolve; the reference implementation
/// assigned ids lazily during a single visit, which breaks forward calls.
use std::collections::HashMap;

use xplice_lang::ast::{BinaryOp, Block, Expr, Item, Program, Stmt, UnaryOp};
use xplice_lang::semantic::NativeHints;

use crate::ir::{ConstantMap, Errcode, FlowGraph, IrStore, Locator, Node, Opcode, Region, Step, Value};

/// Per-opcode simulated stack-depth delta. `-100` means "frame reset"
/// (see `update_stack_score`). Indexed by `Opcode as u8`.
fn stack_delta(op: Opcode) -> i32 {
    use Opcode::*;
    match op {
        Halt | Ret => -100,
        Noop | Jump | Negate => 0,
        Replace | Pop | Add | Sub | Mul | Div | CmpEq | CmpNe | CmpLt | CmpGt | LogAnd | LogOr
        | JumpNotIf | AccessField => -1,
        Push | Peek | LoadConst => 1,
        MakeArray | MakeTuple => 0,
        // Resolved dynamically by the caller (depends on argc); never looked
        // up through this table.
        Call | CallNative => 0,
    }
}

/// Lowers one checked program into an [`IrStore`].
pub fn lower(program: &Program, natives: &NativeHints) -> Result<IrStore, Errcode> {
    let mut func_ids = HashMap::new();
    let mut next_id = 0i32;
    for item in &program.items {
        if let Item::Function { name, .. } = item {
            func_ids.insert(name.clone(), next_id);
            next_id += 1;
        }
    }

    let mut pass = GraphPass::new(natives, func_ids);
    let funcs: Vec<&Item> = program
        .items
        .iter()
        .filter(|i| matches!(i, Item::Function { .. }))
        .collect();
    let funcs_n = funcs.len();

    for (i, item) in funcs.into_iter().enumerate() {
        if let Item::Function {
            name, params, body, ..
        } = item
        {
            pass.lower_function(name, params, body)?;
            pass.commit_nodes_to_graph(i == funcs_n - 1);
        }
    }

    let main_func_id = *pass
        .global_func_map
        .get("main")
        .ok_or(Errcode::General)?;

    Ok(IrStore {
        const_chunks: pass.func_consts,
        func_cfgs: pass.result,
        main_func_id,
    })
}

struct GraphPass<'a> {
    natives: &'a NativeHints,
    global_func_map: HashMap<String, i32>,
    local_names: HashMap<String, Locator>,
    param_names: HashMap<String, Locator>,
    const_map: ConstantMap,
    func_consts: Vec<ConstantMap>,
    pending_nodes: Vec<Node>,
    result: HashMap<i32, FlowGraph>,
    stack_score: i32,
    current_func_id: i32,
}

impl<'a> GraphPass<'a> {
    fn new(natives: &'a NativeHints, func_ids: HashMap<String, i32>) -> Self {
        GraphPass {
            natives,
            global_func_map: func_ids,
            local_names: HashMap::new(),
            param_names: HashMap::new(),
            const_map: ConstantMap::new(),
            func_consts: vec![],
            pending_nodes: vec![],
            result: HashMap::new(),
            stack_score: 0,
            current_func_id: -1,
        }
    }

    fn lower_function(
        &mut self,
        name: &str,
        params: &[xplice_lang::ast::Param],
        body: &Block,
    ) -> Result<(), Errcode> {
        self.current_func_id = *self.global_func_map.get(name).expect("pre-assigned above");

        for (i, p) in params.iter().enumerate() {
            self.param_names
                .insert(p.name.clone(), Locator::new(Region::FrameSlot, i as i32));
        }

        self.place_node(Node::empty_unit());
        self.lower_block(body)?;

        Ok(())
    }

    /// `commit_nodes_to_graph(all_decls_done)`: fixes every pending node's
    /// successor(s) purely from its position in the pending list, then
    /// commits the routine's graph and resets per-routine state.
    fn commit_nodes_to_graph(&mut self, all_decls_done: bool) {
        let n = self.pending_nodes.len() as i32;
        let mut graph = FlowGraph::new();

        for (i, node) in self.pending_nodes.drain(..).enumerate() {
            let i = i as i32;
            match node {
                Node::Unit { steps, .. } => {
                    let next = if i < n - 1 { i + 1 } else { -1 };
                    let id = graph.push(Node::Unit { steps, next });
                    graph.connect_unit(id, next);
                }
                Node::Juncture { .. } => {
                    let left = if i < n - 1 { i + 1 } else { -1 };
                    let right = if i < n - 2 { i + 2 } else { -1 };
                    let id = graph.push(Node::Juncture { left, right });
                    graph.connect_juncture(id, left, right);
                }
            }
        }

        self.result.insert(self.current_func_id, graph);

        self.const_map = ConstantMap::new();
        self.func_consts.push(std::mem::take(&mut self.const_map));
        self.local_names.clear();
        self.param_names.clear();
        self.stack_score = 0;

        if all_decls_done {
            log::debug!("committed final routine graph for func id {}", self.current_func_id);
        }
    }

    fn place_node(&mut self, node: Node) -> i32 {
        self.pending_nodes.push(node);
        (self.pending_nodes.len() - 1) as i32
    }

    fn place_step(&mut self, step: Step) {
        self.update_stack_score(step.opcode());
        if let Some(Node::Unit { steps, .. }) = self.pending_nodes.last_mut() {
            steps.push(step);
        }
    }

    fn update_stack_score(&mut self, op: Opcode) {
        let delta = stack_delta(op);
        if delta == -100 {
            self.stack_score = 0;
        } else {
            self.stack_score += delta;
        }
    }

    fn lookup_named_location(&self, name: &str) -> Result<Locator, Errcode> {
        self.param_names
            .get(name)
            .or_else(|| self.local_names.get(name))
            .copied()
            .ok_or(Errcode::General)
    }

    fn lookup_callable_name(&self, name: &str) -> Result<Locator, Errcode> {
        if let Some((_, id)) = self.natives.get(name) {
            return Ok(Locator::new(Region::Natives, *id as i32));
        }
        self.global_func_map
            .get(name)
            .map(|&id| Locator::new(Region::Routines, id))
            .ok_or(Errcode::General)
    }

    fn lower_block(&mut self, block: &Block) -> Result<(), Errcode> {
        for stmt in &block.stmts {
            self.lower_stmt(stmt)?;
        }
        Ok(())
    }

    fn lower_stmt(&mut self, stmt: &Stmt) -> Result<(), Errcode> {
        match stmt {
            Stmt::Let { name, init, .. } | Stmt::Const { name, init, .. } => {
                let loc = self.lower_expr(init)?;
                // `stack_score` is the depth *after* the initializer's last push; the
                // value itself landed one slot below that, at the frame-relative top.
                let loc = loc.unwrap_or_else(|| Locator::new(Region::TempStack, self.stack_score - 1));
                self.local_names.insert(name.clone(), loc);
                Ok(())
            }
            Stmt::Return { value, .. } => {
                let loc = match value {
                    Some(e) => self.lower_expr(e)?.unwrap_or_else(Locator::none),
                    None => Locator::none(),
                };
                self.place_step(Step::Unary(Opcode::Ret, loc));
                Ok(())
            }
            Stmt::If {
                test,
                then_branch,
                else_branch,
                ..
            } => self.lower_if(test, then_branch, else_branch.as_ref()),
            Stmt::While { test, body, .. } => self.lower_while(test, body),
            Stmt::Block(b) => self.lower_block(b),
            Stmt::Expr(e) => {
                // Intentionally no pop: expression-statement results are left
                // on the operand stack.
                self.lower_expr(e)?;
                Ok(())
            }
        }
    }

    fn lower_if(
        &mut self,
        test: &Expr,
        then_branch: &Block,
        else_branch: Option<&Block>,
    ) -> Result<(), Errcode> {
        self.lower_expr(test)?;
        self.place_step(Step::Unary(Opcode::JumpNotIf, Locator::none()));

        self.place_node(Node::Juncture { left: -1, right: -1 });

        self.place_node(Node::empty_unit());
        self.lower_block(then_branch)?;
        self.place_step(Step::Unary(Opcode::Jump, Locator::none()));

        if let Some(else_branch) = else_branch {
            self.place_node(Node::empty_unit());
            self.lower_block(else_branch)?;
        }
        self.place_step(Step::Nonary(Opcode::Noop));

        self.place_node(Node::empty_unit());
        Ok(())
    }

    /// Not covered by the reference implementation (its `visit_while` is
    /// declared but never defined); designed here by analogy with `if`,
    /// plus an explicit header node so the back edge has a node boundary
    /// to target rather than some arbitrary offset mid-unit.
    fn lower_while(&mut self, test: &Expr, body: &Block) -> Result<(), Errcode> {
        let header_idx = self.place_node(Node::empty_unit());
        self.lower_expr(test)?;
        self.place_step(Step::Unary(Opcode::JumpNotIf, Locator::none()));

        self.place_node(Node::Juncture { left: -1, right: -1 });

        self.place_node(Node::empty_unit());
        self.lower_block(body)?;
        self.place_step(Step::Unary(
            Opcode::Jump,
            Locator::new(Region::Routines, header_idx),
        ));

        self.place_node(Node::empty_unit());
        Ok(())
    }

    /// Returns `Some(locator)` when the expression's value is addressable
    /// without re-evaluation (literals, names, assignment targets);
    /// compound expressions leave their result on the operand stack top and
    /// return `None`.
    fn lower_expr(&mut self, expr: &Expr) -> Result<Option<Locator>, Errcode> {
        match expr {
            Expr::BoolLit(v, _) => Ok(Some(self.intern_literal(&v.to_string(), Value::Bool(*v)))),
            Expr::IntLit(v, _) => Ok(Some(self.intern_literal(&v.to_string(), Value::Int(*v)))),
            Expr::FloatLit(v, _) => Ok(Some(self.intern_literal(&v.to_string(), Value::Float(*v)))),
            Expr::Ident(name, _) => {
                let loc = self.lookup_named_location(name)?;
                self.place_step(Step::Unary(Opcode::Push, loc));
                Ok(Some(loc))
            }
            Expr::Unary { op: UnaryOp::Neg, expr, .. } => {
                self.lower_expr(expr)?;
                self.place_step(Step::Nonary(Opcode::Negate));
                Ok(None)
            }
            Expr::Binary { op, left, right, .. } => self.lower_binary(*op, left, right),
            Expr::Access { object, .. } => {
                // Field/index access never reaches codegen: the semantic
                // pass rejects it (no field-type model yet).
                self.lower_expr(object)?;
                Err(Errcode::Access)
            }
            Expr::Assign { target, value, .. } => self.lower_assign(target, value),
            Expr::Call { callee, args, .. } => self.lower_call(callee, args),
        }
    }

    fn intern_literal(&mut self, lexeme: &str, value: Value) -> Locator {
        let id = self.const_map.intern(lexeme, value);
        let loc = Locator::new(Region::Consts, id);
        self.place_step(Step::Unary(Opcode::LoadConst, loc));
        loc
    }

    fn lower_binary(&mut self, op: BinaryOp, left: &Expr, right: &Expr) -> Result<Option<Locator>, Errcode> {
        let (lean_left, opcode) = match op {
            BinaryOp::Add => (true, Opcode::Add),
            BinaryOp::Sub => (false, Opcode::Sub),
            BinaryOp::Mul => (true, Opcode::Mul),
            BinaryOp::Div => (false, Opcode::Div),
            BinaryOp::Eq => (true, Opcode::CmpEq),
            BinaryOp::Ne => (true, Opcode::CmpNe),
            BinaryOp::Lt => (false, Opcode::CmpLt),
            BinaryOp::Gt => (false, Opcode::CmpGt),
            BinaryOp::And => (true, Opcode::LogAnd),
            BinaryOp::Or => (true, Opcode::LogOr),
        };

        if lean_left {
            self.lower_expr(left)?;
            self.lower_expr(right)?;
        } else {
            self.lower_expr(right)?;
            self.lower_expr(left)?;
        }
        self.place_step(Step::Nonary(opcode));
        Ok(None)
    }

    fn lower_assign(&mut self, target: &Expr, value: &Expr) -> Result<Option<Locator>, Errcode> {
        let name = match target {
            Expr::Ident(name, _) => name,
            _ => return Err(Errcode::Access),
        };
        let target_loc = self.lookup_named_location(name)?;
        self.lower_expr(value)?;
        self.place_step(Step::Unary(Opcode::Replace, target_loc));
        Ok(Some(target_loc))
    }

    fn lower_call(&mut self, callee: &str, args: &[Expr]) -> Result<Option<Locator>, Errcode> {
        let callee_loc = self.lookup_callable_name(callee)?;
        let argc = args.len() as i32;

        for arg in args.iter().rev() {
            self.lower_expr(arg)?;
        }

        match callee_loc.region {
            Region::Routines => {
                self.place_step(Step::Binary(Opcode::Call, callee_loc, Locator::new(Region::None, argc)));
            }
            Region::Natives => {
                self.place_step(Step::Ternary(
                    Opcode::CallNative,
                    Locator::new(Region::None, 0),
                    callee_loc,
                    Locator::new(Region::None, argc),
                ));
            }
            _ => return Err(Errcode::General),
        }

        self.stack_score += 1 - argc;
        Ok(None)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use xplice_lang::front_end;

    fn lower_source(src: &str) -> IrStore {
        let checked = front_end(src).expect("front end should accept well-formed source");
        lower(&checked.program, &checked.natives).expect("lowering should succeed")
    }

    #[test]
    fn lowers_trivial_return() {
        let store = lower_source("func main(): int { return 0; }");
        assert_eq!(store.func_cfgs.len(), 1);
        let graph = &store.func_cfgs[&store.main_func_id];
        match graph.get(0) {
            Node::Unit { steps, .. } => {
                assert_eq!(steps.len(), 2);
                assert_eq!(steps[0].opcode(), Opcode::LoadConst);
                assert_eq!(steps[1].opcode(), Opcode::Ret);
            }
            _ => panic!("expected a unit"),
        }
    }

    #[test]
    fn if_statement_produces_juncture_with_forward_links() {
        let store = lower_source(
            "func main(): int { if (1 < 2) { return 0; } else { return 1; } }",
        );
        let graph = &store.func_cfgs[&store.main_func_id];
        let juncture_idx = (0..graph.len() as i32)
            .find(|&i| matches!(graph.get(i), Node::Juncture { .. }))
            .expect("an if produces a Juncture");
        match graph.get(juncture_idx) {
            Node::Juncture { left, right } => {
                assert_eq!(*left, juncture_idx + 1);
                assert_eq!(*right, juncture_idx + 2);
            }
            _ => unreachable!(),
        }
    }

    #[test]
    fn while_statement_back_edge_targets_header_node() {
        let store = lower_source(
            "func main(): int { let x: int = 0; while (x < 3) { x = x + 1; } return x; }",
        );
        let graph = &store.func_cfgs[&store.main_func_id];
        let has_back_edge = (0..graph.len() as i32).any(|i| match graph.get(i) {
            Node::Unit { steps, .. } => steps.iter().any(|s| {
                matches!(s, Step::Unary(Opcode::Jump, loc) if loc.region == Region::Routines && loc.id < i)
            }),
            _ => false,
        });
        assert!(has_back_edge, "while loop must emit a backward jump to its header");
    }

    #[test]
    fn assignment_emits_replace_into_the_original_slot() {
        let store = lower_source(
            "func main(): int { let x: int = 1; x = 2; return x; }",
        );
        let graph = &store.func_cfgs[&store.main_func_id];
        let replaces: Vec<_> = (0..graph.len() as i32)
            .flat_map(|i| match graph.get(i) {
                Node::Unit { steps, .. } => steps.clone(),
                _ => vec![],
            })
            .filter(|s| s.opcode() == Opcode::Replace)
            .collect();
        assert_eq!(replaces.len(), 1, "the fixed assignment lowering emits exactly one replace");
    }

    #[test]
    fn call_pushes_arguments_right_to_left() {
        let store = lower_source(
            "func f(a: int, b: int): int { return a - b; } func main(): int { return f(10, 3); }",
        );
        let main_graph = &store.func_cfgs[&store.main_func_id];
        let first_unit_steps = match main_graph.get(0) {
            Node::Unit { steps, .. } => steps,
            _ => panic!("expected unit"),
        };
        // First two steps load constants 3 then 10 (right-to-left push order).
        assert_eq!(first_unit_steps[0].opcode(), Opcode::LoadConst);
        assert_eq!(first_unit_steps[1].opcode(), Opcode::LoadConst);
        assert_eq!(first_unit_steps[2].opcode(), Opcode::Call);
    }

    #[test]
    fn constant_interning_is_shared_within_a_routine() {
        let store = lower_source(
            "func main(): int { let x: int = 1; let y: int = 1; return x; }",
        );
        assert_eq!(store.const_chunks[store.main_func_id as usize].as_map().len(), 1);
    }
}
