use std::collections::HashMap;

use crate::ast::{BinaryOp, Block, Expr, Item, Program, Stmt, TypeName, UnaryOp};
use crate::diagnostics::CompileError;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Signature {
    pub params: Vec<TypeName>,
    pub ret: TypeName,
}

/// `name -> (signature, dense id)`. Ids are assigned by the fixed catalogue
/// order the VM registers built-in natives under, not by declaration order,
/// so a source file may `use func` them in either order.
pub type NativeHints = HashMap<String, (Signature, u32)>;

const NATIVE_CATALOGUE: &[(&str, TypeName, TypeName)] = &[
    ("print_int", TypeName::Int, TypeName::Int),
    ("print_string", TypeName::String, TypeName::Int),
];

pub struct CheckedProgram {
    pub program: Program,
    pub natives: NativeHints,
}

struct FuncInfo {
    sig: Signature,
}

pub fn check(program: Program) -> Result<CheckedProgram, CompileError> {
    let mut errors = vec![];
    let mut natives: NativeHints = HashMap::new();
    let mut funcs: HashMap<String, FuncInfo> = HashMap::new();

    for item in &program.items {
        match item {
            Item::NativeUse { name, params, ret, line } => {
                match NATIVE_CATALOGUE.iter().find(|(n, ..)| n == name) {
                    Some((_, expect_param, expect_ret)) => {
                        let declared = Signature {
                            params: params.iter().map(|p| p.ty).collect(),
                            ret: *ret,
                        };
                        let expected = Signature {
                            params: vec![*expect_param],
                            ret: *expect_ret,
                        };
                        if declared != expected {
                            errors.push(format!(
                                "line {line}: native `{name}` declared with a signature that does not match the built-in"
                            ));
                        }
                        let id = NATIVE_CATALOGUE
                            .iter()
                            .position(|(n, ..)| n == name)
                            .expect("looked up by name above") as u32;
                        natives.insert(name.clone(), (expected, id));
                    }
                    None => {
                        errors.push(format!("line {line}: unknown native function `{name}`"));
                    }
                }
            }
            Item::Function { name, params, ret, line, .. } => {
                if funcs.contains_key(name) {
                    errors.push(format!("line {line}: function `{name}` declared more than once"));
                    continue;
                }
                funcs.insert(
                    name.clone(),
                    FuncInfo {
                        sig: Signature {
                            params: params.iter().map(|p| p.ty).collect(),
                            ret: *ret,
                        },
                    },
                );
            }
            Item::Import { .. } => {}
        }
    }

    if !funcs.contains_key("main") {
        errors.push("no `main` function declared".to_string());
    }

    for item in &program.items {
        if let Item::Function { params, ret, body, .. } = item {
            let mut checker = FunctionChecker {
                funcs: &funcs,
                natives: &natives,
                errors: &mut errors,
                ret: *ret,
                scopes: vec![HashMap::new()],
            };
            for p in params {
                checker.scopes[0].insert(p.name.clone(), p.ty);
            }
            checker.check_block(body);
        }
    }

    if errors.is_empty() {
        Ok(CheckedProgram { program, natives })
    } else {
        Err(CompileError::new(errors))
    }
}

struct FunctionChecker<'a> {
    funcs: &'a HashMap<String, FuncInfo>,
    natives: &'a NativeHints,
    errors: &'a mut Vec<String>,
    ret: TypeName,
    scopes: Vec<HashMap<String, TypeName>>,
}

impl<'a> FunctionChecker<'a> {
    fn push_scope(&mut self) {
        self.scopes.push(HashMap::new());
    }

    fn pop_scope(&mut self) {
        self.scopes.pop();
    }

    fn lookup(&self, name: &str) -> Option<TypeName> {
        self.scopes.iter().rev().find_map(|s| s.get(name).copied())
    }

    fn bind(&mut self, name: &str, ty: TypeName) {
        self.scopes
            .last_mut()
            .expect("at least one scope always present")
            .insert(name.to_string(), ty);
    }

    fn check_block(&mut self, block: &Block) {
        self.push_scope();
        for stmt in &block.stmts {
            self.check_stmt(stmt);
        }
        self.pop_scope();
    }

    fn check_stmt(&mut self, stmt: &Stmt) {
        match stmt {
            Stmt::Let { name, type_hint, init, line } | Stmt::Const { name, type_hint, init, line } => {
                let inferred = self.check_expr(init);
                let ty = match (type_hint, inferred) {
                    (Some(hint), Some(actual)) if *hint != actual => {
                        self.errors.push(format!(
                            "line {line}: `{name}` declared as {hint:?} but initializer is {actual:?}"
                        ));
                        *hint
                    }
                    (Some(hint), _) => *hint,
                    (None, Some(actual)) => actual,
                    (None, None) => TypeName::Int,
                };
                self.bind(name, ty);
            }
            Stmt::Return { value, line } => {
                let actual = value.as_ref().and_then(|e| self.check_expr(e));
                if let Some(actual) = actual {
                    if actual != self.ret {
                        self.errors.push(format!(
                            "line {line}: return type mismatch, expected {:?} but found {actual:?}",
                            self.ret
                        ));
                    }
                }
            }
            Stmt::If { test, then_branch, else_branch, line } => {
                if let Some(t) = self.check_expr(test) {
                    if t != TypeName::Bool {
                        self.errors
                            .push(format!("line {line}: `if` test must be bool, found {t:?}"));
                    }
                }
                self.check_block(then_branch);
                if let Some(else_branch) = else_branch {
                    self.check_block(else_branch);
                }
            }
            Stmt::While { test, body, line } => {
                if let Some(t) = self.check_expr(test) {
                    if t != TypeName::Bool {
                        self.errors
                            .push(format!("line {line}: `while` test must be bool, found {t:?}"));
                    }
                }
                self.check_block(body);
            }
            Stmt::Block(block) => self.check_block(block),
            Stmt::Expr(expr) => {
                self.check_expr(expr);
            }
        }
    }

    fn check_expr(&mut self, expr: &Expr) -> Option<TypeName> {
        match expr {
            Expr::BoolLit(..) => Some(TypeName::Bool),
            Expr::IntLit(..) => Some(TypeName::Int),
            Expr::FloatLit(..) => Some(TypeName::Float),
            Expr::Ident(name, line) => match self.lookup(name) {
                Some(ty) => Some(ty),
                None => {
                    self.errors.push(format!("line {line}: undeclared name `{name}`"));
                    None
                }
            },
            Expr::Unary { op: UnaryOp::Neg, expr, line } => {
                let inner = self.check_expr(expr);
                match inner {
                    Some(TypeName::Int) | Some(TypeName::Float) => inner,
                    Some(other) => {
                        self.errors
                            .push(format!("line {line}: cannot negate a {other:?}"));
                        None
                    }
                    None => None,
                }
            }
            Expr::Binary { op, left, right, line } => {
                let l = self.check_expr(left);
                let r = self.check_expr(right);
                match op {
                    BinaryOp::Add | BinaryOp::Sub | BinaryOp::Mul | BinaryOp::Div => match (l, r) {
                        (Some(a), Some(b)) if a == b && matches!(a, TypeName::Int | TypeName::Float) => Some(a),
                        (Some(a), Some(b)) => {
                            self.errors.push(format!(
                                "line {line}: arithmetic operands must share a numeric type, found {a:?} and {b:?}"
                            ));
                            None
                        }
                        _ => None,
                    },
                    BinaryOp::Lt | BinaryOp::Gt => {
                        if let (Some(a), Some(b)) = (l, r) {
                            if a != b || !matches!(a, TypeName::Int | TypeName::Float) {
                                self.errors.push(format!(
                                    "line {line}: comparison operands must share a numeric type, found {a:?} and {b:?}"
                                ));
                            }
                        }
                        Some(TypeName::Bool)
                    }
                    BinaryOp::Eq | BinaryOp::Ne => Some(TypeName::Bool),
                    BinaryOp::And | BinaryOp::Or => {
                        if let (Some(a), Some(b)) = (l, r) {
                            if a != TypeName::Bool || b != TypeName::Bool {
                                self.errors
                                    .push(format!("line {line}: logical operands must be bool"));
                            }
                        }
                        Some(TypeName::Bool)
                    }
                }
            }
            Expr::Access { object, line, .. } => {
                self.check_expr(object);
                self.errors.push(format!(
                    "line {line}: field access has no resolvable type in this version of the language"
                ));
                None
            }
            Expr::Assign { target, value, line } => {
                let target_ty = self.check_expr(target);
                let value_ty = self.check_expr(value);
                if !matches!(**target, Expr::Ident(..) | Expr::Access { .. }) {
                    self.errors
                        .push(format!("line {line}: assignment target must be a name or field access"));
                }
                match (target_ty, value_ty) {
                    (Some(t), Some(v)) if t != v => {
                        self.errors.push(format!(
                            "line {line}: cannot assign {v:?} to a slot of type {t:?}"
                        ));
                    }
                    _ => {}
                }
                value_ty
            }
            Expr::Call { callee, args, line } => {
                let arg_types: Vec<Option<TypeName>> = args.iter().map(|a| self.check_expr(a)).collect();
                let sig = self
                    .natives
                    .get(callee)
                    .map(|(sig, _)| sig)
                    .or_else(|| self.funcs.get(callee).map(|f| &f.sig));
                match sig {
                    Some(sig) => {
                        if sig.params.len() != args.len() {
                            self.errors.push(format!(
                                "line {line}: `{callee}` expects {} argument(s), found {}",
                                sig.params.len(),
                                args.len()
                            ));
                        } else {
                            for (expected, actual) in sig.params.iter().zip(arg_types.iter()) {
                                if let Some(actual) = actual {
                                    if actual != expected {
                                        self.errors.push(format!(
                                            "line {line}: `{callee}` argument type mismatch, expected {expected:?} found {actual:?}"
                                        ));
                                    }
                                }
                            }
                        }
                        Some(sig.ret)
                    }
                    None => {
                        self.errors
                            .push(format!("line {line}: call to undeclared function `{callee}`"));
                        None
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lexer::Lexer;
    use crate::parser::Parser;

    fn check_source(src: &str) -> Result<CheckedProgram, CompileError> {
        let mut p = Parser::new(Lexer::new(src));
        let prog = p.parse_program();
        assert!(p.errors.is_empty(), "parser errors: {:?}", p.errors);
        check(prog)
    }

    #[test]
    fn accepts_well_formed_program() {
        let result = check_source(
            "use func print_int(x: int): int; func main(): int { print_int(7); return 0; }",
        );
        assert!(result.is_ok());
        let checked = result.unwrap();
        assert_eq!(checked.natives.get("print_int").unwrap().1, 0);
    }

    #[test]
    fn rejects_unknown_name() {
        let result = check_source("func main(): int { return missing; }");
        assert!(result.is_err());
    }

    #[test]
    fn rejects_call_arity_mismatch() {
        let result = check_source(
            "func f(a: int, b: int): int { return a - b; } func main(): int { return f(1); }",
        );
        assert!(result.is_err());
    }

    #[test]
    fn rejects_unknown_native() {
        let result = check_source("use func bogus(x: int): int; func main(): int { return 0; }");
        assert!(result.is_err());
    }
}
