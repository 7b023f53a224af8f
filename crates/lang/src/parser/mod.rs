use crate::ast::{BinaryOp, Block, Expr, Item, Param, Program, Stmt, TypeName, UnaryOp};
use crate::lexer::{Lexer, Token};

#[derive(PartialEq, PartialOrd)]
enum Precedence {
    Lowest,
    LogicOr,
    LogicAnd,
    Compare, // < >
    Equality, // == !=
    Sum,      // + -
    Product,  // * /
    Unary,    // prefix -
}

pub struct Parser<'a> {
    lexer: Lexer<'a>,
    cur_token: Token,
    peek_token: Token,
    cur_line: usize,
    pub errors: Vec<String>,
}

impl<'a> Parser<'a> {
    pub fn new(lexer: Lexer<'a>) -> Self {
        let mut p = Parser {
            lexer,
            cur_token: Token::Eof,
            peek_token: Token::Eof,
            cur_line: 1,
            errors: vec![],
        };
        p.next_token();
        p.next_token();
        p
    }

    fn next_token(&mut self) {
        self.cur_token = std::mem::replace(&mut self.peek_token, Token::Eof);
        self.cur_line = self.lexer.line();
        self.peek_token = self.lexer.next_token();
    }

    pub fn parse_program(&mut self) -> Program {
        let mut program = Program::new();

        while self.cur_token != Token::Eof {
            if let Some(item) = self.parse_item() {
                program.items.push(item);
            } else {
                self.next_token();
            }
        }
        program
    }

    fn parse_item(&mut self) -> Option<Item> {
        match self.cur_token {
            Token::Import => self.parse_import(),
            Token::Use => self.parse_native_use(),
            Token::Func => self.parse_function(),
            _ => {
                self.errors.push(format!(
                    "line {}: expected a top-level item (import/use/func), got {:?}",
                    self.cur_line, self.cur_token
                ));
                None
            }
        }
    }

    fn parse_import(&mut self) -> Option<Item> {
        let line = self.cur_line;
        if !self.expect_peek_ident() {
            return None;
        }
        let name = self.cur_ident()?;
        if self.peek_token == Token::Semicolon {
            self.next_token();
        }
        Some(Item::Import { name, line })
    }

    fn parse_native_use(&mut self) -> Option<Item> {
        let line = self.cur_line;
        if !self.expect_peek(Token::Func) {
            return None;
        }
        if !self.expect_peek_ident() {
            return None;
        }
        let name = self.cur_ident()?;

        if !self.expect_peek(Token::LParen) {
            return None;
        }
        let params = self.parse_params()?;

        if !self.expect_peek(Token::Colon) {
            return None;
        }
        self.next_token();
        let ret = self.parse_type_name()?;

        if self.peek_token == Token::Semicolon {
            self.next_token();
        }
        Some(Item::NativeUse {
            name,
            params,
            ret,
            line,
        })
    }

    fn parse_function(&mut self) -> Option<Item> {
        let line = self.cur_line;
        if !self.expect_peek_ident() {
            return None;
        }
        let name = self.cur_ident()?;

        if !self.expect_peek(Token::LParen) {
            return None;
        }
        let params = self.parse_params()?;

        if !self.expect_peek(Token::Colon) {
            return None;
        }
        self.next_token();
        let ret = self.parse_type_name()?;

        if !self.expect_peek(Token::LBrace) {
            return None;
        }
        let body = self.parse_block()?;

        Some(Item::Function {
            name,
            params,
            ret,
            body,
            line,
        })
    }

    fn parse_params(&mut self) -> Option<Vec<Param>> {
        let mut params = vec![];

        if self.peek_token == Token::RParen {
            self.next_token();
            return Some(params);
        }

        self.next_token();
        params.push(self.parse_one_param()?);

        while self.peek_token == Token::Comma {
            self.next_token();
            self.next_token();
            params.push(self.parse_one_param()?);
        }

        if !self.expect_peek(Token::RParen) {
            return None;
        }
        Some(params)
    }

    fn parse_one_param(&mut self) -> Option<Param> {
        let name = self.cur_ident()?;
        if !self.expect_peek(Token::Colon) {
            return None;
        }
        self.next_token();
        let ty = self.parse_type_name()?;
        Some(Param { name, ty })
    }

    fn parse_type_name(&mut self) -> Option<TypeName> {
        match self.cur_token {
            Token::TyBool => Some(TypeName::Bool),
            Token::TyInt => Some(TypeName::Int),
            Token::TyFloat => Some(TypeName::Float),
            Token::TyString => Some(TypeName::String),
            _ => {
                self.errors.push(format!(
                    "line {}: expected a type name, got {:?}",
                    self.cur_line, self.cur_token
                ));
                None
            }
        }
    }

    fn parse_block(&mut self) -> Option<Block> {
        let mut stmts = vec![];
        self.next_token();

        while self.cur_token != Token::RBrace && self.cur_token != Token::Eof {
            if let Some(stmt) = self.parse_stmt() {
                stmts.push(stmt);
            }
            self.next_token();
        }

        Some(Block { stmts })
    }

    fn parse_stmt(&mut self) -> Option<Stmt> {
        match self.cur_token {
            Token::Let => self.parse_let(false),
            Token::Const => self.parse_let(true),
            Token::Return => self.parse_return(),
            Token::If => self.parse_if(),
            Token::While => self.parse_while(),
            Token::LBrace => Some(Stmt::Block(self.parse_block()?)),
            _ => self.parse_expr_stmt(),
        }
    }

    fn parse_let(&mut self, is_const: bool) -> Option<Stmt> {
        let line = self.cur_line;
        if !self.expect_peek_ident() {
            return None;
        }
        let name = self.cur_ident()?;

        let mut type_hint = None;
        if self.peek_token == Token::Colon {
            self.next_token();
            self.next_token();
            type_hint = self.parse_type_name();
        }

        if !self.expect_peek(Token::Equal) {
            return None;
        }
        self.next_token();

        let init = self.parse_expression(Precedence::Lowest)?;

        if self.peek_token == Token::Semicolon {
            self.next_token();
        }

        Some(if is_const {
            Stmt::Const {
                name,
                type_hint,
                init,
                line,
            }
        } else {
            Stmt::Let {
                name,
                type_hint,
                init,
                line,
            }
        })
    }

    fn parse_return(&mut self) -> Option<Stmt> {
        let line = self.cur_line;
        self.next_token();

        let value = if self.cur_token == Token::Semicolon || self.cur_token == Token::RBrace {
            None
        } else {
            let expr = self.parse_expression(Precedence::Lowest)?;
            if self.peek_token == Token::Semicolon {
                self.next_token();
            }
            Some(expr)
        };

        Some(Stmt::Return { value, line })
    }

    fn parse_if(&mut self) -> Option<Stmt> {
        let line = self.cur_line;
        if !self.expect_peek(Token::LParen) {
            return None;
        }
        self.next_token();
        let test = self.parse_expression(Precedence::Lowest)?;
        if !self.expect_peek(Token::RParen) {
            return None;
        }
        if !self.expect_peek(Token::LBrace) {
            return None;
        }
        let then_branch = self.parse_block()?;

        let else_branch = if self.peek_token == Token::Else {
            self.next_token();
            if !self.expect_peek(Token::LBrace) {
                return None;
            }
            Some(self.parse_block()?)
        } else {
            None
        };

        Some(Stmt::If {
            test,
            then_branch,
            else_branch,
            line,
        })
    }

    fn parse_while(&mut self) -> Option<Stmt> {
        let line = self.cur_line;
        if !self.expect_peek(Token::LParen) {
            return None;
        }
        self.next_token();
        let test = self.parse_expression(Precedence::Lowest)?;
        if !self.expect_peek(Token::RParen) {
            return None;
        }
        if !self.expect_peek(Token::LBrace) {
            return None;
        }
        let body = self.parse_block()?;

        Some(Stmt::While { test, body, line })
    }

    fn parse_expr_stmt(&mut self) -> Option<Stmt> {
        let expr = self.parse_expression(Precedence::Lowest)?;
        if self.peek_token == Token::Semicolon {
            self.next_token();
        }
        Some(Stmt::Expr(expr))
    }

    // --- Expressions ---

    fn parse_expression(&mut self, precedence: Precedence) -> Option<Expr> {
        let mut left = self.parse_prefix()?;

        while self.peek_token == Token::ColonColon {
            self.next_token(); // consume ::
            let line = self.cur_line;
            self.next_token(); // move to field name
            let field = self.cur_ident()?;
            left = Expr::Access {
                object: Box::new(left),
                field,
                line,
            };
        }

        if self.peek_token == Token::Equal {
            if matches!(left, Expr::Ident(..) | Expr::Access { .. }) {
                let line = left.line();
                self.next_token(); // consume =
                self.next_token(); // move to value
                let value = self.parse_expression(Precedence::Lowest)?;
                return Some(Expr::Assign {
                    target: Box::new(left),
                    value: Box::new(value),
                    line,
                });
            }
        }

        while self.peek_token != Token::Semicolon && precedence < self.peek_precedence() {
            match self.peek_token {
                Token::Plus
                | Token::Minus
                | Token::Star
                | Token::Slash
                | Token::EqualEqual
                | Token::NotEqual
                | Token::Less
                | Token::Greater
                | Token::AndAnd
                | Token::OrOr => {
                    self.next_token();
                    left = self.parse_infix(left)?;
                }
                _ => return Some(left),
            }
        }
        Some(left)
    }

    fn parse_prefix(&mut self) -> Option<Expr> {
        let line = self.cur_line;
        match &self.cur_token {
            Token::Int(val) => Some(Expr::IntLit(*val, line)),
            Token::Float(val) => Some(Expr::FloatLit(*val, line)),
            Token::True => Some(Expr::BoolLit(true, line)),
            Token::False => Some(Expr::BoolLit(false, line)),
            Token::Ident(name) => {
                let name = name.clone();
                if self.peek_token == Token::LParen {
                    self.next_token(); // move onto (
                    let args = self.parse_expression_list(Token::RParen)?;
                    Some(Expr::Call {
                        callee: name,
                        args,
                        line,
                    })
                } else {
                    Some(Expr::Ident(name, line))
                }
            }
            Token::Minus => {
                self.next_token();
                let inner = self.parse_expression(Precedence::Unary)?;
                Some(Expr::Unary {
                    op: UnaryOp::Neg,
                    expr: Box::new(inner),
                    line,
                })
            }
            Token::LParen => {
                self.next_token();
                let expr = self.parse_expression(Precedence::Lowest)?;
                if !self.expect_peek(Token::RParen) {
                    return None;
                }
                Some(expr)
            }
            other => {
                self.errors
                    .push(format!("line {line}: unexpected token {other:?} in expression"));
                None
            }
        }
    }

    fn parse_infix(&mut self, left: Expr) -> Option<Expr> {
        let line = self.cur_line;
        let op = match self.cur_token {
            Token::Plus => BinaryOp::Add,
            Token::Minus => BinaryOp::Sub,
            Token::Star => BinaryOp::Mul,
            Token::Slash => BinaryOp::Div,
            Token::EqualEqual => BinaryOp::Eq,
            Token::NotEqual => BinaryOp::Ne,
            Token::Less => BinaryOp::Lt,
            Token::Greater => BinaryOp::Gt,
            Token::AndAnd => BinaryOp::And,
            Token::OrOr => BinaryOp::Or,
            _ => return None,
        };

        let precedence = self.cur_precedence();
        self.next_token();
        let right = self.parse_expression(precedence)?;

        Some(Expr::Binary {
            op,
            left: Box::new(left),
            right: Box::new(right),
            line,
        })
    }

    fn parse_expression_list(&mut self, end_token: Token) -> Option<Vec<Expr>> {
        let mut list = vec![];

        if self.peek_token == end_token {
            self.next_token();
            return Some(list);
        }

        self.next_token();
        list.push(self.parse_expression(Precedence::Lowest)?);

        while self.peek_token == Token::Comma {
            self.next_token();
            self.next_token();
            list.push(self.parse_expression(Precedence::Lowest)?);
        }

        if !self.expect_peek(end_token) {
            return None;
        }
        Some(list)
    }

    fn peek_precedence(&self) -> Precedence {
        self.token_precedence(&self.peek_token)
    }

    fn cur_precedence(&self) -> Precedence {
        self.token_precedence(&self.cur_token)
    }

    fn token_precedence(&self, token: &Token) -> Precedence {
        match token {
            Token::OrOr => Precedence::LogicOr,
            Token::AndAnd => Precedence::LogicAnd,
            Token::Less | Token::Greater => Precedence::Compare,
            Token::EqualEqual | Token::NotEqual => Precedence::Equality,
            Token::Plus | Token::Minus => Precedence::Sum,
            Token::Star | Token::Slash => Precedence::Product,
            _ => Precedence::Lowest,
        }
    }

    fn cur_ident(&mut self) -> Option<String> {
        match &self.cur_token {
            Token::Ident(s) => Some(s.clone()),
            other => {
                self.errors
                    .push(format!("line {}: expected an identifier, got {other:?}", self.cur_line));
                None
            }
        }
    }

    fn expect_peek_ident(&mut self) -> bool {
        if matches!(self.peek_token, Token::Ident(_)) {
            self.next_token();
            true
        } else {
            self.peek_error_msg("an identifier");
            false
        }
    }

    fn expect_peek(&mut self, token: Token) -> bool {
        if self.peek_token == token {
            self.next_token();
            true
        } else {
            self.peek_error_msg(&format!("{token:?}"));
            false
        }
    }

    fn peek_error_msg(&mut self, expected: &str) {
        self.errors.push(format!(
            "line {}: expected {expected}, got {:?} instead",
            self.cur_line, self.peek_token
        ));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(input: &str) -> Program {
        let l = Lexer::new(input);
        let mut p = Parser::new(l);
        let prog = p.parse_program();
        if !p.errors.is_empty() {
            panic!("parser errors: {:?}", p.errors);
        }
        prog
    }

    #[test]
    fn test_function_with_return() {
        let prog = parse("func main(): int { return 0; }");
        assert_eq!(prog.items.len(), 1);
        match &prog.items[0] {
            Item::Function {
                name, params, ret, body, ..
            } => {
                assert_eq!(name, "main");
                assert!(params.is_empty());
                assert_eq!(*ret, TypeName::Int);
                assert_eq!(body.stmts.len(), 1);
                assert!(matches!(body.stmts[0], Stmt::Return { .. }));
            }
            _ => panic!("expected function"),
        }
    }

    #[test]
    fn test_native_use() {
        let prog = parse("use func print_int(x: int): int;");
        assert_eq!(prog.items.len(), 1);
        match &prog.items[0] {
            Item::NativeUse { name, params, ret, .. } => {
                assert_eq!(name, "print_int");
                assert_eq!(params.len(), 1);
                assert_eq!(params[0].name, "x");
                assert_eq!(params[0].ty, TypeName::Int);
                assert_eq!(*ret, TypeName::Int);
            }
            _ => panic!("expected native use"),
        }
    }

    #[test]
    fn test_let_with_binary_expr() {
        let prog = parse("func main(): int { let x: int = 3 + 4; return x; }");
        match &prog.items[0] {
            Item::Function { body, .. } => match &body.stmts[0] {
                Stmt::Let { name, type_hint, init, .. } => {
                    assert_eq!(name, "x");
                    assert_eq!(*type_hint, Some(TypeName::Int));
                    assert!(matches!(init, Expr::Binary { op: BinaryOp::Add, .. }));
                }
                _ => panic!("expected let"),
            },
            _ => panic!("expected function"),
        }
    }

    #[test]
    fn test_if_else() {
        let prog = parse("func main(): int { if (1 < 2) { return 0; } else { return 1; } }");
        match &prog.items[0] {
            Item::Function { body, .. } => match &body.stmts[0] {
                Stmt::If { test, else_branch, .. } => {
                    assert!(matches!(test, Expr::Binary { op: BinaryOp::Lt, .. }));
                    assert!(else_branch.is_some());
                }
                _ => panic!("expected if"),
            },
            _ => panic!("expected function"),
        }
    }

    #[test]
    fn test_call_expression() {
        let prog = parse("func main(): int { print_int(7); return 0; }");
        match &prog.items[0] {
            Item::Function { body, .. } => match &body.stmts[0] {
                Stmt::Expr(Expr::Call { callee, args, .. }) => {
                    assert_eq!(callee, "print_int");
                    assert_eq!(args.len(), 1);
                }
                other => panic!("expected call expr statement, got {other:?}"),
            },
            _ => panic!("expected function"),
        }
    }

    #[test]
    fn test_assignment() {
        let prog = parse("func main(): int { let x: int = 1; x = x + 1; return x; }");
        match &prog.items[0] {
            Item::Function { body, .. } => {
                assert!(matches!(body.stmts[1], Stmt::Expr(Expr::Assign { .. })));
            }
            _ => panic!("expected function"),
        }
    }

    #[test]
    fn test_while_loop() {
        let prog = parse("func main(): int { while (1 < 2) { return 0; } return 1; }");
        match &prog.items[0] {
            Item::Function { body, .. } => assert!(matches!(body.stmts[0], Stmt::While { .. })),
            _ => panic!("expected function"),
        }
    }
}
