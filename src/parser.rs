// File: src/parser.rs
//
// Parser for the Dunlin language.
// Recursive-descent statement parser with a precedence-climbing expression
// parser. Syntax errors are collected and parsing resynchronizes at the next
// statement so a single run reports as many errors as possible.

use crate::ast::{Expr, Stmt};
use crate::errors::Diagnostic;
use crate::lexer::{Token, TokenKind};

pub struct Parser {
    tokens: Vec<Token>,
    pos: usize,
    errors: Vec<Diagnostic>,
}

impl Parser {
    pub fn new(tokens: Vec<Token>) -> Self {
        Parser { tokens, pos: 0, errors: Vec::new() }
    }

    /// Parses the whole token stream. Statements that fail to parse are
    /// skipped after recording a diagnostic.
    pub fn parse(&mut self) -> Vec<Stmt> {
        let mut stmts = Vec::new();
        loop {
            self.skip_separators();
            if matches!(self.peek(), TokenKind::Eof) {
                break;
            }
            match self.parse_stmt() {
                Some(stmt) => stmts.push(stmt),
                None => {
                    let before = self.pos;
                    self.synchronize();
                    // A stray token synchronize stops at (a lone closing
                    // brace, say) must still be consumed or parsing stalls.
                    if self.pos == before && !matches!(self.peek(), TokenKind::Eof) {
                        self.advance();
                    }
                }
            }
        }
        stmts
    }

    pub fn has_errors(&self) -> bool {
        !self.errors.is_empty()
    }

    pub fn errors(&self) -> &[Diagnostic] {
        &self.errors
    }

    pub fn take_errors(&mut self) -> Vec<Diagnostic> {
        std::mem::take(&mut self.errors)
    }

    // --- token cursor ---

    fn peek(&self) -> &TokenKind {
        self.tokens.get(self.pos).map(|t| &t.kind).unwrap_or(&TokenKind::Eof)
    }

    fn peek_token(&self) -> &Token {
        self.tokens.get(self.pos).unwrap_or_else(|| self.tokens.last().expect("eof token"))
    }

    fn line(&self) -> usize {
        self.peek_token().line
    }

    fn advance(&mut self) -> Token {
        let tok = self.peek_token().clone();
        if self.pos < self.tokens.len() {
            self.pos += 1;
        }
        tok
    }

    fn check_punct(&self, c: char) -> bool {
        matches!(self.peek(), TokenKind::Punctuation(p) if *p == c)
    }

    fn eat_punct(&mut self, c: char) -> bool {
        if self.check_punct(c) {
            self.advance();
            true
        } else {
            false
        }
    }

    fn expect_punct(&mut self, c: char, what: &str) -> bool {
        if self.eat_punct(c) {
            true
        } else {
            self.error(format!("expected '{}' {}", c, what));
            false
        }
    }

    fn check_keyword(&self, kw: &str) -> bool {
        matches!(self.peek(), TokenKind::Keyword(k) if k == kw)
    }

    fn error(&mut self, message: String) {
        let tok = self.peek_token();
        let context = describe(&tok.kind);
        self.errors.push(Diagnostic::new(message, tok.line, tok.column, context));
    }

    /// Skips tokens until a likely statement boundary so one syntax error
    /// does not cascade into dozens.
    fn synchronize(&mut self) {
        loop {
            match self.peek() {
                TokenKind::Eof => return,
                TokenKind::Punctuation(';') => {
                    self.advance();
                    return;
                }
                TokenKind::Punctuation('}') => return,
                TokenKind::Keyword(k)
                    if matches!(
                        k.as_str(),
                        "if" | "while" | "for" | "func" | "return" | "break" | "continue"
                    ) =>
                {
                    return;
                }
                _ => {
                    self.advance();
                }
            }
        }
    }

    fn skip_separators(&mut self) {
        while self.check_punct(';') {
            self.advance();
        }
    }

    // --- statements ---

    fn parse_stmt(&mut self) -> Option<Stmt> {
        match self.peek() {
            TokenKind::Keyword(k) if k == "func" => self.parse_func(),
            TokenKind::Keyword(k) if k == "if" => self.parse_if(),
            TokenKind::Keyword(k) if k == "while" => self.parse_while(),
            TokenKind::Keyword(k) if k == "for" => self.parse_for(),
            TokenKind::Keyword(k) if k == "return" => {
                let line = self.line();
                self.advance();
                let value = if self.check_punct(';')
                    || self.check_punct('}')
                    || matches!(self.peek(), TokenKind::Eof)
                {
                    None
                } else {
                    Some(self.parse_expr()?)
                };
                Some(Stmt::Return { value, line })
            }
            TokenKind::Keyword(k) if k == "break" => {
                let line = self.line();
                self.advance();
                Some(Stmt::Break { line })
            }
            TokenKind::Keyword(k) if k == "continue" => {
                let line = self.line();
                self.advance();
                Some(Stmt::Continue { line })
            }
            _ => self.parse_assign_or_expr(),
        }
    }

    /// An expression statement, or an assignment when an `=` follows the
    /// parsed expression.
    fn parse_assign_or_expr(&mut self) -> Option<Stmt> {
        let line = self.line();
        let expr = self.parse_expr()?;
        if matches!(self.peek(), TokenKind::Operator(op) if op == "=") {
            self.advance();
            let value = self.parse_expr()?;
            if !matches!(expr, Expr::Identifier { .. } | Expr::Index { .. }) {
                self.error("invalid assignment target".to_string());
                return None;
            }
            return Some(Stmt::Assign { target: expr, value, line });
        }
        Some(Stmt::ExprStmt { expr, line })
    }

    /// An assignment in a `for` header (`i = 0` or `a[i] = x`).
    fn parse_assignment(&mut self) -> Option<Stmt> {
        let line = self.line();
        let target = self.parse_expr()?;
        if !matches!(self.peek(), TokenKind::Operator(op) if op == "=") {
            self.error("expected '=' in assignment".to_string());
            return None;
        }
        self.advance();
        let value = self.parse_expr()?;
        if !matches!(target, Expr::Identifier { .. } | Expr::Index { .. }) {
            self.error("invalid assignment target".to_string());
            return None;
        }
        Some(Stmt::Assign { target, value, line })
    }

    fn parse_block(&mut self) -> Option<Vec<Stmt>> {
        if !self.expect_punct('{', "to open a block") {
            return None;
        }
        let mut stmts = Vec::new();
        loop {
            self.skip_separators();
            if self.check_punct('}') || matches!(self.peek(), TokenKind::Eof) {
                break;
            }
            match self.parse_stmt() {
                Some(stmt) => stmts.push(stmt),
                None => {
                    self.synchronize();
                    if matches!(self.peek(), TokenKind::Eof) {
                        break;
                    }
                }
            }
        }
        self.expect_punct('}', "to close the block");
        Some(stmts)
    }

    fn parse_if(&mut self) -> Option<Stmt> {
        let line = self.line();
        self.advance(); // if
        let cond = self.parse_expr()?;
        let then_block = self.parse_block()?;
        let mut elifs = Vec::new();
        while self.check_keyword("elif") {
            self.advance();
            let elif_cond = self.parse_expr()?;
            let elif_block = self.parse_block()?;
            elifs.push((elif_cond, elif_block));
        }
        let else_block = if self.check_keyword("else") {
            self.advance();
            Some(self.parse_block()?)
        } else {
            None
        };
        Some(Stmt::If { cond, then_block, elifs, else_block, line })
    }

    fn parse_while(&mut self) -> Option<Stmt> {
        let line = self.line();
        self.advance(); // while
        let cond = self.parse_expr()?;
        let body = self.parse_block()?;
        Some(Stmt::While { cond, body, line })
    }

    fn parse_for(&mut self) -> Option<Stmt> {
        let line = self.line();
        self.advance(); // for
        let init = self.parse_assignment()?;
        if !self.expect_punct(';', "after the loop initializer") {
            return None;
        }
        let cond = self.parse_expr()?;
        if !self.expect_punct(';', "after the loop condition") {
            return None;
        }
        let update = self.parse_assignment()?;
        let body = self.parse_block()?;
        Some(Stmt::For {
            init: Box::new(init),
            cond,
            update: Box::new(update),
            body,
            line,
        })
    }

    fn parse_func(&mut self) -> Option<Stmt> {
        let line = self.line();
        self.advance(); // func
        let name = match self.peek() {
            TokenKind::Identifier(n) => {
                let name = n.clone();
                self.advance();
                name
            }
            _ => {
                self.error("expected function name".to_string());
                return None;
            }
        };
        if !self.expect_punct('(', "after the function name") {
            return None;
        }
        let mut params = Vec::new();
        while let TokenKind::Identifier(p) = self.peek() {
            params.push(p.clone());
            self.advance();
            if !self.eat_punct(',') {
                break;
            }
        }
        if !self.expect_punct(')', "after the parameter list") {
            return None;
        }
        let body = self.parse_block()?;
        Some(Stmt::FuncDef { name, params, body, line })
    }

    // --- expressions ---

    fn parse_expr(&mut self) -> Option<Expr> {
        self.parse_binary(0)
    }

    fn parse_binary(&mut self, min_prec: u8) -> Option<Expr> {
        let mut left = self.parse_unary()?;
        loop {
            let op = match self.peek() {
                TokenKind::Operator(op) => op.clone(),
                _ => break,
            };
            let Some((prec, right_assoc)) = binary_precedence(&op) else {
                break;
            };
            if prec < min_prec {
                break;
            }
            let line = self.line();
            self.advance();
            let next_min = if right_assoc { prec } else { prec + 1 };
            let right = self.parse_binary(next_min)?;
            left = Expr::Binary { left: Box::new(left), op, right: Box::new(right), line };
        }
        Some(left)
    }

    fn parse_unary(&mut self) -> Option<Expr> {
        if let TokenKind::Operator(op) = self.peek() {
            if op == "-" || op == "!" {
                let op = op.clone();
                let line = self.line();
                self.advance();
                let operand = self.parse_unary()?;
                return Some(Expr::Unary { op, operand: Box::new(operand), line });
            }
        }
        self.parse_postfix()
    }

    fn parse_postfix(&mut self) -> Option<Expr> {
        let mut expr = self.parse_primary()?;
        loop {
            if self.check_punct('(') {
                let line = self.line();
                self.advance();
                let mut args = Vec::new();
                if !self.check_punct(')') {
                    loop {
                        args.push(self.parse_expr()?);
                        if !self.eat_punct(',') {
                            break;
                        }
                    }
                }
                if !self.expect_punct(')', "after the call arguments") {
                    return None;
                }
                expr = Expr::Call { callee: Box::new(expr), args, line };
            } else if self.check_punct('[') {
                let line = self.line();
                self.advance();
                let index = self.parse_expr()?;
                if !self.expect_punct(']', "after the index expression") {
                    return None;
                }
                expr = Expr::Index { array: Box::new(expr), index: Box::new(index), line };
            } else {
                break;
            }
        }
        Some(expr)
    }

    fn parse_primary(&mut self) -> Option<Expr> {
        let line = self.line();
        match self.peek().clone() {
            TokenKind::Number(value) => {
                self.advance();
                Some(Expr::Number { value, line })
            }
            TokenKind::Str(value) => {
                self.advance();
                Some(Expr::Str { value, line })
            }
            TokenKind::Identifier(name) => {
                self.advance();
                Some(Expr::Identifier { name, line })
            }
            TokenKind::Keyword(k) if k == "true" || k == "false" => {
                self.advance();
                Some(Expr::Bool { value: k == "true", line })
            }
            TokenKind::Keyword(k) if k == "nothing" => {
                self.advance();
                Some(Expr::Nothing { line })
            }
            TokenKind::Punctuation('(') => {
                self.advance();
                let expr = self.parse_expr()?;
                if !self.expect_punct(')', "after the grouped expression") {
                    return None;
                }
                Some(expr)
            }
            TokenKind::Punctuation('[') => {
                self.advance();
                let mut elements = Vec::new();
                if !self.check_punct(']') {
                    loop {
                        elements.push(self.parse_expr()?);
                        if !self.eat_punct(',') {
                            break;
                        }
                    }
                }
                if !self.expect_punct(']', "after the array elements") {
                    return None;
                }
                Some(Expr::Array { elements, line })
            }
            other => {
                self.error(format!("unexpected {}", describe(&other)));
                None
            }
        }
    }
}

fn binary_precedence(op: &str) -> Option<(u8, bool)> {
    // (precedence, right-associative)
    match op {
        "||" => Some((1, false)),
        "&&" => Some((2, false)),
        "==" | "!=" => Some((3, false)),
        "<" | ">" | "<=" | ">=" => Some((4, false)),
        "+" | "-" => Some((5, false)),
        "*" | "/" | "%" => Some((6, false)),
        "**" => Some((7, true)),
        _ => None,
    }
}

fn describe(kind: &TokenKind) -> String {
    match kind {
        TokenKind::Identifier(n) => format!("identifier '{}'", n),
        TokenKind::Number(n) => format!("number {}", n),
        TokenKind::Str(_) => "string literal".to_string(),
        TokenKind::Operator(op) => format!("operator '{}'", op),
        TokenKind::Punctuation(c) => format!("'{}'", c),
        TokenKind::Keyword(k) => format!("keyword '{}'", k),
        TokenKind::Eof => "end of input".to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lexer::tokenize;
    use pretty_assertions::assert_eq;

    fn parse_source(source: &str) -> (Vec<Stmt>, Vec<Diagnostic>) {
        let mut parser = Parser::new(tokenize(source));
        let stmts = parser.parse();
        let errors = parser.take_errors();
        (stmts, errors)
    }

    fn parse_ok(source: &str) -> Vec<Stmt> {
        let (stmts, errors) = parse_source(source);
        assert!(errors.is_empty(), "unexpected parse errors: {:?}", errors);
        stmts
    }

    #[test]
    fn parses_assignment_with_precedence() {
        let stmts = parse_ok("x = 2 + 3 * 4");
        let Stmt::Assign { target, value, .. } = &stmts[0] else {
            panic!("expected assignment");
        };
        assert_eq!(*target, Expr::Identifier { name: "x".into(), line: 1 });
        // 2 + (3 * 4)
        let Expr::Binary { op, right, .. } = value else {
            panic!("expected binary expression");
        };
        assert_eq!(op, "+");
        assert!(matches!(&**right, Expr::Binary { op, .. } if op == "*"));
    }

    #[test]
    fn power_is_right_associative() {
        let stmts = parse_ok("x = 2 ** 3 ** 2");
        let Stmt::Assign { value: Expr::Binary { op, right, .. }, .. } = &stmts[0] else {
            panic!("expected binary assignment");
        };
        assert_eq!(op, "**");
        assert!(matches!(&**right, Expr::Binary { op, .. } if op == "**"));
    }

    #[test]
    fn parses_if_elif_else() {
        let stmts = parse_ok("if a < 1 { x = 1 } elif a < 2 { x = 2 } else { x = 3 }");
        let Stmt::If { elifs, else_block, .. } = &stmts[0] else {
            panic!("expected if statement");
        };
        assert_eq!(elifs.len(), 1);
        assert!(else_block.is_some());
    }

    #[test]
    fn parses_c_style_for() {
        let stmts = parse_ok("for i = 0; i < 5; i = i + 1 { x = x + i }");
        let Stmt::For { init, cond, update, body, .. } = &stmts[0] else {
            panic!("expected for statement");
        };
        assert!(matches!(&**init, Stmt::Assign { .. }));
        assert!(matches!(cond, Expr::Binary { op, .. } if op == "<"));
        assert!(matches!(&**update, Stmt::Assign { .. }));
        assert_eq!(body.len(), 1);
    }

    #[test]
    fn parses_function_definition() {
        let stmts = parse_ok("func add(a, b) { return a + b }");
        let Stmt::FuncDef { name, params, body, .. } = &stmts[0] else {
            panic!("expected function definition");
        };
        assert_eq!(name, "add");
        assert_eq!(params, &["a".to_string(), "b".to_string()]);
        assert!(matches!(body[0], Stmt::Return { value: Some(_), .. }));
    }

    #[test]
    fn parses_calls_and_indexing() {
        let stmts = parse_ok("print(a[0], f(1)[2])");
        let Stmt::ExprStmt { expr: Expr::Call { callee, args, .. }, .. } = &stmts[0] else {
            panic!("expected call statement");
        };
        assert!(matches!(&**callee, Expr::Identifier { name, .. } if name == "print"));
        assert!(matches!(args[0], Expr::Index { .. }));
        assert!(matches!(args[1], Expr::Index { .. }));
    }

    #[test]
    fn parses_array_literal() {
        let stmts = parse_ok("a = [1, 2, 3]");
        let Stmt::Assign { value: Expr::Array { elements, .. }, .. } = &stmts[0] else {
            panic!("expected array literal");
        };
        assert_eq!(elements.len(), 3);
    }

    #[test]
    fn semicolons_separate_statements() {
        let stmts = parse_ok("x = 1; y = 2; print(x, y)");
        assert_eq!(stmts.len(), 3);
    }

    #[test]
    fn invalid_assignment_target_is_an_error() {
        let (_, errors) = parse_source("1 = 2");
        assert_eq!(errors.len(), 1);
        assert!(errors[0].message.contains("invalid assignment target"));
    }

    #[test]
    fn reports_multiple_errors() {
        let (_, errors) = parse_source("x = ; y = 2; z = )");
        assert!(errors.len() >= 2, "expected at least two errors, got {:?}", errors);
    }

    #[test]
    fn recovers_and_parses_later_statements() {
        let (stmts, errors) = parse_source("x = ; y = 2");
        assert!(!errors.is_empty());
        assert!(stmts.iter().any(
            |s| matches!(s, Stmt::Assign { target: Expr::Identifier { name, .. }, .. } if name == "y")
        ));
    }

    #[test]
    fn stray_closing_brace_does_not_stall_parsing() {
        let (stmts, errors) = parse_source("} x = 1");
        assert!(!errors.is_empty());
        assert!(stmts.iter().any(|s| matches!(s, Stmt::Assign { .. })));
    }

    #[test]
    fn error_carries_position() {
        let (_, errors) = parse_source("x = \n  +");
        assert!(!errors.is_empty());
        assert_eq!(errors[0].line, 2);
    }

    #[test]
    fn unary_operators_nest() {
        let stmts = parse_ok("x = !!b; y = --1");
        assert!(matches!(
            &stmts[0],
            Stmt::Assign { value: Expr::Unary { op, .. }, .. } if op == "!"
        ));
        assert!(matches!(
            &stmts[1],
            Stmt::Assign { value: Expr::Unary { op, .. }, .. } if op == "-"
        ));
    }
}
