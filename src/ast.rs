// File: src/ast.rs
//
// Syntax tree for Dunlin programs, produced by the parser and consumed by
// the bytecode compiler. Every node carries the source line it started on.

#[derive(Debug, Clone, PartialEq)]
pub enum Expr {
    Identifier {
        name: String,
        line: usize,
    },
    Number {
        value: f64,
        line: usize,
    },
    Str {
        value: String,
        line: usize,
    },
    Bool {
        value: bool,
        line: usize,
    },
    Nothing {
        line: usize,
    },
    Unary {
        op: String,
        operand: Box<Expr>,
        line: usize,
    },
    Binary {
        left: Box<Expr>,
        op: String,
        right: Box<Expr>,
        line: usize,
    },
    Array {
        elements: Vec<Expr>,
        line: usize,
    },
    Index {
        array: Box<Expr>,
        index: Box<Expr>,
        line: usize,
    },
    Call {
        callee: Box<Expr>,
        args: Vec<Expr>,
        line: usize,
    },
}

impl Expr {
    pub fn line(&self) -> usize {
        match self {
            Expr::Identifier { line, .. }
            | Expr::Number { line, .. }
            | Expr::Str { line, .. }
            | Expr::Bool { line, .. }
            | Expr::Nothing { line }
            | Expr::Unary { line, .. }
            | Expr::Binary { line, .. }
            | Expr::Array { line, .. }
            | Expr::Index { line, .. }
            | Expr::Call { line, .. } => *line,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Stmt {
    /// `target = value` where target is an identifier or an index expression.
    Assign {
        target: Expr,
        value: Expr,
        line: usize,
    },
    ExprStmt {
        expr: Expr,
        line: usize,
    },
    If {
        cond: Expr,
        then_block: Vec<Stmt>,
        elifs: Vec<(Expr, Vec<Stmt>)>,
        else_block: Option<Vec<Stmt>>,
        line: usize,
    },
    While {
        cond: Expr,
        body: Vec<Stmt>,
        line: usize,
    },
    /// C-style loop: `for init; cond; update { body }`.
    For {
        init: Box<Stmt>,
        cond: Expr,
        update: Box<Stmt>,
        body: Vec<Stmt>,
        line: usize,
    },
    FuncDef {
        name: String,
        params: Vec<String>,
        body: Vec<Stmt>,
        line: usize,
    },
    Return {
        value: Option<Expr>,
        line: usize,
    },
    Break {
        line: usize,
    },
    Continue {
        line: usize,
    },
}

impl Stmt {
    pub fn line(&self) -> usize {
        match self {
            Stmt::Assign { line, .. }
            | Stmt::ExprStmt { line, .. }
            | Stmt::If { line, .. }
            | Stmt::While { line, .. }
            | Stmt::For { line, .. }
            | Stmt::FuncDef { line, .. }
            | Stmt::Return { line, .. }
            | Stmt::Break { line }
            | Stmt::Continue { line } => *line,
        }
    }
}
