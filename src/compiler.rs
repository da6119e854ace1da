// File: src/compiler.rs
//
// Single-pass bytecode compiler for the Dunlin language.
// Walks the syntax tree and emits instructions directly: constants are pooled
// and deduplicated, globals get dense slots in first-assignment order, locals
// get per-scope slots with recorded init depths, and forward jumps are
// emitted with placeholders and patched once their target is known.
//
// Errors are accumulated so one run can report as many as possible; the VM
// must not be invoked when any are present.

use ahash::AHashMap;
use std::rc::Rc;

use crate::ast::{Expr, Stmt};
use crate::builtins;
use crate::bytecode::{pack_local, CompiledProgram, FunctionDef, Op};
use crate::errors::Diagnostic;
use crate::value::Value;

/// Result of a name lookup: where the name lives, if anywhere.
#[derive(Debug, Clone, Copy)]
struct Resolved {
    slot: usize,
    /// For locals: distance-based depth as seen from the innermost scope.
    /// For a miss: the depth a new local would be created at.
    depth: usize,
    is_global: bool,
    exists: bool,
}

/// Per-loop bookkeeping: jump sites to patch at loop exit, and the scope
/// depth of the loop's own scope so early exits can unwind nested blocks.
struct LoopFrame {
    breaks: Vec<usize>,
    continues: Vec<usize>,
    scope_depth: usize,
}

/// Snapshot of the compiler's append-only state, used by the REPL to roll
/// back an input that failed to compile.
#[derive(Debug, Clone, Copy)]
pub struct Checkpoint {
    code_len: usize,
    constants_len: usize,
    globals_len: usize,
}

pub struct Compiler {
    constants: Vec<Value>,
    code: Vec<u8>,
    /// Source line per code byte, for runtime error reporting.
    lines: Vec<u32>,

    /// Global identifier -> dense slot, in first-assignment order.
    global_symbols: AHashMap<String, usize>,
    /// Stack of local scopes: name -> slot within the scope.
    scopes: Vec<AHashMap<String, usize>>,
    /// Scope-stack depth at which each live local was first created.
    local_init_depth: AHashMap<String, usize>,
    /// Built-in constant name -> constant pool index.
    builtin_constants: AHashMap<String, usize>,

    inside_function: bool,
    loops: Vec<LoopFrame>,
    /// REPL mode: keep the value of a trailing expression statement on the
    /// stack instead of popping it, so the session can echo it.
    repl_echo: bool,

    errors: Vec<Diagnostic>,
}

impl Compiler {
    pub fn new() -> Self {
        let mut compiler = Compiler {
            constants: Vec::new(),
            code: Vec::new(),
            lines: Vec::new(),
            global_symbols: AHashMap::new(),
            scopes: Vec::new(),
            local_init_depth: AHashMap::new(),
            builtin_constants: AHashMap::new(),
            inside_function: false,
            loops: Vec::new(),
            repl_echo: false,
            errors: Vec::new(),
        };
        for (name, value) in builtins::CONSTANTS {
            let index = compiler.add_constant(Value::Number(value));
            compiler.builtin_constants.insert(name.to_string(), index);
        }
        compiler
    }

    /// Compiles a program, appending to any previously compiled code.
    pub fn compile(&mut self, stmts: &[Stmt]) {
        for (i, stmt) in stmts.iter().enumerate() {
            if self.repl_echo && i + 1 == stmts.len() {
                if let Stmt::ExprStmt { expr, .. } = stmt {
                    // Leave the value for the REPL to display.
                    self.compile_expr(expr);
                    continue;
                }
            }
            self.compile_stmt(stmt);
        }
    }

    /// The compiler output contract: constants, code, line table, and the
    /// number of global slots the VM must allocate.
    pub fn program(&self) -> CompiledProgram {
        CompiledProgram {
            constants: self.constants.clone(),
            code: self.code.clone(),
            lines: self.lines.clone(),
            globals_size: self.global_symbols.len(),
        }
    }

    pub fn set_repl_echo(&mut self, on: bool) {
        self.repl_echo = on;
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

    pub fn checkpoint(&self) -> Checkpoint {
        Checkpoint {
            code_len: self.code.len(),
            constants_len: self.constants.len(),
            globals_len: self.global_symbols.len(),
        }
    }

    /// Discards everything emitted since the checkpoint. Used by the REPL so
    /// a failed input leaves no partial bytecode behind.
    pub fn rollback(&mut self, checkpoint: Checkpoint) {
        self.code.truncate(checkpoint.code_len);
        self.lines.truncate(checkpoint.code_len);
        self.constants.truncate(checkpoint.constants_len);
        self.global_symbols.retain(|_, slot| *slot < checkpoint.globals_len);
        self.scopes.clear();
        self.loops.clear();
        self.inside_function = false;
    }

    // --- emission helpers ---

    /// Emits an operand-less instruction, returning its position.
    fn emit(&mut self, op: Op, line: usize) -> usize {
        debug_assert_eq!(op.operand_width(), 0);
        let pos = self.code.len();
        self.code.push(op as u8);
        self.lines.push(line as u32);
        pos
    }

    /// Emits an instruction with a 1-byte operand.
    fn emit_u8(&mut self, op: Op, operand: usize, line: usize) -> usize {
        debug_assert_eq!(op.operand_width(), 1);
        if operand > u8::MAX as usize {
            self.add_error(
                format!("operand {} too large for {}", operand, op),
                line,
                "operand overflow",
            );
        }
        let pos = self.code.len();
        self.code.push(op as u8);
        self.code.push(operand as u8);
        self.lines.push(line as u32);
        self.lines.push(line as u32);
        pos
    }

    /// Emits an instruction with a 2-byte big-endian operand.
    fn emit_u16(&mut self, op: Op, operand: usize, line: usize) -> usize {
        debug_assert_eq!(op.operand_width(), 2);
        if operand > u16::MAX as usize {
            self.add_error(
                format!("operand {} too large for {}", operand, op),
                line,
                "operand overflow",
            );
        }
        let pos = self.code.len();
        self.code.push(op as u8);
        self.code.extend_from_slice(&(operand as u16).to_be_bytes());
        self.lines.extend_from_slice(&[line as u32; 3]);
        pos
    }

    /// Emits a jump (or other patched instruction) with a zeroed operand and
    /// returns its position for later patching.
    fn emit_patch_site(&mut self, op: Op, line: usize) -> usize {
        match op.operand_width() {
            1 => self.emit_u8(op, 0, line),
            2 => self.emit_u16(op, 0, line),
            _ => unreachable!("patch site for operand-less {}", op),
        }
    }

    /// Overwrites the operand of the instruction at `pos`.
    fn patch_operand(&mut self, pos: usize, operand: usize) {
        let op = Op::from_byte(self.code[pos]).expect("patching a known opcode");
        match op.operand_width() {
            1 => {
                if operand > u8::MAX as usize {
                    let line = self.lines[pos] as usize;
                    self.add_error(
                        format!("operand {} too large for {}", operand, op),
                        line,
                        "operand overflow",
                    );
                    return;
                }
                self.code[pos + 1] = operand as u8;
            }
            2 => {
                if operand > u16::MAX as usize {
                    let line = self.lines[pos] as usize;
                    self.add_error(
                        format!("operand {} too large for {}", operand, op),
                        line,
                        "operand overflow",
                    );
                    return;
                }
                let bytes = (operand as u16).to_be_bytes();
                self.code[pos + 1] = bytes[0];
                self.code[pos + 2] = bytes[1];
            }
            _ => unreachable!("patching operand-less {}", op),
        }
    }

    /// Patches the instruction at `pos` to target the current pc.
    fn patch_to_here(&mut self, pos: usize) {
        let target = self.code.len();
        self.patch_operand(pos, target);
    }

    /// Emits a packed local access, checking the operand ranges.
    fn emit_local(&mut self, op: Op, depth: usize, slot: usize, line: usize) {
        if depth > u8::MAX as usize {
            self.add_error("blocks nested too deeply".to_string(), line, "scope depth");
            return;
        }
        if slot > u8::MAX as usize {
            self.add_error("too many local variables in scope".to_string(), line, "local slot");
            return;
        }
        self.emit_u16(op, pack_local(depth, slot), line);
    }

    // --- constants and symbols ---

    /// Adds a constant to the pool, deduplicating scalars by structural
    /// equality. Function descriptors are always appended fresh.
    fn add_constant(&mut self, value: Value) -> usize {
        if value.is_scalar() {
            if let Some(index) = self.constants.iter().position(|c| *c == value) {
                return index;
            }
        }
        self.constants.push(value);
        self.constants.len() - 1
    }

    /// Returns the global slot for `name`, allocating one on first use.
    fn global_slot(&mut self, name: &str) -> usize {
        if let Some(&slot) = self.global_symbols.get(name) {
            return slot;
        }
        let slot = self.global_symbols.len();
        self.global_symbols.insert(name.to_string(), slot);
        slot
    }

    fn enter_scope(&mut self) {
        self.scopes.push(AHashMap::new());
    }

    fn leave_scope(&mut self) {
        self.scopes.pop();
    }

    /// Looks `name` up: innermost local scope outward, then the globals.
    fn resolve(&self, name: &str) -> Resolved {
        for (i, scope) in self.scopes.iter().enumerate().rev() {
            if let Some(&slot) = scope.get(name) {
                return Resolved { slot, depth: self.scopes.len() - i, is_global: false, exists: true };
            }
        }
        if let Some(&slot) = self.global_symbols.get(name) {
            return Resolved { slot, depth: 0, is_global: true, exists: true };
        }
        Resolved { slot: 0, depth: self.scopes.len(), is_global: false, exists: false }
    }

    /// A variable may not shadow a built-in function or constant.
    fn check_assignable(&mut self, name: &str, line: usize) -> bool {
        if builtins::is_builtin_fn(name) || builtins::is_builtin_constant(name) {
            self.add_error("cannot assign to built-in name".to_string(), line, name);
            return false;
        }
        true
    }

    fn add_error(&mut self, message: String, line: usize, context: &str) {
        self.errors.push(Diagnostic::new(message, line, 0, context));
    }

    // --- statements ---

    fn compile_stmt(&mut self, stmt: &Stmt) {
        match stmt {
            Stmt::ExprStmt { expr, line } => {
                self.compile_expr(expr);
                // Discard the unused statement value.
                self.emit(Op::Pop, *line);
            }

            Stmt::Assign { target, value, line } => {
                self.compile_expr(value);
                match target {
                    Expr::Identifier { name, .. } => self.compile_store(name, *line),
                    Expr::Index { array, index, .. } => {
                        self.compile_expr(array);
                        self.compile_expr(index);
                        self.emit(Op::ArraySet, *line);
                    }
                    _ => self.add_error("invalid assignment target".to_string(), *line, ""),
                }
            }

            Stmt::If { cond, then_block, elifs, else_block, line } => {
                let mut end_jumps = Vec::new();

                self.compile_expr(cond);
                let mut next_branch = self.emit_patch_site(Op::JumpIfFalse, *line);
                self.compile_block(then_block, *line);
                end_jumps.push(self.emit_patch_site(Op::Jump, *line));
                self.patch_to_here(next_branch);

                for (elif_cond, elif_block) in elifs {
                    let elif_line = elif_cond.line();
                    self.compile_expr(elif_cond);
                    next_branch = self.emit_patch_site(Op::JumpIfFalse, elif_line);
                    self.compile_block(elif_block, elif_line);
                    end_jumps.push(self.emit_patch_site(Op::Jump, elif_line));
                    self.patch_to_here(next_branch);
                }

                if let Some(else_block) = else_block {
                    self.compile_block(else_block, *line);
                }

                for site in end_jumps {
                    self.patch_to_here(site);
                }
            }

            Stmt::While { cond, body, line } => {
                self.enter_scope();
                let enter_site = self.emit_u8(Op::EnterScope, 0, *line);
                self.loops.push(LoopFrame {
                    breaks: Vec::new(),
                    continues: Vec::new(),
                    scope_depth: self.scopes.len(),
                });

                let start_pc = self.code.len();
                self.compile_expr(cond);
                let exit_jump = self.emit_patch_site(Op::JumpIfFalse, *line);
                for stmt in body {
                    self.compile_stmt(stmt);
                }
                self.emit_u16(Op::Jump, start_pc, *line);
                self.patch_to_here(exit_jump);

                let frame = self.loops.pop().expect("loop frame pushed above");
                for site in frame.breaks {
                    self.patch_to_here(site);
                }
                for site in frame.continues {
                    self.patch_operand(site, start_pc);
                }

                let local_count = self.scopes.last().map(|s| s.len()).unwrap_or(0);
                self.patch_operand(enter_site, local_count);
                self.leave_scope();
                self.emit(Op::LeaveScope, *line);
            }

            Stmt::For { init, cond, update, body, line } => {
                self.enter_scope();
                let enter_site = self.emit_u8(Op::EnterScope, 0, *line);
                self.loops.push(LoopFrame {
                    breaks: Vec::new(),
                    continues: Vec::new(),
                    scope_depth: self.scopes.len(),
                });

                self.compile_stmt(init);
                let start_pc = self.code.len();
                self.compile_expr(cond);
                let exit_jump = self.emit_patch_site(Op::JumpIfFalse, *line);
                for stmt in body {
                    self.compile_stmt(stmt);
                }
                // continue lands here so the update always runs.
                let update_pc = self.code.len();
                self.compile_stmt(update);
                self.emit_u16(Op::Jump, start_pc, *line);
                self.patch_to_here(exit_jump);

                let frame = self.loops.pop().expect("loop frame pushed above");
                for site in frame.breaks {
                    self.patch_to_here(site);
                }
                for site in frame.continues {
                    self.patch_operand(site, update_pc);
                }

                let local_count = self.scopes.last().map(|s| s.len()).unwrap_or(0);
                self.patch_operand(enter_site, local_count);
                self.leave_scope();
                self.emit(Op::LeaveScope, *line);
            }

            Stmt::Break { line } => {
                if self.loops.is_empty() {
                    self.add_error("'break' outside of a loop".to_string(), *line, "break");
                    return;
                }
                self.unwind_to(self.loops.last().expect("non-empty").scope_depth, *line);
                let site = self.emit_patch_site(Op::Jump, *line);
                self.loops.last_mut().expect("non-empty").breaks.push(site);
            }

            Stmt::Continue { line } => {
                if self.loops.is_empty() {
                    self.add_error("'continue' outside of a loop".to_string(), *line, "continue");
                    return;
                }
                self.unwind_to(self.loops.last().expect("non-empty").scope_depth, *line);
                let site = self.emit_patch_site(Op::Jump, *line);
                self.loops.last_mut().expect("non-empty").continues.push(site);
            }

            Stmt::Return { value, line } => {
                if !self.inside_function {
                    self.add_error("'return' outside of a function".to_string(), *line, "return");
                    return;
                }
                match value {
                    Some(expr) => self.compile_expr(expr),
                    None => {
                        self.emit(Op::LoadNothing, *line);
                    }
                }
                // Unwind block scopes down to the function frame, which
                // RETURN itself pops.
                self.unwind_to(1, *line);
                self.emit(Op::Return, *line);
            }

            Stmt::FuncDef { name, params, body, line } => {
                self.compile_func_def(name, params, body, *line);
            }
        }
    }

    /// Emits one LEAVE_SCOPE per scope entered beyond `target_depth`, without
    /// changing the compile-time scope stack (the source scopes stay live
    /// past the early exit).
    fn unwind_to(&mut self, target_depth: usize, line: usize) {
        for _ in target_depth..self.scopes.len() {
            self.emit(Op::LeaveScope, line);
        }
    }

    /// Compiles a brace block in a fresh scope. The ENTER_SCOPE operand is
    /// patched to the block's final slot count once it is known.
    fn compile_block(&mut self, stmts: &[Stmt], line: usize) {
        self.enter_scope();
        let enter_site = self.emit_u8(Op::EnterScope, 0, line);
        for stmt in stmts {
            self.compile_stmt(stmt);
        }
        let local_count = self.scopes.last().map(|s| s.len()).unwrap_or(0);
        self.patch_operand(enter_site, local_count);
        self.leave_scope();
        self.emit(Op::LeaveScope, line);
    }

    /// Emits a store to `name` following the assignment rules: global at top
    /// level, global override, existing local through its init depth, or a
    /// fresh local in the innermost scope.
    fn compile_store(&mut self, name: &str, line: usize) {
        if !self.check_assignable(name, line) {
            return;
        }

        if self.scopes.is_empty() {
            let slot = self.global_slot(name);
            self.emit_u8(Op::StoreGlobal, slot, line);
            return;
        }

        let resolved = self.resolve(name);
        if resolved.exists && resolved.is_global {
            self.emit_u8(Op::StoreGlobal, resolved.slot, line);
        } else if resolved.exists {
            // The original init depth, not the current nesting depth: a
            // reference from a deeper block must reach the frame the local
            // was created in.
            let depth = self.local_init_depth.get(name).copied().unwrap_or(resolved.depth);
            self.emit_local(Op::StoreLocal, depth, resolved.slot, line);
        } else {
            let scope = self.scopes.last_mut().expect("non-empty scope stack");
            let slot = scope.len();
            scope.insert(name.to_string(), slot);
            self.local_init_depth.insert(name.to_string(), resolved.depth);
            self.emit_local(Op::StoreLocal, resolved.depth, slot, line);
        }
    }

    fn compile_func_def(&mut self, name: &str, params: &[String], body: &[Stmt], line: usize) {
        if self.inside_function || !self.scopes.is_empty() {
            self.add_error(
                "function definitions are only allowed at top level".to_string(),
                line,
                name,
            );
            return;
        }
        if !self.check_assignable(name, line) {
            return;
        }
        if params.len() > u8::MAX as usize {
            self.add_error("too many parameters".to_string(), line, name);
            return;
        }

        // Descriptor goes into the pool now so the body can refer to the
        // function (recursion); start_pc and local_size are patched in by
        // replacing the entry once the body is compiled.
        let const_index = self.constants.len();
        self.constants.push(Value::Function(Rc::new(FunctionDef {
            name: name.to_string(),
            arity: params.len(),
            local_size: params.len(),
            start_pc: 0,
        })));

        self.emit_u8(Op::LoadConst, const_index, line);
        self.emit(Op::MakeFunction, line);
        let slot = self.global_slot(name);
        self.emit_u8(Op::StoreGlobal, slot, line);

        // Sequential execution must bypass the body.
        let skip = self.emit_patch_site(Op::Jump, line);
        let start_pc = self.code.len();

        self.enter_scope();
        for (i, param) in params.iter().enumerate() {
            if !self.check_assignable(param, line) {
                continue;
            }
            self.scopes.last_mut().expect("function scope").insert(param.clone(), i);
            self.local_init_depth.insert(param.clone(), 1);
        }

        self.inside_function = true;
        for stmt in body {
            self.compile_stmt(stmt);
        }
        if !matches!(body.last(), Some(Stmt::Return { .. })) {
            self.emit(Op::LoadNothing, line);
            self.emit(Op::Return, line);
        }
        self.inside_function = false;

        let local_size = self.scopes.last().map(|s| s.len()).unwrap_or(params.len());
        self.leave_scope();
        self.patch_to_here(skip);

        self.constants[const_index] = Value::Function(Rc::new(FunctionDef {
            name: name.to_string(),
            arity: params.len(),
            local_size,
            start_pc,
        }));
    }

    // --- expressions ---

    fn compile_expr(&mut self, expr: &Expr) {
        match expr {
            Expr::Number { value, line } => {
                let index = self.add_constant(Value::Number(*value));
                self.emit_u8(Op::LoadConst, index, *line);
            }

            Expr::Str { value, line } => {
                let index = self.add_constant(Value::string(value.as_str()));
                self.emit_u8(Op::LoadConst, index, *line);
            }

            Expr::Bool { value, line } => {
                let index = self.add_constant(Value::Bool(*value));
                self.emit_u8(Op::LoadConst, index, *line);
            }

            Expr::Nothing { line } => {
                self.emit(Op::LoadNothing, *line);
            }

            Expr::Identifier { name, line } => {
                // Built-in constants inline the pool value; built-in function
                // names load as string sentinels for CALL to route.
                if let Some(&index) = self.builtin_constants.get(name) {
                    self.emit_u8(Op::LoadConst, index, *line);
                    return;
                }
                if builtins::is_builtin_fn(name) {
                    let index = self.add_constant(Value::string(name.as_str()));
                    self.emit_u8(Op::LoadConst, index, *line);
                    return;
                }

                let resolved = self.resolve(name);
                if !resolved.exists {
                    self.add_error("undefined variable".to_string(), *line, name);
                    self.emit(Op::LoadNothing, *line);
                    return;
                }
                if resolved.is_global {
                    self.emit_u8(Op::LoadGlobal, resolved.slot, *line);
                } else {
                    let depth =
                        self.local_init_depth.get(name).copied().unwrap_or(resolved.depth);
                    self.emit_local(Op::LoadLocal, depth, resolved.slot, *line);
                }
            }

            Expr::Unary { op, operand, line } => {
                self.compile_expr(operand);
                match op.as_str() {
                    "-" => {
                        self.emit(Op::Neg, *line);
                    }
                    "!" => {
                        self.emit(Op::Not, *line);
                    }
                    _ => self.add_error(format!("unknown unary operator '{}'", op), *line, op),
                }
            }

            Expr::Binary { left, op, right, line } => {
                self.compile_expr(left);
                self.compile_expr(right);
                let opcode = match op.as_str() {
                    "+" => Op::Add,
                    "-" => Op::Sub,
                    "*" => Op::Mul,
                    "/" => Op::Div,
                    "%" => Op::Mod,
                    "**" => Op::Pow,
                    "==" => Op::Eq,
                    "!=" => Op::Neq,
                    "<" => Op::Lt,
                    ">" => Op::Gt,
                    "<=" => Op::Lte,
                    ">=" => Op::Gte,
                    "&&" => Op::And,
                    "||" => Op::Or,
                    _ => {
                        self.add_error(format!("unknown binary operator '{}'", op), *line, op);
                        return;
                    }
                };
                self.emit(opcode, *line);
            }

            Expr::Array { elements, line } => {
                if elements.len() > u8::MAX as usize {
                    self.add_error("array literal too large".to_string(), *line, "array");
                    return;
                }
                for element in elements {
                    self.compile_expr(element);
                }
                self.emit_u8(Op::MakeArray, elements.len(), *line);
            }

            Expr::Index { array, index, line } => {
                self.compile_expr(array);
                self.compile_expr(index);
                self.emit(Op::ArrayGet, *line);
            }

            Expr::Call { callee, args, line } => {
                if args.len() > u8::MAX as usize {
                    self.add_error("too many call arguments".to_string(), *line, "call");
                    return;
                }
                for arg in args {
                    self.compile_expr(arg);
                }
                self.compile_expr(callee);
                self.emit_u8(Op::Call, args.len(), *line);
            }
        }
    }
}

impl Default for Compiler {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bytecode::{instruction_boundaries, read_operand, unpack_local};
    use crate::lexer::tokenize;
    use crate::parser::Parser;
    use pretty_assertions::assert_eq;
    use proptest::prelude::*;

    fn compile_source(source: &str) -> (CompiledProgram, Vec<Diagnostic>) {
        let mut parser = Parser::new(tokenize(source));
        let stmts = parser.parse();
        assert!(!parser.has_errors(), "parse errors: {:?}", parser.errors());
        let mut compiler = Compiler::new();
        compiler.compile(&stmts);
        let errors = compiler.take_errors();
        (compiler.program(), errors)
    }

    fn compile_ok(source: &str) -> CompiledProgram {
        let (program, errors) = compile_source(source);
        assert!(errors.is_empty(), "compile errors: {:?}", errors);
        program
    }

    fn compile_err(source: &str) -> Vec<Diagnostic> {
        let (_, errors) = compile_source(source);
        assert!(!errors.is_empty(), "expected compile errors");
        errors
    }

    /// Decodes a code stream into (pc, op, operand) triples.
    fn decode(program: &CompiledProgram) -> Vec<(usize, Op, usize)> {
        instruction_boundaries(&program.code)
            .into_iter()
            .map(|pc| {
                let op = Op::from_byte(program.code[pc]).expect("valid opcode");
                (pc, op, read_operand(op, &program.code, pc))
            })
            .collect()
    }

    fn ops(program: &CompiledProgram) -> Vec<Op> {
        decode(program).into_iter().map(|(_, op, _)| op).collect()
    }

    #[test]
    fn globals_get_dense_slots_in_first_assignment_order() {
        let program = compile_ok("x = 1; y = 2; x = 3");
        let stores: Vec<usize> = decode(&program)
            .into_iter()
            .filter(|(_, op, _)| *op == Op::StoreGlobal)
            .map(|(_, _, operand)| operand)
            .collect();
        assert_eq!(stores, vec![0, 1, 0]);
        assert_eq!(program.globals_size, 2);
    }

    #[test]
    fn scalar_constants_are_deduplicated() {
        let program = compile_ok(r#"x = 1; y = 1; s = "a"; t = "a"; u = true; v = true"#);
        let ones = program.constants.iter().filter(|c| **c == Value::Number(1.0)).count();
        let strs = program.constants.iter().filter(|c| **c == Value::string("a")).count();
        let bools = program.constants.iter().filter(|c| **c == Value::Bool(true)).count();
        assert_eq!((ones, strs, bools), (1, 1, 1));
    }

    #[test]
    fn builtin_constants_inline_the_pool_value() {
        let program = compile_ok("x = PI; y = E");
        let loads: Vec<usize> = decode(&program)
            .into_iter()
            .filter(|(_, op, _)| *op == Op::LoadConst)
            .map(|(_, _, operand)| operand)
            .collect();
        assert_eq!(program.constants[loads[0]], Value::Number(std::f64::consts::PI));
        assert_eq!(program.constants[loads[1]], Value::Number(std::f64::consts::E));
    }

    #[test]
    fn builtin_function_names_load_as_string_sentinels() {
        let program = compile_ok("print(1)");
        let instrs = decode(&program);
        // args, callee, CALL argc, then the statement value is discarded.
        let (_, op, operand) = instrs[1];
        assert_eq!(op, Op::LoadConst);
        assert_eq!(program.constants[operand], Value::string("print"));
        assert_eq!(instrs[2].1, Op::Call);
        assert_eq!(instrs[2].2, 1);
        assert_eq!(instrs[3].1, Op::Pop);
    }

    #[test]
    fn expression_statements_pop_their_value() {
        let program = compile_ok("1 + 2");
        assert_eq!(ops(&program), vec![Op::LoadConst, Op::LoadConst, Op::Add, Op::Pop]);
    }

    #[test]
    fn repl_echo_keeps_the_trailing_expression_value() {
        let mut parser = Parser::new(tokenize("x = 1; x + 1"));
        let stmts = parser.parse();
        let mut compiler = Compiler::new();
        compiler.set_repl_echo(true);
        compiler.compile(&stmts);
        assert!(!compiler.has_errors());
        let program = compiler.program();
        assert_eq!(ops(&program).last(), Some(&Op::Add));
    }

    #[test]
    fn blocks_enter_and_leave_scopes() {
        let program = compile_ok("if true { x = 1 }");
        let ops = ops(&program);
        assert_eq!(ops.iter().filter(|op| **op == Op::EnterScope).count(), 1);
        assert_eq!(ops.iter().filter(|op| **op == Op::LeaveScope).count(), 1);
    }

    #[test]
    fn block_locals_use_store_local_with_depth_one() {
        let program = compile_ok("if true { x = 1; y = x }");
        let locals: Vec<(usize, usize)> = decode(&program)
            .into_iter()
            .filter(|(_, op, _)| matches!(op, Op::StoreLocal | Op::LoadLocal))
            .map(|(_, _, operand)| unpack_local(operand))
            .collect();
        // store x, load x, store y
        assert_eq!(locals, vec![(1, 0), (1, 0), (1, 1)]);
    }

    #[test]
    fn nested_block_reuses_original_init_depth() {
        let program = compile_ok("if true { x = 1; if true { x = 2 } }");
        let stores: Vec<(usize, usize)> = decode(&program)
            .into_iter()
            .filter(|(_, op, _)| *op == Op::StoreLocal)
            .map(|(_, _, operand)| unpack_local(operand))
            .collect();
        // Both stores reach the frame x was created in: depth 1, slot 0.
        assert_eq!(stores, vec![(1, 0), (1, 0)]);
    }

    #[test]
    fn enter_scope_operand_is_patched_to_slot_count() {
        let program = compile_ok("if true { x = 1; y = 2; z = 3 }");
        let (_, op, operand) = decode(&program)
            .into_iter()
            .find(|(_, op, _)| *op == Op::EnterScope)
            .expect("block emits ENTER_SCOPE");
        assert_eq!(op, Op::EnterScope);
        assert_eq!(operand, 3);
    }

    #[test]
    fn while_back_edge_targets_the_condition() {
        let program = compile_ok("i = 0; while i < 3 { i = i + 1 }");
        let instrs = decode(&program);
        let enter_pc = instrs
            .iter()
            .find(|(_, op, _)| *op == Op::EnterScope)
            .map(|(pc, _, _)| *pc)
            .unwrap();
        let start_pc = enter_pc + 2; // condition starts right after ENTER_SCOPE
        let back_edge = instrs
            .iter()
            .filter(|(_, op, _)| *op == Op::Jump)
            .map(|(_, _, operand)| *operand)
            .last()
            .unwrap();
        assert_eq!(back_edge, start_pc);
    }

    #[test]
    fn break_jumps_to_the_loop_leave_scope() {
        let program = compile_ok("while true { break }");
        let instrs = decode(&program);
        let leave_pc = instrs
            .iter()
            .filter(|(_, op, _)| *op == Op::LeaveScope)
            .map(|(pc, _, _)| *pc)
            .last()
            .unwrap();
        // The break's jump is the one that is not the back-edge.
        let jumps: Vec<usize> = instrs
            .iter()
            .filter(|(_, op, _)| *op == Op::Jump)
            .map(|(_, _, operand)| *operand)
            .collect();
        assert!(jumps.contains(&leave_pc), "break target {:?} missing leave pc {}", jumps, leave_pc);
    }

    #[test]
    fn break_inside_nested_block_unwinds_the_block_scope() {
        let program = compile_ok("while true { if true { break } }");
        // LEAVE_SCOPE count: one for the if block on the break path, one for
        // the if block's normal exit, one for the loop.
        let leaves = ops(&program).iter().filter(|op| **op == Op::LeaveScope).count();
        let enters = ops(&program).iter().filter(|op| **op == Op::EnterScope).count();
        assert_eq!(enters, 2);
        assert_eq!(leaves, 3);
    }

    #[test]
    fn function_descriptor_is_finalized_in_the_pool() {
        let program = compile_ok("func add(a, b) { return a + b }");
        let descriptor = program
            .constants
            .iter()
            .find_map(|c| match c {
                Value::Function(f) => Some(f.clone()),
                _ => None,
            })
            .expect("descriptor in pool");
        assert_eq!(descriptor.name, "add");
        assert_eq!(descriptor.arity, 2);
        assert_eq!(descriptor.local_size, 2);
        // start_pc points just past LOAD_CONST + MAKE_FUNCTION + STORE_GLOBAL + JUMP.
        let instrs = decode(&program);
        let skip_jump = instrs.iter().find(|(_, op, _)| *op == Op::Jump).unwrap();
        assert_eq!(descriptor.start_pc, skip_jump.0 + 3);
        // The skip jump bypasses the whole body.
        assert!(skip_jump.2 > descriptor.start_pc);
    }

    #[test]
    fn function_body_without_return_gets_nothing_epilogue() {
        let program = compile_ok("func noop() { }");
        let ops = ops(&program);
        assert!(ops.windows(2).any(|w| w == [Op::LoadNothing, Op::Return]));
    }

    #[test]
    fn function_locals_extend_local_size_beyond_arity() {
        let program = compile_ok("func f(a) { b = a + 1; return b }");
        let descriptor = program
            .constants
            .iter()
            .find_map(|c| match c {
                Value::Function(f) => Some(f.clone()),
                _ => None,
            })
            .unwrap();
        assert_eq!(descriptor.arity, 1);
        assert_eq!(descriptor.local_size, 2);
    }

    #[test]
    fn break_at_top_level_is_a_compile_error() {
        let errors = compile_err("break");
        assert!(errors[0].message.contains("outside of a loop"));
    }

    #[test]
    fn continue_at_top_level_is_a_compile_error() {
        let errors = compile_err("continue");
        assert!(errors[0].message.contains("outside of a loop"));
    }

    #[test]
    fn return_at_top_level_is_a_compile_error() {
        let errors = compile_err("return 1");
        assert!(errors[0].message.contains("outside of a function"));
    }

    #[test]
    fn undefined_variable_is_a_compile_error() {
        let errors = compile_err("x = y + 1");
        assert!(errors[0].message.contains("undefined variable"));
        assert_eq!(errors[0].context, "y");
    }

    #[test]
    fn shadowing_a_builtin_is_a_compile_error() {
        assert!(compile_err("print = 1")[0].message.contains("built-in"));
        assert!(compile_err("PI = 3")[0].message.contains("built-in"));
        assert!(compile_err("func ask() { }")[0].message.contains("built-in"));
    }

    #[test]
    fn nested_function_definitions_are_rejected() {
        let errors = compile_err("func outer() { func inner() { } }");
        assert!(errors[0].message.contains("top level"));
    }

    #[test]
    fn compilation_reports_multiple_errors() {
        let (_, errors) = compile_source("x = a; y = b; break");
        assert_eq!(errors.len(), 3);
    }

    #[test]
    fn constant_pool_overflow_is_reported() {
        let mut source = String::new();
        for i in 0..300 {
            source.push_str(&format!("x = {}.5;\n", i));
        }
        let errors = compile_err(&source);
        assert!(errors.iter().any(|e| e.message.contains("too large")));
    }

    // --- property tests (generated well-formed programs) ---

    static VARS: [&str; 4] = ["a", "b", "c", "d"];

    fn ident(name: &str) -> Expr {
        Expr::Identifier { name: name.to_string(), line: 1 }
    }

    fn num(value: f64) -> Expr {
        Expr::Number { value, line: 1 }
    }

    fn arb_expr() -> impl Strategy<Value = Expr> {
        let leaf = prop_oneof![
            (-100i32..100).prop_map(|n| num(f64::from(n))),
            proptest::sample::select(&VARS[..]).prop_map(ident),
        ];
        leaf.prop_recursive(3, 16, 2, |inner| {
            (inner.clone(), proptest::sample::select(vec!["+", "-", "*"]), inner).prop_map(
                |(left, op, right)| Expr::Binary {
                    left: Box::new(left),
                    op: op.to_string(),
                    right: Box::new(right),
                    line: 1,
                },
            )
        })
    }

    fn arb_cond() -> impl Strategy<Value = Expr> {
        (proptest::sample::select(&VARS[..]), -10i32..10).prop_map(|(var, n)| Expr::Binary {
            left: Box::new(ident(var)),
            op: "<".to_string(),
            right: Box::new(num(f64::from(n))),
            line: 1,
        })
    }

    fn arb_stmt() -> impl Strategy<Value = Stmt> {
        let assign = (proptest::sample::select(&VARS[..]), arb_expr())
            .prop_map(|(var, e)| Stmt::Assign { target: ident(var), value: e, line: 1 });
        let print_call = arb_expr().prop_map(|e| Stmt::ExprStmt {
            expr: Expr::Call { callee: Box::new(ident("print")), args: vec![e], line: 1 },
            line: 1,
        });
        let leaf = prop_oneof![assign, print_call];
        leaf.prop_recursive(3, 12, 3, |inner| {
            prop_oneof![
                (
                    arb_cond(),
                    prop::collection::vec(inner.clone(), 1..3),
                    prop::collection::vec(inner.clone(), 0..3)
                )
                    .prop_map(|(cond, then_block, else_stmts)| Stmt::If {
                        cond,
                        then_block,
                        elifs: Vec::new(),
                        else_block: if else_stmts.is_empty() { None } else { Some(else_stmts) },
                        line: 1,
                    }),
                (arb_cond(), prop::collection::vec(inner, 1..3))
                    .prop_map(|(cond, body)| Stmt::While { cond, body, line: 1 }),
            ]
        })
    }

    /// Programs that initialize every variable first, so all references
    /// resolve and compilation is error-free.
    fn arb_program() -> impl Strategy<Value = Vec<Stmt>> {
        prop::collection::vec(arb_stmt(), 1..6).prop_map(|mut stmts| {
            let mut program: Vec<Stmt> = VARS
                .iter()
                .map(|v| Stmt::Assign { target: ident(v), value: num(0.0), line: 1 })
                .collect();
            program.append(&mut stmts);
            program
        })
    }

    fn compile_ast(stmts: &[Stmt]) -> CompiledProgram {
        let mut compiler = Compiler::new();
        compiler.compile(stmts);
        assert!(!compiler.has_errors(), "generated program failed: {:?}", compiler.errors());
        compiler.program()
    }

    /// Static stack-effect deltas, summed linearly over the code stream.
    fn running_stack_sums(program: &CompiledProgram) -> Vec<i64> {
        let mut sums = Vec::new();
        let mut sum = 0i64;
        for (_, op, operand) in decode(program) {
            sum += match op {
                Op::LoadConst | Op::LoadNothing | Op::LoadGlobal | Op::LoadLocal => 1,
                Op::StoreGlobal | Op::StoreLocal | Op::Pop | Op::JumpIfFalse => -1,
                Op::Add
                | Op::Sub
                | Op::Mul
                | Op::Div
                | Op::Mod
                | Op::Pow
                | Op::Eq
                | Op::Neq
                | Op::Lt
                | Op::Gt
                | Op::Lte
                | Op::Gte
                | Op::And
                | Op::Or
                | Op::ArrayGet => -1,
                Op::Not | Op::Neg | Op::Jump | Op::MakeFunction => 0,
                Op::EnterScope | Op::LeaveScope => 0,
                // Every call consumes its arguments and callee and leaves
                // exactly one value.
                Op::Call => -(operand as i64),
                Op::MakeArray => 1 - operand as i64,
                Op::ArraySet => -3,
                Op::Return => unreachable!("generator emits no functions"),
            };
            sums.push(sum);
        }
        sums
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(64))]

        #[test]
        fn prop_stack_balance(program in arb_program()) {
            let compiled = compile_ast(&program);
            let sums = running_stack_sums(&compiled);
            prop_assert!(sums.iter().all(|&s| s >= 0), "negative stack depth: {:?}", sums);
            prop_assert_eq!(*sums.last().unwrap(), 0);
        }

        #[test]
        fn prop_scope_symmetry(program in arb_program()) {
            let compiled = compile_ast(&program);
            let enters = decode(&compiled).iter().filter(|(_, op, _)| *op == Op::EnterScope).count();
            let leaves = decode(&compiled).iter().filter(|(_, op, _)| *op == Op::LeaveScope).count();
            prop_assert_eq!(enters, leaves);
        }

        #[test]
        fn prop_jump_targets_are_instruction_boundaries(program in arb_program()) {
            let compiled = compile_ast(&program);
            let boundaries = instruction_boundaries(&compiled.code);
            for (_, op, operand) in decode(&compiled) {
                if matches!(op, Op::Jump | Op::JumpIfFalse) {
                    prop_assert!(
                        operand == compiled.code.len() || boundaries.contains(&operand),
                        "jump target {} not a boundary", operand
                    );
                }
            }
        }

        #[test]
        fn prop_globals_size_is_dense(program in arb_program()) {
            let compiled = compile_ast(&program);
            let max_slot = decode(&compiled)
                .iter()
                .filter(|(_, op, _)| matches!(op, Op::LoadGlobal | Op::StoreGlobal))
                .map(|(_, _, operand)| *operand)
                .max()
                .expect("programs always touch globals");
            prop_assert_eq!(compiled.globals_size, max_slot + 1);
        }

        #[test]
        fn prop_no_duplicate_scalar_constants(program in arb_program()) {
            let compiled = compile_ast(&program);
            let scalars: Vec<&Value> =
                compiled.constants.iter().filter(|c| c.is_scalar()).collect();
            for (i, a) in scalars.iter().enumerate() {
                for b in &scalars[i + 1..] {
                    prop_assert!(a != b, "duplicate constant {:?}", a);
                }
            }
        }
    }
}
