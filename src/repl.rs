// File: src/repl.rs
//
// Interactive REPL for the Dunlin language.
// Maintains one compiler and one VM across inputs: globals, functions and
// constants survive, and each input's bytecode is appended to the session's
// code stream and executed from where the previous input stopped.
// Features:
// - Multi-line input (leave braces/brackets/parens unclosed to continue)
// - Command history with line editing (rustyline)
// - Special commands (:help, :quit, :reset, :bytecode, :clear)
// - Echo of a trailing expression's value

use colored::Colorize;
use rustyline::error::ReadlineError;
use rustyline::DefaultEditor;

use crate::bytecode::{self, CompiledProgram};
use crate::compiler::Compiler;
use crate::errors::{self, Diagnostic, Phase};
use crate::lexer;
use crate::parser::Parser;
use crate::value::Value;
use crate::vm::Vm;

/// Result of evaluating one REPL input.
pub enum EvalOutcome {
    /// The input ran; a trailing expression statement's value, if any.
    Value(Option<Value>),
    /// A phase failed; the pipeline stopped there.
    Failed(Phase, Vec<Diagnostic>),
}

/// The persistent part of a REPL: compiler and VM state that survives
/// across inputs. Kept separate from the terminal loop so it can be driven
/// programmatically.
pub struct Session {
    compiler: Compiler,
    vm: Vm,
}

impl Session {
    pub fn new() -> Self {
        let mut compiler = Compiler::new();
        compiler.set_repl_echo(true);
        let vm = Vm::new(compiler.program());
        Session { compiler, vm }
    }

    /// Redirects program output (used by tests).
    pub fn set_output_buffer(&mut self, buffer: std::rc::Rc<std::cell::RefCell<Vec<u8>>>) {
        self.vm.set_output_buffer(buffer);
    }

    /// The session's accumulated program, for bytecode inspection.
    pub fn program(&self) -> CompiledProgram {
        self.compiler.program()
    }

    /// Runs one input through parse -> compile -> execute. A failed compile
    /// rolls the compiler back so no partial bytecode survives; a failed run
    /// clears the execution state but keeps globals.
    pub fn eval(&mut self, input: &str) -> EvalOutcome {
        let mut parser = Parser::new(lexer::tokenize(input));
        let stmts = parser.parse();
        if parser.has_errors() {
            return EvalOutcome::Failed(Phase::Syntax, parser.take_errors());
        }

        let checkpoint = self.compiler.checkpoint();
        self.compiler.compile(&stmts);
        if self.compiler.has_errors() {
            let diagnostics = self.compiler.take_errors();
            self.compiler.rollback(checkpoint);
            return EvalOutcome::Failed(Phase::Compile, diagnostics);
        }

        self.vm.reload(self.compiler.program());
        self.vm.run();
        if self.vm.has_errors() {
            let diagnostics = self.vm.take_errors();
            self.vm.recover();
            return EvalOutcome::Failed(Phase::Runtime, diagnostics);
        }

        EvalOutcome::Value(self.vm.take_result())
    }
}

impl Default for Session {
    fn default() -> Self {
        Self::new()
    }
}

/// Terminal REPL: a rustyline editor wrapped around a [`Session`].
pub struct Repl {
    editor: DefaultEditor,
    session: Session,
}

impl Repl {
    pub fn new() -> Result<Self, Box<dyn std::error::Error>> {
        let editor = DefaultEditor::new()?;
        Ok(Repl { editor, session: Session::new() })
    }

    fn show_banner(&self) {
        println!("{}", "Dunlin interactive interpreter".bright_cyan().bold());
        println!(
            "  Type {} for commands, {} to exit.",
            ":help".bright_yellow(),
            ":quit".bright_yellow()
        );
        println!("  {} Leave braces unclosed to continue on the next line.", "Tip:".bright_magenta());
        println!();
    }

    pub fn run(&mut self) -> Result<(), Box<dyn std::error::Error>> {
        self.show_banner();

        let mut buffer = String::new();
        loop {
            let prompt = if buffer.is_empty() {
                "dunlin> ".bright_green().to_string()
            } else {
                "  ....> ".bright_blue().to_string()
            };

            match self.editor.readline(&prompt) {
                Ok(line) => {
                    let _ = self.editor.add_history_entry(line.as_str());

                    if buffer.is_empty() && line.trim_start().starts_with(':') {
                        if self.handle_command(line.trim()) {
                            continue;
                        }
                        break;
                    }

                    buffer.push_str(&line);
                    buffer.push('\n');

                    if input_complete(&buffer) {
                        self.eval_input(&buffer);
                        buffer.clear();
                    }
                }
                Err(ReadlineError::Interrupted) => {
                    println!("{}", "^C (input discarded, :quit to exit)".bright_yellow());
                    buffer.clear();
                }
                Err(ReadlineError::Eof) => {
                    println!("{}", "Goodbye!".bright_cyan());
                    break;
                }
                Err(err) => {
                    eprintln!("{} {}", "Error:".bright_red(), err);
                    break;
                }
            }
        }

        Ok(())
    }

    /// Handles a `:command`. Returns false when the REPL should exit.
    fn handle_command(&mut self, cmd: &str) -> bool {
        match cmd {
            ":help" | ":h" => {
                self.show_help();
                true
            }
            ":quit" | ":q" | ":exit" => {
                println!("{}", "Goodbye!".bright_cyan());
                false
            }
            ":clear" | ":c" => {
                print!("\x1B[2J\x1B[1;1H");
                self.show_banner();
                true
            }
            ":reset" | ":r" => {
                self.session = Session::new();
                println!("{}", "Session reset".bright_green());
                true
            }
            ":bytecode" | ":b" => {
                print!("{}", bytecode::disassemble(&self.session.program()));
                true
            }
            _ => {
                println!(
                    "{} Unknown command: {}. Type {} for available commands.",
                    "Error:".bright_red(),
                    cmd.bright_yellow(),
                    ":help".bright_yellow()
                );
                true
            }
        }
    }

    fn show_help(&self) {
        println!();
        println!("{}", "Commands:".bright_cyan().bold());
        println!("  {}  or :h   Show this help", ":help".bright_yellow());
        println!("  {}  or :q   Exit the REPL", ":quit".bright_yellow());
        println!("  {} or :c   Clear the screen", ":clear".bright_yellow());
        println!("  {} or :r   Reset the session (globals and functions)", ":reset".bright_yellow());
        println!("  {} or :b  Show the session's compiled bytecode", ":bytecode".bright_yellow());
        println!();
        println!("{}", "Multi-line input:".bright_cyan().bold());
        println!("  Leave braces, brackets or parentheses unclosed to continue");
        println!("  on the next line; close them to run the input.");
        println!();
    }

    fn eval_input(&mut self, input: &str) {
        if input.trim().is_empty() {
            return;
        }
        match self.session.eval(input) {
            EvalOutcome::Value(Some(value)) if !matches!(value, Value::Nothing) => {
                self.print_value(&value);
            }
            EvalOutcome::Value(_) => {}
            EvalOutcome::Failed(phase, diagnostics) => {
                errors::print_report(phase, &diagnostics);
            }
        }
    }

    fn print_value(&self, value: &Value) {
        let rendered = match value {
            Value::Str(s) => format!("\"{}\"", s).bright_green().to_string(),
            Value::Number(_) => value.to_string().bright_white().to_string(),
            Value::Bool(_) => value.to_string().bright_magenta().to_string(),
            Value::Function(_) => value.to_string().bright_cyan().to_string(),
            _ => value.to_string(),
        };
        println!("{} {}", "=>".bright_blue(), rendered);
    }
}

/// True when every brace, bracket and parenthesis is balanced outside of
/// strings and comments, so the buffered input is ready to evaluate.
fn input_complete(input: &str) -> bool {
    let trimmed = input.trim();
    if trimmed.is_empty() {
        return true;
    }

    let mut brace = 0i32;
    let mut bracket = 0i32;
    let mut paren = 0i32;
    let mut in_string = false;
    let mut escape_next = false;
    let mut in_comment = false;

    for ch in trimmed.chars() {
        if in_comment {
            if ch == '\n' {
                in_comment = false;
            }
            continue;
        }
        if escape_next {
            escape_next = false;
            continue;
        }
        match ch {
            '\\' if in_string => escape_next = true,
            '"' => in_string = !in_string,
            '#' if !in_string => in_comment = true,
            '{' if !in_string => brace += 1,
            '}' if !in_string => brace -= 1,
            '[' if !in_string => bracket += 1,
            ']' if !in_string => bracket -= 1,
            '(' if !in_string => paren += 1,
            ')' if !in_string => paren -= 1,
            _ => {}
        }
    }

    !in_string && brace <= 0 && bracket <= 0 && paren <= 0
}
