// File: src/main.rs
//
// Entry point for the Dunlin interpreter.
// Runs a source file given as the positional argument, or starts the
// interactive REPL when none is given. Exit status is 0 on success and 1
// when any error was reported.

use clap::Parser as ClapParser;
use std::fs;
use std::path::PathBuf;

use dunlin::compiler::Compiler;
use dunlin::errors::{self, Phase};
use dunlin::lexer;
use dunlin::parser::Parser;
use dunlin::repl::Repl;
use dunlin::vm::Vm;
use dunlin::bytecode;

#[derive(ClapParser)]
#[command(
    name = "dunlin",
    about = "Dunlin: a small scripting language",
    version = env!("CARGO_PKG_VERSION"),
    long_about = None
)]
struct Cli {
    /// Source file to run; starts the interactive interpreter when omitted
    script: Option<PathBuf>,

    /// Print the compiled bytecode listing instead of executing
    #[arg(long)]
    disasm: bool,
}

fn main() {
    let cli = Cli::parse();

    match cli.script {
        Some(path) => run_file(&path, cli.disasm),
        None => match Repl::new() {
            Ok(mut repl) => {
                if let Err(e) = repl.run() {
                    eprintln!("REPL error: {}", e);
                    std::process::exit(1);
                }
            }
            Err(e) => {
                eprintln!("Failed to start REPL: {}", e);
                std::process::exit(1);
            }
        },
    }
}

fn run_file(path: &PathBuf, disasm: bool) {
    let source = match fs::read_to_string(path) {
        Ok(source) => source,
        Err(e) => {
            eprintln!("Failed to read {}: {}", path.display(), e);
            std::process::exit(1);
        }
    };

    let mut parser = Parser::new(lexer::tokenize(&source));
    let stmts = parser.parse();
    if parser.has_errors() {
        errors::print_report(Phase::Syntax, parser.errors());
        std::process::exit(1);
    }

    let mut compiler = Compiler::new();
    compiler.compile(&stmts);
    if compiler.has_errors() {
        // No bytecode runs when compilation reported anything.
        errors::print_report(Phase::Compile, compiler.errors());
        std::process::exit(1);
    }

    let program = compiler.program();
    if disasm {
        print!("{}", bytecode::disassemble(&program));
        return;
    }

    let mut vm = Vm::new(program);
    vm.run();
    if vm.has_errors() {
        errors::print_report(Phase::Runtime, vm.errors());
        std::process::exit(1);
    }
}
