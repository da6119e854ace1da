// File: src/errors.rs
//
// Error reporting for the Dunlin toolchain.
// Each pipeline phase (parse, compile, execute) accumulates diagnostics
// instead of throwing; a phase with any diagnostics halts the pipeline and
// the driver prints a numbered report.

use colored::Colorize;
use std::fmt;

/// Pipeline phase a diagnostic belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Syntax,
    Compile,
    Runtime,
}

impl Phase {
    /// Header line of the printed report for this phase.
    pub fn header(self) -> &'static str {
        match self {
            Phase::Syntax => "SYNTAX ERRORS",
            Phase::Compile => "COMPILE ERRORS",
            Phase::Runtime => "RUNTIME ERRORS",
        }
    }
}

/// A single reported error: what went wrong, where, and in what context
/// (an offending name, operation or code fragment).
#[derive(Debug, Clone, PartialEq)]
pub struct Diagnostic {
    pub message: String,
    pub line: usize,
    pub column: usize,
    pub context: String,
}

impl Diagnostic {
    pub fn new(
        message: impl Into<String>,
        line: usize,
        column: usize,
        context: impl Into<String>,
    ) -> Self {
        Diagnostic {
            message: message.into(),
            line,
            column,
            context: context.into(),
        }
    }
}

impl fmt::Display for Diagnostic {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{} at line {}:{}", self.message, self.line, self.column)?;
        if !self.context.is_empty() {
            write!(f, "\n   context: {}", self.context)?;
        }
        Ok(())
    }
}

/// Prints a numbered report of every diagnostic in the phase to stderr,
/// with a rule separator after each entry.
pub fn print_report(phase: Phase, diagnostics: &[Diagnostic]) {
    if diagnostics.is_empty() {
        return;
    }
    eprintln!("{}", format!("{}:", phase.header()).red().bold());
    for (i, diagnostic) in diagnostics.iter().enumerate() {
        eprintln!("{}. {}", i + 1, diagnostic);
        eprintln!("{}", "─".repeat(60).dimmed());
    }
}
