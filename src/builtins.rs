// File: src/builtins.rs
//
// Built-in native functions and constants for Dunlin.
// Builtins are registered by name; the compiler reserves the names (and
// inlines the constants), the VM routes string callees through the registry.

use ahash::AHashMap;
use once_cell::sync::Lazy;
use std::cell::RefCell;
use std::collections::VecDeque;
use std::io::{BufRead, Write};
use std::rc::Rc;

use crate::value::Value;

/// Built-in numeric constants. Identifier references compile to a plain
/// `LOAD_CONST` of the inlined pool value.
pub const CONSTANTS: [(&str, f64); 2] =
    [("PI", std::f64::consts::PI), ("E", std::f64::consts::E)];

/// A host callable: receives the VM's I/O host and the argument vector in
/// source order, returns a value (`Nothing` for builtins with no result).
pub type BuiltinFn = fn(&mut Host, &[Value]) -> Result<Value, String>;

static REGISTRY: Lazy<AHashMap<&'static str, BuiltinFn>> = Lazy::new(|| {
    let mut map: AHashMap<&'static str, BuiltinFn> = AHashMap::new();
    map.insert("print", builtin_print);
    map.insert("ask", builtin_ask);
    map
});

pub fn registry() -> &'static AHashMap<&'static str, BuiltinFn> {
    &REGISTRY
}

pub fn lookup(name: &str) -> Option<BuiltinFn> {
    REGISTRY.get(name).copied()
}

pub fn is_builtin_fn(name: &str) -> bool {
    REGISTRY.contains_key(name)
}

pub fn is_builtin_constant(name: &str) -> bool {
    CONSTANTS.iter().any(|(n, _)| *n == name)
}

/// Where builtin output goes. Tests swap stdout for a shared byte buffer.
enum OutputSink {
    Stdout,
    Buffer(Rc<RefCell<Vec<u8>>>),
}

/// Where `ask` reads from. Tests inject a queue of lines.
enum InputSource {
    Stdin,
    Lines(VecDeque<String>),
}

/// The VM's side of the host: one output sink, one input source.
/// The only blocking interaction is `ask`, which waits for a line.
pub struct Host {
    output: OutputSink,
    input: InputSource,
}

impl Host {
    pub fn new() -> Self {
        Host { output: OutputSink::Stdout, input: InputSource::Stdin }
    }

    /// Redirects builtin output into a shared buffer (used by tests and
    /// anything else that wants to observe program output).
    pub fn set_output_buffer(&mut self, buffer: Rc<RefCell<Vec<u8>>>) {
        self.output = OutputSink::Buffer(buffer);
    }

    /// Replaces stdin with a fixed queue of input lines.
    pub fn set_input_lines(&mut self, lines: Vec<String>) {
        self.input = InputSource::Lines(lines.into());
    }

    pub fn write(&mut self, text: &str) {
        match &self.output {
            OutputSink::Stdout => {
                let stdout = std::io::stdout();
                let mut lock = stdout.lock();
                let _ = lock.write_all(text.as_bytes());
                let _ = lock.flush();
            }
            OutputSink::Buffer(buffer) => {
                buffer.borrow_mut().extend_from_slice(text.as_bytes());
            }
        }
    }

    /// Reads one line, without the terminating newline. `None` on EOF.
    pub fn read_line(&mut self) -> Option<String> {
        match &mut self.input {
            InputSource::Stdin => {
                let mut line = String::new();
                let n = std::io::stdin().lock().read_line(&mut line).ok()?;
                if n == 0 {
                    return None;
                }
                while line.ends_with('\n') || line.ends_with('\r') {
                    line.pop();
                }
                Some(line)
            }
            InputSource::Lines(lines) => lines.pop_front(),
        }
    }
}

impl Default for Host {
    fn default() -> Self {
        Self::new()
    }
}

/// `print(...args)`: arguments separated by one space, then a newline.
fn builtin_print(host: &mut Host, args: &[Value]) -> Result<Value, String> {
    let rendered: Vec<String> = args.iter().map(|a| a.to_string()).collect();
    host.write(&rendered.join(" "));
    host.write("\n");
    Ok(Value::Nothing)
}

/// `ask(prompt)`: writes the prompt, reads one line, returns it as a string.
fn builtin_ask(host: &mut Host, args: &[Value]) -> Result<Value, String> {
    if args.len() != 1 {
        return Err(format!("ask expects 1 argument, got {}", args.len()));
    }
    host.write(&args[0].to_string());
    let line = host.read_line().unwrap_or_default();
    Ok(Value::string(line))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn capture_host() -> (Host, Rc<RefCell<Vec<u8>>>) {
        let buffer = Rc::new(RefCell::new(Vec::new()));
        let mut host = Host::new();
        host.set_output_buffer(buffer.clone());
        (host, buffer)
    }

    fn captured(buffer: &Rc<RefCell<Vec<u8>>>) -> String {
        String::from_utf8(buffer.borrow().clone()).unwrap()
    }

    #[test]
    fn print_separates_args_with_spaces() {
        let (mut host, buffer) = capture_host();
        let result = builtin_print(
            &mut host,
            &[Value::Number(14.0), Value::string("hi"), Value::Bool(true)],
        )
        .unwrap();
        assert_eq!(result, Value::Nothing);
        assert_eq!(captured(&buffer), "14 hi true\n");
    }

    #[test]
    fn print_renders_nothing_as_keyword() {
        let (mut host, buffer) = capture_host();
        builtin_print(&mut host, &[Value::Nothing]).unwrap();
        assert_eq!(captured(&buffer), "nothing\n");
    }

    #[test]
    fn print_with_no_args_emits_newline() {
        let (mut host, buffer) = capture_host();
        builtin_print(&mut host, &[]).unwrap();
        assert_eq!(captured(&buffer), "\n");
    }

    #[test]
    fn ask_writes_prompt_and_returns_line() {
        let (mut host, buffer) = capture_host();
        host.set_input_lines(vec!["blue".to_string()]);
        let result = builtin_ask(&mut host, &[Value::string("color? ")]).unwrap();
        assert_eq!(result, Value::string("blue"));
        assert_eq!(captured(&buffer), "color? ");
    }

    #[test]
    fn ask_returns_empty_string_on_eof() {
        let (mut host, _) = capture_host();
        host.set_input_lines(vec![]);
        let result = builtin_ask(&mut host, &[Value::string("? ")]).unwrap();
        assert_eq!(result, Value::string(""));
    }

    #[test]
    fn ask_rejects_wrong_arity() {
        let (mut host, _) = capture_host();
        assert!(builtin_ask(&mut host, &[]).is_err());
    }

    #[test]
    fn registry_contains_required_builtins() {
        assert!(is_builtin_fn("print"));
        assert!(is_builtin_fn("ask"));
        assert!(!is_builtin_fn("len"));
        assert!(is_builtin_constant("PI"));
        assert!(is_builtin_constant("E"));
    }
}
