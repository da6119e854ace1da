// File: src/lexer.rs
//
// Tokenizer for Dunlin source text.
// Produces a flat token stream with line/column positions; `#` starts a
// comment that runs to the end of the line.

#[derive(Debug, Clone, PartialEq)]
pub enum TokenKind {
    Identifier(String),
    Number(f64),
    Str(String),
    Operator(String),
    Punctuation(char),
    Keyword(String),
    Eof,
}

#[derive(Debug, Clone)]
pub struct Token {
    pub kind: TokenKind,
    pub line: usize,
    pub column: usize,
}

const KEYWORDS: &[&str] = &[
    "if", "elif", "else", "while", "for", "func", "return", "break", "continue", "true", "false",
    "nothing",
];

pub fn tokenize(source: &str) -> Vec<Token> {
    let mut tokens = Vec::new();
    let mut chars = source.chars().peekable();
    let mut line = 1;
    let mut col = 1;

    while let Some(&c) = chars.peek() {
        match c {
            ' ' | '\t' | '\r' => {
                chars.next();
                col += 1;
            }
            '\n' => {
                chars.next();
                line += 1;
                col = 1;
            }
            '#' => {
                while let Some(&ch) = chars.peek() {
                    chars.next();
                    if ch == '\n' {
                        line += 1;
                        col = 1;
                        break;
                    }
                }
            }
            '"' => {
                let start_col = col;
                chars.next(); // opening quote
                col += 1;
                let mut s = String::new();
                while let Some(&ch) = chars.peek() {
                    chars.next();
                    col += 1;
                    if ch == '"' {
                        break;
                    }
                    if ch == '\n' {
                        line += 1;
                        col = 1;
                        s.push(ch);
                        continue;
                    }
                    if ch == '\\' {
                        if let Some(&esc) = chars.peek() {
                            chars.next();
                            col += 1;
                            match esc {
                                'n' => s.push('\n'),
                                't' => s.push('\t'),
                                '\\' => s.push('\\'),
                                '"' => s.push('"'),
                                _ => s.push(esc),
                            }
                        }
                    } else {
                        s.push(ch);
                    }
                }
                tokens.push(Token { kind: TokenKind::Str(s), line, column: start_col });
            }
            '0'..='9' => {
                let start_col = col;
                let mut num = String::new();
                while let Some(&ch) = chars.peek() {
                    if ch.is_ascii_digit() || ch == '.' {
                        num.push(ch);
                        chars.next();
                        col += 1;
                    } else {
                        break;
                    }
                }
                let parsed = num.parse().unwrap_or(0.0);
                tokens.push(Token { kind: TokenKind::Number(parsed), line, column: start_col });
            }
            'a'..='z' | 'A'..='Z' | '_' => {
                let start_col = col;
                let mut ident = String::new();
                while let Some(&ch) = chars.peek() {
                    if ch.is_alphanumeric() || ch == '_' {
                        ident.push(ch);
                        chars.next();
                        col += 1;
                    } else {
                        break;
                    }
                }
                let kind = if KEYWORDS.contains(&ident.as_str()) {
                    TokenKind::Keyword(ident)
                } else {
                    TokenKind::Identifier(ident)
                };
                tokens.push(Token { kind, line, column: start_col });
            }
            '=' | '!' | '<' | '>' => {
                // =, ==, !, !=, <, <=, >, >=
                let start_col = col;
                let first = chars.next().unwrap();
                col += 1;
                let mut op = first.to_string();
                if chars.peek() == Some(&'=') {
                    chars.next();
                    col += 1;
                    op.push('=');
                }
                tokens.push(Token { kind: TokenKind::Operator(op), line, column: start_col });
            }
            '&' | '|' => {
                // && and || only; a lone & or | falls through to the parser
                // as an unknown operator.
                let start_col = col;
                let first = chars.next().unwrap();
                col += 1;
                let mut op = first.to_string();
                if chars.peek() == Some(&first) {
                    chars.next();
                    col += 1;
                    op.push(first);
                }
                tokens.push(Token { kind: TokenKind::Operator(op), line, column: start_col });
            }
            '*' => {
                // * and **
                let start_col = col;
                chars.next();
                col += 1;
                let mut op = String::from("*");
                if chars.peek() == Some(&'*') {
                    chars.next();
                    col += 1;
                    op.push('*');
                }
                tokens.push(Token { kind: TokenKind::Operator(op), line, column: start_col });
            }
            '+' | '-' | '/' | '%' => {
                let op = chars.next().unwrap();
                tokens.push(Token {
                    kind: TokenKind::Operator(op.to_string()),
                    line,
                    column: col,
                });
                col += 1;
            }
            '(' | ')' | '{' | '}' | '[' | ']' | ',' | ';' => {
                tokens.push(Token { kind: TokenKind::Punctuation(c), line, column: col });
                chars.next();
                col += 1;
            }
            _ => {
                // Unknown character: surface it as an operator token so the
                // parser reports it with a position instead of silently
                // dropping it.
                let ch = chars.next().unwrap();
                tokens.push(Token {
                    kind: TokenKind::Operator(ch.to_string()),
                    line,
                    column: col,
                });
                col += 1;
            }
        }
    }

    tokens.push(Token { kind: TokenKind::Eof, line, column: col });
    tokens
}
