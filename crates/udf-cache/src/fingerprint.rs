//! Code identity for cached callables.
//!
//! A [`Fingerprint`] is the instruction stream, constant pool, referenced names and stringified
//! defaults of a callable. Local bindings are numbered by slot, so renaming a local leaves the
//! fingerprint unchanged while changing a literal or a referenced name does not.

use serde::{Deserialize, Serialize};
use udf_core::sha256_hex;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Constant {
    Literal(String),
    /// A nested closure, hashed recursively.
    Code(Box<Fingerprint>),
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Fingerprint {
    pub instructions: Vec<String>,
    pub constants: Vec<Constant>,
    pub names: Vec<String>,
    pub defaults: Vec<String>,
}

const KEYWORDS: &[&str] = &[
    "as", "async", "await", "break", "const", "continue", "crate", "dyn", "else", "enum", "false",
    "fn", "for", "if", "impl", "in", "let", "loop", "match", "mod", "move", "mut", "pub", "ref",
    "return", "self", "Self", "static", "struct", "super", "trait", "true", "type", "unsafe",
    "use", "where", "while",
];

impl Fingerprint {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn instruction(mut self, op: impl Into<String>) -> Self {
        self.instructions.push(op.into());
        self
    }

    pub fn constant(mut self, literal: impl ToString) -> Self {
        self.constants.push(Constant::Literal(literal.to_string()));
        self
    }

    pub fn nested(mut self, code: Fingerprint) -> Self {
        self.constants.push(Constant::Code(Box::new(code)));
        self
    }

    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.names.push(name.into());
        self
    }

    /// A default parameter value, identified by its string form.
    pub fn default_value(mut self, value: impl ToString) -> Self {
        self.defaults.push(value.to_string());
        self
    }

    /// Derive a fingerprint from source text.
    ///
    /// Literals go to the constant pool, identifiers introduced with `let` become numbered slots,
    /// every other identifier is a referenced name and everything else is an instruction.
    pub fn from_source(source: &str) -> Self {
        let mut fp = Fingerprint::new();
        let mut locals: Vec<String> = Vec::new();
        let mut binding = false;

        for token in tokenize(source) {
            match token {
                Token::Literal(lit) => {
                    let idx = fp.constants.len();
                    fp.constants.push(Constant::Literal(lit));
                    fp.instructions.push(format!("CONST {idx}"));
                }
                Token::Ident(ident) if KEYWORDS.contains(&ident.as_str()) => {
                    binding = ident == "let" || (binding && ident == "mut");
                    fp.instructions.push(ident);
                }
                Token::Ident(ident) => {
                    if binding {
                        locals.push(ident);
                        fp.instructions.push(format!("STORE {}", locals.len() - 1));
                        binding = false;
                        continue;
                    }
                    if let Some(slot) = locals.iter().rposition(|l| *l == ident) {
                        fp.instructions.push(format!("LOAD {slot}"));
                        continue;
                    }
                    let idx = match fp.names.iter().position(|n| *n == ident) {
                        Some(idx) => idx,
                        None => {
                            fp.names.push(ident);
                            fp.names.len() - 1
                        }
                    };
                    fp.instructions.push(format!("NAME {idx}"));
                }
                Token::Punct(p) => {
                    binding = false;
                    fp.instructions.push(p.to_string());
                }
            }
        }
        fp
    }

    fn serialize_code(&self, out: &mut Vec<u8>) {
        out.extend_from_slice(self.instructions.join("\n").as_bytes());
        for constant in &self.constants {
            match constant {
                Constant::Literal(lit) => out.extend_from_slice(lit.as_bytes()),
                Constant::Code(code) => code.serialize_code(out),
            }
        }
        for name in &self.names {
            out.extend_from_slice(name.as_bytes());
        }
    }

    /// Stable hex digest of this fingerprint.
    pub fn digest(&self) -> String {
        let mut bytes = Vec::new();
        self.serialize_code(&mut bytes);
        for default in &self.defaults {
            bytes.extend_from_slice(sha256_hex(default.as_bytes()).as_bytes());
        }
        sha256_hex(&bytes)
    }
}

#[derive(Debug, PartialEq)]
enum Token {
    Ident(String),
    Literal(String),
    Punct(char),
}

fn tokenize(source: &str) -> Vec<Token> {
    let chars: Vec<char> = source.chars().collect();
    let mut tokens = Vec::new();
    let mut i = 0;

    while i < chars.len() {
        let c = chars[i];
        if c.is_whitespace() {
            i += 1;
        } else if c == '/' && chars.get(i + 1) == Some(&'/') {
            while i < chars.len() && chars[i] != '\n' {
                i += 1;
            }
        } else if c == '/' && chars.get(i + 1) == Some(&'*') {
            i += 2;
            while i < chars.len() && !(chars[i] == '*' && chars.get(i + 1) == Some(&'/')) {
                i += 1;
            }
            i += 2;
        } else if c == '"' {
            let start = i;
            i += 1;
            while i < chars.len() && chars[i] != '"' {
                if chars[i] == '\\' {
                    i += 1;
                }
                i += 1;
            }
            i = (i + 1).min(chars.len());
            tokens.push(Token::Literal(chars[start..i].iter().collect()));
        } else if c == '\'' && chars.get(i + 2) == Some(&'\'') {
            tokens.push(Token::Literal(chars[i..i + 3].iter().collect()));
            i += 3;
        } else if c.is_ascii_digit() {
            let start = i;
            while i < chars.len()
                && (chars[i].is_ascii_alphanumeric()
                    || chars[i] == '_'
                    || (chars[i] == '.' && chars.get(i + 1).is_some_and(|n| n.is_ascii_digit())))
            {
                i += 1;
            }
            tokens.push(Token::Literal(chars[start..i].iter().collect()));
        } else if c.is_alphabetic() || c == '_' {
            let start = i;
            while i < chars.len() && (chars[i].is_alphanumeric() || chars[i] == '_') {
                i += 1;
            }
            tokens.push(Token::Ident(chars[start..i].iter().collect()));
        } else {
            tokens.push(Token::Punct(c));
            i += 1;
        }
    }
    tokens
}
