//! Lexer and parser for batch source.
//!
//! ```text
//! stmt    := NAME '=' expr | expr | 'for' NAME 'in' expr ':' NEWLINE INDENT stmt+ DEDENT
//! expr    := '-' expr | primary ( '[' expr ']' | '(' args ')' )*
//! primary := literal | NAME | module '::' qualname '(' args ')'
//!          | '[' expr,* ']' | '{' string ':' expr,* '}' | '(' expr ')'
//! args    := (expr | NAME '=' expr),*
//! ```
//!
//! Newlines inside brackets do not end a statement. `#` starts a comment.

use serde_json::Value;

use super::BatchError;
use crate::codec::CallableRef;

#[derive(Debug, Clone, PartialEq)]
pub struct Program {
    pub body: Vec<Stmt>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Stmt {
    Assign {
        name: String,
        value: Expr,
    },
    Expr(Expr),
    For {
        var: String,
        iterable: Expr,
        body: Vec<Stmt>,
    },
}

#[derive(Debug, Clone, PartialEq)]
pub enum Expr {
    Literal(Value),
    Var(String),
    List(Vec<Expr>),
    Dict(Vec<(String, Expr)>),
    Index {
        target: Box<Expr>,
        index: Box<Expr>,
    },
    Neg(Box<Expr>),
    Call {
        target: Target,
        args: Vec<Expr>,
        kwargs: Vec<(String, Expr)>,
    },
}

/// What a call names: a builtin or native function, or a registered callable.
#[derive(Debug, Clone, PartialEq)]
pub enum Target {
    Name(String),
    Callable(CallableRef),
}

#[derive(Debug, Clone, PartialEq)]
enum Tok {
    Name(String),
    Int(i64),
    Float(f64),
    Str(String),
    LParen,
    RParen,
    LBracket,
    RBracket,
    LBrace,
    RBrace,
    Comma,
    Colon,
    PathSep,
    Assign,
    Minus,
    Newline,
    Indent,
    Dedent,
    Eof,
}

impl Tok {
    fn describe(&self) -> String {
        match self {
            Tok::Name(name) => format!("name '{name}'"),
            Tok::Int(n) => format!("number {n}"),
            Tok::Float(n) => format!("number {n}"),
            Tok::Str(_) => "string".to_string(),
            Tok::LParen => "'('".to_string(),
            Tok::RParen => "')'".to_string(),
            Tok::LBracket => "'['".to_string(),
            Tok::RBracket => "']'".to_string(),
            Tok::LBrace => "'{'".to_string(),
            Tok::RBrace => "'}'".to_string(),
            Tok::Comma => "','".to_string(),
            Tok::Colon => "':'".to_string(),
            Tok::PathSep => "'::'".to_string(),
            Tok::Assign => "'='".to_string(),
            Tok::Minus => "'-'".to_string(),
            Tok::Newline => "end of line".to_string(),
            Tok::Indent => "indent".to_string(),
            Tok::Dedent => "dedent".to_string(),
            Tok::Eof => "end of input".to_string(),
        }
    }
}

#[derive(Debug, Clone)]
struct Token {
    tok: Tok,
    line: usize,
}

pub fn parse(source: &str) -> Result<Program, BatchError> {
    let tokens = tokenize(source)?;
    Parser { tokens, pos: 0 }.program()
}

fn tokenize(source: &str) -> Result<Vec<Token>, BatchError> {
    let mut tokens = Vec::new();
    let mut indents = vec![0usize];
    let mut depth = 0usize;
    let mut last_line = 0;

    for (index, raw) in source.lines().enumerate() {
        let line = index + 1;
        last_line = line;
        let text = raw.trim_start();
        if depth == 0 {
            if text.is_empty() || text.starts_with('#') {
                continue;
            }
            let width = raw.len() - text.len();
            let current = indents.last().copied().unwrap_or(0);
            if width > current {
                indents.push(width);
                tokens.push(Token {
                    tok: Tok::Indent,
                    line,
                });
            } else {
                while width < indents.last().copied().unwrap_or(0) {
                    indents.pop();
                    tokens.push(Token {
                        tok: Tok::Dedent,
                        line,
                    });
                }
                if width != indents.last().copied().unwrap_or(0) {
                    return Err(BatchError::new(
                        line,
                        "unindent does not match any outer indentation level",
                    ));
                }
            }
        }
        scan_line(text, line, &mut depth, &mut tokens)?;
        if depth == 0 && tokens.last().is_some_and(|token| token.tok != Tok::Newline) {
            tokens.push(Token {
                tok: Tok::Newline,
                line,
            });
        }
    }

    if depth > 0 {
        return Err(BatchError::new(last_line, "unexpected end of input inside brackets"));
    }
    let end = last_line + 1;
    for _ in 1..indents.len() {
        tokens.push(Token {
            tok: Tok::Dedent,
            line: end,
        });
    }
    tokens.push(Token {
        tok: Tok::Eof,
        line: end,
    });
    Ok(tokens)
}

fn scan_line(
    text: &str,
    line: usize,
    depth: &mut usize,
    tokens: &mut Vec<Token>,
) -> Result<(), BatchError> {
    let chars: Vec<char> = text.chars().collect();
    let mut i = 0;
    while i < chars.len() {
        let c = chars[i];
        let tok = match c {
            ' ' | '\t' | '\r' => {
                i += 1;
                continue;
            }
            '#' => break,
            '(' | '[' | '{' => {
                *depth += 1;
                i += 1;
                match c {
                    '(' => Tok::LParen,
                    '[' => Tok::LBracket,
                    _ => Tok::LBrace,
                }
            }
            ')' | ']' | '}' => {
                *depth = depth
                    .checked_sub(1)
                    .ok_or_else(|| BatchError::new(line, format!("unmatched '{c}'")))?;
                i += 1;
                match c {
                    ')' => Tok::RParen,
                    ']' => Tok::RBracket,
                    _ => Tok::RBrace,
                }
            }
            ',' => {
                i += 1;
                Tok::Comma
            }
            '-' => {
                i += 1;
                Tok::Minus
            }
            ':' if chars.get(i + 1) == Some(&':') => {
                i += 2;
                Tok::PathSep
            }
            ':' => {
                i += 1;
                Tok::Colon
            }
            '=' if chars.get(i + 1) == Some(&'=') => {
                return Err(BatchError::new(line, "comparisons are not supported"));
            }
            '=' => {
                i += 1;
                Tok::Assign
            }
            '"' | '\'' => {
                let (value, next) = scan_string(&chars, i, line)?;
                i = next;
                Tok::Str(value)
            }
            c if c.is_ascii_digit() => {
                let (tok, next) = scan_number(&chars, i, line)?;
                i = next;
                tok
            }
            c if c.is_alphabetic() || c == '_' => {
                let start = i;
                while i < chars.len()
                    && (chars[i].is_alphanumeric() || chars[i] == '_' || chars[i] == '.')
                {
                    i += 1;
                }
                Tok::Name(chars[start..i].iter().collect())
            }
            other => {
                return Err(BatchError::new(
                    line,
                    format!("unexpected character {other:?}"),
                ))
            }
        };
        tokens.push(Token { tok, line });
    }
    Ok(())
}

fn scan_string(chars: &[char], start: usize, line: usize) -> Result<(String, usize), BatchError> {
    let quote = chars[start];
    let mut value = String::new();
    let mut i = start + 1;
    while i < chars.len() {
        match chars[i] {
            c if c == quote => return Ok((value, i + 1)),
            '\\' => {
                let escaped = chars
                    .get(i + 1)
                    .ok_or_else(|| BatchError::new(line, "unterminated string"))?;
                value.push(match escaped {
                    'n' => '\n',
                    't' => '\t',
                    'r' => '\r',
                    '0' => '\0',
                    other => *other,
                });
                i += 2;
            }
            c => {
                value.push(c);
                i += 1;
            }
        }
    }
    Err(BatchError::new(line, "unterminated string"))
}

fn scan_number(chars: &[char], start: usize, line: usize) -> Result<(Tok, usize), BatchError> {
    let mut i = start;
    let mut is_float = false;
    while i < chars.len() && chars[i].is_ascii_digit() {
        i += 1;
    }
    if chars.get(i) == Some(&'.') && chars.get(i + 1).is_some_and(char::is_ascii_digit) {
        is_float = true;
        i += 1;
        while i < chars.len() && chars[i].is_ascii_digit() {
            i += 1;
        }
    }
    if matches!(chars.get(i), Some('e' | 'E')) {
        let mut j = i + 1;
        if matches!(chars.get(j), Some('+' | '-')) {
            j += 1;
        }
        if chars.get(j).is_some_and(char::is_ascii_digit) {
            is_float = true;
            i = j;
            while i < chars.len() && chars[i].is_ascii_digit() {
                i += 1;
            }
        }
    }
    let text: String = chars[start..i].iter().collect();
    let invalid = || BatchError::new(line, format!("invalid number {text}"));
    let tok = if is_float {
        Tok::Float(text.parse().map_err(|_| invalid())?)
    } else {
        Tok::Int(text.parse().map_err(|_| invalid())?)
    };
    Ok((tok, i))
}

static END: Tok = Tok::Eof;

struct Parser {
    tokens: Vec<Token>,
    pos: usize,
}

impl Parser {
    fn program(mut self) -> Result<Program, BatchError> {
        let body = self.block(false)?;
        self.expect(&Tok::Eof)?;
        Ok(Program { body })
    }

    fn peek(&self) -> &Tok {
        self.peek_at(0)
    }

    fn peek_at(&self, offset: usize) -> &Tok {
        self.tokens
            .get(self.pos + offset)
            .map_or(&END, |token| &token.tok)
    }

    fn line(&self) -> usize {
        self.tokens
            .get(self.pos)
            .or_else(|| self.tokens.last())
            .map_or(1, |token| token.line)
    }

    fn advance(&mut self) -> Tok {
        let tok = self.peek().clone();
        if self.pos < self.tokens.len() {
            self.pos += 1;
        }
        tok
    }

    fn unexpected(&self) -> BatchError {
        BatchError::new(self.line(), format!("unexpected {}", self.peek().describe()))
    }

    fn expect(&mut self, tok: &Tok) -> Result<(), BatchError> {
        if self.peek() == tok {
            self.advance();
            Ok(())
        } else {
            Err(BatchError::new(
                self.line(),
                format!("expected {}, found {}", tok.describe(), self.peek().describe()),
            ))
        }
    }

    fn expect_name(&mut self) -> Result<String, BatchError> {
        let Tok::Name(name) = self.peek() else {
            return Err(BatchError::new(
                self.line(),
                format!("expected a name, found {}", self.peek().describe()),
            ));
        };
        let name = name.clone();
        self.advance();
        Ok(name)
    }

    fn at_keyword(&self, keyword: &str) -> bool {
        matches!(self.peek(), Tok::Name(name) if name == keyword)
    }

    fn at_binding(&self) -> bool {
        matches!((self.peek(), self.peek_at(1)), (Tok::Name(_), Tok::Assign))
    }

    fn expect_keyword(&mut self, keyword: &str) -> Result<(), BatchError> {
        self.expect(&Tok::Name(keyword.to_string()))
    }

    fn block(&mut self, nested: bool) -> Result<Vec<Stmt>, BatchError> {
        let mut body = Vec::new();
        loop {
            match self.peek() {
                Tok::Eof => break,
                Tok::Dedent if nested => break,
                Tok::Newline => {
                    self.advance();
                }
                Tok::Indent | Tok::Dedent => return Err(self.unexpected()),
                _ => body.push(self.statement()?),
            }
        }
        Ok(body)
    }

    fn statement(&mut self) -> Result<Stmt, BatchError> {
        if self.at_keyword("for") {
            return self.for_loop();
        }
        let stmt = if self.at_binding() {
            let name = self.expect_name()?;
            self.advance();
            Stmt::Assign {
                name,
                value: self.expr()?,
            }
        } else {
            Stmt::Expr(self.expr()?)
        };
        self.end_of_statement()?;
        Ok(stmt)
    }

    fn for_loop(&mut self) -> Result<Stmt, BatchError> {
        self.expect_keyword("for")?;
        let var = self.expect_name()?;
        self.expect_keyword("in")?;
        let iterable = self.expr()?;
        self.expect(&Tok::Colon)?;
        self.expect(&Tok::Newline)?;
        self.expect(&Tok::Indent)?;
        let body = self.block(true)?;
        self.expect(&Tok::Dedent)?;
        Ok(Stmt::For {
            var,
            iterable,
            body,
        })
    }

    fn end_of_statement(&mut self) -> Result<(), BatchError> {
        match self.peek() {
            Tok::Newline => {
                self.advance();
                Ok(())
            }
            Tok::Eof | Tok::Dedent => Ok(()),
            _ => Err(self.unexpected()),
        }
    }

    fn expr(&mut self) -> Result<Expr, BatchError> {
        if self.peek() == &Tok::Minus {
            self.advance();
            return Ok(Expr::Neg(Box::new(self.expr()?)));
        }
        let mut expr = self.primary()?;
        loop {
            match self.peek() {
                Tok::LBracket => {
                    self.advance();
                    let index = self.expr()?;
                    self.expect(&Tok::RBracket)?;
                    expr = Expr::Index {
                        target: Box::new(expr),
                        index: Box::new(index),
                    };
                }
                Tok::LParen => {
                    let Expr::Var(name) = expr else {
                        return Err(BatchError::new(self.line(), "only names can be called"));
                    };
                    self.advance();
                    let (args, kwargs) = self.call_args()?;
                    expr = Expr::Call {
                        target: Target::Name(name),
                        args,
                        kwargs,
                    };
                }
                _ => return Ok(expr),
            }
        }
    }

    fn primary(&mut self) -> Result<Expr, BatchError> {
        let line = self.line();
        match self.advance() {
            Tok::Int(n) => Ok(Expr::Literal(Value::from(n))),
            Tok::Float(n) => Ok(Expr::Literal(Value::from(n))),
            Tok::Str(s) => Ok(Expr::Literal(Value::String(s))),
            Tok::Name(name) => {
                if let Some(literal) = keyword_literal(&name) {
                    return Ok(Expr::Literal(literal));
                }
                if name == "for" || name == "in" {
                    return Err(BatchError::new(line, format!("unexpected keyword '{name}'")));
                }
                if self.peek() != &Tok::PathSep {
                    return Ok(Expr::Var(name));
                }
                self.advance();
                let qualname = self.expect_name()?;
                self.expect(&Tok::LParen)?;
                let (args, kwargs) = self.call_args()?;
                Ok(Expr::Call {
                    target: Target::Callable(CallableRef::new(name, qualname)),
                    args,
                    kwargs,
                })
            }
            Tok::LBracket => {
                let mut items = Vec::new();
                while self.peek() != &Tok::RBracket {
                    items.push(self.expr()?);
                    if !self.comma_or(&Tok::RBracket)? {
                        break;
                    }
                }
                self.expect(&Tok::RBracket)?;
                Ok(Expr::List(items))
            }
            Tok::LBrace => {
                let mut entries = Vec::new();
                while self.peek() != &Tok::RBrace {
                    let key = match self.advance() {
                        Tok::Str(key) => key,
                        other => {
                            let message =
                                format!("dictionary keys must be strings, found {}", other.describe());
                            return Err(BatchError::new(self.line(), message));
                        }
                    };
                    self.expect(&Tok::Colon)?;
                    entries.push((key, self.expr()?));
                    if !self.comma_or(&Tok::RBrace)? {
                        break;
                    }
                }
                self.expect(&Tok::RBrace)?;
                Ok(Expr::Dict(entries))
            }
            Tok::LParen => {
                let inner = self.expr()?;
                self.expect(&Tok::RParen)?;
                Ok(inner)
            }
            other => Err(BatchError::new(line, format!("unexpected {}", other.describe()))),
        }
    }

    /// Consumes a separating comma. Returns `false` when `close` follows instead.
    fn comma_or(&mut self, close: &Tok) -> Result<bool, BatchError> {
        match self.peek() {
            Tok::Comma => {
                self.advance();
                Ok(true)
            }
            tok if tok == close => Ok(false),
            _ => Err(self.unexpected()),
        }
    }

    /// Parses call arguments after the opening parenthesis.
    #[allow(clippy::type_complexity)]
    fn call_args(&mut self) -> Result<(Vec<Expr>, Vec<(String, Expr)>), BatchError> {
        let mut args = Vec::new();
        let mut kwargs: Vec<(String, Expr)> = Vec::new();
        while self.peek() != &Tok::RParen {
            if self.at_binding() {
                let name = self.expect_name()?;
                self.advance();
                if kwargs.iter().any(|(existing, _)| *existing == name) {
                    return Err(BatchError::new(
                        self.line(),
                        format!("keyword argument repeated: {name}"),
                    ));
                }
                kwargs.push((name, self.expr()?));
            } else if !kwargs.is_empty() {
                return Err(BatchError::new(
                    self.line(),
                    "positional argument follows keyword argument",
                ));
            } else {
                args.push(self.expr()?);
            }
            if !self.comma_or(&Tok::RParen)? {
                break;
            }
        }
        self.expect(&Tok::RParen)?;
        Ok((args, kwargs))
    }
}

fn keyword_literal(name: &str) -> Option<Value> {
    match name {
        "true" | "True" => Some(Value::Bool(true)),
        "false" | "False" => Some(Value::Bool(false)),
        "null" | "None" => Some(Value::Null),
        _ => None,
    }
}
