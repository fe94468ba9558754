//! Lexer module
//!
//! Turns a UTF-8 source into a token stream with positions. Identifiers
//! are ASCII (`[A-Za-z_][A-Za-z0-9_]*`); numeric literals may carry a
//! fractional part which is truncated to an integer at token time; string
//! literals support the `\n \t \r \\ \"` escapes. `#`-to-EOL, `// …` and
//! `/* … */` comments are skipped. The stream ends with an `End` sentinel.

pub mod tokens;

use once_cell::sync::Lazy;
use std::collections::HashMap;

use tokens::{Pos, Token, TokenKind};

/// Lexer error
#[derive(Debug, Clone, thiserror::Error)]
pub enum LexError {
    #[error("{pos}: error: Unexpected character in script source: '{ch}' [function: <module>]")]
    UnexpectedChar { pos: Pos, ch: char },
    #[error("{pos}: error: Unterminated string literal [function: <module>]")]
    UnterminatedString { pos: Pos },
    #[error("{pos}: error: Unterminated escape sequence in string literal [function: <module>]")]
    UnterminatedEscape { pos: Pos },
    #[error("{pos}: error: Unterminated block comment [function: <module>]")]
    UnterminatedBlockComment { pos: Pos },
    #[error("{pos}: error: Invalid numeric literal: {text} [function: <module>]")]
    InvalidNumber { pos: Pos, text: String },
}

static KEYWORDS: Lazy<HashMap<&'static str, TokenKind>> = Lazy::new(|| {
    HashMap::from([
        ("fn", TokenKind::KwFn),
        ("class", TokenKind::KwClass),
        ("extends", TokenKind::KwExtends),
        ("let", TokenKind::KwLet),
        ("for", TokenKind::KwFor),
        ("in", TokenKind::KwIn),
        ("if", TokenKind::KwIf),
        ("elif", TokenKind::KwElif),
        ("else", TokenKind::KwElse),
        ("while", TokenKind::KwWhile),
        ("break", TokenKind::KwBreak),
        ("continue", TokenKind::KwContinue),
        ("str", TokenKind::KwStr),
        ("return", TokenKind::KwReturn),
        ("spawn", TokenKind::KwSpawn),
        ("await", TokenKind::KwAwait),
        ("sleep", TokenKind::KwSleep),
        ("yield", TokenKind::KwYield),
    ])
});

/// Tokenize source code.
pub fn tokenize(source: &str) -> Result<Vec<Token>, LexError> {
    Lexer::new(source).run()
}

struct Lexer<'a> {
    bytes: &'a [u8],
    index: usize,
    line: usize,
    column: usize,
}

impl<'a> Lexer<'a> {
    fn new(source: &'a str) -> Self {
        Self {
            bytes: source.as_bytes(),
            index: 0,
            line: 1,
            column: 1,
        }
    }

    fn run(mut self) -> Result<Vec<Token>, LexError> {
        let mut tokens = Vec::new();

        loop {
            self.skip_whitespace_and_comments()?;
            if self.is_at_end() {
                break;
            }

            let line = self.line;
            let column = self.column;
            let c = self.peek();

            if c.is_ascii_alphabetic() || c == b'_' {
                tokens.push(self.identifier_or_keyword());
                continue;
            }
            if c.is_ascii_digit() {
                tokens.push(self.number()?);
                continue;
            }
            if c == b'"' {
                tokens.push(self.string_literal()?);
                continue;
            }

            let kind = match self.advance() {
                b'(' => TokenKind::LParen,
                b')' => TokenKind::RParen,
                b'{' => TokenKind::LBrace,
                b'}' => TokenKind::RBrace,
                b'[' => TokenKind::LBracket,
                b']' => TokenKind::RBracket,
                b'.' => TokenKind::Dot,
                b',' => TokenKind::Comma,
                b':' => TokenKind::Colon,
                b';' => TokenKind::Semicolon,
                b'+' => TokenKind::Plus,
                b'-' => TokenKind::Minus,
                b'*' => TokenKind::Star,
                b'/' => TokenKind::Slash,
                b'!' => self.with_equal(TokenKind::BangEqual, TokenKind::Bang),
                b'=' => self.with_equal(TokenKind::EqualEqual, TokenKind::Equal),
                b'<' => self.with_equal(TokenKind::LessEqual, TokenKind::Less),
                b'>' => self.with_equal(TokenKind::GreaterEqual, TokenKind::Greater),
                other => {
                    return Err(LexError::UnexpectedChar {
                        pos: Pos::new(line, column),
                        ch: other as char,
                    });
                }
            };
            tokens.push(Token::new(kind, line, column));
        }

        tokens.push(Token::new(TokenKind::End, self.line, self.column));
        Ok(tokens)
    }

    fn is_at_end(&self) -> bool {
        self.index >= self.bytes.len()
    }

    fn peek(&self) -> u8 {
        self.bytes[self.index]
    }

    fn peek_next(&self) -> u8 {
        if self.index + 1 >= self.bytes.len() {
            0
        } else {
            self.bytes[self.index + 1]
        }
    }

    fn advance(&mut self) -> u8 {
        let c = self.bytes[self.index];
        self.index += 1;
        if c == b'\n' {
            self.line += 1;
            self.column = 1;
        } else {
            self.column += 1;
        }
        c
    }

    fn with_equal(&mut self, matched: TokenKind, single: TokenKind) -> TokenKind {
        if !self.is_at_end() && self.peek() == b'=' {
            self.advance();
            matched
        } else {
            single
        }
    }

    fn skip_whitespace_and_comments(&mut self) -> Result<(), LexError> {
        while !self.is_at_end() {
            match self.peek() {
                b' ' | b'\r' | b'\t' | b'\n' => {
                    self.advance();
                }
                b'#' => {
                    while !self.is_at_end() && self.peek() != b'\n' {
                        self.advance();
                    }
                }
                b'/' if self.peek_next() == b'/' => {
                    while !self.is_at_end() && self.peek() != b'\n' {
                        self.advance();
                    }
                }
                b'/' if self.peek_next() == b'*' => {
                    let start = Pos::new(self.line, self.column);
                    self.advance();
                    self.advance();
                    let mut closed = false;
                    while !self.is_at_end() {
                        if self.peek() == b'*' && self.peek_next() == b'/' {
                            self.advance();
                            self.advance();
                            closed = true;
                            break;
                        }
                        self.advance();
                    }
                    if !closed {
                        return Err(LexError::UnterminatedBlockComment { pos: start });
                    }
                }
                _ => break,
            }
        }
        Ok(())
    }

    fn identifier_or_keyword(&mut self) -> Token {
        let start = self.index;
        let line = self.line;
        let column = self.column;
        while !self.is_at_end() {
            let c = self.peek();
            if c.is_ascii_alphanumeric() || c == b'_' {
                self.advance();
            } else {
                break;
            }
        }

        let text = std::str::from_utf8(&self.bytes[start..self.index]).expect("ASCII identifier");
        match KEYWORDS.get(text) {
            Some(kind) => Token::new(kind.clone(), line, column),
            None => Token::new(TokenKind::Identifier(text.to_string()), line, column),
        }
    }

    fn number(&mut self) -> Result<Token, LexError> {
        let start = self.index;
        let line = self.line;
        let column = self.column;
        while !self.is_at_end() && self.peek().is_ascii_digit() {
            self.advance();
        }

        // A dot only belongs to the number when digits follow; `1.foo()`
        // keeps the dot for the postfix chain.
        if !self.is_at_end() && self.peek() == b'.' && self.peek_next().is_ascii_digit() {
            self.advance();
            while !self.is_at_end() && self.peek().is_ascii_digit() {
                self.advance();
            }
        }

        let text = std::str::from_utf8(&self.bytes[start..self.index]).expect("ASCII number");
        let value = text
            .parse::<f64>()
            .map_err(|_| LexError::InvalidNumber {
                pos: Pos::new(line, column),
                text: text.to_string(),
            })? as i64;
        Ok(Token::new(TokenKind::Number(value), line, column))
    }

    fn string_literal(&mut self) -> Result<Token, LexError> {
        let line = self.line;
        let column = self.column;
        self.advance();

        let mut value = String::new();
        while !self.is_at_end() {
            let c = self.advance();
            match c {
                b'"' => {
                    return Ok(Token::new(TokenKind::StringLiteral(value), line, column));
                }
                b'\\' => {
                    if self.is_at_end() {
                        return Err(LexError::UnterminatedEscape {
                            pos: Pos::new(self.line, self.column),
                        });
                    }
                    match self.advance() {
                        b'n' => value.push('\n'),
                        b't' => value.push('\t'),
                        b'r' => value.push('\r'),
                        b'\\' => value.push('\\'),
                        b'"' => value.push('"'),
                        other => value.push(other as char),
                    }
                }
                _ => {
                    // Collect the full UTF-8 sequence for non-ASCII bytes.
                    let start = self.index - 1;
                    while !self.is_at_end() && self.bytes[self.index] & 0xC0 == 0x80 {
                        self.index += 1;
                        self.column += 1;
                    }
                    value.push_str(
                        std::str::from_utf8(&self.bytes[start..self.index])
                            .expect("input is valid UTF-8"),
                    );
                }
            }
        }

        Err(LexError::UnterminatedString {
            pos: Pos::new(line, column),
        })
    }
}

#[cfg(test)]
mod tests;
