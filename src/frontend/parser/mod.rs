//! Parser module
//!
//! Single-pass recursive descent over the token stream. Structural rules:
//! top level admits only `class`, `fn` and `let` (the latter with a direct
//! expression initializer); class bodies alternate `fn` methods and
//! `name = expr;` attributes; assignment targets are bare identifiers,
//! properties and index expressions.
//!
//! Expression precedence, lowest to highest: assignment, equality,
//! comparison, additive, multiplicative, unary minus, primary with a
//! postfix chain of calls, member access and indexing.

pub mod ast;

use crate::frontend::lexer::tokens::{Pos, Token, TokenKind};
use ast::{
    BinaryOp, ClassAttrDecl, ClassDecl, Expr, FunctionDecl, LetInit, Program, Stmt,
};

/// Parser error
#[derive(Debug, Clone, thiserror::Error)]
#[error("{pos}: error: {message} [function: {scope}]")]
pub struct ParseError {
    pub message: String,
    pub pos: Pos,
    pub scope: String,
}

type ParseResult<T> = Result<T, ParseError>;

/// Parse a token stream into a [`Program`].
pub fn parse_program(tokens: Vec<Token>) -> ParseResult<Program> {
    Parser::new(tokens).parse_program()
}

struct Parser {
    tokens: Vec<Token>,
    current: usize,
    current_class: Option<String>,
    current_function: Option<String>,
}

impl Parser {
    fn new(tokens: Vec<Token>) -> Self {
        Self {
            tokens,
            current: 0,
            current_class: None,
            current_function: None,
        }
    }

    fn parse_program(mut self) -> ParseResult<Program> {
        let mut program = Program::default();
        while !self.is_at_end() {
            if self.check(&TokenKind::KwClass) {
                program.classes.push(self.parse_class()?);
            } else if self.check(&TokenKind::KwFn) {
                program.functions.push(self.parse_function()?);
            } else if self.check(&TokenKind::KwLet) {
                let stmt = self.parse_statement()?;
                if !matches!(
                    stmt,
                    Stmt::Let {
                        init: LetInit::Expr(_),
                        ..
                    }
                ) {
                    return Err(self.error_at(
                        stmt.pos(),
                        "Top-level let only supports direct expression assignment",
                    ));
                }
                program.top_level.push(stmt);
            } else {
                return Err(self.error_here("Top-level statement must be class, fn, or let"));
            }
        }
        Ok(program)
    }

    // ---- token plumbing -------------------------------------------------

    fn peek(&self) -> &Token {
        &self.tokens[self.current]
    }

    fn previous(&self) -> &Token {
        &self.tokens[self.current - 1]
    }

    fn is_at_end(&self) -> bool {
        matches!(self.peek().kind, TokenKind::End)
    }

    fn check(&self, kind: &TokenKind) -> bool {
        !self.is_at_end() && std::mem::discriminant(&self.peek().kind) == std::mem::discriminant(kind)
    }

    fn matches(&mut self, kind: &TokenKind) -> bool {
        if self.check(kind) {
            self.current += 1;
            true
        } else {
            false
        }
    }

    fn consume(&mut self, kind: &TokenKind, message: &str) -> ParseResult<&Token> {
        if self.check(kind) {
            self.current += 1;
            Ok(self.previous())
        } else {
            Err(self.error_here(message))
        }
    }

    fn consume_identifier(&mut self, message: &str) -> ParseResult<(String, Pos)> {
        if let TokenKind::Identifier(name) = &self.peek().kind {
            let name = name.clone();
            let pos = self.peek().pos;
            self.current += 1;
            Ok((name, pos))
        } else {
            Err(self.error_here(message))
        }
    }

    fn scope_name(&self) -> String {
        match (&self.current_class, &self.current_function) {
            (Some(class), Some(function)) => format!("{}::{}", class, function),
            (None, Some(function)) => function.clone(),
            _ => "<module>".to_string(),
        }
    }

    fn error_here(&self, message: &str) -> ParseError {
        self.error_at(self.peek().pos, message)
    }

    fn error_at(&self, pos: Pos, message: &str) -> ParseError {
        ParseError {
            message: format!("{} (found {})", message, self.peek().kind.describe()),
            pos,
            scope: self.scope_name(),
        }
    }

    // ---- declarations ---------------------------------------------------

    fn parse_class(&mut self) -> ParseResult<ClassDecl> {
        let pos = self.peek().pos;
        self.consume(&TokenKind::KwClass, "Expected 'class'")?;
        let (name, _) = self.consume_identifier("Expected class name")?;
        self.current_class = Some(name.clone());

        let base_name = if self.matches(&TokenKind::KwExtends) {
            Some(self.consume_identifier("Expected base class name")?.0)
        } else {
            None
        };

        self.consume(&TokenKind::LBrace, "Expected '{' after class name")?;
        let mut attributes = Vec::new();
        let mut methods = Vec::new();
        while !self.check(&TokenKind::RBrace) && !self.is_at_end() {
            if self.check(&TokenKind::KwFn) {
                methods.push(self.parse_function()?);
            } else {
                let (attr_name, attr_pos) = self.consume_identifier("Expected attribute name")?;
                self.consume(&TokenKind::Equal, "Expected '=' after attribute name")?;
                let initializer = self.parse_expression()?;
                self.consume(&TokenKind::Semicolon, "Expected ';' after attribute declaration")?;
                attributes.push(ClassAttrDecl {
                    name: attr_name,
                    initializer,
                    pos: attr_pos,
                });
            }
        }
        self.consume(&TokenKind::RBrace, "Expected '}' after class body")?;
        self.current_class = None;

        Ok(ClassDecl {
            name,
            base_name,
            attributes,
            methods,
            pos,
        })
    }

    fn parse_function(&mut self) -> ParseResult<FunctionDecl> {
        let pos = self.peek().pos;
        self.consume(&TokenKind::KwFn, "Expected 'fn'")?;
        let (name, _) = self.consume_identifier("Expected function name")?;
        self.current_function = Some(name.clone());
        self.consume(&TokenKind::LParen, "Expected '(' after function name")?;

        let mut params = Vec::new();
        if !self.check(&TokenKind::RParen) {
            loop {
                params.push(self.consume_identifier("Expected parameter name")?.0);
                if !self.matches(&TokenKind::Comma) {
                    break;
                }
            }
        }

        self.consume(&TokenKind::RParen, "Expected ')' after parameters")?;
        self.consume(&TokenKind::LBrace, "Expected '{' before function body")?;
        let body = self.parse_block()?;
        self.current_function = None;

        Ok(FunctionDecl {
            name,
            params,
            body,
            pos,
        })
    }

    fn parse_block(&mut self) -> ParseResult<Vec<Stmt>> {
        let mut body = Vec::new();
        while !self.check(&TokenKind::RBrace) && !self.is_at_end() {
            body.push(self.parse_statement()?);
        }
        self.consume(&TokenKind::RBrace, "Expected '}' after block")?;
        Ok(body)
    }

    // ---- statements -----------------------------------------------------

    fn parse_statement(&mut self) -> ParseResult<Stmt> {
        let pos = self.peek().pos;

        if self.matches(&TokenKind::KwLet) {
            let (name, _) = self.consume_identifier("Expected variable name")?;
            self.consume(&TokenKind::Equal, "Expected '=' after variable name")?;
            let init = if self.matches(&TokenKind::KwSpawn) {
                let (callee, args) = self.parse_call_data()?;
                LetInit::Spawn { callee, args }
            } else if self.matches(&TokenKind::KwAwait) {
                let (handle, _) = self.consume_identifier("Expected task handle variable")?;
                LetInit::Await { handle }
            } else {
                LetInit::Expr(self.parse_expression()?)
            };
            self.consume(&TokenKind::Semicolon, "Expected ';' after let statement")?;
            return Ok(Stmt::Let { name, init, pos });
        }

        if self.matches(&TokenKind::KwFor) {
            return self.parse_for_statement(pos);
        }
        if self.matches(&TokenKind::KwIf) {
            return self.parse_if_statement(pos);
        }
        if self.matches(&TokenKind::KwWhile) {
            return self.parse_while_statement(pos);
        }
        if self.matches(&TokenKind::KwBreak) {
            self.consume(&TokenKind::Semicolon, "Expected ';' after break")?;
            return Ok(Stmt::Break { pos });
        }
        if self.matches(&TokenKind::KwContinue) {
            self.consume(&TokenKind::Semicolon, "Expected ';' after continue")?;
            return Ok(Stmt::Continue { pos });
        }
        if self.matches(&TokenKind::KwReturn) {
            let expr = self.parse_expression()?;
            self.consume(&TokenKind::Semicolon, "Expected ';' after return")?;
            return Ok(Stmt::Return { expr, pos });
        }
        if self.matches(&TokenKind::KwSleep) {
            let millis = match &self.peek().kind {
                TokenKind::Number(value) => *value,
                _ => return Err(self.error_here("Expected millisecond number after sleep")),
            };
            self.current += 1;
            self.consume(&TokenKind::Semicolon, "Expected ';' after sleep")?;
            return Ok(Stmt::Sleep { millis, pos });
        }
        if self.matches(&TokenKind::KwYield) {
            self.consume(&TokenKind::Semicolon, "Expected ';' after yield")?;
            return Ok(Stmt::Yield { pos });
        }

        let expr = self.parse_expression()?;
        self.consume(&TokenKind::Semicolon, "Expected ';' after expression")?;
        Ok(Stmt::Expr { expr, pos })
    }

    fn parse_call_data(&mut self) -> ParseResult<(String, Vec<Expr>)> {
        let (callee, _) = self.consume_identifier("Expected callee name")?;
        self.consume(&TokenKind::LParen, "Expected '(' after callee name")?;
        let mut args = Vec::new();
        if !self.check(&TokenKind::RParen) {
            loop {
                args.push(self.parse_expression()?);
                if !self.matches(&TokenKind::Comma) {
                    break;
                }
            }
        }
        self.consume(&TokenKind::RParen, "Expected ')' after call arguments")?;
        Ok((callee, args))
    }

    fn parse_for_statement(&mut self, pos: Pos) -> ParseResult<Stmt> {
        self.consume(&TokenKind::LParen, "Expected '(' after for")?;
        let (first_name, _) = self.consume_identifier("Expected loop variable")?;

        if self.matches(&TokenKind::Comma) {
            let (value_name, _) = self.consume_identifier("Expected value variable after ','")?;
            self.consume(&TokenKind::KwIn, "Expected 'in' in for-dict")?;
            let iterable = self.parse_expression()?;
            self.consume(&TokenKind::RParen, "Expected ')' after for header")?;
            self.consume(&TokenKind::LBrace, "Expected '{' before for body")?;
            let body = self.parse_block()?;
            return Ok(Stmt::ForDict {
                key: first_name,
                value: value_name,
                iterable,
                body,
                pos,
            });
        }

        self.consume(&TokenKind::KwIn, "Expected 'in' in for")?;

        // `for (k in range(a, b))` and `for (k in range(n))` — the single
        // argument form desugars to `range(0, n)`.
        let is_range = matches!(&self.peek().kind, TokenKind::Identifier(name) if name == "range");
        if is_range {
            self.current += 1;
            self.consume(&TokenKind::LParen, "Expected '(' after range")?;
            let first = self.parse_expression()?;
            let (start, end) = if self.matches(&TokenKind::Comma) {
                let end = self.parse_expression()?;
                (first, end)
            } else {
                (Expr::Number { value: 0, pos }, first)
            };
            self.consume(&TokenKind::RParen, "Expected ')' after range arguments")?;
            self.consume(&TokenKind::RParen, "Expected ')' after for header")?;
            self.consume(&TokenKind::LBrace, "Expected '{' before for body")?;
            let body = self.parse_block()?;
            return Ok(Stmt::ForRange {
                var: first_name,
                start,
                end,
                body,
                pos,
            });
        }

        let iterable = self.parse_expression()?;
        self.consume(&TokenKind::RParen, "Expected ')' after for header")?;
        self.consume(&TokenKind::LBrace, "Expected '{' before for body")?;
        let body = self.parse_block()?;
        Ok(Stmt::ForList {
            var: first_name,
            iterable,
            body,
            pos,
        })
    }

    fn parse_if_statement(&mut self, pos: Pos) -> ParseResult<Stmt> {
        let mut branches = Vec::new();

        self.consume(&TokenKind::LParen, "Expected '(' after if")?;
        let condition = self.parse_expression()?;
        self.consume(&TokenKind::RParen, "Expected ')' after if condition")?;
        self.consume(&TokenKind::LBrace, "Expected '{' after if condition")?;
        branches.push((condition, self.parse_block()?));

        while self.matches(&TokenKind::KwElif) {
            self.consume(&TokenKind::LParen, "Expected '(' after elif")?;
            let condition = self.parse_expression()?;
            self.consume(&TokenKind::RParen, "Expected ')' after elif condition")?;
            self.consume(&TokenKind::LBrace, "Expected '{' after elif condition")?;
            branches.push((condition, self.parse_block()?));
        }

        let else_body = if self.matches(&TokenKind::KwElse) {
            self.consume(&TokenKind::LBrace, "Expected '{' after else")?;
            self.parse_block()?
        } else {
            Vec::new()
        };

        Ok(Stmt::If {
            branches,
            else_body,
            pos,
        })
    }

    fn parse_while_statement(&mut self, pos: Pos) -> ParseResult<Stmt> {
        self.consume(&TokenKind::LParen, "Expected '(' after while")?;
        let condition = self.parse_expression()?;
        self.consume(&TokenKind::RParen, "Expected ')' after while condition")?;
        self.consume(&TokenKind::LBrace, "Expected '{' after while condition")?;
        let body = self.parse_block()?;
        Ok(Stmt::While {
            condition,
            body,
            pos,
        })
    }

    // ---- expressions ----------------------------------------------------

    fn parse_expression(&mut self) -> ParseResult<Expr> {
        self.parse_assignment()
    }

    fn parse_assignment(&mut self) -> ParseResult<Expr> {
        let lhs = self.parse_equality()?;
        if !self.matches(&TokenKind::Equal) {
            return Ok(lhs);
        }

        let pos = self.previous().pos;
        let rhs = self.parse_assignment()?;
        match lhs {
            Expr::Variable { name, pos: var_pos } => Ok(Expr::AssignVariable {
                name,
                value: Box::new(rhs),
                pos: var_pos,
            }),
            Expr::Property { object, name, .. } => Ok(Expr::AssignProperty {
                object,
                name,
                value: Box::new(rhs),
                pos,
            }),
            Expr::Index { object, index, .. } => Ok(Expr::AssignIndex {
                object,
                index,
                value: Box::new(rhs),
                pos,
            }),
            _ => Err(self.error_at(
                pos,
                "Only variable, object property or index assignment is supported",
            )),
        }
    }

    fn parse_equality(&mut self) -> ParseResult<Expr> {
        let mut expr = self.parse_comparison()?;
        loop {
            let op = if self.matches(&TokenKind::EqualEqual) {
                BinaryOp::Equal
            } else if self.matches(&TokenKind::BangEqual) {
                BinaryOp::NotEqual
            } else {
                break;
            };
            let pos = self.previous().pos;
            let rhs = self.parse_comparison()?;
            expr = Expr::Binary {
                op,
                left: Box::new(expr),
                right: Box::new(rhs),
                pos,
            };
        }
        Ok(expr)
    }

    fn parse_comparison(&mut self) -> ParseResult<Expr> {
        let mut expr = self.parse_term()?;
        loop {
            let op = if self.matches(&TokenKind::Less) {
                BinaryOp::Less
            } else if self.matches(&TokenKind::LessEqual) {
                BinaryOp::LessEqual
            } else if self.matches(&TokenKind::Greater) {
                BinaryOp::Greater
            } else if self.matches(&TokenKind::GreaterEqual) {
                BinaryOp::GreaterEqual
            } else {
                break;
            };
            let pos = self.previous().pos;
            let rhs = self.parse_term()?;
            expr = Expr::Binary {
                op,
                left: Box::new(expr),
                right: Box::new(rhs),
                pos,
            };
        }
        Ok(expr)
    }

    fn parse_term(&mut self) -> ParseResult<Expr> {
        let mut expr = self.parse_factor()?;
        loop {
            let op = if self.matches(&TokenKind::Plus) {
                BinaryOp::Add
            } else if self.matches(&TokenKind::Minus) {
                BinaryOp::Sub
            } else {
                break;
            };
            let pos = self.previous().pos;
            let rhs = self.parse_factor()?;
            expr = Expr::Binary {
                op,
                left: Box::new(expr),
                right: Box::new(rhs),
                pos,
            };
        }
        Ok(expr)
    }

    fn parse_factor(&mut self) -> ParseResult<Expr> {
        let mut expr = self.parse_unary()?;
        loop {
            let op = if self.matches(&TokenKind::Star) {
                BinaryOp::Mul
            } else if self.matches(&TokenKind::Slash) {
                BinaryOp::Div
            } else {
                break;
            };
            let pos = self.previous().pos;
            let rhs = self.parse_unary()?;
            expr = Expr::Binary {
                op,
                left: Box::new(expr),
                right: Box::new(rhs),
                pos,
            };
        }
        Ok(expr)
    }

    fn parse_unary(&mut self) -> ParseResult<Expr> {
        // Unary minus lowers to `0 - operand`.
        if self.matches(&TokenKind::Minus) {
            let pos = self.previous().pos;
            let rhs = self.parse_unary()?;
            return Ok(Expr::Binary {
                op: BinaryOp::Sub,
                left: Box::new(Expr::Number { value: 0, pos }),
                right: Box::new(rhs),
                pos,
            });
        }
        self.parse_primary()
    }

    fn parse_primary(&mut self) -> ParseResult<Expr> {
        let pos = self.peek().pos;

        if let TokenKind::Number(value) = &self.peek().kind {
            let value = *value;
            self.current += 1;
            return self.parse_postfix(Expr::Number { value, pos });
        }

        if let TokenKind::StringLiteral(value) = &self.peek().kind {
            let value = value.clone();
            self.current += 1;
            return self.parse_postfix(Expr::StringLit { value, pos });
        }

        if self.matches(&TokenKind::LBracket) {
            let mut elements = Vec::new();
            if !self.check(&TokenKind::RBracket) {
                loop {
                    elements.push(self.parse_expression()?);
                    if !self.matches(&TokenKind::Comma) {
                        break;
                    }
                }
            }
            self.consume(&TokenKind::RBracket, "Expected ']' in list literal")?;
            return self.parse_postfix(Expr::ListLit { elements, pos });
        }

        if self.matches(&TokenKind::LBrace) {
            let mut entries = Vec::new();
            if !self.check(&TokenKind::RBrace) {
                loop {
                    let key = self.parse_expression()?;
                    self.consume(&TokenKind::Colon, "Expected ':' in dict literal")?;
                    let value = self.parse_expression()?;
                    entries.push((key, value));
                    if !self.matches(&TokenKind::Comma) {
                        break;
                    }
                }
            }
            self.consume(&TokenKind::RBrace, "Expected '}' in dict literal")?;
            return self.parse_postfix(Expr::DictLit { entries, pos });
        }

        if let TokenKind::Identifier(name) = &self.peek().kind {
            let name = name.clone();
            self.current += 1;
            return self.parse_postfix(Expr::Variable { name, pos });
        }

        // `str` is a keyword but names the host stringifier in
        // expression position.
        if self.matches(&TokenKind::KwStr) {
            return self.parse_postfix(Expr::Variable {
                name: "str".to_string(),
                pos,
            });
        }

        if self.matches(&TokenKind::LParen) {
            let expr = self.parse_expression()?;
            self.consume(&TokenKind::RParen, "Expected ')' in expression")?;
            return self.parse_postfix(expr);
        }

        Err(self.error_here("Expected expression"))
    }

    fn parse_postfix(&mut self, mut expr: Expr) -> ParseResult<Expr> {
        loop {
            if self.matches(&TokenKind::LParen) {
                let pos = self.previous().pos;
                let mut args = Vec::new();
                if !self.check(&TokenKind::RParen) {
                    loop {
                        args.push(self.parse_expression()?);
                        if !self.matches(&TokenKind::Comma) {
                            break;
                        }
                    }
                }
                self.consume(&TokenKind::RParen, "Expected ')' after call arguments")?;
                expr = Expr::Call {
                    callee: Box::new(expr),
                    args,
                    pos,
                };
                continue;
            }

            if self.matches(&TokenKind::Dot) {
                let (member, pos) = self.consume_identifier("Expected member name after '.'")?;
                if self.matches(&TokenKind::LParen) {
                    let mut args = Vec::new();
                    if !self.check(&TokenKind::RParen) {
                        loop {
                            args.push(self.parse_expression()?);
                            if !self.matches(&TokenKind::Comma) {
                                break;
                            }
                        }
                    }
                    self.consume(&TokenKind::RParen, "Expected ')' after method arguments")?;
                    expr = Expr::MethodCall {
                        object: Box::new(expr),
                        method: member,
                        args,
                        pos,
                    };
                } else {
                    expr = Expr::Property {
                        object: Box::new(expr),
                        name: member,
                        pos,
                    };
                }
                continue;
            }

            if self.matches(&TokenKind::LBracket) {
                let pos = self.previous().pos;
                let index = self.parse_expression()?;
                self.consume(&TokenKind::RBracket, "Expected ']' after index expression")?;
                expr = Expr::Index {
                    object: Box::new(expr),
                    index: Box::new(index),
                    pos,
                };
                continue;
            }

            break;
        }
        Ok(expr)
    }
}

#[cfg(test)]
mod tests;
