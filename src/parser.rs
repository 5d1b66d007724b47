use crate::ast::{DeclScope, LiteralValue, Node, Position};
use crate::lexer::{Token, TokenType};
use std::error::Error;
use std::fmt::{Display, Formatter};

#[derive(Debug, Clone)]
pub struct ParseError {
    pub message: String,
    pub pos: Position,
}

impl Display for ParseError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{} (line {}, column {})",
            self.message, self.pos.line, self.pos.column
        )
    }
}

impl Error for ParseError {}

pub struct Parser {
    tokens: Vec<Token>,
    index: usize,
}

impl Parser {
    pub fn new(tokens: Vec<Token>) -> Self {
        Self { tokens, index: 0 }
    }

    pub fn parse_program(&mut self) -> Result<Vec<Node>, ParseError> {
        let mut nodes = Vec::new();
        while self.current().typ != TokenType::Eof {
            nodes.push(self.parse_statement()?);
        }
        Ok(nodes)
    }

    fn parse_statement(&mut self) -> Result<Node, ParseError> {
        let token = self.current().clone();
        match token.typ {
            TokenType::Var => {
                self.advance();
                let scope = decl_scope(&token.value);
                let name = self.expect_ident("Expected variable name")?;
                self.expect(TokenType::Assign, "Expected '=' after variable name")?;
                let value = self.parse_assignment()?;
                Ok(Node::VariableDeclaration {
                    pos: token.pos,
                    name,
                    value: Box::new(value),
                    scope,
                })
            }
            TokenType::List => {
                self.advance();
                let scope = decl_scope(&token.value);
                let name = self.expect_ident("Expected list name")?;
                self.expect(TokenType::Assign, "Expected '=' after list name")?;
                self.expect(TokenType::LBrace, "Expected '{' to open list value")?;
                let mut items = Vec::new();
                loop {
                    if self.matches(TokenType::RBrace) {
                        break;
                    }
                    if self.current().typ == TokenType::Eof {
                        return self.error_here("Unterminated list value");
                    }
                    items.push(self.parse_primary()?);
                    self.matches(TokenType::Comma);
                }
                Ok(Node::ListDeclaration {
                    pos: token.pos,
                    name,
                    items,
                    scope,
                })
            }
            TokenType::Include => {
                self.advance();
                self.expect_binop("<", "Expected '<' after #include")?;
                let kind = self.expect_str("Expected include type string")?;
                let path = self.expect_str("Expected include path string")?;
                self.expect_binop(">", "Expected '>' to close #include")?;
                Ok(Node::Include {
                    pos: token.pos,
                    kind,
                    path,
                })
            }
            TokenType::Warp | TokenType::Fn => {
                let warp = token.typ == TokenType::Warp;
                self.advance();
                if warp {
                    self.expect(TokenType::Fn, "Expected 'fn' after 'warp'")?;
                }
                let name = self.expect_ident("Expected function name")?;
                self.expect(TokenType::LParen, "Expected '(' after function name")?;
                let mut params = Vec::new();
                if !self.matches(TokenType::RParen) {
                    loop {
                        params.push(self.expect_ident("Expected parameter name")?);
                        if !self.matches(TokenType::Comma) {
                            break;
                        }
                    }
                    self.expect(TokenType::RParen, "Expected ')' after parameters")?;
                }
                self.expect(TokenType::LBrace, "Expected '{' before function body")?;
                let body = self.parse_block()?;
                Ok(Node::FunctionDeclaration {
                    pos: token.pos,
                    name,
                    params,
                    warp,
                    body,
                })
            }
            TokenType::If => {
                self.advance();
                self.expect(TokenType::LParen, "Expected '(' after 'if'")?;
                let condition = self.parse_assignment()?;
                self.expect(TokenType::RParen, "Expected ')' after if condition")?;
                self.expect(TokenType::LBrace, "Expected '{' after if condition")?;
                let then_branch = self.parse_block()?;
                let else_branch = if self.matches(TokenType::Else) {
                    self.expect(TokenType::LBrace, "Expected '{' after 'else'")?;
                    Some(self.parse_block()?)
                } else {
                    None
                };
                Ok(Node::If {
                    pos: token.pos,
                    condition: Box::new(condition),
                    then_branch,
                    else_branch,
                })
            }
            TokenType::For => {
                self.advance();
                self.expect(TokenType::LParen, "Expected '(' after 'for'")?;
                let binder = self.parse_assignment()?;
                let of = self.expect_ident("Expected 'of' in for header")?;
                if of != "of" {
                    return self.error_here("Expected 'of' in for header");
                }
                let times = self.parse_assignment()?;
                self.expect(TokenType::RParen, "Expected ')' after for header")?;
                self.expect(TokenType::LBrace, "Expected '{' after for header")?;
                let body = self.parse_block()?;
                Ok(Node::For {
                    pos: token.pos,
                    binder: Box::new(binder),
                    times: Box::new(times),
                    body,
                })
            }
            TokenType::GreenFlag => {
                self.advance();
                self.expect(TokenType::LBrace, "Expected '{' after entry keyword")?;
                let body = self.parse_block()?;
                Ok(Node::GreenFlag {
                    pos: token.pos,
                    body,
                })
            }
            TokenType::Return => {
                self.advance();
                let value = self.parse_call()?;
                Ok(Node::Return {
                    pos: token.pos,
                    value: Box::new(value),
                })
            }
            _ => self.parse_assignment(),
        }
    }

    fn parse_block(&mut self) -> Result<Vec<Node>, ParseError> {
        let mut nodes = Vec::new();
        while !self.matches(TokenType::RBrace) {
            if self.current().typ == TokenType::Eof {
                return self.error_here("Unterminated block, expected '}'");
            }
            nodes.push(self.parse_statement()?);
        }
        Ok(nodes)
    }

    fn parse_assignment(&mut self) -> Result<Node, ParseError> {
        let not_pos = if self.current().typ == TokenType::Not {
            let pos = self.current().pos;
            self.advance();
            Some(pos)
        } else {
            None
        };
        let mut expr = self.parse_binary_expression()?;
        if let Some(pos) = not_pos {
            expr = Node::Not {
                pos,
                body: Box::new(expr),
            };
        }
        if self.matches(TokenType::Assign) {
            let Node::Identifier { pos, name } = expr else {
                return self.error_here("Invalid assignment target; expected an identifier");
            };
            let value = self.parse_assignment()?;
            return Ok(Node::Assignment {
                pos,
                name,
                value: Box::new(value),
            });
        }
        if self.current().typ == TokenType::AssignOp {
            let op = self.current().value.clone();
            let op_pos = self.current().pos;
            self.advance();
            let Node::Identifier { pos, name } = expr else {
                return self.error_here("Invalid assignment target; expected an identifier");
            };
            let rhs = self.parse_assignment()?;
            // `x += e` desugars right here into `x = x + e`
            let value = Node::BinaryExpression {
                pos: op_pos,
                op,
                left: Box::new(Node::Identifier {
                    pos,
                    name: name.clone(),
                }),
                right: Box::new(rhs),
            };
            return Ok(Node::Assignment {
                pos,
                name,
                value: Box::new(value),
            });
        }
        Ok(expr)
    }

    // One precedence tier, strictly left-associative.
    fn parse_binary_expression(&mut self) -> Result<Node, ParseError> {
        let mut left = self.parse_call()?;
        while self.current().typ == TokenType::Binop {
            let op = self.current().value.clone();
            let pos = self.current().pos;
            self.advance();
            let right = self.parse_call()?;
            left = Node::BinaryExpression {
                pos,
                op,
                left: Box::new(left),
                right: Box::new(right),
            };
        }
        Ok(left)
    }

    fn parse_call(&mut self) -> Result<Node, ParseError> {
        let mut expr = self.parse_primary()?;
        while self.current().typ == TokenType::LParen {
            expr = self.finish_call(expr)?;
        }
        Ok(expr)
    }

    fn finish_call(&mut self, callee: Node) -> Result<Node, ParseError> {
        self.expect(TokenType::LParen, "Expected '(' to open arguments")?;
        let mut args = Vec::new();
        if self.current().typ != TokenType::RParen {
            loop {
                args.push(self.parse_assignment()?);
                if !self.matches(TokenType::Comma) {
                    break;
                }
            }
        }
        self.expect(TokenType::RParen, "Expected ')' after arguments")?;

        // one or more trailing brace groups turn the call into a branch call
        if self.current().typ == TokenType::LBrace {
            let mut branches = Vec::new();
            while self.matches(TokenType::LBrace) {
                branches.push(self.parse_block()?);
            }
            let Node::Identifier { pos, name } = callee else {
                return self.error_here("Branch call expects an identifier callee");
            };
            return Ok(Node::BranchFunctionCall {
                pos,
                name,
                args,
                branches,
            });
        }

        let Node::Identifier { pos, name } = callee else {
            return self.error_here("Call expects an identifier callee");
        };
        Ok(Node::FunctionCall { pos, name, args })
    }

    fn parse_primary(&mut self) -> Result<Node, ParseError> {
        let token = self.current().clone();
        match token.typ {
            TokenType::Number => {
                self.advance();
                let value = token.value.parse::<f64>().unwrap_or(f64::NAN);
                Ok(Node::Literal {
                    pos: token.pos,
                    value: LiteralValue::Number(value),
                })
            }
            TokenType::Str => {
                self.advance();
                Ok(Node::Literal {
                    pos: token.pos,
                    value: LiteralValue::Text(token.value),
                })
            }
            TokenType::Ident => {
                self.advance();
                if matches!(token.value.as_str(), "true" | "True" | "false" | "False") {
                    return Ok(Node::Boolean {
                        pos: token.pos,
                        value: token.value == "true" || token.value == "True",
                    });
                }
                let mut expr = Node::Identifier {
                    pos: token.pos,
                    name: token.value,
                };
                while self.matches(TokenType::DoubleColon) {
                    let member_pos = self.current().pos;
                    let member = self.expect_ident("Expected member name after '::'")?;
                    if self.matches(TokenType::LParen) {
                        let mut args = Vec::new();
                        if self.current().typ != TokenType::RParen {
                            loop {
                                args.push(self.parse_assignment()?);
                                if !self.matches(TokenType::Comma) {
                                    break;
                                }
                            }
                        }
                        self.expect(TokenType::RParen, "Expected ')' after member arguments")?;
                        expr = Node::ObjectMethodCall {
                            pos: member_pos,
                            object: Box::new(expr),
                            method: member,
                            args,
                        };
                    } else {
                        expr = Node::ObjectAccess {
                            pos: member_pos,
                            object: Box::new(expr),
                            property: member,
                        };
                    }
                }
                Ok(expr)
            }
            TokenType::LParen => {
                self.advance();
                let expr = self.parse_assignment()?;
                self.expect(TokenType::RParen, "Expected ')' after expression")?;
                Ok(expr)
            }
            // a bare binary operator before a number reads as `0 <op> n`
            TokenType::Binop if self.peek_next_is_number() => {
                self.advance();
                let number = self.current().clone();
                self.advance();
                Ok(Node::BinaryExpression {
                    pos: token.pos,
                    op: token.value,
                    left: Box::new(Node::Literal {
                        pos: token.pos,
                        value: LiteralValue::Number(0.0),
                    }),
                    right: Box::new(Node::Literal {
                        pos: number.pos,
                        value: LiteralValue::Number(number.value.parse().unwrap_or(f64::NAN)),
                    }),
                })
            }
            _ => self.error_here(format!("Unexpected token {:?}", token.typ)),
        }
    }

    fn peek_next_is_number(&self) -> bool {
        self.tokens
            .get(self.index + 1)
            .map(|t| t.typ == TokenType::Number)
            .unwrap_or(false)
    }

    fn current(&self) -> &Token {
        &self.tokens[self.index.min(self.tokens.len() - 1)]
    }

    fn advance(&mut self) -> &Token {
        let at = self.index.min(self.tokens.len() - 1);
        if self.index < self.tokens.len() {
            self.index += 1;
        }
        &self.tokens[at]
    }

    fn matches(&mut self, typ: TokenType) -> bool {
        if self.current().typ == typ {
            self.advance();
            return true;
        }
        false
    }

    fn expect(&mut self, typ: TokenType, message: &str) -> Result<Token, ParseError> {
        if self.current().typ == typ {
            let token = self.current().clone();
            self.advance();
            return Ok(token);
        }
        Err(ParseError {
            message: message.to_string(),
            pos: self.current().pos,
        })
    }

    fn expect_ident(&mut self, message: &str) -> Result<String, ParseError> {
        Ok(self.expect(TokenType::Ident, message)?.value)
    }

    fn expect_str(&mut self, message: &str) -> Result<String, ParseError> {
        Ok(self.expect(TokenType::Str, message)?.value)
    }

    fn expect_binop(&mut self, spelling: &str, message: &str) -> Result<(), ParseError> {
        let token = self.expect(TokenType::Binop, message)?;
        if token.value != spelling {
            return Err(ParseError {
                message: message.to_string(),
                pos: token.pos,
            });
        }
        Ok(())
    }

    fn error_here<T>(&self, message: impl Into<String>) -> Result<T, ParseError> {
        Err(ParseError {
            message: message.into(),
            pos: self.current().pos,
        })
    }
}

fn decl_scope(token_value: &str) -> DeclScope {
    if token_value == "global" {
        DeclScope::Global
    } else {
        DeclScope::Local
    }
}
