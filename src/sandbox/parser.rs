//! Recursive-descent parser producing a [`Program`].

use std::collections::HashSet;
use std::rc::Rc;

use super::ast::{
    AssignOp, BinaryOp, DeclKind, Expr, FunctionDecl, Literal, LogicalOp, Program, Stmt, UnaryOp,
};
use super::lexer::{tokenize, Spanned, Token};

/// Deepest statement/expression nesting accepted in source
pub const MAX_NESTING: usize = 128;

const RESERVED: &[&str] = &[
    "function", "let", "const", "var", "if", "else", "while", "for", "return", "break",
    "continue", "throw", "true", "false", "null", "undefined", "typeof", "new",
];

/// Syntax error in contract source
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("syntax error on line {line}: {message}")]
pub struct ParseError {
    /// 1-based source line
    pub line: usize,
    /// What went wrong
    pub message: String,
}

impl ParseError {
    pub(crate) fn new(line: usize, message: impl Into<String>) -> Self {
        Self {
            line,
            message: message.into(),
        }
    }
}

/// Parse ClawScript source into a program.
///
/// # Errors
/// Returns the first syntax error encountered.
pub fn parse(src: &str) -> Result<Program, ParseError> {
    let mut parser = Parser {
        tokens: tokenize(src)?,
        pos: 0,
        depth: 0,
        function_depth: 0,
        loop_depth: 0,
    };

    let mut body = Vec::new();
    let mut seen = HashSet::new();
    while !parser.at_eof() {
        let line = parser.line();
        let stmt = parser.statement(true)?;
        if let Stmt::Function(decl) = &stmt {
            if !seen.insert(decl.name.clone()) {
                return Err(ParseError::new(
                    line,
                    format!("duplicate function '{}'", decl.name),
                ));
            }
        }
        body.push(stmt);
    }
    Ok(Program { body })
}

fn describe(token: &Token) -> String {
    match token {
        Token::Number(n) => format!("number {n}"),
        Token::Str(s) => format!("string \"{s}\""),
        Token::Ident(s) => format!("'{s}'"),
        Token::Punct(p) => format!("'{p}'"),
        Token::Eof => "end of input".to_string(),
    }
}

struct Parser {
    tokens: Vec<Spanned>,
    pos: usize,
    depth: usize,
    function_depth: usize,
    loop_depth: usize,
}

impl Parser {
    fn peek(&self) -> &Token {
        &self.tokens[self.pos].token
    }

    fn line(&self) -> usize {
        self.tokens[self.pos].line
    }

    fn at_eof(&self) -> bool {
        matches!(self.peek(), Token::Eof)
    }

    fn advance(&mut self) -> Token {
        let token = self.tokens[self.pos].token.clone();
        if self.pos < self.tokens.len() - 1 {
            self.pos += 1;
        }
        token
    }

    fn error(&self, message: impl Into<String>) -> ParseError {
        ParseError::new(self.line(), message)
    }

    fn check_punct(&self, p: &str) -> bool {
        matches!(self.peek(), Token::Punct(q) if *q == p)
    }

    fn eat_punct(&mut self, p: &str) -> bool {
        if self.check_punct(p) {
            self.advance();
            true
        } else {
            false
        }
    }

    fn expect_punct(&mut self, p: &str) -> Result<(), ParseError> {
        if self.eat_punct(p) {
            Ok(())
        } else {
            Err(self.error(format!("expected '{p}' but found {}", describe(self.peek()))))
        }
    }

    fn check_keyword(&self, k: &str) -> bool {
        matches!(self.peek(), Token::Ident(s) if s == k)
    }

    fn eat_keyword(&mut self, k: &str) -> bool {
        if self.check_keyword(k) {
            self.advance();
            true
        } else {
            false
        }
    }

    fn expect_ident(&mut self) -> Result<String, ParseError> {
        match self.peek().clone() {
            Token::Ident(name) if !RESERVED.contains(&name.as_str()) => {
                self.advance();
                Ok(name)
            }
            other => Err(self.error(format!("expected identifier but found {}", describe(&other)))),
        }
    }

    /// Optional statement terminator
    fn semicolon(&mut self) {
        self.eat_punct(";");
    }

    fn nested<T>(
        &mut self,
        f: impl FnOnce(&mut Self) -> Result<T, ParseError>,
    ) -> Result<T, ParseError> {
        if self.depth >= MAX_NESTING {
            return Err(self.error("nesting too deep"));
        }
        self.depth += 1;
        let result = f(self);
        self.depth -= 1;
        result
    }

    /// Run a left-associative chain; every [`Self::link`] inside it nests
    /// the tree one level deeper until the chain ends
    fn left_chain(
        &mut self,
        f: impl FnOnce(&mut Self) -> Result<Expr, ParseError>,
    ) -> Result<Expr, ParseError> {
        let base = self.depth;
        let result = f(self);
        self.depth = base;
        result
    }

    fn link(&mut self) -> Result<(), ParseError> {
        if self.depth >= MAX_NESTING {
            return Err(self.error("nesting too deep"));
        }
        self.depth += 1;
        Ok(())
    }

    // ----- statements -----

    fn statement(&mut self, top_level: bool) -> Result<Stmt, ParseError> {
        self.nested(|p| p.statement_inner(top_level))
    }

    fn statement_inner(&mut self, top_level: bool) -> Result<Stmt, ParseError> {
        let keyword = match self.peek() {
            Token::Ident(s) => Some(s.clone()),
            _ => None,
        };

        match keyword.as_deref() {
            Some("function") => {
                if !top_level {
                    return Err(self.error("functions may only be declared at the top level"));
                }
                self.function_decl()
            }
            Some("let" | "const" | "var") => {
                let stmt = self.declaration()?;
                self.semicolon();
                Ok(stmt)
            }
            Some("if") => {
                self.advance();
                self.expect_punct("(")?;
                let cond = self.expression()?;
                self.expect_punct(")")?;
                let then = Box::new(self.statement(false)?);
                let otherwise = if self.eat_keyword("else") {
                    Some(Box::new(self.statement(false)?))
                } else {
                    None
                };
                Ok(Stmt::If {
                    cond,
                    then,
                    otherwise,
                })
            }
            Some("while") => {
                self.advance();
                self.expect_punct("(")?;
                let cond = self.expression()?;
                self.expect_punct(")")?;
                let body = Box::new(self.loop_body()?);
                Ok(Stmt::While { cond, body })
            }
            Some("for") => self.for_statement(),
            Some("return") => {
                if self.function_depth == 0 {
                    return Err(self.error("'return' outside of a function"));
                }
                self.advance();
                let value = if self.check_punct(";") || self.check_punct("}") || self.at_eof() {
                    None
                } else {
                    Some(self.expression()?)
                };
                self.semicolon();
                Ok(Stmt::Return(value))
            }
            Some(word @ ("break" | "continue")) => {
                if self.loop_depth == 0 {
                    return Err(self.error(format!("'{word}' outside of a loop")));
                }
                let stmt = if word == "break" {
                    Stmt::Break
                } else {
                    Stmt::Continue
                };
                self.advance();
                self.semicolon();
                Ok(stmt)
            }
            Some("throw") => {
                self.advance();
                let value = self.expression()?;
                self.semicolon();
                Ok(Stmt::Throw(value))
            }
            _ => {
                if self.check_punct("{") {
                    return Ok(Stmt::Block(self.block()?));
                }
                if self.eat_punct(";") {
                    return Ok(Stmt::Empty);
                }
                let expr = self.expression()?;
                self.semicolon();
                Ok(Stmt::Expr(expr))
            }
        }
    }

    fn block(&mut self) -> Result<Vec<Stmt>, ParseError> {
        self.expect_punct("{")?;
        let mut body = Vec::new();
        while !self.check_punct("}") {
            if self.at_eof() {
                return Err(self.error("expected '}' but found end of input"));
            }
            body.push(self.statement(false)?);
        }
        self.advance();
        Ok(body)
    }

    fn loop_body(&mut self) -> Result<Stmt, ParseError> {
        self.loop_depth += 1;
        let body = self.statement(false);
        self.loop_depth -= 1;
        body
    }

    fn function_decl(&mut self) -> Result<Stmt, ParseError> {
        self.advance();
        let name = self.expect_ident()?;
        self.expect_punct("(")?;
        let mut params = Vec::new();
        if !self.check_punct(")") {
            loop {
                params.push(self.expect_ident()?);
                if !self.eat_punct(",") {
                    break;
                }
            }
        }
        self.expect_punct(")")?;

        self.function_depth += 1;
        let body = self.block();
        self.function_depth -= 1;

        Ok(Stmt::Function(Rc::new(FunctionDecl {
            name,
            params,
            body: body?,
        })))
    }

    fn decl_kind(&mut self) -> Result<DeclKind, ParseError> {
        let kind = match self.peek() {
            Token::Ident(s) if s == "let" => DeclKind::Let,
            Token::Ident(s) if s == "const" => DeclKind::Const,
            Token::Ident(s) if s == "var" => DeclKind::Var,
            other => {
                return Err(self.error(format!(
                    "expected declaration but found {}",
                    describe(other)
                )))
            }
        };
        self.advance();
        Ok(kind)
    }

    fn declaration(&mut self) -> Result<Stmt, ParseError> {
        let kind = self.decl_kind()?;
        let first = self.expect_ident()?;
        self.declaration_rest(kind, first)
    }

    fn declaration_rest(&mut self, kind: DeclKind, first: String) -> Result<Stmt, ParseError> {
        let mut decls = Vec::new();
        let mut name = first;
        loop {
            let init = if self.eat_punct("=") {
                Some(self.expression()?)
            } else {
                if kind == DeclKind::Const {
                    return Err(self.error(format!("missing initializer for const '{name}'")));
                }
                None
            };
            decls.push((name, init));
            if !self.eat_punct(",") {
                break;
            }
            name = self.expect_ident()?;
        }
        Ok(Stmt::Decl { kind, decls })
    }

    fn for_statement(&mut self) -> Result<Stmt, ParseError> {
        self.advance();
        self.expect_punct("(")?;

        let declares = ["let", "const", "var"].iter().any(|k| self.check_keyword(k));
        let init = if declares {
            let kind = self.decl_kind()?;
            let name = self.expect_ident()?;
            if self.eat_keyword("of") {
                let iterable = self.expression()?;
                self.expect_punct(")")?;
                let body = Box::new(self.loop_body()?);
                return Ok(Stmt::ForOf {
                    kind,
                    name,
                    iterable,
                    body,
                });
            }
            let decl = self.declaration_rest(kind, name)?;
            self.expect_punct(";")?;
            Some(Box::new(decl))
        } else if self.eat_punct(";") {
            None
        } else {
            let expr = self.expression()?;
            self.expect_punct(";")?;
            Some(Box::new(Stmt::Expr(expr)))
        };

        let cond = if self.check_punct(";") {
            None
        } else {
            Some(self.expression()?)
        };
        self.expect_punct(";")?;

        let step = if self.check_punct(")") {
            None
        } else {
            Some(self.expression()?)
        };
        self.expect_punct(")")?;

        let body = Box::new(self.loop_body()?);
        Ok(Stmt::For {
            init,
            cond,
            step,
            body,
        })
    }

    // ----- expressions -----

    fn expression(&mut self) -> Result<Expr, ParseError> {
        self.nested(Self::assignment)
    }

    fn assignment(&mut self) -> Result<Expr, ParseError> {
        let target = self.conditional()?;

        let op = match self.peek() {
            Token::Punct("=") => AssignOp::Assign,
            Token::Punct("+=") => AssignOp::Compound(BinaryOp::Add),
            Token::Punct("-=") => AssignOp::Compound(BinaryOp::Sub),
            Token::Punct("*=") => AssignOp::Compound(BinaryOp::Mul),
            Token::Punct("/=") => AssignOp::Compound(BinaryOp::Div),
            _ => return Ok(target),
        };
        if !is_assignable(&target) {
            return Err(self.error("invalid assignment target"));
        }
        self.advance();
        let value = self.expression()?;
        Ok(Expr::Assign {
            op,
            target: Box::new(target),
            value: Box::new(value),
        })
    }

    fn conditional(&mut self) -> Result<Expr, ParseError> {
        let cond = self.logical_or()?;
        if !self.eat_punct("?") {
            return Ok(cond);
        }
        let then = self.expression()?;
        self.expect_punct(":")?;
        let otherwise = self.expression()?;
        Ok(Expr::Conditional {
            cond: Box::new(cond),
            then: Box::new(then),
            otherwise: Box::new(otherwise),
        })
    }

    fn logical_or(&mut self) -> Result<Expr, ParseError> {
        self.left_chain(|p| {
            let mut left = p.logical_and()?;
            loop {
                let op = match p.peek() {
                    Token::Punct("||") => LogicalOp::Or,
                    Token::Punct("??") => LogicalOp::Nullish,
                    _ => return Ok(left),
                };
                p.advance();
                p.link()?;
                let right = p.logical_and()?;
                left = Expr::Logical {
                    op,
                    left: Box::new(left),
                    right: Box::new(right),
                };
            }
        })
    }

    fn logical_and(&mut self) -> Result<Expr, ParseError> {
        self.left_chain(|p| {
            let mut left = p.equality()?;
            while p.eat_punct("&&") {
                p.link()?;
                let right = p.equality()?;
                left = Expr::Logical {
                    op: LogicalOp::And,
                    left: Box::new(left),
                    right: Box::new(right),
                };
            }
            Ok(left)
        })
    }

    fn binary_level(
        &mut self,
        ops: &[(&str, BinaryOp)],
        next: fn(&mut Self) -> Result<Expr, ParseError>,
    ) -> Result<Expr, ParseError> {
        self.left_chain(|p| {
            let mut left = next(p)?;
            loop {
                let op = match p.peek() {
                    Token::Punct(sym) => ops.iter().find(|(s, _)| s == sym).map(|(_, op)| *op),
                    _ => None,
                };
                let Some(op) = op else {
                    return Ok(left);
                };
                p.advance();
                p.link()?;
                let right = next(p)?;
                left = Expr::Binary {
                    op,
                    left: Box::new(left),
                    right: Box::new(right),
                };
            }
        })
    }

    fn equality(&mut self) -> Result<Expr, ParseError> {
        self.binary_level(
            &[
                ("===", BinaryOp::StrictEq),
                ("!==", BinaryOp::StrictNotEq),
                ("==", BinaryOp::Eq),
                ("!=", BinaryOp::NotEq),
            ],
            Self::relational,
        )
    }

    fn relational(&mut self) -> Result<Expr, ParseError> {
        self.binary_level(
            &[
                ("<", BinaryOp::Lt),
                ("<=", BinaryOp::LtEq),
                (">", BinaryOp::Gt),
                (">=", BinaryOp::GtEq),
            ],
            Self::additive,
        )
    }

    fn additive(&mut self) -> Result<Expr, ParseError> {
        self.binary_level(
            &[("+", BinaryOp::Add), ("-", BinaryOp::Sub)],
            Self::multiplicative,
        )
    }

    fn multiplicative(&mut self) -> Result<Expr, ParseError> {
        self.binary_level(
            &[("*", BinaryOp::Mul), ("/", BinaryOp::Div), ("%", BinaryOp::Rem)],
            Self::unary,
        )
    }

    fn unary(&mut self) -> Result<Expr, ParseError> {
        let op = match self.peek() {
            Token::Punct("!") => Some(UnaryOp::Not),
            Token::Punct("-") => Some(UnaryOp::Neg),
            Token::Punct("+") => Some(UnaryOp::Plus),
            Token::Ident(s) if s == "typeof" => Some(UnaryOp::TypeOf),
            _ => None,
        };
        if let Some(op) = op {
            self.advance();
            let expr = self.nested(Self::unary)?;
            return Ok(Expr::Unary {
                op,
                expr: Box::new(expr),
            });
        }

        if self.check_punct("++") || self.check_punct("--") {
            let increment = self.check_punct("++");
            self.advance();
            let target = self.nested(Self::unary)?;
            if !is_assignable(&target) {
                return Err(self.error("invalid update target"));
            }
            return Ok(Expr::Update {
                increment,
                prefix: true,
                target: Box::new(target),
            });
        }

        self.postfix()
    }

    fn postfix(&mut self) -> Result<Expr, ParseError> {
        let expr = self.call_member()?;
        if self.check_punct("++") || self.check_punct("--") {
            if !is_assignable(&expr) {
                return Err(self.error("invalid update target"));
            }
            let increment = self.check_punct("++");
            self.advance();
            return Ok(Expr::Update {
                increment,
                prefix: false,
                target: Box::new(expr),
            });
        }
        Ok(expr)
    }

    fn call_member(&mut self) -> Result<Expr, ParseError> {
        // `new Error(msg)` is an ordinary call
        self.eat_keyword("new");

        self.left_chain(|p| {
            let mut expr = p.primary()?;
            loop {
                if p.eat_punct(".") {
                    p.link()?;
                    let property = match p.advance() {
                        Token::Ident(name) => name,
                        other => {
                            return Err(p.error(format!(
                                "expected property name but found {}",
                                describe(&other)
                            )))
                        }
                    };
                    expr = Expr::Member {
                        object: Box::new(expr),
                        property,
                    };
                } else if p.eat_punct("[") {
                    p.link()?;
                    let index = p.expression()?;
                    p.expect_punct("]")?;
                    expr = Expr::Index {
                        object: Box::new(expr),
                        index: Box::new(index),
                    };
                } else if p.eat_punct("(") {
                    p.link()?;
                    let args = p.arguments()?;
                    expr = Expr::Call {
                        callee: Box::new(expr),
                        args,
                    };
                } else {
                    return Ok(expr);
                }
            }
        })
    }

    fn arguments(&mut self) -> Result<Vec<Expr>, ParseError> {
        let mut args = Vec::new();
        while !self.check_punct(")") {
            args.push(self.expression()?);
            if !self.eat_punct(",") {
                break;
            }
        }
        self.expect_punct(")")?;
        Ok(args)
    }

    fn primary(&mut self) -> Result<Expr, ParseError> {
        match self.advance() {
            Token::Number(n) => Ok(Expr::Literal(Literal::Number(n))),
            Token::Str(s) => Ok(Expr::Literal(Literal::Str(s.into()))),
            Token::Ident(name) => match name.as_str() {
                "true" => Ok(Expr::Literal(Literal::Bool(true))),
                "false" => Ok(Expr::Literal(Literal::Bool(false))),
                "null" => Ok(Expr::Literal(Literal::Null)),
                "undefined" => Ok(Expr::Literal(Literal::Undefined)),
                word if RESERVED.contains(&word) => {
                    Err(self.error(format!("unexpected keyword '{word}'")))
                }
                _ => Ok(Expr::Ident(name)),
            },
            Token::Punct("(") => {
                let expr = self.expression()?;
                self.expect_punct(")")?;
                Ok(expr)
            }
            Token::Punct("[") => {
                let mut items = Vec::new();
                while !self.check_punct("]") {
                    items.push(self.expression()?);
                    if !self.eat_punct(",") {
                        break;
                    }
                }
                self.expect_punct("]")?;
                Ok(Expr::Array(items))
            }
            Token::Punct("{") => self.object_literal(),
            other => Err(self.error(format!("unexpected {}", describe(&other)))),
        }
    }

    fn object_literal(&mut self) -> Result<Expr, ParseError> {
        let mut entries = Vec::new();
        while !self.check_punct("}") {
            let (key, shorthand_ok) = match self.advance() {
                Token::Ident(name) => (name, true),
                Token::Str(s) => (s, false),
                Token::Number(n) => (super::value::number_to_string(n), false),
                other => {
                    return Err(self.error(format!(
                        "expected property key but found {}",
                        describe(&other)
                    )))
                }
            };
            let value = if self.eat_punct(":") {
                self.expression()?
            } else if shorthand_ok && !RESERVED.contains(&key.as_str()) {
                Expr::Ident(key.clone())
            } else {
                return Err(self.error(format!("expected ':' after property '{key}'")));
            };
            entries.push((key, value));
            if !self.eat_punct(",") {
                break;
            }
        }
        self.expect_punct("}")?;
        Ok(Expr::Object(entries))
    }
}

fn is_assignable(expr: &Expr) -> bool {
    matches!(
        expr,
        Expr::Ident(_) | Expr::Member { .. } | Expr::Index { .. }
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parses_function_declarations() {
        let program = parse(
            "function greet(params) { return 'Hello, ' + params.name; }\n\
             function add(a, b) { return a + b }",
        )
        .unwrap();
        assert!(program.defines("greet"));
        assert!(program.defines("add"));
        assert!(!program.defines("missing"));
    }

    #[test]
    fn test_precedence() {
        let program = parse("let x = 1 + 2 * 3;").unwrap();
        let Stmt::Decl { decls, .. } = &program.body[0] else {
            panic!("expected declaration");
        };
        let Some(Expr::Binary { op, right, .. }) = &decls[0].1 else {
            panic!("expected binary");
        };
        assert_eq!(*op, BinaryOp::Add);
        assert!(matches!(**right, Expr::Binary { op: BinaryOp::Mul, .. }));
    }

    #[test]
    fn test_control_flow_parses() {
        parse(
            "function run(p) {\n\
               let total = 0;\n\
               for (let i = 0; i < 10; i++) { if (i % 2 == 0) continue; total += i; }\n\
               for (const x of [1, 2, 3]) { total += x; }\n\
               while (total > 100) { total -= 1; break; }\n\
               return total > 5 ? { total, ok: true } : null;\n\
             }",
        )
        .unwrap();
    }

    #[test]
    fn test_rejects_misplaced_statements() {
        assert!(parse("return 1;").is_err());
        assert!(parse("break;").is_err());
        assert!(parse("function f() { function g() {} }").is_err());
        assert!(parse("function f() {} function f() {}").is_err());
        assert!(parse("1 = 2;").is_err());
        assert!(parse("const x;").is_err());
    }

    #[test]
    fn test_error_reports_line() {
        let err = parse("let a = 1;\nlet b = ;").unwrap_err();
        assert_eq!(err.line, 2);
    }

    #[test]
    fn test_nesting_limit() {
        let src = format!("let x = {}1{};", "(".repeat(MAX_NESTING + 5), ")".repeat(MAX_NESTING + 5));
        assert!(parse(&src).unwrap_err().message.contains("nesting"));
    }

    #[test]
    fn test_long_operator_chain_is_bounded() {
        let src = format!("let x = 1{};", " + 1".repeat(MAX_NESTING + 5));
        assert!(parse(&src).unwrap_err().message.contains("nesting"));
        let src = format!("let x = a{};", ".b".repeat(MAX_NESTING + 5));
        assert!(parse(&src).is_err());
        assert!(parse("let x = 1 + 2 + 3 + 4;").is_ok());
    }

    #[test]
    fn test_new_is_a_call() {
        let program = parse("function f() { throw new Error('boom'); }").unwrap();
        assert!(program.defines("f"));
    }
}
