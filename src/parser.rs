// Recursive-descent, precedence-climbing parser.
//
// Panic-mode error recovery: on a syntax error the parser records a
// diagnostic and skips tokens until the next statement-start sentinel, so
// one run can report every syntax error in a file instead of stopping at
// the first.

use crate::ast::*;
use crate::diagnostics::Diagnostic;
use crate::token::{Literal, Span, Token, TokenKind};
use std::rc::Rc;

type PResult<T> = Result<T, Diagnostic>;

pub struct Parser {
    tokens: Vec<Token>,
    current: usize,
    errors: Vec<Diagnostic>,
}

// Statement-start sentinels the recovery sweep stops at.
const SENTINELS: &[TokenKind] = &[
    TokenKind::Class,
    TokenKind::Dollar,
    TokenKind::If,
    TokenKind::While,
    TokenKind::For,
    TokenKind::Return,
    TokenKind::Match,
    TokenKind::Import,
    TokenKind::Export,
];

impl Parser {
    pub fn new(tokens: Vec<Token>) -> Parser {
        Parser { tokens, current: 0, errors: Vec::new() }
    }

    pub fn parse(mut self) -> (Program, Vec<Diagnostic>) {
        let mut program = Vec::new();
        while !self.is_at_end() {
            match self.declaration() {
                Ok(stmt) => program.push(stmt),
                Err(e) => {
                    self.errors.push(e);
                    self.synchronize();
                }
            }
        }
        (program, self.errors)
    }

    // ---- token stream plumbing -------------------------------------

    fn peek(&self) -> &Token {
        &self.tokens[self.current]
    }

    fn peek_next(&self) -> &Token {
        &self.tokens[(self.current + 1).min(self.tokens.len() - 1)]
    }

    fn previous(&self) -> &Token {
        &self.tokens[self.current - 1]
    }

    fn is_at_end(&self) -> bool {
        self.peek().kind == TokenKind::Eof
    }

    fn check(&self, kind: TokenKind) -> bool {
        !self.is_at_end() && self.peek().kind == kind
    }

    fn check_next(&self, kind: TokenKind) -> bool {
        self.peek_next().kind == kind
    }

    fn advance(&mut self) -> Token {
        if !self.is_at_end() {
            self.current += 1;
        }
        self.previous().clone()
    }

    fn matches(&mut self, kind: TokenKind) -> bool {
        if self.check(kind) {
            self.advance();
            true
        } else {
            false
        }
    }

    fn expect(&mut self, kind: TokenKind, message: &str) -> PResult<Token> {
        if self.check(kind) {
            Ok(self.advance())
        } else {
            Err(self.error_at_current(message))
        }
    }

    fn error_at_current(&self, message: &str) -> Diagnostic {
        Diagnostic::new(crate::diagnostics::ErrorKind::Parse, message, self.peek().span)
    }

    fn synchronize(&mut self) {
        while !self.is_at_end() {
            if self.previous().kind == TokenKind::Semicolon {
                return;
            }
            if self.check(TokenKind::RightBrace) {
                return;
            }
            if SENTINELS.contains(&self.peek().kind) {
                return;
            }
            self.advance();
        }
    }

    // ---- declarations ------------------------------------------------

    fn declaration(&mut self) -> PResult<Stmt> {
        if self.check(TokenKind::Class) {
            self.class_decl()
        } else if self.check(TokenKind::Dollar) {
            self.function_decl()
        } else if self.check(TokenKind::Percent) {
            self.type_alias()
        } else if self.check(TokenKind::Import) {
            self.import_stmt()
        } else if self.check(TokenKind::Export) {
            self.export_stmt()
        } else if self.is_immut_start() {
            self.var_decl(true)
        } else if self.check(TokenKind::Identifier) && self.check_next(TokenKind::Colon) {
            self.var_decl(false)
        } else {
            self.statement()
        }
    }

    fn is_immut_start(&self) -> bool {
        self.check(TokenKind::At) && self.peek_next().kind == TokenKind::Identifier && self.peek_next().lexeme == "immut"
    }

    fn var_decl(&mut self, immutable: bool) -> PResult<Stmt> {
        let span = self.peek().span;
        if immutable {
            self.advance(); // '@'
            self.advance(); // 'immut'
        }
        let name = self.expect(TokenKind::Identifier, "expected variable name")?.lexeme;
        let type_annot = if self.matches(TokenKind::Colon) {
            Some(self.type_annot()?)
        } else {
            None
        };
        let initializer = if self.matches(TokenKind::Equal) {
            Some(self.expression()?)
        } else {
            None
        };
        self.expect(TokenKind::Semicolon, "expected ';' after variable declaration")?;
        Ok(Stmt::new(StmtKind::Var { name, type_annot, initializer, immutable }, span))
    }

    fn type_alias(&mut self) -> PResult<Stmt> {
        let span = self.advance().span; // '%'
        let name = self.expect(TokenKind::Identifier, "expected type alias name")?.lexeme;
        self.expect(TokenKind::Equal, "expected '=' in type alias")?;
        let ty = self.type_annot()?;
        self.expect(TokenKind::Semicolon, "expected ';' after type alias")?;
        Ok(Stmt::new(StmtKind::TypeAlias { name, ty }, span))
    }

    fn import_stmt(&mut self) -> PResult<Stmt> {
        let span = self.advance().span; // 'import'
        self.expect(TokenKind::LeftBrace, "expected '{' after import")?;
        let mut names = Vec::new();
        if !self.check(TokenKind::RightBrace) {
            loop {
                names.push(self.expect(TokenKind::Identifier, "expected imported name")?.lexeme);
                if !self.matches(TokenKind::Comma) {
                    break;
                }
            }
        }
        self.expect(TokenKind::RightBrace, "expected '}' after import list")?;
        self.expect(TokenKind::From, "expected 'from' after import list")?;
        let path_tok = self.expect(TokenKind::String, "expected module path string")?;
        let path = match path_tok.literal {
            Some(Literal::Str(s)) => s,
            _ => String::new(),
        };
        self.expect(TokenKind::Semicolon, "expected ';' after import")?;
        Ok(Stmt::new(StmtKind::Import { path, names }, span))
    }

    fn export_stmt(&mut self) -> PResult<Stmt> {
        let span = self.advance().span; // 'export'
        let decl = self.declaration()?;
        Ok(Stmt::new(StmtKind::Export(Box::new(decl)), span))
    }

    fn class_decl(&mut self) -> PResult<Stmt> {
        let span = self.advance().span; // 'class'
        let name = self.expect(TokenKind::Identifier, "expected class name")?.lexeme;
        let type_params = self.type_params()?;
        self.expect(TokenKind::LeftBrace, "expected '{' before class body")?;
        let mut methods = Vec::new();
        while !self.check(TokenKind::RightBrace) && !self.is_at_end() {
            match self.function_decl()? {
                Stmt { kind: StmtKind::Function(decl), .. } => methods.push(decl),
                _ => unreachable!(),
            }
        }
        self.expect(TokenKind::RightBrace, "expected '}' after class body")?;
        Ok(Stmt::new(StmtKind::Class { name, methods, type_params }, span))
    }

    fn type_params(&mut self) -> PResult<Vec<String>> {
        let mut params = Vec::new();
        if self.matches(TokenKind::LeftBracket) {
            if !self.check(TokenKind::RightBracket) {
                loop {
                    params.push(self.expect(TokenKind::Identifier, "expected type parameter")?.lexeme);
                    if !self.matches(TokenKind::Comma) {
                        break;
                    }
                }
            }
            self.expect(TokenKind::RightBracket, "expected ']' after type parameters")?;
        }
        Ok(params)
    }

    // `$ name[Tparams]?(params) (: type)? { body }`
    fn function_decl(&mut self) -> PResult<Stmt> {
        let span = self.advance().span; // '$'
        let name = self.expect(TokenKind::Identifier, "expected function name")?.lexeme;
        let type_params = self.type_params()?;
        let params = self.param_list()?;
        let return_type = if self.matches(TokenKind::Colon) { Some(self.type_annot()?) } else { None };
        self.expect(TokenKind::LeftBrace, "expected '{' before function body")?;
        let body = self.block_statements()?;
        let decl = Rc::new(FunctionDecl { name: Some(name), params, return_type, body: Rc::new(body), type_params, span });
        Ok(Stmt::new(StmtKind::Function(decl), span))
    }

    fn param_list(&mut self) -> PResult<Vec<Param>> {
        self.expect(TokenKind::LeftParen, "expected '(' before parameter list")?;
        let mut params = Vec::new();
        if !self.check(TokenKind::RightParen) {
            loop {
                let name = self.expect(TokenKind::Identifier, "expected parameter name")?.lexeme;
                let type_annot = if self.matches(TokenKind::Colon) { Some(self.type_annot()?) } else { None };
                params.push(Param { name, type_annot });
                if !self.matches(TokenKind::Comma) {
                    break;
                }
            }
        }
        self.expect(TokenKind::RightParen, "expected ')' after parameter list")?;
        Ok(params)
    }

    fn type_annot(&mut self) -> PResult<TypeAnnot> {
        if self.check(TokenKind::Null) {
            self.advance();
            return Ok(TypeAnnot::Null);
        }
        let name_tok = self.expect(TokenKind::Identifier, "expected type annotation")?;
        match name_tok.lexeme.as_str() {
            "number" => Ok(TypeAnnot::Number),
            "string" => Ok(TypeAnnot::Str),
            "boolean" => Ok(TypeAnnot::Boolean),
            "Any" => Ok(TypeAnnot::Any),
            "Array" => {
                self.expect(TokenKind::LeftBracket, "expected '[' after Array")?;
                let elem = self.type_annot()?;
                self.expect(TokenKind::RightBracket, "expected ']' after Array element type")?;
                Ok(TypeAnnot::Array(Rc::new(elem)))
            }
            "Dict" => {
                self.expect(TokenKind::LeftBracket, "expected '[' after Dict")?;
                let key = self.type_annot()?;
                self.expect(TokenKind::Comma, "expected ',' between Dict type parameters")?;
                let value = self.type_annot()?;
                self.expect(TokenKind::RightBracket, "expected ']' after Dict type parameters")?;
                Ok(TypeAnnot::Dict(Rc::new(key), Rc::new(value)))
            }
            "Function" => {
                self.expect(TokenKind::LeftBracket, "expected '[' after Function")?;
                self.expect(TokenKind::LeftParen, "expected '(' for Function parameter types")?;
                let mut params = Vec::new();
                if !self.check(TokenKind::RightParen) {
                    loop {
                        params.push(self.type_annot()?);
                        if !self.matches(TokenKind::Comma) {
                            break;
                        }
                    }
                }
                self.expect(TokenKind::RightParen, "expected ')' after Function parameter types")?;
                self.expect(TokenKind::Comma, "expected ',' before Function return type")?;
                let ret = self.type_annot()?;
                self.expect(TokenKind::RightBracket, "expected ']' after Function type")?;
                Ok(TypeAnnot::Function(params, Rc::new(ret)))
            }
            other => Ok(TypeAnnot::Named(other.to_string())),
        }
    }

    // ---- statements ----------------------------------------------------

    fn statement(&mut self) -> PResult<Stmt> {
        if self.check(TokenKind::If) {
            self.if_stmt()
        } else if self.check(TokenKind::While) {
            self.while_stmt()
        } else if self.check(TokenKind::For) {
            self.for_stmt()
        } else if self.check(TokenKind::Return) {
            self.return_stmt()
        } else if self.check(TokenKind::LeftBrace) {
            let span = self.peek().span;
            self.advance();
            Ok(Stmt::new(StmtKind::Block(self.block_statements()?), span))
        } else {
            self.expr_stmt()
        }
    }

    fn block_statements(&mut self) -> PResult<Vec<Stmt>> {
        let mut stmts = Vec::new();
        while !self.check(TokenKind::RightBrace) && !self.is_at_end() {
            match self.declaration() {
                Ok(stmt) => stmts.push(stmt),
                Err(e) => {
                    self.errors.push(e);
                    self.synchronize();
                }
            }
        }
        self.expect(TokenKind::RightBrace, "expected '}' to close block")?;
        Ok(stmts)
    }

    fn if_stmt(&mut self) -> PResult<Stmt> {
        let span = self.advance().span; // 'if'
        self.expect(TokenKind::LeftParen, "expected '(' after if")?;
        let condition = self.expression()?;
        self.expect(TokenKind::RightParen, "expected ')' after condition")?;
        let then_branch = Box::new(self.statement()?);
        let else_branch = if self.matches(TokenKind::Else) { Some(Box::new(self.statement()?)) } else { None };
        Ok(Stmt::new(StmtKind::If { condition, then_branch, else_branch }, span))
    }

    fn while_stmt(&mut self) -> PResult<Stmt> {
        let span = self.advance().span; // 'while'
        self.expect(TokenKind::LeftParen, "expected '(' after while")?;
        let condition = self.expression()?;
        self.expect(TokenKind::RightParen, "expected ')' after condition")?;
        let body = Box::new(self.statement()?);
        Ok(Stmt::new(StmtKind::While { condition, body }, span))
    }

    fn for_stmt(&mut self) -> PResult<Stmt> {
        let span = self.advance().span; // 'for'
        self.expect(TokenKind::LeftParen, "expected '(' after for")?;
        let var = self.expect(TokenKind::Identifier, "expected loop variable name")?.lexeme;
        self.expect(TokenKind::In, "expected 'in' in for loop")?;
        let iterable = self.expression()?;
        self.expect(TokenKind::RightParen, "expected ')' after for clause")?;
        let body = Box::new(self.statement()?);
        Ok(Stmt::new(StmtKind::For { var, iterable, body }, span))
    }

    fn return_stmt(&mut self) -> PResult<Stmt> {
        let span = self.advance().span; // 'return'
        let value = if self.check(TokenKind::Semicolon) { None } else { Some(self.expression()?) };
        self.expect(TokenKind::Semicolon, "expected ';' after return value")?;
        Ok(Stmt::new(StmtKind::Return(value), span))
    }

    fn expr_stmt(&mut self) -> PResult<Stmt> {
        let expr = self.expression()?;
        let span = expr.span;
        self.expect(TokenKind::Semicolon, "expected ';' after expression")?;
        Ok(Stmt::new(StmtKind::Expression(expr), span))
    }

    // ---- expressions -----------------------------------------------------

    fn expression(&mut self) -> PResult<Expr> {
        self.assignment()
    }

    fn assignment(&mut self) -> PResult<Expr> {
        let target = self.logical_or()?;
        if self.matches(TokenKind::Equal) {
            let span = target.span;
            let value = self.assignment()?;
            return match target.kind {
                ExprKind::Variable(name) => Ok(Expr::new(ExprKind::Assign(name, Rc::new(value)), span)),
                ExprKind::Get(obj, name) => Ok(Expr::new(ExprKind::Set(obj, name, Rc::new(value)), span)),
                ExprKind::Index(obj, idx) => Ok(Expr::new(ExprKind::IndexSet(obj, idx, Rc::new(value)), span)),
                _ => Err(Diagnostic::new(crate::diagnostics::ErrorKind::Parse, "invalid assignment target", span)),
            };
        }
        Ok(target)
    }

    fn logical_or(&mut self) -> PResult<Expr> {
        let mut expr = self.logical_and()?;
        while self.check(TokenKind::PipePipe) {
            let span = self.advance().span;
            let rhs = self.logical_and()?;
            expr = Expr::new(ExprKind::Logical(LogicOp::Or, Rc::new(expr), Rc::new(rhs)), span);
        }
        Ok(expr)
    }

    fn logical_and(&mut self) -> PResult<Expr> {
        let mut expr = self.equality()?;
        while self.check(TokenKind::AmpAmp) {
            let span = self.advance().span;
            let rhs = self.equality()?;
            expr = Expr::new(ExprKind::Logical(LogicOp::And, Rc::new(expr), Rc::new(rhs)), span);
        }
        Ok(expr)
    }

    fn equality(&mut self) -> PResult<Expr> {
        let mut expr = self.comparison()?;
        loop {
            let op = if self.check(TokenKind::EqualEqual) {
                BinOp::Eq
            } else if self.check(TokenKind::BangEqual) {
                BinOp::Ne
            } else {
                break;
            };
            let span = self.advance().span;
            let rhs = self.comparison()?;
            expr = Expr::new(ExprKind::Binary(op, Rc::new(expr), Rc::new(rhs)), span);
        }
        Ok(expr)
    }

    fn comparison(&mut self) -> PResult<Expr> {
        let mut expr = self.term()?;
        loop {
            let op = if self.check(TokenKind::Less) {
                BinOp::Lt
            } else if self.check(TokenKind::LessEqual) {
                BinOp::Le
            } else if self.check(TokenKind::Greater) {
                BinOp::Gt
            } else if self.check(TokenKind::GreaterEqual) {
                BinOp::Ge
            } else {
                break;
            };
            let span = self.advance().span;
            let rhs = self.term()?;
            expr = Expr::new(ExprKind::Binary(op, Rc::new(expr), Rc::new(rhs)), span);
        }
        Ok(expr)
    }

    fn term(&mut self) -> PResult<Expr> {
        let mut expr = self.factor()?;
        loop {
            let op = if self.check(TokenKind::Plus) {
                BinOp::Add
            } else if self.check(TokenKind::Minus) {
                BinOp::Sub
            } else if self.check(TokenKind::QuestionQuestion) {
                BinOp::NullCoalesce
            } else {
                break;
            };
            let span = self.advance().span;
            let rhs = self.factor()?;
            expr = Expr::new(ExprKind::Binary(op, Rc::new(expr), Rc::new(rhs)), span);
        }
        Ok(expr)
    }

    fn factor(&mut self) -> PResult<Expr> {
        let mut expr = self.power()?;
        loop {
            let op = if self.check(TokenKind::Star) {
                BinOp::Mul
            } else if self.check(TokenKind::Slash) {
                BinOp::Div
            } else if self.check(TokenKind::Percent) {
                BinOp::Mod
            } else {
                break;
            };
            let span = self.advance().span;
            let rhs = self.power()?;
            expr = Expr::new(ExprKind::Binary(op, Rc::new(expr), Rc::new(rhs)), span);
        }
        Ok(expr)
    }

    // right-associative
    fn power(&mut self) -> PResult<Expr> {
        let expr = self.unary()?;
        if self.check(TokenKind::StarStar) {
            let span = self.advance().span;
            let rhs = self.power()?;
            return Ok(Expr::new(ExprKind::Binary(BinOp::Pow, Rc::new(expr), Rc::new(rhs)), span));
        }
        Ok(expr)
    }

    fn unary(&mut self) -> PResult<Expr> {
        if self.check(TokenKind::Bang) {
            let span = self.advance().span;
            let rhs = self.unary()?;
            return Ok(Expr::new(ExprKind::Unary(UnOp::Not, Rc::new(rhs)), span));
        }
        if self.check(TokenKind::Minus) {
            let span = self.advance().span;
            let rhs = self.unary()?;
            return Ok(Expr::new(ExprKind::Unary(UnOp::Neg, Rc::new(rhs)), span));
        }
        self.call()
    }

    fn call(&mut self) -> PResult<Expr> {
        let mut expr = self.primary()?;
        loop {
            if self.check(TokenKind::LeftParen) {
                let span = self.advance().span;
                let mut args = Vec::new();
                if !self.check(TokenKind::RightParen) {
                    loop {
                        args.push(self.expression()?);
                        if !self.matches(TokenKind::Comma) {
                            break;
                        }
                    }
                }
                self.expect(TokenKind::RightParen, "expected ')' after arguments")?;
                expr = Expr::new(ExprKind::Call(Rc::new(expr), args), span);
            } else if self.check(TokenKind::Dot) {
                let span = self.advance().span;
                let name = self.expect(TokenKind::Identifier, "expected property name after '.'")?.lexeme;
                expr = Expr::new(ExprKind::Get(Rc::new(expr), name), span);
            } else if self.check(TokenKind::LeftBracket) {
                let span = self.advance().span;
                expr = self.finish_index_or_slice(expr, span)?;
            } else {
                break;
            }
        }
        Ok(expr)
    }

    fn finish_index_or_slice(&mut self, receiver: Expr, span: Span) -> PResult<Expr> {
        let receiver = Rc::new(receiver);
        if self.matches(TokenKind::Colon) {
            let end = if self.check(TokenKind::RightBracket) { None } else { Some(Rc::new(self.expression()?)) };
            self.expect(TokenKind::RightBracket, "expected ']' after slice")?;
            return Ok(Expr::new(ExprKind::Slice(receiver, None, end), span));
        }
        let first = self.expression()?;
        if self.matches(TokenKind::Colon) {
            let end = if self.check(TokenKind::RightBracket) { None } else { Some(Rc::new(self.expression()?)) };
            self.expect(TokenKind::RightBracket, "expected ']' after slice")?;
            Ok(Expr::new(ExprKind::Slice(receiver, Some(Rc::new(first)), end), span))
        } else {
            self.expect(TokenKind::RightBracket, "expected ']' after index")?;
            Ok(Expr::new(ExprKind::Index(receiver, Rc::new(first)), span))
        }
    }

    fn primary(&mut self) -> PResult<Expr> {
        let span = self.peek().span;
        if self.check(TokenKind::Number) || self.check(TokenKind::String) || self.check(TokenKind::True)
            || self.check(TokenKind::False) || self.check(TokenKind::Null)
        {
            let tok = self.advance();
            return Ok(Expr::new(ExprKind::Literal(tok.literal.unwrap()), span));
        }
        if self.check(TokenKind::This) {
            self.advance();
            return Ok(Expr::new(ExprKind::This, span));
        }
        if self.check(TokenKind::Identifier) {
            let name = self.advance().lexeme;
            return Ok(Expr::new(ExprKind::Variable(name), span));
        }
        if self.check(TokenKind::LeftParen) {
            self.advance();
            let inner = self.expression()?;
            self.expect(TokenKind::RightParen, "expected ')' to close grouping")?;
            return Ok(Expr::new(ExprKind::Grouping(Rc::new(inner)), span));
        }
        if self.check(TokenKind::LeftBracket) {
            return self.list_literal();
        }
        if self.check(TokenKind::LeftBrace) {
            return self.dict_literal();
        }
        if self.check(TokenKind::Dollar) {
            return self.lambda();
        }
        if self.check(TokenKind::Match) {
            return self.match_expr();
        }
        Err(self.error_at_current("expected expression"))
    }

    fn list_literal(&mut self) -> PResult<Expr> {
        let span = self.advance().span; // '['
        let mut items = Vec::new();
        if !self.check(TokenKind::RightBracket) {
            loop {
                items.push(self.expression()?);
                if !self.matches(TokenKind::Comma) {
                    break;
                }
            }
        }
        self.expect(TokenKind::RightBracket, "expected ']' to close list")?;
        Ok(Expr::new(ExprKind::ListExpr(items), span))
    }

    fn dict_literal(&mut self) -> PResult<Expr> {
        let span = self.advance().span; // '{'
        let mut keys = Vec::new();
        let mut values = Vec::new();
        if !self.check(TokenKind::RightBrace) {
            loop {
                keys.push(self.expression()?);
                self.expect(TokenKind::Colon, "expected ':' in dict entry")?;
                values.push(self.expression()?);
                if !self.matches(TokenKind::Comma) {
                    break;
                }
            }
        }
        self.expect(TokenKind::RightBrace, "expected '}' to close dict")?;
        Ok(Expr::new(ExprKind::Dict(keys, values), span))
    }

    // `$ (params) => expr` or `$ (params) => { block }`
    fn lambda(&mut self) -> PResult<Expr> {
        let span = self.advance().span; // '$'
        let params = self.param_list()?;
        self.expect(TokenKind::FatArrow, "expected '=>' in lambda")?;
        let body = if self.matches(TokenKind::LeftBrace) {
            self.block_statements()?
        } else {
            let value = self.expression()?;
            let value_span = value.span;
            vec![Stmt::new(StmtKind::Return(Some(value)), value_span)]
        };
        let decl = Rc::new(FunctionDecl { name: None, params, return_type: None, body: Rc::new(body), type_params: vec![], span });
        Ok(Expr::new(ExprKind::Lambda(decl), span))
    }

    // `match (scrutinee) { pattern (if guard)? => body, ... }`
    fn match_expr(&mut self) -> PResult<Expr> {
        let span = self.advance().span; // 'match'
        self.expect(TokenKind::LeftParen, "expected '(' after match")?;
        let scrutinee = self.expression()?;
        self.expect(TokenKind::RightParen, "expected ')' after match scrutinee")?;
        self.expect(TokenKind::LeftBrace, "expected '{' to start match arms")?;
        let mut arms = Vec::new();
        while !self.check(TokenKind::RightBrace) && !self.is_at_end() {
            let pattern = self.pattern()?;
            let guard = if self.matches(TokenKind::If) { Some(self.expression()?) } else { None };
            self.expect(TokenKind::FatArrow, "expected '=>' in match arm")?;
            let body = self.match_arm_body()?;
            arms.push(MatchArm { pattern, guard, body: Rc::new(body) });
            if !self.matches(TokenKind::Comma) {
                break;
            }
        }
        self.expect(TokenKind::RightBrace, "expected '}' to close match")?;
        Ok(Expr::new(ExprKind::Match(Rc::new(scrutinee), arms), span))
    }

    fn pattern(&mut self) -> PResult<Pattern> {
        if self.check(TokenKind::Identifier) && self.peek().lexeme == "_" {
            self.advance();
            return Ok(Pattern::Wildcard);
        }
        if self.check(TokenKind::Identifier) && (self.peek().lexeme == "Ok" || self.peek().lexeme == "Error") {
            let is_ok = self.peek().lexeme == "Ok";
            self.advance();
            self.expect(TokenKind::LeftParen, "expected '(' after Ok/Error pattern")?;
            let inner = self.pattern()?;
            self.expect(TokenKind::RightParen, "expected ')' after Ok/Error pattern")?;
            return Ok(if is_ok { Pattern::Ok(Box::new(inner)) } else { Pattern::Error(Box::new(inner)) });
        }
        if self.check(TokenKind::Identifier) {
            let name = self.advance().lexeme;
            return Ok(Pattern::Binding(name));
        }
        if self.check(TokenKind::Number) || self.check(TokenKind::String) || self.check(TokenKind::True)
            || self.check(TokenKind::False) || self.check(TokenKind::Null)
        {
            let span = self.peek().span;
            let tok = self.advance();
            return Ok(Pattern::Literal(Expr::new(ExprKind::Literal(tok.literal.unwrap()), span)));
        }
        Err(self.error_at_current("expected pattern"))
    }

    // A match arm's body is an expression, or a `{ ... }` block whose final
    // statement's value becomes the arm's result. The block form is
    // desugared into an immediately-invoked zero-argument lambda so the
    // rest of the tree only ever sees `MatchArm::body: Expr`.
    fn match_arm_body(&mut self) -> PResult<Expr> {
        if self.check(TokenKind::LeftBrace) {
            let span = self.advance().span;
            let mut stmts = self.block_statements()?;
            if let Some(last) = stmts.pop() {
                if let StmtKind::Expression(e) = last.kind {
                    stmts.push(Stmt::new(StmtKind::Return(Some(e)), last.span));
                } else {
                    stmts.push(last);
                }
            }
            let decl = Rc::new(FunctionDecl { name: None, params: vec![], return_type: None, body: Rc::new(stmts), type_params: vec![], span });
            let lambda = Expr::new(ExprKind::Lambda(decl), span);
            Ok(Expr::new(ExprKind::Call(Rc::new(lambda), vec![]), span))
        } else {
            self.expression()
        }
    }
}

pub fn parse(tokens: Vec<Token>) -> (Program, Vec<Diagnostic>) {
    Parser::new(tokens).parse()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scanner::scan;

    fn parse_ok(src: &str) -> Program {
        let (tokens, lex_errors) = scan(src);
        assert!(lex_errors.is_empty(), "lex errors: {:?}", lex_errors);
        let (program, errors) = parse(tokens);
        assert!(errors.is_empty(), "parse errors: {:?}", errors);
        program
    }

    #[test]
    fn test_precedence_and_associativity() {
        let program = parse_ok("x = 1 + 2 * 3;");
        match &program[0].kind {
            StmtKind::Expression(Expr { kind: ExprKind::Assign(_, rhs), .. }) => match &rhs.kind {
                ExprKind::Binary(BinOp::Add, _, _) => {}
                other => panic!("expected addition at top, got {:?}", other),
            },
            other => panic!("unexpected statement: {:?}", other),
        }
    }

    #[test]
    fn test_power_is_right_associative() {
        let program = parse_ok("x = 2 ** 3 ** 2;");
        match &program[0].kind {
            StmtKind::Expression(Expr { kind: ExprKind::Assign(_, rhs), .. }) => match &rhs.kind {
                ExprKind::Binary(BinOp::Pow, _, right) => match &right.kind {
                    ExprKind::Binary(BinOp::Pow, _, _) => {}
                    other => panic!("expected nested power on the right, got {:?}", other),
                },
                other => panic!("expected power, got {:?}", other),
            },
            other => panic!("unexpected statement: {:?}", other),
        }
    }

    #[test]
    fn test_function_and_call() {
        let program = parse_ok("$ fib(n){ if (n<=1) return n; return fib(n-1)+fib(n-2); }");
        assert_eq!(program.len(), 1);
        assert!(matches!(program[0].kind, StmtKind::Function(_)));
    }

    #[test]
    fn test_immut_decl() {
        let program = parse_ok("@immut PI=3;");
        match &program[0].kind {
            StmtKind::Var { name, immutable, .. } => {
                assert_eq!(name, "PI");
                assert!(*immutable);
            }
            other => panic!("expected var decl, got {:?}", other),
        }
    }

    #[test]
    fn test_negative_slice_parses() {
        let program = parse_ok("print(a[-2:]);");
        // just confirm it parses to a call without error; deeper checks live
        // in the evaluator/VM scenario tests.
        assert_eq!(program.len(), 1);
    }

    #[test]
    fn test_recovers_after_syntax_error() {
        let (tokens, _) = scan("$ broken(( { return 1; } $ ok(){ return 2; }");
        let (program, errors) = parse(tokens);
        assert!(!errors.is_empty());
        assert!(program.iter().any(|s| matches!(&s.kind, StmtKind::Function(d) if d.name.as_deref() == Some("ok"))));
    }
}
