//! Parser for Seraphim
//!
//! Recursive descent for declarations and statements; a Pratt parser for
//! expressions, driven by the precedence table (assignment lowest, pipe
//! highest). The parser accumulates diagnostics and synchronizes at
//! declaration and statement boundaries so one error does not hide the
//! rest of the file.
//!
//! `??` is one token. It parses as the postfix propagate form when the
//! next token cannot begin an expression, and as the infix coalesce
//! (right-associative) otherwise.

use crate::ast::{
    BinOp, Block, ConstDecl, Decl, EffectAnnotation, EnumDecl, Expr, ExprKind, FnDecl, ImplDecl,
    MatchArm, Param, Pattern, Program, Stmt, StructDecl, TypeExpr, UnOp,
};
use crate::diagnostics::{DiagKind, Diagnostic, SourceLoc};
use crate::lexer::{Lexer, Token, TokenKind, TokenValue};
use crate::types::EffectSet;

/// What an infix token builds, once both sides are parsed.
#[derive(Debug, Clone, Copy)]
enum Infix {
    Bin(BinOp),
    Assign(Option<BinOp>),
    Range { inclusive: bool },
    Coalesce,
    Pipe,
}

pub struct Parser {
    source: String,
    tokens: Vec<Token>,
    pos: usize,
    next_expr_id: u32,
    pub diagnostics: Vec<Diagnostic>,
}

impl Parser {
    pub fn new(source: &str) -> Self {
        Parser {
            source: source.to_string(),
            tokens: Lexer::new(source).tokenize(),
            pos: 0,
            next_expr_id: 0,
            diagnostics: Vec::new(),
        }
    }

    pub fn parse(&mut self) -> Program {
        let mut program = Program::default();

        // A VOID token means the lexer gave up; report it and parse what
        // came before it.
        if let Some(bad) = self.tokens.iter().find(|t| t.kind == TokenKind::Void) {
            self.diagnostics.push(Diagnostic::new(
                DiagKind::Lex,
                SourceLoc::new(bad.line, bad.col),
                "malformed token",
            ));
        }

        while !self.at_end() {
            match self.parse_decl() {
                Some(decl) => program.decls.push(decl),
                None => self.sync_decl(),
            }
        }
        program
    }

    // ------------------------------------------------------------------
    // Token plumbing
    // ------------------------------------------------------------------

    fn peek(&self) -> &Token {
        &self.tokens[self.pos.min(self.tokens.len() - 1)]
    }

    fn peek_kind(&self) -> TokenKind {
        self.peek().kind
    }

    fn at_end(&self) -> bool {
        matches!(self.peek_kind(), TokenKind::Eof | TokenKind::Void)
    }

    fn loc(&self) -> SourceLoc {
        let t = self.peek();
        SourceLoc::new(t.line, t.col)
    }

    fn advance(&mut self) -> Token {
        let t = self.peek().clone();
        if self.pos + 1 < self.tokens.len() {
            self.pos += 1;
        }
        t
    }

    fn check(&self, kind: TokenKind) -> bool {
        self.peek_kind() == kind
    }

    fn eat(&mut self, kind: TokenKind) -> bool {
        if self.check(kind) {
            self.advance();
            true
        } else {
            false
        }
    }

    fn expect(&mut self, kind: TokenKind, what: &str) -> bool {
        if self.eat(kind) {
            return true;
        }
        self.error(format!("expected {}", what));
        false
    }

    fn error(&mut self, message: impl Into<String>) {
        let loc = self.loc();
        self.diagnostics
            .push(Diagnostic::new(DiagKind::Parse, loc, message));
    }

    fn ident(&mut self, what: &str) -> Option<String> {
        if self.check(TokenKind::Ident) {
            let tok = self.advance();
            // Identifier text comes from the span; the lexer kept no copy.
            return Some(self.lexeme_of(&tok));
        }
        self.error(format!("expected {}", what));
        None
    }

    fn lexeme_of(&self, tok: &Token) -> String {
        tok.lexeme(&self.source).to_string()
    }

    fn fresh_id(&mut self) -> u32 {
        let id = self.next_expr_id;
        self.next_expr_id += 1;
        id
    }

    fn expr(&mut self, kind: ExprKind, loc: SourceLoc) -> Expr {
        Expr {
            id: self.fresh_id(),
            kind,
            loc,
        }
    }

    /// Skip to the next plausible declaration start.
    fn sync_decl(&mut self) {
        while !self.at_end() {
            match self.peek_kind() {
                TokenKind::Fn
                | TokenKind::Struct
                | TokenKind::Enum
                | TokenKind::Const
                | TokenKind::Use
                | TokenKind::Impl
                | TokenKind::LBracket
                | TokenKind::Effects => return,
                _ => {
                    self.advance();
                }
            }
        }
    }

    /// Skip to the next statement boundary inside a block.
    fn sync_stmt(&mut self) {
        while !self.at_end() {
            match self.peek_kind() {
                TokenKind::Semi => {
                    self.advance();
                    return;
                }
                TokenKind::RBrace
                | TokenKind::Let
                | TokenKind::Const
                | TokenKind::Return
                | TokenKind::While
                | TokenKind::For => return,
                _ => {
                    self.advance();
                }
            }
        }
    }

    // ------------------------------------------------------------------
    // Declarations
    // ------------------------------------------------------------------

    fn parse_decl(&mut self) -> Option<Decl> {
        let annotation = self.parse_effect_annotation()?;

        match self.peek_kind() {
            TokenKind::Fn => self.parse_fn(annotation).map(Decl::Fn),
            TokenKind::Struct => self.parse_struct().map(Decl::Struct),
            TokenKind::Enum => self.parse_enum().map(Decl::Enum),
            TokenKind::Const => self.parse_const().map(Decl::Const),
            TokenKind::Use => self.parse_use(),
            TokenKind::Impl => self.parse_impl().map(Decl::Impl),
            _ => {
                if annotation != EffectAnnotation::Default {
                    self.error("effect annotation must be followed by a function");
                    return None;
                }
                self.error("expected a declaration");
                None
            }
        }
    }

    /// `[pure]` or `effects(A, B, ...)` above a function. Absence binds ALL.
    fn parse_effect_annotation(&mut self) -> Option<EffectAnnotation> {
        if self.check(TokenKind::LBracket) {
            self.advance();
            if !self.eat(TokenKind::Pure) {
                self.error("expected 'pure' in effect annotation");
                return None;
            }
            self.expect(TokenKind::RBracket, "']' after 'pure'");
            return Some(EffectAnnotation::Pure);
        }
        if self.check(TokenKind::Effects) {
            self.advance();
            self.expect(TokenKind::LParen, "'(' after 'effects'");
            let mut set = EffectSet::NONE;
            while !self.check(TokenKind::RParen) && !self.at_end() {
                if let Some(name) = self.ident("effect name") {
                    match EffectSet::from_annotation_name(&name) {
                        Some(bits) => set |= bits,
                        None => self.error(format!("unknown effect '{}'", name)),
                    }
                } else {
                    return None;
                }
                if !self.eat(TokenKind::Comma) {
                    break;
                }
            }
            self.expect(TokenKind::RParen, "')' after effect list");
            return Some(EffectAnnotation::Effects(set));
        }
        Some(EffectAnnotation::Default)
    }

    fn parse_fn(&mut self, effects: EffectAnnotation) -> Option<FnDecl> {
        let loc = self.loc();
        self.advance(); // fn
        let name = self.ident("function name")?;
        self.expect(TokenKind::LParen, "'(' after function name");

        let mut params = Vec::new();
        while !self.check(TokenKind::RParen) && !self.at_end() {
            let pname = self.ident("parameter name")?;
            self.expect(TokenKind::Colon, "':' after parameter name");
            let ty = self.parse_type()?;
            params.push(Param { name: pname, ty });
            if !self.eat(TokenKind::Comma) {
                break;
            }
        }
        self.expect(TokenKind::RParen, "')' after parameters");

        let ret = if self.eat(TokenKind::Arrow) {
            Some(self.parse_type()?)
        } else {
            None
        };

        let body = self.parse_block()?;
        Some(FnDecl {
            name,
            params,
            ret,
            effects,
            body,
            loc,
        })
    }

    fn parse_struct(&mut self) -> Option<StructDecl> {
        let loc = self.loc();
        self.advance(); // struct
        let name = self.ident("struct name")?;
        self.expect(TokenKind::LBrace, "'{' after struct name");
        let mut fields = Vec::new();
        while !self.check(TokenKind::RBrace) && !self.at_end() {
            let fname = self.ident("field name")?;
            self.expect(TokenKind::Colon, "':' after field name");
            let ty = self.parse_type()?;
            fields.push((fname, ty));
            if !self.eat(TokenKind::Comma) {
                break;
            }
        }
        self.expect(TokenKind::RBrace, "'}' after struct fields");
        Some(StructDecl { name, fields, loc })
    }

    fn parse_enum(&mut self) -> Option<EnumDecl> {
        let loc = self.loc();
        self.advance(); // enum
        let name = self.ident("enum name")?;
        self.expect(TokenKind::LBrace, "'{' after enum name");
        let mut variants = Vec::new();
        while !self.check(TokenKind::RBrace) && !self.at_end() {
            let vname = self.ident("variant name")?;
            let mut payload = Vec::new();
            if self.eat(TokenKind::LParen) {
                while !self.check(TokenKind::RParen) && !self.at_end() {
                    payload.push(self.parse_type()?);
                    if !self.eat(TokenKind::Comma) {
                        break;
                    }
                }
                self.expect(TokenKind::RParen, "')' after variant payload");
            }
            variants.push((vname, payload));
            if !self.eat(TokenKind::Comma) {
                break;
            }
        }
        self.expect(TokenKind::RBrace, "'}' after enum variants");
        Some(EnumDecl {
            name,
            variants,
            loc,
        })
    }

    fn parse_const(&mut self) -> Option<ConstDecl> {
        let loc = self.loc();
        self.advance(); // const
        let name = self.ident("const name")?;
        let ty = if self.eat(TokenKind::Colon) {
            Some(self.parse_type()?)
        } else {
            None
        };
        self.expect(TokenKind::Assign, "'=' in const declaration");
        let value = self.parse_expr(0)?;
        self.expect(TokenKind::Semi, "';' after const declaration");
        Some(ConstDecl {
            name,
            ty,
            value,
            loc,
        })
    }

    fn parse_use(&mut self) -> Option<Decl> {
        let loc = self.loc();
        self.advance(); // use
        let mut path = self.ident("module path")?;
        while self.eat(TokenKind::ColonColon) {
            let seg = self.ident("path segment")?;
            path.push_str("::");
            path.push_str(&seg);
        }
        self.expect(TokenKind::Semi, "';' after use");
        Some(Decl::Use { path, loc })
    }

    fn parse_impl(&mut self) -> Option<ImplDecl> {
        let loc = self.loc();
        self.advance(); // impl
        let ty_name = self.ident("type name after 'impl'")?;
        self.expect(TokenKind::LBrace, "'{' after impl type");
        let mut methods = Vec::new();
        while !self.check(TokenKind::RBrace) && !self.at_end() {
            let annotation = self.parse_effect_annotation()?;
            if !self.check(TokenKind::Fn) {
                self.error("expected method in impl block");
                self.sync_stmt();
                continue;
            }
            if let Some(f) = self.parse_fn(annotation) {
                methods.push(f);
            }
        }
        self.expect(TokenKind::RBrace, "'}' after impl block");
        Some(ImplDecl {
            ty_name,
            methods,
            loc,
        })
    }

    // ------------------------------------------------------------------
    // Types
    // ------------------------------------------------------------------

    fn parse_type(&mut self) -> Option<TypeExpr> {
        if self.eat(TokenKind::QQ) {
            return Some(TypeExpr::Voidable(Box::new(self.parse_type()?)));
        }
        // `void` is a keyword token but a perfectly good type name.
        if self.eat(TokenKind::VoidLit) {
            return Some(TypeExpr::Name("void".to_string()));
        }
        if self.eat(TokenKind::LBracket) {
            let inner = self.parse_type()?;
            if self.eat(TokenKind::Semi) {
                let len = match &self.peek().value {
                    TokenValue::Int { value, .. } => *value,
                    _ => {
                        self.error("expected array length");
                        return None;
                    }
                };
                self.advance();
                self.expect(TokenKind::RBracket, "']' after array length");
                return Some(TypeExpr::Array(Box::new(inner), len));
            }
            self.expect(TokenKind::RBracket, "']' after slice element type");
            return Some(TypeExpr::Slice(Box::new(inner)));
        }
        let name = self.ident("type name")?;
        Some(TypeExpr::Name(name))
    }

    // ------------------------------------------------------------------
    // Blocks and statements
    // ------------------------------------------------------------------

    fn parse_block(&mut self) -> Option<Block> {
        let loc = self.loc();
        if !self.expect(TokenKind::LBrace, "'{'") {
            return None;
        }
        let mut stmts = Vec::new();
        let mut tail = None;

        while !self.check(TokenKind::RBrace) && !self.at_end() {
            match self.peek_kind() {
                TokenKind::Let | TokenKind::Const => match self.parse_let() {
                    Some(s) => stmts.push(s),
                    None => self.sync_stmt(),
                },
                TokenKind::Return => {
                    let loc = self.loc();
                    self.advance();
                    let value = if self.check(TokenKind::Semi) {
                        None
                    } else {
                        self.parse_expr(0)
                    };
                    self.expect(TokenKind::Semi, "';' after return");
                    stmts.push(Stmt::Return { value, loc });
                }
                TokenKind::While => {
                    let loc = self.loc();
                    self.advance();
                    let Some(cond) = self.parse_expr(0) else {
                        self.sync_stmt();
                        continue;
                    };
                    let Some(body) = self.parse_block() else {
                        self.sync_stmt();
                        continue;
                    };
                    stmts.push(Stmt::While { cond, body, loc });
                }
                TokenKind::For => {
                    let loc = self.loc();
                    self.advance();
                    let Some(var) = self.ident("loop variable") else {
                        self.sync_stmt();
                        continue;
                    };
                    self.expect(TokenKind::In, "'in' in for loop");
                    let Some(iter) = self.parse_expr(0) else {
                        self.sync_stmt();
                        continue;
                    };
                    let Some(body) = self.parse_block() else {
                        self.sync_stmt();
                        continue;
                    };
                    stmts.push(Stmt::ForIn {
                        var,
                        iter,
                        body,
                        loc,
                    });
                }
                TokenKind::Break => {
                    let loc = self.loc();
                    self.advance();
                    self.expect(TokenKind::Semi, "';' after break");
                    stmts.push(Stmt::Break { loc });
                }
                TokenKind::Continue => {
                    let loc = self.loc();
                    self.advance();
                    self.expect(TokenKind::Semi, "';' after continue");
                    stmts.push(Stmt::Continue { loc });
                }
                _ => {
                    let Some(e) = self.parse_expr(0) else {
                        self.sync_stmt();
                        continue;
                    };
                    if self.eat(TokenKind::Semi) {
                        stmts.push(Stmt::Expr(e));
                    } else if self.check(TokenKind::RBrace) {
                        // Trailing expression gives the block its type.
                        tail = Some(Box::new(e));
                    } else {
                        // Block-like expressions stand alone without ';'.
                        if matches!(
                            e.kind,
                            ExprKind::If { .. }
                                | ExprKind::Match { .. }
                                | ExprKind::Block(_)
                                | ExprKind::Persist(_)
                                | ExprKind::Aether(_)
                                | ExprKind::Recover { .. }
                        ) {
                            stmts.push(Stmt::Expr(e));
                        } else {
                            self.error("expected ';' after expression");
                            stmts.push(Stmt::Expr(e));
                            self.sync_stmt();
                        }
                    }
                }
            }
        }
        self.expect(TokenKind::RBrace, "'}' to close block");
        Some(Block { stmts, tail, loc })
    }

    fn parse_let(&mut self) -> Option<Stmt> {
        let loc = self.loc();
        let is_const = self.check(TokenKind::Const);
        self.advance(); // let or const
        let mutable = !is_const && self.eat(TokenKind::Mut);
        let name = self.ident("binding name")?;
        let ty = if self.eat(TokenKind::Colon) {
            Some(self.parse_type()?)
        } else {
            None
        };
        self.expect(TokenKind::Assign, "'=' in binding");
        let value = self.parse_expr(0)?;
        self.expect(TokenKind::Semi, "';' after binding");
        Some(if is_const {
            Stmt::Const {
                name,
                ty,
                value,
                loc,
            }
        } else {
            Stmt::Let {
                name,
                ty,
                value,
                mutable,
                loc,
            }
        })
    }

    // ------------------------------------------------------------------
    // Expressions (Pratt)
    // ------------------------------------------------------------------

    fn parse_expr(&mut self, min_bp: u8) -> Option<Expr> {
        let mut lhs = self.parse_prefix()?;

        loop {
            let kind = self.peek_kind();

            // Postfix forms: call, member, index, cast, void ops.
            let post_bp = match kind {
                TokenKind::LParen | TokenKind::Dot | TokenKind::LBracket => Some(26),
                TokenKind::As => Some(24),
                TokenKind::QQ if !self.qq_is_infix() => Some(28),
                TokenKind::BangBang => Some(28),
                _ => None,
            };
            if let Some(bp) = post_bp {
                if bp < min_bp {
                    break;
                }
                lhs = self.parse_postfix(lhs)?;
                continue;
            }

            // Infix operators.
            let Some((lbp, rbp, infix)) = self.infix_binding(kind) else {
                break;
            };
            if lbp < min_bp {
                break;
            }
            let loc = self.loc();
            self.advance();
            let rhs = self.parse_expr(rbp)?;
            lhs = self.build_infix(infix, lhs, rhs, loc);
        }
        Some(lhs)
    }

    fn build_infix(&mut self, infix: Infix, lhs: Expr, rhs: Expr, loc: SourceLoc) -> Expr {
        let kind = match infix {
            Infix::Bin(op) => ExprKind::Binary {
                op,
                lhs: Box::new(lhs),
                rhs: Box::new(rhs),
            },
            Infix::Assign(op) => ExprKind::Assign {
                target: Box::new(lhs),
                op,
                value: Box::new(rhs),
            },
            Infix::Range { inclusive } => ExprKind::Range {
                lo: Box::new(lhs),
                hi: Box::new(rhs),
                inclusive,
            },
            Infix::Coalesce => ExprKind::Coalesce {
                value: Box::new(lhs),
                default: Box::new(rhs),
            },
            Infix::Pipe => ExprKind::Pipe {
                value: Box::new(lhs),
                func: Box::new(rhs),
            },
        };
        self.expr(kind, loc)
    }

    /// Whether the token after a `??` can begin an expression, which makes
    /// the `??` the infix coalesce form.
    fn qq_is_infix(&self) -> bool {
        let next = self
            .tokens
            .get(self.pos + 1)
            .map(|t| t.kind)
            .unwrap_or(TokenKind::Eof);
        matches!(
            next,
            TokenKind::Int
                | TokenKind::Float
                | TokenKind::Str
                | TokenKind::Char
                | TokenKind::True
                | TokenKind::False
                | TokenKind::VoidLit
                | TokenKind::Ident
                | TokenKind::LParen
                | TokenKind::Minus
                | TokenKind::Bang
                | TokenKind::Tilde
                | TokenKind::If
                | TokenKind::Match
                | TokenKind::LBrace
                | TokenKind::Recover
                | TokenKind::Persist
                | TokenKind::Aether
        )
    }

    /// The precedence table: assignment (1, right-assoc) up to pipe (15).
    /// Binding powers are level * 2, with the right power dropped by one
    /// for right-associative operators.
    fn infix_binding(&self, kind: TokenKind) -> Option<(u8, u8, Infix)> {
        use TokenKind::*;
        Some(match kind {
            Assign => (2, 1, Infix::Assign(None)),
            PlusAssign => (2, 1, Infix::Assign(Some(BinOp::Add))),
            MinusAssign => (2, 1, Infix::Assign(Some(BinOp::Sub))),
            StarAssign => (2, 1, Infix::Assign(Some(BinOp::Mul))),
            SlashAssign => (2, 1, Infix::Assign(Some(BinOp::Div))),
            PercentAssign => (2, 1, Infix::Assign(Some(BinOp::Mod))),
            AmpAssign => (2, 1, Infix::Assign(Some(BinOp::BitAnd))),
            PipeAssign => (2, 1, Infix::Assign(Some(BinOp::BitOr))),
            CaretAssign => (2, 1, Infix::Assign(Some(BinOp::BitXor))),
            ShlAssign => (2, 1, Infix::Assign(Some(BinOp::Shl))),
            ShrAssign => (2, 1, Infix::Assign(Some(BinOp::Shr))),

            // Ranges sit between assignment and the logical operators.
            DotDot => (3, 4, Infix::Range { inclusive: false }),
            DotDotEq => (3, 4, Infix::Range { inclusive: true }),

            PipePipe => (4, 5, Infix::Bin(BinOp::Or)),
            AmpAmp => (6, 7, Infix::Bin(BinOp::And)),
            Pipe => (8, 9, Infix::Bin(BinOp::BitOr)),
            Caret => (10, 11, Infix::Bin(BinOp::BitXor)),
            Amp => (12, 13, Infix::Bin(BinOp::BitAnd)),
            EqEq => (14, 15, Infix::Bin(BinOp::Eq)),
            NotEq => (14, 15, Infix::Bin(BinOp::Ne)),
            Lt => (16, 17, Infix::Bin(BinOp::Lt)),
            LtEq => (16, 17, Infix::Bin(BinOp::Le)),
            Gt => (16, 17, Infix::Bin(BinOp::Gt)),
            GtEq => (16, 17, Infix::Bin(BinOp::Ge)),
            Shl => (18, 19, Infix::Bin(BinOp::Shl)),
            Shr => (18, 19, Infix::Bin(BinOp::Shr)),
            Plus => (20, 21, Infix::Bin(BinOp::Add)),
            Minus => (20, 21, Infix::Bin(BinOp::Sub)),
            Star => (22, 23, Infix::Bin(BinOp::Mul)),
            Slash => (22, 23, Infix::Bin(BinOp::Div)),
            Percent => (22, 23, Infix::Bin(BinOp::Mod)),

            // Infix coalesce: level 14, right-assoc so chains nest right.
            QQ if self.qq_is_infix() => (29, 28, Infix::Coalesce),

            // Pipe: level 15, tightest.
            PipeGt => (30, 31, Infix::Pipe),
            _ => return None,
        })
    }

    fn parse_prefix(&mut self) -> Option<Expr> {
        let loc = self.loc();
        match self.peek_kind() {
            TokenKind::Int => {
                let tok = self.advance();
                let TokenValue::Int { value, suffix } = tok.value else {
                    unreachable!("int token without int payload")
                };
                Some(self.expr(ExprKind::Int { value, suffix }, loc))
            }
            TokenKind::Float => {
                let tok = self.advance();
                let TokenValue::Float { value, suffix } = tok.value else {
                    unreachable!("float token without float payload")
                };
                Some(self.expr(ExprKind::Float { value, suffix }, loc))
            }
            TokenKind::Str => {
                let tok = self.advance();
                let TokenValue::Str(s) = tok.value else {
                    unreachable!("string token without payload")
                };
                Some(self.expr(ExprKind::Str(s), loc))
            }
            TokenKind::Char => {
                let tok = self.advance();
                let TokenValue::Char(c) = tok.value else {
                    unreachable!("char token without payload")
                };
                Some(self.expr(ExprKind::Char(c), loc))
            }
            TokenKind::True => {
                self.advance();
                Some(self.expr(ExprKind::Bool(true), loc))
            }
            TokenKind::False => {
                self.advance();
                Some(self.expr(ExprKind::Bool(false), loc))
            }
            TokenKind::VoidLit => {
                self.advance();
                Some(self.expr(ExprKind::Void, loc))
            }
            TokenKind::Ident => {
                let tok = self.advance();
                let name = self.lexeme_of(&tok);
                Some(self.expr(ExprKind::Ident(name), loc))
            }
            TokenKind::Minus => {
                self.advance();
                let operand = self.parse_expr(24)?;
                Some(self.expr(
                    ExprKind::Unary {
                        op: UnOp::Neg,
                        operand: Box::new(operand),
                    },
                    loc,
                ))
            }
            TokenKind::Bang => {
                self.advance();
                let operand = self.parse_expr(24)?;
                Some(self.expr(
                    ExprKind::Unary {
                        op: UnOp::Not,
                        operand: Box::new(operand),
                    },
                    loc,
                ))
            }
            TokenKind::Tilde => {
                self.advance();
                let operand = self.parse_expr(24)?;
                Some(self.expr(
                    ExprKind::Unary {
                        op: UnOp::BitNot,
                        operand: Box::new(operand),
                    },
                    loc,
                ))
            }
            TokenKind::LParen => {
                self.advance();
                let inner = self.parse_expr(0)?;
                self.expect(TokenKind::RParen, "')'");
                Some(inner)
            }
            TokenKind::LBrace => {
                let block = self.parse_block()?;
                Some(self.expr(ExprKind::Block(block), loc))
            }
            TokenKind::If => self.parse_if(),
            TokenKind::Match => self.parse_match(),
            TokenKind::Persist => {
                self.advance();
                let block = self.parse_block()?;
                Some(self.expr(ExprKind::Persist(block), loc))
            }
            TokenKind::Aether => {
                self.advance();
                let block = self.parse_block()?;
                Some(self.expr(ExprKind::Aether(block), loc))
            }
            TokenKind::Recover => {
                self.advance();
                let body = self.parse_block()?;
                self.expect(TokenKind::Else, "'else' after recover block");
                let handler = self.parse_block()?;
                Some(self.expr(ExprKind::Recover { body, handler }, loc))
            }
            _ => {
                self.error("expected an expression");
                None
            }
        }
    }

    fn parse_if(&mut self) -> Option<Expr> {
        let loc = self.loc();
        self.advance(); // if
        let cond = self.parse_expr(0)?;
        let then_block = self.parse_block()?;
        let else_branch = if self.eat(TokenKind::Else) {
            if self.check(TokenKind::If) {
                Some(Box::new(self.parse_if()?))
            } else {
                let b_loc = self.loc();
                let block = self.parse_block()?;
                Some(Box::new(self.expr(ExprKind::Block(block), b_loc)))
            }
        } else {
            None
        };
        Some(self.expr(
            ExprKind::If {
                cond: Box::new(cond),
                then_block,
                else_branch,
            },
            loc,
        ))
    }

    fn parse_match(&mut self) -> Option<Expr> {
        let loc = self.loc();
        self.advance(); // match
        let scrutinee = self.parse_expr(0)?;
        self.expect(TokenKind::LBrace, "'{' after match scrutinee");
        let mut arms = Vec::new();
        while !self.check(TokenKind::RBrace) && !self.at_end() {
            let arm_loc = self.loc();
            let pattern = self.parse_pattern()?;
            self.expect(TokenKind::FatArrow, "'=>' after pattern");
            let body = self.parse_expr(0)?;
            arms.push(MatchArm {
                pattern,
                body,
                loc: arm_loc,
            });
            if !self.eat(TokenKind::Comma) {
                break;
            }
        }
        self.expect(TokenKind::RBrace, "'}' after match arms");
        Some(self.expr(
            ExprKind::Match {
                scrutinee: Box::new(scrutinee),
                arms,
            },
            loc,
        ))
    }

    fn parse_pattern(&mut self) -> Option<Pattern> {
        match self.peek_kind() {
            TokenKind::Int => {
                let tok = self.advance();
                let TokenValue::Int { value, .. } = tok.value else {
                    unreachable!()
                };
                Some(Pattern::Int(value as i64))
            }
            TokenKind::Minus => {
                self.advance();
                let tok = self.advance();
                match tok.value {
                    TokenValue::Int { value, .. } => Some(Pattern::Int(-(value as i64))),
                    _ => {
                        self.error("expected integer after '-' in pattern");
                        None
                    }
                }
            }
            TokenKind::True => {
                self.advance();
                Some(Pattern::Bool(true))
            }
            TokenKind::False => {
                self.advance();
                Some(Pattern::Bool(false))
            }
            TokenKind::VoidLit => {
                self.advance();
                Some(Pattern::Void)
            }
            TokenKind::Ident => {
                let tok = self.advance();
                let name = self.lexeme_of(&tok);
                if name == "_" {
                    return Some(Pattern::Wildcard);
                }
                // Uppercase leading character: enum variant.
                if name.chars().next().is_some_and(|c| c.is_uppercase()) {
                    let mut bindings = Vec::new();
                    if self.eat(TokenKind::LParen) {
                        while !self.check(TokenKind::RParen) && !self.at_end() {
                            bindings.push(self.ident("binding name")?);
                            if !self.eat(TokenKind::Comma) {
                                break;
                            }
                        }
                        self.expect(TokenKind::RParen, "')' after bindings");
                    }
                    return Some(Pattern::Variant { name, bindings });
                }
                Some(Pattern::Binding(name))
            }
            _ => {
                self.error("expected a pattern");
                None
            }
        }
    }

    fn parse_postfix(&mut self, lhs: Expr) -> Option<Expr> {
        let loc = self.loc();
        match self.peek_kind() {
            TokenKind::LParen => {
                self.advance();
                let mut args = Vec::new();
                while !self.check(TokenKind::RParen) && !self.at_end() {
                    args.push(self.parse_expr(0)?);
                    if !self.eat(TokenKind::Comma) {
                        break;
                    }
                }
                self.expect(TokenKind::RParen, "')' after arguments");
                Some(self.expr(
                    ExprKind::Call {
                        callee: Box::new(lhs),
                        args,
                    },
                    loc,
                ))
            }
            TokenKind::Dot => {
                self.advance();
                let name = self.ident("member name")?;
                if self.eat(TokenKind::LParen) {
                    let mut args = Vec::new();
                    while !self.check(TokenKind::RParen) && !self.at_end() {
                        args.push(self.parse_expr(0)?);
                        if !self.eat(TokenKind::Comma) {
                            break;
                        }
                    }
                    self.expect(TokenKind::RParen, "')' after arguments");
                    return Some(self.expr(
                        ExprKind::MethodCall {
                            recv: Box::new(lhs),
                            name,
                            args,
                        },
                        loc,
                    ));
                }
                Some(self.expr(
                    ExprKind::Field {
                        recv: Box::new(lhs),
                        name,
                    },
                    loc,
                ))
            }
            TokenKind::LBracket => {
                self.advance();
                let index = self.parse_expr(0)?;
                self.expect(TokenKind::RBracket, "']' after index");
                Some(self.expr(
                    ExprKind::Index {
                        recv: Box::new(lhs),
                        index: Box::new(index),
                    },
                    loc,
                ))
            }
            TokenKind::As => {
                self.advance();
                let ty = self.parse_type()?;
                Some(self.expr(
                    ExprKind::Cast {
                        expr: Box::new(lhs),
                        ty,
                    },
                    loc,
                ))
            }
            TokenKind::QQ => {
                self.advance();
                Some(self.expr(ExprKind::VoidProp(Box::new(lhs)), loc))
            }
            TokenKind::BangBang => {
                self.advance();
                Some(self.expr(ExprKind::VoidAssert(Box::new(lhs)), loc))
            }
            _ => Some(lhs),
        }
    }
}
