//! Abstract syntax tree for Seraphim
//!
//! The parser produces an owned tree. Every expression carries a unique id
//! assigned at parse time; the checker keys its inferred-type table on
//! those ids and the lowering pass reads them back, so the tree itself
//! stays annotation-free.

use crate::diagnostics::SourceLoc;
use crate::lexer::NumSuffix;
use crate::types::EffectSet;

/// Syntactic type reference, resolved to a semantic `Type` by the checker.
#[derive(Debug, Clone, PartialEq)]
pub enum TypeExpr {
    /// `i64`, `scalar`, `MyStruct`, ...
    Name(String),
    /// `??T`
    Voidable(Box<TypeExpr>),
    /// `[T]`
    Slice(Box<TypeExpr>),
    /// `[T; N]`
    Array(Box<TypeExpr>, u64),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BinOp {
    Add,
    Sub,
    Mul,
    Div,
    Mod,
    BitAnd,
    BitOr,
    BitXor,
    Shl,
    Shr,
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
    And,
    Or,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnOp {
    Neg,
    Not,
    BitNot,
}

/// Patterns in match arms.
#[derive(Debug, Clone, PartialEq)]
pub enum Pattern {
    Wildcard,
    Int(i64),
    Bool(bool),
    /// The VOID literal pattern.
    Void,
    /// Binds the scrutinee to a name.
    Binding(String),
    /// Enum variant with optional field bindings.
    Variant { name: String, bindings: Vec<String> },
}

#[derive(Debug, Clone, PartialEq)]
pub struct MatchArm {
    pub pattern: Pattern,
    pub body: Expr,
    pub loc: SourceLoc,
}

/// A block: statements plus an optional trailing expression that gives the
/// block its type.
#[derive(Debug, Clone, PartialEq)]
pub struct Block {
    pub stmts: Vec<Stmt>,
    pub tail: Option<Box<Expr>>,
    pub loc: SourceLoc,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Expr {
    pub id: u32,
    pub kind: ExprKind,
    pub loc: SourceLoc,
}

#[derive(Debug, Clone, PartialEq)]
pub enum ExprKind {
    Int {
        value: u64,
        suffix: NumSuffix,
    },
    Float {
        value: f64,
        suffix: NumSuffix,
    },
    Str(String),
    Char(char),
    Bool(bool),
    /// The VOID literal.
    Void,
    Ident(String),
    Binary {
        op: BinOp,
        lhs: Box<Expr>,
        rhs: Box<Expr>,
    },
    Unary {
        op: UnOp,
        operand: Box<Expr>,
    },
    /// `target = value` or `target op= value` (op carried separately).
    Assign {
        target: Box<Expr>,
        op: Option<BinOp>,
        value: Box<Expr>,
    },
    Call {
        callee: Box<Expr>,
        args: Vec<Expr>,
    },
    MethodCall {
        recv: Box<Expr>,
        name: String,
        args: Vec<Expr>,
    },
    Field {
        recv: Box<Expr>,
        name: String,
    },
    Index {
        recv: Box<Expr>,
        index: Box<Expr>,
    },
    Cast {
        expr: Box<Expr>,
        ty: TypeExpr,
    },
    Block(Block),
    If {
        cond: Box<Expr>,
        then_block: Block,
        else_branch: Option<Box<Expr>>,
    },
    Match {
        scrutinee: Box<Expr>,
        arms: Vec<MatchArm>,
    },
    Range {
        lo: Box<Expr>,
        hi: Box<Expr>,
        inclusive: bool,
    },
    /// Postfix `e??`: early-return VOID if the operand is VOID.
    VoidProp(Box<Expr>),
    /// Postfix `e!!`: trap if the operand is VOID.
    VoidAssert(Box<Expr>),
    /// Infix `a ?? b`: a unless VOID, else b.
    Coalesce {
        value: Box<Expr>,
        default: Box<Expr>,
    },
    /// `value |> func`: sugar for `func(value)`.
    Pipe {
        value: Box<Expr>,
        func: Box<Expr>,
    },
    /// `persist { ... }` substrate block.
    Persist(Block),
    /// `aether { ... }` substrate block.
    Aether(Block),
    /// `recover { body } else { handler }`: handler runs when the body
    /// produces VOID.
    Recover {
        body: Block,
        handler: Block,
    },
}

#[derive(Debug, Clone, PartialEq)]
pub enum Stmt {
    Let {
        name: String,
        ty: Option<TypeExpr>,
        value: Expr,
        mutable: bool,
        loc: SourceLoc,
    },
    Const {
        name: String,
        ty: Option<TypeExpr>,
        value: Expr,
        loc: SourceLoc,
    },
    Return {
        value: Option<Expr>,
        loc: SourceLoc,
    },
    While {
        cond: Expr,
        body: Block,
        loc: SourceLoc,
    },
    ForIn {
        var: String,
        iter: Expr,
        body: Block,
        loc: SourceLoc,
    },
    Break {
        loc: SourceLoc,
    },
    Continue {
        loc: SourceLoc,
    },
    Expr(Expr),
}

/// Effect annotation above a function: absent means `ALL`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EffectAnnotation {
    /// No annotation: allowed set is ALL.
    Default,
    /// `[pure]`: allowed set is NONE.
    Pure,
    /// `effects(A, B, ...)`.
    Effects(EffectSet),
}

impl EffectAnnotation {
    pub fn allowed(self) -> EffectSet {
        match self {
            EffectAnnotation::Default => EffectSet::ALL,
            EffectAnnotation::Pure => EffectSet::NONE,
            EffectAnnotation::Effects(set) => set,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Param {
    pub name: String,
    pub ty: TypeExpr,
}

#[derive(Debug, Clone, PartialEq)]
pub struct FnDecl {
    pub name: String,
    pub params: Vec<Param>,
    pub ret: Option<TypeExpr>,
    pub effects: EffectAnnotation,
    pub body: Block,
    pub loc: SourceLoc,
}

#[derive(Debug, Clone, PartialEq)]
pub struct StructDecl {
    pub name: String,
    pub fields: Vec<(String, TypeExpr)>,
    pub loc: SourceLoc,
}

#[derive(Debug, Clone, PartialEq)]
pub struct EnumDecl {
    pub name: String,
    pub variants: Vec<(String, Vec<TypeExpr>)>,
    pub loc: SourceLoc,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ConstDecl {
    pub name: String,
    pub ty: Option<TypeExpr>,
    pub value: Expr,
    pub loc: SourceLoc,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ImplDecl {
    pub ty_name: String,
    pub methods: Vec<FnDecl>,
    pub loc: SourceLoc,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Decl {
    Fn(FnDecl),
    Struct(StructDecl),
    Enum(EnumDecl),
    Const(ConstDecl),
    Use { path: String, loc: SourceLoc },
    Impl(ImplDecl),
}

/// A parsed source file: a free sequence of declarations.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Program {
    pub decls: Vec<Decl>,
}

impl Program {
    pub fn functions(&self) -> impl Iterator<Item = &FnDecl> {
        self.decls.iter().filter_map(|d| match d {
            Decl::Fn(f) => Some(f),
            _ => None,
        })
    }
}
