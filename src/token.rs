// Token kinds and source positions.
//
// Mirrors the source-span convention used throughout the AST (see
// `ast::Span`): every token remembers where it came from so the parser
// and, later, the evaluator/VM can report precise diagnostics.

#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub struct Span {
    pub line: u32,
    pub column: u32,
}

impl Span {
    pub fn new(line: u32, column: u32) -> Span {
        Span { line, column }
    }
}

#[derive(Clone, Debug, PartialEq)]
pub enum Literal {
    Number(f64),
    Str(String),
    Bool(bool),
    Null,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum TokenKind {
    // Single-character punctuation
    LeftParen,
    RightParen,
    LeftBrace,
    RightBrace,
    LeftBracket,
    RightBracket,
    Comma,
    Dot,
    Colon,
    ColonColon,
    Semicolon,
    Minus,
    Plus,
    Slash,
    Star,
    Percent,
    Dollar,
    At,

    // One or two character operators
    Bang,
    BangEqual,
    Equal,
    EqualEqual,
    Greater,
    GreaterEqual,
    Less,
    LessEqual,
    StarStar,
    QuestionQuestion,
    AmpAmp,
    PipePipe,
    FatArrow,

    // Literals
    Identifier,
    String,
    Number,

    // Keywords
    Class,
    If,
    Else,
    While,
    For,
    In,
    Return,
    Match,
    Import,
    Export,
    From,
    True,
    False,
    Null,
    This,

    Eof,
}

#[derive(Clone, Debug, PartialEq)]
pub struct Token {
    pub kind: TokenKind,
    pub lexeme: String,
    pub literal: Option<Literal>,
    pub span: Span,
}

impl Token {
    pub fn new(kind: TokenKind, lexeme: String, literal: Option<Literal>, span: Span) -> Token {
        Token { kind, lexeme, literal, span }
    }
}

lazy_static! {
    pub static ref KEYWORDS: std::collections::HashMap<&'static str, TokenKind> = {
        use TokenKind::*;
        let mut m = std::collections::HashMap::new();
        m.insert("class", Class);
        m.insert("if", If);
        m.insert("else", Else);
        m.insert("while", While);
        m.insert("for", For);
        m.insert("in", In);
        m.insert("return", Return);
        m.insert("match", Match);
        m.insert("import", Import);
        m.insert("export", Export);
        m.insert("from", From);
        m.insert("true", True);
        m.insert("false", False);
        m.insert("null", Null);
        m.insert("this", This);
        m
    };
}
