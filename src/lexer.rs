//! Raw lexer for Java-family sources.
//!
//! Unlike a compiler lexer nothing is skipped: whitespace and comments come
//! out as trivia kinds so the filter can reproduce the source byte for byte.
//! Contextual keywords (`record`, `yield`, `var`, `sealed`, `permits`,
//! `when`, `module`) lex as identifiers; the recognizer decides what they
//! mean from position.

use logos::Logos;

#[derive(Logos, Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TokenKind {
    // Trivia
    #[regex(r"[ \t\r\n\x0C]+")]
    Whitespace,
    #[regex(r"//[^\r\n]*", allow_greedy = true)]
    LineComment,
    #[regex(r"/\*([^*]|\*+[^*/])*\*+/")]
    BlockComment,

    // Declarations
    #[token("package")]
    Package,
    #[token("import")]
    Import,
    #[token("class")]
    Class,
    #[token("interface")]
    Interface,
    #[token("enum")]
    Enum,
    #[token("extends")]
    Extends,
    #[token("implements")]
    Implements,
    #[token("throws")]
    Throws,

    #[token("public")]
    #[token("protected")]
    #[token("private")]
    #[token("static")]
    #[token("final")]
    #[token("abstract")]
    #[token("native")]
    #[token("transient")]
    #[token("volatile")]
    #[token("strictfp")]
    Modifier,

    #[token("boolean")]
    #[token("byte")]
    #[token("char")]
    #[token("short")]
    #[token("int")]
    #[token("long")]
    #[token("float")]
    #[token("double")]
    Primitive,
    #[token("void")]
    Void,

    // Statements
    #[token("if")]
    If,
    #[token("else")]
    Else,
    #[token("while")]
    While,
    #[token("do")]
    Do,
    #[token("for")]
    For,
    #[token("switch")]
    Switch,
    #[token("case")]
    Case,
    #[token("default")]
    Default,
    #[token("break")]
    Break,
    #[token("continue")]
    Continue,
    #[token("return")]
    Return,
    #[token("throw")]
    Throw,
    #[token("try")]
    Try,
    #[token("catch")]
    Catch,
    #[token("finally")]
    Finally,
    #[token("synchronized")]
    Synchronized,
    #[token("assert")]
    Assert,

    // Expressions
    #[token("new")]
    New,
    #[token("this")]
    This,
    #[token("super")]
    Super,
    #[token("instanceof")]
    Instanceof,
    #[token("true")]
    True,
    #[token("false")]
    False,
    #[token("null")]
    Null,

    // Literals
    #[regex(r"0[xX][0-9a-fA-F][0-9a-fA-F_]*[lL]?")]
    #[regex(r"0[bB][01][01_]*[lL]?")]
    #[regex(r"[0-9][0-9_]*[lL]?")]
    IntLiteral,
    #[regex(r"[0-9][0-9_]*\.[0-9_]*([eE][+-]?[0-9][0-9_]*)?[fFdD]?")]
    #[regex(r"\.[0-9][0-9_]*([eE][+-]?[0-9][0-9_]*)?[fFdD]?")]
    #[regex(r"[0-9][0-9_]*[eE][+-]?[0-9][0-9_]*[fFdD]?")]
    #[regex(r"[0-9][0-9_]*[fFdD]")]
    FloatLiteral,
    #[regex(r"'([^'\\\r\n]|\\[^\r\nu0-7]|\\u+[0-9a-fA-F]{4}|\\[0-7]{1,3})'")]
    CharLiteral,
    #[regex(r#""([^"\\\r\n]|\\[^\r\n])*""#)]
    StringLiteral,
    #[regex(r#""""([^"\\]|\\[\s\S]|"[^"\\]|"\\[\s\S]|""[^"\\]|""\\[\s\S])*""""#)]
    TextBlock,

    #[regex(r"[a-zA-Z_$\u{80}-\u{10FFFF}][a-zA-Z0-9_$\u{80}-\u{10FFFF}]*")]
    Ident,

    // Separators
    #[token("(")]
    LParen,
    #[token(")")]
    RParen,
    #[token("{")]
    LBrace,
    #[token("}")]
    RBrace,
    #[token("[")]
    LBracket,
    #[token("]")]
    RBracket,
    #[token(";")]
    Semi,
    #[token(",")]
    Comma,
    #[token(".")]
    Dot,
    #[token("...")]
    Ellipsis,
    #[token("@")]
    At,
    #[token("::")]
    ColonColon,
    #[token(":")]
    Colon,
    #[token("?")]
    Question,
    #[token("->")]
    Arrow,

    // Operators
    #[token("=")]
    Assign,
    #[token("+=")]
    #[token("-=")]
    #[token("*=")]
    #[token("/=")]
    #[token("%=")]
    #[token("&=")]
    #[token("|=")]
    #[token("^=")]
    #[token("<<=")]
    #[token(">>=")]
    #[token(">>>=")]
    AssignOp,
    #[token("==")]
    EqEq,
    #[token("!=")]
    NotEq,
    #[token("<")]
    Lt,
    #[token(">")]
    Gt,
    #[token("<=")]
    Le,
    #[token(">=")]
    Ge,
    #[token("&&")]
    AndAnd,
    #[token("||")]
    OrOr,
    #[token("!")]
    Not,
    #[token("~")]
    Tilde,
    #[token("++")]
    PlusPlus,
    #[token("--")]
    MinusMinus,
    #[token("+")]
    Plus,
    #[token("-")]
    Minus,
    #[token("*")]
    Star,
    #[token("/")]
    Slash,
    #[token("%")]
    Percent,
    #[token("&")]
    Amp,
    #[token("|")]
    Pipe,
    #[token("^")]
    Caret,
    #[token("<<")]
    Shl,
    #[token(">>")]
    Shr,
    #[token(">>>")]
    UShr,

    /// End of input. Never produced by logos; appended by the filter.
    Eof,
}

impl TokenKind {
    pub fn is_trivia(self) -> bool {
        matches!(
            self,
            TokenKind::Whitespace | TokenKind::LineComment | TokenKind::BlockComment
        )
    }

    pub fn is_comment(self) -> bool {
        matches!(self, TokenKind::LineComment | TokenKind::BlockComment)
    }

    pub fn is_literal(self) -> bool {
        matches!(
            self,
            TokenKind::IntLiteral
                | TokenKind::FloatLiteral
                | TokenKind::CharLiteral
                | TokenKind::StringLiteral
                | TokenKind::TextBlock
                | TokenKind::True
                | TokenKind::False
                | TokenKind::Null
        )
    }

    pub fn is_assignment(self) -> bool {
        matches!(self, TokenKind::Assign | TokenKind::AssignOp)
    }

    /// Operators that may appear in a constant expression.
    pub fn is_operator(self) -> bool {
        matches!(
            self,
            TokenKind::EqEq
                | TokenKind::NotEq
                | TokenKind::Lt
                | TokenKind::Gt
                | TokenKind::Le
                | TokenKind::Ge
                | TokenKind::AndAnd
                | TokenKind::OrOr
                | TokenKind::Not
                | TokenKind::Tilde
                | TokenKind::Plus
                | TokenKind::Minus
                | TokenKind::Star
                | TokenKind::Slash
                | TokenKind::Percent
                | TokenKind::Amp
                | TokenKind::Pipe
                | TokenKind::Caret
                | TokenKind::Shl
                | TokenKind::Shr
                | TokenKind::UShr
                | TokenKind::Question
                | TokenKind::Colon
        )
    }

    /// Words that start a type declaration (`record` is contextual and
    /// checked by text).
    pub fn is_type_keyword(self) -> bool {
        matches!(self, TokenKind::Class | TokenKind::Interface | TokenKind::Enum)
    }
}
