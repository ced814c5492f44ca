//! Arena-backed doubly linked token list.
//!
//! Tokens live in one `Vec` and link to each other through `TokenId`
//! indices. Trivia (whitespace, comments) hang off the token they follow,
//! so the primary chain holds only significant tokens while the writer can
//! still reproduce the input exactly.

use std::collections::BTreeMap;
use std::sync::LazyLock;

use regex::Regex;

use crate::lexer::TokenKind;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TokenId(u32);

impl TokenId {
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

/// Whitespace or a comment, attached to the token it follows.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Trivia {
    pub kind: TokenKind,
    pub text: String,
    pub line: u32,
    pub column: u32,
}

#[derive(Debug, Clone)]
pub struct Token {
    pub kind: TokenKind,
    pub text: String,
    pub line: u32,
    pub column: u32,
    pub end_line: u32,
    pub end_column: u32,
    pub hidden_after: Vec<Trivia>,
    prev: Option<TokenId>,
    next: Option<TokenId>,
}

impl Token {
    pub fn new(kind: TokenKind, text: impl Into<String>, line: u32, column: u32) -> Self {
        let text = text.into();
        let (end_line, end_column) = end_position(&text, line, column);
        Self {
            kind,
            text,
            line,
            column,
            end_line,
            end_column,
            hidden_after: Vec::new(),
            prev: None,
            next: None,
        }
    }
}

/// Position of the last character of `text` when it starts at
/// `line:column` (1-based, inclusive).
fn end_position(text: &str, line: u32, column: u32) -> (u32, u32) {
    let mut end_line = line;
    let mut end_column = column;
    let mut chars = text.chars().peekable();
    let mut first = true;
    while let Some(c) = chars.next() {
        if first {
            first = false;
            if c != '\n' && c != '\r' {
                continue;
            }
        }
        match c {
            '\r' => {
                if chars.peek() == Some(&'\n') {
                    chars.next();
                }
                end_line += 1;
                end_column = 0;
            }
            '\n' => {
                end_line += 1;
                end_column = 0;
            }
            _ => end_column += 1,
        }
    }
    (end_line, end_column)
}

#[derive(Debug, Default)]
pub struct TokenList {
    tokens: Vec<Token>,
    head: Option<TokenId>,
    /// Trivia before the first significant token.
    leading: Vec<Trivia>,
}

impl TokenList {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.tokens.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tokens.is_empty()
    }

    pub fn head(&self) -> Option<TokenId> {
        self.head
    }

    pub fn get(&self, id: TokenId) -> &Token {
        &self.tokens[id.index()]
    }

    pub fn get_mut(&mut self, id: TokenId) -> &mut Token {
        &mut self.tokens[id.index()]
    }

    pub fn kind(&self, id: TokenId) -> TokenKind {
        self.get(id).kind
    }

    pub fn text(&self, id: TokenId) -> &str {
        &self.get(id).text
    }

    pub fn next(&self, id: TokenId) -> Option<TokenId> {
        self.get(id).next
    }

    pub fn prev(&self, id: TokenId) -> Option<TokenId> {
        self.get(id).prev
    }

    pub fn leading(&self) -> &[Trivia] {
        &self.leading
    }

    pub fn push_leading(&mut self, trivia: Trivia) {
        self.leading.push(trivia);
    }

    /// Link `token` after `tail` (or make it the head of an empty list).
    pub fn append(&mut self, tail: Option<TokenId>, mut token: Token) -> TokenId {
        let id = self.alloc_id();
        token.prev = tail;
        token.next = None;
        match tail {
            Some(t) => {
                debug_assert!(self.get(t).next.is_none(), "append must target the tail");
                self.get_mut(t).next = Some(id);
            }
            None => self.head = Some(id),
        }
        self.tokens.push(token);
        id
    }

    fn alloc_id(&self) -> TokenId {
        TokenId(self.tokens.len() as u32)
    }

    /// Significant tokens in list order.
    pub fn iter(&self) -> impl Iterator<Item = TokenId> + '_ {
        std::iter::successors(self.head, move |&id| self.next(id))
    }

    /// Render `begin..=end` with each whitespace run collapsed to one space
    /// and comments dropped.
    pub fn normalised_sequence(&self, begin: TokenId, end: TokenId) -> String {
        let mut out = String::new();
        let mut cursor = Some(begin);
        while let Some(id) = cursor {
            let token = self.get(id);
            out.push_str(&token.text);
            if id == end {
                break;
            }
            if token
                .hidden_after
                .iter()
                .any(|t| t.kind == TokenKind::Whitespace)
            {
                out.push(' ');
            }
            cursor = token.next;
        }
        out
    }

    /// Tags of the doc comment directly preceding `id`, if there is one.
    /// Each tag maps to the values of its occurrences in order.
    pub fn doc_tags_before(&self, id: TokenId) -> BTreeMap<String, Vec<String>> {
        let trivia = match self.prev(id) {
            Some(prev) => &self.get(prev).hidden_after,
            None => &self.leading,
        };
        let Some(doc) = trivia
            .iter()
            .rev()
            .find(|t| t.kind.is_comment())
            .filter(|t| t.text.starts_with("/**"))
        else {
            return BTreeMap::new();
        };
        parse_doc_tags(&doc.text)
    }
}

static DOC_TAG: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^@([A-Za-z][\w.\-]*)\s*(.*)$").expect("valid doc tag regex"));

fn parse_doc_tags(comment: &str) -> BTreeMap<String, Vec<String>> {
    let body = comment
        .trim_start_matches("/**")
        .trim_end_matches("*/");
    let mut tags: BTreeMap<String, Vec<String>> = BTreeMap::new();
    for line in body.lines() {
        let line = line.trim().trim_start_matches('*').trim();
        if let Some(caps) = DOC_TAG.captures(line) {
            tags.entry(caps[1].to_owned())
                .or_default()
                .push(caps[2].trim().to_owned());
        }
    }
    tags
}

#[cfg(test)]
mod tests {
    use super::*;

    fn list_of(words: &[(&str, &str)]) -> (TokenList, Vec<TokenId>) {
        let mut list = TokenList::new();
        let mut ids = Vec::new();
        let mut tail = None;
        for (i, (text, trailing)) in words.iter().enumerate() {
            let mut token = Token::new(TokenKind::Ident, *text, 1, (i * 4 + 1) as u32);
            if !trailing.is_empty() {
                let kind = if trailing.starts_with("/*") {
                    TokenKind::BlockComment
                } else {
                    TokenKind::Whitespace
                };
                token.hidden_after.push(Trivia {
                    kind,
                    text: (*trailing).into(),
                    line: 1,
                    column: 1,
                });
            }
            let id = list.append(tail, token);
            ids.push(id);
            tail = Some(id);
        }
        (list, ids)
    }

    #[test]
    fn append_links_both_directions() {
        let (list, ids) = list_of(&[("a", " "), ("b", "")]);
        let order: Vec<&str> = list.iter().map(|id| list.text(id)).collect();
        assert_eq!(order, vec!["a", "b"]);
        assert_eq!(list.head(), Some(ids[0]));
        assert_eq!(list.prev(ids[1]), Some(ids[0]));
        assert_eq!(list.next(ids[1]), None);
        assert_eq!(list.get(ids[0]).hidden_after.len(), 1);
    }

    #[test]
    fn normalised_sequence_collapses_whitespace_and_drops_comments() {
        let (list, ids) = list_of(&[("public", "  \n\t"), ("void", "/* x */"), ("run", "")]);
        assert_eq!(list.normalised_sequence(ids[0], ids[2]), "public voidrun");
        assert_eq!(list.normalised_sequence(ids[1], ids[1]), "void");
    }

    #[test]
    fn doc_tags_are_collected() {
        let mut list = TokenList::new();
        list.push_leading(Trivia {
            kind: TokenKind::BlockComment,
            text: "/**\n * Adds.\n * @test\n * @param a first\n * @param b second\n */".into(),
            line: 1,
            column: 1,
        });
        let id = list.append(None, Token::new(TokenKind::Modifier, "public", 7, 1));
        let tags = list.doc_tags_before(id);
        assert_eq!(tags.get("test"), Some(&vec![String::new()]));
        assert_eq!(
            tags.get("param"),
            Some(&vec!["a first".to_string(), "b second".to_string()])
        );
    }

    #[test]
    fn plain_block_comment_has_no_tags() {
        let (list, ids) = list_of(&[("a", "/* @test */"), ("b", "")]);
        assert!(list.doc_tags_before(ids[1]).is_empty());
    }

    #[test]
    fn end_position_tracks_newlines() {
        let token = Token::new(TokenKind::TextBlock, "\"\"\"\nab\n  cd\"\"\"", 3, 10);
        assert_eq!((token.end_line, token.end_column), (5, 7));
        let single = Token::new(TokenKind::Ident, "name", 1, 5);
        assert_eq!((single.end_line, single.end_column), (1, 8));
    }
}
