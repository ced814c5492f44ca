//! Token-stream filter.
//!
//! Sits between the raw lexer and the recognizer. Significant tokens are
//! linked into the [`TokenList`]; whitespace and comments are hidden on the
//! token they follow. After recognition the filter walks the list twice:
//! once to resolve emitters (interleaved with the directives found in
//! comments) and once to write the instrumented text.

use std::collections::BTreeSet;
use std::io::BufRead;
use std::path::{Path, PathBuf};

use logos::Logos;
use tracing::{debug, warn};

use crate::config::InstrumentationConfig;
use crate::detect::TestDetector;
use crate::emitter::{EmitterList, Placement};
use crate::error::Error;
use crate::lexer::TokenKind;
use crate::recorder::RUNTIME_VERSION;
use crate::registry::Session;
use crate::state::InstrumentationState;
use crate::token::{Token, TokenId, TokenList, Trivia};

/// Start of every instrumented file.
pub const MARKER_PREFIX: &str = "/* $$ This file has been instrumented by Stitch";

/// Introduces an in-source directive inside a comment.
pub const DIRECTIVE_PREFIX: &str = "STITCH:";

pub fn marker() -> String {
    format!(
        "{MARKER_PREFIX} {}#{RUNTIME_VERSION} $$ */",
        env!("CARGO_PKG_VERSION")
    )
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Directive {
    On,
    Off,
    Flush,
    Void,
    Yield,
}

const DIRECTIVES: &[(&str, Directive)] = &[
    ("ON", Directive::On),
    ("OFF", Directive::Off),
    ("FLUSH", Directive::Flush),
    ("VOID", Directive::Void),
    ("YIELD", Directive::Yield),
];

/// Every directive in `comment`, left to right, with the line it sits on.
/// `line` is the line the comment starts on. Unknown keywords are logged
/// and skipped.
pub fn scan_directives(comment: &str, line: u32) -> Vec<(Directive, u32)> {
    let mut found = Vec::new();
    let mut rest = comment;
    let mut line = line;
    while let Some(at) = rest.find(DIRECTIVE_PREFIX) {
        line += count_line_breaks(&rest[..at]);
        rest = &rest[at + DIRECTIVE_PREFIX.len()..];
        let word_len = rest
            .find(|c: char| !c.is_ascii_alphanumeric() && c != '_')
            .unwrap_or(rest.len());
        let word = &rest[..word_len];
        match DIRECTIVES.iter().find(|(name, _)| *name == word) {
            Some(&(_, directive)) => found.push((directive, line)),
            None => warn!(line, directive = word, "ignoring unknown directive"),
        }
        rest = &rest[word_len..];
    }
    found
}

/// Line breaks in `text`; `\r\n` counts once.
fn count_line_breaks(text: &str) -> u32 {
    let mut count = 0;
    let mut chars = text.chars().peekable();
    while let Some(c) = chars.next() {
        match c {
            '\n' => count += 1,
            '\r' => {
                if chars.peek() == Some(&'\n') {
                    chars.next();
                }
                count += 1;
            }
            _ => {}
        }
    }
    count
}

/// Fail if `reader` starts with the instrumentation marker. Nothing is
/// consumed, so the caller reads the source from its first byte.
pub fn guard_against_double_instrumentation<R: BufRead>(
    path: &Path,
    reader: &mut R,
) -> Result<(), Error> {
    let head = reader.fill_buf()?;
    if head.starts_with(MARKER_PREFIX.as_bytes()) {
        return Err(Error::DoubleInstrumentation {
            path: path.to_path_buf(),
        });
    }
    Ok(())
}

pub struct TokenStreamFilter<'src> {
    path: PathBuf,
    source: &'src str,
    lexer: logos::Lexer<'src, TokenKind>,
    line: u32,
    column: u32,
    list: TokenList,
    tail: Option<TokenId>,
    eof: Option<TokenId>,
    emitters: EmitterList,
}

impl<'src> TokenStreamFilter<'src> {
    pub fn new(path: impl Into<PathBuf>, source: &'src str) -> Self {
        Self {
            path: path.into(),
            source,
            lexer: TokenKind::lexer(source),
            line: 1,
            column: 1,
            list: TokenList::new(),
            tail: None,
            eof: None,
            emitters: EmitterList::new(),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn list(&self) -> &TokenList {
        &self.list
    }

    pub fn emitters(&self) -> &EmitterList {
        &self.emitters
    }

    pub fn emitters_mut(&mut self) -> &mut EmitterList {
        &mut self.emitters
    }

    /// Move the line/column cursor past `text`.
    fn advance(&mut self, text: &str) {
        let mut chars = text.chars().peekable();
        while let Some(c) = chars.next() {
            match c {
                '\n' => {
                    self.line += 1;
                    self.column = 1;
                }
                '\r' => {
                    if chars.peek() == Some(&'\n') {
                        chars.next();
                    }
                    self.line += 1;
                    self.column = 1;
                }
                _ => self.column += 1,
            }
        }
    }

    /// The real tail: the remembered one, or whatever has been linked
    /// after it since.
    fn true_tail(&self) -> Option<TokenId> {
        let mut tail = self.tail?;
        while let Some(next) = self.list.next(tail) {
            tail = next;
        }
        Some(tail)
    }

    /// Pull the next significant token from the lexer and link it at the
    /// tail. Trivia met on the way are hidden on the token they follow.
    /// Once the input is exhausted this keeps returning the `Eof` token.
    pub fn next_token(&mut self) -> Result<TokenId, Error> {
        if let Some(eof) = self.eof {
            return Ok(eof);
        }
        loop {
            let (line, column) = (self.line, self.column);
            let Some(result) = self.lexer.next() else {
                let tail = self.true_tail();
                let id = self.list.append(tail, Token::new(TokenKind::Eof, "", line, column));
                self.tail = Some(id);
                self.eof = Some(id);
                return Ok(id);
            };
            let text = self.lexer.slice();
            let kind = result.map_err(|()| Error::Parse {
                path: self.path.clone(),
                line,
                column,
                message: format!("unexpected character {:?}", text.chars().next().unwrap_or(' ')),
            })?;
            self.advance(text);

            if kind.is_trivia() {
                let trivia = Trivia {
                    kind,
                    text: text.to_owned(),
                    line,
                    column,
                };
                match self.true_tail() {
                    Some(tail) => self.list.get_mut(tail).hidden_after.push(trivia),
                    None => self.list.push_leading(trivia),
                }
                continue;
            }

            let tail = self.true_tail();
            let id = self.list.append(tail, Token::new(kind, text, line, column));
            self.tail = Some(id);
            return Ok(id);
        }
    }

    /// The token after `id`, pulling from the lexer when `id` is the tail.
    /// `Eof` is its own successor.
    pub fn successor(&mut self, id: TokenId) -> Result<TokenId, Error> {
        if let Some(next) = self.list.next(id) {
            return Ok(next);
        }
        if self.eof == Some(id) {
            return Ok(id);
        }
        self.next_token()
    }

    /// Pull everything that is left.
    pub fn drain(&mut self) -> Result<TokenId, Error> {
        loop {
            let id = self.next_token()?;
            if self.eof == Some(id) {
                return Ok(id);
            }
        }
    }

    /// Resolve walk. Directives in the comments before the first token are
    /// applied first; then every token's emitters are initialized (pre,
    /// then post, in attachment order) followed by the directives in the
    /// token's trailing trivia. Returns whether any probe was produced.
    pub fn instrument(
        &mut self,
        session: &mut Session,
        config: &InstrumentationConfig,
        detector: &dyn TestDetector,
        package: &str,
        file_index: usize,
    ) -> Result<bool, Error> {
        self.drain()?;
        let path = self.path.clone();
        let mut state =
            InstrumentationState::new(session, config, detector, &path, package, file_index);

        for trivia in self.list.leading() {
            apply_directives(trivia, &mut state)?;
        }
        let mut cursor = self.list.head();
        while let Some(id) = cursor {
            for placement in [Placement::Pre, Placement::Post] {
                let count = match placement {
                    Placement::Pre => self.emitters.pre(id).len(),
                    Placement::Post => self.emitters.post(id).len(),
                };
                for i in 0..count {
                    let emitter = match placement {
                        Placement::Pre => self.emitters.pre(id)[i],
                        Placement::Post => self.emitters.post(id)[i],
                    };
                    self.emitters.init(emitter, &mut state)?;
                }
            }
            for trivia in &self.list.get(id).hidden_after {
                apply_directives(trivia, &mut state)?;
            }
            cursor = self.list.next(id);
        }
        Ok(state.is_dirty())
    }

    /// Write walk: the marker, then the source with emitter text around
    /// each token.
    pub fn write<W: std::fmt::Write>(&self, out: &mut W) -> std::fmt::Result {
        out.write_str(&marker())?;
        for trivia in self.list.leading() {
            out.write_str(&trivia.text)?;
        }
        for id in self.list.iter() {
            let token = self.list.get(id);
            out.write_str(&self.emitters.text_at(id, Placement::Pre))?;
            if token.kind != TokenKind::Eof {
                out.write_str(&token.text)?;
            }
            out.write_str(&self.emitters.text_at(id, Placement::Post))?;
            for trivia in &token.hidden_after {
                out.write_str(&trivia.text)?;
            }
        }
        Ok(())
    }

    /// Trivia that close the file, after the last significant token.
    fn trailing_trivia(&self) -> &[Trivia] {
        let last = self
            .list
            .iter()
            .filter(|&id| self.list.kind(id) != TokenKind::Eof)
            .last();
        match last {
            Some(id) => &self.list.get(id).hidden_after,
            None => self.list.leading(),
        }
    }

    /// Whether the source ends with a line break.
    pub fn is_eol_terminated(&self) -> bool {
        self.trailing_trivia()
            .last()
            .is_some_and(|t| t.text.ends_with('\n') || t.text.ends_with('\r'))
    }

    pub fn line_count(&self) -> u32 {
        if self.source.is_empty() {
            return 0;
        }
        let lines = count_line_breaks(self.source) + 1;
        if self.is_eol_terminated() {
            lines - 1
        } else {
            lines
        }
    }

    /// Lines holding at least one significant token.
    pub fn ncloc(&self) -> u32 {
        let mut lines = BTreeSet::new();
        for id in self.list.iter() {
            let token = self.list.get(id);
            if token.kind == TokenKind::Eof {
                continue;
            }
            lines.extend(token.line..=token.end_line);
        }
        lines.len() as u32
    }
}

fn apply_directives(trivia: &Trivia, state: &mut InstrumentationState<'_>) -> Result<(), Error> {
    if !trivia.kind.is_comment() {
        return Ok(());
    }
    for (directive, line) in scan_directives(&trivia.text, trivia.line) {
        debug!(?directive, line, "directive");
        match directive {
            Directive::On => state.set_enabled(true),
            Directive::Off => state.set_enabled(false),
            Directive::Flush => state.set_needs_flush(),
            Directive::Yield => state.set_needs_yield(),
            Directive::Void => {
                let lambda = state
                    .session
                    .current_method()
                    .filter(|&m| state.session.method(m).is_some_and(|m| m.is_lambda));
                match lambda {
                    Some(m) => state.session.set_void_return(m)?,
                    None => warn!(line, "VOID directive outside a lambda is ignored"),
                }
            }
        }
    }
    Ok(())
}
