//! Structural recognizer.
//!
//! A small recursive descent over the declaration and statement grammar of
//! the source language. It pulls tokens from the filter on demand and
//! attaches emitters where probes belong; it never writes text itself.
//!
//! Expressions are not parsed. They are scanned for the constructs that
//! carry their own emitters: lambdas, conditional operators, anonymous
//! class bodies, array initializers and switch expressions.

use crate::analysis::ExpressionInfo;
use crate::context::{Builtin, ContextNode, ContextTree};
use crate::emitter::{CaseForm, EmitterId, EmitterKind, LambdaForm, Placement};
use crate::error::Error;
use crate::filter::TokenStreamFilter;
use crate::lexer::TokenKind;
use crate::registry::SourceRegion;
use crate::signature::{Annotation, MethodSignature, Modifiers, Parameter, TypeKind, TypeSignature};
use crate::token::TokenId;

/// A method header, for regex context matching.
#[derive(Debug, Clone, Copy)]
pub struct MethodMarker {
    pub start: TokenId,
    pub header_end: TokenId,
    pub entry: EmitterId,
}

#[derive(Debug, Clone, Copy)]
pub struct StatementMarker {
    pub start: TokenId,
    pub end: TokenId,
    pub probe: EmitterId,
}

#[derive(Debug, Default)]
pub struct FileStructure {
    pub package: String,
    pub methods: Vec<MethodMarker>,
    pub statements: Vec<StatementMarker>,
}

const STATEMENT_END: &[TokenKind] = &[TokenKind::Semi];
const GROUP_END: &[TokenKind] = &[TokenKind::RParen];
const INDEX_END: &[TokenKind] = &[TokenKind::RBracket];
const ELEMENT_END: &[TokenKind] = &[TokenKind::Comma, TokenKind::RBrace];
const RESOURCE_END: &[TokenKind] = &[TokenKind::Semi, TokenKind::RParen];
const FOREACH_VAR_END: &[TokenKind] = &[TokenKind::Colon];
const LAMBDA_BODY_END: &[TokenKind] = &[
    TokenKind::Semi,
    TokenKind::Comma,
    TokenKind::RParen,
    TokenKind::RBracket,
    TokenKind::RBrace,
    TokenKind::Colon,
];

pub struct Recognizer<'a, 'src> {
    filter: &'a mut TokenStreamFilter<'src>,
    tree: &'a mut ContextTree,
    cur: TokenId,
    structure: FileStructure,
    lambda_count: u32,
    /// Complexity owed to the next statement by the `case` labels before it.
    case_complexity: u32,
}

impl<'a, 'src> Recognizer<'a, 'src> {
    pub fn new(
        filter: &'a mut TokenStreamFilter<'src>,
        tree: &'a mut ContextTree,
    ) -> Result<Self, Error> {
        let cur = match filter.list().head() {
            Some(head) => head,
            None => filter.next_token()?,
        };
        Ok(Self {
            filter,
            tree,
            cur,
            structure: FileStructure::default(),
            lambda_count: 0,
            case_complexity: 0,
        })
    }

    /// Recognize the whole compilation unit.
    pub fn recognize(mut self) -> Result<FileStructure, Error> {
        let root = self.tree.root();
        loop {
            match self.kind(self.cur) {
                TokenKind::Eof => break,
                TokenKind::Semi => {
                    self.bump()?;
                }
                TokenKind::Import => {
                    self.skip_past(TokenKind::Semi)?;
                }
                TokenKind::Ident if matches!(self.text(self.cur), "module" | "open") => {
                    // Module descriptors hold no code.
                    self.filter.drain()?;
                    break;
                }
                _ => {
                    let start = self.cur;
                    let modifiers = self.modifiers()?;
                    if self.at(TokenKind::Package) {
                        self.bump()?;
                        let name_start = self.cur;
                        let semi = self.skip_past(TokenKind::Semi)?;
                        let name_end = self.filter.list().prev(semi).unwrap_or(name_start);
                        self.structure.package = self.join(name_start, name_end);
                    } else if self.type_decl_ahead(self.cur)? {
                        self.type_decl(modifiers, start, true, root)?;
                    } else {
                        return Err(self.error(self.cur, "expected a type declaration"));
                    }
                }
            }
        }
        Ok(self.structure)
    }

    // ---- token access ----

    fn kind(&self, id: TokenId) -> TokenKind {
        self.filter.list().kind(id)
    }

    fn text(&self, id: TokenId) -> &str {
        self.filter.list().text(id)
    }

    fn at(&self, kind: TokenKind) -> bool {
        self.kind(self.cur) == kind
    }

    fn at_word(&self, word: &str) -> bool {
        self.at(TokenKind::Ident) && self.text(self.cur) == word
    }

    fn nth(&mut self, n: usize) -> Result<TokenId, Error> {
        let mut id = self.cur;
        for _ in 0..n {
            id = self.filter.successor(id)?;
        }
        Ok(id)
    }

    fn nth_kind(&mut self, n: usize) -> Result<TokenKind, Error> {
        let id = self.nth(n)?;
        Ok(self.kind(id))
    }

    fn bump(&mut self) -> Result<TokenId, Error> {
        let id = self.cur;
        self.cur = self.filter.successor(id)?;
        Ok(id)
    }

    fn expect(&mut self, kind: TokenKind, what: &str) -> Result<TokenId, Error> {
        if self.at(kind) {
            self.bump()
        } else {
            Err(self.error(self.cur, &format!("expected {what}")))
        }
    }

    fn error(&self, id: TokenId, message: &str) -> Error {
        let token = self.filter.list().get(id);
        let found = if token.kind == TokenKind::Eof {
            "end of file".to_owned()
        } else {
            format!("`{}`", token.text)
        };
        Error::Parse {
            path: self.filter.path().to_path_buf(),
            line: token.line,
            column: token.column,
            message: format!("{message}, found {found}"),
        }
    }

    fn not_eof(&self) -> Result<(), Error> {
        if self.at(TokenKind::Eof) {
            Err(self.error(self.cur, "unexpected end of file"))
        } else {
            Ok(())
        }
    }

    /// Consume up to and including the next `kind` at nesting depth zero.
    fn skip_past(&mut self, kind: TokenKind) -> Result<TokenId, Error> {
        let mut depth = 0i32;
        loop {
            self.not_eof()?;
            let k = self.kind(self.cur);
            if depth == 0 && k == kind {
                return self.bump();
            }
            match k {
                TokenKind::LParen | TokenKind::LBrace | TokenKind::LBracket => depth += 1,
                TokenKind::RParen | TokenKind::RBrace | TokenKind::RBracket => depth -= 1,
                _ => {}
            }
            self.bump()?;
        }
    }

    /// Consume a balanced `open ... close` group starting at the cursor.
    fn skip_group(&mut self, open: TokenKind, close: TokenKind) -> Result<TokenId, Error> {
        let mut depth = 0u32;
        loop {
            self.not_eof()?;
            let k = self.kind(self.cur);
            let id = self.bump()?;
            if k == open {
                depth += 1;
            } else if k == close {
                depth = depth.saturating_sub(1);
                if depth == 0 {
                    return Ok(id);
                }
            }
        }
    }

    /// Look ahead from `open` to its matching `close` without moving.
    fn matching_ahead(
        &mut self,
        open: TokenId,
        open_kind: TokenKind,
        close_kind: TokenKind,
    ) -> Result<Option<TokenId>, Error> {
        let mut depth = 0u32;
        let mut id = open;
        loop {
            let k = self.kind(id);
            if k == TokenKind::Eof {
                return Ok(None);
            }
            if k == open_kind {
                depth += 1;
            } else if k == close_kind {
                depth = depth.saturating_sub(1);
                if depth == 0 {
                    return Ok(Some(id));
                }
            }
            id = self.filter.successor(id)?;
        }
    }

    /// Consume `<...>` type arguments. `>>` and `>>>` close several levels.
    fn skip_type_args(&mut self) -> Result<TokenId, Error> {
        let mut depth = 0i32;
        loop {
            self.not_eof()?;
            match self.kind(self.cur) {
                TokenKind::Lt => depth += 1,
                TokenKind::Gt => depth -= 1,
                TokenKind::Shr => depth -= 2,
                TokenKind::UShr => depth -= 3,
                _ => {}
            }
            let id = self.bump()?;
            if depth <= 0 {
                return Ok(id);
            }
        }
    }

    /// If the `<` at `lt` opens type arguments, the token closing them.
    fn type_args_ahead(&mut self, lt: TokenId) -> Result<Option<TokenId>, Error> {
        let mut depth = 0i32;
        let mut id = lt;
        loop {
            match self.kind(id) {
                TokenKind::Lt => depth += 1,
                TokenKind::Gt => depth -= 1,
                TokenKind::Shr => depth -= 2,
                TokenKind::UShr => depth -= 3,
                TokenKind::Ident
                | TokenKind::Dot
                | TokenKind::Comma
                | TokenKind::Question
                | TokenKind::Extends
                | TokenKind::Super
                | TokenKind::LBracket
                | TokenKind::RBracket
                | TokenKind::Amp
                | TokenKind::Primitive
                | TokenKind::At => {}
                _ => return Ok(None),
            }
            if depth == 0 {
                return Ok(Some(id));
            }
            if depth < 0 {
                return Ok(None);
            }
            id = self.filter.successor(id)?;
        }
    }

    /// Source text of `start..=end` with single spaces between words.
    fn join(&self, start: TokenId, end: TokenId) -> String {
        let list = self.filter.list();
        let mut out = String::new();
        let mut prev_word = false;
        let mut cursor = Some(start);
        while let Some(id) = cursor {
            let text = list.text(id);
            let word = text
                .chars()
                .next()
                .is_some_and(|c| c.is_alphanumeric() || c == '_' || c == '$');
            if (word && prev_word) || out.ends_with(',') {
                out.push(' ');
            }
            out.push_str(text);
            prev_word = word;
            if id == end {
                break;
            }
            cursor = list.next(id);
        }
        out
    }

    fn region(&self, start: TokenId, end: TokenId) -> SourceRegion {
        let list = self.filter.list();
        let (s, e) = (list.get(start), list.get(end));
        SourceRegion::new(s.line, s.column, e.end_line, e.end_column)
    }

    fn push(
        &mut self,
        anchor: TokenId,
        placement: Placement,
        kind: EmitterKind,
        node: ContextNode,
        region: SourceRegion,
    ) -> EmitterId {
        let context = self.tree.set(node);
        self.filter
            .emitters_mut()
            .push(anchor, placement, kind, context, region)
    }

    // ---- declarations ----

    /// Modifier keywords and annotations, with the doc tags of the comment
    /// before them.
    fn modifiers(&mut self) -> Result<Modifiers, Error> {
        let mut modifiers = Modifiers {
            doc_tags: self.filter.list().doc_tags_before(self.cur),
            ..Default::default()
        };
        loop {
            match self.kind(self.cur) {
                TokenKind::Modifier => {
                    let id = self.bump()?;
                    modifiers.keywords.push(self.text(id).to_owned());
                }
                TokenKind::Synchronized | TokenKind::Default
                    if !matches!(
                        self.nth_kind(1)?,
                        TokenKind::LParen | TokenKind::Colon | TokenKind::Arrow
                    ) =>
                {
                    let id = self.bump()?;
                    modifiers.keywords.push(self.text(id).to_owned());
                }
                TokenKind::Ident if self.at_word("sealed") && self.modifier_follows(1)? => {
                    self.bump()?;
                    modifiers.keywords.push("sealed".into());
                }
                TokenKind::Ident
                    if self.at_word("non")
                        && self.nth_kind(1)? == TokenKind::Minus
                        && self.modifier_follows(3)? =>
                {
                    for _ in 0..3 {
                        self.bump()?;
                    }
                    modifiers.keywords.push("non-sealed".into());
                }
                TokenKind::At if self.nth_kind(1)? != TokenKind::Interface => {
                    modifiers.annotations.push(self.annotation()?);
                }
                _ => break,
            }
        }
        Ok(modifiers)
    }

    /// Whether the token `n` ahead continues a declaration header.
    fn modifier_follows(&mut self, n: usize) -> Result<bool, Error> {
        let id = self.nth(n)?;
        Ok(match self.kind(id) {
            TokenKind::Modifier | TokenKind::Class | TokenKind::Interface | TokenKind::At => true,
            TokenKind::Ident => self.text(id) == "record",
            _ => false,
        })
    }

    fn annotation(&mut self) -> Result<Annotation, Error> {
        self.expect(TokenKind::At, "`@`")?;
        let name_start = self.expect(TokenKind::Ident, "an annotation name")?;
        let mut name_end = name_start;
        while self.at(TokenKind::Dot) && self.nth_kind(1)? == TokenKind::Ident {
            self.bump()?;
            name_end = self.bump()?;
        }
        let name = self.join(name_start, name_end);
        let mut args = String::new();
        if self.at(TokenKind::LParen) {
            let open = self.cur;
            let close = self.skip_group(TokenKind::LParen, TokenKind::RParen)?;
            if let Some(first) = self.filter.list().next(open)
                && first != close
            {
                let last = self.filter.list().prev(close).unwrap_or(first);
                args = self.join(first, last);
            }
        }
        Ok(Annotation { name, args })
    }

    /// Whether a type declaration starts at `from`, past any modifiers.
    fn type_decl_ahead(&mut self, from: TokenId) -> Result<bool, Error> {
        let mut id = from;
        loop {
            match self.kind(id) {
                TokenKind::Class | TokenKind::Interface | TokenKind::Enum => return Ok(true),
                TokenKind::Modifier => {}
                TokenKind::Ident if matches!(self.text(id), "sealed" | "non") => {
                    if self.text(id) == "non" {
                        id = self.filter.successor(id)?;
                        id = self.filter.successor(id)?;
                    }
                }
                TokenKind::Ident if self.text(id) == "record" => {
                    let name = self.filter.successor(id)?;
                    let after = self.filter.successor(name)?;
                    return Ok(self.kind(name) == TokenKind::Ident
                        && matches!(self.kind(after), TokenKind::LParen | TokenKind::Lt));
                }
                TokenKind::At => {
                    let next = self.filter.successor(id)?;
                    if self.kind(next) == TokenKind::Interface {
                        return Ok(true);
                    }
                    // Skip the annotation name and arguments.
                    id = next;
                    loop {
                        let after = self.filter.successor(id)?;
                        if self.kind(after) == TokenKind::Dot {
                            id = self.filter.successor(after)?;
                        } else {
                            break;
                        }
                    }
                    let after = self.filter.successor(id)?;
                    if self.kind(after) == TokenKind::LParen {
                        match self.matching_ahead(after, TokenKind::LParen, TokenKind::RParen)? {
                            Some(close) => id = close,
                            None => return Ok(false),
                        }
                    }
                }
                _ => return Ok(false),
            }
            id = self.filter.successor(id)?;
        }
    }

    /// A comma separated list of types, up to `{` or a header keyword.
    fn type_list(&mut self) -> Result<Vec<String>, Error> {
        let mut types = vec![self.parse_type()?];
        while self.at(TokenKind::Comma) {
            self.bump()?;
            types.push(self.parse_type()?);
        }
        Ok(types)
    }

    fn parse_type(&mut self) -> Result<String, Error> {
        while self.at(TokenKind::At) {
            self.annotation()?;
        }
        let start = self.cur;
        if !matches!(
            self.kind(self.cur),
            TokenKind::Ident | TokenKind::Primitive | TokenKind::Void
        ) {
            return Err(self.error(self.cur, "expected a type"));
        }
        let mut end = self.bump()?;
        loop {
            if self.at(TokenKind::Lt) {
                end = self.skip_type_args()?;
            } else if self.at(TokenKind::Dot) && self.nth_kind(1)? == TokenKind::Ident {
                self.bump()?;
                end = self.bump()?;
            } else {
                break;
            }
        }
        while self.at(TokenKind::LBracket) && self.nth_kind(1)? == TokenKind::RBracket {
            self.bump()?;
            end = self.bump()?;
        }
        if self.at(TokenKind::Ellipsis) {
            end = self.bump()?;
        }
        Ok(self.join(start, end))
    }

    /// Type declaration at the cursor (modifiers already consumed). Returns
    /// the closing brace of the body.
    fn type_decl(
        &mut self,
        modifiers: Modifiers,
        start: TokenId,
        top_level: bool,
        node: ContextNode,
    ) -> Result<TokenId, Error> {
        let kind = match self.kind(self.cur) {
            TokenKind::Class => TypeKind::Class,
            TokenKind::Interface => TypeKind::Interface,
            TokenKind::Enum => TypeKind::Enum,
            TokenKind::At => {
                self.bump()?;
                TypeKind::Annotation
            }
            _ if self.at_word("record") => TypeKind::Record,
            _ => return Err(self.error(self.cur, "expected a type declaration")),
        };
        self.bump()?;
        let name_tok = self.expect(TokenKind::Ident, "a type name")?;
        let name = self.text(name_tok).to_owned();
        if self.at(TokenKind::Lt) {
            self.skip_type_args()?;
        }
        if kind == TypeKind::Record && self.at(TokenKind::LParen) {
            self.skip_group(TokenKind::LParen, TokenKind::RParen)?;
        }

        let mut superclass = None;
        let mut interfaces = Vec::new();
        loop {
            if self.at(TokenKind::Extends) {
                self.bump()?;
                let types = self.type_list()?;
                if kind == TypeKind::Interface {
                    interfaces.extend(types);
                } else {
                    superclass = types.into_iter().next();
                }
            } else if self.at(TokenKind::Implements) {
                self.bump()?;
                interfaces.extend(self.type_list()?);
            } else if self.at_word("permits") {
                self.bump()?;
                self.type_list()?;
            } else {
                break;
            }
        }

        let open = self.expect(TokenKind::LBrace, "`{`")?;
        let node = if modifiers.is_deprecated() {
            self.tree.enter(node, Builtin::Deprecated)
        } else {
            node
        };
        let signature = TypeSignature {
            name: name.clone(),
            kind,
            modifiers,
            superclass,
            interfaces,
        };
        let header = self.region(start, open);
        let entry = self.push(
            open,
            Placement::Post,
            EmitterKind::ClassEntry {
                signature,
                top_level,
            },
            node,
            header,
        );
        // The recorder leads the body so it is initialized before any
        // static initializer runs. Enum constants must come first, so the
        // enum holder class goes at the end instead.
        let mut recorder = (top_level && kind != TypeKind::Enum).then(|| {
            self.push(
                open,
                Placement::Post,
                EmitterKind::Recorder {
                    enum_terminator: false,
                },
                node,
                header,
            )
        });

        let (close, terminated) = self.class_body(kind, &name, node)?;
        let region = self.region(start, close);
        if top_level && kind == TypeKind::Enum {
            recorder = Some(self.push(
                close,
                Placement::Pre,
                EmitterKind::Recorder {
                    enum_terminator: !terminated,
                },
                node,
                region,
            ));
        }
        self.push(
            close,
            Placement::Pre,
            EmitterKind::ClassExit { entry, recorder },
            node,
            region,
        );
        self.filter.emitters_mut().set_region(entry, region);
        Ok(close)
    }

    /// Members up to and including the closing brace. The flag reports
    /// whether an enum's constant list was closed with `;`.
    fn class_body(
        &mut self,
        kind: TypeKind,
        name: &str,
        node: ContextNode,
    ) -> Result<(TokenId, bool), Error> {
        let mut terminated = true;
        if kind == TypeKind::Enum {
            terminated = false;
            loop {
                self.not_eof()?;
                if self.at(TokenKind::RBrace) {
                    break;
                }
                if self.at(TokenKind::Semi) {
                    self.bump()?;
                    terminated = true;
                    break;
                }
                self.modifiers()?;
                self.expect(TokenKind::Ident, "an enum constant")?;
                if self.at(TokenKind::LParen) {
                    self.bump()?;
                    self.scan_expression(GROUP_END, node)?;
                    self.expect(TokenKind::RParen, "`)`")?;
                }
                if self.at(TokenKind::LBrace) {
                    self.anonymous_body(node)?;
                }
                if self.at(TokenKind::Comma) {
                    self.bump()?;
                }
            }
        }
        while !self.at(TokenKind::RBrace) {
            self.not_eof()?;
            self.member(name, kind, node)?;
        }
        Ok((self.bump()?, terminated))
    }

    fn anonymous_body(&mut self, node: ContextNode) -> Result<TokenId, Error> {
        self.expect(TokenKind::LBrace, "`{`")?;
        Ok(self.class_body(TypeKind::Class, "", node)?.0)
    }

    fn member(&mut self, class_name: &str, kind: TypeKind, node: ContextNode) -> Result<(), Error> {
        let start = self.cur;
        match self.kind(start) {
            TokenKind::Semi => {
                self.bump()?;
                return Ok(());
            }
            TokenKind::LBrace => {
                self.initializer(Builtin::Instance, node)?;
                return Ok(());
            }
            TokenKind::Modifier
                if self.text(start) == "static" && self.nth_kind(1)? == TokenKind::LBrace =>
            {
                self.bump()?;
                self.initializer(Builtin::Static, node)?;
                return Ok(());
            }
            _ => {}
        }

        let modifiers = self.modifiers()?;
        if self.type_decl_ahead(self.cur)? {
            self.type_decl(modifiers, start, false, node)?;
            return Ok(());
        }
        let type_params = if self.at(TokenKind::Lt) {
            let lt = self.cur;
            let gt = self.skip_type_args()?;
            self.join(lt, gt)
        } else {
            String::new()
        };

        if !class_name.is_empty() && self.at_word(class_name) {
            let next = self.nth_kind(1)?;
            let compact = next == TokenKind::LBrace && kind == TypeKind::Record;
            if next == TokenKind::LParen || compact {
                let header = MethodHeader {
                    modifiers,
                    start,
                    type_params,
                    return_type: None,
                };
                return self.method(header, true, node);
            }
        }

        let return_type = self.parse_type()?;
        if self.at(TokenKind::Ident) && self.nth_kind(1)? == TokenKind::LParen {
            let header = MethodHeader {
                modifiers,
                start,
                type_params,
                return_type: Some(return_type),
            };
            return self.method(header, false, node);
        }

        // Field declarators, possibly with initializers.
        self.scan_expression(STATEMENT_END, node)?;
        self.expect(TokenKind::Semi, "`;`")?;
        Ok(())
    }

    fn initializer(&mut self, builtin: Builtin, node: ContextNode) -> Result<TokenId, Error> {
        let node = self.tree.enter(node, builtin);
        self.expect(TokenKind::LBrace, "`{`")?;
        self.block_statements(node)
    }

    /// Parameters of a method or constructor; the cursor is on `(`.
    fn parameters(&mut self) -> Result<Vec<Parameter>, Error> {
        self.expect(TokenKind::LParen, "`(`")?;
        let mut params = Vec::new();
        while !self.at(TokenKind::RParen) {
            self.not_eof()?;
            self.modifiers()?;
            let ty = self.parse_type()?;
            let name = if self.at(TokenKind::This) {
                self.bump()?;
                "this".to_owned()
            } else {
                let id = self.expect(TokenKind::Ident, "a parameter name")?;
                self.text(id).to_owned()
            };
            while self.at(TokenKind::LBracket) {
                self.bump()?;
                self.expect(TokenKind::RBracket, "`]`")?;
            }
            params.push(Parameter { ty, name });
            if self.at(TokenKind::Comma) {
                self.bump()?;
            }
        }
        self.bump()?;
        Ok(params)
    }

    fn method(&mut self, header: MethodHeader, constructor: bool, node: ContextNode) -> Result<(), Error> {
        let name_tok = self.expect(TokenKind::Ident, "a method name")?;
        let name = self.text(name_tok).to_owned();
        let params = if self.at(TokenKind::LParen) {
            self.parameters()?
        } else {
            Vec::new()
        };
        while self.at(TokenKind::LBracket) {
            self.bump()?;
            self.expect(TokenKind::RBracket, "`]`")?;
        }
        let throws = if self.at(TokenKind::Throws) {
            self.bump()?;
            self.type_list()?
        } else {
            Vec::new()
        };

        match self.kind(self.cur) {
            TokenKind::Semi => {
                self.bump()?;
                return Ok(());
            }
            TokenKind::Default => {
                self.bump()?;
                self.scan_expression(STATEMENT_END, node)?;
                self.expect(TokenKind::Semi, "`;`")?;
                return Ok(());
            }
            _ => {}
        }

        let header_end = self.filter.list().prev(self.cur).unwrap_or(name_tok);
        let open = self.expect(TokenKind::LBrace, "a method body")?;
        let mut method_node = self.tree.enter(
            node,
            if constructor {
                Builtin::Constructor
            } else {
                Builtin::Method
            },
        );
        if header.modifiers.has("private") {
            method_node = self.tree.enter(method_node, Builtin::PrivateMethod);
        }
        if header.modifiers.is_deprecated() {
            method_node = self.tree.enter(method_node, Builtin::Deprecated);
        }

        // The entry probe of a constructor follows an explicit this(..) or
        // super(..) call.
        let mut anchor = open;
        if constructor
            && matches!(self.kind(self.cur), TokenKind::This | TokenKind::Super)
            && self.nth_kind(1)? == TokenKind::LParen
        {
            self.scan_expression(STATEMENT_END, method_node)?;
            anchor = self.expect(TokenKind::Semi, "`;`")?;
        }

        let signature = MethodSignature {
            name: name.clone(),
            modifiers: header.modifiers,
            type_params: header.type_params,
            return_type: header.return_type,
            params,
            throws,
        };
        let getter = signature.params.is_empty()
            && !signature.returns_void()
            && (name.starts_with("get") || name.starts_with("is"));
        let setter =
            signature.params.len() == 1 && signature.returns_void() && name.starts_with("set");

        let start = header.start;
        let entry = self.push(
            anchor,
            Placement::Post,
            EmitterKind::MethodEntry {
                signature,
                constructor,
            },
            method_node,
            self.region(start, open),
        );
        self.structure.methods.push(MethodMarker {
            start,
            header_end,
            entry,
        });

        let statements_before = self.structure.statements.len();
        let close = self.block_statements(method_node)?;
        let region = self.region(start, close);
        self.push(
            close,
            Placement::Pre,
            EmitterKind::MethodExit { entry },
            method_node,
            region,
        );
        self.filter.emitters_mut().set_region(entry, region);
        let single_statement = self.structure.statements.len() - statements_before == 1;
        if !constructor && (getter || setter) && single_statement {
            let emitter = self.filter.emitters_mut().get_mut(entry);
            emitter.context = emitter.context.with(Builtin::PropertyAccessor.index());
        }
        Ok(())
    }

    // ---- statements ----

    /// Statements up to and including the closing brace; the opening brace
    /// has been consumed.
    fn block_statements(&mut self, node: ContextNode) -> Result<TokenId, Error> {
        while !self.at(TokenKind::RBrace) {
            self.not_eof()?;
            self.statement(node, false)?;
        }
        self.bump()
    }

    /// A statement whose body may be unbraced: it gets braces with its probe.
    fn body(&mut self, node: ContextNode) -> Result<TokenId, Error> {
        let wrap = !self.at(TokenKind::LBrace);
        self.statement(node, wrap)
    }

    /// One statement. Returns its last token.
    fn statement(&mut self, node: ContextNode, wrap: bool) -> Result<TokenId, Error> {
        let start = self.cur;
        match self.kind(start) {
            TokenKind::LBrace => {
                self.bump()?;
                return self.block_statements(node);
            }
            TokenKind::Semi => return self.bump(),
            TokenKind::Class
            | TokenKind::Interface
            | TokenKind::Enum
            | TokenKind::Modifier
            | TokenKind::At
            | TokenKind::Ident
                if self.type_decl_ahead(start)? =>
            {
                let modifiers = self.modifiers()?;
                return self.type_decl(modifiers, start, false, node);
            }
            _ => {}
        }

        let complexity = std::mem::take(&mut self.case_complexity);
        let probe = self.push(
            start,
            Placement::Pre,
            EmitterKind::Statement {
                complexity,
                wrap,
                resource: false,
            },
            node,
            self.region(start, start),
        );
        // Labels stay outside the probe so `continue label` still refers
        // to a loop.
        while self.at(TokenKind::Ident) && self.nth_kind(1)? == TokenKind::Colon {
            self.bump()?;
            self.bump()?;
        }
        let end = self.statement_kind(node)?;
        let region = self.region(start, end);
        self.filter.emitters_mut().set_region(probe, region);
        if wrap {
            self.push(
                end,
                Placement::Post,
                EmitterKind::Closing { opener: probe },
                node,
                region,
            );
        }
        self.structure
            .statements
            .push(StatementMarker { start, end, probe });
        Ok(end)
    }

    fn statement_kind(&mut self, node: ContextNode) -> Result<TokenId, Error> {
        match self.kind(self.cur) {
            TokenKind::LBrace => {
                self.bump()?;
                self.block_statements(node)
            }
            TokenKind::Semi => self.bump(),
            TokenKind::If => {
                self.bump()?;
                let if_node = self.tree.enter(node, Builtin::If);
                self.condition(if_node)?;
                let mut end = self.body(if_node)?;
                if self.at(TokenKind::Else) {
                    self.bump()?;
                    let else_node = self.tree.enter(node, Builtin::Else);
                    end = self.body(else_node)?;
                }
                Ok(end)
            }
            TokenKind::While => {
                self.bump()?;
                let while_node = self.tree.enter(node, Builtin::While);
                self.condition(while_node)?;
                self.body(while_node)
            }
            TokenKind::Do => {
                self.bump()?;
                let do_node = self.tree.enter(node, Builtin::Do);
                self.body(do_node)?;
                self.expect(TokenKind::While, "`while`")?;
                self.condition(do_node)?;
                self.expect(TokenKind::Semi, "`;`")
            }
            TokenKind::For => self.for_statement(node),
            TokenKind::Switch => self.switch_construct(node, false),
            TokenKind::Try => self.try_statement(node),
            TokenKind::Synchronized => {
                self.bump()?;
                let sync_node = self.tree.enter(node, Builtin::Sync);
                self.expect(TokenKind::LParen, "`(`")?;
                self.scan_expression(GROUP_END, sync_node)?;
                self.expect(TokenKind::RParen, "`)`")?;
                self.expect(TokenKind::LBrace, "`{`")?;
                self.block_statements(sync_node)
            }
            TokenKind::Assert => {
                self.bump()?;
                let assert_node = self.tree.enter(node, Builtin::Assert);
                self.scan_expression(STATEMENT_END, assert_node)?;
                self.expect(TokenKind::Semi, "`;`")
            }
            _ => {
                self.scan_expression(STATEMENT_END, node)?;
                self.expect(TokenKind::Semi, "`;`")
            }
        }
    }

    /// `( expr )` of an if/while/do, with a branch on the expression.
    fn condition(&mut self, node: ContextNode) -> Result<TokenId, Error> {
        self.expect(TokenKind::LParen, "`(`")?;
        let start = self.cur;
        if let Some(end) = self.scan_expression(GROUP_END, node)? {
            self.branch(start, end, node);
        }
        self.expect(TokenKind::RParen, "`)`")
    }

    fn branch(&mut self, start: TokenId, end: TokenId, node: ContextNode) {
        let info = ExpressionInfo::analyze(self.filter.list(), start, end);
        let region = self.region(start, end);
        let opener = self.push(start, Placement::Pre, EmitterKind::Branch { info }, node, region);
        self.push(end, Placement::Post, EmitterKind::Closing { opener }, node, region);
    }

    /// Whether the `for` header starting after `(` is an enhanced for.
    fn enhanced_for_ahead(&mut self) -> Result<bool, Error> {
        let mut depth = 0i32;
        let mut id = self.cur;
        loop {
            match self.kind(id) {
                TokenKind::Eof | TokenKind::Semi | TokenKind::Question => return Ok(false),
                TokenKind::Colon if depth == 0 => return Ok(true),
                TokenKind::LParen | TokenKind::LBracket | TokenKind::LBrace => depth += 1,
                TokenKind::RParen | TokenKind::RBracket | TokenKind::RBrace => {
                    depth -= 1;
                    if depth < 0 {
                        return Ok(false);
                    }
                }
                _ => {}
            }
            id = self.filter.successor(id)?;
        }
    }

    fn for_statement(&mut self, node: ContextNode) -> Result<TokenId, Error> {
        self.bump()?;
        let for_node = self.tree.enter(node, Builtin::For);
        self.expect(TokenKind::LParen, "`(`")?;
        if self.enhanced_for_ahead()? {
            self.scan_expression(FOREACH_VAR_END, for_node)?;
            self.expect(TokenKind::Colon, "`:`")?;
            self.scan_expression(GROUP_END, for_node)?;
        } else {
            self.scan_expression(STATEMENT_END, for_node)?;
            self.expect(TokenKind::Semi, "`;`")?;
            let start = self.cur;
            if let Some(end) = self.scan_expression(STATEMENT_END, for_node)? {
                self.branch(start, end, for_node);
            }
            self.expect(TokenKind::Semi, "`;`")?;
            self.scan_expression(GROUP_END, for_node)?;
        }
        self.expect(TokenKind::RParen, "`)`")?;
        self.body(for_node)
    }

    fn try_statement(&mut self, node: ContextNode) -> Result<TokenId, Error> {
        self.bump()?;
        let try_node = self.tree.enter(node, Builtin::Try);
        if self.at(TokenKind::LParen) {
            self.bump()?;
            while !self.at(TokenKind::RParen) {
                self.not_eof()?;
                let start = self.cur;
                let probe = self.push(
                    start,
                    Placement::Pre,
                    EmitterKind::Statement {
                        complexity: 0,
                        wrap: false,
                        resource: true,
                    },
                    try_node,
                    self.region(start, start),
                );
                let end = self
                    .scan_expression(RESOURCE_END, try_node)?
                    .ok_or_else(|| self.error(self.cur, "expected a resource"))?;
                let region = self.region(start, end);
                self.filter.emitters_mut().set_region(probe, region);
                self.structure
                    .statements
                    .push(StatementMarker { start, end, probe });
                if self.at(TokenKind::Semi) {
                    self.bump()?;
                }
            }
            self.bump()?;
        }
        self.expect(TokenKind::LBrace, "`{`")?;
        let mut end = self.block_statements(try_node)?;
        while self.at(TokenKind::Catch) {
            self.bump()?;
            let catch_node = self.tree.enter(node, Builtin::Catch);
            self.expect(TokenKind::LParen, "`(`")?;
            self.scan_expression(GROUP_END, catch_node)?;
            self.expect(TokenKind::RParen, "`)`")?;
            self.expect(TokenKind::LBrace, "`{`")?;
            end = self.block_statements(catch_node)?;
        }
        if self.at(TokenKind::Finally) {
            self.bump()?;
            let finally_node = self.tree.enter(node, Builtin::Finally);
            self.expect(TokenKind::LBrace, "`{`")?;
            end = self.block_statements(finally_node)?;
        }
        Ok(end)
    }

    /// A switch statement (`value == false`) or switch expression. Arrow
    /// arms of a switch expression are assumed to yield a value; the
    /// position of the switch is all that is known about it.
    fn switch_construct(&mut self, node: ContextNode, value: bool) -> Result<TokenId, Error> {
        self.expect(TokenKind::Switch, "`switch`")?;
        let switch_node = self.tree.enter(node, Builtin::Switch);
        self.expect(TokenKind::LParen, "`(`")?;
        self.scan_expression(GROUP_END, switch_node)?;
        self.expect(TokenKind::RParen, "`)`")?;
        self.expect(TokenKind::LBrace, "`{`")?;

        while !self.at(TokenKind::RBrace) {
            self.not_eof()?;
            if !matches!(self.kind(self.cur), TokenKind::Case | TokenKind::Default) {
                self.statement(switch_node, false)?;
                continue;
            }
            let label = self.bump()?;
            let separator = self.case_label()?;
            if self.kind(separator) == TokenKind::Colon {
                self.case_complexity += 1;
                continue;
            }

            let case_node = self.tree.enter(switch_node, Builtin::Case);
            match self.kind(self.cur) {
                TokenKind::LBrace => {
                    let open = self.bump()?;
                    let entry = self.push(
                        open,
                        Placement::Post,
                        EmitterKind::CaseEntry {
                            form: CaseForm::Block,
                        },
                        case_node,
                        self.region(label, open),
                    );
                    let close = self.block_statements(case_node)?;
                    let region = self.region(label, close);
                    self.filter.emitters_mut().set_region(entry, region);
                }
                kind => {
                    let form = if kind == TokenKind::Throw {
                        CaseForm::Throw
                    } else {
                        CaseForm::Expression { yield_value: value }
                    };
                    let arm = self.cur;
                    let entry = self.push(
                        arm,
                        Placement::Pre,
                        EmitterKind::CaseEntry { form },
                        case_node,
                        self.region(label, arm),
                    );
                    if form == CaseForm::Throw {
                        self.bump()?;
                    }
                    self.scan_expression(STATEMENT_END, case_node)?;
                    let semi = self.expect(TokenKind::Semi, "`;`")?;
                    let region = self.region(label, semi);
                    self.filter.emitters_mut().set_region(entry, region);
                    self.push(
                        semi,
                        Placement::Post,
                        EmitterKind::CaseExit { entry },
                        case_node,
                        region,
                    );
                }
            }
        }
        self.case_complexity = 0;
        self.bump()
    }

    /// Consume a case label through its `:` or `->`.
    fn case_label(&mut self) -> Result<TokenId, Error> {
        let mut depth = 0i32;
        loop {
            self.not_eof()?;
            match self.kind(self.cur) {
                TokenKind::Colon | TokenKind::Arrow if depth == 0 => return self.bump(),
                TokenKind::LParen | TokenKind::LBracket | TokenKind::LBrace => depth += 1,
                TokenKind::RParen | TokenKind::RBracket | TokenKind::RBrace => depth -= 1,
                _ => {}
            }
            self.bump()?;
        }
    }

    // ---- expressions ----

    /// Scan an expression up to (not including) a token of `stops` at depth
    /// zero. Returns the last token consumed.
    fn scan_expression(
        &mut self,
        stops: &[TokenKind],
        node: ContextNode,
    ) -> Result<Option<TokenId>, Error> {
        let mut last: Option<TokenId> = None;
        // First token of the operand a `?` would test.
        let mut operand: Option<TokenId> = None;
        let mut pending_conditionals = 0u32;

        loop {
            self.not_eof()?;
            let id = self.cur;
            let kind = self.kind(id);
            if stops.contains(&kind) && !(kind == TokenKind::Colon && pending_conditionals > 0) {
                break;
            }
            let item_start = id;
            match kind {
                TokenKind::Colon if pending_conditionals > 0 => {
                    pending_conditionals -= 1;
                    last = Some(self.bump()?);
                    operand = None;
                    continue;
                }
                TokenKind::Question if !self.is_wildcard(id, last)? => {
                    if let (Some(start), Some(end)) = (operand, last) {
                        self.branch(start, end, node);
                    }
                    pending_conditionals += 1;
                    last = Some(self.bump()?);
                    operand = None;
                    continue;
                }
                TokenKind::Assign
                | TokenKind::AssignOp
                | TokenKind::Comma
                | TokenKind::Return
                | TokenKind::Throw => {
                    last = Some(self.bump()?);
                    operand = None;
                    continue;
                }
                TokenKind::Ident if operand.is_none() && self.yield_keyword(id)? => {
                    last = Some(self.bump()?);
                    continue;
                }
                TokenKind::Ident if self.nth_kind(1)? == TokenKind::Arrow => {
                    last = Some(self.lambda(node)?);
                }
                TokenKind::LParen => {
                    let close = self.matching_ahead(id, TokenKind::LParen, TokenKind::RParen)?;
                    let is_lambda = match close {
                        Some(close) => {
                            let after = self.filter.successor(close)?;
                            self.kind(after) == TokenKind::Arrow
                        }
                        None => false,
                    };
                    if is_lambda {
                        last = Some(self.lambda(node)?);
                    } else {
                        self.bump()?;
                        self.scan_expression(GROUP_END, node)?;
                        last = Some(self.expect(TokenKind::RParen, "`)`")?);
                    }
                }
                TokenKind::LBracket => {
                    self.bump()?;
                    self.scan_expression(INDEX_END, node)?;
                    last = Some(self.expect(TokenKind::RBracket, "`]`")?);
                }
                TokenKind::LBrace => {
                    last = Some(self.array_initializer(node)?);
                }
                TokenKind::New
                    if last.is_none_or(|l| self.kind(l) != TokenKind::ColonColon) =>
                {
                    last = Some(self.creation(node)?);
                }
                TokenKind::Switch => {
                    last = Some(self.switch_construct(node, true)?);
                }
                TokenKind::Lt => match self.type_args_ahead(id)? {
                    Some(_) => last = Some(self.skip_type_args()?),
                    None => last = Some(self.bump()?),
                },
                _ => {
                    last = Some(self.bump()?);
                }
            }
            if operand.is_none() {
                operand = Some(item_start);
            }
        }
        Ok(last)
    }

    /// `yield` starting a yield statement rather than naming a variable.
    fn yield_keyword(&mut self, id: TokenId) -> Result<bool, Error> {
        if self.text(id) != "yield" {
            return Ok(false);
        }
        let next = self.filter.successor(id)?;
        Ok(!matches!(
            self.kind(next),
            TokenKind::Assign
                | TokenKind::AssignOp
                | TokenKind::Dot
                | TokenKind::LBracket
                | TokenKind::Semi
                | TokenKind::PlusPlus
                | TokenKind::MinusMinus
        ))
    }

    /// `?` inside type arguments, as in `List<?>` or `Map<String, ? extends T>`.
    fn is_wildcard(&mut self, question: TokenId, last: Option<TokenId>) -> Result<bool, Error> {
        let prev = last.map(|l| self.kind(l));
        let next = self.filter.successor(question)?;
        let next = self.kind(next);
        Ok(prev == Some(TokenKind::Lt)
            || matches!(
                next,
                TokenKind::Extends | TokenKind::Super | TokenKind::Gt | TokenKind::Shr | TokenKind::UShr
            )
            || (prev == Some(TokenKind::Comma) && next == TokenKind::Comma))
    }

    fn array_initializer(&mut self, node: ContextNode) -> Result<TokenId, Error> {
        self.expect(TokenKind::LBrace, "`{`")?;
        loop {
            self.not_eof()?;
            if self.at(TokenKind::RBrace) {
                return self.bump();
            }
            self.scan_expression(ELEMENT_END, node)?;
            if self.at(TokenKind::Comma) {
                self.bump()?;
            }
        }
    }

    /// `new T(..)`, `new T(..) { .. }` or `new T[..]{..}`.
    fn creation(&mut self, node: ContextNode) -> Result<TokenId, Error> {
        let mut last = self.bump()?;
        if self.at(TokenKind::Lt) {
            last = self.skip_type_args()?;
        }
        while self.at(TokenKind::At) {
            self.annotation()?;
        }
        if matches!(self.kind(self.cur), TokenKind::Ident | TokenKind::Primitive) {
            last = self.bump()?;
            loop {
                if self.at(TokenKind::Lt) {
                    last = self.skip_type_args()?;
                } else if self.at(TokenKind::Dot) {
                    self.bump()?;
                    last = self.bump()?;
                } else {
                    break;
                }
            }
        }
        if self.at(TokenKind::LParen) {
            self.bump()?;
            self.scan_expression(GROUP_END, node)?;
            last = self.expect(TokenKind::RParen, "`)`")?;
            if self.at(TokenKind::LBrace) {
                last = self.anonymous_body(node)?;
            }
        } else {
            while self.at(TokenKind::LBracket) {
                self.bump()?;
                self.scan_expression(INDEX_END, node)?;
                last = self.expect(TokenKind::RBracket, "`]`")?;
            }
            if self.at(TokenKind::LBrace) {
                last = self.array_initializer(node)?;
            }
        }
        Ok(last)
    }

    /// A lambda starting at the cursor. Returns its last token.
    fn lambda(&mut self, node: ContextNode) -> Result<TokenId, Error> {
        let start = self.cur;
        let mut params = Vec::new();
        if self.at(TokenKind::LParen) {
            self.bump()?;
            while !self.at(TokenKind::RParen) {
                self.not_eof()?;
                let param_start = self.cur;
                let mut param_end = param_start;
                while !matches!(self.kind(self.cur), TokenKind::Comma | TokenKind::RParen) {
                    self.not_eof()?;
                    param_end = if self.at(TokenKind::Lt) {
                        self.skip_type_args()?
                    } else {
                        self.bump()?
                    };
                }
                let name = self.text(param_end).to_owned();
                let ty = match self.filter.list().prev(param_end) {
                    Some(prev) if param_end != param_start => self.join(param_start, prev),
                    _ => String::new(),
                };
                params.push(Parameter { ty, name });
                if self.at(TokenKind::Comma) {
                    self.bump()?;
                }
            }
            self.bump()?;
        } else {
            let id = self.bump()?;
            params.push(Parameter {
                ty: String::new(),
                name: self.text(id).to_owned(),
            });
        }
        self.expect(TokenKind::Arrow, "`->`")?;

        self.lambda_count += 1;
        let signature = MethodSignature::lambda(format!("lambda${}", self.lambda_count), params);
        let lambda_node = self.tree.enter(node, Builtin::Lambda);

        if self.at(TokenKind::LBrace) {
            let open = self.bump()?;
            let entry = self.push(
                open,
                Placement::Post,
                EmitterKind::LambdaEntry {
                    form: LambdaForm::Block,
                    signature,
                },
                lambda_node,
                self.region(start, open),
            );
            let close = self.block_statements(lambda_node)?;
            let region = self.region(start, close);
            self.filter.emitters_mut().set_region(entry, region);
            self.push(
                close,
                Placement::Pre,
                EmitterKind::LambdaExit { entry },
                lambda_node,
                region,
            );
            return Ok(close);
        }

        let body_start = self.cur;
        let entry = self.push(
            start,
            Placement::Pre,
            EmitterKind::LambdaEntry {
                form: LambdaForm::Expression {
                    body: SourceRegion::default(),
                },
                signature,
            },
            lambda_node,
            self.region(start, body_start),
        );
        self.push(
            body_start,
            Placement::Pre,
            EmitterKind::LambdaBody { entry },
            lambda_node,
            self.region(body_start, body_start),
        );
        let end = self
            .scan_expression(LAMBDA_BODY_END, lambda_node)?
            .ok_or_else(|| self.error(self.cur, "expected a lambda body"))?;
        let body = self.region(body_start, end);
        let region = self.region(start, end);
        let emitter = self.filter.emitters_mut().get_mut(entry);
        emitter.region = region;
        if let EmitterKind::LambdaEntry {
            form: LambdaForm::Expression { body: slot },
            ..
        } = &mut emitter.kind
        {
            *slot = body;
        }
        self.push(
            end,
            Placement::Post,
            EmitterKind::LambdaExit { entry },
            lambda_node,
            region,
        );
        Ok(end)
    }
}

/// Header pieces read before it is known whether a member is a method.
struct MethodHeader {
    modifiers: Modifiers,
    start: TokenId,
    type_params: String,
    return_type: Option<String>,
}
