//! Single-pass scanners over a token range.
//!
//! These decide whether a boolean expression can be rewritten into the
//! branch probe form at all, and how much cyclomatic complexity it adds.
//! They never fail: unknown shapes fall back to "instrumentable".

use crate::lexer::TokenKind;
use crate::token::{TokenId, TokenList};

#[derive(Debug, Default)]
pub struct ParenthesisCounter {
    depth: i32,
}

impl ParenthesisCounter {
    pub fn accept(&mut self, kind: TokenKind) {
        match kind {
            TokenKind::LParen => self.depth += 1,
            TokenKind::RParen => self.depth -= 1,
            _ => {}
        }
    }

    pub fn depth(&self) -> i32 {
        self.depth
    }

    pub fn is_balanced(&self) -> bool {
        self.depth == 0
    }
}

/// Spots assignments in a condition. Braces open a new scope (a lambda
/// body or an anonymous class) whose assignments do not count.
#[derive(Debug, Default)]
pub struct AssignmentDetector {
    brace_depth: u32,
    found: bool,
}

impl AssignmentDetector {
    pub fn accept(&mut self, kind: TokenKind) {
        match kind {
            TokenKind::LBrace => self.brace_depth += 1,
            TokenKind::RBrace => self.brace_depth = self.brace_depth.saturating_sub(1),
            k if k.is_assignment() && self.brace_depth == 0 => self.found = true,
            _ => {}
        }
    }

    pub fn found(&self) -> bool {
        self.found
    }
}

/// Tracks `x instanceof Type name` pattern bindings. A binding introduces
/// a variable whose scope the branch rewrite would break.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum InstanceOfState {
    #[default]
    Nothing,
    InstanceOf,
    Final,
    FullType,
    PartialType,
    /// Inside `<...>` of a generic type, with the nesting depth.
    GenericType(u32),
    /// A binding variable was seen. Terminal.
    Variable,
}

impl InstanceOfState {
    pub fn next(self, kind: TokenKind, text: &str) -> Self {
        use InstanceOfState::*;
        match self {
            Variable => Variable,
            Nothing => {
                if kind == TokenKind::Instanceof {
                    InstanceOf
                } else {
                    Nothing
                }
            }
            InstanceOf => match kind {
                TokenKind::Modifier if text == "final" => Final,
                TokenKind::Ident | TokenKind::Primitive => FullType,
                _ => Nothing,
            },
            Final => match kind {
                TokenKind::Ident | TokenKind::Primitive => FullType,
                _ => Nothing,
            },
            FullType => match kind {
                TokenKind::Dot => PartialType,
                TokenKind::Lt => GenericType(1),
                TokenKind::LBracket | TokenKind::RBracket => FullType,
                // A second identifier after the type is the binding; an
                // opening paren starts a record deconstruction pattern.
                TokenKind::Ident | TokenKind::LParen => Variable,
                TokenKind::Instanceof => InstanceOf,
                _ => Nothing,
            },
            PartialType => match kind {
                TokenKind::Ident => FullType,
                _ => Nothing,
            },
            GenericType(depth) => {
                let closed = match kind {
                    TokenKind::Lt => return GenericType(depth + 1),
                    TokenKind::Gt => 1,
                    TokenKind::Shr => 2,
                    TokenKind::UShr => 3,
                    _ => return GenericType(depth),
                };
                if closed >= depth {
                    FullType
                } else {
                    GenericType(depth - closed)
                }
            }
        }
    }
}

/// `1 + count(&&, ||)` over an expression.
#[derive(Debug)]
pub struct ExpressionComplexityCounter {
    complexity: u32,
}

impl Default for ExpressionComplexityCounter {
    fn default() -> Self {
        Self { complexity: 1 }
    }
}

impl ExpressionComplexityCounter {
    pub fn accept(&mut self, kind: TokenKind) {
        if matches!(kind, TokenKind::AndAnd | TokenKind::OrOr) {
            self.complexity += 1;
        }
    }

    pub fn complexity(&self) -> u32 {
        self.complexity
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExpressionInfo {
    pub constant: bool,
    pub has_assignment: bool,
    pub has_pattern_binding: bool,
    /// Parentheses inside the range pair up and never close early.
    pub balanced: bool,
    pub complexity: u32,
}

impl ExpressionInfo {
    /// Analyze the inclusive token range `start..=end`.
    pub fn analyze(list: &TokenList, start: TokenId, end: TokenId) -> Self {
        let mut assignments = AssignmentDetector::default();
        let mut instance_of = InstanceOfState::default();
        let mut counter = ExpressionComplexityCounter::default();
        let mut parens = ParenthesisCounter::default();
        let mut only_constant_parts = true;
        let mut saw_literal = false;
        let mut closed_early = false;

        let mut cursor = Some(start);
        while let Some(id) = cursor {
            let token = list.get(id);
            let kind = token.kind;
            assignments.accept(kind);
            instance_of = instance_of.next(kind, &token.text);
            counter.accept(kind);
            parens.accept(kind);
            closed_early |= parens.depth() < 0;

            if kind.is_literal() {
                saw_literal = true;
            } else if !(kind.is_operator() || matches!(kind, TokenKind::LParen | TokenKind::RParen))
            {
                only_constant_parts = false;
            }

            if id == end {
                break;
            }
            cursor = list.next(id);
        }

        let constant = only_constant_parts && saw_literal;
        Self {
            constant,
            has_assignment: assignments.found(),
            has_pattern_binding: instance_of == InstanceOfState::Variable,
            balanced: !closed_early && parens.is_balanced(),
            complexity: if constant { 0 } else { counter.complexity() },
        }
    }

    pub fn is_instrumentable(&self) -> bool {
        self.balanced && !self.constant && !self.has_assignment && !self.has_pattern_binding
    }
}

#[cfg(test)]
mod tests {
    use logos::Logos;

    use super::*;
    use crate::token::Token;

    fn analyze(src: &str) -> ExpressionInfo {
        let mut list = TokenList::new();
        let mut tail = None;
        let mut first = None;
        for (kind, span) in TokenKind::lexer(src).spanned() {
            let kind = kind.expect("lex error");
            if kind.is_trivia() {
                continue;
            }
            let id = list.append(tail, Token::new(kind, &src[span], 1, 1));
            first.get_or_insert(id);
            tail = Some(id);
        }
        ExpressionInfo::analyze(&list, first.unwrap(), tail.unwrap())
    }

    #[test]
    fn plain_condition_is_instrumentable() {
        let info = analyze("a > 0");
        assert!(info.is_instrumentable());
        assert_eq!(info.complexity, 1);
    }

    #[test]
    fn complexity_counts_short_circuit_operators() {
        assert_eq!(analyze("a && b || c && !d").complexity, 4);
    }

    #[test]
    fn literal_only_expressions_are_constant() {
        for src in ["true", "(1 == 1)", "!false", "1 + 2 > 3"] {
            let info = analyze(src);
            assert!(info.constant, "{src} should be constant");
            assert_eq!(info.complexity, 0, "{src} must not add complexity");
            assert!(!info.is_instrumentable());
        }
        assert!(!analyze("(x)").constant, "no literal, not constant");
        assert!(!analyze("x == 1").constant);
    }

    #[test]
    fn assignments_block_instrumentation() {
        assert!(analyze("(line = reader.readLine()) != null").has_assignment);
        assert!(analyze("(n += 2) > 4").has_assignment);
        assert!(!analyze("a == b").has_assignment);
    }

    #[test]
    fn assignments_inside_lambda_bodies_are_ignored() {
        let info = analyze("list.stream().anyMatch(x -> { int y = x; return y > 0; })");
        assert!(!info.has_assignment);
        assert!(info.is_instrumentable());
    }

    #[test]
    fn pattern_binding_detected() {
        assert!(analyze("o instanceof String s").has_pattern_binding);
        assert!(analyze("o instanceof final java.util.List<Map<K, V>> list").has_pattern_binding);
        assert!(analyze("o instanceof Point(int x, int y)").has_pattern_binding);
        assert!(analyze("a && o instanceof String[] arr").has_pattern_binding);
    }

    #[test]
    fn plain_instanceof_is_fine() {
        let info = analyze("o instanceof String && ok");
        assert!(!info.has_pattern_binding);
        assert!(info.is_instrumentable());
        assert!(!analyze("o instanceof java.util.List<?>").has_pattern_binding);
    }

    #[test]
    fn generic_depth_closes_with_shift_tokens() {
        let mut state = InstanceOfState::GenericType(2);
        state = state.next(TokenKind::Shr, ">>");
        assert_eq!(state, InstanceOfState::FullType);
        assert_eq!(
            InstanceOfState::GenericType(3).next(TokenKind::Gt, ">"),
            InstanceOfState::GenericType(2)
        );
    }

    #[test]
    fn unbalanced_ranges_are_not_rewritten() {
        let info = analyze("(a && b");
        assert!(!info.balanced);
        assert!(!info.is_instrumentable());
        assert!(!analyze("a) && (b").balanced, "closing before opening");
        let info = analyze("(a && b) || f(c)");
        assert!(info.balanced);
        assert!(info.is_instrumentable());
    }

    #[test]
    fn parenthesis_counter_balances() {
        let mut counter = ParenthesisCounter::default();
        for kind in [TokenKind::LParen, TokenKind::LParen, TokenKind::RParen] {
            counter.accept(kind);
        }
        assert_eq!(counter.depth(), 1);
        counter.accept(TokenKind::RParen);
        assert!(counter.is_balanced());
    }
}
