//! Pending instrumentation instructions anchored to tokens.
//!
//! The recognizer attaches emitters while it walks the source; nothing is
//! registered or rendered at that point. The filter's resolve walk then
//! calls [`EmitterList::init`] on every emitter in lexical order, which
//! registers the element with the session and fixes the emitter's text.
//! The write walk only reads that text.
//!
//! Exit-style emitters decide from the outcome recorded on their entry,
//! never from the current state, so a directive that flips instrumentation
//! between an entry and its exit cannot leave an unbalanced `try{` or `{`.

use std::collections::HashMap;

use crate::analysis::ExpressionInfo;
use crate::config::FlushPolicy;
use crate::context::ContextSet;
use crate::error::Error;
use crate::recorder::{RecorderPrefix, RecorderSpec, escape_java};
use crate::registry::{EntityRef, MethodId, NewClass, NewMethod, SourceRegion};
use crate::signature::{MethodSignature, TypeSignature};
use crate::state::InstrumentationState;
use crate::token::TokenId;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct EmitterId(u32);

impl EmitterId {
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

/// Whether an emitter's text goes before or after its anchor token.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Placement {
    Pre,
    Post,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LambdaForm {
    /// `(..) -> { .. }`: the probe goes inside the braces.
    Block,
    /// `(..) -> expr`: the whole lambda is wrapped in a recorder call.
    Expression { body: SourceRegion },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CaseForm {
    /// `case X -> { .. }`
    Block,
    /// `case X -> expr;` The arm is braced, and `yield` is inserted when
    /// the switch produces a value.
    Expression { yield_value: bool },
    /// `case X -> throw ..;`
    Throw,
}

#[derive(Debug, Clone)]
pub enum EmitterKind {
    Statement {
        complexity: u32,
        /// The statement is an unbraced body; open a brace before the probe.
        wrap: bool,
        /// Probe declared as an extra try-with-resources resource.
        resource: bool,
    },
    Branch {
        info: ExpressionInfo,
    },
    MethodEntry {
        signature: MethodSignature,
        constructor: bool,
    },
    MethodExit {
        entry: EmitterId,
    },
    ClassEntry {
        signature: TypeSignature,
        top_level: bool,
    },
    ClassExit {
        entry: EmitterId,
        recorder: Option<EmitterId>,
    },
    Recorder {
        enum_terminator: bool,
    },
    LambdaEntry {
        form: LambdaForm,
        signature: MethodSignature,
    },
    LambdaBody {
        entry: EmitterId,
    },
    LambdaExit {
        entry: EmitterId,
    },
    CaseEntry {
        form: CaseForm,
    },
    CaseExit {
        entry: EmitterId,
    },
    /// Emits the deferred closing text of `opener`.
    Closing {
        opener: EmitterId,
    },
}

/// What `init` decided. Exit emitters read this from their entry.
#[derive(Debug, Clone, Default)]
pub struct Outcome {
    pub instrumented: bool,
    pub data_index: Option<u32>,
    pub method: Option<MethodId>,
    /// Probe expression used, so exits render with the same recorder.
    pub access: String,
    /// Text a paired `Closing`/exit emitter writes.
    pub closing: String,
    pub finally: bool,
    pub flush: bool,
    pub test: bool,
    pub owner: String,
    pub qualified: String,
    pub void_rewrite: bool,
    pub body_index: Option<u32>,
}

#[derive(Debug, Clone)]
pub struct Emitter {
    pub kind: EmitterKind,
    pub anchor: TokenId,
    pub placement: Placement,
    pub context: ContextSet,
    pub region: SourceRegion,
    pub text: String,
    pub outcome: Outcome,
    pub entity: Option<EntityRef>,
    initialized: bool,
}

#[derive(Debug, Default)]
struct AnchorSlots {
    pre: Vec<EmitterId>,
    post: Vec<EmitterId>,
}

/// Flat, append-only list of emitters with a per-token index.
#[derive(Debug, Default)]
pub struct EmitterList {
    emitters: Vec<Emitter>,
    by_anchor: HashMap<TokenId, AnchorSlots>,
}

impl EmitterList {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.emitters.len()
    }

    pub fn is_empty(&self) -> bool {
        self.emitters.is_empty()
    }

    pub fn push(
        &mut self,
        anchor: TokenId,
        placement: Placement,
        kind: EmitterKind,
        context: ContextSet,
        region: SourceRegion,
    ) -> EmitterId {
        let id = EmitterId(self.emitters.len() as u32);
        self.emitters.push(Emitter {
            kind,
            anchor,
            placement,
            context,
            region,
            text: String::new(),
            outcome: Outcome::default(),
            entity: None,
            initialized: false,
        });
        let slots = self.by_anchor.entry(anchor).or_default();
        match placement {
            Placement::Pre => slots.pre.push(id),
            Placement::Post => slots.post.push(id),
        }
        id
    }

    pub fn get(&self, id: EmitterId) -> &Emitter {
        &self.emitters[id.index()]
    }

    pub fn get_mut(&mut self, id: EmitterId) -> &mut Emitter {
        &mut self.emitters[id.index()]
    }

    /// Regions are often only known once the element has been scanned.
    pub fn set_region(&mut self, id: EmitterId, region: SourceRegion) {
        self.emitters[id.index()].region = region;
    }

    pub fn iter(&self) -> impl Iterator<Item = &Emitter> {
        self.emitters.iter()
    }

    pub fn pre(&self, anchor: TokenId) -> &[EmitterId] {
        self.by_anchor
            .get(&anchor)
            .map_or(&[][..], |s| s.pre.as_slice())
    }

    pub fn post(&self, anchor: TokenId) -> &[EmitterId] {
        self.by_anchor
            .get(&anchor)
            .map_or(&[][..], |s| s.post.as_slice())
    }

    /// Concatenated text of the emitters at `anchor` in one placement.
    pub fn text_at(&self, anchor: TokenId, placement: Placement) -> String {
        let ids = match placement {
            Placement::Pre => self.pre(anchor),
            Placement::Post => self.post(anchor),
        };
        ids.iter().map(|&id| self.get(id).text.as_str()).collect()
    }

    fn outcome(&self, id: EmitterId) -> &Outcome {
        &self.emitters[id.index()].outcome
    }

    /// Register the emitter's element and fix its text. Runs once per
    /// emitter, in lexical order.
    pub fn init(&mut self, id: EmitterId, state: &mut InstrumentationState<'_>) -> Result<(), Error> {
        let emitter = &self.emitters[id.index()];
        if emitter.initialized {
            return Err(Error::Session(format!("emitter {} initialized twice", id.0)));
        }
        let context = state.element_context(emitter.context);
        let region = emitter.region;

        match &emitter.kind {
            EmitterKind::Statement {
                complexity,
                wrap,
                resource,
            } => {
                let (complexity, wrap, resource) = (*complexity, *wrap, *resource);
                self.init_statement(id, state, context, region, complexity, wrap, resource)?;
            }
            EmitterKind::Branch { info } => {
                let info = *info;
                self.init_branch(id, state, context, region, info)?;
            }
            EmitterKind::MethodEntry { .. } => self.init_method_entry(id, state, context, region)?,
            EmitterKind::MethodExit { entry } => {
                let entry = *entry;
                self.init_method_exit(id, entry, state, region)?;
            }
            EmitterKind::ClassEntry { .. } => self.init_class_entry(id, state, context, region)?,
            EmitterKind::ClassExit { recorder, .. } => {
                let recorder = *recorder;
                self.init_class_exit(recorder, state, region)?;
            }
            // Text is settled by the owning class exit.
            EmitterKind::Recorder { .. } => {}
            EmitterKind::LambdaEntry { form, .. } => {
                let form = *form;
                self.init_lambda_entry(id, state, context, region, form)?;
            }
            EmitterKind::LambdaBody { entry } => {
                let entry = *entry;
                self.init_lambda_body(id, entry, state);
            }
            EmitterKind::LambdaExit { entry } => {
                let entry = *entry;
                state.session.exit_method(region.end_line, region.end_column)?;
                let outcome = self.outcome(entry);
                if outcome.instrumented && outcome.body_index.is_some() || outcome.void_rewrite {
                    let text = if outcome.void_rewrite {
                        ";}".to_owned()
                    } else {
                        outcome.closing.clone()
                    };
                    self.emitters[id.index()].text = text;
                }
            }
            EmitterKind::CaseEntry { form } => {
                let form = *form;
                self.init_case_entry(id, state, context, region, form)?;
            }
            EmitterKind::CaseExit { entry } => {
                let entry = *entry;
                let outcome = self.outcome(entry);
                if outcome.instrumented && !outcome.closing.is_empty() {
                    self.emitters[id.index()].text = outcome.closing.clone();
                }
            }
            EmitterKind::Closing { opener } => {
                let opener = *opener;
                let outcome = self.outcome(opener);
                if outcome.instrumented {
                    self.emitters[id.index()].text = outcome.closing.clone();
                }
            }
        }

        self.emitters[id.index()].initialized = true;
        Ok(())
    }

    fn set_result(&mut self, id: EmitterId, entity: EntityRef, text: String, outcome: Outcome) {
        let emitter = &mut self.emitters[id.index()];
        emitter.entity = Some(entity);
        emitter.text = text;
        emitter.outcome = outcome;
    }

    /// Recorder access expression, when instrumentation is on and a
    /// recorder is in scope.
    fn active_access(state: &InstrumentationState<'_>) -> Option<String> {
        if !state.is_enabled() {
            return None;
        }
        state.recorder_prefix().map(|p| p.access.clone())
    }

    #[allow(clippy::too_many_arguments)]
    fn init_statement(
        &mut self,
        id: EmitterId,
        state: &mut InstrumentationState<'_>,
        context: ContextSet,
        region: SourceRegion,
        complexity: u32,
        wrap: bool,
        resource: bool,
    ) -> Result<(), Error> {
        let access = Self::active_access(state);
        let sid = state
            .session
            .add_statement(region, context, complexity, access.is_some())?;
        let entity = EntityRef::Statement(sid);
        let index = state.session.data_index(entity);

        let mut outcome = Outcome {
            data_index: index,
            ..Default::default()
        };
        let mut text = String::new();
        if let (Some(access), Some(i)) = (access, index) {
            if resource {
                let n = state.next_auto_closeable();
                let jl = &state.config.java_lang_prefix;
                text = format!("final {jl}AutoCloseable __STCH_AC{n}={access}.resourceInc({i});");
            } else {
                text = format!("{access}.inc({i});");
            }
            if wrap {
                text.insert(0, '{');
                outcome.closing = "}".into();
            }
            outcome.instrumented = true;
            outcome.access = access;
            state.mark_dirty();
        }
        self.set_result(id, entity, text, outcome);
        Ok(())
    }

    fn init_branch(
        &mut self,
        id: EmitterId,
        state: &mut InstrumentationState<'_>,
        context: ContextSet,
        region: SourceRegion,
        info: ExpressionInfo,
    ) -> Result<(), Error> {
        let access = Self::active_access(state).filter(|_| info.is_instrumentable());
        let Some(bid) = state
            .session
            .add_branch(region, context, info.complexity, access.is_some())?
        else {
            return Ok(());
        };
        let entity = EntityRef::Branch(bid);
        let index = state.session.data_index(entity);

        let mut outcome = Outcome {
            data_index: index,
            ..Default::default()
        };
        let mut text = String::new();
        if let (Some(p), Some(i)) = (access, index) {
            text = "(((".into();
            outcome.closing = format!(
                ")&&({p}.iget({i})!=0|true))||({p}.iget({})==0&false))",
                i + 1
            );
            outcome.instrumented = true;
            outcome.access = p;
            state.mark_dirty();
        }
        self.set_result(id, entity, text, outcome);
        Ok(())
    }

    fn init_method_entry(
        &mut self,
        id: EmitterId,
        state: &mut InstrumentationState<'_>,
        context: ContextSet,
        region: SourceRegion,
    ) -> Result<(), Error> {
        let EmitterKind::MethodEntry {
            signature,
            constructor,
        } = &self.emitters[id.index()].kind
        else {
            return Ok(());
        };
        let constructor = *constructor;

        let is_test = state.detect_tests()
            && state
                .owner()
                .is_some_and(|owner| state.detector().is_method_match(&state.source(), owner, signature));
        let mid = state.session.enter_method(NewMethod {
            name: signature.name.clone(),
            signature: signature.normalized(),
            region,
            context,
            is_test,
            is_lambda: false,
            void_return: signature.returns_void(),
        })?;
        let entity = EntityRef::Method(mid.0);
        let index = state.session.data_index(entity);
        let owner = state.owner().map(|o| o.name.clone()).unwrap_or_default();
        let qualified = state
            .session
            .current_class_name()
            .map(|c| format!("{c}.{}", signature.name))
            .unwrap_or_default();

        let mut outcome = Outcome {
            data_index: index,
            method: Some(mid),
            test: is_test,
            owner,
            qualified,
            ..Default::default()
        };
        let mut text = String::new();
        if let (Some(p), Some(i)) = (Self::active_access(state), index) {
            let config = state.config;
            let flush = state.take_needs_flush();
            let slice = is_test && config.record_test_results;
            let finally =
                !constructor && (config.flush_policy != FlushPolicy::Directed || flush || slice);
            if finally {
                text.push_str("try{");
                if slice {
                    text.push_str(&format!(
                        "{p}.globalSliceStart(\"{}\",{i});",
                        escape_java(&outcome.owner)
                    ));
                }
            }
            text.push_str(&format!("{p}.inc({i});"));
            outcome.instrumented = true;
            outcome.finally = finally;
            outcome.flush = flush;
            outcome.access = p;
            state.mark_dirty();
        }
        self.set_result(id, entity, text, outcome);
        Ok(())
    }

    fn init_method_exit(
        &mut self,
        id: EmitterId,
        entry: EmitterId,
        state: &mut InstrumentationState<'_>,
        region: SourceRegion,
    ) -> Result<(), Error> {
        state
            .session
            .exit_method(region.end_line, region.end_column)?;
        let outcome = self.outcome(entry);
        if !(outcome.instrumented && outcome.finally) {
            return Ok(());
        }
        let p = &outcome.access;
        let mut text = String::from("}finally{");
        if state.config.flush_policy != FlushPolicy::Directed {
            text.push_str(&format!("{p}.maybeFlush();"));
        } else if outcome.flush {
            text.push_str(&format!("{p}.flushNeeded();"));
        }
        if outcome.test && state.config.record_test_results {
            text.push_str(&format!(
                "{p}.globalSliceEnd(\"{}\",\"{}\",{});",
                escape_java(&outcome.owner),
                escape_java(&outcome.qualified),
                outcome.data_index.unwrap_or_default()
            ));
        }
        text.push('}');
        self.emitters[id.index()].text = text;
        Ok(())
    }

    fn init_class_entry(
        &mut self,
        id: EmitterId,
        state: &mut InstrumentationState<'_>,
        context: ContextSet,
        region: SourceRegion,
    ) -> Result<(), Error> {
        let EmitterKind::ClassEntry {
            signature,
            top_level,
        } = &self.emitters[id.index()].kind
        else {
            return Ok(());
        };
        let is_test = state.config.detect_tests
            && (state.detect_tests()
                || state.detector().is_type_match(&state.source(), signature));
        let cid = state.session.enter_class(NewClass {
            name: signature.name.clone(),
            kind: signature.kind,
            region,
            context,
            is_test,
        })?;
        state.push_class(signature.clone(), *top_level, is_test);
        self.emitters[id.index()].entity = Some(EntityRef::Class(cid));
        Ok(())
    }

    fn init_class_exit(
        &mut self,
        recorder: Option<EmitterId>,
        state: &mut InstrumentationState<'_>,
        region: SourceRegion,
    ) -> Result<(), Error> {
        state
            .session
            .exit_class(region.end_line, region.end_column)?;
        // The prefix must be read before the frame is popped.
        let prefix: Option<RecorderPrefix> = state.recorder_prefix().cloned();
        let dirty = state.pop_class();
        let (Some(recorder), Some(prefix), true) = (recorder, prefix, dirty) else {
            return Ok(());
        };
        let EmitterKind::Recorder { enum_terminator } = self.emitters[recorder.index()].kind else {
            return Ok(());
        };
        let text = RecorderSpec {
            prefix: &prefix,
            config: state.config,
            version: state.session.version(),
            max_index: state.session.next_index(),
            first_in_file: state.take_first_recorder(),
            enum_terminator,
        }
        .render();
        let emitter = &mut self.emitters[recorder.index()];
        emitter.text = text;
        emitter.outcome.instrumented = true;
        Ok(())
    }

    fn init_lambda_entry(
        &mut self,
        id: EmitterId,
        state: &mut InstrumentationState<'_>,
        context: ContextSet,
        region: SourceRegion,
        form: LambdaForm,
    ) -> Result<(), Error> {
        let EmitterKind::LambdaEntry { signature, .. } = &self.emitters[id.index()].kind else {
            return Ok(());
        };
        let mid = state.session.enter_method(NewMethod {
            name: signature.name.clone(),
            signature: signature.normalized(),
            region,
            context,
            is_test: false,
            is_lambda: true,
            void_return: false,
        })?;
        let entity = EntityRef::Method(mid.0);
        let index = state.session.data_index(entity);
        let prefix = state.recorder_prefix().cloned();
        let enabled = state.is_enabled();

        let mut outcome = Outcome {
            data_index: index,
            method: Some(mid),
            ..Default::default()
        };

        // Under the holder-class strategy the wrapper also counts the body
        // as a statement of the lambda.
        let body_statement = match (form, &prefix) {
            (LambdaForm::Expression { body }, Some(p)) if p.class_form => {
                let sid = state.session.add_statement(body, context, 0, enabled)?;
                state.session.data_index(EntityRef::Statement(sid))
            }
            _ => None,
        };

        let mut text = String::new();
        if let (true, Some(p), Some(i)) = (enabled, prefix, index) {
            match form {
                LambdaForm::Block => {
                    text = format!("{}.inc({i});", p.access);
                }
                LambdaForm::Expression { .. } => {
                    text = format!("{}{i},", p.lambda_inc());
                    outcome.closing = match body_statement {
                        Some(s) => format!(",{s})"),
                        None => ")".into(),
                    };
                    outcome.body_index = Some(body_statement.unwrap_or(i));
                }
            }
            outcome.instrumented = true;
            outcome.access = p.access;
            state.mark_dirty();
        }
        self.set_result(id, entity, text, outcome);
        Ok(())
    }

    /// Rewrites an expression lambda marked void: the wrapper call is
    /// dropped and the body becomes a block.
    fn init_lambda_body(
        &mut self,
        id: EmitterId,
        entry: EmitterId,
        state: &mut InstrumentationState<'_>,
    ) {
        let outcome = self.outcome(entry);
        if !outcome.instrumented || outcome.body_index.is_none() {
            return;
        }
        let Some(method) = outcome.method else {
            return;
        };
        let is_void = state
            .session
            .method(method)
            .is_some_and(|m| m.void_return);
        if !is_void {
            return;
        }
        let p = &outcome.access;
        let i = outcome.data_index.unwrap_or_default();
        let mut text = format!("{{{p}.inc({i});");
        if let Some(s) = outcome.body_index.filter(|&s| s != i) {
            text.push_str(&format!("{p}.inc({s});"));
        }
        self.emitters[id.index()].text = text;
        let entry = &mut self.emitters[entry.index()];
        entry.text.clear();
        entry.outcome.void_rewrite = true;
    }

    fn init_case_entry(
        &mut self,
        id: EmitterId,
        state: &mut InstrumentationState<'_>,
        context: ContextSet,
        region: SourceRegion,
        form: CaseForm,
    ) -> Result<(), Error> {
        let forced_yield = state.take_needs_yield();
        let access = Self::active_access(state);
        let sid = state
            .session
            .add_statement(region, context, 1, access.is_some())?;
        let entity = EntityRef::Statement(sid);
        let index = state.session.data_index(entity);

        let mut outcome = Outcome {
            data_index: index,
            ..Default::default()
        };
        let mut text = String::new();
        if let (Some(p), Some(i)) = (access, index) {
            let inc = format!("{p}.inc({i});");
            match form {
                CaseForm::Block => text = inc,
                CaseForm::Expression { yield_value } => {
                    text = format!("{{{inc}");
                    if yield_value || forced_yield {
                        text.push_str("yield ");
                    }
                    outcome.closing = "}".into();
                }
                CaseForm::Throw => {
                    text = format!("{{{inc}");
                    outcome.closing = "}".into();
                }
            }
            outcome.instrumented = true;
            outcome.access = p;
            state.mark_dirty();
        }
        self.set_result(id, entity, text, outcome);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::path::Path;

    use super::*;
    use crate::config::{InstrumentationConfig, RecorderStrategy};
    use crate::detect::DefaultTestDetector;
    use crate::lexer::TokenKind;
    use crate::registry::{NewFile, Session};
    use crate::signature::{Modifiers, TypeKind};
    use crate::token::{Token, TokenList};

    struct Fixture {
        list: TokenList,
        anchor: TokenId,
        emitters: EmitterList,
    }

    impl Fixture {
        fn new() -> Self {
            let mut list = TokenList::new();
            let anchor = list.append(None, Token::new(TokenKind::Ident, "x", 1, 1));
            Self {
                list,
                anchor,
                emitters: EmitterList::new(),
            }
        }

        fn push(&mut self, kind: EmitterKind) -> EmitterId {
            self.emitters.push(
                self.anchor,
                Placement::Pre,
                kind,
                ContextSet::EMPTY,
                SourceRegion::new(1, 1, 1, 2),
            )
        }
    }

    fn class_sig(name: &str, kind: TypeKind) -> TypeSignature {
        TypeSignature {
            name: name.into(),
            kind,
            modifiers: Modifiers::default(),
            superclass: None,
            interfaces: Vec::new(),
        }
    }

    fn method_sig(name: &str, ret: &str) -> MethodSignature {
        MethodSignature {
            name: name.into(),
            modifiers: Modifiers::default(),
            type_params: String::new(),
            return_type: Some(ret.into()),
            params: Vec::new(),
            throws: Vec::new(),
        }
    }

    fn open_session() -> Session {
        let mut session = Session::new(5, 0);
        session
            .enter_file(NewFile {
                path: "A.java".into(),
                package: String::new(),
                checksum: String::new(),
                size: 0,
                timestamp: 0,
                encoding: "UTF-8".into(),
                line_count: 1,
                ncloc: 1,
            })
            .unwrap();
        session
    }

    /// Run `body` with a class entered on a fresh state.
    fn with_state(config: &InstrumentationConfig, f: impl FnOnce(&mut Fixture, &mut InstrumentationState<'_>)) {
        let mut session = open_session();
        let mut fx = Fixture::new();
        let mut state = InstrumentationState::new(
            &mut session,
            config,
            &DefaultTestDetector,
            Path::new("A.java"),
            "",
            0,
        );
        let class = fx.push(EmitterKind::ClassEntry {
            signature: class_sig("A", TypeKind::Class),
            top_level: true,
        });
        fx.emitters.init(class, &mut state).unwrap();
        f(&mut fx, &mut state);
        assert!(!fx.list.is_empty());
    }

    #[test]
    fn statement_probe_and_wrap() {
        let config = InstrumentationConfig::default();
        with_state(&config, |fx, state| {
            let s = fx.push(EmitterKind::Statement {
                complexity: 0,
                wrap: true,
                resource: false,
            });
            let close = fx.push(EmitterKind::Closing { opener: s });
            fx.emitters.init(s, state).unwrap();
            fx.emitters.init(close, state).unwrap();

            let prefix = state.recorder_prefix().unwrap().access.clone();
            assert_eq!(fx.emitters.get(s).text, format!("{{{prefix}.inc(0);"));
            assert_eq!(fx.emitters.get(close).text, "}");
            assert!(state.is_dirty());
        });
    }

    #[test]
    fn disabled_statement_registers_without_text() {
        let config = InstrumentationConfig::default();
        with_state(&config, |fx, state| {
            state.set_enabled(false);
            let s = fx.push(EmitterKind::Statement {
                complexity: 0,
                wrap: true,
                resource: false,
            });
            let close = fx.push(EmitterKind::Closing { opener: s });
            fx.emitters.init(s, state).unwrap();
            state.set_enabled(true);
            fx.emitters.init(close, state).unwrap();

            assert!(fx.emitters.get(s).text.is_empty());
            assert!(
                fx.emitters.get(close).text.is_empty(),
                "closing mirrors the opener, not the current state"
            );
            assert_eq!(fx.emitters.get(s).outcome.data_index, Some(0));
            assert!(!state.is_dirty());
        });
    }

    #[test]
    fn branch_takes_adjacent_slots() {
        let config = InstrumentationConfig::default();
        with_state(&config, |fx, state| {
            let m = fx.push(EmitterKind::MethodEntry {
                signature: method_sig("run", "void"),
                constructor: false,
            });
            fx.emitters.init(m, state).unwrap();
            let info = ExpressionInfo {
                constant: false,
                has_assignment: false,
                has_pattern_binding: false,
                balanced: true,
                complexity: 1,
            };
            let b = fx.push(EmitterKind::Branch { info });
            let close = fx.push(EmitterKind::Closing { opener: b });
            fx.emitters.init(b, state).unwrap();
            fx.emitters.init(close, state).unwrap();

            let p = state.recorder_prefix().unwrap().access.clone();
            assert_eq!(fx.emitters.get(b).text, "(((");
            assert_eq!(
                fx.emitters.get(close).text,
                format!(")&&({p}.iget(1)!=0|true))||({p}.iget(2)==0&false))")
            );
            assert_eq!(state.session.next_index(), 3);
        });
    }

    #[test]
    fn constant_branch_registers_without_probe() {
        let config = InstrumentationConfig::default();
        with_state(&config, |fx, state| {
            let m = fx.push(EmitterKind::MethodEntry {
                signature: method_sig("run", "void"),
                constructor: false,
            });
            fx.emitters.init(m, state).unwrap();
            let b = fx.push(EmitterKind::Branch {
                info: ExpressionInfo {
                    constant: true,
                    has_assignment: false,
                    has_pattern_binding: false,
                    balanced: true,
                    complexity: 0,
                },
            });
            fx.emitters.init(b, state).unwrap();
            assert!(fx.emitters.get(b).text.is_empty());
            assert!(fx.emitters.get(b).entity.is_some(), "still registered");
        });
    }

    #[test]
    fn interval_flush_wraps_method_in_finally() {
        let config = InstrumentationConfig {
            flush_policy: FlushPolicy::Interval,
            flush_interval: 100,
            ..Default::default()
        };
        with_state(&config, |fx, state| {
            let entry = fx.push(EmitterKind::MethodEntry {
                signature: method_sig("run", "void"),
                constructor: false,
            });
            let exit = fx.push(EmitterKind::MethodExit { entry });
            fx.emitters.init(entry, state).unwrap();
            fx.emitters.init(exit, state).unwrap();
            let p = state.recorder_prefix().unwrap().access.clone();
            assert_eq!(fx.emitters.get(entry).text, format!("try{{{p}.inc(0);"));
            assert_eq!(
                fx.emitters.get(exit).text,
                format!("}}finally{{{p}.maybeFlush();}}")
            );
        });
    }

    #[test]
    fn constructors_never_get_finally() {
        let config = InstrumentationConfig {
            flush_policy: FlushPolicy::Threaded,
            flush_interval: 100,
            ..Default::default()
        };
        with_state(&config, |fx, state| {
            let entry = fx.push(EmitterKind::MethodEntry {
                signature: MethodSignature {
                    return_type: None,
                    ..method_sig("A", "")
                },
                constructor: true,
            });
            let exit = fx.push(EmitterKind::MethodExit { entry });
            fx.emitters.init(entry, state).unwrap();
            fx.emitters.init(exit, state).unwrap();
            assert!(!fx.emitters.get(entry).text.starts_with("try{"));
            assert!(fx.emitters.get(exit).text.is_empty());
        });
    }

    #[test]
    fn flush_directive_is_consumed_by_next_method() {
        let config = InstrumentationConfig::default();
        with_state(&config, |fx, state| {
            state.set_needs_flush();
            let entry = fx.push(EmitterKind::MethodEntry {
                signature: method_sig("run", "void"),
                constructor: false,
            });
            let exit = fx.push(EmitterKind::MethodExit { entry });
            fx.emitters.init(entry, state).unwrap();
            fx.emitters.init(exit, state).unwrap();
            assert!(fx.emitters.get(exit).text.contains(".flushNeeded();"));

            let entry2 = fx.push(EmitterKind::MethodEntry {
                signature: method_sig("other", "void"),
                constructor: false,
            });
            fx.emitters.init(entry2, state).unwrap();
            assert!(!fx.emitters.get(entry2).text.starts_with("try{"));
        });
    }

    #[test]
    fn expression_lambda_wrapper_field_strategy() {
        let config = InstrumentationConfig::default();
        with_state(&config, |fx, state| {
            let entry = fx.push(EmitterKind::LambdaEntry {
                form: LambdaForm::Expression {
                    body: SourceRegion::new(1, 5, 1, 9),
                },
                signature: MethodSignature::lambda("lambda$1".into(), Vec::new()),
            });
            let body = fx.push(EmitterKind::LambdaBody { entry });
            let exit = fx.push(EmitterKind::LambdaExit { entry });
            for id in [entry, body, exit] {
                fx.emitters.init(id, state).unwrap();
            }
            let p = state.recorder_prefix().unwrap().access.clone();
            assert_eq!(fx.emitters.get(entry).text, format!("{p}.lambdaInc(0,"));
            assert!(fx.emitters.get(body).text.is_empty());
            assert_eq!(fx.emitters.get(exit).text, ")");
        });
    }

    #[test]
    fn expression_lambda_wrapper_class_strategy() {
        let config = InstrumentationConfig {
            strategy: RecorderStrategy::Class,
            ..Default::default()
        };
        with_state(&config, |fx, state| {
            let entry = fx.push(EmitterKind::LambdaEntry {
                form: LambdaForm::Expression {
                    body: SourceRegion::new(1, 5, 1, 9),
                },
                signature: MethodSignature::lambda("lambda$1".into(), Vec::new()),
            });
            let exit = fx.push(EmitterKind::LambdaExit { entry });
            fx.emitters.init(entry, state).unwrap();
            fx.emitters.init(exit, state).unwrap();
            let holder = state.recorder_prefix().unwrap().holder.clone();
            assert_eq!(fx.emitters.get(entry).text, format!("{holder}.lambdaInc(0,"));
            assert_eq!(fx.emitters.get(exit).text, ",1)");
        });
    }

    #[test]
    fn void_lambda_is_rewritten_to_block() {
        let config = InstrumentationConfig::default();
        with_state(&config, |fx, state| {
            let entry = fx.push(EmitterKind::LambdaEntry {
                form: LambdaForm::Expression {
                    body: SourceRegion::new(1, 5, 1, 9),
                },
                signature: MethodSignature::lambda("lambda$1".into(), Vec::new()),
            });
            let body = fx.push(EmitterKind::LambdaBody { entry });
            let exit = fx.push(EmitterKind::LambdaExit { entry });
            fx.emitters.init(entry, state).unwrap();
            let lambda = state.session.current_method().unwrap();
            state.session.set_void_return(lambda).unwrap();
            fx.emitters.init(body, state).unwrap();
            fx.emitters.init(exit, state).unwrap();

            let p = state.recorder_prefix().unwrap().access.clone();
            assert!(fx.emitters.get(entry).text.is_empty());
            assert_eq!(fx.emitters.get(body).text, format!("{{{p}.inc(0);"));
            assert_eq!(fx.emitters.get(exit).text, ";}");
        });
    }

    #[test]
    fn case_arm_yield_and_forced_yield() {
        let config = InstrumentationConfig::default();
        with_state(&config, |fx, state| {
            let m = fx.push(EmitterKind::MethodEntry {
                signature: method_sig("run", "int"),
                constructor: false,
            });
            fx.emitters.init(m, state).unwrap();

            let valued = fx.push(EmitterKind::CaseEntry {
                form: CaseForm::Expression { yield_value: true },
            });
            fx.emitters.init(valued, state).unwrap();
            assert!(fx.emitters.get(valued).text.ends_with("yield "));

            let plain = fx.push(EmitterKind::CaseEntry {
                form: CaseForm::Expression { yield_value: false },
            });
            fx.emitters.init(plain, state).unwrap();
            assert!(!fx.emitters.get(plain).text.contains("yield"));

            state.set_needs_yield();
            let forced = fx.push(EmitterKind::CaseEntry {
                form: CaseForm::Expression { yield_value: false },
            });
            let exit = fx.push(EmitterKind::CaseExit { entry: forced });
            fx.emitters.init(forced, state).unwrap();
            fx.emitters.init(exit, state).unwrap();
            assert!(fx.emitters.get(forced).text.ends_with("yield "));
            assert_eq!(fx.emitters.get(exit).text, "}");
        });
    }

    #[test]
    fn recorder_is_only_rendered_for_dirty_classes() {
        let config = InstrumentationConfig::default();
        with_state(&config, |fx, state| {
            let nested_entry = fx.push(EmitterKind::ClassEntry {
                signature: class_sig("Quiet", TypeKind::Class),
                top_level: false,
            });
            let nested_exit = fx.push(EmitterKind::ClassExit {
                entry: nested_entry,
                recorder: None,
            });
            fx.emitters.init(nested_entry, state).unwrap();
            fx.emitters.init(nested_exit, state).unwrap();

            let recorder = fx.push(EmitterKind::Recorder {
                enum_terminator: false,
            });
            let exit = fx.push(EmitterKind::ClassExit {
                entry: EmitterId(0),
                recorder: Some(recorder),
            });
            fx.emitters.init(recorder, state).unwrap();
            fx.emitters.init(exit, state).unwrap();
            assert!(fx.emitters.get(recorder).text.is_empty(), "clean class");
        });
    }

    #[test]
    fn double_init_is_rejected() {
        let config = InstrumentationConfig::default();
        with_state(&config, |fx, state| {
            let s = fx.push(EmitterKind::Statement {
                complexity: 0,
                wrap: false,
                resource: false,
            });
            fx.emitters.init(s, state).unwrap();
            assert!(fx.emitters.init(s, state).is_err());
        });
    }

    #[test]
    fn text_at_joins_in_attachment_order() {
        let mut fx = Fixture::new();
        let a = fx.push(EmitterKind::Recorder {
            enum_terminator: false,
        });
        let b = fx.push(EmitterKind::Recorder {
            enum_terminator: false,
        });
        fx.emitters.emitters[a.index()].text = "A".into();
        fx.emitters.emitters[b.index()].text = "B".into();
        assert_eq!(fx.emitters.text_at(fx.anchor, Placement::Pre), "AB");
        assert_eq!(fx.emitters.text_at(fx.anchor, Placement::Post), "");
    }
}
