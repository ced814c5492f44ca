//! Mutable state threaded through the resolve walk of one file.

use std::path::Path;

use crate::config::InstrumentationConfig;
use crate::context::{Builtin, ContextSet};
use crate::detect::{SourceContext, TestDetector};
use crate::recorder::{RecorderPrefix, recorder_name};
use crate::registry::Session;
use crate::signature::{TypeKind, TypeSignature};

/// What a class entry saved from its enclosing scope.
#[derive(Debug)]
struct ClassFrame {
    outer_dirty: bool,
    outer_detect_tests: bool,
    outer_prefix: Option<RecorderPrefix>,
    outer_owner: Option<TypeSignature>,
}

pub struct InstrumentationState<'a> {
    pub session: &'a mut Session,
    pub config: &'a InstrumentationConfig,
    detector: &'a dyn TestDetector,
    path: &'a Path,
    package: &'a str,
    file_index: usize,

    enabled: bool,
    instr_context: ContextSet,
    dirty: bool,
    needs_flush: bool,
    needs_yield: bool,
    detect_tests: bool,
    prefix: Option<RecorderPrefix>,
    owner: Option<TypeSignature>,
    frames: Vec<ClassFrame>,
    auto_closeable_count: u32,
    has_instrumented: bool,
    recorder_count: u32,
}

impl<'a> InstrumentationState<'a> {
    pub fn new(
        session: &'a mut Session,
        config: &'a InstrumentationConfig,
        detector: &'a dyn TestDetector,
        path: &'a Path,
        package: &'a str,
        file_index: usize,
    ) -> Self {
        Self {
            session,
            config,
            detector,
            path,
            package,
            file_index,
            enabled: true,
            instr_context: ContextSet::EMPTY,
            dirty: false,
            needs_flush: false,
            needs_yield: false,
            detect_tests: false,
            prefix: None,
            owner: None,
            frames: Vec::new(),
            auto_closeable_count: 0,
            has_instrumented: false,
            recorder_count: 0,
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    /// Toggle instrumentation. Disabled regions carry the `off` context.
    pub fn set_enabled(&mut self, enabled: bool) {
        self.enabled = enabled;
        self.instr_context = if enabled {
            self.instr_context.without(Builtin::Off.index())
        } else {
            self.instr_context.with(Builtin::Off.index())
        };
    }

    pub fn instr_context(&self) -> ContextSet {
        self.instr_context
    }

    /// Context recorded for an element: its own plus the current
    /// instrumentation context.
    pub fn element_context(&self, own: ContextSet) -> ContextSet {
        own.union(self.instr_context)
    }

    pub fn is_dirty(&self) -> bool {
        self.dirty
    }

    pub fn mark_dirty(&mut self) {
        self.dirty = true;
    }

    pub fn set_needs_flush(&mut self) {
        self.needs_flush = true;
    }

    pub fn take_needs_flush(&mut self) -> bool {
        std::mem::take(&mut self.needs_flush)
    }

    pub fn set_needs_yield(&mut self) {
        self.needs_yield = true;
    }

    pub fn take_needs_yield(&mut self) -> bool {
        std::mem::take(&mut self.needs_yield)
    }

    pub fn detect_tests(&self) -> bool {
        self.detect_tests
    }

    pub fn detector(&self) -> &dyn TestDetector {
        self.detector
    }

    pub fn source(&self) -> SourceContext<'a> {
        SourceContext {
            path: self.path,
            package: self.package,
        }
    }

    pub fn recorder_prefix(&self) -> Option<&RecorderPrefix> {
        self.prefix.as_ref()
    }

    /// The innermost named type being instrumented.
    pub fn owner(&self) -> Option<&TypeSignature> {
        self.owner.as_ref()
    }

    pub fn next_auto_closeable(&mut self) -> u32 {
        self.auto_closeable_count += 1;
        self.auto_closeable_count
    }

    /// True exactly once per file: for the first recorder rendered.
    pub fn take_first_recorder(&mut self) -> bool {
        !std::mem::replace(&mut self.has_instrumented, true)
    }

    /// Enter a class. Top-level types get a fresh recorder prefix; nested
    /// ones keep the enclosing prefix.
    pub fn push_class(&mut self, signature: TypeSignature, top_level: bool, is_test: bool) {
        let new_prefix = top_level.then(|| {
            let is_enum = signature.kind == TypeKind::Enum;
            let name = recorder_name(
                self.session.version(),
                self.file_index,
                self.recorder_count,
                is_enum,
            );
            self.recorder_count += 1;
            RecorderPrefix::resolve(self.config, name, is_enum)
        });
        self.frames.push(ClassFrame {
            outer_dirty: self.dirty,
            outer_detect_tests: self.detect_tests,
            outer_prefix: self.prefix.clone(),
            outer_owner: self.owner.replace(signature),
        });
        if let Some(prefix) = new_prefix {
            self.prefix = Some(prefix);
        }
        self.dirty = false;
        self.detect_tests = is_test;
    }

    /// Leave a class. Returns whether the class itself produced probes;
    /// afterwards the state is dirty if either the class or its enclosing
    /// scope was.
    pub fn pop_class(&mut self) -> bool {
        let inner_dirty = self.dirty;
        if let Some(frame) = self.frames.pop() {
            self.dirty = frame.outer_dirty || inner_dirty;
            self.detect_tests = frame.outer_detect_tests;
            self.prefix = frame.outer_prefix;
            self.owner = frame.outer_owner;
        }
        inner_dirty
    }
}
