//! Test detection: decides which types and methods are tests so the
//! recorder can attribute coverage per test.

use std::path::Path;

use crate::signature::{MethodSignature, TypeSignature};

/// Where the declaration being checked lives.
#[derive(Debug, Clone, Copy)]
pub struct SourceContext<'a> {
    pub path: &'a Path,
    pub package: &'a str,
}

pub trait TestDetector {
    fn is_type_match(&self, source: &SourceContext<'_>, ty: &TypeSignature) -> bool;

    /// `owner` is the closest named type around the method.
    fn is_method_match(
        &self,
        source: &SourceContext<'_>,
        owner: &TypeSignature,
        method: &MethodSignature,
    ) -> bool;
}

const TEST_TYPE_ANNOTATIONS: &[&str] = &["RunWith", "ExtendWith", "Suite", "TestInstance", "Nested"];

const TEST_METHOD_ANNOTATIONS: &[&str] = &[
    "Test",
    "ParameterizedTest",
    "RepeatedTest",
    "TestFactory",
    "TestTemplate",
];

/// JUnit 3/4/5 and TestNG conventions.
#[derive(Debug, Default, Clone, Copy)]
pub struct DefaultTestDetector;

impl DefaultTestDetector {
    fn extends_test_case(ty: &TypeSignature) -> bool {
        ty.superclass
            .as_deref()
            .map(|s| s.rsplit('.').next().unwrap_or(s))
            .is_some_and(|s| s.ends_with("TestCase"))
    }
}

impl TestDetector for DefaultTestDetector {
    fn is_type_match(&self, _source: &SourceContext<'_>, ty: &TypeSignature) -> bool {
        let name = ty.name.as_str();
        name.ends_with("Test")
            || name.ends_with("Tests")
            || name.ends_with("TestCase")
            || name.starts_with("Test")
            || TEST_TYPE_ANNOTATIONS
                .iter()
                .any(|a| ty.modifiers.has_annotation(a))
            || ty.modifiers.has_doc_tag("testng.test")
            || Self::extends_test_case(ty)
    }

    fn is_method_match(
        &self,
        _source: &SourceContext<'_>,
        owner: &TypeSignature,
        method: &MethodSignature,
    ) -> bool {
        let mods = &method.modifiers;
        if TEST_METHOD_ANNOTATIONS.iter().any(|a| mods.has_annotation(a)) {
            return true;
        }
        if mods.has_doc_tag("test") || mods.has_doc_tag("testng.test") {
            return true;
        }
        // JUnit 3: public void testXxx() in a TestCase subclass.
        Self::extends_test_case(owner)
            && mods.has("public")
            && !mods.has("static")
            && method.returns_void()
            && method.params.is_empty()
            && method.name.starts_with("test")
    }
}
