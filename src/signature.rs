//! Declarations as the recognizer sees them: modifiers, annotations, doc
//! tags and the pieces of a type or method header.

use std::collections::BTreeMap;
use std::fmt::Write as _;

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Annotation {
    /// Name as written, possibly qualified (`org.junit.Test`).
    pub name: String,
    /// Argument text inside the parentheses, if any.
    pub args: String,
}

impl Annotation {
    pub fn simple_name(&self) -> &str {
        self.name.rsplit('.').next().unwrap_or(&self.name)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Modifiers {
    pub keywords: Vec<String>,
    pub annotations: Vec<Annotation>,
    pub doc_tags: BTreeMap<String, Vec<String>>,
}

impl Modifiers {
    pub fn has(&self, keyword: &str) -> bool {
        self.keywords.iter().any(|k| k == keyword)
    }

    pub fn has_annotation(&self, simple_name: &str) -> bool {
        self.annotations.iter().any(|a| a.simple_name() == simple_name)
    }

    pub fn has_doc_tag(&self, tag: &str) -> bool {
        self.doc_tags.contains_key(tag)
    }

    pub fn is_deprecated(&self) -> bool {
        self.has_annotation("Deprecated") || self.has_doc_tag("deprecated")
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TypeKind {
    Class,
    Interface,
    Enum,
    Record,
    Annotation,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TypeSignature {
    pub name: String,
    pub kind: TypeKind,
    pub modifiers: Modifiers,
    pub superclass: Option<String>,
    pub interfaces: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Parameter {
    pub ty: String,
    pub name: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MethodSignature {
    pub name: String,
    pub modifiers: Modifiers,
    pub type_params: String,
    /// `None` for constructors and lambdas.
    pub return_type: Option<String>,
    pub params: Vec<Parameter>,
    pub throws: Vec<String>,
}

impl MethodSignature {
    pub fn lambda(name: String, params: Vec<Parameter>) -> Self {
        Self {
            name,
            modifiers: Modifiers::default(),
            type_params: String::new(),
            return_type: None,
            params,
            throws: Vec::new(),
        }
    }

    pub fn returns_void(&self) -> bool {
        self.return_type.as_deref() == Some("void")
    }

    /// Header text with single spaces, e.g.
    /// `public static int add(int a, int b) throws IOException`.
    pub fn normalized(&self) -> String {
        let mut out = String::new();
        for keyword in &self.modifiers.keywords {
            out.push_str(keyword);
            out.push(' ');
        }
        if !self.type_params.is_empty() {
            out.push_str(&self.type_params);
            out.push(' ');
        }
        if let Some(ret) = &self.return_type {
            out.push_str(ret);
            out.push(' ');
        }
        out.push_str(&self.name);
        out.push('(');
        for (i, p) in self.params.iter().enumerate() {
            if i > 0 {
                out.push_str(", ");
            }
            if p.ty.is_empty() {
                out.push_str(&p.name);
            } else {
                let _ = write!(out, "{} {}", p.ty, p.name);
            }
        }
        out.push(')');
        if !self.throws.is_empty() {
            out.push_str(" throws ");
            out.push_str(&self.throws.join(", "));
        }
        out
    }
}
