//! Source-level coverage instrumentation for Java-family sources.
//!
//! A file flows through the [`filter::TokenStreamFilter`], which lexes it
//! lazily while the [`recognizer::Recognizer`] attaches emitters to tokens.
//! The filter then resolves every emitter against an
//! [`state::InstrumentationState`] and writes the source back out with
//! probe text around the tokens. [`instrumenter::Instrumenter`] runs that
//! pipeline per file and keeps the [`registry::Registry`] up to date.

pub mod analysis;
pub mod config;
pub mod context;
pub mod detect;
pub mod emitter;
pub mod error;
pub mod filter;
pub mod instrumenter;
pub mod lexer;
pub mod recognizer;
pub mod recorder;
pub mod registry;
pub mod resolve;
pub mod signature;
pub mod state;
pub mod token;
