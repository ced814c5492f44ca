//! A file whose instrumentation is switched off from the first byte must
//! come back unchanged apart from the marker.

use std::path::Path;

use pretty_assertions::assert_eq;
use stitch::config::InstrumentationConfig;
use stitch::filter::marker;
use stitch::instrumenter::Instrumenter;
use stitch::registry::Registry;

const SHAPE: &str = r#"/* STITCH:OFF */
package com.example.shapes;

import java.util.List;
import java.util.function.Function;
import static java.lang.Math.max;

/**
 * A shape with a name.
 * @since 1.2
 */
@SuppressWarnings({"unchecked", "rawtypes"})
public final class Shape<T extends Comparable<? super T>> implements Comparable<Shape<T>> {
	private static final int[] SIDES = {3, 4, 5};
	private final String name = "héllo\tworld";
	private char sep = '\'';

	enum Kind { ROUND, SQUARE; int weight() { return ordinal() * 2; } }

	public Shape(String name) {
		this(name, 0);
	}

	Shape(String name, int n) {
		super();
		label:
		for (int i = 0; i < n; i++) {
			if (i % 2 == 0) continue label; else break;
		}
	}

	public <R> List<R> map(Function<? super T, ? extends R> f, List<T> in) {
		return in.stream().map(x -> f.apply(x)).toList();   // trailing comment
	}

	int area(Kind kind) {
		int a = switch (kind) {
			case ROUND -> 3;
			case SQUARE -> { yield 4; }
		};
		return a > 3 ? max(a, 1) : a << 1 >> 1 >>> 0;
	}

	String text() {
		String block = """
			Hello, "shape"
			""";
		try (var r = new java.io.StringReader(block)) {
			return block;
		} catch (java.io.IOException e) {
			throw new IllegalStateException(e);
		} finally {
			Runnable done = new Runnable() {
				@Override public void run() { }
			};
		}
	}

	@Override
	public int compareTo(Shape<T> o) { return name.compareTo(o.name); }
}
"#;

fn instrument(name: &str, src: &str) -> (String, Registry) {
    let dir = tempfile::tempdir().unwrap();
    let config = InstrumentationConfig {
        registry: Some(dir.path().join("registry.json")),
        ..Default::default()
    };
    let mut instr = Instrumenter::new(config).unwrap();
    instr.start_instrumentation().unwrap();
    let out = instr
        .instrument_source(Path::new(name), src, None)
        .unwrap();
    let registry = instr.end_instrumentation(false).unwrap();
    (out, registry)
}

#[test]
fn disabled_file_is_reproduced_exactly() {
    let (out, registry) = instrument("Shape.java", SHAPE);
    assert_eq!(out, format!("{}{SHAPE}", marker()));

    // Switched off is not the same as unseen: the structure is still recorded.
    let file = &registry.files[0];
    assert_eq!(file.package, "com.example.shapes");
    assert!(file.statements.iter().all(|s| !s.instrumented));
    assert!(!file.statements.is_empty());
    assert!(file.methods.len() >= 7, "methods and lambdas: {}", file.methods.len());
}

#[test]
fn crlf_line_endings_survive() {
    let src = SHAPE.replace('\n', "\r\n");
    let (out, _) = instrument("Shape.java", &src);
    assert_eq!(out, format!("{}{src}", marker()));
}

#[test]
fn file_without_trailing_newline_survives() {
    let src = "// STITCH:OFF\nclass A { void f() { g(); } }";
    let (out, registry) = instrument("A.java", src);
    assert_eq!(out, format!("{}{src}", marker()));
    assert_eq!(registry.files[0].line_count, 2);
}

#[test]
fn marker_keeps_line_numbers_aligned() {
    let src = "class A {\n  void f() {\n    g();\n  }\n}\n";
    let (out, _) = instrument("A.java", src);
    for (line, (before, after)) in src.lines().zip(out.lines()).enumerate().skip(1) {
        assert!(
            after.contains(before.trim()),
            "line {} moved: {before:?} vs {after:?}",
            line + 1
        );
    }
    assert_eq!(out.lines().count(), src.lines().count());
}
