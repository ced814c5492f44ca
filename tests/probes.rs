//! Probe placement and registry bookkeeping on small, complete sources.

use std::path::Path;

use stitch::config::{InstrumentationConfig, RecorderStrategy};
use stitch::instrumenter::Instrumenter;
use stitch::registry::Registry;

struct Run {
    out: String,
    registry: Registry,
    stats: stitch::instrumenter::RunStatistics,
}

fn run_with(config: InstrumentationConfig, src: &str) -> Run {
    let dir = tempfile::tempdir().unwrap();
    let config = InstrumentationConfig {
        registry: Some(dir.path().join("registry.json")),
        ..config
    };
    let mut instr = Instrumenter::new(config).unwrap();
    instr.start_instrumentation().unwrap();
    let out = instr
        .instrument_source(Path::new("Probe.java"), src, None)
        .unwrap();
    let stats = instr.statistics().clone();
    let registry = instr.end_instrumentation(false).unwrap();
    Run {
        out,
        registry,
        stats,
    }
}

fn run(src: &str) -> Run {
    run_with(InstrumentationConfig::default(), src)
}

/// Name of the first recorder a probe calls through.
fn recorder(out: &str) -> &str {
    out.match_indices("__STCH")
        .map(|(start, _)| {
            let len = out[start..]
                .find(|c: char| !(c.is_ascii_alphanumeric() || c == '_'))
                .unwrap_or(out.len() - start);
            (&out[start..start + len], &out[start + len..])
        })
        .find(|(_, rest)| rest.starts_with('.'))
        .map(|(name, _)| name)
        .expect("no probe in output")
}

#[test]
fn off_then_on_scopes_probes_to_the_second_if() {
    let r = run(r#"class A {
    int y, z;
    void m(int x, boolean flag, boolean other) {
        // STITCH:OFF
        if (x > 0) { y = 1; }
        // STITCH:ON
        if (flag && other) { z = 2; }
    }
}
"#);
    let file = &r.registry.files[0];
    let p = recorder(&r.out);

    assert_eq!(file.statements.len(), 4);
    let instrumented: Vec<bool> = file.statements.iter().map(|s| s.instrumented).collect();
    assert_eq!(instrumented, vec![false, false, true, true]);
    assert_eq!(file.branches.len(), 2);
    assert!(!file.branches[0].instrumented);
    assert!(file.branches[1].instrumented);
    assert_eq!(file.branches[1].complexity, 2);

    assert!(r.out.contains("        if (x > 0) { y = 1; }\n"), "{}", r.out);

    let s = file.statements[2].data_index;
    let b = file.branches[1].data_index;
    let body = file.statements[3].data_index;
    assert!(s < b && b + 1 < body, "indices increase: {s} {b} {body}");
    let expected = format!(
        "{p}.inc({s});if ((((flag && other)&&({p}.iget({b})!=0|true))||({p}.iget({})==0&false))) {{ {p}.inc({body});z = 2; }}",
        b + 1
    );
    assert!(r.out.contains(&expected), "expected {expected}\nin {}", r.out);
}

#[test]
fn directives_do_not_leak_into_the_next_file() {
    let dir = tempfile::tempdir().unwrap();
    let config = InstrumentationConfig {
        registry: Some(dir.path().join("registry.json")),
        ..Default::default()
    };
    let mut instr = Instrumenter::new(config).unwrap();
    instr.start_instrumentation().unwrap();
    instr
        .instrument_source(
            Path::new("A.java"),
            "class A { void f() { /* STITCH:OFF */ g(); } }",
            None,
        )
        .unwrap();
    let out = instr
        .instrument_source(Path::new("B.java"), "class B { void f() { g(); } }", None)
        .unwrap();
    assert!(out.contains(".inc(") && out.contains("g();"), "{out}");
    let registry = instr.end_instrumentation(false).unwrap();
    let b = registry
        .files
        .iter()
        .find(|f| f.path.ends_with("B.java"))
        .unwrap();
    assert!(b.statements.iter().all(|s| s.instrumented));
}

#[test]
fn constant_and_assignment_conditions_are_not_branches() {
    let r = run(r#"class A {
    void f(boolean a) {
        while (true) { break; }
        if (a = check()) { go(); }
        if (a) { go(); }
    }
}
"#);
    let file = &r.registry.files[0];
    let instrumented: Vec<bool> = file.branches.iter().map(|b| b.instrumented).collect();
    assert_eq!(instrumented, vec![false, false, true]);
    assert!(r.out.contains("while (true) {"), "{}", r.out);
    assert!(r.out.contains("if (a = check()) {"), "{}", r.out);
    assert_eq!(file.branches[0].complexity, 0, "constants add no complexity");
    assert_eq!(file.branches[2].complexity, 1);
}

#[test]
fn unbraced_bodies_get_braces_with_their_probe() {
    let r = run("class A {\n  void f(boolean a) {\n    if (a) go(); else stop();\n  }\n}\n");
    let p = recorder(&r.out);
    let file = &r.registry.files[0];
    let then_index = file.statements[1].data_index;
    let else_index = file.statements[2].data_index;
    assert!(
        r.out.contains(&format!("{{{p}.inc({then_index});go();}} else {{{p}.inc({else_index});stop();}}")),
        "{}",
        r.out
    );
}

#[test]
fn expression_lambda_keeps_its_value_under_field_strategy() {
    let r = run(r#"class L {
    void run() {
        java.util.function.IntUnaryOperator g = x -> x + 1;
    }
}
"#);
    let p = recorder(&r.out);
    let file = &r.registry.files[0];
    let lambda = file.methods.iter().find(|m| m.is_lambda).unwrap();
    let i = lambda.data_index;
    assert!(
        r.out.contains(&format!("g = {p}.lambdaInc({i},x -> x + 1);")),
        "{}",
        r.out
    );
}

#[test]
fn expression_lambda_counts_its_body_under_class_strategy() {
    let config = InstrumentationConfig {
        strategy: RecorderStrategy::Class,
        ..Default::default()
    };
    let r = run_with(
        config,
        r#"class L {
    void run() {
        java.util.function.IntUnaryOperator g = x -> x + 1;
    }
}
"#,
    );
    let holder = recorder(&r.out);
    let file = &r.registry.files[0];
    let lambda = file.methods.iter().find(|m| m.is_lambda).unwrap();
    let i = lambda.data_index;
    assert!(
        r.out.contains(&format!("g = {holder}.lambdaInc({i},x -> x + 1,{})", i + 1)),
        "{}",
        r.out
    );
    assert!(r.out.contains(&format!("public static class {holder}{{")));
}

#[test]
fn void_directive_turns_lambda_body_into_a_block() {
    let r = run(r#"class L {
    void run() {
        Runnable r = () -> /* STITCH:VOID */ System.out.println("x");
    }
}
"#);
    let p = recorder(&r.out);
    let file = &r.registry.files[0];
    let lambda = file.methods.iter().find(|m| m.is_lambda).unwrap();
    assert!(lambda.void_return);
    let i = lambda.data_index;
    assert!(
        r.out.contains(&format!(
            "() -> /* STITCH:VOID */ {{{p}.inc({i});System.out.println(\"x\");}};"
        )),
        "{}",
        r.out
    );
}

#[test]
fn case_arrows_in_switch_expressions_yield_their_value() {
    let r = run(r#"class S {
    int f(int k) {
        return switch (k) {
            case 1 -> 10;
            default -> { yield 0; }
        };
    }
}
"#);
    let p = recorder(&r.out);
    assert!(r.out.contains("case 1 -> {"), "{}", r.out);
    assert!(r.out.contains(&format!("yield 10;}}")), "{}", r.out);
    assert!(r.out.contains(&format!("default -> {{{p}.inc(")), "{}", r.out);
}

#[test]
fn three_classes_seven_methods() {
    let r = run(r#"package stats;

class One { void a() {} void b() {} }

class Two {
    Two() {}
    void c() { Runnable r = () -> {}; }
    int d() { return 1; }
}

interface Three {
    default void e() {}
    void notCounted();
    static int f() { return 2; }
}
"#);
    assert_eq!(r.stats.files, 1);
    assert_eq!(r.stats.classes, 3);
    assert_eq!(r.stats.methods, 7);
    assert_eq!(r.stats.test_methods, 0);
    assert_eq!(r.stats.lambdas, 1);
    assert_eq!(r.stats.packages.len(), 1);
    assert_eq!(r.registry.files[0].metrics().methods, 7);
}

#[test]
fn nested_and_local_types_count_but_anonymous_bodies_do_not() {
    let r = run(r#"package nest;

public class Outer {
    static class Inner { void a() {} }
    interface Callback { void done(); }
    enum Mode { FAST, SLOW; boolean quick() { return this == FAST; } }

    void b() {
        Callback c = new Callback() {
            public void done() { b(); }
        };
        class Local { void d() {} }
        new Thread(() -> {}).start();
    }
}
"#);
    assert_eq!(r.stats.classes, 5);
    // a, quick, b, the anonymous done and d; the abstract done has no body.
    assert_eq!(r.stats.methods, 5);
    assert_eq!(r.stats.lambdas, 1);

    let mut names: Vec<&str> = r.registry.files[0]
        .classes
        .iter()
        .map(|c| c.name.as_str())
        .collect();
    names.sort_unstable();
    assert_eq!(names, vec!["Callback", "Inner", "Local", "Mode", "Outer"]);

    let anonymous_done = r.registry.files[0]
        .methods
        .iter()
        .find(|m| m.name == "done")
        .expect("the anonymous body's method is registered");
    assert_eq!(r.registry.files[0].classes[anonymous_done.class].name, "Outer");
}

#[test]
fn test_methods_are_counted_from_annotations() {
    let r = run(r#"import org.junit.Test;

public class ParserTest {
    @Test
    public void parsesEmptyInput() { check(""); }

    private void check(String s) { }
}
"#);
    assert_eq!(r.stats.methods, 2);
    assert_eq!(r.stats.test_methods, 1);
}

#[test]
fn constructors_probe_after_explicit_super_call() {
    let r = run("class C extends B {\n  C(int x) {\n    super(x);\n    init();\n  }\n}\n");
    let p = recorder(&r.out);
    let ctor = &r.registry.files[0].methods[0];
    assert!(
        r.out.contains(&format!("super(x);{p}.inc({});", ctor.data_index)),
        "{}",
        r.out
    );
    assert!(!r.out.contains("finally"), "constructors never get a finally");
}

#[test]
fn flush_directive_adds_a_finally_to_the_next_method() {
    let r = run(r#"class F {
    // STITCH:FLUSH
    void flushed() { work(); }
    void plain() { work(); }
}
"#);
    let p = recorder(&r.out);
    assert_eq!(r.out.matches("try{").count(), 1, "{}", r.out);
    assert!(r.out.contains(&format!("}}finally{{{p}.flushNeeded();}}")), "{}", r.out);
}

#[test]
fn try_with_resources_gets_a_probe_resource() {
    let r = run(r#"class T {
    void f() throws Exception {
        try (var in = open()) { in.read(); }
    }
}
"#);
    let p = recorder(&r.out);
    assert!(
        r.out.contains(&format!("try (final java.lang.AutoCloseable __STCH_AC1={p}.resourceInc(")),
        "{}",
        r.out
    );
}
