use std::path::Path;

fn main() {
    // Read the recorder runtime version at compile time so instrumented
    // sources are stamped with the runtime they must be run against, not
    // with the instrumenter's own package version.
    let manifest = Path::new("Cargo.toml");
    println!("cargo::rerun-if-changed={}", manifest.display());

    let contents = std::fs::read_to_string(manifest).expect("failed to read Cargo.toml");
    let version = contents
        .parse::<toml_edit::DocumentMut>()
        .expect("failed to parse Cargo.toml")
        .get("package")
        .and_then(|p| p.get("metadata"))
        .and_then(|m| m.get("stitch"))
        .and_then(|s| s.get("runtime-version"))
        .and_then(|v| v.as_str())
        .map(str::to_owned)
        // Fall back to the package version (kept in sync at release time).
        .unwrap_or_else(|| std::env::var("CARGO_PKG_VERSION").expect("CARGO_PKG_VERSION not set"));

    println!("cargo::rustc-env=STITCH_RUNTIME_VERSION={version}");
}
