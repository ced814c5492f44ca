use std::path::{Path, PathBuf};

use ignore::WalkBuilder;
use ignore::overrides::{Override, OverrideBuilder};

use crate::config::InstrumentationConfig;
use crate::error::Error;

/// A source file found under one of the source roots.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SourceFile {
    pub root: PathBuf,
    pub path: PathBuf,
}

impl SourceFile {
    /// Path relative to the source root it was found under.
    pub fn relative(&self) -> &Path {
        self.path.strip_prefix(&self.root).unwrap_or(&self.path)
    }
}

/// Find every file with the configured source extension under `roots`,
/// respecting .gitignore files and the include/exclude globs.
///
/// Globs are matched relative to each root. With no include globs every
/// source file is a candidate. Errors if nothing is found.
pub fn discover_sources(
    roots: &[PathBuf],
    config: &InstrumentationConfig,
) -> Result<Vec<SourceFile>, Error> {
    let mut found = Vec::new();

    for root in roots {
        if root.is_file() {
            found.push(SourceFile {
                root: root.parent().map(Path::to_path_buf).unwrap_or_default(),
                path: root.clone(),
            });
            continue;
        }

        let overrides = build_overrides(root, config)?;
        let walker = WalkBuilder::new(root)
            .hidden(false)
            .follow_links(true)
            .overrides(overrides)
            .filter_entry(|entry| entry.file_name() != ".git")
            .build();

        for entry in walker {
            let entry = entry.map_err(|e| std::io::Error::other(e.to_string()))?;
            let is_source = entry.file_type().is_some_and(|ft| ft.is_file())
                && entry
                    .path()
                    .extension()
                    .is_some_and(|ext| ext == config.source_extension.as_str());
            if is_source {
                found.push(SourceFile {
                    root: root.clone(),
                    path: entry.into_path(),
                });
            }
        }
    }

    if found.is_empty() {
        let desc = roots
            .iter()
            .map(|r| r.display().to_string())
            .collect::<Vec<_>>()
            .join(", ");
        return Err(Error::NoSources(desc));
    }

    // Sort by path for deterministic output and data indices.
    found.sort_by(|a, b| a.path.cmp(&b.path));
    found.dedup_by(|a, b| a.path == b.path);
    Ok(found)
}

fn build_overrides(root: &Path, config: &InstrumentationConfig) -> Result<Override, Error> {
    let mut builder = OverrideBuilder::new(root);
    let invalid = |glob: &str, e: ignore::Error| {
        Error::InvalidConfig(format!("invalid glob '{glob}': {e}"))
    };
    for glob in &config.include {
        builder.add(glob).map_err(|e| invalid(glob, e))?;
    }
    for glob in &config.exclude {
        builder
            .add(&format!("!{glob}"))
            .map_err(|e| invalid(glob, e))?;
    }
    builder
        .build()
        .map_err(|e| Error::InvalidConfig(format!("invalid source globs: {e}")))
}

#[cfg(test)]
mod tests {
    use std::fs;

    use tempfile::TempDir;

    use super::*;

    /// Build a small source tree inside `dir/src/`.
    fn create_test_tree(dir: &Path) -> PathBuf {
        let src = dir.join("src");
        fs::create_dir_all(src.join("com/example/generated")).unwrap();
        fs::create_dir_all(src.join("com/example/util")).unwrap();

        fs::write(src.join("com/example/App.java"), "class App {}\n").unwrap();
        fs::write(src.join("com/example/util/Strings.java"), "class Strings {}\n").unwrap();
        fs::write(
            src.join("com/example/generated/Parser.java"),
            "class Parser {}\n",
        )
        .unwrap();
        fs::write(src.join("com/example/notes.txt"), "not a source\n").unwrap();
        src
    }

    fn relative_paths(files: &[SourceFile]) -> Vec<String> {
        files
            .iter()
            .map(|f| f.relative().to_string_lossy().replace('\\', "/"))
            .collect()
    }

    #[test]
    fn finds_sources_by_extension() {
        let tmp = TempDir::new().unwrap();
        let src = create_test_tree(tmp.path());

        let files = discover_sources(&[src], &InstrumentationConfig::default()).unwrap();
        assert_eq!(
            relative_paths(&files),
            vec![
                "com/example/App.java",
                "com/example/generated/Parser.java",
                "com/example/util/Strings.java",
            ]
        );
    }

    #[test]
    fn exclude_globs_skip_matching_files() {
        let tmp = TempDir::new().unwrap();
        let src = create_test_tree(tmp.path());

        let config = InstrumentationConfig {
            exclude: vec!["**/generated/**".into()],
            ..Default::default()
        };
        let files = discover_sources(&[src], &config).unwrap();
        let paths = relative_paths(&files);
        assert!(
            !paths.iter().any(|p| p.contains("generated")),
            "generated sources should be excluded: {paths:?}"
        );
        assert_eq!(paths.len(), 2);
    }

    #[test]
    fn include_globs_narrow_the_set() {
        let tmp = TempDir::new().unwrap();
        let src = create_test_tree(tmp.path());

        let config = InstrumentationConfig {
            include: vec!["**/util/*.java".into()],
            ..Default::default()
        };
        let files = discover_sources(&[src], &config).unwrap();
        assert_eq!(relative_paths(&files), vec!["com/example/util/Strings.java"]);
    }

    #[test]
    fn gitignored_sources_are_skipped() {
        let tmp = TempDir::new().unwrap();
        let src = create_test_tree(tmp.path());
        // The ignore crate only honours .gitignore inside a repository.
        fs::create_dir_all(src.join(".git")).unwrap();
        fs::write(src.join(".gitignore"), "generated/\n").unwrap();

        let files = discover_sources(&[src], &InstrumentationConfig::default()).unwrap();
        assert_eq!(files.len(), 2);
    }

    #[test]
    fn single_file_root_is_accepted() {
        let tmp = TempDir::new().unwrap();
        let src = create_test_tree(tmp.path());
        let file = src.join("com/example/App.java");

        let files = discover_sources(&[file.clone()], &InstrumentationConfig::default()).unwrap();
        assert_eq!(files.len(), 1);
        assert_eq!(files[0].path, file);
    }

    #[test]
    fn no_sources_returns_error() {
        let tmp = TempDir::new().unwrap();
        fs::write(tmp.path().join("README.md"), "# nothing here\n").unwrap();

        let err = discover_sources(&[tmp.path().to_path_buf()], &InstrumentationConfig::default())
            .unwrap_err();
        assert!(
            err.to_string().contains("no source files"),
            "error should say what is missing: {err}"
        );
    }
}
