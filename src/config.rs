use std::path::{Path, PathBuf};
use std::str::FromStr;

use toml_edit::{DocumentMut, Item, Table};

use crate::error::Error;

/// Default location of the registry, relative to the working directory.
pub const DEFAULT_REGISTRY: &str = ".stitch/registry.json";

/// How a top-level type reaches its coverage recorder.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RecorderStrategy {
    /// A static recorder field declared in the type itself.
    #[default]
    Field,
    /// A nested holder class that initializes the recorder lazily.
    Class,
}

impl FromStr for RecorderStrategy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "field" => Ok(Self::Field),
            "class" => Ok(Self::Class),
            other => Err(format!("unknown recorder strategy '{other}' (expected field or class)")),
        }
    }
}

/// When the runtime recorder writes its counters out.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FlushPolicy {
    /// Only at shutdown, or where a FLUSH directive asks for it.
    #[default]
    Directed,
    /// Every method exit checks whether the flush interval elapsed.
    Interval,
    /// A background thread flushes; methods still call `maybeFlush`.
    Threaded,
}

impl FlushPolicy {
    pub fn ordinal(self) -> u32 {
        match self {
            Self::Directed => 0,
            Self::Interval => 1,
            Self::Threaded => 2,
        }
    }
}

impl FromStr for FlushPolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "directed" => Ok(Self::Directed),
            "interval" => Ok(Self::Interval),
            "threaded" => Ok(Self::Threaded),
            other => Err(format!(
                "unknown flush policy '{other}' (expected directed, interval or threaded)"
            )),
        }
    }
}

/// A user-defined context: a name and the regex it matches against
/// normalized source text.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NamedContext {
    pub name: String,
    pub pattern: String,
}

#[derive(Debug, Clone)]
pub struct InstrumentationConfig {
    pub registry: Option<PathBuf>,
    pub project_name: String,
    pub encoding: Option<String>,
    pub instr_file_extension: String,
    pub source_extension: String,
    pub strategy: RecorderStrategy,
    pub flush_policy: FlushPolicy,
    /// Milliseconds between flushes for the interval and threaded policies.
    pub flush_interval: u64,
    pub record_test_results: bool,
    pub detect_tests: bool,
    pub java_lang_prefix: String,
    pub init_string: Option<String>,
    pub runtime_class: String,
    pub method_contexts: Vec<NamedContext>,
    pub statement_contexts: Vec<NamedContext>,
    pub include: Vec<String>,
    pub exclude: Vec<String>,
}

impl Default for InstrumentationConfig {
    fn default() -> Self {
        Self {
            registry: None,
            project_name: "stitch".into(),
            encoding: None,
            instr_file_extension: "java".into(),
            source_extension: "java".into(),
            strategy: RecorderStrategy::default(),
            flush_policy: FlushPolicy::default(),
            flush_interval: 0,
            record_test_results: true,
            detect_tests: true,
            java_lang_prefix: "java.lang.".into(),
            init_string: None,
            runtime_class: "stitch_runtime".into(),
            method_contexts: Vec::new(),
            statement_contexts: Vec::new(),
            include: Vec::new(),
            exclude: Vec::new(),
        }
    }
}

impl InstrumentationConfig {
    /// Read a `stitch.toml` from disk.
    pub fn load(path: &Path) -> Result<Self, Error> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            Error::InvalidConfig(format!("failed to read {}: {e}", path.display()))
        })?;
        Self::from_toml(&content)
    }

    /// Parse configuration from TOML text. Missing keys keep their defaults.
    pub fn from_toml(content: &str) -> Result<Self, Error> {
        let doc: DocumentMut = content
            .parse()
            .map_err(|e| Error::InvalidConfig(format!("failed to parse stitch.toml: {e}")))?;

        let mut config = Self::default();

        if let Some(table) = doc.get("instrumentation").and_then(Item::as_table) {
            if let Some(v) = str_value(table, "project")? {
                config.project_name = v;
            }
            if let Some(v) = str_value(table, "registry")? {
                config.registry = Some(PathBuf::from(v));
            }
            config.encoding = str_value(table, "encoding")?.or(config.encoding);
            if let Some(v) = str_value(table, "instr-file-extension")? {
                config.instr_file_extension = v;
            }
            if let Some(v) = str_value(table, "source-extension")? {
                config.source_extension = v;
            }
            if let Some(v) = str_value(table, "strategy")? {
                config.strategy = v.parse().map_err(Error::InvalidConfig)?;
            }
            if let Some(v) = str_value(table, "flush-policy")? {
                config.flush_policy = v.parse().map_err(Error::InvalidConfig)?;
            }
            if let Some(v) = int_value(table, "flush-interval")? {
                config.flush_interval = u64::try_from(v).map_err(|_| {
                    Error::InvalidConfig(format!("flush-interval must not be negative, got {v}"))
                })?;
            }
            if let Some(v) = bool_value(table, "record-test-results")? {
                config.record_test_results = v;
            }
            if let Some(v) = bool_value(table, "detect-tests")? {
                config.detect_tests = v;
            }
            if let Some(v) = str_value(table, "java-lang-prefix")? {
                config.java_lang_prefix = v;
            }
            config.init_string = str_value(table, "init-string")?;
            if let Some(v) = str_value(table, "runtime-class")? {
                config.runtime_class = v;
            }
            config.include = str_list(table, "include")?;
            config.exclude = str_list(table, "exclude")?;
        }

        if let Some(contexts) = doc.get("contexts").and_then(Item::as_table) {
            config.method_contexts = named_contexts(contexts, "method")?;
            config.statement_contexts = named_contexts(contexts, "statement")?;
        }

        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), Error> {
        if self.flush_policy != FlushPolicy::Directed && self.flush_interval == 0 {
            return Err(Error::InvalidConfig(
                "flush-interval must be set for the interval and threaded flush policies".into(),
            ));
        }
        if self.instr_file_extension.is_empty() || self.instr_file_extension.contains('.') {
            return Err(Error::InvalidConfig(format!(
                "instr-file-extension '{}' must be a bare extension",
                self.instr_file_extension
            )));
        }
        Ok(())
    }

    /// The string the runtime recorder uses to locate the registry.
    pub fn init_string(&self) -> String {
        if let Some(init) = &self.init_string {
            return init.clone();
        }
        self.registry
            .as_deref()
            .unwrap_or(Path::new(DEFAULT_REGISTRY))
            .display()
            .to_string()
    }
}

fn type_error(key: &str, expected: &str) -> Error {
    Error::InvalidConfig(format!("'{key}' must be {expected}"))
}

fn str_value(table: &Table, key: &str) -> Result<Option<String>, Error> {
    match table.get(key) {
        None => Ok(None),
        Some(item) => item
            .as_str()
            .map(|s| Some(s.to_owned()))
            .ok_or_else(|| type_error(key, "a string")),
    }
}

fn bool_value(table: &Table, key: &str) -> Result<Option<bool>, Error> {
    match table.get(key) {
        None => Ok(None),
        Some(item) => item
            .as_bool()
            .map(Some)
            .ok_or_else(|| type_error(key, "a boolean")),
    }
}

fn int_value(table: &Table, key: &str) -> Result<Option<i64>, Error> {
    match table.get(key) {
        None => Ok(None),
        Some(item) => item
            .as_integer()
            .map(Some)
            .ok_or_else(|| type_error(key, "an integer")),
    }
}

fn str_list(table: &Table, key: &str) -> Result<Vec<String>, Error> {
    let Some(item) = table.get(key) else {
        return Ok(Vec::new());
    };
    let array = item
        .as_array()
        .ok_or_else(|| type_error(key, "an array of strings"))?;
    array
        .iter()
        .map(|v| {
            v.as_str()
                .map(str::to_owned)
                .ok_or_else(|| type_error(key, "an array of strings"))
        })
        .collect()
}

fn named_contexts(contexts: &Table, kind: &str) -> Result<Vec<NamedContext>, Error> {
    let Some(table) = contexts.get(kind).and_then(Item::as_table) else {
        return Ok(Vec::new());
    };
    table
        .iter()
        .map(|(name, item)| {
            item.as_str()
                .map(|pattern| NamedContext {
                    name: name.to_owned(),
                    pattern: pattern.to_owned(),
                })
                .ok_or_else(|| type_error(&format!("contexts.{kind}.{name}"), "a regex string"))
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_without_any_tables() {
        let config = InstrumentationConfig::from_toml("").unwrap();
        assert_eq!(config.strategy, RecorderStrategy::Field);
        assert_eq!(config.flush_policy, FlushPolicy::Directed);
        assert_eq!(config.instr_file_extension, "java");
        assert!(config.detect_tests);
        assert_eq!(config.init_string(), DEFAULT_REGISTRY);
    }

    #[test]
    fn reads_instrumentation_table() {
        let config = InstrumentationConfig::from_toml(
            r#"
[instrumentation]
project = "billing"
registry = "build/stitch.json"
strategy = "class"
flush-policy = "interval"
flush-interval = 2000
detect-tests = false
exclude = ["**/generated/**"]
"#,
        )
        .unwrap();
        assert_eq!(config.project_name, "billing");
        assert_eq!(config.strategy, RecorderStrategy::Class);
        assert_eq!(config.flush_policy, FlushPolicy::Interval);
        assert_eq!(config.flush_interval, 2000);
        assert!(!config.detect_tests);
        assert_eq!(config.exclude, vec!["**/generated/**".to_string()]);
        assert_eq!(config.init_string(), "build/stitch.json");
    }

    #[test]
    fn reads_custom_contexts() {
        let config = InstrumentationConfig::from_toml(
            r#"
[contexts.method]
getters = "public .* get[A-Z]\\w*\\(\\)"

[contexts.statement]
logging = "LOG\\..*"
"#,
        )
        .unwrap();
        assert_eq!(config.method_contexts.len(), 1);
        assert_eq!(config.method_contexts[0].name, "getters");
        assert_eq!(config.statement_contexts[0].pattern, r"LOG\..*");
    }

    #[test]
    fn interval_policy_requires_interval() {
        let err = InstrumentationConfig::from_toml(
            "[instrumentation]\nflush-policy = \"threaded\"\n",
        )
        .unwrap_err();
        assert!(
            err.to_string().contains("flush-interval"),
            "error should name the missing key: {err}"
        );
    }

    #[test]
    fn wrong_value_type_is_rejected() {
        let err =
            InstrumentationConfig::from_toml("[instrumentation]\ndetect-tests = \"yes\"\n")
                .unwrap_err();
        assert!(err.to_string().contains("detect-tests"), "got: {err}");
    }

    #[test]
    fn unknown_strategy_is_rejected() {
        assert!("lazy".parse::<RecorderStrategy>().is_err());
        assert_eq!("CLASS".parse::<RecorderStrategy>(), Ok(RecorderStrategy::Class));
    }
}
