use std::path::PathBuf;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("{} has already been instrumented -- restore the original source first", path.display())]
    DoubleInstrumentation { path: PathBuf },

    #[error("failed to parse {}:{line}:{column}: {message}", path.display())]
    Parse {
        path: PathBuf,
        line: u32,
        column: u32,
        message: String,
    },

    #[error("unsupported source encoding '{encoding}'")]
    Encoding { encoding: String },

    #[error("{} is not valid {encoding}", path.display())]
    Decode { path: PathBuf, encoding: String },

    #[error("failed to create output directory {}: {source}", path.display())]
    CreateDir {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to copy {} to {}: {source}", from.display(), to.display())]
    Copy {
        from: PathBuf,
        to: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to read source file {}: {source}", path.display())]
    SourceRead {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to read registry {}: {source}", path.display())]
    RegistryRead {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to write registry {}: {source}", path.display())]
    RegistryWrite {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid registry data in {}: {reason}", path.display())]
    InvalidRegistry { path: PathBuf, reason: String },

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("invalid regex for context '{name}': {source}")]
    InvalidContext {
        name: String,
        #[source]
        source: regex::Error,
    },

    #[error("instrumentation has not been started -- call start_instrumentation first")]
    NotStarted,

    #[error("instrumentation run aborted after {} failed -- fix it and start again", path.display())]
    Aborted { path: PathBuf },

    #[error("registry session out of order: {0}")]
    Session(String),

    #[error("no source files found under {0}")]
    NoSources(String),

    #[error("{0}")]
    Io(#[from] std::io::Error),
}
