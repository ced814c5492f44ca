//! Per-file pipeline and run-level bookkeeping.

use std::collections::BTreeSet;
use std::fmt::Write as _;
use std::io::Write as _;
use std::path::{Path, PathBuf};
use std::time::{Instant, UNIX_EPOCH};

use tracing::{debug, error, info};

use crate::config::{DEFAULT_REGISTRY, InstrumentationConfig};
use crate::context::{ContextStore, ContextTree};
use crate::detect::{DefaultTestDetector, TestDetector};
use crate::error::Error;
use crate::filter::{TokenStreamFilter, guard_against_double_instrumentation};
use crate::recognizer::{FileStructure, Recognizer};
use crate::registry::{FileInfo, NewFile, Registry, Session};

const UTF8_BOM: &[u8] = b"\xEF\xBB\xBF";

/// Character encodings a source file may be read and written in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SourceEncoding {
    #[default]
    Utf8,
    Ascii,
    Latin1,
}

impl SourceEncoding {
    pub fn from_name(name: &str) -> Result<Self, Error> {
        let normalized = name.to_ascii_lowercase().replace('_', "-");
        match normalized.as_str() {
            "utf-8" | "utf8" => Ok(Self::Utf8),
            "us-ascii" | "ascii" => Ok(Self::Ascii),
            "iso-8859-1" | "latin1" | "latin-1" => Ok(Self::Latin1),
            _ => Err(Error::Encoding {
                encoding: name.to_owned(),
            }),
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            Self::Utf8 => "UTF-8",
            Self::Ascii => "US-ASCII",
            Self::Latin1 => "ISO-8859-1",
        }
    }

    pub fn decode(self, path: &Path, bytes: &[u8]) -> Result<String, Error> {
        let invalid = || Error::Decode {
            path: path.to_path_buf(),
            encoding: self.name().to_owned(),
        };
        match self {
            Self::Utf8 => std::str::from_utf8(bytes)
                .map(str::to_owned)
                .map_err(|_| invalid()),
            Self::Ascii if bytes.is_ascii() => Ok(bytes.iter().map(|&b| b as char).collect()),
            Self::Ascii => Err(invalid()),
            Self::Latin1 => Ok(bytes.iter().map(|&b| b as char).collect()),
        }
    }

    /// Characters the encoding cannot represent are written as `\uXXXX`
    /// escapes (UTF-16 code units), which the compiler reads back as the
    /// same character.
    pub fn encode(self, text: &str) -> Vec<u8> {
        let limit = match self {
            Self::Utf8 => return text.as_bytes().to_vec(),
            Self::Ascii => 0x80,
            Self::Latin1 => 0x100,
        };
        let mut out = Vec::with_capacity(text.len());
        let mut units = [0u16; 2];
        for c in text.chars() {
            if (c as u32) < limit {
                out.push(c as u8);
            } else {
                for unit in c.encode_utf16(&mut units) {
                    let mut escape = String::with_capacity(6);
                    let _ = write!(escape, "\\u{unit:04x}");
                    out.extend_from_slice(escape.as_bytes());
                }
            }
        }
        out
    }
}

/// Additive counters over the files of one run.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RunStatistics {
    pub files: u32,
    pub packages: BTreeSet<String>,
    pub classes: u32,
    pub methods: u32,
    pub test_methods: u32,
    pub lambdas: u32,
    pub loc: u64,
    pub ncloc: u64,
}

impl RunStatistics {
    fn record(&mut self, file: &FileInfo) {
        let metrics = file.metrics();
        self.files += 1;
        self.packages.insert(file.package.clone());
        self.classes += metrics.classes;
        self.methods += metrics.methods;
        self.test_methods += metrics.test_methods;
        self.lambdas += metrics.lambdas;
        self.loc += u64::from(metrics.line_count);
        self.ncloc += u64::from(metrics.ncloc);
    }
}

/// What the registry records about the raw input, gathered before parsing.
struct SourceMeta {
    checksum: String,
    size: u64,
    timestamp: u64,
    encoding: SourceEncoding,
}

struct Started {
    registry: Registry,
    session: Session,
    at: Instant,
    /// Source whose failure ended the run. A failed file may leave
    /// allocated slots behind, so the session can no longer be saved.
    failed: Option<PathBuf>,
}

/// Instruments source files one at a time against a registry session.
///
/// ```text
/// start_instrumentation -> instrument* -> end_instrumentation
/// ```
pub struct Instrumenter {
    config: InstrumentationConfig,
    contexts: ContextStore,
    detector: Box<dyn TestDetector>,
    run: Option<Started>,
    tree: ContextTree,
    stats: RunStatistics,
    file_index: usize,
}

impl Instrumenter {
    pub fn new(config: InstrumentationConfig) -> Result<Self, Error> {
        config.validate()?;
        let contexts = ContextStore::from_config(&config)?;
        Ok(Self {
            config,
            contexts,
            detector: Box::new(DefaultTestDetector),
            run: None,
            tree: ContextTree::new(),
            stats: RunStatistics::default(),
            file_index: 0,
        })
    }

    pub fn with_detector(mut self, detector: Box<dyn TestDetector>) -> Self {
        self.detector = detector;
        self
    }

    pub fn config(&self) -> &InstrumentationConfig {
        &self.config
    }

    pub fn statistics(&self) -> &RunStatistics {
        &self.stats
    }

    pub fn registry_path(&self) -> PathBuf {
        self.config
            .registry
            .clone()
            .unwrap_or_else(|| PathBuf::from(DEFAULT_REGISTRY))
    }

    /// Open (or create) the configured registry and start a session on it.
    pub fn start_instrumentation(&mut self) -> Result<(), Error> {
        let registry = Registry::create_or_load(&self.registry_path(), &self.config.project_name)?;
        self.start_with_registry(registry);
        Ok(())
    }

    pub fn start_with_registry(&mut self, registry: Registry) {
        let mut session = registry.start_session();
        session.set_contexts(self.contexts.names());
        self.stats = RunStatistics::default();
        self.tree = ContextTree::new();
        self.file_index = 0;
        info!(
            "instrumenting with {:?} recorders, {:?} flush policy",
            self.config.strategy, self.config.flush_policy
        );
        self.run = Some(Started {
            registry,
            session,
            at: Instant::now(),
            failed: None,
        });
    }

    /// Instrument `source` into `dest_root`, under its package directory.
    /// Returns the path written.
    pub fn instrument(
        &mut self,
        source: &Path,
        dest_root: &Path,
        encoding: Option<&str>,
    ) -> Result<PathBuf, Error> {
        self.check_running()?;
        let result = self.instrument_file(source, dest_root, encoding);
        self.fail_on_error(source, result)
    }

    fn check_running(&self) -> Result<(), Error> {
        match &self.run {
            None => Err(Error::NotStarted),
            Some(Started {
                failed: Some(path), ..
            }) => Err(Error::Aborted { path: path.clone() }),
            Some(_) => Ok(()),
        }
    }

    /// Any failure is fatal to the run: the file is dropped from the
    /// session and every later call is refused.
    fn fail_on_error<T>(&mut self, source: &Path, result: Result<T, Error>) -> Result<T, Error> {
        if let Err(e) = &result {
            if let Some(run) = self.run.as_mut() {
                run.session.discard_file();
                run.failed = Some(source.to_path_buf());
            }
            error!("{e}");
        }
        result
    }

    fn instrument_file(
        &mut self,
        source: &Path,
        dest_root: &Path,
        encoding: Option<&str>,
    ) -> Result<PathBuf, Error> {
        let read_err = |source_err: std::io::Error| Error::SourceRead {
            path: source.to_path_buf(),
            source: source_err,
        };
        let bytes = std::fs::read(source).map_err(read_err)?;
        let modified = std::fs::metadata(source)
            .and_then(|m| m.modified())
            .map_err(read_err)?;

        let encoding = self.resolve_encoding(encoding)?;
        let (bom, body) = match encoding {
            SourceEncoding::Utf8 if bytes.starts_with(UTF8_BOM) => (UTF8_BOM, &bytes[3..]),
            _ => (&[][..], &bytes[..]),
        };
        guard_against_double_instrumentation(source, &mut &body[..])?;
        let text = encoding.decode(source, body)?;
        let meta = SourceMeta {
            checksum: format!("{:x}", md5::compute(&bytes)),
            size: bytes.len() as u64,
            timestamp: modified
                .duration_since(UNIX_EPOCH)
                .map(|d| d.as_millis() as u64)
                .unwrap_or_default(),
            encoding,
        };

        let (output, structure) = self.process(source, &text, meta)?;

        let mut tmp = tempfile::NamedTempFile::new()?;
        tmp.write_all(bom)?;
        tmp.write_all(&encoding.encode(&output))?;
        tmp.flush()?;

        let mut dest_dir = dest_root.to_path_buf();
        if !structure.package.is_empty() {
            dest_dir.extend(structure.package.split('.'));
        }
        std::fs::create_dir_all(&dest_dir).map_err(|source| Error::CreateDir {
            path: dest_dir.clone(),
            source,
        })?;
        let dest = dest_dir.join(self.output_name(source));
        std::fs::copy(tmp.path(), &dest).map_err(|source_err| Error::Copy {
            from: tmp.path().to_path_buf(),
            to: dest.clone(),
            source: source_err,
        })?;
        debug!("processed {} to {}", source.display(), dest.display());
        Ok(dest)
    }

    /// Instrument in-memory text that stands for the file at `path`.
    pub fn instrument_source(
        &mut self,
        path: &Path,
        text: &str,
        encoding: Option<&str>,
    ) -> Result<String, Error> {
        self.check_running()?;
        let result = self.instrument_text(path, text, encoding);
        self.fail_on_error(path, result)
    }

    fn instrument_text(
        &mut self,
        path: &Path,
        text: &str,
        encoding: Option<&str>,
    ) -> Result<String, Error> {
        guard_against_double_instrumentation(path, &mut text.as_bytes())?;
        let meta = SourceMeta {
            checksum: format!("{:x}", md5::compute(text.as_bytes())),
            size: text.len() as u64,
            timestamp: 0,
            encoding: self.resolve_encoding(encoding)?,
        };
        Ok(self.process(path, text, meta)?.0)
    }

    fn resolve_encoding(&self, encoding: Option<&str>) -> Result<SourceEncoding, Error> {
        match encoding.or(self.config.encoding.as_deref()) {
            Some(name) => SourceEncoding::from_name(name),
            None => Ok(SourceEncoding::default()),
        }
    }

    /// `Name.ext` becomes `Name.<instr ext>`; names without a dot are kept.
    fn output_name(&self, source: &Path) -> String {
        let name = source
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        match name.rfind('.') {
            Some(dot) => format!("{}.{}", &name[..dot], self.config.instr_file_extension),
            None => name,
        }
    }

    fn process(
        &mut self,
        path: &Path,
        text: &str,
        meta: SourceMeta,
    ) -> Result<(String, FileStructure), Error> {
        let run = self.run.as_mut().ok_or(Error::NotStarted)?;
        let session = &mut run.session;

        let mut filter = TokenStreamFilter::new(path, text);
        let structure = Recognizer::new(&mut filter, &mut self.tree)?.recognize()?;

        session.enter_file(NewFile {
            path: path.to_path_buf(),
            package: structure.package.clone(),
            checksum: meta.checksum,
            size: meta.size,
            timestamp: meta.timestamp,
            encoding: meta.encoding.name().to_owned(),
            line_count: filter.line_count(),
            ncloc: filter.ncloc(),
        })?;
        let dirty = filter.instrument(
            session,
            &self.config,
            self.detector.as_ref(),
            &structure.package,
            self.file_index,
        )?;
        if !dirty {
            debug!("{}: nothing to instrument", path.display());
        }
        match_contexts(&filter, &structure, &self.contexts, session)?;

        let mut output = String::with_capacity(text.len() + text.len() / 2);
        filter
            .write(&mut output)
            .map_err(|_| Error::Io(std::io::Error::other("failed to render instrumented source")))?;

        let info = session.exit_file()?;
        self.stats.record(info);
        self.file_index += 1;
        Ok((output, structure))
    }

    /// Close the session, persist the registry and log the run summary.
    pub fn end_instrumentation(&mut self, append: bool) -> Result<Registry, Error> {
        let Started {
            mut registry,
            session,
            at,
            failed,
        } = self.run.take().ok_or(Error::NotStarted)?;
        if let Some(path) = failed {
            return Err(Error::Aborted { path });
        }
        registry.apply(session.close()?);
        registry.save(&self.registry_path(), append)?;

        let stats = &self.stats;
        info!(
            "instrumented {} file(s) ({} package(s))",
            stats.files,
            stats.packages.len()
        );
        if stats.test_methods > 0 {
            info!("{} test method(s) detected", stats.test_methods);
        }
        let secs = at.elapsed().as_secs_f64();
        if secs > 0.0 {
            debug!(
                "elapsed {secs:.3}s ({:.3} files/sec, {:.3} srclines/sec)",
                f64::from(stats.files) / secs,
                stats.loc as f64 / secs
            );
        }
        Ok(registry)
    }
}

/// Attach custom regex contexts. Method contexts match the normalized
/// header; statement contexts match the normalized statement text and tag
/// every entity probed inside it.
fn match_contexts(
    filter: &TokenStreamFilter<'_>,
    structure: &FileStructure,
    contexts: &ContextStore,
    session: &mut Session,
) -> Result<(), Error> {
    let list = filter.list();
    let emitters = filter.emitters();

    if !contexts.method_contexts().is_empty() {
        for marker in &structure.methods {
            let header = list.normalised_sequence(marker.start, marker.header_end);
            for ctx in contexts.method_contexts() {
                if !ctx.regex.is_match(&header) {
                    continue;
                }
                if let Some(entity) = emitters.get(marker.entry).entity {
                    session.add_context(entity, ctx.index)?;
                }
                debug!(
                    "method context match, line {}, id={}",
                    list.get(marker.start).line,
                    ctx.name
                );
            }
        }
    }

    if !contexts.statement_contexts().is_empty() {
        for marker in &structure.statements {
            let text = list.normalised_sequence(marker.start, marker.end);
            for ctx in contexts.statement_contexts() {
                if !ctx.regex.is_match(&text) {
                    continue;
                }
                let mut cursor = Some(marker.start);
                while let Some(id) = cursor {
                    for &emitter in emitters.pre(id).iter().chain(emitters.post(id)) {
                        if let Some(entity) = emitters.get(emitter).entity {
                            session.add_context(entity, ctx.index)?;
                        }
                    }
                    if id == marker.end {
                        break;
                    }
                    cursor = list.next(id);
                }
                debug!(
                    "statement context match, line {}, id={}",
                    list.get(marker.start).line,
                    ctx.name
                );
            }
        }
    }
    Ok(())
}
