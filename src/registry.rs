//! Project registry: the persisted description of every instrumented
//! element, and the per-run [`Session`] that builds it.
//!
//! Every method, statement and branch owns a data index: the slot the
//! runtime recorder increments. Indices are global to the registry and grow
//! monotonically, so a run that appends to an existing registry continues
//! where the previous one stopped.

use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};

use crate::context::ContextSet;
use crate::error::Error;
use crate::signature::TypeKind;

pub const REGISTRY_FORMAT: u32 = 1;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct SourceRegion {
    pub line: u32,
    pub column: u32,
    pub end_line: u32,
    pub end_column: u32,
}

impl SourceRegion {
    pub fn new(line: u32, column: u32, end_line: u32, end_column: u32) -> Self {
        Self {
            line,
            column,
            end_line,
            end_column,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClassInfo {
    pub name: String,
    pub qualified_name: String,
    pub kind: TypeKind,
    pub region: SourceRegion,
    pub parent: Option<usize>,
    pub is_test: bool,
    pub context: ContextSet,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MethodInfo {
    pub name: String,
    pub signature: String,
    pub class: usize,
    pub parent: Option<usize>,
    pub region: SourceRegion,
    pub data_index: u32,
    pub is_test: bool,
    pub is_lambda: bool,
    pub void_return: bool,
    pub complexity: u32,
    pub context: ContextSet,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatementInfo {
    pub region: SourceRegion,
    pub data_index: u32,
    pub complexity: u32,
    pub class: usize,
    pub method: Option<usize>,
    pub instrumented: bool,
    pub context: ContextSet,
}

/// A boolean decision point. It owns two slots: `data_index` counts true
/// evaluations, `data_index + 1` false ones.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BranchInfo {
    pub region: SourceRegion,
    pub data_index: u32,
    pub complexity: u32,
    pub method: usize,
    pub instrumented: bool,
    pub context: ContextSet,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FileInfo {
    pub path: PathBuf,
    pub package: String,
    pub checksum: String,
    pub size: u64,
    pub timestamp: u64,
    pub encoding: String,
    pub line_count: u32,
    pub ncloc: u32,
    pub data_index: u32,
    pub data_length: u32,
    pub classes: Vec<ClassInfo>,
    pub methods: Vec<MethodInfo>,
    pub statements: Vec<StatementInfo>,
    pub branches: Vec<BranchInfo>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FileMetrics {
    pub classes: u32,
    pub methods: u32,
    pub test_methods: u32,
    pub lambdas: u32,
    pub statements: u32,
    pub branches: u32,
    pub complexity: u32,
    pub line_count: u32,
    pub ncloc: u32,
}

impl FileInfo {
    pub fn metrics(&self) -> FileMetrics {
        let count = |n: usize| n as u32;
        let (lambdas, methods): (Vec<&MethodInfo>, Vec<&MethodInfo>) =
            self.methods.iter().partition(|m| m.is_lambda);
        FileMetrics {
            classes: count(self.classes.len()),
            methods: count(methods.len()),
            test_methods: count(methods.iter().filter(|m| m.is_test).count()),
            lambdas: count(lambdas.len()),
            statements: count(self.statements.len()),
            branches: count(self.branches.len()),
            complexity: methods.iter().map(|m| m.complexity).sum(),
            line_count: self.line_count,
            ncloc: self.ncloc,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Registry {
    pub format: u32,
    pub project: String,
    /// Stamp of the last session; recorders compare it at runtime.
    pub version: u64,
    pub data_length: u32,
    pub contexts: Vec<String>,
    pub files: Vec<FileInfo>,
}

impl Registry {
    pub fn new(project: impl Into<String>) -> Self {
        Self {
            format: REGISTRY_FORMAT,
            project: project.into(),
            version: 0,
            data_length: 0,
            contexts: Vec::new(),
            files: Vec::new(),
        }
    }

    pub fn load(path: &Path) -> Result<Self, Error> {
        let contents = std::fs::read_to_string(path).map_err(|source| Error::RegistryRead {
            path: path.to_path_buf(),
            source,
        })?;
        let registry: Registry =
            serde_json::from_str(&contents).map_err(|e| Error::InvalidRegistry {
                path: path.to_path_buf(),
                reason: e.to_string(),
            })?;
        if registry.format != REGISTRY_FORMAT {
            return Err(Error::InvalidRegistry {
                path: path.to_path_buf(),
                reason: format!(
                    "format {} is not supported (expected {REGISTRY_FORMAT})",
                    registry.format
                ),
            });
        }
        Ok(registry)
    }

    /// Load the registry at `path`, or start an empty one if there is none.
    pub fn create_or_load(path: &Path, project: &str) -> Result<Self, Error> {
        if path.exists() {
            Self::load(path)
        } else {
            Ok(Self::new(project))
        }
    }

    /// Write the registry as JSON. With `append`, files already recorded on
    /// disk that this registry does not know about are kept.
    pub fn save(&self, path: &Path, append: bool) -> Result<(), Error> {
        let write_err = |source: std::io::Error| Error::RegistryWrite {
            path: path.to_path_buf(),
            source,
        };

        let merged;
        let to_write = if append && path.exists() {
            let mut on_disk = Self::load(path)?;
            on_disk
                .files
                .retain(|f| !self.files.iter().any(|mine| mine.path == f.path));
            let mut files = on_disk.files;
            files.extend(self.files.iter().cloned());
            merged = Registry {
                files,
                data_length: self.data_length.max(on_disk.data_length),
                ..self.clone()
            };
            &merged
        } else {
            self
        };

        let dir = match path.parent() {
            Some(p) if !p.as_os_str().is_empty() => p,
            _ => Path::new("."),
        };
        std::fs::create_dir_all(dir).map_err(|source| Error::CreateDir {
            path: dir.to_path_buf(),
            source,
        })?;

        // Written beside the target, then renamed into place.
        let tmp = tempfile::NamedTempFile::new_in(dir).map_err(write_err)?;
        {
            let mut out = BufWriter::new(tmp.as_file());
            serde_json::to_writer_pretty(&mut out, to_write)
                .map_err(|e| write_err(std::io::Error::other(e)))?;
            out.flush().map_err(write_err)?;
        }
        tmp.persist(path).map_err(|e| write_err(e.error))?;
        Ok(())
    }

    pub fn start_session(&self) -> Session {
        let version = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis() as u64)
            .unwrap_or_default()
            .max(self.version + 1);
        Session::new(version, self.data_length)
    }

    /// Fold a finished session into the registry. Files instrumented again
    /// replace their previous entry.
    pub fn apply(&mut self, summary: SessionSummary) {
        for file in summary.files {
            self.files.retain(|f| f.path != file.path);
            self.files.push(file);
        }
        self.version = summary.version;
        self.data_length = summary.data_length;
        if !summary.contexts.is_empty() {
            self.contexts = summary.contexts;
        }
    }

    /// Per-file table of what the registry holds.
    pub fn format_summary(&self) -> String {
        let mut out = String::new();
        out.push_str(&format!(
            "{:<48} {:>7} {:>7} {:>7} {:>7} {:>7} {:>7}\n",
            "File", "Classes", "Methods", "Stmts", "Branch", "Slots", "Cmplx"
        ));
        out.push_str(&format!("{}\n", "-".repeat(98)));

        let mut files: Vec<&FileInfo> = self.files.iter().collect();
        files.sort_by(|a, b| a.path.cmp(&b.path));
        for file in files {
            let m = file.metrics();
            out.push_str(&format!(
                "{:<48} {:>7} {:>7} {:>7} {:>7} {:>7} {:>7}\n",
                file.path.display(),
                m.classes,
                m.methods,
                m.statements,
                m.branches,
                file.data_length,
                m.complexity
            ));
        }
        out.push_str(&format!(
            "\n{} file(s), {} slot(s), version {}\n",
            self.files.len(),
            self.data_length,
            self.version
        ));
        out
    }
}

/// What a finished session hands back to its registry.
#[derive(Debug)]
pub struct SessionSummary {
    pub version: u64,
    pub data_length: u32,
    pub files: Vec<FileInfo>,
    pub contexts: Vec<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MethodId(pub usize);

/// Back-reference from an emitter to what it registered, used when custom
/// contexts are attached after the resolve walk.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntityRef {
    Class(usize),
    Method(usize),
    Statement(usize),
    Branch(usize),
}

pub struct NewFile {
    pub path: PathBuf,
    pub package: String,
    pub checksum: String,
    pub size: u64,
    pub timestamp: u64,
    pub encoding: String,
    pub line_count: u32,
    pub ncloc: u32,
}

pub struct NewClass {
    pub name: String,
    pub kind: TypeKind,
    pub region: SourceRegion,
    pub context: ContextSet,
    pub is_test: bool,
}

pub struct NewMethod {
    pub name: String,
    pub signature: String,
    pub region: SourceRegion,
    pub context: ContextSet,
    pub is_test: bool,
    pub is_lambda: bool,
    pub void_return: bool,
}

#[derive(Debug)]
struct OpenFile {
    info: FileInfo,
    classes: Vec<usize>,
    methods: Vec<usize>,
}

#[derive(Debug, Default)]
pub struct Session {
    version: u64,
    next_index: u32,
    files: Vec<FileInfo>,
    current: Option<Box<OpenFile>>,
    contexts: Vec<String>,
}

impl Session {
    pub fn new(version: u64, first_index: u32) -> Self {
        Self {
            version,
            next_index: first_index,
            ..Default::default()
        }
    }

    pub fn version(&self) -> u64 {
        self.version
    }

    /// The data index the next registration will receive.
    pub fn next_index(&self) -> u32 {
        self.next_index
    }

    pub fn files(&self) -> &[FileInfo] {
        &self.files
    }

    pub fn set_contexts(&mut self, names: Vec<String>) {
        self.contexts = names;
    }

    fn open(&mut self) -> Result<&mut OpenFile, Error> {
        self.current
            .as_deref_mut()
            .ok_or_else(|| Error::Session("no file is open".into()))
    }

    fn alloc(&mut self, slots: u32) -> u32 {
        let index = self.next_index;
        self.next_index += slots;
        index
    }

    pub fn enter_file(&mut self, file: NewFile) -> Result<(), Error> {
        if let Some(open) = &self.current {
            return Err(Error::Session(format!(
                "cannot enter {} while {} is open",
                file.path.display(),
                open.info.path.display()
            )));
        }
        let info = FileInfo {
            path: file.path,
            package: file.package,
            checksum: file.checksum,
            size: file.size,
            timestamp: file.timestamp,
            encoding: file.encoding,
            line_count: file.line_count,
            ncloc: file.ncloc,
            data_index: self.next_index,
            data_length: 0,
            classes: Vec::new(),
            methods: Vec::new(),
            statements: Vec::new(),
            branches: Vec::new(),
        };
        self.current = Some(Box::new(OpenFile {
            info,
            classes: Vec::new(),
            methods: Vec::new(),
        }));
        Ok(())
    }

    pub fn exit_file(&mut self) -> Result<&FileInfo, Error> {
        let next_index = self.next_index;
        let open = self.open()?;
        if !open.classes.is_empty() || !open.methods.is_empty() {
            return Err(Error::Session(format!(
                "{} closed with {} class(es) and {} method(s) still open",
                open.info.path.display(),
                open.classes.len(),
                open.methods.len()
            )));
        }
        let mut open = self.current.take().ok_or_else(|| Error::Session("no file is open".into()))?;
        open.info.data_length = next_index - open.info.data_index;
        self.files.push(open.info);
        Ok(&self.files[self.files.len() - 1])
    }

    /// Abandon the open file, if any. Its slots stay allocated.
    pub fn discard_file(&mut self) {
        self.current = None;
    }

    pub fn enter_class(&mut self, class: NewClass) -> Result<usize, Error> {
        let open = self.open()?;
        let parent = open.classes.last().copied();
        let qualified_name = match parent {
            Some(p) => format!("{}.{}", open.info.classes[p].qualified_name, class.name),
            None if open.info.package.is_empty() => class.name.clone(),
            None => format!("{}.{}", open.info.package, class.name),
        };
        let id = open.info.classes.len();
        open.info.classes.push(ClassInfo {
            name: class.name,
            qualified_name,
            kind: class.kind,
            region: class.region,
            parent,
            is_test: class.is_test,
            context: class.context,
        });
        open.classes.push(id);
        Ok(id)
    }

    pub fn exit_class(&mut self, end_line: u32, end_column: u32) -> Result<(), Error> {
        let open = self.open()?;
        let id = open
            .classes
            .pop()
            .ok_or_else(|| Error::Session("exit_class without a matching enter_class".into()))?;
        let region = &mut open.info.classes[id].region;
        region.end_line = end_line;
        region.end_column = end_column;
        Ok(())
    }

    pub fn current_class(&self) -> Option<usize> {
        self.current.as_ref().and_then(|f| f.classes.last().copied())
    }

    /// Qualified name of the innermost open class.
    pub fn current_class_name(&self) -> Option<&str> {
        let open = self.current.as_ref()?;
        let id = *open.classes.last()?;
        Some(&open.info.classes[id].qualified_name)
    }

    pub fn enter_method(&mut self, method: NewMethod) -> Result<MethodId, Error> {
        let data_index = self.alloc(1);
        let open = self.open()?;
        let class = *open.classes.last().ok_or_else(|| {
            Error::Session(format!("method {} entered outside any class", method.name))
        })?;
        let id = open.info.methods.len();
        open.info.methods.push(MethodInfo {
            name: method.name,
            signature: method.signature,
            class,
            parent: open.methods.last().copied(),
            region: method.region,
            data_index,
            is_test: method.is_test,
            is_lambda: method.is_lambda,
            void_return: method.void_return,
            complexity: 1,
            context: method.context,
        });
        open.methods.push(id);
        Ok(MethodId(id))
    }

    /// Close the innermost method and settle its cyclomatic complexity.
    pub fn exit_method(&mut self, end_line: u32, end_column: u32) -> Result<(), Error> {
        let open = self.open()?;
        let id = open
            .methods
            .pop()
            .ok_or_else(|| Error::Session("exit_method without a matching enter_method".into()))?;
        let own = |m: Option<usize>| m == Some(id);
        let branch_complexity: u32 = open
            .info
            .branches
            .iter()
            .filter(|b| b.method == id)
            .map(|b| b.complexity)
            .sum();
        let statement_complexity: u32 = open
            .info
            .statements
            .iter()
            .filter(|s| own(s.method))
            .map(|s| s.complexity)
            .sum();
        let method = &mut open.info.methods[id];
        method.complexity = 1 + branch_complexity + statement_complexity;
        method.region.end_line = end_line;
        method.region.end_column = end_column;
        Ok(())
    }

    pub fn current_method(&self) -> Option<MethodId> {
        self.current
            .as_ref()
            .and_then(|f| f.methods.last().copied())
            .map(MethodId)
    }

    pub fn method(&self, id: MethodId) -> Option<&MethodInfo> {
        self.current.as_ref().and_then(|f| f.info.methods.get(id.0))
    }

    pub fn set_void_return(&mut self, id: MethodId) -> Result<(), Error> {
        let open = self.open()?;
        let method = open
            .info
            .methods
            .get_mut(id.0)
            .ok_or_else(|| Error::Session(format!("no method with id {}", id.0)))?;
        method.void_return = true;
        Ok(())
    }

    pub fn add_statement(
        &mut self,
        region: SourceRegion,
        context: ContextSet,
        complexity: u32,
        instrumented: bool,
    ) -> Result<usize, Error> {
        let data_index = self.alloc(1);
        let open = self.open()?;
        let class = *open
            .classes
            .last()
            .ok_or_else(|| Error::Session("statement outside any class".into()))?;
        let id = open.info.statements.len();
        open.info.statements.push(StatementInfo {
            region,
            data_index,
            complexity,
            class,
            method: open.methods.last().copied(),
            instrumented,
            context,
        });
        Ok(id)
    }

    /// Register a branch in the current method. Returns `None` when no
    /// method is open (a conditional in a field initializer).
    pub fn add_branch(
        &mut self,
        region: SourceRegion,
        context: ContextSet,
        complexity: u32,
        instrumented: bool,
    ) -> Result<Option<usize>, Error> {
        let Some(method) = self.open()?.methods.last().copied() else {
            return Ok(None);
        };
        let data_index = self.alloc(2);
        let open = self.open()?;
        let id = open.info.branches.len();
        open.info.branches.push(BranchInfo {
            region,
            data_index,
            complexity,
            method,
            instrumented,
            context,
        });
        Ok(Some(id))
    }

    pub fn data_index(&self, entity: EntityRef) -> Option<u32> {
        let info = &self.current.as_ref()?.info;
        match entity {
            EntityRef::Class(_) => None,
            EntityRef::Method(i) => info.methods.get(i).map(|m| m.data_index),
            EntityRef::Statement(i) => info.statements.get(i).map(|s| s.data_index),
            EntityRef::Branch(i) => info.branches.get(i).map(|b| b.data_index),
        }
    }

    pub fn add_context(&mut self, entity: EntityRef, index: usize) -> Result<(), Error> {
        let info = &mut self.open()?.info;
        let missing = || Error::Session(format!("no entity {entity:?} in the open file"));
        let context = match entity {
            EntityRef::Class(i) => &mut info.classes.get_mut(i).ok_or_else(missing)?.context,
            EntityRef::Method(i) => &mut info.methods.get_mut(i).ok_or_else(missing)?.context,
            EntityRef::Statement(i) => {
                &mut info.statements.get_mut(i).ok_or_else(missing)?.context
            }
            EntityRef::Branch(i) => &mut info.branches.get_mut(i).ok_or_else(missing)?.context,
        };
        *context = context.with(index);
        Ok(())
    }

    pub fn close(self) -> Result<SessionSummary, Error> {
        if let Some(open) = self.current {
            return Err(Error::Session(format!(
                "session closed while {} is still open",
                open.info.path.display()
            )));
        }
        Ok(SessionSummary {
            version: self.version,
            data_length: self.next_index,
            files: self.files,
            contexts: self.contexts,
        })
    }
}
