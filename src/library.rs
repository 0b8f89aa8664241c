//! Library gateway: the operations the HTTP layer calls.
//!
//! Each method builds one calibredb command line from the flag encoder and
//! query translator, runs it through the serialized [`ProcessGateway`], and
//! interprets the result. `--with-library` (and credentials, when configured)
//! precede every subcommand.
//!
//! | Method | calibredb |
//! |--------|-----------|
//! | [`Library::version`] | `--version` |
//! | [`Library::get_book`] / [`Library::get_books`] | `list --for-machine --fields=all` |
//! | [`Library::add`] / [`Library::add_empty`] | `add` |
//! | [`Library::remove`] | `remove` |
//! | [`Library::add_format`] / [`Library::remove_format`] | `add_format` / `remove_format` |
//! | [`Library::show_metadata`] / [`Library::set_metadata`] | `show_metadata` / `set_metadata` |
//! | [`Library::export`] | `export` |

use std::path::{Path, PathBuf};
use std::sync::LazyLock;

use regex::Regex;
use tracing::{error, info, warn};

use crate::config::Config;
use crate::error::{GatewayError, Result};
use crate::flags::{encode, CommandLine, EncodeOptions, FlagContext};
use crate::models::Book;
use crate::outcome::{AutomergeMode, CommandOutcome, OutcomeClassifier, TextOutcomeClassifier};
use crate::process::{ProcessGateway, ProcessOutput};
use crate::query::ListQuery;

static VERSION_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"calibre ([\d.]+)").unwrap());
static MISSING_BOOK_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"No book with id (\d+)").unwrap());

/// File types calibre can import.
pub const ALLOWED_FILE_EXTENSIONS: &[&str] = &[
    "azw", "azw3", "azw4", "cbz", "cbr", "cb7", "cbc", "chm", "djvu", "docx", "epub", "fb2",
    "fbz", "html", "htmlz", "lit", "lrf", "mobi", "odt", "pdf", "prc", "pdb", "pml", "rb", "rtf",
    "snb", "tcr", "txt", "txtz",
];

/// True when `filename` may be handed to calibredb: a supported extension and
/// no leading `-` that calibredb would parse as an option.
pub fn is_supported_file(filename: &str) -> bool {
    if filename.starts_with('-') {
        return false;
    }
    Path::new(filename)
        .extension()
        .and_then(|ext| ext.to_str())
        .map(|ext| ALLOWED_FILE_EXTENSIONS.contains(&ext.to_ascii_lowercase().as_str()))
        .unwrap_or(false)
}

pub struct Library {
    executable: PathBuf,
    library: PathBuf,
    username: Option<String>,
    password: Option<String>,
    encode_options: EncodeOptions,
    gateway: ProcessGateway,
    classifier: Box<dyn OutcomeClassifier>,
}

impl Library {
    /// Validate the configured executable and library and build the gateway.
    ///
    /// Fails with [`GatewayError::Configuration`] when calibredb cannot be
    /// resolved or `metadata.db` is missing from the library directory.
    pub fn new(config: &Config) -> Result<Self> {
        let calibre = &config.calibre;
        let executable = resolve_executable(&calibre.executable)?;

        let metadata_db = calibre.library.join("metadata.db");
        if !metadata_db.is_file() {
            return Err(GatewayError::Configuration(format!(
                "Failed to find Calibre database file {}",
                metadata_db.display()
            )));
        }

        let env = calibre.child_env(|name| std::env::var(name).ok());
        info!(
            executable = %executable.display(),
            library = %calibre.library.display(),
            "Using calibre library"
        );

        Ok(Self {
            executable,
            library: calibre.library.clone(),
            username: calibre.username.clone().filter(|u| !u.is_empty()),
            password: calibre.password.clone().filter(|p| !p.is_empty()),
            encode_options: config.encoding.options(),
            gateway: ProcessGateway::new(env, calibre.timeout()),
            classifier: Box::new(TextOutcomeClassifier),
        })
    }

    /// Replace the text-based add classifier.
    pub fn with_classifier(mut self, classifier: Box<dyn OutcomeClassifier>) -> Self {
        self.classifier = classifier;
        self
    }

    fn command(&self, subcommand: &str) -> CommandLine {
        let mut cmd = CommandLine::new(&self.executable)
            .arg("--with-library")
            .arg(self.library.to_string_lossy());
        if let Some(username) = &self.username {
            cmd = cmd.arg("--username").arg(username.as_str());
        }
        if let Some(password) = &self.password {
            cmd = cmd.arg("--password").secret_arg(password.as_str());
        }
        cmd.arg(subcommand)
    }

    fn run(&self, cmd: &CommandLine) -> Result<ProcessOutput> {
        self.gateway.execute(cmd)
    }

    /// The calibre version reported by `calibredb --version`.
    pub fn version(&self) -> Result<String> {
        let cmd = CommandLine::new(&self.executable).arg("--version");
        let out = self.run(&cmd)?;
        match VERSION_RE.captures(&out.stdout) {
            Some(caps) => Ok(caps[1].to_string()),
            None => {
                error!(stdout = %out.stdout, "failed to parse calibredb version");
                Err(GatewayError::Parse {
                    command: cmd.to_string(),
                    reason: "no version in output".to_string(),
                    stdout: out.stdout,
                    stderr: out.stderr,
                })
            }
        }
    }

    /// `None` when no book has this id.
    pub fn get_book(&self, id: u64) -> Result<Option<Book>> {
        validate_id(id)?;

        let cmd = self
            .command("list")
            .args(["--for-machine", "--fields=all"])
            .arg(format!("--search=id:{}", id))
            .arg("--limit=1");
        let out = self.run(&cmd)?;

        // `list` always prints an array, whatever the limit.
        let books = Book::list_from_json(&out.stdout)?;
        Ok(books.into_iter().find(|b| b.id == id))
    }

    /// Every book matching `query`, in calibredb's order. `limit` caps the
    /// number calibredb returns.
    pub fn get_books(&self, query: &ListQuery, limit: Option<usize>) -> Result<Vec<Book>> {
        let mut cmd = self
            .command("list")
            .args(["--for-machine", "--fields=all"])
            .args(query.to_args());
        if let Some(limit) = limit {
            if limit == 0 {
                return Err(GatewayError::validation(format!("limit {} not allowed", limit)));
            }
            cmd = cmd.arg(format!("--limit={}", limit));
        }

        let out = self.run(&cmd)?;
        Ok(Book::list_from_json(&out.stdout)?)
    }

    /// Add book files with metadata from `book`.
    ///
    /// With [`AutomergeMode::Overwrite`], every record sharing an existing
    /// file has that file replaced, not only the first match.
    pub fn add(
        &self,
        paths: &[PathBuf],
        book: &Book,
        automerge: AutomergeMode,
    ) -> Result<CommandOutcome> {
        if paths.is_empty() {
            return Err(GatewayError::validation("No file(s) provided"));
        }
        for path in paths {
            validate_book_file(path)?;
        }

        let flags = encode(book, FlagContext::Add, self.encode_options);
        let cmd = self
            .command("add")
            .args(paths.iter().map(|p| p.to_string_lossy().into_owned()))
            .arg(automerge.to_arg())
            .flags(&flags);
        self.run_add(&cmd)
    }

    /// Add a record with no formats.
    pub fn add_empty(&self, book: &Book, automerge: AutomergeMode) -> Result<CommandOutcome> {
        let flags = encode(book, FlagContext::Add, self.encode_options);
        let cmd = self
            .command("add")
            .arg("--empty")
            .arg(automerge.to_arg())
            .flags(&flags);
        self.run_add(&cmd)
    }

    fn run_add(&self, cmd: &CommandLine) -> Result<CommandOutcome> {
        match self.run(cmd) {
            Ok(out) => self.classifier.classify(&cmd.to_string(), &out),
            Err(GatewayError::Runtime {
                exit_code,
                stdout,
                stderr,
                ..
            }) => Ok(CommandOutcome::Failure {
                exit_code,
                stdout,
                stderr,
            }),
            Err(e) => Err(e),
        }
    }

    /// Remove books, moving them to calibre's trash unless `permanent`.
    ///
    /// calibredb ignores unknown ids, so those succeed. Every id is looked up
    /// afterwards and a book that is still present is an error.
    pub fn remove(&self, ids: &[u64], permanent: bool) -> Result<()> {
        if ids.is_empty() {
            return Err(GatewayError::validation("No ids provided"));
        }
        for &id in ids {
            validate_id(id)?;
        }

        let mut cmd = self.command("remove").arg(join_ids(ids));
        if permanent {
            cmd = cmd.arg("--permanent");
        }
        self.run(&cmd)?;

        for &id in ids {
            if self.get_book(id)?.is_some() {
                error!(command = %cmd, id, "book still present after remove");
                return Err(GatewayError::NotApplied(format!("book {} was not deleted", id)));
            }
        }
        Ok(())
    }

    /// Attach `path` as a new format of book `id`.
    ///
    /// An existing file of the same format is replaced only when `replace`
    /// is set. `as_extra_data_file` stores the file as a data file instead
    /// of a format.
    pub fn add_format(
        &self,
        id: u64,
        path: &Path,
        replace: bool,
        as_extra_data_file: bool,
    ) -> Result<()> {
        validate_id(id)?;
        validate_book_file(path)?;
        self.require_book(id)?;

        let mut cmd = self.command("add_format");
        if !replace {
            cmd = cmd.arg("--dont-replace");
        }
        if as_extra_data_file {
            cmd = cmd.arg("--as-extra-data-file");
        }
        let cmd = cmd.arg(id.to_string()).arg(path.to_string_lossy());
        self.run(&cmd)?;
        Ok(())
    }

    /// Drop format `fmt` (e.g. `EPUB`) from book `id`.
    pub fn remove_format(&self, id: u64, fmt: &str) -> Result<()> {
        validate_id(id)?;
        let fmt = fmt.trim().trim_start_matches('.');
        if fmt.is_empty() || !fmt.chars().all(|c| c.is_ascii_alphanumeric()) {
            return Err(GatewayError::validation(format!("invalid format \"{}\"", fmt)));
        }
        self.require_book(id)?;

        let cmd = self
            .command("remove_format")
            .arg(id.to_string())
            .arg(fmt.to_ascii_uppercase());
        self.run(&cmd)?;
        Ok(())
    }

    /// Book metadata as an OPF document.
    pub fn show_metadata(&self, id: u64) -> Result<String> {
        validate_id(id)?;
        self.require_book(id)?;

        let cmd = self
            .command("show_metadata")
            .arg("--as-opf")
            .arg(id.to_string());
        Ok(self.run(&cmd)?.stdout)
    }

    /// Update the mutable fields set in `book` and return the stored result.
    pub fn set_metadata(&self, id: u64, book: &Book) -> Result<Book> {
        validate_id(id)?;
        let flags = encode(book, FlagContext::Update, self.encode_options);
        if flags.is_empty() {
            return Err(GatewayError::validation("No data provided"));
        }
        self.require_book(id)?;

        let cmd = self
            .command("set_metadata")
            .arg(id.to_string())
            .flags(&flags);
        self.run(&cmd)?;
        self.require_book(id)
    }

    /// Replace metadata from an OPF file on disk.
    pub fn set_metadata_from_opf(&self, id: u64, opf: &Path) -> Result<Book> {
        validate_id(id)?;
        if !opf.is_file() {
            return Err(GatewayError::validation(format!(
                "Metadata file {} does not exist",
                opf.display()
            )));
        }
        self.require_book(id)?;

        let cmd = self
            .command("set_metadata")
            .arg(id.to_string())
            .arg(opf.to_string_lossy());
        self.run(&cmd)?;
        self.require_book(id)
    }

    /// Export the given books' files into `dir` and return the written paths.
    ///
    /// `dir` must exist and be empty, so everything in it afterwards was
    /// written by this export.
    pub fn export(&self, ids: &[u64], dir: &Path) -> Result<Vec<PathBuf>> {
        if ids.is_empty() {
            return Err(GatewayError::validation("No ids provided"));
        }
        for &id in ids {
            validate_id(id)?;
        }
        if std::fs::read_dir(dir)?.next().is_some() {
            return Err(GatewayError::validation(format!(
                "export directory {} is not empty",
                dir.display()
            )));
        }

        let cmd = self
            .command("export")
            .args(["--dont-save-cover", "--dont-write-opf", "--single-dir"])
            .arg(format!("--to-dir={}", dir.to_string_lossy()))
            .arg(join_ids(ids));

        let out = match self.run(&cmd) {
            Ok(out) => out,
            Err(GatewayError::Runtime { stdout, stderr, .. })
                if missing_book(&stdout, &stderr).is_some() =>
            {
                ProcessOutput { stdout, stderr }
            }
            Err(e) => return Err(e),
        };
        if let Some(id) = missing_book(&out.stdout, &out.stderr) {
            return Err(GatewayError::not_found(format!("book {} does not exist", id)));
        }

        let mut files: Vec<PathBuf> = std::fs::read_dir(dir)?
            .filter_map(|entry| entry.ok().map(|e| e.path()))
            .filter(|p| p.is_file())
            .collect();
        files.sort();
        if files.is_empty() {
            warn!(command = %cmd, "export produced no files");
        }
        Ok(files)
    }

    fn require_book(&self, id: u64) -> Result<Book> {
        self.get_book(id)?
            .ok_or_else(|| GatewayError::not_found(format!("book {} does not exist", id)))
    }
}

fn missing_book(stdout: &str, stderr: &str) -> Option<u64> {
    MISSING_BOOK_RE
        .captures(stderr)
        .or_else(|| MISSING_BOOK_RE.captures(stdout))
        .and_then(|caps| caps[1].parse().ok())
}

fn validate_id(id: u64) -> Result<()> {
    if id == 0 {
        return Err(GatewayError::validation(format!("Value {} cannot be <= 0", id)));
    }
    Ok(())
}

fn validate_book_file(path: &Path) -> Result<()> {
    if !path.is_file() {
        return Err(GatewayError::validation(format!(
            "Failed to find book at {}",
            path.display()
        )));
    }
    let name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    if !is_supported_file(&name) {
        return Err(GatewayError::validation(format!("Invalid filename ({})", name)));
    }
    Ok(())
}

fn join_ids(ids: &[u64]) -> String {
    ids.iter()
        .map(|id| id.to_string())
        .collect::<Vec<_>>()
        .join(",")
}

/// Look a bare program name up on `PATH`; paths are used as given.
fn resolve_executable(executable: &Path) -> Result<PathBuf> {
    let is_bare_name = executable.components().count() == 1 && !executable.is_absolute();
    let candidate = if is_bare_name {
        std::env::var_os("PATH")
            .and_then(|paths| {
                std::env::split_paths(&paths)
                    .map(|dir| dir.join(executable))
                    .find(|p| is_executable(p))
            })
            .unwrap_or_else(|| executable.to_path_buf())
    } else {
        executable.to_path_buf()
    };

    if !is_executable(&candidate) {
        return Err(GatewayError::Configuration(format!(
            "{} is not a valid executable",
            candidate.display()
        )));
    }
    Ok(candidate)
}

#[cfg(unix)]
fn is_executable(path: &Path) -> bool {
    use std::os::unix::fs::PermissionsExt;
    path.metadata()
        .map(|m| m.is_file() && m.permissions().mode() & 0o111 != 0)
        .unwrap_or(false)
}

#[cfg(not(unix))]
fn is_executable(path: &Path) -> bool {
    path.is_file()
}
