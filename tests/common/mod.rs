//! A scripted stand-in for calibredb.
//!
//! The script logs its argv to `calls.log`, then replays `<subcommand>.out`,
//! `<subcommand>.err` and `<subcommand>.code` from its response directory.
//! `export` also writes one file into its `--to-dir`.

#![allow(dead_code)]

use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};

use calibre_rest::config::Config;
use calibre_rest::library::Library;
use tempfile::TempDir;

const SCRIPT: &str = r#"#!/bin/sh
if [ -e "$FAKE_DIR/running" ]; then
  echo overlap >> "$FAKE_DIR/overlaps"
fi
: > "$FAKE_DIR/running"
printf '%s\n' "$*" >> "$FAKE_DIR/calls.log"
sleep "${FAKE_SLEEP:-0}"
rm -f "$FAKE_DIR/running"

if [ "$1" = "--version" ]; then
  echo "calibredb calibre 7.2.0"
  exit 0
fi

shift 2
while [ "$1" = "--username" ] || [ "$1" = "--password" ]; do
  shift 2
done
sub="$1"
shift

if [ "$sub" = "export" ]; then
  for arg in "$@"; do
    case "$arg" in
      --to-dir=*) echo "book bytes" > "${arg#--to-dir=}/Dune - Frank Herbert.epub" ;;
    esac
  done
fi

[ -f "$FAKE_DIR/$sub.out" ] && cat "$FAKE_DIR/$sub.out"
[ -f "$FAKE_DIR/$sub.err" ] && cat "$FAKE_DIR/$sub.err" >&2
if [ -f "$FAKE_DIR/$sub.code" ]; then
  exit "$(cat "$FAKE_DIR/$sub.code")"
fi
exit 0
"#;

pub struct FakeCalibre {
    pub dir: TempDir,
    pub config: Config,
}

impl FakeCalibre {
    pub fn new() -> Self {
        let dir = tempfile::tempdir().unwrap();

        let executable = dir.path().join("calibredb");
        std::fs::write(&executable, SCRIPT).unwrap();
        std::fs::set_permissions(&executable, std::fs::Permissions::from_mode(0o755)).unwrap();

        let library = dir.path().join("library");
        std::fs::create_dir(&library).unwrap();
        std::fs::write(library.join("metadata.db"), b"").unwrap();

        let responses = dir.path().join("responses");
        std::fs::create_dir(&responses).unwrap();

        let mut config = Config::default();
        config.calibre.executable = executable;
        config.calibre.library = library;
        config.calibre.pass_env = vec!["PATH".to_string()];
        config
            .calibre
            .env
            .insert("FAKE_DIR".to_string(), responses.to_string_lossy().into_owned());

        Self { dir, config }
    }

    pub fn responses(&self) -> PathBuf {
        self.dir.path().join("responses")
    }

    /// Script the next runs of `subcommand`.
    pub fn respond(&self, subcommand: &str, stdout: &str, stderr: &str, code: i32) {
        let dir = self.responses();
        std::fs::write(dir.join(format!("{}.out", subcommand)), stdout).unwrap();
        std::fs::write(dir.join(format!("{}.err", subcommand)), stderr).unwrap();
        std::fs::write(dir.join(format!("{}.code", subcommand)), code.to_string()).unwrap();
    }

    /// One entry per invocation: the argv joined with spaces.
    pub fn calls(&self) -> Vec<String> {
        std::fs::read_to_string(self.responses().join("calls.log"))
            .unwrap_or_default()
            .lines()
            .map(str::to_owned)
            .collect()
    }

    pub fn overlapped(&self) -> bool {
        self.responses().join("overlaps").exists()
    }

    pub fn library(&self) -> Library {
        Library::new(&self.config).unwrap()
    }

    pub fn library_dir(&self) -> &Path {
        &self.config.calibre.library
    }

    /// A file with a name calibre accepts.
    pub fn book_file(&self, name: &str) -> PathBuf {
        let path = self.dir.path().join(name);
        std::fs::write(&path, b"not really an epub").unwrap();
        path
    }
}

pub fn book_json(id: u64, title: &str) -> String {
    format!(
        r#"{{"id": {id}, "title": "{title}", "authors": "Frank Herbert", "tags": ["scifi"],
            "identifiers": {{"isbn": "9780441013593"}}, "series_index": 1.0, "formats": []}}"#
    )
}

pub fn books_json(books: &[(u64, &str)]) -> String {
    let items: Vec<String> = books.iter().map(|(id, title)| book_json(*id, title)).collect();
    format!("[{}]", items.join(","))
}
