//! Flag encoding: turns a [`Book`] into calibredb command-line flags.
//!
//! Two contexts exist because calibredb spells the same metadata differently
//! per subcommand:
//!
//! | Context | Subcommand | Shape |
//! |---------|------------|-------|
//! | [`FlagContext::Add`] | `add` | `--authors 'A & B' --identifier isbn:X --identifier asin:Y` |
//! | [`FlagContext::Update`] | `set_metadata` | `--field 'authors:A & B' --field identifiers:isbn:X,asin:Y` |
//!
//! Flags are always emitted in the context's declared field order, never in
//! payload order, so encoding the same book twice yields identical output.
//! Empty values and fields outside the context's allow-list are skipped.
//!
//! Processes are spawned from an argv vector, not through a shell. The
//! shell-quoted rendering produced by `Display` exists for logs and error
//! messages, and is what a user would paste into a terminal.

use std::borrow::Cow;
use std::fmt;
use std::path::{Path, PathBuf};

use serde_json::{Map, Value};
use tracing::warn;

use crate::models::{Book, BookField, FieldValue};

/// Multi-author delimiter understood by calibredb.
const AUTHOR_SEPARATOR: &str = " & ";
const LIST_SEPARATOR: &str = ",";

const ADD_FIELDS: &[BookField] = &[
    BookField::Authors,
    BookField::Cover,
    BookField::Identifiers,
    BookField::Isbn,
    BookField::Languages,
    BookField::Series,
    BookField::SeriesIndex,
    BookField::Tags,
    BookField::Title,
];

const UPDATE_FIELDS: &[BookField] = &[
    BookField::AuthorSort,
    BookField::Authors,
    BookField::Comments,
    BookField::Identifiers,
    BookField::Languages,
    BookField::Pubdate,
    BookField::Publisher,
    BookField::Rating,
    BookField::Series,
    BookField::SeriesIndex,
    BookField::Tags,
    BookField::Timestamp,
    BookField::Title,
];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlagContext {
    Add,
    Update,
}

impl FlagContext {
    /// Fields this context may mutate, in emission order.
    pub fn fields(self) -> &'static [BookField] {
        match self {
            FlagContext::Add => ADD_FIELDS,
            FlagContext::Update => UPDATE_FIELDS,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct EncodeOptions {
    /// Emit `series_index` when it is explicitly `0.0`. Off by default:
    /// calibre treats an index of zero the same as no index.
    pub emit_zero_series_index: bool,
}

/// One `--option value` pair.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Flag {
    pub option: &'static str,
    pub value: String,
}

impl Flag {
    pub fn new(option: &'static str, value: impl Into<String>) -> Self {
        Self {
            option,
            value: value.into(),
        }
    }

    pub fn to_args(&self) -> [String; 2] {
        [self.option.to_string(), self.value.clone()]
    }
}

impl fmt::Display for Flag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.option, shell_quote(&self.value))
    }
}

/// Encode every allowed, non-empty field of `book`.
pub fn encode(book: &Book, context: FlagContext, options: EncodeOptions) -> Vec<Flag> {
    let mut flags = Vec::new();

    for &field in context.fields() {
        match (context, book.value(field)) {
            (FlagContext::Add, FieldValue::Pairs(pairs)) => {
                for pair in encode_pairs(pairs) {
                    flags.push(Flag::new("--identifier", pair));
                }
            }
            (FlagContext::Update, FieldValue::Pairs(pairs)) => {
                let pairs = encode_pairs(pairs);
                if !pairs.is_empty() {
                    flags.push(field_flag(field, &pairs.join(LIST_SEPARATOR)));
                }
            }
            (context, value) => {
                let Some(encoded) = encode_value(field, value, options) else {
                    continue;
                };
                flags.push(match context {
                    FlagContext::Add => Flag::new(add_option(field), encoded),
                    FlagContext::Update => field_flag(field, &encoded),
                });
            }
        }
    }

    flags
}

/// Render flags the way they would be typed on a shell.
pub fn render(flags: &[Flag]) -> String {
    flags
        .iter()
        .map(|f| f.to_string())
        .collect::<Vec<_>>()
        .join(" ")
}

fn field_flag(field: BookField, value: &str) -> Flag {
    Flag::new("--field", format!("{}:{}", field.name(), value))
}

fn add_option(field: BookField) -> &'static str {
    match field {
        BookField::Authors => "--authors",
        BookField::Cover => "--cover",
        BookField::Identifiers => "--identifier",
        BookField::Isbn => "--isbn",
        BookField::Languages => "--languages",
        BookField::Series => "--series",
        BookField::SeriesIndex => "--series-index",
        BookField::Tags => "--tags",
        BookField::Title => "--title",
        // Not in ADD_FIELDS; calibredb add has no flag for these.
        other => other.name(),
    }
}

fn encode_value(field: BookField, value: FieldValue<'_>, options: EncodeOptions) -> Option<String> {
    match value {
        FieldValue::Text(s) => {
            let s = s.trim();
            (!s.is_empty()).then(|| s.to_string())
        }
        FieldValue::List(items) => {
            let separator = if field == BookField::Authors {
                AUTHOR_SEPARATOR
            } else {
                LIST_SEPARATOR
            };
            let joined = items
                .iter()
                .map(|item| item.trim())
                .filter(|item| !item.is_empty())
                .collect::<Vec<_>>()
                .join(separator);
            (!joined.is_empty()).then_some(joined)
        }
        FieldValue::Number(None) => None,
        FieldValue::Number(Some(n)) => {
            if !n.is_finite() || n < 0.0 {
                warn!("Ignoring invalid {} value {}", field.name(), n);
                return None;
            }
            if n == 0.0 && !(field == BookField::SeriesIndex && options.emit_zero_series_index) {
                return None;
            }
            Some(format_number(n))
        }
        FieldValue::Pairs(pairs) => {
            let pairs = encode_pairs(pairs);
            (!pairs.is_empty()).then(|| pairs.join(LIST_SEPARATOR))
        }
    }
}

/// `scheme:value` for each well-formed identifier, in insertion order.
fn encode_pairs(pairs: &Map<String, Value>) -> Vec<String> {
    pairs
        .iter()
        .filter_map(|(scheme, value)| {
            let scheme = scheme.trim();
            let value = match value {
                Value::String(s) => s.trim().to_string(),
                Value::Number(n) => n.to_string(),
                _ => String::new(),
            };
            let valid = !scheme.is_empty()
                && !value.is_empty()
                && !scheme.contains([':', ','])
                && !value.contains(',');
            if !valid {
                warn!("Ignoring malformed identifier {:?}:{:?}", scheme, value);
                return None;
            }
            Some(format!("{}:{}", scheme, value))
        })
        .collect()
}

/// Whole numbers keep one decimal (`4.0`), which calibre parses as a float.
fn format_number(n: f64) -> String {
    if n.fract() == 0.0 {
        format!("{:.1}", n)
    } else {
        n.to_string()
    }
}

fn needs_quoting(s: &str) -> bool {
    s.is_empty()
        || s.chars().any(|c| {
            c.is_whitespace()
                || matches!(
                    c,
                    '\'' | '"' | '\\' | '$' | '`' | ';' | '&' | '|' | '<' | '>' | '(' | ')' | '*'
                        | '?' | '!' | '#' | '~' | '{' | '}' | '[' | ']'
                )
        })
}

/// POSIX single-quote `s` if a shell would split or expand it.
pub fn shell_quote(s: &str) -> Cow<'_, str> {
    if needs_quoting(s) {
        Cow::Owned(format!("'{}'", s.replace('\'', r#"'"'"'"#)))
    } else {
        Cow::Borrowed(s)
    }
}

/// A program plus its argv, built incrementally.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandLine {
    pub program: PathBuf,
    pub args: Vec<String>,
    /// Indexes into `args` masked when rendered.
    secret: Vec<usize>,
}

impl CommandLine {
    pub fn new(program: impl AsRef<Path>) -> Self {
        Self {
            program: program.as_ref().to_path_buf(),
            args: Vec::new(),
            secret: Vec::new(),
        }
    }

    /// Like [`CommandLine::arg`], but never shown in logs or errors.
    pub fn secret_arg(mut self, arg: impl Into<String>) -> Self {
        self.secret.push(self.args.len());
        self.args.push(arg.into());
        self
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    pub fn flags(mut self, flags: &[Flag]) -> Self {
        for flag in flags {
            self.args.extend(flag.to_args());
        }
        self
    }
}

impl fmt::Display for CommandLine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let program = self.program.to_string_lossy();
        write!(f, "{}", shell_quote(&program))?;
        for (i, arg) in self.args.iter().enumerate() {
            if self.secret.contains(&i) {
                write!(f, " ********")?;
            } else {
                write!(f, " {}", shell_quote(arg))?;
            }
        }
        Ok(())
    }
}
