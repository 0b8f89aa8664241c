//! Sort and search translation for `calibredb list`.
//!
//! calibredb sorts every key in one direction, so a single `-` prefix on any
//! key makes the whole query descending. Unknown keys are dropped with a
//! warning. Search terms are passed through untouched as one argument; the
//! search grammar belongs to calibre.

use tracing::warn;

/// Fields calibredb can sort `list` output by.
pub const SORT_KEYS: &[&str] = &[
    "author_sort",
    "authors",
    "comments",
    "cover",
    "formats",
    "id",
    "identifiers",
    "isbn",
    "languages",
    "last_modified",
    "pubdate",
    "publisher",
    "rating",
    "series",
    "series_index",
    "size",
    "tags",
    "template",
    "timestamp",
    "title",
    "uuid",
];

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ListQuery {
    pub sort: Vec<String>,
    pub search: Vec<String>,
}

impl ListQuery {
    pub fn new(sort: Vec<String>, search: Vec<String>) -> Self {
        Self { sort, search }
    }

    /// `list` arguments for this query: sort arguments, then search.
    pub fn to_args(&self) -> Vec<String> {
        let mut args = sort_args(&self.sort);
        args.extend(search_args(&self.search));
        args
    }
}

/// `["--ascending", "--sort-by=a,b"]`, or without `--ascending` when any
/// valid key carries a `-` prefix. No valid keys yields `["--ascending"]`.
pub fn sort_args(keys: &[String]) -> Vec<String> {
    let mut descending = false;
    let mut valid = Vec::new();

    for key in keys {
        let (desc, name) = match key.strip_prefix('-') {
            Some(name) => (true, name),
            None => (false, key.as_str()),
        };
        if !SORT_KEYS.contains(&name) {
            warn!("Ignoring unsupported sort key \"{}\"", key);
            continue;
        }
        descending |= desc;
        valid.push(name);
    }

    let mut args = Vec::new();
    if !descending {
        args.push("--ascending".to_string());
    }
    if !valid.is_empty() {
        args.push(format!("--sort-by={}", valid.join(",")));
    }
    args
}

/// `["--search", "term1 term2"]`, or nothing for no terms.
pub fn search_args(terms: &[String]) -> Vec<String> {
    let joined = terms
        .iter()
        .map(|t| t.trim())
        .filter(|t| !t.is_empty())
        .collect::<Vec<_>>()
        .join(" ");
    if joined.is_empty() {
        Vec::new()
    } else {
        vec!["--search".to_string(), joined]
    }
}
