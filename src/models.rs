//! Book metadata as reported by `calibredb list --for-machine`.
//!
//! A [`Book`] is built per request from calibredb's JSON output (or from a
//! client payload) and dropped afterwards. The calibre library on disk is the
//! only source of truth, so nothing here is cached.

use serde::{Deserialize, Deserializer, Serialize};
use serde_json::{Map, Value};

/// Metadata for one library item.
///
/// `id` is assigned by calibredb. Zero means the book has not been created
/// yet; the gateway never picks an id itself and never sends one back.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Book {
    pub id: u64,
    #[serde(deserialize_with = "null_as_default")]
    pub title: String,
    #[serde(deserialize_with = "authors_from_list_or_string")]
    pub authors: Vec<String>,
    #[serde(deserialize_with = "null_as_default")]
    pub author_sort: String,
    /// HTML.
    #[serde(deserialize_with = "null_as_default")]
    pub comments: String,
    #[serde(deserialize_with = "null_as_default")]
    pub cover: String,
    /// Paths of the stored format files. Read-only.
    #[serde(deserialize_with = "null_as_default")]
    pub formats: Vec<String>,
    /// Identifier scheme to value, e.g. `isbn` → `9780...`. Insertion order is
    /// preserved so encoded flags follow the order the client sent.
    #[serde(deserialize_with = "null_as_default")]
    pub identifiers: Map<String, Value>,
    #[serde(deserialize_with = "null_as_default")]
    pub isbn: String,
    #[serde(deserialize_with = "null_as_default")]
    pub languages: Vec<String>,
    #[serde(deserialize_with = "null_as_default")]
    pub last_modified: String,
    #[serde(deserialize_with = "null_as_default")]
    pub pubdate: String,
    #[serde(deserialize_with = "null_as_default")]
    pub publisher: String,
    pub rating: Option<f64>,
    #[serde(deserialize_with = "null_as_default")]
    pub series: String,
    /// `None` is "unset"; `Some(0.0)` is an explicit zero.
    pub series_index: Option<f64>,
    /// Total size in bytes. Read-only.
    pub size: Option<u64>,
    #[serde(deserialize_with = "null_as_default")]
    pub tags: Vec<String>,
    #[serde(deserialize_with = "null_as_default")]
    pub timestamp: String,
    /// Read-only.
    #[serde(deserialize_with = "null_as_default")]
    pub uuid: String,
}

/// The mutable metadata fields calibredb accepts, named as calibre names them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BookField {
    AuthorSort,
    Authors,
    Comments,
    Cover,
    Identifiers,
    Isbn,
    Languages,
    Pubdate,
    Publisher,
    Rating,
    Series,
    SeriesIndex,
    Tags,
    Timestamp,
    Title,
}

impl BookField {
    /// Field name as used by `calibredb set_metadata --field`.
    pub fn name(self) -> &'static str {
        match self {
            BookField::AuthorSort => "author_sort",
            BookField::Authors => "authors",
            BookField::Comments => "comments",
            BookField::Cover => "cover",
            BookField::Identifiers => "identifiers",
            BookField::Isbn => "isbn",
            BookField::Languages => "languages",
            BookField::Pubdate => "pubdate",
            BookField::Publisher => "publisher",
            BookField::Rating => "rating",
            BookField::Series => "series",
            BookField::SeriesIndex => "series_index",
            BookField::Tags => "tags",
            BookField::Timestamp => "timestamp",
            BookField::Title => "title",
        }
    }
}

/// Borrowed view of a single field, typed by how it has to be encoded.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum FieldValue<'a> {
    Text(&'a str),
    List(&'a [String]),
    Pairs(&'a Map<String, Value>),
    Number(Option<f64>),
}

impl Book {
    pub fn value(&self, field: BookField) -> FieldValue<'_> {
        match field {
            BookField::AuthorSort => FieldValue::Text(&self.author_sort),
            BookField::Authors => FieldValue::List(&self.authors),
            BookField::Comments => FieldValue::Text(&self.comments),
            BookField::Cover => FieldValue::Text(&self.cover),
            BookField::Identifiers => FieldValue::Pairs(&self.identifiers),
            BookField::Isbn => FieldValue::Text(&self.isbn),
            BookField::Languages => FieldValue::List(&self.languages),
            BookField::Pubdate => FieldValue::Text(&self.pubdate),
            BookField::Publisher => FieldValue::Text(&self.publisher),
            BookField::Rating => FieldValue::Number(self.rating),
            BookField::Series => FieldValue::Text(&self.series),
            BookField::SeriesIndex => FieldValue::Number(self.series_index),
            BookField::Tags => FieldValue::List(&self.tags),
            BookField::Timestamp => FieldValue::Text(&self.timestamp),
            BookField::Title => FieldValue::Text(&self.title),
        }
    }

    /// Parse the JSON array printed by `calibredb list --for-machine`.
    pub fn list_from_json(out: &str) -> serde_json::Result<Vec<Book>> {
        if out.trim().is_empty() {
            return Ok(Vec::new());
        }
        serde_json::from_str(out)
    }
}

fn null_as_default<'de, D, T>(deserializer: D) -> Result<T, D::Error>
where
    D: Deserializer<'de>,
    T: Default + Deserialize<'de>,
{
    Ok(Option::<T>::deserialize(deserializer)?.unwrap_or_default())
}

/// calibredb prints authors as one `&`-joined string; clients send a list.
fn authors_from_list_or_string<'de, D>(deserializer: D) -> Result<Vec<String>, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Authors {
        Joined(String),
        List(Vec<String>),
    }

    Ok(match Option::<Authors>::deserialize(deserializer)? {
        Some(Authors::Joined(s)) => s
            .split('&')
            .map(|a| a.trim().to_string())
            .filter(|a| !a.is_empty())
            .collect(),
        Some(Authors::List(list)) => list,
        None => Vec::new(),
    })
}
