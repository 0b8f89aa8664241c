//! Offset pagination over an already fetched book list.
//!
//! calibredb has no cursor or offset support, so the full filtered and sorted
//! list is fetched and sliced here. Navigation links re-encode the same
//! `start`, `limit`, `sort` and `search` state the list was fetched with.

use serde::Serialize;
use url::form_urlencoded;

use crate::error::{GatewayError, Result};
use crate::query::ListQuery;

pub const DEFAULT_BASE_PATH: &str = "/books";

#[derive(Debug, Clone)]
pub struct PaginatedView<T> {
    items: Vec<T>,
    /// 1-based.
    start: usize,
    limit: usize,
    query: ListQuery,
    base_path: String,
}

#[derive(Debug, Serialize)]
pub struct PageResponse<'a, T> {
    pub items: &'a [T],
    pub metadata: PageMetadata,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PageMetadata {
    pub start: usize,
    pub limit: usize,
    pub count: usize,
    #[serde(rename = "self")]
    pub self_link: String,
    pub prev: String,
    pub next: String,
}

impl<T> PaginatedView<T> {
    /// Fails when `start` is 0 or past `count + 1`, or `limit` is 0.
    pub fn new(items: Vec<T>, start: usize, limit: usize, query: ListQuery) -> Result<Self> {
        if start < 1 {
            return Err(GatewayError::validation(format!(
                "start {} must be at least 1",
                start
            )));
        }
        if limit < 1 {
            return Err(GatewayError::validation(format!(
                "limit {} must be at least 1",
                limit
            )));
        }
        if start > items.len() + 1 {
            return Err(GatewayError::validation(format!(
                "start {} is larger than the number of results ({})",
                start,
                items.len()
            )));
        }

        Ok(Self {
            items,
            start,
            limit,
            query,
            base_path: DEFAULT_BASE_PATH.to_string(),
        })
    }

    pub fn with_base_path(mut self, base_path: impl Into<String>) -> Self {
        self.base_path = base_path.into();
        self
    }

    pub fn count(&self) -> usize {
        self.items.len()
    }

    /// Items in `[start-1, start-1+limit)`.
    pub fn page(&self) -> &[T] {
        let from = self.start - 1;
        let to = from.saturating_add(self.limit).min(self.items.len());
        &self.items[from..to]
    }

    pub fn has_prev(&self) -> bool {
        self.start > 1
    }

    pub fn has_next(&self) -> bool {
        self.start.saturating_add(self.limit) <= self.count()
    }

    pub fn build_query(&self, start: usize) -> String {
        let mut qs = form_urlencoded::Serializer::new(String::new());
        qs.append_pair("start", &start.to_string());
        qs.append_pair("limit", &self.limit.to_string());
        for key in &self.query.sort {
            qs.append_pair("sort", key);
        }
        for term in &self.query.search {
            qs.append_pair("search", term);
        }
        format!("{}?{}", self.base_path, qs.finish())
    }

    pub fn current_page(&self) -> String {
        self.build_query(self.start)
    }

    /// Empty string on the first page.
    pub fn prev_page(&self) -> String {
        if !self.has_prev() {
            return String::new();
        }
        self.build_query(self.start.saturating_sub(self.limit).max(1))
    }

    /// Empty string on the last page.
    pub fn next_page(&self) -> String {
        if !self.has_next() {
            return String::new();
        }
        self.build_query(self.start.saturating_add(self.limit))
    }

    pub fn metadata(&self) -> PageMetadata {
        PageMetadata {
            start: self.start,
            limit: self.limit,
            count: self.count(),
            self_link: self.current_page(),
            prev: self.prev_page(),
            next: self.next_page(),
        }
    }

    pub fn to_response(&self) -> PageResponse<'_, T> {
        PageResponse {
            items: self.page(),
            metadata: self.metadata(),
        }
    }
}
