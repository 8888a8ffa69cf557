//! Offset pagination shared by the order and activity listings.

use serde::{Deserialize, Serialize};

pub const DEFAULT_PAGE_SIZE: i64 = 50;
pub const MAX_PAGE_SIZE: i64 = 100;

/// Anything that carries raw `limit`/`offset` query parameters.
pub trait PageParams {
    fn requested_limit(&self) -> Option<i64>;
    fn requested_offset(&self) -> Option<i64>;

    /// Page size clamped to `1..=MAX_PAGE_SIZE`
    fn limit(&self) -> i64 {
        self.requested_limit()
            .unwrap_or(DEFAULT_PAGE_SIZE)
            .clamp(1, MAX_PAGE_SIZE)
    }

    fn offset(&self) -> i64 {
        self.requested_offset().unwrap_or(0).max(0)
    }
}

/// Plain `?limit=&offset=` parameters.
#[derive(Debug, Deserialize, Default)]
pub struct PaginationQuery {
    #[serde(default)]
    pub limit: Option<i64>,
    #[serde(default)]
    pub offset: Option<i64>,
}

impl PageParams for PaginationQuery {
    fn requested_limit(&self) -> Option<i64> {
        self.limit
    }

    fn requested_offset(&self) -> Option<i64> {
        self.offset
    }
}

#[derive(Debug, Serialize)]
pub struct Paginated<T> {
    pub items: Vec<T>,
    /// Matching rows across all pages
    pub total: i64,
    pub limit: i64,
    pub offset: i64,
    pub has_more: bool,
}

impl<T> Paginated<T> {
    /// Wrap one page of `items`, echoing the effective (clamped) parameters.
    pub fn new(items: Vec<T>, total: i64, params: &impl PageParams) -> Self {
        let limit = params.limit();
        let offset = params.offset();
        let has_more = offset + (items.len() as i64) < total;
        Self {
            items,
            total,
            limit,
            offset,
            has_more,
        }
    }
}
