//! Page/offset arithmetic for listings.

use serde::Serialize;

pub const DEFAULT_PER_PAGE: usize = 10;

/// Listing metadata returned next to the data.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Meta {
    pub per_page: usize,
    #[serde(rename = "page")]
    pub current_page: usize,
    #[serde(rename = "page_count")]
    pub total_page: usize,
    #[serde(rename = "total_count")]
    pub total_data: usize,
}

/// Requested page, 1-based. Missing or zero means the first page.
pub fn current_page(page: Option<usize>) -> usize {
    page.filter(|p| *p > 0).unwrap_or(1)
}

/// Requested page size. Missing or zero means the default.
pub fn per_page(per_page: Option<usize>) -> usize {
    per_page.filter(|p| *p > 0).unwrap_or(DEFAULT_PER_PAGE)
}

/// Rows to skip for `current_page`. `None` when the offset does not fit.
pub fn offset(current_page: usize, per_page: usize) -> Option<usize> {
    current_page.saturating_sub(1).checked_mul(per_page)
}

pub fn total_page(total: usize, per_page: usize) -> usize {
    if per_page == 0 {
        return 0;
    }
    total.div_ceil(per_page)
}
