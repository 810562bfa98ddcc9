use serde::{Deserialize, Serialize};

// Distribution v2 wire models

#[derive(Debug, Serialize, Deserialize)]
pub struct CatalogResponse {
    pub repositories: Vec<String>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct TagsListResponse {
    pub name: String,
    pub tags: Vec<String>,
}

/// One signature in the extension API response.
#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SignatureEntry {
    pub schema_version: i32,
    pub name: String,
    #[serde(rename = "type")]
    pub signature_type: String,
    pub content: String,
}

#[derive(Debug, Default, Serialize, Deserialize)]
pub struct SignatureListResponse {
    pub signatures: Vec<SignatureEntry>,
}

// Registry pagination: `?n=` and `?last=`

const DEFAULT_PAGE: usize = 100;
const MAX_PAGE: usize = 1000;

#[derive(Debug, Default, Clone, Deserialize)]
pub struct PaginationQuery {
    pub n: Option<i64>,
    pub last: Option<String>,
}

/// Apply `n`/`last` to a sorted listing.
///
/// Results are stable under repeated calls: entries strictly after `last`
/// in lexical order, clamped to at most `MAX_PAGE`. The returned link
/// target points at the next page when the listing was truncated.
pub fn paginate(
    items: Vec<String>,
    query: &PaginationQuery,
    base_path: &str,
) -> (Vec<String>, Option<String>) {
    let n = match query.n {
        Some(n) if n > 0 => (n as usize).min(MAX_PAGE),
        // Negative or missing page sizes fall back to the default.
        _ => DEFAULT_PAGE,
    };

    let mut items = items;
    if let Some(last) = &query.last {
        items.retain(|item| item.as_str() > last.as_str());
    }

    let truncated = items.len() > n;
    items.truncate(n);

    let link = if truncated {
        items
            .last()
            .map(|last| format!("{base_path}?n={n}&last={last}"))
    } else {
        None
    };
    (items, link)
}

/// Format a pagination link target as an RFC 5988 Link header value.
pub fn link_header(target: &str) -> String {
    format!("<{target}>; rel=\"next\"")
}
