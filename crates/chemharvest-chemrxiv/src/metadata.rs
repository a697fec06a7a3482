//! Flattening of listing hits into the metadata table

use chemharvest_core::ItemId;
use serde_json::Value;

/// Columns of `chemrxiv_metadata.csv`
pub const CSV_COLUMNS: &[&str] = &[
    "id",
    "doi",
    "title",
    "abstract",
    "publishedDate",
    "submittedDate",
    "status",
    "version",
    "license",
    "keywords",
    "authors",
    "pdf_url",
];

/// Longest file name most filesystems accept
pub const MAX_FILENAME_LEN: usize = 255;

/// Render a scalar field as a CSV cell; missing and null become empty.
fn cell(v: Option<&Value>) -> String {
    match v {
        None | Some(Value::Null) => String::new(),
        Some(Value::String(s)) => s.clone(),
        Some(other) => other.to_string(),
    }
}

/// One table row for a listing hit, in [`CSV_COLUMNS`] order.
pub fn project(id: &ItemId, hit: &Value) -> Vec<String> {
    let item = hit.get("item").unwrap_or(&Value::Null);
    let keywords = match item.get("keywords") {
        Some(Value::Array(words)) => words
            .iter()
            .filter_map(Value::as_str)
            .collect::<Vec<_>>()
            .join("; "),
        other => cell(other),
    };
    let authors = item
        .get("authors")
        .and_then(Value::as_array)
        .map(|list| {
            list.iter()
                .filter_map(author_name)
                .collect::<Vec<_>>()
                .join("; ")
        })
        .unwrap_or_default();

    vec![
        id.to_string(),
        cell(item.get("doi")),
        cell(item.get("title")),
        cell(item.get("abstract")),
        cell(item.get("publishedDate")),
        cell(item.get("submittedDate")),
        cell(item.get("status")),
        cell(item.get("version")),
        cell(item.pointer("/license/name")),
        keywords,
        authors,
        pdf_url(hit).unwrap_or_default().to_string(),
    ]
}

/// "first last", or `None` when both parts are empty
fn author_name(author: &Value) -> Option<String> {
    let first = author.get("firstName").and_then(Value::as_str).unwrap_or("");
    let last = author.get("lastName").and_then(Value::as_str).unwrap_or("");
    let full = format!("{first} {last}");
    let full = full.trim();
    (!full.is_empty()).then(|| full.to_string())
}

/// URL of the original PDF asset
pub fn pdf_url(hit: &Value) -> Option<&str> {
    hit.pointer("/item/asset/original/url")
        .and_then(Value::as_str)
        .filter(|u| !u.is_empty())
}

/// Truncate `name` to [`MAX_FILENAME_LEN`] bytes, keeping its extension.
pub fn safe_filename(name: &str) -> String {
    if name.len() <= MAX_FILENAME_LEN {
        return name.to_string();
    }
    let (stem, ext) = match name.rfind('.') {
        Some(dot) if dot > 0 => name.split_at(dot),
        _ => (name, ""),
    };
    let mut keep = MAX_FILENAME_LEN.saturating_sub(ext.len()).min(stem.len());
    while !stem.is_char_boundary(keep) {
        keep -= 1;
    }
    format!("{}{ext}", &stem[..keep])
}
