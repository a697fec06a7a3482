//! ChemRxiv Engage public API: paginated item listing and PDF fetches

use std::time::Duration;

use chemharvest_core::stream::{self, StreamError};
use chemharvest_core::{CallError, CallResult, Cursor, Page, PageSource, WorkItem, http_client, is_pdf_bytes};
use serde_json::Value;

/// Items per listing page (API maximum)
pub const PAGE_SIZE: u64 = 50;

/// Listing client. Each hit is kept as raw JSON.
#[derive(Debug, Clone)]
pub struct ChemRxivApi {
    base: String,
    timeout: Duration,
}

impl ChemRxivApi {
    pub fn new(base: &str, timeout: Duration) -> Self {
        Self {
            base: base.trim_end_matches('/').to_string(),
            timeout,
        }
    }

    fn items_url(&self) -> String {
        format!("{}/items", self.base)
    }

    /// Total number of preprints, for progress display.
    pub fn total_count(&self) -> Result<u64, StreamError> {
        let json = stream::send_json(http_client().get(self.items_url()), self.timeout)?;
        Ok(json.get("totalCount").and_then(Value::as_u64).unwrap_or(0))
    }
}

impl PageSource for ChemRxivApi {
    type Payload = Value;

    fn fetch_page(&self, cursor: &Cursor) -> CallResult<Page<Value>> {
        let Cursor::Offset(skip) = *cursor else {
            return Err(CallError::fatal("listing only supports offset cursors"));
        };
        let request = http_client()
            .get(self.items_url())
            .query(&[("limit", PAGE_SIZE), ("skip", skip)]);
        let json = stream::send_json(request, self.timeout)?;
        parse_hits(json, skip)
    }
}

/// Decode the listing page at offset `skip` into work items keyed by
/// `item.id`.
///
/// A response without `itemHits` is an empty page; a non-array `itemHits`
/// is a decode failure. Hits lacking an id are skipped and counted. The
/// listing ends on a page with no raw hits, whatever survived decoding.
pub fn parse_hits(json: Value, skip: u64) -> CallResult<Page<Value>> {
    let Value::Object(mut body) = json else {
        return Err(CallError::fatal("listing response is not a JSON object"));
    };
    let hits = match body.remove("itemHits") {
        None | Some(Value::Null) => Vec::new(),
        Some(Value::Array(hits)) => hits,
        Some(_) => return Err(CallError::fatal("itemHits is not an array")),
    };
    let next = (!hits.is_empty()).then_some(Cursor::Offset(skip + PAGE_SIZE));
    let mut page = Page {
        items: Vec::with_capacity(hits.len()),
        skipped: 0,
        next,
    };
    for hit in hits {
        match item_id(&hit) {
            Some(id) => page.items.push(WorkItem::new(id, hit)),
            None => page.skipped += 1,
        }
    }
    Ok(page)
}

/// `item.id` of a listing hit
pub fn item_id(hit: &Value) -> Option<String> {
    match hit.pointer("/item/id")? {
        Value::String(s) if !s.is_empty() => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

/// Download one PDF. A body that is not a complete PDF (an HTML error or
/// captcha page) is item-fatal.
pub fn download_pdf(url: &str, timeout: Duration) -> CallResult<Vec<u8>> {
    let bytes = stream::send_bytes(http_client().get(url), timeout)?;
    if !is_pdf_bytes(&bytes) {
        return Err(CallError::fatal(format!(
            "response is not a PDF ({} bytes)",
            bytes.len()
        )));
    }
    Ok(bytes)
}
