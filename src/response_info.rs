use once_cell::sync::Lazy;
use regex::Regex;
use reqwest::{
    Response, StatusCode,
    header::{ACCEPT_RANGES, CONTENT_LENGTH, CONTENT_RANGE, HeaderMap},
};

/// Status and headers of an HTTP response, kept after the body is handed off.
#[derive(Debug, Clone)]
pub struct ResponseInfo {
    status: StatusCode,
    response_headers: HeaderMap,
}

impl ResponseInfo {
    #[cfg(test)]
    fn new(status: StatusCode, response_headers: HeaderMap) -> Self {
        Self {
            status,
            response_headers,
        }
    }

    pub fn status(&self) -> StatusCode {
        self.status
    }

    /// Retrieve the content_length of the response.
    ///
    /// Returns None if the "content-length" header is missing or if its value
    /// is not a u64. Read from the headers so HEAD responses report it too.
    pub fn content_length(&self) -> Option<u64> {
        self.response_headers
            .get(CONTENT_LENGTH)
            .and_then(|val| val.to_str().ok())
            .and_then(|s| s.trim().parse::<u64>().ok())
    }

    /// Returns the total length of the resource, even if this is a partial response.
    pub fn total_length(&self) -> Option<u64> {
        if let Some(content_range) = self.content_range()
            && content_range.total.is_some()
        {
            return content_range.total;
        }
        if self.is_partial() {
            return None;
        }
        self.content_length()
    }

    pub fn content_range(&self) -> Option<ContentRange> {
        self.response_headers
            .get(CONTENT_RANGE)
            .and_then(|val| val.to_str().ok())
            .and_then(|header| {
                CONTENT_RANGE_RE.captures(header.trim()).and_then(|caps| {
                    let start = caps.get(1)?.as_str().parse().ok()?;
                    let end = caps.get(2)?.as_str().parse().ok()?;
                    let total = match caps.get(3)?.as_str() {
                        "*" => None,
                        n => n.parse().ok(),
                    };
                    Some(ContentRange { start, end, total })
                })
            })
    }

    pub fn accepts_ranges(&self) -> bool {
        self.response_headers
            .get(ACCEPT_RANGES)
            .and_then(|v| v.to_str().ok())
            .map(|s| !s.eq_ignore_ascii_case("none"))
            .unwrap_or(false)
    }

    pub fn is_partial(&self) -> bool {
        self.status == StatusCode::PARTIAL_CONTENT
    }

    /// First byte offset the body starts at. A full (200) response starts at
    /// zero no matter what range was asked for.
    pub fn body_offset(&self) -> u64 {
        if !self.is_partial() {
            return 0;
        }
        self.content_range().map(|r| r.start).unwrap_or(0)
    }
}

impl From<&Response> for ResponseInfo {
    fn from(value: &Response) -> Self {
        Self {
            status: value.status(),
            response_headers: value.headers().to_owned(),
        }
    }
}

static CONTENT_RANGE_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^bytes (\d+)-(\d+)/(\d+|\*)$").unwrap());

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ContentRange {
    pub start: u64,
    pub end: u64,
    pub total: Option<u64>,
}
