use thiserror::Error;

/// Inclusive byte span `[start, end]` of the served file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct ByteRange {
    pub start: u64,
    pub end: u64,
}

impl ByteRange {
    pub fn len(&self) -> u64 {
        self.end - self.start + 1
    }

    pub fn content_range(&self, file_size: u64) -> String {
        format!("bytes {}-{}/{}", self.start, self.end, file_size)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RangeError {
    #[error("Invalid range header")]
    Malformed,
    #[error("Requested range not satisfiable")]
    Unsatisfiable,
}

/// Outcome of resolving a `Range` header against the current file size.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct ResolvedRange {
    pub range: ByteRange,
    /// Set when the client asked for an end past the last byte and it was
    /// pulled back to `file_size - 1`.
    pub clamped_from: Option<u64>,
}

/// Parses a single `bytes=<start>-[<end>]` range.
///
/// Multi-range and suffix (`bytes=-N`) forms are rejected as malformed.
pub(crate) fn parse_range(header: &str, file_size: u64) -> Result<ResolvedRange, RangeError> {
    let spec = header
        .trim()
        .strip_prefix("bytes=")
        .ok_or(RangeError::Malformed)?;
    let (start, end) = spec.split_once('-').ok_or(RangeError::Malformed)?;

    let start = parse_offset(start)?;
    let end = match end.trim() {
        "" => None,
        raw => Some(parse_offset(raw)?),
    };

    if start >= file_size {
        return Err(RangeError::Unsatisfiable);
    }
    if end.is_some_and(|end| end < start) {
        return Err(RangeError::Malformed);
    }

    let last = file_size - 1;
    let (end, clamped_from) = match end {
        None => (last, None),
        Some(end) if end > last => (last, Some(end)),
        Some(end) => (end, None),
    };

    Ok(ResolvedRange {
        range: ByteRange { start, end },
        clamped_from,
    })
}

fn parse_offset(raw: &str) -> Result<u64, RangeError> {
    let raw = raw.trim();
    if raw.is_empty() || !raw.bytes().all(|b| b.is_ascii_digit()) {
        return Err(RangeError::Malformed);
    }
    raw.parse::<u64>().map_err(|_| RangeError::Malformed)
}

#[cfg(test)]
#[path = "tests/range_tests.rs"]
mod tests;
