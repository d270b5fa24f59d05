/// One event surfaced by [`crate::UpstreamClient::stream`] on `tokenChan`/`errChan`.
#[derive(Debug, Clone)]
pub enum StreamEvent {
    /// A non-empty `choices[0].delta.content` fragment. The first `TextDelta`
    /// emitted for a stream doubles as the first-frame signal a
    /// PipelineChannel uses to clear its TTFT deadline.
    TextDelta { text: String },
    /// Terminal event on `data: [DONE]` or response EOF.
    Done {
        model: String,
        tokens_in: u32,
        tokens_out: u32,
        stop_reason: String,
    },
    /// Terminal event on a transport-level failure mid-stream.
    Error { message: String },
}

/// A parsed `field: value` SSE line, field name already stripped.
#[derive(Debug, PartialEq, Eq)]
pub enum SseParsed {
    Event(String),
    Data(String),
}

/// Parse a single trimmed SSE line into its field, or `None` for anything
/// that isn't an `event:`/`data:` line (comments, blank separators).
pub fn parse_sse_line(line: &str) -> Option<SseParsed> {
    if let Some(rest) = line.strip_prefix("event: ") {
        return Some(SseParsed::Event(rest.to_string()));
    }
    if let Some(rest) = line.strip_prefix("event:") {
        return Some(SseParsed::Event(rest.trim_start().to_string()));
    }
    if let Some(rest) = line.strip_prefix("data: ") {
        return Some(SseParsed::Data(rest.to_string()));
    }
    if let Some(rest) = line.strip_prefix("data:") {
        return Some(SseParsed::Data(rest.trim_start().to_string()));
    }
    None
}
