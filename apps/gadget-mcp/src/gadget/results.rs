use serde_json::Value;

/// Largest result payload handed back to a tool caller, in bytes.
pub const MAX_RESULT_LEN: usize = 64 * 1024;

/// Accumulates event records as newline-delimited JSON.
///
/// Once the buffer holds more than its limit it stops retaining records; the
/// tail would be cut by [`truncate_results`] anyway.
#[derive(Debug)]
pub struct ResultBuffer {
    data: String,
    limit: usize,
    records: usize,
    dropped: usize,
}

impl Default for ResultBuffer {
    fn default() -> Self {
        Self::new()
    }
}

impl ResultBuffer {
    pub fn new() -> Self {
        Self::with_limit(MAX_RESULT_LEN)
    }

    pub fn with_limit(limit: usize) -> Self {
        Self {
            data: String::new(),
            limit,
            records: 0,
            dropped: 0,
        }
    }

    pub fn push_record(&mut self, record: &Value) {
        if self.data.len() > self.limit {
            self.dropped += 1;
            return;
        }
        self.data.push_str(&record.to_string());
        self.data.push('\n');
        self.records += 1;
    }

    pub fn records(&self) -> usize {
        self.records
    }

    /// Records discarded after the limit was exceeded.
    pub fn dropped(&self) -> usize {
        self.dropped
    }

    pub fn finish(self) -> String {
        truncate_with_limit(&self.data, self.limit)
    }
}

/// Wraps raw results for the caller, cutting them at [`MAX_RESULT_LEN`].
pub fn truncate_results(results: &str) -> String {
    truncate_with_limit(results, MAX_RESULT_LEN)
}

fn truncate_with_limit(results: &str, limit: usize) -> String {
    if results.len() <= limit {
        return format!("\n<results>{results}</results>\n");
    }
    let mut cut = limit;
    while !results.is_char_boundary(cut) {
        cut -= 1;
    }
    format!(
        "\n<isTruncated>true</isTruncated>\n<results>{}…</results>\n",
        &results[..cut]
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn short_results_are_wrapped_verbatim() {
        assert_eq!(truncate_results("hello"), "\n<results>hello</results>\n");
        assert_eq!(truncate_results(""), "\n<results></results>\n");
    }

    #[test]
    fn exactly_at_limit_is_not_truncated() {
        let results = "a".repeat(MAX_RESULT_LEN);
        let wrapped = truncate_results(&results);
        assert!(!wrapped.contains("<isTruncated>"));
        assert_eq!(wrapped.len(), MAX_RESULT_LEN + "\n<results></results>\n".len());
    }

    #[test]
    fn oversized_results_are_cut_and_flagged() {
        let results = "b".repeat(MAX_RESULT_LEN + 1);
        let wrapped = truncate_results(&results);
        let expected = format!(
            "\n<isTruncated>true</isTruncated>\n<results>{}…</results>\n",
            "b".repeat(MAX_RESULT_LEN)
        );
        assert_eq!(wrapped, expected);
    }

    #[test]
    fn cut_respects_utf8_boundaries() {
        // 'é' is two bytes, so the limit lands inside a character
        let results = format!("{}é{}", "x".repeat(MAX_RESULT_LEN - 1), "y".repeat(10));
        let wrapped = truncate_results(&results);
        let body = wrapped
            .trim_start_matches("\n<isTruncated>true</isTruncated>\n<results>")
            .trim_end_matches("…</results>\n");
        assert_eq!(body.len(), MAX_RESULT_LEN - 1);
    }

    #[test]
    fn buffer_writes_json_lines() {
        let mut buffer = ResultBuffer::new();
        buffer.push_record(&json!({"qname": "example.com."}));
        buffer.push_record(&json!({"qname": "kube-dns."}));
        assert_eq!(buffer.records(), 2);
        assert_eq!(
            buffer.finish(),
            "\n<results>{\"qname\":\"example.com.\"}\n{\"qname\":\"kube-dns.\"}\n</results>\n"
        );
    }

    #[test]
    fn buffer_stops_retaining_past_limit() {
        let mut buffer = ResultBuffer::with_limit(16);
        for seq in 0..10 {
            buffer.push_record(&json!({"seq": seq, "pad": "xxxx"}));
        }
        assert_eq!(buffer.records(), 1);
        assert_eq!(buffer.dropped(), 9);
        let finished = buffer.finish();
        assert!(finished.starts_with("\n<isTruncated>true</isTruncated>\n<results>"));
    }
}
