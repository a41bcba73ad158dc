use kiln_process::ErrorPayload;

use crate::error::SupervisorError;

const MAX_MESSAGE_BYTES: usize = 8 * 1024;
const MAX_HINT_BYTES: usize = 1024;

fn truncate_utf8(s: &str, max_bytes: usize) -> String {
    if s.len() <= max_bytes {
        return s.to_string();
    }

    let suffix = "…(truncated)";
    let keep = max_bytes.saturating_sub(suffix.len()).max(1);
    let mut end = keep.min(s.len());
    while end > 0 && !s.is_char_boundary(end) {
        end = end.saturating_sub(1);
    }
    let mut out = s[..end].to_string();
    out.push_str(suffix);
    out
}

pub fn encode(code: &str, message: impl Into<String>, hint: Option<&str>) -> ErrorPayload {
    ErrorPayload {
        code: code.to_string(),
        message: truncate_utf8(&message.into(), MAX_MESSAGE_BYTES),
        hint: hint.map(|h| truncate_utf8(h, MAX_HINT_BYTES)),
    }
}

pub fn from_supervisor(err: &SupervisorError) -> ErrorPayload {
    encode(err.code(), err.to_string(), err.hint())
}
