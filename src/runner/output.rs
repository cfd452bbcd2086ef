use once_cell::sync::Lazy;
use regex::Regex;

static ANSI_ESCAPE_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"\x1B\[[0-?]*[ -/]*[@-~]|\x1B\][^\x07\x1B]*(?:\x07|\x1B\\)|\x1B[@-Z\\-_]")
        .expect("valid ansi escape regex")
});

// Escape sequences that arrive already rendered as text, e.g. `\u001b[31m`.
static ESCAPED_ANSI_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?:\\u001[bB]|\\x1[bB]|\\033|\\e)\[[0-?]*[ -/]*[@-~]").expect("valid escaped ansi regex")
});

/// Banner and startup chatter printed by the agent CLI ahead of the transcript.
const MESSAGE_NOISE_PREFIXES: &[&str] = &[
    "OpenAI Codex v",
    "--------",
    "workdir:",
    "model:",
    "provider:",
    "approval:",
    "sandbox:",
    "reasoning effort:",
    "reasoning summaries:",
    "session id:",
    "mcp startup:",
    "mcp client",
    "mcp server",
    "[mcp]",
    "tokens used:",
];

pub fn strip_ansi(value: &str) -> String {
    let raw = ANSI_ESCAPE_RE.replace_all(value, "");
    ESCAPED_ANSI_RE.replace_all(&raw, "").into_owned()
}

fn is_noise_line(line: &str) -> bool {
    let trimmed = line.trim_start();
    let lower = trimmed.to_ascii_lowercase();
    MESSAGE_NOISE_PREFIXES.iter().any(|prefix| {
        let prefix_lower = prefix.to_ascii_lowercase();
        lower.starts_with(&prefix_lower)
    })
}

/// Removes banner lines while keeping the chunk's own line breaks.
pub fn filter_message_noise(value: &str) -> String {
    value
        .split_inclusive('\n')
        .filter(|line| !is_noise_line(line))
        .collect()
}

/// Normalises one managed-run chunk. `None` means nothing worth recording.
pub fn normalize_chunk(run_type: &str, raw: &str) -> Option<String> {
    let mut text = strip_ansi(raw);
    if run_type == "message" {
        text = filter_message_noise(&text);
    }
    if text.trim().is_empty() {
        return None;
    }
    Some(text)
}

/// Decodes a byte stream whose multi-byte sequences may straddle reads.
#[derive(Debug, Default)]
pub struct Utf8Carry {
    pending: Vec<u8>,
}

impl Utf8Carry {
    pub fn push(&mut self, bytes: &[u8]) -> String {
        self.pending.extend_from_slice(bytes);
        let mut decoded = String::new();
        loop {
            let (valid, invalid_len) = match std::str::from_utf8(&self.pending) {
                Ok(text) => {
                    decoded.push_str(text);
                    self.pending.clear();
                    return decoded;
                }
                Err(error) => (error.valid_up_to(), error.error_len()),
            };
            decoded.push_str(&String::from_utf8_lossy(&self.pending[..valid]));
            match invalid_len {
                Some(len) => {
                    decoded.push(char::REPLACEMENT_CHARACTER);
                    self.pending.drain(..valid + len);
                }
                None => {
                    self.pending.drain(..valid);
                    return decoded;
                }
            }
        }
    }

    /// Flushes an unfinished trailing sequence as a replacement character.
    pub fn finish(&mut self) -> String {
        let rest = String::from_utf8_lossy(&self.pending).into_owned();
        self.pending.clear();
        rest
    }
}
