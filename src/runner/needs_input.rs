const NEEDS_INPUT_PHRASES: &[&str] = &[
    "i need",
    "need your",
    "confirm",
    "choose",
    "which option",
    "please provide",
    "please specify",
    "unable to proceed",
    "can't proceed",
    "cannot proceed",
    "waiting for your",
    "let me know",
    "would you like",
];

const MAX_PARTIAL_LINE_BYTES: usize = 64 * 1024;

const USER_MARKERS: &[&str] = &["user"];
const ASSISTANT_MARKERS: &[&str] = &["assistant", "thinking", "codex"];

pub fn contains_needs_input_phrase(text: &str) -> bool {
    let lower = text.to_lowercase();
    NEEDS_INPUT_PHRASES.iter().any(|phrase| lower.contains(phrase))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Speaker {
    Unknown,
    User,
    Assistant,
}

/// Per-run detector. Conversational runs only look at assistant-attributed
/// lines; everything else is matched as a whole.
#[derive(Debug)]
pub struct NeedsInputTracker {
    conversational: bool,
    speaker: Speaker,
    detected: bool,
    partial: String,
}

impl NeedsInputTracker {
    pub fn new(conversational: bool) -> Self {
        Self {
            conversational,
            speaker: Speaker::Unknown,
            detected: false,
            partial: String::new(),
        }
    }

    pub fn for_run_type(run_type: &str) -> Self {
        Self::new(run_type == "message")
    }

    pub fn detected(&self) -> bool {
        self.detected
    }

    pub fn speaker(&self) -> Speaker {
        self.speaker
    }

    /// Feeds one chunk. Returns true only on the chunk that first trips the flag.
    pub fn observe(&mut self, chunk: &str) -> bool {
        if self.detected {
            if self.conversational {
                self.track_speaker(chunk);
            }
            return false;
        }

        let hit = if self.conversational {
            self.track_speaker(chunk)
        } else {
            contains_needs_input_phrase(chunk)
        };
        if hit {
            self.detected = true;
        }
        hit
    }

    // Lines may be split across chunks; only complete lines switch the speaker.
    fn track_speaker(&mut self, chunk: &str) -> bool {
        self.partial.push_str(chunk);
        let mut hit = false;
        while let Some(idx) = self.partial.find('\n') {
            let line = self.partial[..idx].trim().to_string();
            self.partial.drain(..=idx);
            hit |= self.observe_line(&line);
        }
        if !self.partial.is_empty() && self.speaker == Speaker::Assistant {
            let tail = self.partial.trim();
            if !is_marker(tail) && contains_needs_input_phrase(tail) {
                hit = true;
            }
        }
        if self.partial.len() > MAX_PARTIAL_LINE_BYTES {
            self.partial.clear();
        }
        hit
    }

    fn observe_line(&mut self, line: &str) -> bool {
        let marker = line.to_ascii_lowercase();
        if USER_MARKERS.contains(&marker.as_str()) {
            self.speaker = Speaker::User;
            return false;
        }
        if ASSISTANT_MARKERS.contains(&marker.as_str()) {
            self.speaker = Speaker::Assistant;
            return false;
        }
        self.speaker == Speaker::Assistant && contains_needs_input_phrase(line)
    }
}

fn is_marker(line: &str) -> bool {
    let lower = line.to_ascii_lowercase();
    USER_MARKERS.contains(&lower.as_str()) || ASSISTANT_MARKERS.contains(&lower.as_str())
}
