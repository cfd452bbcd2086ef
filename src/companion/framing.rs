/// Splits a byte stream into newline-delimited frames. A frame that grows past
/// `max_frame_bytes` before its newline arrives is dropped whole.
#[derive(Debug)]
pub struct LineFramer {
    buffer: Vec<u8>,
    max_frame_bytes: usize,
    discarding: bool,
    discarded_frames: usize,
}

impl LineFramer {
    pub fn new(max_frame_bytes: usize) -> Self {
        Self {
            buffer: Vec::new(),
            max_frame_bytes,
            discarding: false,
            discarded_frames: 0,
        }
    }

    pub fn push(&mut self, bytes: &[u8]) -> Vec<String> {
        let mut frames = Vec::new();
        let mut rest = bytes;

        while let Some(idx) = rest.iter().position(|byte| *byte == b'\n') {
            let (head, tail) = rest.split_at(idx);
            rest = &tail[1..];
            if self.discarding {
                self.discarding = false;
                self.buffer.clear();
                continue;
            }
            self.buffer.extend_from_slice(head);
            if self.buffer.len() > self.max_frame_bytes {
                self.discarded_frames += 1;
                self.buffer.clear();
                continue;
            }
            if self.buffer.last() == Some(&b'\r') {
                self.buffer.pop();
            }
            let frame = String::from_utf8_lossy(&self.buffer).into_owned();
            self.buffer.clear();
            if !frame.trim().is_empty() {
                frames.push(frame);
            }
        }

        if !self.discarding {
            self.buffer.extend_from_slice(rest);
            if self.buffer.len() > self.max_frame_bytes {
                self.buffer.clear();
                self.discarding = true;
                self.discarded_frames += 1;
            }
        }

        frames
    }

    pub fn consume_discarded_frames(&mut self) -> usize {
        std::mem::take(&mut self.discarded_frames)
    }

    pub fn flush(&mut self) -> Option<String> {
        let pending = std::mem::take(&mut self.buffer);
        let discarding = std::mem::replace(&mut self.discarding, false);
        if discarding || pending.is_empty() {
            return None;
        }
        Some(String::from_utf8_lossy(&pending).into_owned())
    }
}
