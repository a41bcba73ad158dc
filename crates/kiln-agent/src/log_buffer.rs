use std::collections::VecDeque;

/// Bounded FIFO of raw console chunks for one instance.
#[derive(Debug)]
pub struct LogBuffer {
    max_chunks: usize,
    chunks: VecDeque<String>,
}

impl LogBuffer {
    pub fn new(max_chunks: usize) -> Self {
        let max_chunks = max_chunks.max(1);
        Self {
            max_chunks,
            chunks: VecDeque::with_capacity(max_chunks.min(4096)),
        }
    }

    pub fn append(&mut self, chunk: impl Into<String>) {
        let chunk = chunk.into();
        if chunk.is_empty() {
            return;
        }
        self.chunks.push_back(chunk);
        while self.chunks.len() > self.max_chunks {
            self.chunks.pop_front();
        }
    }

    /// All retained chunks concatenated, oldest first.
    pub fn snapshot(&self) -> String {
        let len = self.chunks.iter().map(String::len).sum();
        let mut out = String::with_capacity(len);
        for c in &self.chunks {
            out.push_str(c);
        }
        out
    }

    pub fn len(&self) -> usize {
        self.chunks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.chunks.is_empty()
    }
}
