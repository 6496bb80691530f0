//! Streaming byte rewriter: replaces every non-overlapping left-to-right
//! occurrence of a fixed pattern with a fixed replacement, over input
//! arriving in arbitrary chunks.

use std::io::Write as _;
use std::path::Path;

use anyhow::{Context, Result};

pub struct Rewriter<F: FnMut(&[u8]) -> Result<()>> {
    committed: Vec<u8>,
    capacity: usize,
    pending: Vec<u8>,
    pattern: Vec<u8>,
    replacement: Vec<u8>,
    consumer: F,
}

impl<F: FnMut(&[u8]) -> Result<()>> Rewriter<F> {
    pub fn new(pattern: &[u8], replacement: &[u8], capacity: usize, consumer: F) -> Rewriter<F> {
        // The committed buffer must be able to hold one whole replacement or
        // pending run between flushes.
        let capacity = capacity.max(pattern.len()).max(replacement.len()).max(1);
        Rewriter {
            committed: Vec::with_capacity(capacity),
            capacity,
            pending: Vec::with_capacity(pattern.len()),
            pattern: pattern.to_vec(),
            replacement: replacement.to_vec(),
            consumer,
        }
    }

    fn make_room(&mut self, needed: usize) -> Result<()> {
        if self.committed.len() + needed > self.capacity && !self.committed.is_empty() {
            (self.consumer)(&self.committed)?;
            self.committed.clear();
        }
        Ok(())
    }

    pub fn write(&mut self, data: &[u8]) -> Result<()> {
        if self.pattern.is_empty() {
            return (self.consumer)(data);
        }
        for &b in data {
            loop {
                if b == self.pattern[self.pending.len()] {
                    self.pending.push(b);
                    break;
                }
                if !self.pending.is_empty() {
                    // Failed partial match: commit the pending run, then
                    // retry this byte against the start of the pattern.
                    self.make_room(self.pending.len())?;
                    self.committed.extend_from_slice(&self.pending);
                    self.pending.clear();
                    continue;
                }
                self.make_room(1)?;
                self.committed.push(b);
                break;
            }
            if self.pending.len() == self.pattern.len() {
                self.make_room(self.replacement.len())?;
                self.committed.extend_from_slice(&self.replacement);
                self.pending.clear();
            }
        }
        Ok(())
    }

    /// Emit everything buffered, committed bytes first, then any partial
    /// match still pending.
    pub fn flush(&mut self) -> Result<()> {
        if !self.committed.is_empty() {
            (self.consumer)(&self.committed)?;
            self.committed.clear();
        }
        if !self.pending.is_empty() {
            (self.consumer)(&self.pending)?;
            self.pending.clear();
        }
        Ok(())
    }
}

/// Rewrite a file in place through a temp sibling, used to normalize dep
/// files whose compiler emitted mapped path prefixes.
pub fn rewrite_file(path: &Path, pattern: &[u8], replacement: &[u8]) -> Result<()> {
    let data = std::fs::read(path)
        .with_context(|| format!("read file for rewrite: {}", path.display()))?;
    let tmp = path.with_extension("rwtmp");
    {
        let mut out = std::fs::File::create(&tmp)
            .with_context(|| format!("create rewrite temp: {}", tmp.display()))?;
        let mut rw = Rewriter::new(pattern, replacement, 8192, |chunk| {
            out.write_all(chunk).context("write rewrite temp")
        });
        rw.write(&data)?;
        rw.flush()?;
    }
    std::fs::rename(&tmp, path)
        .with_context(|| format!("replace rewritten file: {}", path.display()))?;
    Ok(())
}
