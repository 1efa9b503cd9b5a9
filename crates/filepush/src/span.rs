use serde::{Deserialize, Serialize};

use crate::PumpError;

/// One contiguous, block-aligned region of a piecewise-virtual timeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Span {
    pub offset: u64,
    pub length: u64,
}

impl Span {
    pub fn new(offset: u64, length: u64) -> Self {
        Self { offset, length }
    }

    pub fn end(&self) -> u64 {
        self.offset.saturating_add(self.length)
    }
}

/// Supplies the next span to read once the current one is used up.
///
/// The returned length must be a multiple of `block_size`; anything else is a
/// programming error and aborts the pump thread. A zero-length span means
/// nothing is left, and the pump goes down its EOF path.
pub trait SpanProvider: Send + Sync {
    fn next_span(
        &self,
        current_position: u64,
        bytes_since_last_span: u64,
        block_size: usize,
    ) -> Span;
}

/// Fixed cut list played in order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SpanList {
    spans: Vec<Span>,
}

impl SpanList {
    /// Spans must be non-empty, block-aligned, sorted and non-overlapping.
    pub fn new(spans: Vec<Span>, block_size: usize) -> Result<Self, PumpError> {
        let block = block_size as u64;
        if block == 0 {
            return Err(PumpError::invalid_config("block_size must be non-zero"));
        }
        let mut previous_end = 0;
        for span in &spans {
            if span.length == 0 || span.length % block != 0 || span.offset % block != 0 {
                return Err(PumpError::invalid_config(format!(
                    "span {}+{} is not aligned to {block_size}-byte blocks",
                    span.offset, span.length
                )));
            }
            if span.offset < previous_end {
                return Err(PumpError::invalid_config(format!(
                    "span {}+{} overlaps or precedes the previous span",
                    span.offset, span.length
                )));
            }
            previous_end = span.end();
        }
        Ok(Self { spans })
    }

    pub fn spans(&self) -> &[Span] {
        &self.spans
    }

    /// Total number of bytes covered by the list.
    pub fn total_len(&self) -> u64 {
        self.spans.iter().map(|span| span.length).sum()
    }
}

impl SpanProvider for SpanList {
    fn next_span(
        &self,
        current_position: u64,
        _bytes_since_last_span: u64,
        _block_size: usize,
    ) -> Span {
        self.spans
            .iter()
            .find(|span| span.end() > current_position)
            .map(|span| {
                let start = span.offset.max(current_position);
                Span::new(start, span.end() - start)
            })
            .unwrap_or(Span::new(current_position, 0))
    }
}
