use std::collections::VecDeque;

use crate::row::{BufferedRow, Row};

/// Pending rows in dispatch order.
///
/// Rows leave only through [`RowBuffer::take_batch`]. A batch that failed to
/// dispatch comes back through [`RowBuffer::prepend`] so it goes out again
/// ahead of anything enqueued since.
#[derive(Debug, Default)]
pub struct RowBuffer {
    queue: VecDeque<BufferedRow>,
}

impl RowBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    /// Wrap each row with a fresh token and append. Returns the new length.
    pub fn push_rows(&mut self, rows: impl IntoIterator<Item = Row>) -> usize {
        self.queue.extend(rows.into_iter().map(BufferedRow::new));
        self.queue.len()
    }

    /// Remove up to `max` rows from the front.
    pub fn take_batch(&mut self, max: usize) -> Vec<BufferedRow> {
        let n = max.min(self.queue.len());
        self.queue.drain(..n).collect()
    }

    /// Put `batch` back in front of the current contents.
    /// After this call the buffer holds `[batch..., self...]`.
    pub fn prepend(&mut self, batch: Vec<BufferedRow>) {
        if batch.is_empty() {
            return;
        }
        let mut older: VecDeque<BufferedRow> = batch.into();
        older.append(&mut self.queue);
        self.queue = older;
    }

    pub fn iter(&self) -> impl Iterator<Item = &BufferedRow> {
        self.queue.iter()
    }
}

#[cfg(test)]
mod tests;
