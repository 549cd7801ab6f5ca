//! Uniform batch pagination over the two store protocols.
//!
//! The chargEV DB paginates with numeric start tokens, the PlugFinder store
//! with opaque continuation markers. `CursorReader` hides the difference
//! behind one "fetch next batch" loop and enforces an optional total item
//! cap. When the cap falls in the middle of a batch the batch is truncated,
//! so `consumed()` is exact and no further page request is issued.

use async_trait::async_trait;

use crate::errors::Result;

/// Resume position within a paginated source.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PageCursor {
    /// Numeric start token (chargEV DB delta protocol).
    StartToken(u64),
    /// Opaque continuation marker (record-store query protocol).
    Continuation(String),
}

/// One page of results.
#[derive(Debug, Clone)]
pub struct Batch<T> {
    pub items: Vec<T>,
    pub more_coming: bool,
    /// Cursor for the next page; meaningful only while `more_coming`.
    pub next_cursor: Option<PageCursor>,
}

/// A single-pass paged source. Restartable only by constructing a new reader
/// with a freshly supplied cursor.
#[async_trait]
pub trait PageFetcher: Send {
    type Item: Send;

    async fn fetch_page(&mut self, cursor: Option<&PageCursor>) -> Result<Batch<Self::Item>>;
}

/// Drives a lazy, finite sequence of batches out of a [`PageFetcher`].
pub struct CursorReader<F: PageFetcher> {
    fetcher: F,
    cursor: Option<PageCursor>,
    item_cap: Option<usize>,
    consumed: usize,
    exhausted: bool,
}

impl<F: PageFetcher> CursorReader<F> {
    pub fn new(fetcher: F, item_cap: Option<usize>) -> Self {
        Self {
            fetcher,
            cursor: None,
            item_cap,
            consumed: 0,
            exhausted: false,
        }
    }

    /// Total number of items handed out so far.
    pub fn consumed(&self) -> usize {
        self.consumed
    }

    /// Fetch the next batch, or `None` once the source reports no more pages
    /// or the item cap has been reached. The final batch is truncated at the
    /// cap.
    pub async fn next_batch(&mut self) -> Result<Option<Vec<F::Item>>> {
        if self.exhausted {
            return Ok(None);
        }
        if let Some(cap) = self.item_cap {
            if self.consumed >= cap {
                self.exhausted = true;
                return Ok(None);
            }
        }

        let batch = self.fetcher.fetch_page(self.cursor.as_ref()).await?;
        let mut items = batch.items;

        if let Some(cap) = self.item_cap {
            let remaining = cap - self.consumed;
            if items.len() >= remaining {
                items.truncate(remaining);
                self.exhausted = true;
            }
        }

        if !batch.more_coming || batch.next_cursor.is_none() {
            self.exhausted = true;
        }
        self.cursor = batch.next_cursor;
        self.consumed += items.len();

        Ok(Some(items))
    }
}
