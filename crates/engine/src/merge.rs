//! Cross-shop merge engine.
//!
//! Interleaves N independently paginated per-shop order streams into one
//! globally ordered page sequence. Each shop's own pages are assumed to be
//! internally ordered descending by `(timestamp, item_id)` - an assumption
//! inherited from the vendor and not independently verified here; a shop
//! emitting out-of-order pages degrades global ordering only for its own
//! items.
//!
//! Items from different shops are interleaved purely by ordering key, never
//! by shop priority: the merge reproduces the total order a single unified
//! upstream source would have produced.

use std::collections::VecDeque;

use futures::future::join_all;
use tracing::{debug, instrument, warn};

use shopdeck_core::{OrderRecord, OrderingKey, ShopId};

use crate::config::MergeConfig;
use crate::cursor::MergeCursor;
use crate::error::MergeError;
use crate::source::ShopSource;
use crate::upstream::PageParams;

/// One page of the merged multi-shop stream.
#[derive(Debug, Clone)]
pub struct MergedPage {
    /// Items in descending `(timestamp, item_id)` order.
    pub items: Vec<OrderRecord>,
    /// Opaque cursor resuming strictly after the last item, when the page
    /// filled completely.
    pub next_cursor: Option<String>,
    /// Conservative end-of-stream marker: any underfull page is treated as
    /// the last one.
    pub is_last_page: bool,
    /// True when at least one shop's fetch failed during this request, so an
    /// underfull page may be degradation rather than genuine end-of-data.
    pub is_partial: bool,
}

/// Per-shop working state for one `merge_page` request. Never persisted.
struct ShopMergeState {
    shop_id: ShopId,
    buffer: VecDeque<OrderRecord>,
    next_token: Option<String>,
    exhausted: bool,
    failed: bool,
}

impl ShopMergeState {
    fn new(shop_id: ShopId) -> Self {
        Self {
            shop_id,
            buffer: VecDeque::new(),
            next_token: None,
            exhausted: false,
            failed: false,
        }
    }
}

/// K-way merge over per-shop paginated sources.
#[derive(Clone)]
pub struct MergeEngine {
    source: ShopSource,
    config: MergeConfig,
}

impl MergeEngine {
    /// Create an engine over a source.
    #[must_use]
    pub fn new(source: ShopSource, config: MergeConfig) -> Self {
        Self { source, config }
    }

    /// Produce the next page of the globally ordered cross-shop stream.
    ///
    /// With no cursor the stream starts from the newest item; with a cursor
    /// it resumes strictly after the encoded position, never re-emitting an
    /// item the previous page already carried.
    ///
    /// A fetch failure for one shop marks that shop exhausted for this
    /// request instead of failing the merge: partial results with degraded
    /// completeness beat total failure, and `is_partial` reports it.
    ///
    /// # Errors
    ///
    /// Returns `MergeError::BadCursor` for an undecodable cursor and
    /// `MergeError::NoShops` when `shop_ids` is empty.
    #[instrument(skip(self, params, resume_cursor), fields(shops = shop_ids.len(), page_size))]
    pub async fn merge_page(
        &self,
        shop_ids: &[ShopId],
        params: &PageParams,
        resume_cursor: Option<&str>,
        page_size: usize,
    ) -> Result<MergedPage, MergeError> {
        if shop_ids.is_empty() {
            return Err(MergeError::NoShops);
        }

        let position = match resume_cursor {
            Some(raw) => Some(MergeCursor::decode(raw)?.position()?),
            None => None,
        };
        let fetch_size = u32::try_from(page_size).unwrap_or(u32::MAX);

        // Prime every shop concurrently; total latency tracks the slowest
        // shop, not the sum.
        let mut states: Vec<ShopMergeState> = join_all(
            shop_ids
                .iter()
                .map(|shop_id| self.prime_shop(shop_id, params, position.as_ref(), fetch_size)),
        )
        .await;

        let mut items: Vec<OrderRecord> = Vec::with_capacity(page_size);
        while items.len() < page_size {
            // Keep drained shops topped up so the selection always sees every
            // live stream; a drained-but-unexhausted shop may still hold
            // items newer than every other head.
            let refills = states
                .iter_mut()
                .filter(|state| state.buffer.is_empty() && !state.exhausted)
                .map(|state| {
                    self.refill_until_nonempty(state, params, fetch_size, position.as_ref())
                });
            join_all(refills).await;

            let Some(idx) = select_head(&states) else {
                break;
            };
            match states.get_mut(idx).and_then(|s| s.buffer.pop_front()) {
                Some(item) => items.push(item),
                None => break,
            }
        }

        let is_partial = states.iter().any(|state| state.failed);
        let (next_cursor, is_last_page) = match items.last() {
            Some(last) if items.len() == page_size => (
                Some(MergeCursor::after(&last.ordering_key()).encode()),
                false,
            ),
            _ => (None, true),
        };

        debug!(
            emitted = items.len(),
            is_last_page, is_partial, "merged page assembled"
        );
        Ok(MergedPage {
            items,
            next_cursor,
            is_last_page,
            is_partial,
        })
    }

    /// Fetch a shop's first page and, when resuming from a cursor, keep
    /// pulling (bounded) until the buffer gains items strictly after the
    /// cursor position or the shop runs out.
    async fn prime_shop(
        &self,
        shop_id: &ShopId,
        params: &PageParams,
        position: Option<&OrderingKey>,
        fetch_size: u32,
    ) -> ShopMergeState {
        let mut state = ShopMergeState::new(shop_id.clone());
        self.fetch_into(&mut state, params, fetch_size, position)
            .await;

        if position.is_some() {
            let mut extra = 0;
            while state.buffer.is_empty() && !state.exhausted {
                if extra >= self.config.cursor_refill_limit {
                    debug!(
                        shop_id = %state.shop_id,
                        limit = self.config.cursor_refill_limit,
                        "refill limit reached before any item qualified past the cursor"
                    );
                    break;
                }
                extra += 1;
                self.fetch_into(&mut state, params, fetch_size, position)
                    .await;
            }
        }
        state
    }

    /// Pull pages until the buffer is non-empty or the shop is exhausted,
    /// bounded so a pathological stream of empty pages cannot stall a
    /// request.
    async fn refill_until_nonempty(
        &self,
        state: &mut ShopMergeState,
        params: &PageParams,
        fetch_size: u32,
        position: Option<&OrderingKey>,
    ) {
        let mut extra = 0;
        while state.buffer.is_empty() && !state.exhausted {
            if extra > self.config.cursor_refill_limit {
                state.exhausted = true;
                break;
            }
            extra += 1;
            self.fetch_into(state, params, fetch_size, position).await;
        }
    }

    /// Fetch the shop's next page into its buffer, dropping items that are
    /// not strictly after `position`. A failure marks the shop exhausted for
    /// this request; already-buffered items stay usable.
    async fn fetch_into(
        &self,
        state: &mut ShopMergeState,
        params: &PageParams,
        fetch_size: u32,
        position: Option<&OrderingKey>,
    ) {
        let token = state.next_token.take();
        match self
            .source
            .fetch(&state.shop_id, params, fetch_size, token.as_deref())
            .await
        {
            Ok(page) => {
                state.next_token = page.next_token;
                state.exhausted = state.next_token.is_none();
                for item in page.items {
                    if position.is_none_or(|pos| item.ordering_key() < *pos) {
                        state.buffer.push_back(item);
                    }
                }
            }
            Err(e) => {
                warn!(
                    shop_id = %state.shop_id,
                    error = %e,
                    "page fetch failed; shop treated as exhausted for this request"
                );
                state.failed = true;
                state.exhausted = true;
            }
        }
    }
}

/// Index of the buffer whose head sorts first under the global order
/// (descending timestamp, then descending item ID).
fn select_head(states: &[ShopMergeState]) -> Option<usize> {
    let mut best: Option<(usize, OrderingKey)> = None;
    for (idx, state) in states.iter().enumerate() {
        if let Some(front) = state.buffer.front() {
            let key = front.ordering_key();
            if best.as_ref().is_none_or(|(_, best_key)| key > *best_key) {
                best = Some((idx, key));
            }
        }
    }
    best.map(|(idx, _)| idx)
}
