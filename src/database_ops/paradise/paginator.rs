use std::collections::HashSet;

use tracing::{debug, info, instrument};

use super::client::RoundApi;
use super::models::RoundMetadata;
use crate::error::IngestError;

/// Walks `/roundlist` backward from a cursor. Each page restarts at the last id of the
/// previous one, so consecutive pages overlap by one record.
pub struct CursorPaginator<'a, A: ?Sized> {
    api: &'a A,
    max_pages: usize,
}

impl<'a, A: RoundApi + ?Sized> CursorPaginator<'a, A> {
    pub fn new(api: &'a A, max_pages: usize) -> Self {
        Self {
            api,
            max_pages: max_pages.max(1),
        }
    }

    /// Rounds with `end_boundary <= round_id <= start_cursor`, newest first, no duplicates.
    /// `start_cursor == 0` starts at the newest round.
    #[instrument(skip(self))]
    pub async fn fetch_range(
        &self,
        start_cursor: i64,
        end_boundary: i64,
    ) -> Result<Vec<RoundMetadata>, IngestError> {
        if start_cursor != 0 && start_cursor < end_boundary {
            return Err(IngestError::InvalidRange {
                start: start_cursor,
                end: end_boundary,
            });
        }

        let mut cursor = start_cursor;
        let mut pages = 0usize;
        let mut seen: HashSet<i64> = HashSet::new();
        let mut out: Vec<RoundMetadata> = Vec::new();

        loop {
            let page = self
                .api
                .round_list(cursor)
                .await
                .map_err(|source| IngestError::PageFetch { cursor, source })?;

            let Some(last) = page.last().map(|r| r.round_id) else {
                if pages == 0 {
                    return Err(IngestError::RoundsNotFound { cursor });
                }
                return Err(IngestError::Pagination {
                    cursor,
                    pages,
                    reason: "empty page where the overlap record was expected".into(),
                });
            };
            if let Some(w) = page.windows(2).find(|w| w[0].round_id <= w[1].round_id) {
                return Err(IngestError::Pagination {
                    cursor,
                    pages,
                    reason: format!(
                        "page not strictly descending ({} then {})",
                        w[0].round_id, w[1].round_id
                    ),
                });
            }
            pages += 1;

            let page_len = page.len();
            let mut fresh = 0usize;
            for round in page {
                if round.round_id < end_boundary {
                    continue;
                }
                if seen.insert(round.round_id) {
                    fresh += 1;
                    out.push(round);
                }
            }
            debug!(cursor, page = pages, page_len, fresh, last, "roundlist page merged");

            if last <= end_boundary {
                break;
            }
            // Nothing older than the cursor came back: end of available history.
            if cursor != 0 && last >= cursor {
                info!(cursor, "reached end of round history before end boundary");
                break;
            }
            if pages >= self.max_pages {
                return Err(IngestError::Pagination {
                    cursor,
                    pages,
                    reason: format!("page limit {} reached before boundary {end_boundary}", self.max_pages),
                });
            }
            cursor = last;
        }

        info!(pages, rounds = out.len(), "round range paginated");
        Ok(out)
    }
}
