//! Restartable iteration over paged query results.
//!
//! [`QueryIterator`] hides backend page boundaries behind a single cursor:
//! `eof()` / `current()` / `advance()` walk records one at a time,
//! fetching the next page transparently whenever the current one is
//! exhausted and a backend token remains. Empty pages bearing a token
//! (filtered queries produce them) are skipped, not treated as the end.
//!
//! The externally visible token is `"{backend_token}@{offset}"`: the
//! backend cursor that fetched the current page (empty for the first
//! page), plus how many of its records have been consumed. Rebuilding an
//! iterator from such a token re-derives the page and skips the consumed
//! records, so a resumed drain neither repeats nor drops items.

use keygrid_core::{Fields, KeyConditions, StoreError, StoreResult};

use crate::storage::ResultPage;
use crate::table::{GetManyOptions, Table};

/// What the iterator fetches on each page boundary.
pub(crate) enum FetchSpec<'a> {
    GetMany {
        table: &'a Table,
        key: KeyConditions,
        reverse: bool,
        batch_size: Option<usize>,
    },
    Scan {
        table: &'a Table,
        limit: Option<usize>,
    },
}

/// Lazy, resumable cursor over a multi-page source.
pub struct QueryIterator<'a> {
    fetch: FetchSpec<'a>,
    /// The page addressed by `pagination_token`, once fetched.
    page: Option<ResultPage>,
    /// Offset of the next record within `page`.
    offset: usize,
    at_end: bool,
    /// Backend token that fetched (or will fetch) the current page.
    pagination_token: Option<String>,
}

impl<'a> QueryIterator<'a> {
    pub(crate) fn new(fetch: FetchSpec<'a>) -> Self {
        Self {
            fetch,
            page: None,
            offset: 0,
            at_end: false,
            pagination_token: None,
        }
    }

    /// Rebuild an iterator from an external token, fast-forwarding past
    /// the records the token marks as consumed.
    pub(crate) async fn resume(fetch: FetchSpec<'a>, token: &str) -> StoreResult<Self> {
        let (backend_token, consumed) = split_token(token)?;
        let mut iter = Self {
            fetch,
            page: None,
            offset: 0,
            at_end: false,
            pagination_token: backend_token,
        };
        let mut skipped = 0;
        while skipped < consumed && !iter.eof().await? {
            iter.advance().await?;
            skipped += 1;
        }
        Ok(iter)
    }

    /// True once every record has been consumed and no token remains.
    pub async fn eof(&mut self) -> StoreResult<bool> {
        loop {
            if self.at_end {
                return Ok(true);
            }
            if self.page.is_none() {
                self.page = Some(self.fetch_page().await?);
                self.offset = 0;
            }
            let page = self.page.as_ref().expect("page just fetched");
            if self.offset < page.records.len() {
                return Ok(false);
            }
            match &page.next_page_token {
                Some(token) => {
                    // Exhausted this page but more remain; roll forward.
                    self.pagination_token = Some(token.clone());
                    self.page = None;
                }
                None => {
                    self.at_end = true;
                    return Ok(true);
                }
            }
        }
    }

    /// The record under the cursor; fails at end of stream.
    pub async fn current(&mut self) -> StoreResult<Fields> {
        if self.eof().await? {
            return Err(StoreError::AtEndOfStream);
        }
        let page = self.page.as_ref().expect("settled by eof");
        Ok(page.records[self.offset].clone())
    }

    /// Move past the current record. A no-op at end of stream.
    pub async fn advance(&mut self) -> StoreResult<()> {
        if !self.eof().await? {
            self.offset += 1;
        }
        Ok(())
    }

    /// Token to hand a future iterator to pick up right here, or `None`
    /// at end of stream.
    pub async fn next_page_token(&mut self) -> StoreResult<Option<String>> {
        if self.eof().await? {
            return Ok(None);
        }
        Ok(Some(format!(
            "{}@{}",
            self.pagination_token.as_deref().unwrap_or(""),
            self.offset
        )))
    }

    /// Drain the remaining records into a vector.
    pub async fn collect(mut self) -> StoreResult<Vec<Fields>> {
        let mut records = Vec::new();
        while !self.eof().await? {
            records.push(self.current().await?);
            self.advance().await?;
        }
        Ok(records)
    }

    async fn fetch_page(&self) -> StoreResult<ResultPage> {
        match &self.fetch {
            FetchSpec::GetMany {
                table,
                key,
                reverse,
                batch_size,
            } => {
                table
                    .get_many(
                        key,
                        &GetManyOptions {
                            reverse: *reverse,
                            limit: *batch_size,
                            pagination_token: self.pagination_token.clone(),
                            filter: None,
                        },
                    )
                    .await
            }
            FetchSpec::Scan { table, limit } => {
                table.scan(*limit, self.pagination_token.as_deref()).await
            }
        }
    }
}

/// Split an iterator token into its backend part and consumed count.
fn split_token(token: &str) -> StoreResult<(Option<String>, usize)> {
    let Some((backend, consumed)) = token.rsplit_once('@') else {
        return Err(StoreError::BadToken(format!(
            "iterator token without offset: {token}"
        )));
    };
    let consumed = consumed
        .parse::<usize>()
        .map_err(|_| StoreError::BadToken(format!("bad iterator offset: {consumed}")))?;
    let backend = (!backend.is_empty()).then(|| backend.to_string());
    Ok((backend, consumed))
}
