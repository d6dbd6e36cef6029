//! Lazy page-by-page listing.

use futures::stream::{self, Stream};

use cloudbackup_common::{Cursor, Locator, Page, RemoteFile, Result, SortKey};
use cloudbackup_storage::RemoteBackend;

/// Walks a backend listing one page per call.
///
/// Nothing is fetched ahead: a page is requested only when the caller asks
/// for it, and the continuation from each page is passed to the next
/// request unchanged. Once the backend returns a page without a
/// continuation, or a request fails, the pager is spent.
pub struct Pager<'a> {
    backend: &'a dyn RemoteBackend,
    parent: Option<Locator>,
    sort: SortKey,
    page_size: u32,
    cursor: Option<Cursor>,
    exhausted: bool,
}

impl<'a> Pager<'a> {
    /// List children of `parent`, or every file when `parent` is None.
    pub fn new(backend: &'a dyn RemoteBackend, parent: Option<Locator>, page_size: u32) -> Self {
        Self {
            backend,
            parent,
            sort: SortKey::default(),
            page_size,
            cursor: None,
            exhausted: false,
        }
    }

    pub fn with_sort(mut self, sort: SortKey) -> Self {
        self.sort = sort;
        self
    }

    /// Whether another page may follow.
    pub fn has_more(&self) -> bool {
        !self.exhausted
    }

    /// Fetch the next page, or None once the listing is done.
    pub async fn next_page(&mut self) -> Result<Option<Page>> {
        if self.exhausted {
            return Ok(None);
        }

        let result = self
            .backend
            .list(
                self.parent.as_ref(),
                self.cursor.as_ref(),
                self.page_size,
                self.sort,
            )
            .await;

        let page = match result {
            Ok(page) => page,
            Err(e) => {
                self.exhausted = true;
                return Err(e);
            }
        };

        match &page.next {
            Some(next) => self.cursor = Some(next.clone()),
            None => self.exhausted = true,
        }
        Ok(Some(page))
    }

    /// Turn the pager into a stream of pages.
    pub fn into_stream(self) -> impl Stream<Item = Result<Page>> + 'a {
        stream::try_unfold(self, |mut pager| async move {
            Ok(pager.next_page().await?.map(|page| (page, pager)))
        })
    }

    /// Drain every remaining page.
    pub async fn collect_items(mut self) -> Result<Vec<RemoteFile>> {
        let mut items = Vec::new();
        while let Some(page) = self.next_page().await? {
            items.extend(page.items);
        }
        Ok(items)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cloudbackup_storage::{Call, MemoryBackend};
    use futures::TryStreamExt;

    fn backend_with(count: usize) -> MemoryBackend {
        let backend = MemoryBackend::new();
        let root = backend.root().clone();
        for i in 0..count {
            backend
                .add_file(&root, &format!("file-{:02}", i), b"x")
                .unwrap();
        }
        backend.clear_calls();
        backend
    }

    fn list_calls(backend: &MemoryBackend) -> usize {
        backend
            .calls()
            .iter()
            .filter(|call| matches!(call, Call::List { .. }))
            .count()
    }

    #[tokio::test]
    async fn test_45_items_in_pages_of_20() {
        let backend = backend_with(45);
        let root = backend.root().clone();
        let mut pager = Pager::new(&backend, Some(root), 20);

        let mut sizes = Vec::new();
        let mut last = None;
        while let Some(page) = pager.next_page().await.unwrap() {
            sizes.push(page.len());
            last = Some(page);
        }

        assert_eq!(sizes, vec![20, 20, 5]);
        assert!(last.unwrap().next.is_none());
        assert_eq!(list_calls(&backend), 3);
        assert!(!pager.has_more());
    }

    #[tokio::test]
    async fn test_continuation_threaded_unchanged() {
        let backend = backend_with(5);
        let root = backend.root().clone();
        let mut pager = Pager::new(&backend, Some(root.clone()), 2);
        while pager.next_page().await.unwrap().is_some() {}

        let cursors: Vec<Option<Cursor>> = backend
            .calls()
            .into_iter()
            .filter_map(|call| match call {
                Call::List { cursor, .. } => Some(cursor),
                _ => None,
            })
            .collect();
        assert_eq!(
            cursors,
            vec![
                None,
                Some(Cursor::Token("page-2".to_string())),
                Some(Cursor::Token("page-4".to_string())),
            ]
        );
    }

    #[tokio::test]
    async fn test_no_read_ahead() {
        let backend = backend_with(45);
        let root = backend.root().clone();
        let mut pager = Pager::new(&backend, Some(root), 20);

        let first = pager.next_page().await.unwrap().unwrap();
        assert_eq!(first.len(), 20);
        drop(pager);
        assert_eq!(list_calls(&backend), 1);
    }

    #[tokio::test]
    async fn test_empty_listing_is_one_empty_page() {
        let backend = backend_with(0);
        let root = backend.root().clone();
        let mut pager = Pager::new(&backend, Some(root), 20);

        let page = pager.next_page().await.unwrap().unwrap();
        assert!(page.is_empty());
        assert!(pager.next_page().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_error_spends_pager() {
        let backend = backend_with(3);
        let missing = Locator::new("missing").unwrap();
        let mut pager = Pager::new(&backend, Some(missing), 20);

        assert!(pager.next_page().await.is_err());
        assert!(pager.next_page().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_stream_and_collect() {
        let backend = backend_with(7);
        let root = backend.root().clone();

        let pages: Vec<Page> = Pager::new(&backend, Some(root.clone()), 3)
            .into_stream()
            .try_collect()
            .await
            .unwrap();
        assert_eq!(pages.len(), 3);

        let items = Pager::new(&backend, Some(root), 3)
            .collect_items()
            .await
            .unwrap();
        assert_eq!(items.len(), 7);
        assert_eq!(items[0].name, "file-00");
    }
}
