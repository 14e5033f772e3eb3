use std::ops::Range;

use tracing::debug;

use crate::model::{Page, PageMeta};

pub const DEFAULT_PAGE_SIZE: u32 = 10;

/// Client-side view of a server-paginated list. `number` is always zero-based.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PageCursor {
    pub number: u32,
    pub size: u32,
    pub total_elements: u64,
    pub total_pages: u32,
}

impl PageCursor {
    pub fn new(size: u32) -> Self {
        Self {
            number: 0,
            size: size.max(1),
            total_elements: 0,
            total_pages: 0,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LoadState {
    Idle,
    Loading,
    Error { message: String, page: u32 },
}

/// A fetch the owning container has to perform and hand back to [`Paginator::finish`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PageRequest {
    pub generation: u64,
    /// Zero-based page index.
    pub number: u32,
    /// Index to send to the server (zero- or one-based depending on the endpoint).
    pub server_page: u32,
    pub size: u32,
}

#[derive(Debug, Clone)]
pub struct Paginator {
    cursor: PageCursor,
    state: LoadState,
    has_more: bool,
    generation: u64,
    base: u32,
    loaded: Option<u32>,
}

impl Paginator {
    pub fn new(size: u32) -> Self {
        Self::with_base(size, 0)
    }

    /// `base` is the index the server uses for the first page.
    pub fn with_base(size: u32, base: u32) -> Self {
        Self {
            cursor: PageCursor::new(size),
            state: LoadState::Idle,
            has_more: false,
            generation: 0,
            base,
            loaded: None,
        }
    }

    pub fn cursor(&self) -> PageCursor {
        self.cursor
    }

    pub fn state(&self) -> &LoadState {
        &self.state
    }

    pub fn is_loading(&self) -> bool {
        matches!(self.state, LoadState::Loading)
    }

    pub fn has_more(&self) -> bool {
        self.has_more
    }

    pub fn error(&self) -> Option<&str> {
        match &self.state {
            LoadState::Error { message, .. } => Some(message),
            _ => None,
        }
    }

    /// Back to page zero. Requests issued before the reset become stale.
    pub fn reset(&mut self) {
        self.cursor = PageCursor::new(self.cursor.size);
        self.state = LoadState::Idle;
        self.has_more = false;
        self.loaded = None;
        self.generation = self.generation.wrapping_add(1);
    }

    pub fn begin_initial(&mut self) -> Option<PageRequest> {
        self.begin_page(0)
    }

    /// Starts loading an explicit page. Refused while another load is in flight.
    pub fn begin_page(&mut self, number: u32) -> Option<PageRequest> {
        if self.is_loading() {
            return None;
        }
        self.cursor.number = number;
        self.state = LoadState::Loading;
        Some(self.request(number))
    }

    /// Moves to the next page when the list is idle and the server reported more.
    pub fn advance(&mut self) -> Option<PageRequest> {
        if self.state != LoadState::Idle || !self.has_more {
            return None;
        }
        let next = self.cursor.number + 1;
        self.begin_page(next)
    }

    /// Re-requests the page that failed. Only valid from the error state.
    pub fn retry(&mut self) -> Option<PageRequest> {
        let LoadState::Error { page, .. } = self.state else {
            return None;
        };
        self.state = LoadState::Idle;
        self.begin_page(page)
    }

    pub fn is_current(&self, request: &PageRequest) -> bool {
        request.generation == self.generation && self.is_loading()
    }

    /// Applies the outcome of `request`. Returns false when the result is stale.
    pub fn finish(&mut self, request: &PageRequest, outcome: Result<PageMeta, String>) -> bool {
        if !self.is_current(request) {
            debug!(
                page = request.number,
                generation = request.generation,
                "dropping stale page result"
            );
            return false;
        }
        match outcome {
            Ok(meta) => {
                self.cursor.number = request.number;
                self.cursor.total_elements = meta.total_elements;
                self.cursor.total_pages = meta.total_pages;
                self.has_more = meta.items > 0 && request.number + 1 < meta.total_pages;
                self.loaded = Some(request.number);
                self.state = LoadState::Idle;
            }
            Err(message) => {
                self.cursor.number = self.loaded.unwrap_or(0);
                self.state = LoadState::Error {
                    message,
                    page: request.number,
                };
            }
        }
        true
    }

    fn request(&self, number: u32) -> PageRequest {
        PageRequest {
            generation: self.generation,
            number,
            server_page: number + self.base,
            size: self.cursor.size,
        }
    }
}

/// Watches one list position (the last rendered row) and reports when it
/// scrolls into view.
///
/// Each observation fires at most once; observing a different position
/// disconnects the previous one first.
#[derive(Debug, Clone, Default)]
pub struct Sentinel {
    target: Option<usize>,
    fired: bool,
}

impl Sentinel {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn observe(&mut self, target: Option<usize>) {
        if self.target == target {
            return;
        }
        self.disconnect();
        self.target = target;
    }

    pub fn disconnect(&mut self) {
        self.target = None;
        self.fired = false;
    }

    pub fn target(&self) -> Option<usize> {
        self.target
    }

    /// Calls `on_intersect` when the observed row is inside `visible` and the
    /// list is neither loading nor exhausted. Returns whether it fired.
    pub fn check<F>(
        &mut self,
        visible: Range<usize>,
        loading: bool,
        has_more: bool,
        on_intersect: F,
    ) -> bool
    where
        F: FnOnce(),
    {
        let Some(target) = self.target else {
            return false;
        };
        if self.fired || loading || !has_more || !visible.contains(&target) {
            return false;
        }
        self.fired = true;
        on_intersect();
        true
    }
}

/// Paginator plus the items it produced, for lists without local edits.
#[derive(Debug, Clone)]
pub struct PagedList<T> {
    items: Vec<T>,
    pager: Paginator,
    sentinel: Sentinel,
}

impl<T> PagedList<T> {
    pub fn new(size: u32) -> Self {
        Self::with_base(size, 0)
    }

    pub fn with_base(size: u32, base: u32) -> Self {
        Self {
            items: Vec::new(),
            pager: Paginator::with_base(size, base),
            sentinel: Sentinel::new(),
        }
    }

    pub fn items(&self) -> &[T] {
        &self.items
    }

    pub fn get(&self, index: usize) -> Option<&T> {
        self.items.get(index)
    }

    pub fn iter_mut(&mut self) -> std::slice::IterMut<'_, T> {
        self.items.iter_mut()
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn pager(&self) -> &Paginator {
        &self.pager
    }

    pub fn reset(&mut self) {
        self.items.clear();
        self.pager.reset();
        self.sentinel.disconnect();
    }

    pub fn begin_initial(&mut self) -> Option<PageRequest> {
        self.pager.begin_initial()
    }

    pub fn retry(&mut self) -> Option<PageRequest> {
        self.pager.retry()
    }

    /// Feeds the visible row range to the sentinel; returns the next page to
    /// fetch when the last row came into view.
    pub fn on_scroll(&mut self, visible: Range<usize>) -> Option<PageRequest> {
        self.sentinel.observe(self.items.len().checked_sub(1));
        let mut request = None;
        let pager = &mut self.pager;
        let loading = pager.is_loading();
        let has_more = pager.has_more();
        self.sentinel.check(visible, loading, has_more, || {
            request = pager.advance();
        });
        request
    }

    pub fn finish(&mut self, request: &PageRequest, result: Result<Page<T>, String>) -> bool {
        match result {
            Ok(page) => {
                let meta = page.meta();
                if !self.pager.finish(request, Ok(meta)) {
                    return false;
                }
                if request.number == 0 {
                    self.items = page.content;
                } else {
                    self.items.extend(page.content);
                }
                true
            }
            Err(message) => self.pager.finish(request, Err(message)),
        }
    }

    pub fn remove_where<F>(&mut self, predicate: F) -> usize
    where
        F: Fn(&T) -> bool,
    {
        let before = self.items.len();
        self.items.retain(|item| !predicate(item));
        before - self.items.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn meta(items: usize, total_pages: u32) -> PageMeta {
        PageMeta {
            items,
            total_elements: (total_pages as u64) * 10,
            total_pages,
        }
    }

    fn page(items: Vec<u32>, total_pages: u32) -> Page<u32> {
        Page {
            content: items,
            number: 0,
            size: 10,
            total_elements: 0,
            total_pages,
        }
    }

    #[test]
    fn full_first_page_of_three_has_more() {
        let mut pager = Paginator::new(10);
        let req = pager.begin_initial().unwrap();
        assert!(pager.finish(&req, Ok(meta(10, 3))));
        assert!(pager.has_more());
        assert_eq!(pager.cursor().number, 0);
    }

    #[test]
    fn empty_last_page_has_no_more() {
        let mut pager = Paginator::new(10);
        let req = pager.begin_page(2).unwrap();
        assert!(pager.finish(&req, Ok(meta(0, 3))));
        assert!(!pager.has_more());
    }

    #[test]
    fn non_empty_page_at_last_index_has_no_more() {
        let mut pager = Paginator::new(10);
        let req = pager.begin_page(2).unwrap();
        pager.finish(&req, Ok(meta(7, 3)));
        assert!(!pager.has_more());
    }

    #[test]
    fn empty_page_never_has_more() {
        let mut pager = Paginator::new(10);
        let req = pager.begin_initial().unwrap();
        pager.finish(&req, Ok(meta(0, 50)));
        assert!(!pager.has_more());
    }

    #[test]
    fn advance_increments_by_one_and_blocks_reentry() {
        let mut pager = Paginator::new(10);
        let req = pager.begin_initial().unwrap();
        pager.finish(&req, Ok(meta(10, 3)));

        let next = pager.advance().unwrap();
        assert_eq!(next.number, 1);
        assert_eq!(pager.cursor().number, 1);
        assert!(pager.advance().is_none());
        assert!(pager.begin_initial().is_none());

        pager.finish(&next, Ok(meta(10, 3)));
        let last = pager.advance().unwrap();
        assert_eq!(last.number, 2);
        pager.finish(&last, Ok(meta(10, 3)));
        assert!(pager.advance().is_none());
        assert_eq!(pager.cursor().number, 2);
    }

    #[test]
    fn failure_keeps_cursor_and_waits_for_retry() {
        let mut pager = Paginator::new(10);
        let req = pager.begin_initial().unwrap();
        pager.finish(&req, Ok(meta(10, 3)));
        let next = pager.advance().unwrap();
        pager.finish(&next, Err("boom".into()));

        assert_eq!(pager.error(), Some("boom"));
        assert_eq!(pager.cursor().number, 0);
        assert!(pager.advance().is_none());

        let again = pager.retry().unwrap();
        assert_eq!(again.number, 1);
        assert!(pager.is_loading());
    }

    #[test]
    fn retry_requires_error_state() {
        let mut pager = Paginator::new(10);
        assert!(pager.retry().is_none());
    }

    #[test]
    fn reset_makes_in_flight_results_stale() {
        let mut pager = Paginator::new(10);
        let req = pager.begin_initial().unwrap();
        pager.reset();
        assert!(!pager.finish(&req, Ok(meta(10, 3))));
        assert_eq!(pager.state(), &LoadState::Idle);
        assert!(!pager.has_more());
    }

    #[test]
    fn one_based_endpoints_shift_the_server_page() {
        let mut pager = Paginator::with_base(10, 1);
        let req = pager.begin_initial().unwrap();
        assert_eq!(req.number, 0);
        assert_eq!(req.server_page, 1);
    }

    #[test]
    fn sentinel_fires_once_per_observation() {
        let mut sentinel = Sentinel::new();
        sentinel.observe(Some(9));
        let mut hits = 0;
        assert!(!sentinel.check(0..5, false, true, || hits += 1));
        assert!(sentinel.check(5..10, false, true, || hits += 1));
        assert!(!sentinel.check(5..10, false, true, || hits += 1));
        sentinel.observe(Some(19));
        assert!(sentinel.check(15..20, false, true, || hits += 1));
        assert_eq!(hits, 2);
    }

    #[test]
    fn sentinel_gate_blocks_when_loading_or_exhausted() {
        let mut sentinel = Sentinel::new();
        sentinel.observe(Some(3));
        assert!(!sentinel.check(0..10, true, true, || {}));
        assert!(!sentinel.check(0..10, false, false, || {}));
        assert!(sentinel.check(0..10, false, true, || {}));
    }

    #[test]
    fn paged_list_replaces_then_appends() {
        let mut list = PagedList::new(2);
        let req = list.begin_initial().unwrap();
        assert!(list.finish(&req, Ok(page(vec![1, 2], 3))));
        assert!(list.on_scroll(0..1).is_none());

        let next = list.on_scroll(0..2).unwrap();
        assert!(list.finish(&next, Ok(page(vec![3, 4], 3))));
        assert_eq!(list.items(), &[1, 2, 3, 4]);

        let again = list.begin_initial();
        assert!(again.is_some());
        list.finish(&again.unwrap(), Ok(page(vec![9], 1)));
        assert_eq!(list.items(), &[9]);
    }

    #[test]
    fn paged_list_error_leaves_items_untouched() {
        let mut list = PagedList::new(2);
        let req = list.begin_initial().unwrap();
        list.finish(&req, Ok(page(vec![1, 2], 3)));
        let next = list.on_scroll(0..2).unwrap();
        list.finish(&next, Err("offline".into()));
        assert_eq!(list.items(), &[1, 2]);
        assert_eq!(list.pager().error(), Some("offline"));
        assert!(list.on_scroll(0..2).is_none());
    }

    #[test]
    fn remove_where_drops_matching_items() {
        let mut list = PagedList::new(10);
        let req = list.begin_initial().unwrap();
        list.finish(&req, Ok(page(vec![1, 2, 3], 1)));
        assert_eq!(list.remove_where(|n| *n == 2), 1);
        assert_eq!(list.items(), &[1, 3]);
    }
}
