use std::collections::HashSet;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use tracing::{debug, info};

use crate::data::CommentService;
use crate::model::{Comment, CommentDraft, Page, UserSnapshot};
use crate::pagination::{PageRequest, Paginator};
use crate::thread::{self, Thread};

/// Flat, ordered list of the comments loaded for one post.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommentStore {
    comments: Vec<Comment>,
}

impl CommentStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn comments(&self) -> &[Comment] {
        &self.comments
    }

    pub fn len(&self) -> usize {
        self.comments.len()
    }

    pub fn is_empty(&self) -> bool {
        self.comments.is_empty()
    }

    pub fn get(&self, id: &str) -> Option<&Comment> {
        self.comments.iter().find(|comment| comment.id == id)
    }

    pub fn ids(&self) -> Vec<&str> {
        self.comments.iter().map(|c| c.id.as_str()).collect()
    }

    /// Page zero replaces everything; later pages append entries whose id is new.
    pub fn apply_page(&mut self, page_index: u32, items: Vec<Comment>) {
        let mut seen: HashSet<String> = if page_index == 0 {
            self.comments.clear();
            HashSet::new()
        } else {
            self.comments.iter().map(|c| c.id.clone()).collect()
        };
        let mut skipped = 0usize;
        for comment in items {
            if seen.insert(comment.id.clone()) {
                self.comments.push(comment);
            } else {
                skipped += 1;
            }
        }
        if skipped > 0 {
            debug!(page = page_index, skipped, "skipped duplicate comments");
        }
    }

    pub fn add_local(&mut self, comment: Comment) {
        self.comments.retain(|existing| existing.id != comment.id);
        self.comments.insert(0, comment);
    }

    pub fn update_local(&mut self, id: &str, content: &str) -> bool {
        match self.comments.iter_mut().find(|comment| comment.id == id) {
            Some(comment) => {
                comment.content = content.to_string();
                true
            }
            None => false,
        }
    }

    pub fn remove_local(&mut self, id: &str) -> bool {
        let before = self.comments.len();
        self.comments.retain(|comment| comment.id != id);
        before != self.comments.len()
    }

    pub fn threads(&self) -> Vec<Thread> {
        thread::organize(&self.comments)
    }

    pub fn orphan_count(&self) -> usize {
        thread::orphans(&self.comments).len()
    }
}

/// The comment section of one post: store, pagination and the service behind them.
pub struct CommentSection {
    post_id: String,
    store: CommentStore,
    pager: Paginator,
    service: Arc<dyn CommentService + Send + Sync>,
    current_user: Option<UserSnapshot>,
}

impl CommentSection {
    pub fn new(
        post_id: impl Into<String>,
        page_size: u32,
        service: Arc<dyn CommentService + Send + Sync>,
        current_user: Option<UserSnapshot>,
    ) -> Self {
        Self {
            post_id: post_id.into(),
            store: CommentStore::new(),
            pager: Paginator::new(page_size),
            service,
            current_user,
        }
    }

    pub fn post_id(&self) -> &str {
        &self.post_id
    }

    pub fn store(&self) -> &CommentStore {
        &self.store
    }

    pub fn pager(&self) -> &Paginator {
        &self.pager
    }

    pub fn service(&self) -> Arc<dyn CommentService + Send + Sync> {
        self.service.clone()
    }

    pub fn threads(&self) -> Vec<Thread> {
        self.store.threads()
    }

    pub fn set_current_user(&mut self, user: Option<UserSnapshot>) {
        self.current_user = user;
    }

    pub fn is_own(&self, comment: &Comment) -> bool {
        match (&self.current_user, comment.author_id()) {
            (Some(me), Some(author)) => !me.id.is_empty() && me.id == author,
            _ => false,
        }
    }

    /// Loads one page synchronously: page zero replaces the store, others append.
    /// On failure the store is left as it was.
    pub fn load_page(&mut self, page_index: u32) -> Result<()> {
        let Some(request) = self.pager.begin_page(page_index) else {
            bail!("comments for {} are already loading", self.post_id);
        };
        let result = fetch_page(self.service.as_ref(), &self.post_id, &request);
        let error = result.as_ref().err().map(|err| format!("{err:#}"));
        self.finish(&request, result);
        match error {
            Some(message) => bail!("load comments: {message}"),
            None => Ok(()),
        }
    }

    pub fn begin_initial(&mut self) -> Option<PageRequest> {
        self.pager.begin_initial()
    }

    pub fn begin_next(&mut self) -> Option<PageRequest> {
        self.pager.advance()
    }

    pub fn retry(&mut self) -> Option<PageRequest> {
        self.pager.retry()
    }

    /// Applies a page fetched elsewhere. Stale requests are ignored.
    pub fn finish(&mut self, request: &PageRequest, result: Result<Page<Comment>>) -> bool {
        match result {
            Ok(page) => {
                if !self.pager.finish(request, Ok(page.meta())) {
                    return false;
                }
                info!(
                    post = %self.post_id,
                    page = request.number,
                    count = page.content.len(),
                    "loaded comments"
                );
                self.store.apply_page(request.number, page.content);
                true
            }
            Err(err) => self.pager.finish(request, Err(format!("{err:#}"))),
        }
    }

    pub fn draft(&self, content: &str, parent: Option<&Comment>) -> Result<CommentDraft> {
        let content = content.trim();
        if content.is_empty() {
            bail!("comment text is required");
        }
        Ok(CommentDraft {
            post_id: self.post_id.clone(),
            content: content.to_string(),
            parent_id: parent.map(|comment| comment.id.clone()),
        })
    }

    pub fn create(&mut self, content: &str, parent: Option<&Comment>) -> Result<()> {
        let draft = self.draft(content, parent)?;
        let created = self
            .service
            .create_comment(&draft)
            .context("create comment")?;
        self.apply_created(created);
        Ok(())
    }

    pub fn edit(&mut self, id: &str, content: &str) -> Result<()> {
        let content = content.trim();
        if content.is_empty() {
            bail!("comment text is required");
        }
        self.service
            .update_comment(id, content)
            .context("update comment")?;
        self.apply_updated(id, content);
        Ok(())
    }

    pub fn delete(&mut self, id: &str) -> Result<()> {
        self.service.delete_comment(id).context("delete comment")?;
        self.apply_deleted(id);
        Ok(())
    }

    pub fn apply_created(&mut self, mut comment: Comment) {
        if comment.user.is_none() {
            comment.user = self.current_user.clone();
        }
        if comment.post_id.is_none() {
            comment.post_id = Some(self.post_id.clone());
        }
        self.store.add_local(comment);
    }

    pub fn apply_updated(&mut self, id: &str, content: &str) -> bool {
        self.store.update_local(id, content)
    }

    pub fn apply_deleted(&mut self, id: &str) -> bool {
        self.store.remove_local(id)
    }
}

/// Blocking fetch for `request`; safe to run on a worker thread.
pub fn fetch_page(
    service: &(dyn CommentService + Send + Sync),
    post_id: &str,
    request: &PageRequest,
) -> Result<Page<Comment>> {
    service
        .load_comments(post_id, request.server_page, request.size)
        .with_context(|| format!("fetch comments page {}", request.number))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::MockCommentService;
    use crate::pagination::LoadState;
    use anyhow::anyhow;
    use parking_lot::Mutex;

    fn comment(id: &str, root: Option<&str>) -> Comment {
        Comment {
            id: id.into(),
            content: format!("text {id}"),
            post_id: Some("p1".into()),
            root_id: root.map(Into::into),
            parent_id: root.map(Into::into),
            user: None,
            parent_user: None,
            created_at: None,
        }
    }

    fn store_with(ids: &[&str]) -> CommentStore {
        let mut store = CommentStore::new();
        store.apply_page(0, ids.iter().map(|id| comment(id, None)).collect());
        store
    }

    #[test]
    fn remove_preserves_relative_order() {
        let mut store = store_with(&["1", "2", "3"]);
        assert!(store.remove_local("2"));
        assert_eq!(store.ids(), vec!["1", "3"]);
        assert!(!store.remove_local("42"));
        assert_eq!(store.ids(), vec!["1", "3"]);
    }

    #[test]
    fn page_zero_twice_is_idempotent() {
        let page = vec![comment("1", None), comment("2", Some("1"))];
        let mut once = CommentStore::new();
        once.apply_page(0, page.clone());
        let mut twice = CommentStore::new();
        twice.apply_page(0, page.clone());
        twice.apply_page(0, page);
        assert_eq!(once, twice);
    }

    #[test]
    fn later_pages_append_and_skip_known_ids() {
        let mut store = store_with(&["1", "2"]);
        store.apply_page(1, vec![comment("2", None), comment("3", None)]);
        assert_eq!(store.ids(), vec!["1", "2", "3"]);
    }

    #[test]
    fn add_local_puts_newest_first() {
        let mut store = store_with(&["1", "2"]);
        store.add_local(comment("9", None));
        assert_eq!(store.ids(), vec!["9", "1", "2"]);
        store.add_local(comment("2", None));
        assert_eq!(store.ids(), vec!["2", "9", "1"]);
    }

    #[test]
    fn update_local_changes_content_only_when_found() {
        let mut store = store_with(&["1"]);
        assert!(store.update_local("1", "edited"));
        assert_eq!(store.get("1").unwrap().content, "edited");
        assert!(!store.update_local("missing", "x"));
    }

    fn seeded_service(count: usize) -> Arc<MockCommentService> {
        let comments = (0..count)
            .map(|i| comment(&format!("c{i}"), None))
            .collect::<Vec<_>>();
        Arc::new(MockCommentService::with_comments("p1", comments))
    }

    #[test]
    fn section_pages_through_the_service() {
        let service = seeded_service(25);
        let mut section = CommentSection::new("p1", 10, service, None);
        section.load_page(0).unwrap();
        assert_eq!(section.store().len(), 10);
        assert!(section.pager().has_more());

        let next = section.begin_next().unwrap();
        let page = fetch_page(section.service().as_ref(), "p1", &next);
        assert!(section.finish(&next, page));
        let last = section.begin_next().unwrap();
        let page = fetch_page(section.service().as_ref(), "p1", &last);
        section.finish(&last, page);

        assert_eq!(section.store().len(), 25);
        assert!(!section.pager().has_more());
        assert!(section.begin_next().is_none());
    }

    #[test]
    fn reloading_page_zero_replaces_store() {
        let service = seeded_service(15);
        let mut section = CommentSection::new("p1", 10, service, None);
        section.load_page(0).unwrap();
        section.load_page(1).unwrap();
        assert_eq!(section.store().len(), 15);
        section.load_page(0).unwrap();
        assert_eq!(section.store().len(), 10);
    }

    struct FlakyService {
        inner: MockCommentService,
        fail: Mutex<bool>,
    }

    impl CommentService for FlakyService {
        fn load_comments(&self, post_id: &str, page: u32, size: u32) -> Result<Page<Comment>> {
            if *self.fail.lock() {
                return Err(anyhow!("server unavailable"));
            }
            self.inner.load_comments(post_id, page, size)
        }

        fn create_comment(&self, _draft: &CommentDraft) -> Result<Comment> {
            Err(anyhow!("server unavailable"))
        }

        fn update_comment(&self, id: &str, content: &str) -> Result<Comment> {
            self.inner.update_comment(id, content)
        }

        fn delete_comment(&self, _id: &str) -> Result<()> {
            Err(anyhow!("server unavailable"))
        }
    }

    #[test]
    fn failed_load_leaves_store_untouched() {
        let service = Arc::new(FlakyService {
            inner: MockCommentService::with_comments(
                "p1",
                (0..12).map(|i| comment(&format!("c{i}"), None)).collect(),
            ),
            fail: Mutex::new(false),
        });
        let mut section = CommentSection::new("p1", 10, service.clone(), None);
        section.load_page(0).unwrap();
        let before = section.store().clone();

        *service.fail.lock() = true;
        assert!(section.load_page(1).is_err());
        assert_eq!(section.store(), &before);
        assert!(matches!(section.pager().state(), LoadState::Error { page: 1, .. }));

        *service.fail.lock() = false;
        let again = section.retry().unwrap();
        let page = fetch_page(section.service().as_ref(), "p1", &again);
        section.finish(&again, page);
        assert_eq!(section.store().len(), 12);
    }

    #[test]
    fn failed_mutations_keep_previous_state() {
        let service = Arc::new(FlakyService {
            inner: MockCommentService::with_comments("p1", vec![comment("c1", None)]),
            fail: Mutex::new(false),
        });
        let mut section = CommentSection::new("p1", 10, service, None);
        section.load_page(0).unwrap();
        assert!(section.create("hello", None).is_err());
        assert!(section.delete("c1").is_err());
        assert_eq!(section.store().ids(), vec!["c1"]);
    }

    #[test]
    fn created_comment_goes_first_with_current_user() {
        let service = seeded_service(2);
        let me = UserSnapshot {
            id: "me".into(),
            username: "me".into(),
            ..UserSnapshot::default()
        };
        let mut section = CommentSection::new("p1", 10, service, Some(me));
        section.load_page(0).unwrap();
        let parent = section.store().comments()[1].clone();
        section.create("a reply", Some(&parent)).unwrap();

        let first = &section.store().comments()[0];
        assert_eq!(first.content, "a reply");
        assert_eq!(first.root_id.as_deref(), Some(parent.id.as_str()));
        assert!(section.is_own(first));
        let threads = section.threads();
        let thread = threads.iter().find(|t| t.root.id == parent.id).unwrap();
        assert_eq!(thread.replies.len(), 1);
    }

    #[test]
    fn edit_and_delete_apply_locally() {
        let service = seeded_service(3);
        let mut section = CommentSection::new("p1", 10, service, None);
        section.load_page(0).unwrap();
        section.edit("c1", "changed").unwrap();
        assert_eq!(section.store().get("c1").unwrap().content, "changed");
        section.delete("c1").unwrap();
        assert_eq!(section.store().ids(), vec!["c0", "c2"]);
    }

    #[test]
    fn blank_comment_is_rejected() {
        let service = seeded_service(0);
        let mut section = CommentSection::new("p1", 10, service, None);
        assert!(section.create("   ", None).is_err());
    }
}
