use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use anyhow::{anyhow, Context, Result};
use chrono::{Duration, Utc};
use parking_lot::Mutex;

use crate::api;
use crate::model::{Comment, CommentDraft, Page, Post, Profile};

pub trait CommentService: Send + Sync {
    fn load_comments(&self, post_id: &str, page: u32, size: u32) -> Result<Page<Comment>>;
    fn create_comment(&self, draft: &CommentDraft) -> Result<Comment>;
    fn update_comment(&self, id: &str, content: &str) -> Result<Comment>;
    fn delete_comment(&self, id: &str) -> Result<()>;
}

pub trait FeedService: Send + Sync {
    fn load_feed(&self, page: u32, size: u32) -> Result<Page<Post>>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FriendList {
    Friends,
    Pending,
    Suggestions,
}

impl FriendList {
    pub const ALL: [FriendList; 3] = [
        FriendList::Friends,
        FriendList::Pending,
        FriendList::Suggestions,
    ];

    pub fn label(&self) -> &'static str {
        match self {
            FriendList::Friends => "Friends",
            FriendList::Pending => "Pending requests",
            FriendList::Suggestions => "Suggestions",
        }
    }

    pub fn next(&self) -> FriendList {
        match self {
            FriendList::Friends => FriendList::Pending,
            FriendList::Pending => FriendList::Suggestions,
            FriendList::Suggestions => FriendList::Friends,
        }
    }
}

pub trait FriendService: Send + Sync {
    fn load_list(&self, list: FriendList, page: u32, size: u32) -> Result<Page<Profile>>;
    fn accept_request(&self, user_id: &str) -> Result<()>;
    fn reject_request(&self, user_id: &str) -> Result<()>;
    fn send_request(&self, user_id: &str) -> Result<()>;
    fn remove_friend(&self, user_id: &str) -> Result<()>;
}

pub trait ProfileService: Send + Sync {
    fn my_profile(&self) -> Result<Profile>;
    fn profile(&self, id: &str) -> Result<Profile>;
    fn search_by_username(&self, username: &str) -> Result<Option<Profile>>;
}

pub struct ApiCommentService {
    client: Arc<api::Client>,
}

impl ApiCommentService {
    pub fn new(client: Arc<api::Client>) -> Self {
        Self { client }
    }
}

impl CommentService for ApiCommentService {
    fn load_comments(&self, post_id: &str, page: u32, size: u32) -> Result<Page<Comment>> {
        self.client
            .comments(post_id, page, size)
            .context("fetch comments")
    }

    fn create_comment(&self, draft: &CommentDraft) -> Result<Comment> {
        self.client
            .create_comment(draft)
            .context("create comment")
    }

    fn update_comment(&self, id: &str, content: &str) -> Result<Comment> {
        self.client
            .update_comment(id, content)
            .context("update comment")
    }

    fn delete_comment(&self, id: &str) -> Result<()> {
        self.client.delete_comment(id).context("delete comment")
    }
}

pub struct ApiFeedService {
    client: Arc<api::Client>,
}

impl ApiFeedService {
    pub fn new(client: Arc<api::Client>) -> Self {
        Self { client }
    }
}

impl FeedService for ApiFeedService {
    fn load_feed(&self, page: u32, size: u32) -> Result<Page<Post>> {
        self.client.feed(page, size).context("fetch feed")
    }
}

pub struct ApiFriendService {
    client: Arc<api::Client>,
}

impl ApiFriendService {
    pub fn new(client: Arc<api::Client>) -> Self {
        Self { client }
    }
}

impl FriendService for ApiFriendService {
    fn load_list(&self, list: FriendList, page: u32, size: u32) -> Result<Page<Profile>> {
        let result = match list {
            FriendList::Friends => self.client.my_friends(page, size),
            FriendList::Pending => self.client.pending_requests(page, size),
            FriendList::Suggestions => self.client.friend_suggestions(page, size),
        };
        result.with_context(|| format!("fetch {}", list.label().to_lowercase()))
    }

    fn accept_request(&self, user_id: &str) -> Result<()> {
        self.client
            .accept_friend_request(user_id)
            .context("accept friend request")
    }

    fn reject_request(&self, user_id: &str) -> Result<()> {
        self.client
            .reject_friend_request(user_id)
            .context("reject friend request")
    }

    fn send_request(&self, user_id: &str) -> Result<()> {
        self.client
            .send_friend_request(user_id)
            .context("send friend request")
    }

    fn remove_friend(&self, user_id: &str) -> Result<()> {
        self.client.remove_friend(user_id).context("remove friend")
    }
}

pub struct ApiProfileService {
    client: Arc<api::Client>,
}

impl ApiProfileService {
    pub fn new(client: Arc<api::Client>) -> Self {
        Self { client }
    }
}

impl ProfileService for ApiProfileService {
    fn my_profile(&self) -> Result<Profile> {
        self.client.my_profile().context("fetch my profile")
    }

    fn profile(&self, id: &str) -> Result<Profile> {
        self.client.profile(id).context("fetch profile")
    }

    fn search_by_username(&self, username: &str) -> Result<Option<Profile>> {
        self.client
            .search_username(username)
            .context("search profile by username")
    }
}

fn slice_page<T: Clone>(items: &[T], page: u32, size: u32) -> Page<T> {
    let size = size.max(1);
    let total = items.len();
    let start = (page as usize).saturating_mul(size as usize).min(total);
    let end = (start + size as usize).min(total);
    Page {
        content: items[start..end].to_vec(),
        number: page,
        size,
        total_elements: total as u64,
        total_pages: total.div_ceil(size as usize) as u32,
    }
}

fn mock_user(id: &str, username: &str, first: &str, last: &str) -> Profile {
    Profile {
        id: id.into(),
        username: username.into(),
        first_name: first.into(),
        last_name: last.into(),
        ..Profile::default()
    }
}

fn mock_people() -> Vec<Profile> {
    vec![
        mock_user("u-ann", "ann", "Ann", "Lee"),
        mock_user("u-bob", "bob", "Bob", "Tran"),
        mock_user("u-cam", "cam", "Cam", "Ngo"),
        mock_user("u-dee", "dee", "Dee", "Pham"),
    ]
}

/// In-memory comments, used for `--demo` and tests.
pub struct MockCommentService {
    comments: Mutex<Vec<Comment>>,
    next_id: AtomicU64,
}

impl MockCommentService {
    pub fn with_comments(post_id: &str, comments: Vec<Comment>) -> Self {
        let comments = comments
            .into_iter()
            .map(|mut comment| {
                comment.post_id.get_or_insert_with(|| post_id.to_string());
                comment
            })
            .collect();
        Self {
            comments: Mutex::new(comments),
            next_id: AtomicU64::new(1),
        }
    }
}

impl Default for MockCommentService {
    fn default() -> Self {
        let people = mock_people();
        let now = Utc::now();
        let at = |minutes: i64| Some(now - Duration::minutes(minutes));
        let by = |index: usize| Some(people[index].snapshot());
        let comments = vec![
            Comment {
                id: "c1".into(),
                content: "Welcome! Comments support `code`, $x^2 + y^2 = z^2$ and mentions like @bob.".into(),
                post_id: Some("welcome".into()),
                root_id: None,
                parent_id: None,
                user: by(0),
                parent_user: None,
                created_at: at(95),
            },
            Comment {
                id: "c2".into(),
                content: "@ann thanks, the sum is $$\\sum_{i=1}^{n} i = \\frac{n(n+1)}{2}$$".into(),
                post_id: Some("welcome".into()),
                root_id: Some("c1".into()),
                parent_id: Some("c1".into()),
                user: by(1),
                parent_user: by(0),
                created_at: at(60),
            },
            Comment {
                id: "c3".into(),
                content: "Replies to replies stay one level deep.".into(),
                post_id: Some("welcome".into()),
                root_id: Some("c1".into()),
                parent_id: Some("c2".into()),
                user: by(2),
                parent_user: by(1),
                created_at: at(30),
            },
            Comment {
                id: "c4".into(),
                content: "```rust\nfn main() {\n    println!(\"$not math$\");\n}\n```".into(),
                post_id: Some("welcome".into()),
                root_id: Some("c4".into()),
                parent_id: None,
                user: by(3),
                parent_user: None,
                created_at: at(5),
            },
        ];
        Self::with_comments("welcome", comments)
    }
}

impl CommentService for MockCommentService {
    fn load_comments(&self, post_id: &str, page: u32, size: u32) -> Result<Page<Comment>> {
        let comments = self.comments.lock();
        let matching = comments
            .iter()
            .filter(|comment| comment.post_id.as_deref() == Some(post_id))
            .cloned()
            .collect::<Vec<_>>();
        Ok(slice_page(&matching, page, size))
    }

    fn create_comment(&self, draft: &CommentDraft) -> Result<Comment> {
        let mut comments = self.comments.lock();
        let id = format!("new-{}", self.next_id.fetch_add(1, Ordering::SeqCst));
        let (root_id, parent_user) = match draft.parent_id.as_deref() {
            Some(parent_id) => {
                let parent = comments
                    .iter()
                    .find(|comment| comment.id == parent_id)
                    .ok_or_else(|| anyhow!("mock: parent comment {parent_id} not found"))?;
                (parent.root_key().to_string(), parent.user.clone())
            }
            None => (id.clone(), None),
        };
        let comment = Comment {
            id,
            content: draft.content.clone(),
            post_id: Some(draft.post_id.clone()),
            root_id: Some(root_id),
            parent_id: draft.parent_id.clone(),
            user: None,
            parent_user,
            created_at: Some(Utc::now()),
        };
        comments.insert(0, comment.clone());
        Ok(comment)
    }

    fn update_comment(&self, id: &str, content: &str) -> Result<Comment> {
        let mut comments = self.comments.lock();
        let comment = comments
            .iter_mut()
            .find(|comment| comment.id == id)
            .ok_or_else(|| anyhow!("mock: comment {id} not found"))?;
        comment.content = content.to_string();
        Ok(comment.clone())
    }

    fn delete_comment(&self, id: &str) -> Result<()> {
        self.comments.lock().retain(|comment| comment.id != id);
        Ok(())
    }
}

#[derive(Default)]
pub struct MockFeedService;

impl FeedService for MockFeedService {
    fn load_feed(&self, page: u32, size: u32) -> Result<Page<Post>> {
        let people = mock_people();
        let now = Utc::now();
        let mut posts = vec![Post {
            id: "welcome".into(),
            content: "# Welcome to social-tui\n\nBrowse your feed and comment threads from the terminal.\n\nComments for the selected post load in the right-hand pane.".into(),
            user: Some(people[0].snapshot()),
            created: Some("just now".into()),
            created_date: Some(now),
            modified_date: None,
            visibility: Some("PUBLIC".into()),
        }];
        for index in 1..=24 {
            let author = &people[index % people.len()];
            posts.push(Post {
                id: format!("post-{index}"),
                content: format!("Sample post number {index} by @{}.", author.username),
                user: Some(author.snapshot()),
                created: None,
                created_date: Some(now - Duration::hours(index as i64)),
                modified_date: None,
                visibility: Some("PUBLIC".into()),
            });
        }
        // The feed endpoint counts pages from one.
        Ok(slice_page(&posts, page.saturating_sub(1), size))
    }
}

pub struct MockFriendService {
    friends: Mutex<Vec<Profile>>,
    pending: Mutex<Vec<Profile>>,
    suggestions: Mutex<Vec<Profile>>,
}

impl Default for MockFriendService {
    fn default() -> Self {
        let people = mock_people();
        Self {
            friends: Mutex::new(people[..2].to_vec()),
            pending: Mutex::new(vec![people[2].clone()]),
            suggestions: Mutex::new(vec![Profile {
                mutual_friends: 2,
                ..people[3].clone()
            }]),
        }
    }
}

impl FriendService for MockFriendService {
    fn load_list(&self, list: FriendList, page: u32, size: u32) -> Result<Page<Profile>> {
        let items = match list {
            FriendList::Friends => self.friends.lock().clone(),
            FriendList::Pending => self.pending.lock().clone(),
            FriendList::Suggestions => self.suggestions.lock().clone(),
        };
        Ok(slice_page(&items, page, size))
    }

    fn accept_request(&self, user_id: &str) -> Result<()> {
        let mut pending = self.pending.lock();
        let index = pending
            .iter()
            .position(|profile| profile.id == user_id)
            .ok_or_else(|| anyhow!("mock: no request from {user_id}"))?;
        let profile = pending.remove(index);
        self.friends.lock().push(profile);
        Ok(())
    }

    fn reject_request(&self, user_id: &str) -> Result<()> {
        self.pending.lock().retain(|profile| profile.id != user_id);
        Ok(())
    }

    fn send_request(&self, user_id: &str) -> Result<()> {
        let mut suggestions = self.suggestions.lock();
        let profile = suggestions
            .iter_mut()
            .find(|profile| profile.id == user_id)
            .ok_or_else(|| anyhow!("mock: unknown user {user_id}"))?;
        profile.request_sent = true;
        Ok(())
    }

    fn remove_friend(&self, user_id: &str) -> Result<()> {
        self.friends.lock().retain(|profile| profile.id != user_id);
        Ok(())
    }
}

#[derive(Default)]
pub struct MockProfileService;

impl ProfileService for MockProfileService {
    fn my_profile(&self) -> Result<Profile> {
        Ok(mock_user("u-me", "me", "Demo", "User"))
    }

    fn profile(&self, id: &str) -> Result<Profile> {
        mock_people()
            .into_iter()
            .find(|profile| profile.id == id)
            .ok_or_else(|| anyhow!("mock: profile {id} not found"))
    }

    fn search_by_username(&self, username: &str) -> Result<Option<Profile>> {
        Ok(mock_people()
            .into_iter()
            .find(|profile| profile.username == username))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn slice_page_reports_totals() {
        let items = (0..25).collect::<Vec<u32>>();
        let page = slice_page(&items, 2, 10);
        assert_eq!(page.content, vec![20, 21, 22, 23, 24]);
        assert_eq!(page.total_pages, 3);
        assert_eq!(page.total_elements, 25);
        assert!(slice_page(&items, 5, 10).content.is_empty());
    }

    #[test]
    fn mock_feed_is_one_based() {
        let feed = MockFeedService;
        let first = feed.load_feed(1, 10).unwrap();
        assert_eq!(first.content[0].id, "welcome");
        let second = feed.load_feed(2, 10).unwrap();
        assert_eq!(second.content[0].id, "post-10");
    }

    #[test]
    fn mock_reply_inherits_root_of_parent() {
        let service = MockCommentService::default();
        let reply = service
            .create_comment(&CommentDraft {
                post_id: "welcome".into(),
                content: "deep".into(),
                parent_id: Some("c3".into()),
            })
            .unwrap();
        assert_eq!(reply.root_id.as_deref(), Some("c1"));
        assert_eq!(reply.parent_user.unwrap().username, "cam");
    }

    #[test]
    fn accepting_moves_request_to_friends() {
        let service = MockFriendService::default();
        service.accept_request("u-cam").unwrap();
        let pending = service.load_list(FriendList::Pending, 0, 10).unwrap();
        assert!(pending.content.is_empty());
        let friends = service.load_list(FriendList::Friends, 0, 10).unwrap();
        assert_eq!(friends.content.len(), 3);
    }

    #[test]
    fn friend_tabs_cycle() {
        let mut list = FriendList::Friends;
        for _ in 0..FriendList::ALL.len() {
            list = list.next();
        }
        assert_eq!(list, FriendList::Friends);
    }
}
