use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Author snapshot embedded in comments and posts at creation time.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UserSnapshot {
    #[serde(default)]
    pub id: String,
    #[serde(default)]
    pub username: String,
    #[serde(default)]
    pub first_name: String,
    #[serde(default)]
    pub last_name: String,
    #[serde(default)]
    pub avatar_url: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Comment {
    pub id: String,
    #[serde(default)]
    pub content: String,
    #[serde(default)]
    pub post_id: Option<String>,
    #[serde(default)]
    pub root_id: Option<String>,
    #[serde(default)]
    pub parent_id: Option<String>,
    #[serde(default)]
    pub user: Option<UserSnapshot>,
    /// Author of the comment this one replies to.
    #[serde(default, rename = "pUser")]
    pub parent_user: Option<UserSnapshot>,
    #[serde(default)]
    pub created_at: Option<DateTime<Utc>>,
}

impl Comment {
    pub fn is_root(&self) -> bool {
        match self.root_id.as_deref() {
            None | Some("") => true,
            Some(root) => root == self.id,
        }
    }

    /// Id of the top-level comment this one is displayed under.
    pub fn root_key(&self) -> &str {
        if self.is_root() {
            &self.id
        } else {
            self.root_id.as_deref().unwrap_or(&self.id)
        }
    }

    pub fn author_id(&self) -> Option<&str> {
        self.user
            .as_ref()
            .map(|user| user.id.as_str())
            .filter(|id| !id.is_empty())
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Profile {
    #[serde(default)]
    pub id: String,
    #[serde(default)]
    pub username: String,
    #[serde(default)]
    pub first_name: String,
    #[serde(default)]
    pub last_name: String,
    #[serde(default)]
    pub avatar_url: Option<String>,
    #[serde(default)]
    pub email: Option<String>,
    #[serde(default)]
    pub city: Option<String>,
    #[serde(default)]
    pub dob: Option<String>,
    #[serde(default)]
    pub mutual_friends: u32,
    #[serde(default)]
    pub request_sent: bool,
}

impl Profile {
    pub fn snapshot(&self) -> UserSnapshot {
        UserSnapshot {
            id: self.id.clone(),
            username: self.username.clone(),
            first_name: self.first_name.clone(),
            last_name: self.last_name.clone(),
            avatar_url: self.avatar_url.clone(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Post {
    pub id: String,
    #[serde(default)]
    pub content: String,
    #[serde(default)]
    pub user: Option<UserSnapshot>,
    /// Server-formatted age label ("2 hours ago").
    #[serde(default)]
    pub created: Option<String>,
    #[serde(default)]
    pub created_date: Option<DateTime<Utc>>,
    #[serde(default)]
    pub modified_date: Option<DateTime<Utc>>,
    #[serde(default)]
    pub visibility: Option<String>,
}

/// One page of a server-side list.
///
/// The feed endpoint puts its items under `data` and reports `currentPage`;
/// the comment and relationship endpoints use `content` / `pageNumber`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Page<T> {
    #[serde(default = "Vec::new", alias = "data")]
    pub content: Vec<T>,
    #[serde(default, alias = "pageNumber", alias = "currentPage")]
    pub number: u32,
    #[serde(default, alias = "pageSize")]
    pub size: u32,
    #[serde(default)]
    pub total_elements: u64,
    #[serde(default)]
    pub total_pages: u32,
}

impl<T> Page<T> {
    pub fn meta(&self) -> PageMeta {
        PageMeta {
            items: self.content.len(),
            total_elements: self.total_elements,
            total_pages: self.total_pages,
        }
    }
}

/// Page totals without the items, as the paginator sees them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct PageMeta {
    pub items: usize,
    pub total_elements: u64,
    pub total_pages: u32,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ApiEnvelope<T> {
    #[serde(default)]
    pub code: i64,
    #[serde(default)]
    pub message: Option<String>,
    pub result: Option<T>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CommentDraft {
    pub post_id: String,
    pub content: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub parent_id: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decodes_comment_response() {
        let raw = r#"{
            "id": "c2",
            "content": "hi @ann",
            "rootId": "c1",
            "parentId": "c1",
            "user": {"id": "u2", "username": "bob", "firstName": "Bob"},
            "pUser": {"id": "u1", "username": "ann"},
            "createdAt": "2024-05-01T10:00:00Z"
        }"#;
        let comment: Comment = serde_json::from_str(raw).unwrap();
        assert_eq!(comment.root_id.as_deref(), Some("c1"));
        assert_eq!(comment.parent_user.unwrap().username, "ann");
        assert_eq!(comment.user.unwrap().first_name, "Bob");
        assert!(comment.created_at.is_some());
    }

    #[test]
    fn root_detection_treats_missing_and_empty_as_root() {
        let mut comment: Comment = serde_json::from_str(r#"{"id": "a"}"#).unwrap();
        assert!(comment.is_root());
        comment.root_id = Some(String::new());
        assert!(comment.is_root());
        comment.root_id = Some("a".into());
        assert!(comment.is_root());
        comment.root_id = Some("b".into());
        assert!(!comment.is_root());
        assert_eq!(comment.root_key(), "b");
    }

    #[test]
    fn comment_requires_id() {
        assert!(serde_json::from_str::<Comment>(r#"{"content": "x"}"#).is_err());
    }

    #[test]
    fn feed_page_uses_data_and_current_page() {
        let raw = r#"{"currentPage": 1, "pageSize": 10, "totalPages": 3, "totalElements": 25,
                      "data": [{"id": "p1", "content": "hello"}]}"#;
        let page: Page<Post> = serde_json::from_str(raw).unwrap();
        assert_eq!(page.content.len(), 1);
        assert_eq!(page.number, 1);
        assert_eq!(page.total_pages, 3);
    }

    #[test]
    fn envelope_without_result() {
        let env: ApiEnvelope<Page<Comment>> =
            serde_json::from_str(r#"{"code": 1401, "message": "Unauthenticated"}"#).unwrap();
        assert!(env.result.is_none());
        assert_eq!(env.message.as_deref(), Some("Unauthenticated"));
    }

    #[test]
    fn draft_omits_missing_parent() {
        let draft = CommentDraft {
            post_id: "p".into(),
            content: "x".into(),
            parent_id: None,
        };
        let json = serde_json::to_value(&draft).unwrap();
        assert_eq!(json, serde_json::json!({"postId": "p", "content": "x"}));
    }
}
