use std::sync::Arc;
use std::time::Duration;

use percent_encoding::{utf8_percent_encode, AsciiSet, NON_ALPHANUMERIC};
use reqwest::blocking::{Client as HttpClient, Response};
use reqwest::header::{AUTHORIZATION, USER_AGENT};
use reqwest::{Method, StatusCode};
use serde::de::DeserializeOwned;
use serde_json::{json, Value};
use url::Url;

use crate::model::{ApiEnvelope, Comment, CommentDraft, Page, Post, Profile};
use crate::session::AuthSession;

pub const DEFAULT_BASE_URL: &str = "http://localhost:8888/api/v1/";
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(20);

#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error("unauthorized; sign in again")]
    Unauthorized,
    #[error("no access token configured")]
    MissingToken,
    #[error("not found")]
    NotFound,
    #[error("api error {status}: {message}")]
    Status { status: u16, message: String },
    #[error("response carried no result")]
    EmptyResult,
    #[error(transparent)]
    Transport(#[from] reqwest::Error),
    #[error(transparent)]
    Url(#[from] url::ParseError),
}

pub type ApiResult<T> = std::result::Result<T, ApiError>;

/// True when `err` (or anything it wraps) is a 401 from the backend.
pub fn is_unauthorized(err: &anyhow::Error) -> bool {
    matches!(err.downcast_ref::<ApiError>(), Some(ApiError::Unauthorized))
}

#[derive(Debug, Clone, Default)]
pub struct ClientConfig {
    pub user_agent: String,
    pub base_url: Option<String>,
    pub timeout: Option<Duration>,
    pub http_client: Option<HttpClient>,
}

pub struct Client {
    session: Arc<dyn AuthSession>,
    http: HttpClient,
    user_agent: String,
    base_url: Url,
}

impl Client {
    pub fn new(session: Arc<dyn AuthSession>, config: ClientConfig) -> anyhow::Result<Self> {
        if config.user_agent.trim().is_empty() {
            anyhow::bail!("api client user agent required");
        }
        let mut base = config
            .base_url
            .unwrap_or_else(|| DEFAULT_BASE_URL.to_string());
        // Url::join drops the last segment unless the base ends in a slash.
        if !base.ends_with('/') {
            base.push('/');
        }
        let base_url = Url::parse(&base)?;
        let http = match config.http_client {
            Some(client) => client,
            None => HttpClient::builder()
                .timeout(config.timeout.unwrap_or(DEFAULT_TIMEOUT))
                .build()?,
        };

        Ok(Client {
            session,
            http,
            user_agent: config.user_agent,
            base_url,
        })
    }

    pub fn base_url(&self) -> &Url {
        &self.base_url
    }

    pub fn comments(&self, post_id: &str, page: u32, size: u32) -> ApiResult<Page<Comment>> {
        let path = format!("comment/post/{}/all/paginated", segment(post_id));
        self.fetch(Method::GET, &path, &paging(page, size), None)
    }

    pub fn create_comment(&self, draft: &CommentDraft) -> ApiResult<Comment> {
        let body = serde_json::to_value(draft).map_err(|err| ApiError::Status {
            status: 0,
            message: format!("encode comment: {err}"),
        })?;
        self.fetch(Method::POST, "comment/create", &[], Some(body))
    }

    pub fn update_comment(&self, id: &str, content: &str) -> ApiResult<Comment> {
        let path = format!("comment/update/{}", segment(id));
        let body = json!({ "id": id, "content": content });
        self.fetch(Method::PUT, &path, &[], Some(body))
    }

    pub fn delete_comment(&self, id: &str) -> ApiResult<()> {
        let path = format!("comment/delete/{}", segment(id));
        self.send(Method::DELETE, &path, &[], None)
    }

    /// Feed pages are numbered from one.
    pub fn feed(&self, page: u32, size: u32) -> ApiResult<Page<Post>> {
        self.fetch(Method::GET, "post/get-feed", &paging(page, size), None)
    }

    pub fn my_friends(&self, page: u32, size: u32) -> ApiResult<Page<Profile>> {
        self.relationship_list("my-friends", page, size)
    }

    pub fn pending_requests(&self, page: u32, size: u32) -> ApiResult<Page<Profile>> {
        self.relationship_list("pending-requests", page, size)
    }

    pub fn friend_suggestions(&self, page: u32, size: u32) -> ApiResult<Page<Profile>> {
        self.relationship_list("friend-suggestions", page, size)
    }

    pub fn accept_friend_request(&self, user_id: &str) -> ApiResult<()> {
        self.relationship_action("accept-friend-request", user_id)
    }

    pub fn reject_friend_request(&self, user_id: &str) -> ApiResult<()> {
        self.relationship_action("reject-friend-request", user_id)
    }

    pub fn send_friend_request(&self, user_id: &str) -> ApiResult<()> {
        self.relationship_action("send-friend-request", user_id)
    }

    pub fn remove_friend(&self, user_id: &str) -> ApiResult<()> {
        let path = format!("profile/relationship/remove-friend/{}", segment(user_id));
        self.send(Method::DELETE, &path, &[], None)
    }

    pub fn my_profile(&self) -> ApiResult<Profile> {
        self.fetch(Method::GET, "profile/users/my-profile", &[], None)
    }

    pub fn profile(&self, id: &str) -> ApiResult<Profile> {
        let path = format!("profile/users/{}", segment(id));
        self.fetch(Method::GET, &path, &[], None)
    }

    /// `Ok(None)` when no user has that username.
    pub fn search_username(&self, username: &str) -> ApiResult<Option<Profile>> {
        let params = [("username", username.to_string())];
        match self.fetch(Method::GET, "profile/users/search", &params, None) {
            Ok(profile) => Ok(Some(profile)),
            Err(ApiError::NotFound) | Err(ApiError::EmptyResult) => Ok(None),
            Err(err) => Err(err),
        }
    }

    fn relationship_list(&self, name: &str, page: u32, size: u32) -> ApiResult<Page<Profile>> {
        let path = format!("profile/relationship/{name}");
        self.fetch(Method::GET, &path, &paging(page, size), None)
    }

    fn relationship_action(&self, name: &str, user_id: &str) -> ApiResult<()> {
        let path = format!("profile/relationship/{name}/{}", segment(user_id));
        self.send(Method::POST, &path, &[], None)
    }

    fn fetch<T>(
        &self,
        method: Method,
        path: &str,
        params: &[(&str, String)],
        body: Option<Value>,
    ) -> ApiResult<T>
    where
        T: DeserializeOwned,
    {
        let resp = self.request(method, path, params, body)?;
        let envelope: ApiEnvelope<T> = resp.json()?;
        envelope.result.ok_or(ApiError::EmptyResult)
    }

    fn send(
        &self,
        method: Method,
        path: &str,
        params: &[(&str, String)],
        body: Option<Value>,
    ) -> ApiResult<()> {
        self.request(method, path, params, body)?;
        Ok(())
    }

    fn request(
        &self,
        method: Method,
        path: &str,
        params: &[(&str, String)],
        body: Option<Value>,
    ) -> ApiResult<Response> {
        let token = self
            .session
            .token()
            .map_err(|_| ApiError::MissingToken)?;
        let mut url = self.base_url.join(path)?;
        if !params.is_empty() {
            let mut pairs = url.query_pairs_mut();
            for (k, v) in params {
                pairs.append_pair(k, v);
            }
        }

        tracing::debug!(%method, %url, "api request");
        let mut req = self.http.request(method, url);
        req = req.header(USER_AGENT, self.user_agent.clone());
        req = req.header(AUTHORIZATION, format!("Bearer {token}"));
        if let Some(body) = body {
            req = req.json(&body);
        }

        let resp = req.send()?;
        let status = resp.status();
        if status.is_success() {
            return Ok(resp);
        }
        let body = resp.text().unwrap_or_default();
        match status {
            StatusCode::UNAUTHORIZED => {
                tracing::warn!(path, "api rejected the token; logging out");
                self.session.log_out();
                Err(ApiError::Unauthorized)
            }
            StatusCode::NOT_FOUND => Err(ApiError::NotFound),
            _ => Err(ApiError::Status {
                status: status.as_u16(),
                message: error_message(&body),
            }),
        }
    }
}

fn paging(page: u32, size: u32) -> [(&'static str, String); 2] {
    [("page", page.to_string()), ("size", size.to_string())]
}

/// Percent-encodes an id for use as one path segment.
// RFC 3986 path segment: everything but unreserved characters is escaped.
const SEGMENT: &AsciiSet = &NON_ALPHANUMERIC
    .remove(b'-')
    .remove(b'.')
    .remove(b'_')
    .remove(b'~');

fn segment(raw: &str) -> String {
    utf8_percent_encode(raw, SEGMENT).to_string()
}

fn error_message(body: &str) -> String {
    serde_json::from_str::<ApiEnvelope<Value>>(body)
        .ok()
        .and_then(|envelope| envelope.message)
        .filter(|message| !message.trim().is_empty())
        .unwrap_or_else(|| body.trim().to_string())
}

#[cfg(test)]
mod tests {
    use std::thread;

    use super::*;
    use crate::session::Manager;

    struct Recorded {
        method: String,
        url: String,
        auth: Option<String>,
        body: String,
    }

    /// Serves one canned response per request and records what it saw.
    fn serve(
        responses: Vec<(u16, &'static str)>,
    ) -> (String, thread::JoinHandle<Vec<Recorded>>) {
        let server = tiny_http::Server::http("127.0.0.1:0").unwrap();
        let addr = server.server_addr().to_ip().unwrap();
        let handle = thread::spawn(move || {
            let mut seen = Vec::new();
            for (status, body) in responses {
                let mut request = server.recv().unwrap();
                let mut content = String::new();
                request.as_reader().read_to_string(&mut content).unwrap();
                let auth = request
                    .headers()
                    .iter()
                    .find(|h| h.field.equiv("Authorization"))
                    .map(|h| h.value.as_str().to_string());
                seen.push(Recorded {
                    method: request.method().as_str().to_string(),
                    url: request.url().to_string(),
                    auth,
                    body: content,
                });
                let response = tiny_http::Response::from_string(body).with_status_code(status);
                request.respond(response).unwrap();
            }
            seen
        });
        (format!("http://{addr}/api/v1"), handle)
    }

    fn client(base: &str, session: Arc<Manager>) -> Client {
        Client::new(
            session,
            ClientConfig {
                user_agent: "social-tui-test".into(),
                base_url: Some(base.to_string()),
                ..ClientConfig::default()
            },
        )
        .unwrap()
    }

    #[test]
    fn fetches_comment_page_with_bearer_token() {
        let (base, handle) = serve(vec![(
            200,
            r#"{"code":1000,"result":{"pageNumber":0,"pageSize":2,"totalPages":1,"totalElements":1,
                "content":[{"id":"c1","content":"hi","rootId":null}]}}"#,
        )]);
        let session = Arc::new(Manager::new(Some("tok".into())));
        let page = client(&base, session).comments("p 1", 0, 2).unwrap();
        assert_eq!(page.content[0].id, "c1");

        let seen = handle.join().unwrap();
        assert_eq!(seen[0].method, "GET");
        assert_eq!(
            seen[0].url,
            "/api/v1/comment/post/p%201/all/paginated?page=0&size=2"
        );
        assert_eq!(seen[0].auth.as_deref(), Some("Bearer tok"));
    }

    #[test]
    fn unauthorized_logs_the_session_out() {
        let (base, handle) = serve(vec![(401, r#"{"code":1401,"message":"Unauthenticated"}"#)]);
        let session = Arc::new(Manager::new(Some("stale".into())));
        let err = client(&base, session.clone()).feed(1, 10).unwrap_err();
        assert!(matches!(err, ApiError::Unauthorized));
        assert!(!session.is_authenticated());
        handle.join().unwrap();
    }

    #[test]
    fn unauthorized_survives_anyhow_context() {
        use anyhow::Context;
        let err = Err::<(), _>(ApiError::Unauthorized)
            .context("fetch feed")
            .unwrap_err();
        assert!(is_unauthorized(&err));
        assert!(!is_unauthorized(&anyhow::anyhow!("other")));
    }

    #[test]
    fn missing_token_never_reaches_the_network() {
        let session = Arc::new(Manager::default());
        // Nothing listens here; a request would fail with a transport error.
        let err = client("http://127.0.0.1:9", session)
            .my_profile()
            .unwrap_err();
        assert!(matches!(err, ApiError::MissingToken));
    }

    #[test]
    fn status_error_prefers_envelope_message() {
        let (base, handle) = serve(vec![
            (400, r#"{"code":4001,"message":"Content must not be blank"}"#),
            (500, "boom"),
        ]);
        let session = Arc::new(Manager::new(Some("tok".into())));
        let api = client(&base, session);
        let draft = CommentDraft {
            post_id: "p1".into(),
            content: String::new(),
            parent_id: None,
        };
        match api.create_comment(&draft).unwrap_err() {
            ApiError::Status { status, message } => {
                assert_eq!(status, 400);
                assert_eq!(message, "Content must not be blank");
            }
            other => panic!("unexpected error {other:?}"),
        }
        match api.delete_comment("c1").unwrap_err() {
            ApiError::Status { status, message } => {
                assert_eq!(status, 500);
                assert_eq!(message, "boom");
            }
            other => panic!("unexpected error {other:?}"),
        }
        let seen = handle.join().unwrap();
        assert_eq!(seen[0].body, r#"{"content":"","postId":"p1"}"#);
        assert_eq!(seen[1].method, "DELETE");
        assert_eq!(seen[1].url, "/api/v1/comment/delete/c1");
    }

    #[test]
    fn username_search_maps_not_found_to_none() {
        let (base, handle) = serve(vec![
            (404, r#"{"code":1404,"message":"User not found"}"#),
            (200, r#"{"code":1000,"result":{"id":"u1","username":"ann"}}"#),
        ]);
        let session = Arc::new(Manager::new(Some("tok".into())));
        let api = client(&base, session);
        assert!(api.search_username("ghost").unwrap().is_none());
        let found = api.search_username("ann").unwrap().unwrap();
        assert_eq!(found.id, "u1");
        let seen = handle.join().unwrap();
        assert_eq!(seen[1].url, "/api/v1/profile/users/search?username=ann");
    }

    #[test]
    fn friend_actions_post_to_relationship_paths() {
        let (base, handle) = serve(vec![(200, r#"{"code":1000}"#)]);
        let session = Arc::new(Manager::new(Some("tok".into())));
        client(&base, session).accept_friend_request("u9").unwrap();
        let seen = handle.join().unwrap();
        assert_eq!(seen[0].method, "POST");
        assert_eq!(
            seen[0].url,
            "/api/v1/profile/relationship/accept-friend-request/u9"
        );
    }
}
