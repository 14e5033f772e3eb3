use std::sync::Arc;

use crate::data::ProfileService;
use crate::model::{Comment, UserSnapshot};

/// Turns an `@username` into a user id.
pub struct MentionResolver {
    profiles: Arc<dyn ProfileService + Send + Sync>,
}

impl MentionResolver {
    pub fn new(profiles: Arc<dyn ProfileService + Send + Sync>) -> Self {
        Self { profiles }
    }

    /// Users already at hand are matched first; only then is the profile
    /// service searched. Failures are logged and yield `None`.
    pub fn resolve(&self, username: &str, related: &[&UserSnapshot]) -> Option<String> {
        let username = username.trim().trim_start_matches('@');
        if username.is_empty() {
            return None;
        }

        if let Some(user) = related
            .iter()
            .find(|user| user.username == username && !user.id.is_empty())
        {
            return Some(user.id.clone());
        }

        match self.profiles.search_by_username(username) {
            Ok(Some(profile)) if !profile.id.is_empty() => Some(profile.id),
            Ok(_) => {
                tracing::warn!(username, "mention did not match any profile");
                None
            }
            Err(err) => {
                tracing::warn!(username, error = %format!("{err:#}"), "mention lookup failed");
                None
            }
        }
    }

    /// Resolves against the replied-to user, then the comment's author.
    pub fn resolve_in(&self, username: &str, comment: &Comment) -> Option<String> {
        let related: Vec<&UserSnapshot> = [comment.parent_user.as_ref(), comment.user.as_ref()]
            .into_iter()
            .flatten()
            .collect();
        self.resolve(username, &related)
    }
}
