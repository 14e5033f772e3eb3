use std::collections::{HashMap, HashSet};

use crate::model::Comment;

/// A root comment with every reply that belongs under it, flattened to one level.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Thread {
    pub root: Comment,
    pub replies: Vec<Comment>,
}

/// Groups a flat comment list into root comments with their replies.
///
/// Roots keep their input order and so do the replies inside each root.
/// Replies whose root is not in `comments` are left out; see [`orphans`].
pub fn organize(comments: &[Comment]) -> Vec<Thread> {
    let mut roots = Vec::new();
    let mut replies_by_root: HashMap<&str, Vec<Comment>> = HashMap::new();

    for comment in comments {
        if comment.is_root() {
            roots.push(comment);
        } else {
            replies_by_root
                .entry(comment.root_key())
                .or_default()
                .push(comment.clone());
        }
    }

    roots
        .into_iter()
        .map(|root| Thread {
            root: root.clone(),
            replies: replies_by_root.remove(root.id.as_str()).unwrap_or_default(),
        })
        .collect()
}

/// Replies whose root comment is not part of `comments`.
pub fn orphans(comments: &[Comment]) -> Vec<&Comment> {
    let roots: HashSet<&str> = comments
        .iter()
        .filter(|comment| comment.is_root())
        .map(|comment| comment.id.as_str())
        .collect();
    comments
        .iter()
        .filter(|comment| !comment.is_root() && !roots.contains(comment.root_key()))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn comment(id: &str, root: Option<&str>, parent: Option<&str>) -> Comment {
        Comment {
            id: id.into(),
            content: format!("body {id}"),
            post_id: Some("p1".into()),
            root_id: root.map(Into::into),
            parent_id: parent.map(Into::into),
            user: None,
            parent_user: None,
            created_at: None,
        }
    }

    fn shape(threads: &[Thread]) -> Vec<(String, Vec<String>)> {
        threads
            .iter()
            .map(|thread| {
                (
                    thread.root.id.clone(),
                    thread.replies.iter().map(|r| r.id.clone()).collect(),
                )
            })
            .collect()
    }

    #[test]
    fn groups_replies_under_roots() {
        let comments = vec![
            comment("1", Some("1"), None),
            comment("2", Some("1"), Some("1")),
            comment("3", Some("3"), None),
        ];
        let threads = organize(&comments);
        assert_eq!(
            shape(&threads),
            vec![
                ("1".to_string(), vec!["2".to_string()]),
                ("3".to_string(), vec![]),
            ]
        );
    }

    #[test]
    fn deep_replies_flatten_under_their_root_in_input_order() {
        let comments = vec![
            comment("r3", Some("r1"), Some("r2")),
            comment("r1", None, None),
            comment("r2", Some("r1"), Some("r1")),
            comment("x", Some("x"), None),
            comment("r4", Some("r1"), Some("r3")),
        ];
        let threads = organize(&comments);
        assert_eq!(
            shape(&threads),
            vec![
                (
                    "r1".to_string(),
                    vec!["r3".to_string(), "r2".to_string(), "r4".to_string()]
                ),
                ("x".to_string(), vec![]),
            ]
        );
    }

    #[test]
    fn every_comment_appears_exactly_once() {
        let comments = vec![
            comment("a", None, None),
            comment("b", Some("a"), Some("a")),
            comment("c", Some(""), None),
            comment("d", Some("c"), Some("c")),
            comment("e", Some("a"), Some("b")),
        ];
        let threads = organize(&comments);
        let mut seen: Vec<String> = threads
            .iter()
            .flat_map(|t| std::iter::once(&t.root).chain(t.replies.iter()))
            .map(|c| c.id.clone())
            .collect();
        seen.sort();
        assert_eq!(seen, vec!["a", "b", "c", "d", "e"]);
    }

    #[test]
    fn orphaned_replies_are_dropped_and_reported() {
        let comments = vec![
            comment("a", None, None),
            comment("b", Some("missing"), Some("missing")),
        ];
        let threads = organize(&comments);
        assert_eq!(shape(&threads), vec![("a".to_string(), vec![])]);
        let hidden = orphans(&comments);
        assert_eq!(hidden.len(), 1);
        assert_eq!(hidden[0].id, "b");
    }

    #[test]
    fn empty_input() {
        assert!(organize(&[]).is_empty());
        assert!(orphans(&[]).is_empty());
    }
}
