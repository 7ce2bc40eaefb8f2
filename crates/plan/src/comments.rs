use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::{CommentId, ItemId, PlanId, UserId};

/// Free-text remark on a canvas item; replies nest exactly one level deep.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Comment {
    pub id: CommentId,
    pub plan_id: PlanId,
    pub item_id: ItemId,
    pub parent_id: Option<CommentId>,
    pub author_id: UserId,
    pub content: String,
    pub likes: u32,
    pub resolved: bool,
    pub created_at: DateTime<Utc>,
}

impl Comment {
    pub fn is_reply(&self) -> bool {
        self.parent_id.is_some()
    }
}

/// A top-level comment with its replies, in insertion order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CommentThread {
    pub comment: Comment,
    pub replies: Vec<Comment>,
}

/// Groups a flat, insertion-ordered list into threads.
///
/// Replies whose parent is not in the list are dropped.
pub fn thread_comments(comments: Vec<Comment>) -> Vec<CommentThread> {
    let mut threads: Vec<CommentThread> = Vec::new();
    let mut replies = Vec::new();
    for comment in comments {
        if comment.is_reply() {
            replies.push(comment);
        } else {
            threads.push(CommentThread {
                comment,
                replies: Vec::new(),
            });
        }
    }
    for reply in replies {
        if let Some(thread) = threads
            .iter_mut()
            .find(|t| Some(t.comment.id) == reply.parent_id)
        {
            thread.replies.push(reply);
        }
    }
    threads
}

#[cfg(test)]
mod tests {
    use super::*;

    fn comment(parent: Option<CommentId>, content: &str) -> Comment {
        Comment {
            id: CommentId::new(),
            plan_id: PlanId::new(),
            item_id: ItemId::new(),
            parent_id: parent,
            author_id: UserId::new(),
            content: content.to_string(),
            likes: 0,
            resolved: false,
            created_at: Utc::now(),
        }
    }

    #[test]
    fn test_threading_keeps_insertion_order() {
        let first = comment(None, "first");
        let second = comment(None, "second");
        let reply_a = comment(Some(first.id), "a");
        let reply_b = comment(Some(first.id), "b");
        let orphan = comment(Some(CommentId::new()), "orphan");

        let threads = thread_comments(vec![
            first.clone(),
            reply_a.clone(),
            second.clone(),
            orphan,
            reply_b.clone(),
        ]);

        assert_eq!(threads.len(), 2);
        assert_eq!(threads[0].comment.content, "first");
        assert_eq!(threads[1].comment.content, "second");
        let replies: Vec<_> = threads[0].replies.iter().map(|c| c.content.as_str()).collect();
        assert_eq!(replies, vec!["a", "b"]);
        assert!(threads[1].replies.is_empty());
    }
}
