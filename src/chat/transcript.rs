//! The conversation transcript.
//!
//! Turns are kept in conversation order. Content only changes through the
//! methods here; the author flag never changes after a turn is appended.

use std::ops::Range;

use serde::Serialize;

const USER_LABEL: &str = "User";
const ASSISTANT_LABEL: &str = "AI";

/// Identity of a turn, assigned by the transcript at append time.
///
/// Ids increase monotonically and are never reused, even after `clear`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
pub struct TurnId(pub u64);

impl std::fmt::Display for TurnId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// One message in the conversation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Turn {
    id: TurnId,
    content: String,
    is_user: bool,
}

impl Turn {
    pub fn id(&self) -> TurnId {
        self.id
    }

    pub fn content(&self) -> &str {
        &self.content
    }

    pub fn is_user(&self) -> bool {
        self.is_user
    }

    pub fn speaker(&self) -> &'static str {
        if self.is_user {
            USER_LABEL
        } else {
            ASSISTANT_LABEL
        }
    }
}

/// What a regeneration needs: the prompt to resend and the turn to rewrite.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RegeneratePlan {
    pub index: usize,
    pub prompt: String,
}

/// What a continuation needs: the original question and the answer so far.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContinuePlan {
    pub index: usize,
    pub prompt: String,
    pub response: String,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct Transcript {
    turns: Vec<Turn>,
    next_id: u64,
}

impl Transcript {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn turns(&self) -> &[Turn] {
        &self.turns
    }

    pub fn get(&self, index: usize) -> Option<&Turn> {
        self.turns.get(index)
    }

    pub fn last(&self) -> Option<&Turn> {
        self.turns.last()
    }

    pub fn len(&self) -> usize {
        self.turns.len()
    }

    pub fn is_empty(&self) -> bool {
        self.turns.is_empty()
    }

    fn push(&mut self, content: String, is_user: bool) -> TurnId {
        let id = TurnId(self.next_id);
        self.next_id += 1;
        self.turns.push(Turn {
            id,
            content,
            is_user,
        });
        id
    }

    /// Append a user turn. User turns are never merged.
    pub fn append_user(&mut self, text: impl Into<String>) -> TurnId {
        self.push(text.into(), true)
    }

    /// Merge a streamed chunk into the trailing assistant turn, or start one.
    ///
    /// A chunk that is empty after trimming never starts a turn; once a turn
    /// exists, chunks are merged verbatim. Returns the id of the turn that
    /// received the chunk.
    pub fn append_or_merge_assistant(&mut self, chunk: &str) -> Option<TurnId> {
        if let Some(last) = self.turns.last_mut() {
            if !last.is_user {
                last.content.push_str(chunk);
                return Some(last.id);
            }
        }

        if chunk.trim().is_empty() {
            return None;
        }
        Some(self.push(chunk.to_string(), false))
    }

    /// Merge a streamed chunk into the assistant turn at `index`.
    ///
    /// Same whitespace rule as [`append_or_merge_assistant`](Self::append_or_merge_assistant):
    /// a whitespace-only chunk is dropped while the target is still empty.
    /// Returns `false` when `index` is out of range or names a user turn.
    pub fn merge_at(&mut self, index: usize, chunk: &str) -> bool {
        let Some(turn) = self.turns.get_mut(index) else {
            return false;
        };
        if turn.is_user {
            return false;
        }
        if turn.content.is_empty() && chunk.trim().is_empty() {
            return true;
        }
        turn.content.push_str(chunk);
        true
    }

    /// Replace the content of the turn at `index`, keeping its id and author.
    pub fn replace_at(&mut self, index: usize, content: impl Into<String>) -> bool {
        match self.turns.get_mut(index) {
            Some(turn) => {
                turn.content = content.into();
                true
            }
            None => false,
        }
    }

    /// Drop every turn after `index`. Returns the number removed.
    pub fn truncate_after(&mut self, index: usize) -> usize {
        let keep = index.saturating_add(1).min(self.turns.len());
        let removed = self.turns.len() - keep;
        self.turns.truncate(keep);
        removed
    }

    /// Index of the nearest user turn strictly before `index`.
    pub fn user_turn_before(&self, index: usize) -> Option<usize> {
        let end = index.min(self.turns.len());
        self.turns[..end].iter().rposition(|t| t.is_user)
    }

    /// Content of the nearest user turn before `index`, or empty if there is none.
    pub fn prompt_before(&self, index: usize) -> String {
        self.user_turn_before(index)
            .map(|i| self.turns[i].content.clone())
            .unwrap_or_default()
    }

    /// Gather what "continue generating" needs for the assistant turn at
    /// `index`. The transcript is not modified.
    pub fn continue_from(&self, index: usize) -> Option<ContinuePlan> {
        let turn = self.turns.get(index)?;
        if turn.is_user {
            return None;
        }
        Some(ContinuePlan {
            index,
            prompt: self.prompt_before(index),
            response: turn.content.clone(),
        })
    }

    /// Prepare the assistant turn at `index` for a fresh answer: everything
    /// after it is dropped and its content cleared. Requires a user turn
    /// before `index`; otherwise nothing changes.
    pub fn regenerate_at(&mut self, index: usize) -> Option<RegeneratePlan> {
        let turn = self.turns.get(index)?;
        if turn.is_user {
            return None;
        }
        let user = self.user_turn_before(index)?;
        let prompt = self.turns[user].content.clone();

        self.truncate_after(index);
        self.replace_at(index, String::new());

        Some(RegeneratePlan { index, prompt })
    }

    /// Remove every turn.
    pub fn clear(&mut self) {
        self.turns.clear();
    }

    /// Render turns in `range` as `"<speaker>: <content>"` separated by a
    /// blank line. Out-of-range bounds are clamped.
    pub fn copy_text(&self, range: Range<usize>) -> String {
        let end = range.end.min(self.turns.len());
        let start = range.start.min(end);
        self.turns[start..end]
            .iter()
            .map(|t| format!("{}: {}", t.speaker(), t.content))
            .collect::<Vec<_>>()
            .join("\n\n")
    }

    /// Content of a single turn, for the clipboard.
    pub fn copy_turn(&self, index: usize) -> Option<&str> {
        self.turns.get(index).map(|t| t.content.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ids_are_monotonic_and_not_reused() {
        let mut t = Transcript::new();
        let a = t.append_user("a");
        let b = t.append_or_merge_assistant("b").unwrap();
        t.clear();
        let c = t.append_user("c");
        assert!(a < b && b < c);
    }

    #[test]
    fn test_merge_keeps_identity() {
        let mut t = Transcript::new();
        t.append_user("Hello");
        let first = t.append_or_merge_assistant("Hi").unwrap();
        let second = t.append_or_merge_assistant(" there").unwrap();
        assert_eq!(first, second);
        assert_eq!(t.len(), 2);
        assert_eq!(t.last().unwrap().content(), "Hi there");
    }

    #[test]
    fn test_user_turns_never_merge() {
        let mut t = Transcript::new();
        t.append_user("one");
        t.append_user("two");
        assert_eq!(t.len(), 2);
        assert!(t.turns().iter().all(Turn::is_user));
    }

    #[test]
    fn test_merge_at_rejects_user_turn() {
        let mut t = Transcript::new();
        t.append_user("q");
        assert!(!t.merge_at(0, "x"));
        assert!(!t.merge_at(5, "x"));
        assert_eq!(t.get(0).unwrap().content(), "q");
    }

    #[test]
    fn test_truncate_after_past_end() {
        let mut t = Transcript::new();
        t.append_user("q");
        assert_eq!(t.truncate_after(3), 0);
        assert_eq!(t.len(), 1);
    }

    #[test]
    fn test_copy_turn() {
        let mut t = Transcript::new();
        t.append_user("q");
        t.append_or_merge_assistant("answer");
        assert_eq!(t.copy_turn(1), Some("answer"));
        assert_eq!(t.copy_turn(2), None);
    }
}
