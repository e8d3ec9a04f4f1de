//! `@mention` detection, autocomplete and extraction.
//!
//! All positions are character indices (Unicode scalar values), matching
//! what a text input reports as its cursor.

use std::sync::Arc;

use projchat_proto::member::Member;
use projchat_proto::message::UserId;

/// The channel roster, shared read-only for the whole session.
pub type Roster = Arc<[Member]>;

/// An `@token` being typed at the cursor.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MentionTrigger {
    /// Character index of the `@`.
    pub start: usize,
    /// Text between the `@` and the cursor.
    pub token: String,
}

/// Result of [`insert_mention`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MentionInsertion {
    /// The edited text.
    pub text: String,
    /// Cursor position right after the inserted trailing space.
    pub cursor: usize,
}

/// Find the mention being typed at `cursor`.
///
/// Scans backwards from the cursor to the nearest `@`. Returns `None` if
/// whitespace comes first, if there is no `@`, or if `cursor` is past the end
/// of `text`.
#[must_use]
pub fn detect_trigger(text: &str, cursor: usize) -> Option<MentionTrigger> {
    let chars: Vec<char> = text.chars().collect();
    if cursor > chars.len() {
        return None;
    }
    for start in (0..cursor).rev() {
        match chars[start] {
            '@' => {
                return Some(MentionTrigger {
                    start,
                    token: chars[start + 1..cursor].iter().collect(),
                });
            }
            c if c.is_whitespace() => return None,
            _ => {}
        }
    }
    None
}

/// Roster members whose name or email contains `token`, ignoring case, in
/// roster order.
#[must_use]
pub fn query_candidates<'a>(roster: &'a [Member], token: &str) -> Vec<&'a Member> {
    let needle = token.to_lowercase();
    roster
        .iter()
        .filter(|m| {
            m.name.to_lowercase().contains(&needle) || m.email.to_lowercase().contains(&needle)
        })
        .collect()
}

/// Replace the `@token` at `cursor` with `@<member name> `.
///
/// Returns `None` if there is no trigger at `cursor`.
#[must_use]
pub fn insert_mention(text: &str, cursor: usize, member: &Member) -> Option<MentionInsertion> {
    let trigger = detect_trigger(text, cursor)?;
    let mut out: String = text.chars().take(trigger.start).collect();
    out.push('@');
    out.push_str(&member.name);
    out.push(' ');
    let new_cursor = out.chars().count();
    out.extend(text.chars().skip(cursor));
    Some(MentionInsertion {
        text: out,
        cursor: new_cursor,
    })
}

/// Ids of the roster members mentioned in finalized `text`.
///
/// At each `@` the longest roster name that matches wins, and the name must
/// be followed by a non-word character or the end of the text. The result
/// is de-duplicated and ordered by first occurrence. Members sharing a
/// display name cannot be told apart; the first one in roster order wins.
#[must_use]
pub fn extract_mentioned_user_ids(text: &str, roster: &[Member]) -> Vec<UserId> {
    let mut names: Vec<(Vec<char>, &UserId)> = roster
        .iter()
        .filter(|m| !m.name.is_empty())
        .map(|m| (m.name.chars().collect(), &m.id))
        .collect();
    names.sort_by_key(|(name, _)| std::cmp::Reverse(name.len()));

    let chars: Vec<char> = text.chars().collect();
    let mut found: Vec<UserId> = Vec::new();
    let mut i = 0;
    while i < chars.len() {
        if chars[i] != '@' {
            i += 1;
            continue;
        }
        let rest = &chars[i + 1..];
        let hit = names.iter().find(|(name, _)| {
            rest.starts_with(name) && rest.get(name.len()).is_none_or(|c| !is_word_char(*c))
        });
        match hit {
            Some((name, id)) => {
                if !found.contains(*id) {
                    found.push((*id).clone());
                }
                i += 1 + name.len();
            }
            None => i += 1,
        }
    }
    found
}

fn is_word_char(c: char) -> bool {
    c.is_alphanumeric() || c == '_'
}
