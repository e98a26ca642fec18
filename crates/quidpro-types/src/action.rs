//! The exchange action vocabulary
//!
//! Every negotiation is an offer to trade some subset of these actions on a
//! piece of third-party content.

use serde::{Deserialize, Serialize};
use std::fmt;

/// An engagement action either side of an exchange can perform.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActionKind {
    Like,
    Comment,
    Subscribe,
    Share,
}

impl ActionKind {
    /// All action kinds, in canonical order.
    pub fn all() -> [ActionKind; 4] {
        [Self::Like, Self::Comment, Self::Subscribe, Self::Share]
    }

    /// Recognize an action keyword from chat vocabulary.
    ///
    /// Counterparties write things like "like4like", "sub for sub" or
    /// "comment pls"; each keyword maps to at most one kind.
    pub fn from_keyword(word: &str) -> Option<Self> {
        match word.to_ascii_lowercase().as_str() {
            "like" | "likes" => Some(Self::Like),
            "comment" | "comments" => Some(Self::Comment),
            "sub" | "subs" | "subscribe" | "follow" => Some(Self::Subscribe),
            "share" | "shares" | "repost" => Some(Self::Share),
            _ => None,
        }
    }
}

impl fmt::Display for ActionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Like => "like",
            Self::Comment => "comment",
            Self::Subscribe => "subscribe",
            Self::Share => "share",
        };
        write!(f, "{}", s)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_keyword_recognition() {
        assert_eq!(ActionKind::from_keyword("like"), Some(ActionKind::Like));
        assert_eq!(ActionKind::from_keyword("SUB"), Some(ActionKind::Subscribe));
        assert_eq!(ActionKind::from_keyword("follow"), Some(ActionKind::Subscribe));
        assert_eq!(ActionKind::from_keyword("repost"), Some(ActionKind::Share));
        assert_eq!(ActionKind::from_keyword("hello"), None);
    }

    #[test]
    fn test_display_roundtrip() {
        for kind in ActionKind::all() {
            assert_eq!(ActionKind::from_keyword(&kind.to_string()), Some(kind));
        }
    }
}
