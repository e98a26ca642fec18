//! Chat-text extraction
//!
//! Counterparties write free-form messages; these helpers pull out the two
//! things the engine cares about: which actions they want traded, and the
//! target reference (URL or handle) to act on.

use std::collections::BTreeSet;

use once_cell::sync::Lazy;
use quidpro_types::ActionKind;
use regex::Regex;

/// Compiled patterns - avoid recompiling on every message
static URL_PATTERN: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"https?://[^\s<>]+").expect("url pattern"));
static HANDLE_PATTERN: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"@[A-Za-z0-9_.]{3,64}").expect("handle pattern"));
static SWAP_SHORTHAND: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)\b([a-z]+)\s*(?:4|x)\s*([a-z]+)\b").expect("swap pattern"));
static WORD_PATTERN: Lazy<Regex> = Lazy::new(|| Regex::new(r"[A-Za-z]+").expect("word pattern"));

/// Pull a target reference out of a message: a URL first, else an @handle.
pub fn extract_target(text: &str) -> Option<String> {
    if let Some(m) = URL_PATTERN.find(text) {
        return Some(m.as_str().trim_end_matches([',', '.', ')', ']']).to_string());
    }
    HANDLE_PATTERN.find(text).map(|m| m.as_str().to_string())
}

/// Collect every action keyword named in a message, including shorthand
/// forms like "like4like" and "sub x sub".
pub fn extract_actions(text: &str) -> BTreeSet<ActionKind> {
    let mut actions = BTreeSet::new();
    for caps in SWAP_SHORTHAND.captures_iter(text) {
        for idx in 1..=2 {
            if let Some(kind) = caps.get(idx).and_then(|m| ActionKind::from_keyword(m.as_str())) {
                actions.insert(kind);
            }
        }
    }
    for word in WORD_PATTERN.find_iter(text) {
        if let Some(kind) = ActionKind::from_keyword(word.as_str()) {
            actions.insert(kind);
        }
    }
    actions
}

/// Whether a first message reads as an exchange proposal at all.
///
/// Qualifying shapes: swap shorthand ("like4like"), or an action keyword
/// next to trade vocabulary ("sub for sub?", "wanna exchange likes?").
pub fn is_exchange_greeting(text: &str) -> bool {
    if SWAP_SHORTHAND
        .captures_iter(text)
        .any(|caps| (1..=2).any(|i| caps.get(i).and_then(|m| ActionKind::from_keyword(m.as_str())).is_some()))
    {
        return true;
    }
    let lower = text.to_ascii_lowercase();
    let trade_words = ["exchange", "swap", "trade", "for", "back", "mutual"];
    !extract_actions(text).is_empty() && trade_words.iter().any(|w| lower.contains(w))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_url_target() {
        let target = extract_target("here you go https://videos.example/watch?v=abc123, thanks!");
        assert_eq!(target.as_deref(), Some("https://videos.example/watch?v=abc123"));
    }

    #[test]
    fn test_handle_target() {
        let target = extract_target("my channel is @creator_jane");
        assert_eq!(target.as_deref(), Some("@creator_jane"));
    }

    #[test]
    fn test_url_preferred_over_handle() {
        let target = extract_target("@me or https://videos.example/c/me");
        assert_eq!(target.as_deref(), Some("https://videos.example/c/me"));
    }

    #[test]
    fn test_no_target_in_chatter() {
        assert_eq!(extract_target("sure, one sec"), None);
    }

    #[test]
    fn test_shorthand_actions() {
        let actions = extract_actions("like4like and sub4sub?");
        assert!(actions.contains(&ActionKind::Like));
        assert!(actions.contains(&ActionKind::Subscribe));
    }

    #[test]
    fn test_plain_keyword_actions() {
        let actions = extract_actions("I'll comment and share if you do the same");
        assert!(actions.contains(&ActionKind::Comment));
        assert!(actions.contains(&ActionKind::Share));
    }

    #[test]
    fn test_exchange_greeting_detection() {
        assert!(is_exchange_greeting("like4like, here's my channel"));
        assert!(is_exchange_greeting("wanna trade subs?"));
        assert!(is_exchange_greeting("comment for comment"));
        assert!(!is_exchange_greeting("hey, how are you?"));
        assert!(!is_exchange_greeting("I liked your profile picture"));
    }
}
