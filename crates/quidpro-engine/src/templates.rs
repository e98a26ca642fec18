//! Outbound message templates
//!
//! All counterparty-facing text lives here so the machine stays testable
//! against stable strings.

use std::collections::BTreeSet;

use quidpro_types::ActionKind;

fn action_list(actions: &BTreeSet<ActionKind>) -> String {
    actions
        .iter()
        .map(|a| a.to_string())
        .collect::<Vec<_>>()
        .join(" + ")
}

/// Exchange proposal sent on first contact.
pub fn proposal(actions: &BTreeSet<ActionKind>) -> String {
    format!(
        "Deal! {} both ways. Send me the link (or @handle) you want me to hit \
         and do my content first - screenshot as proof.",
        action_list(actions)
    )
}

/// Follow-up when the counterparty still hasn't supplied a usable target.
pub fn nudge(attempt: u32, max_attempts: u32) -> String {
    format!(
        "Still need the link or @handle to your content before we can start \
         ({}/{} reminders).",
        attempt, max_attempts
    )
}

/// Instructions once the target is known.
pub fn proof_instructions(target: &str) -> String {
    format!(
        "Got it: {}. Now do your side on my content and send a screenshot \
         showing it - I'll verify and return the favor right away.",
        target
    )
}

/// Reminder when a text message arrives while we wait for the proof image.
pub fn proof_reminder() -> String {
    "Waiting on your screenshot - send it as an image and I'll verify.".to_string()
}

/// Re-request after an unverified proof.
pub fn proof_retry(attempt: u32, max_attempts: u32) -> String {
    format!(
        "That screenshot didn't check out ({}/{} tries). Make sure it shows \
         the actions on my content and send a fresh one.",
        attempt, max_attempts
    )
}

/// Success message once the reward is owed.
pub fn success(actions: &BTreeSet<ActionKind>) -> String {
    format!(
        "Verified! Sending {} your way now. Pleasure doing business.",
        action_list(actions)
    )
}

/// Closing message when attempts run out.
pub fn closing() -> String {
    "No luck this time - closing this exchange. Feel free to start a new one \
     when you're ready."
        .to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_proposal_names_every_action() {
        let actions = BTreeSet::from([ActionKind::Like, ActionKind::Comment]);
        let text = proposal(&actions);
        assert!(text.contains("like"));
        assert!(text.contains("comment"));
    }

    #[test]
    fn test_proof_instructions_echo_target() {
        let text = proof_instructions("https://videos.example/v/42");
        assert!(text.contains("https://videos.example/v/42"));
    }
}
