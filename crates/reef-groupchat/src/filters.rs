//! Candidate generation: the per-AI filter chain and probability
//! composition run against every online AI member for each incoming
//! message. Hard filters eliminate; soft filters only shape the score.

use chrono::{DateTime, Utc};
use tracing::debug;

use crate::types::{GroupMember, GroupMessage, MemberType};

/// Window of recent messages inspected for mention-frequency boosts.
const MENTION_LOOKBACK: usize = 10;

/// An AI that may reply, with its composed probability score.
#[derive(Debug, Clone)]
pub struct ReplyCandidate {
    pub member_id: String,
    pub ai_session_id: Option<String>,
    pub score: f64,
    /// Mentioned in the triggering message, or twice or more recently.
    pub mentioned: bool,
    pub reason: String,
}

/// Evaluates the fixed filter order: online status, self-message, cooldown,
/// consecutive-reply, mention, keyword.
pub struct FilterChain;

impl FilterChain {
    /// Returns a candidate for every AI whose composed probability is > 0.
    pub fn evaluate(
        message: &GroupMessage,
        ai_members: &[GroupMember],
        recent_messages: &[GroupMessage],
        now: DateTime<Utc>,
    ) -> Vec<ReplyCandidate> {
        let mut candidates = Vec::new();
        for member in ai_members {
            if let Some(candidate) = Self::evaluate_one(message, member, recent_messages, now) {
                debug!(
                    member_id = %candidate.member_id,
                    score = candidate.score,
                    reason = %candidate.reason,
                    "reply candidate"
                );
                candidates.push(candidate);
            }
        }
        candidates
    }

    fn evaluate_one(
        message: &GroupMessage,
        member: &GroupMember,
        recent_messages: &[GroupMessage],
        now: DateTime<Utc>,
    ) -> Option<ReplyCandidate> {
        // Hard filters.
        if !member.is_online() {
            return None;
        }
        if message.sender_id == member.member_id {
            return None;
        }
        let behavior = member.behavior.as_ref()?;
        if !behavior.auto_reply_enabled {
            return None;
        }

        // Soft-filter facts.
        let in_cooldown = member.last_reply_at.is_some_and(|last| {
            (now - last).num_milliseconds() as f64 / 1000.0 < behavior.cooldown_after_reply
        });
        let consecutive = trailing_replies(member, recent_messages);
        let consecutive_exceeded = consecutive >= behavior.max_consecutive_replies;
        let mentioned_now = message.mentions_member(member);
        let recent_mentions = recent_mention_count(member, recent_messages);
        let keyword = behavior
            .interest_keywords
            .iter()
            .find(|k| message.content.to_lowercase().contains(&k.to_lowercase()));

        // Probability composition.
        let mut prob = behavior.base_reply_probability;
        let mut reasons = vec![format!("base {:.2}", prob)];

        if mentioned_now {
            let boost = behavior.mention_reply_probability - behavior.base_reply_probability;
            prob = (prob + boost).min(1.0);
            reasons.push(format!("mentioned +{:.2}", boost));
        }
        let freq_boost = mention_frequency_boost(recent_mentions);
        if freq_boost > 0.0 {
            prob = (prob + freq_boost).min(1.0);
            reasons.push(format!("{} recent mentions +{:.2}", recent_mentions, freq_boost));
        }
        if let Some(keyword) = keyword {
            prob = (prob + behavior.interest_boost).min(1.0);
            reasons.push(format!("keyword '{}' +{:.2}", keyword, behavior.interest_boost));
        }

        let exempt = mentioned_now || recent_mentions >= 2;
        if exempt {
            if in_cooldown {
                reasons.push("cooldown waived (mentioned)".into());
            }
            if consecutive_exceeded {
                reasons.push("consecutive limit waived (mentioned)".into());
            }
        } else {
            if in_cooldown {
                prob *= 0.1;
                reasons.push("cooldown x0.1".into());
            }
            if consecutive_exceeded {
                prob = 0.0;
                reasons.push(format!(
                    "consecutive limit {}/{}",
                    consecutive, behavior.max_consecutive_replies
                ));
            }
        }

        let prob = prob.clamp(0.0, 1.0);
        if prob <= 0.0 {
            return None;
        }
        Some(ReplyCandidate {
            member_id: member.member_id.clone(),
            ai_session_id: member.ai_session_id.clone(),
            score: prob,
            mentioned: exempt,
            reason: reasons.join(" | "),
        })
    }
}

/// How many of the trailing recent messages this member sent.
fn trailing_replies(member: &GroupMember, recent: &[GroupMessage]) -> u32 {
    recent
        .iter()
        .rev()
        .take_while(|m| m.sender_id == member.member_id)
        .count() as u32
}

fn recent_mention_count(member: &GroupMember, recent: &[GroupMessage]) -> usize {
    recent
        .iter()
        .rev()
        .take(MENTION_LOOKBACK)
        .filter(|m| m.mentions_member(member))
        .count()
}

/// Repeated mentions accumulate: 1 → +0.1, 2 → +0.25, 3 → +0.45, ≥4 → +0.7.
fn mention_frequency_boost(count: usize) -> f64 {
    match count {
        0 => 0.0,
        1 => 0.1,
        2 => 0.25,
        3 => 0.45,
        _ => 0.7,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{AiBehaviorConfig, GroupRole, Presence};

    fn ai(member_id: &str, behavior: AiBehaviorConfig) -> GroupMember {
        GroupMember {
            member_id: member_id.to_string(),
            group_id: "g".into(),
            display_name: member_id.to_string(),
            member_type: MemberType::Ai,
            role: GroupRole::Member,
            presence: Presence::Online,
            ai_session_id: Some(format!("s-{}", member_id)),
            behavior: Some(behavior),
            consecutive_reply_count: 0,
            last_reply_at: None,
            joined_at: Utc::now(),
        }
    }

    fn msg(sender: &str, content: &str, mentions: &[&str]) -> GroupMessage {
        GroupMessage {
            message_id: uuid::Uuid::new_v4().to_string(),
            group_id: "g".into(),
            sender_id: sender.to_string(),
            sender_type: MemberType::Human,
            sender_name: sender.to_string(),
            msg_type: "text".into(),
            content: content.to_string(),
            images: vec![],
            mentions: mentions.iter().map(|m| m.to_string()).collect(),
            reply_to: None,
            read_by: vec![],
            ai_session_id: None,
            references: vec![],
            timestamp: Utc::now(),
        }
    }

    #[test]
    fn offline_and_self_are_hard_filtered() {
        let mut offline = ai("bot", AiBehaviorConfig::default());
        offline.presence = Presence::Offline;
        let m = msg("alice", "hi", &[]);
        assert!(FilterChain::evaluate(&m, &[offline], &[], Utc::now()).is_empty());

        let bot = ai("bot", AiBehaviorConfig::default());
        let own = msg("bot", "my own message", &[]);
        assert!(FilterChain::evaluate(&own, &[bot], &[], Utc::now()).is_empty());
    }

    #[test]
    fn mention_lifts_probability_to_mention_rate() {
        let bot = ai("bot", AiBehaviorConfig::default());
        let m = msg("alice", "ping @bot", &["bot"]);
        let candidates = FilterChain::evaluate(&m, &[bot], &[], Utc::now());
        assert_eq!(candidates.len(), 1);
        assert!(candidates[0].mentioned);
        assert!((candidates[0].score - 0.9).abs() < 1e-9);
    }

    #[test]
    fn keyword_match_adds_interest_boost() {
        let bot = ai(
            "bot",
            AiBehaviorConfig {
                interest_keywords: vec!["rust".into()],
                ..Default::default()
            },
        );
        let m = msg("alice", "anyone tried Rust?", &[]);
        let candidates = FilterChain::evaluate(&m, &[bot], &[], Utc::now());
        assert!((candidates[0].score - 0.7).abs() < 1e-9); // 0.3 base + 0.4 boost
    }

    #[test]
    fn cooldown_penalizes_unless_mentioned() {
        let mut bot = ai("bot", AiBehaviorConfig::default());
        bot.last_reply_at = Some(Utc::now());

        let m = msg("alice", "hi", &[]);
        let candidates = FilterChain::evaluate(&m, std::slice::from_ref(&bot), &[], Utc::now());
        assert!((candidates[0].score - 0.03).abs() < 1e-9); // 0.3 × 0.1

        let mentioned = msg("alice", "hey @bot", &["bot"]);
        let candidates = FilterChain::evaluate(&mentioned, &[bot], &[], Utc::now());
        assert!((candidates[0].score - 0.9).abs() < 1e-9);
    }

    #[test]
    fn consecutive_limit_zeroes_score_unless_mentioned_twice() {
        let bot = ai(
            "bot",
            AiBehaviorConfig {
                max_consecutive_replies: 2,
                ..Default::default()
            },
        );
        let recent = vec![
            msg("alice", "one", &[]),
            msg("bot", "reply a", &[]),
            msg("bot", "reply b", &[]),
        ];

        let m = msg("alice2", "continue", &[]);
        assert!(FilterChain::evaluate(&m, std::slice::from_ref(&bot), &recent, Utc::now()).is_empty());

        // Two recent mentions waive the limit.
        let recent_mentioned = vec![
            msg("alice", "hey @bot", &["bot"]),
            msg("alice", "@bot again", &["bot"]),
            msg("bot", "reply a", &[]),
            msg("bot", "reply b", &[]),
        ];
        let candidates =
            FilterChain::evaluate(&m, &[bot], &recent_mentioned, Utc::now());
        assert_eq!(candidates.len(), 1);
        assert!(candidates[0].mentioned);
    }

    #[test]
    fn mention_frequency_boost_tiers() {
        assert_eq!(mention_frequency_boost(0), 0.0);
        assert_eq!(mention_frequency_boost(1), 0.1);
        assert_eq!(mention_frequency_boost(2), 0.25);
        assert_eq!(mention_frequency_boost(3), 0.45);
        assert_eq!(mention_frequency_boost(9), 0.7);
    }
}
