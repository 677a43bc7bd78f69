use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

use reef_core::types::LeanCitation;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MemberType {
    Human,
    Ai,
}

impl fmt::Display for MemberType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MemberType::Human => write!(f, "human"),
            MemberType::Ai => write!(f, "ai"),
        }
    }
}

impl std::str::FromStr for MemberType {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "human" => Ok(MemberType::Human),
            "ai" => Ok(MemberType::Ai),
            other => Err(format!("unknown member type: {}", other)),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum Presence {
    Online,
    Idle,
    #[default]
    Offline,
}

impl fmt::Display for Presence {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Presence::Online => write!(f, "online"),
            Presence::Idle => write!(f, "idle"),
            Presence::Offline => write!(f, "offline"),
        }
    }
}

impl std::str::FromStr for Presence {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "online" => Ok(Presence::Online),
            "idle" => Ok(Presence::Idle),
            "offline" => Ok(Presence::Offline),
            other => Err(format!("unknown presence: {}", other)),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum GroupRole {
    Owner,
    Admin,
    #[default]
    Member,
}

impl fmt::Display for GroupRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            GroupRole::Owner => write!(f, "owner"),
            GroupRole::Admin => write!(f, "admin"),
            GroupRole::Member => write!(f, "member"),
        }
    }
}

impl std::str::FromStr for GroupRole {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "owner" => Ok(GroupRole::Owner),
            "admin" => Ok(GroupRole::Admin),
            "member" => Ok(GroupRole::Member),
            other => Err(format!("unknown role: {}", other)),
        }
    }
}

/// Per-AI behaviour knobs carried on the group member record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AiBehaviorConfig {
    #[serde(default = "default_true")]
    pub auto_reply_enabled: bool,
    #[serde(default = "default_base_probability")]
    pub base_reply_probability: f64,
    #[serde(default)]
    pub interest_keywords: Vec<String>,
    #[serde(default = "default_interest_boost")]
    pub interest_boost: f64,
    #[serde(default = "default_mention_probability")]
    pub mention_reply_probability: f64,
    #[serde(default = "default_max_consecutive")]
    pub max_consecutive_replies: u32,
    /// Seconds after a reply during which the AI is reluctant to speak.
    #[serde(default = "default_cooldown_after_reply")]
    pub cooldown_after_reply: f64,
    /// How many recent messages the AI sees when building its context.
    #[serde(default = "default_context_window")]
    pub context_window_size: usize,
    #[serde(default)]
    pub random_wake_enabled: bool,
    #[serde(default = "default_random_wake_probability")]
    pub random_wake_probability: f64,
    /// Random-wake check interval in seconds.
    #[serde(default = "default_random_wake_interval")]
    pub random_wake_interval: u64,
}

impl Default for AiBehaviorConfig {
    fn default() -> Self {
        Self {
            auto_reply_enabled: true,
            base_reply_probability: default_base_probability(),
            interest_keywords: Vec::new(),
            interest_boost: default_interest_boost(),
            mention_reply_probability: default_mention_probability(),
            max_consecutive_replies: default_max_consecutive(),
            cooldown_after_reply: default_cooldown_after_reply(),
            context_window_size: default_context_window(),
            random_wake_enabled: false,
            random_wake_probability: default_random_wake_probability(),
            random_wake_interval: default_random_wake_interval(),
        }
    }
}

fn default_true() -> bool {
    true
}
fn default_base_probability() -> f64 {
    0.3
}
fn default_interest_boost() -> f64 {
    0.4
}
fn default_mention_probability() -> f64 {
    0.9
}
fn default_max_consecutive() -> u32 {
    2
}
fn default_cooldown_after_reply() -> f64 {
    10.0
}
fn default_context_window() -> usize {
    20
}
fn default_random_wake_probability() -> f64 {
    0.05
}
fn default_random_wake_interval() -> u64 {
    300
}

/// A group member: human, or an AI persona backed by a session that owns
/// its model settings and system prompt.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GroupMember {
    pub member_id: String,
    pub group_id: String,
    pub display_name: String,
    pub member_type: MemberType,
    pub role: GroupRole,
    pub presence: Presence,
    /// Session backing this AI persona; `None` for humans.
    pub ai_session_id: Option<String>,
    pub behavior: Option<AiBehaviorConfig>,
    pub consecutive_reply_count: u32,
    pub last_reply_at: Option<DateTime<Utc>>,
    pub joined_at: DateTime<Utc>,
}

impl GroupMember {
    pub fn is_ai(&self) -> bool {
        self.member_type == MemberType::Ai
    }

    pub fn is_online(&self) -> bool {
        self.presence == Presence::Online
    }
}

/// A message inside a group.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GroupMessage {
    pub message_id: String,
    pub group_id: String,
    pub sender_id: String,
    pub sender_type: MemberType,
    pub sender_name: String,
    pub msg_type: String,
    pub content: String,
    #[serde(default)]
    pub images: Vec<String>,
    #[serde(default)]
    pub mentions: Vec<String>,
    pub reply_to: Option<String>,
    #[serde(default)]
    pub read_by: Vec<String>,
    pub ai_session_id: Option<String>,
    #[serde(default)]
    pub references: Vec<LeanCitation>,
    pub timestamp: DateTime<Utc>,
}

impl GroupMessage {
    pub fn mentions_member(&self, member: &GroupMember) -> bool {
        self.mentions.iter().any(|m| {
            m == &member.member_id
                || member
                    .ai_session_id
                    .as_deref()
                    .is_some_and(|sid| m.as_str() == sid)
        })
    }
}

/// All rate/quota/scheduling strategy for one group.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GroupStrategyConfig {
    /// Raises every gate to its effective maximum; demo/testing only.
    #[serde(default)]
    pub unrestricted_mode: bool,

    // Round limits (conversation controller).
    #[serde(default = "d_max_ai_consecutive")]
    pub max_ai_consecutive_replies: u32,
    #[serde(default = "d_max_messages_per_round")]
    pub max_messages_per_round: u32,
    #[serde(default = "d_max_tokens_per_round")]
    pub max_tokens_per_round: u64,
    #[serde(default = "d_cooldown_seconds")]
    pub cooldown_seconds: u64,
    #[serde(default = "d_max_cooldown_recoveries")]
    pub max_cooldown_recoveries: u32,
    #[serde(default = "default_true")]
    pub enable_ai_to_ai: bool,
    #[serde(default = "d_ai_reply_probability")]
    pub ai_reply_probability: f64,

    // Probability sampling tiers.
    #[serde(default = "d_high_threshold")]
    pub high_probability_threshold: f64,
    #[serde(default = "d_high_keep_rate")]
    pub high_probability_keep_rate: f64,
    #[serde(default = "d_mid_threshold")]
    pub mid_probability_threshold: f64,
    #[serde(default = "d_low_keep_rate")]
    pub low_probability_keep_rate: f64,
    /// Candidate counts at or below this skip sampling entirely.
    #[serde(default = "d_min_sample_count")]
    pub min_ai_sample_count: usize,

    // Activity-tiered concurrency.
    #[serde(default = "d_cold_max")]
    pub cold_group_max_concurrent: usize,
    #[serde(default = "d_cold_gap")]
    pub cold_group_min_delay_gap: f64,
    #[serde(default = "d_warm_max")]
    pub warm_group_max_concurrent: usize,
    #[serde(default = "d_warm_gap")]
    pub warm_group_min_delay_gap: f64,
    #[serde(default = "d_hot_max")]
    pub hot_group_max_concurrent: usize,
    #[serde(default = "d_hot_gap")]
    pub hot_group_min_delay_gap: f64,

    // Trigger-type concurrency.
    #[serde(default = "d_human_max")]
    pub human_message_max_concurrent: usize,
    #[serde(default = "d_ai_max")]
    pub ai_message_max_concurrent: usize,
    #[serde(default = "d_mention_max")]
    pub at_mention_max_concurrent: usize,

    // Consecutive-AI probability decay.
    #[serde(default = "d_consec0")]
    pub ai_consecutive_0_multiplier: f64,
    #[serde(default = "d_consec1")]
    pub ai_consecutive_1_multiplier: f64,
    #[serde(default = "d_consec2")]
    pub ai_consecutive_2_multiplier: f64,
    #[serde(default = "d_consec3")]
    pub ai_consecutive_3_multiplier: f64,

    #[serde(default = "d_dense_multiplier")]
    pub dense_ai_multiplier: f64,

    // Anti-stampede.
    #[serde(default = "d_max_replies_per_message")]
    pub max_concurrent_replies_per_message: usize,

    // Similarity detection.
    #[serde(default = "default_true")]
    pub enable_similarity_detection: bool,
    #[serde(default = "d_similarity_threshold")]
    pub similarity_threshold: f64,
    #[serde(default = "d_similarity_lookback")]
    pub similarity_lookback: usize,

    // Delay ranges (seconds).
    #[serde(default = "d_mention_delay_min")]
    pub mention_delay_min: f64,
    #[serde(default = "d_mention_delay_max")]
    pub mention_delay_max: f64,
    #[serde(default = "d_high_delay_min")]
    pub high_interest_delay_min: f64,
    #[serde(default = "d_high_delay_max")]
    pub high_interest_delay_max: f64,
    #[serde(default = "d_normal_delay_min")]
    pub normal_delay_min: f64,
    #[serde(default = "d_normal_delay_max")]
    pub normal_delay_max: f64,
    #[serde(default = "d_ai_to_ai_delay")]
    pub ai_to_ai_delay_seconds: f64,
}

impl Default for GroupStrategyConfig {
    fn default() -> Self {
        Self {
            unrestricted_mode: false,
            max_ai_consecutive_replies: d_max_ai_consecutive(),
            max_messages_per_round: d_max_messages_per_round(),
            max_tokens_per_round: d_max_tokens_per_round(),
            cooldown_seconds: d_cooldown_seconds(),
            max_cooldown_recoveries: d_max_cooldown_recoveries(),
            enable_ai_to_ai: true,
            ai_reply_probability: d_ai_reply_probability(),
            high_probability_threshold: d_high_threshold(),
            high_probability_keep_rate: d_high_keep_rate(),
            mid_probability_threshold: d_mid_threshold(),
            low_probability_keep_rate: d_low_keep_rate(),
            min_ai_sample_count: d_min_sample_count(),
            cold_group_max_concurrent: d_cold_max(),
            cold_group_min_delay_gap: d_cold_gap(),
            warm_group_max_concurrent: d_warm_max(),
            warm_group_min_delay_gap: d_warm_gap(),
            hot_group_max_concurrent: d_hot_max(),
            hot_group_min_delay_gap: d_hot_gap(),
            human_message_max_concurrent: d_human_max(),
            ai_message_max_concurrent: d_ai_max(),
            at_mention_max_concurrent: d_mention_max(),
            ai_consecutive_0_multiplier: d_consec0(),
            ai_consecutive_1_multiplier: d_consec1(),
            ai_consecutive_2_multiplier: d_consec2(),
            ai_consecutive_3_multiplier: d_consec3(),
            dense_ai_multiplier: d_dense_multiplier(),
            max_concurrent_replies_per_message: d_max_replies_per_message(),
            enable_similarity_detection: true,
            similarity_threshold: d_similarity_threshold(),
            similarity_lookback: d_similarity_lookback(),
            mention_delay_min: d_mention_delay_min(),
            mention_delay_max: d_mention_delay_max(),
            high_interest_delay_min: d_high_delay_min(),
            high_interest_delay_max: d_high_delay_max(),
            normal_delay_min: d_normal_delay_min(),
            normal_delay_max: d_normal_delay_max(),
            ai_to_ai_delay_seconds: d_ai_to_ai_delay(),
        }
    }
}

impl GroupStrategyConfig {
    /// The effective config with every gate raised. Delays keep a small
    /// floor so bursts are spread over a beat instead of landing at once.
    pub fn effective(&self) -> GroupStrategyConfig {
        if !self.unrestricted_mode {
            return self.clone();
        }
        GroupStrategyConfig {
            unrestricted_mode: true,
            max_ai_consecutive_replies: 9999,
            max_messages_per_round: 9999,
            max_tokens_per_round: 999_999,
            cooldown_seconds: 0,
            max_cooldown_recoveries: 9999,
            enable_ai_to_ai: true,
            ai_reply_probability: 1.0,
            high_probability_threshold: 0.0,
            high_probability_keep_rate: 1.0,
            mid_probability_threshold: 0.0,
            low_probability_keep_rate: 1.0,
            min_ai_sample_count: 999,
            cold_group_max_concurrent: 999,
            cold_group_min_delay_gap: 0.1,
            warm_group_max_concurrent: 999,
            warm_group_min_delay_gap: 0.1,
            hot_group_max_concurrent: 999,
            hot_group_min_delay_gap: 0.1,
            human_message_max_concurrent: 999,
            ai_message_max_concurrent: 999,
            at_mention_max_concurrent: 999,
            ai_consecutive_0_multiplier: 1.0,
            ai_consecutive_1_multiplier: 1.0,
            ai_consecutive_2_multiplier: 1.0,
            ai_consecutive_3_multiplier: 1.0,
            dense_ai_multiplier: 1.0,
            max_concurrent_replies_per_message: 999,
            enable_similarity_detection: false,
            similarity_threshold: 0.0,
            similarity_lookback: 0,
            mention_delay_min: 0.1,
            mention_delay_max: 0.5,
            high_interest_delay_min: 0.1,
            high_interest_delay_max: 0.5,
            normal_delay_min: 0.1,
            normal_delay_max: 0.5,
            ai_to_ai_delay_seconds: 0.5,
        }
    }

    pub fn consecutive_multiplier(&self, count: u32) -> f64 {
        match count {
            0 => self.ai_consecutive_0_multiplier,
            1 => self.ai_consecutive_1_multiplier,
            2 => self.ai_consecutive_2_multiplier,
            _ => self.ai_consecutive_3_multiplier,
        }
    }
}

fn d_max_ai_consecutive() -> u32 {
    3
}
fn d_max_messages_per_round() -> u32 {
    20
}
fn d_max_tokens_per_round() -> u64 {
    50_000
}
fn d_cooldown_seconds() -> u64 {
    30
}
fn d_max_cooldown_recoveries() -> u32 {
    3
}
fn d_ai_reply_probability() -> f64 {
    0.6
}
fn d_high_threshold() -> f64 {
    0.7
}
fn d_high_keep_rate() -> f64 {
    0.8
}
fn d_mid_threshold() -> f64 {
    0.3
}
fn d_low_keep_rate() -> f64 {
    0.3
}
fn d_min_sample_count() -> usize {
    3
}
fn d_cold_max() -> usize {
    1
}
fn d_cold_gap() -> f64 {
    5.0
}
fn d_warm_max() -> usize {
    2
}
fn d_warm_gap() -> f64 {
    3.0
}
fn d_hot_max() -> usize {
    3
}
fn d_hot_gap() -> f64 {
    2.0
}
fn d_human_max() -> usize {
    3
}
fn d_ai_max() -> usize {
    2
}
fn d_mention_max() -> usize {
    1
}
fn d_consec0() -> f64 {
    1.0
}
fn d_consec1() -> f64 {
    0.8
}
fn d_consec2() -> f64 {
    0.5
}
fn d_consec3() -> f64 {
    0.2
}
fn d_dense_multiplier() -> f64 {
    0.5
}
fn d_max_replies_per_message() -> usize {
    3
}
fn d_similarity_threshold() -> f64 {
    0.6
}
fn d_similarity_lookback() -> usize {
    3
}
fn d_mention_delay_min() -> f64 {
    0.5
}
fn d_mention_delay_max() -> f64 {
    2.0
}
fn d_high_delay_min() -> f64 {
    1.0
}
fn d_high_delay_max() -> f64 {
    3.0
}
fn d_normal_delay_min() -> f64 {
    2.0
}
fn d_normal_delay_max() -> f64 {
    5.0
}
fn d_ai_to_ai_delay() -> f64 {
    7.0
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_contract() {
        let cfg = GroupStrategyConfig::default();
        assert_eq!(cfg.max_ai_consecutive_replies, 3);
        assert_eq!(cfg.cold_group_max_concurrent, 1);
        assert_eq!(cfg.cold_group_min_delay_gap, 5.0);
        assert_eq!(cfg.at_mention_max_concurrent, 1);
        assert_eq!(cfg.consecutive_multiplier(0), 1.0);
        assert_eq!(cfg.consecutive_multiplier(2), 0.5);
        assert_eq!(cfg.consecutive_multiplier(7), 0.2);
        assert_eq!(cfg.similarity_threshold, 0.6);
    }

    #[test]
    fn unrestricted_raises_gates_but_keeps_a_delay_floor() {
        let cfg = GroupStrategyConfig {
            unrestricted_mode: true,
            ..Default::default()
        };
        let eff = cfg.effective();
        assert_eq!(eff.max_ai_consecutive_replies, 9999);
        assert_eq!(eff.cooldown_seconds, 0);
        assert!(!eff.enable_similarity_detection);
        assert!(eff.normal_delay_min > 0.0);
        assert!(eff.ai_to_ai_delay_seconds > 0.0);
    }

    #[test]
    fn restricted_effective_is_identity() {
        let cfg = GroupStrategyConfig::default();
        assert_eq!(cfg.effective(), cfg);
    }

    #[test]
    fn mentions_match_member_or_backing_session() {
        let member = GroupMember {
            member_id: "m1".into(),
            group_id: "g".into(),
            display_name: "Echo".into(),
            member_type: MemberType::Ai,
            role: GroupRole::Member,
            presence: Presence::Online,
            ai_session_id: Some("s9".into()),
            behavior: Some(AiBehaviorConfig::default()),
            consecutive_reply_count: 0,
            last_reply_at: None,
            joined_at: Utc::now(),
        };
        let mut msg = GroupMessage {
            message_id: "x".into(),
            group_id: "g".into(),
            sender_id: "h1".into(),
            sender_type: MemberType::Human,
            sender_name: "Al".into(),
            msg_type: "text".into(),
            content: "hi".into(),
            images: vec![],
            mentions: vec!["s9".into()],
            reply_to: None,
            read_by: vec![],
            ai_session_id: None,
            references: vec![],
            timestamp: Utc::now(),
        };
        assert!(msg.mentions_member(&member));
        msg.mentions = vec!["other".into()];
        assert!(!msg.mentions_member(&member));
    }
}
