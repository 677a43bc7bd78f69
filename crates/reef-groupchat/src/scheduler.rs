//! Tiered reply scheduling: situation analysis (activity, trigger type,
//! consecutive-AI decay, AI density), probability sampling, a realism pass,
//! mentioned-first selection under the concurrency cap, and staggered delay
//! tiers so later AIs can see earlier replies.

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use rand::Rng;
use tracing::{debug, info};

use crate::filters::ReplyCandidate;
use crate::types::{GroupMember, GroupMessage, GroupStrategyConfig, MemberType};

/// Activity window for the last-5-minutes message count.
const ACTIVITY_WINDOW_SECS: i64 = 300;
/// Recent messages inspected for activity and density.
const RECENT_WINDOW: usize = 10;
const DENSITY_WINDOW: usize = 5;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ActivityLevel {
    Cold,
    Warm,
    Hot,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TriggerType {
    Human,
    AtMention,
    AiMessage,
}

/// Composite of the four analysis dimensions.
#[derive(Debug, Clone)]
pub struct Situation {
    pub activity: ActivityLevel,
    pub trigger: TriggerType,
    pub max_concurrent: usize,
    pub min_delay_gap: f64,
    pub probability_multiplier: f64,
}

/// A candidate that made it through selection, with its firing schedule.
#[derive(Debug, Clone)]
pub struct ScheduledReply {
    pub member_id: String,
    pub ai_session_id: Option<String>,
    pub score: f64,
    pub mentioned: bool,
    pub tier: usize,
    pub delay_seconds: f64,
}

pub struct IntelligentScheduler;

impl IntelligentScheduler {
    /// Analyse the group's current situation.
    pub fn analyze(
        message: &GroupMessage,
        recent: &[GroupMessage],
        ai_consecutive_count: u32,
        cfg: &GroupStrategyConfig,
        now: DateTime<Utc>,
    ) -> Situation {
        let window = &recent[recent.len().saturating_sub(RECENT_WINDOW)..];
        let recent_5min = window
            .iter()
            .filter(|m| now - m.timestamp < ChronoDuration::seconds(ACTIVITY_WINDOW_SECS))
            .count();
        let (activity, activity_max, gap) = if recent_5min < 3 {
            (ActivityLevel::Cold, cfg.cold_group_max_concurrent, cfg.cold_group_min_delay_gap)
        } else if recent_5min < 10 {
            (ActivityLevel::Warm, cfg.warm_group_max_concurrent, cfg.warm_group_min_delay_gap)
        } else {
            (ActivityLevel::Hot, cfg.hot_group_max_concurrent, cfg.hot_group_min_delay_gap)
        };

        let (trigger, trigger_max) = if message.sender_type != MemberType::Ai {
            (TriggerType::Human, cfg.human_message_max_concurrent)
        } else if !message.mentions.is_empty() || message.content.contains('@') {
            (TriggerType::AtMention, cfg.at_mention_max_concurrent)
        } else {
            (TriggerType::AiMessage, cfg.ai_message_max_concurrent)
        };

        let consecutive_multiplier = cfg.consecutive_multiplier(ai_consecutive_count);

        let density_window = &window[window.len().saturating_sub(DENSITY_WINDOW)..];
        let ai_count = density_window
            .iter()
            .filter(|m| m.sender_type == MemberType::Ai)
            .count();
        let density_multiplier = if ai_count > 3 { cfg.dense_ai_multiplier } else { 1.0 };

        let situation = Situation {
            activity,
            trigger,
            max_concurrent: activity_max.min(trigger_max),
            min_delay_gap: gap,
            probability_multiplier: consecutive_multiplier * density_multiplier,
        };
        debug!(
            ?situation.activity,
            ?situation.trigger,
            max_concurrent = situation.max_concurrent,
            multiplier = situation.probability_multiplier,
            "situation analysed"
        );
        situation
    }

    /// Keep-rate sampling over the candidate tiers. Mentioned candidates
    /// always survive; small candidate sets bypass sampling; an otherwise
    /// empty result keeps the single best candidate as a fallback.
    pub fn sample<R: Rng>(
        candidates: Vec<ReplyCandidate>,
        cfg: &GroupStrategyConfig,
        rng: &mut R,
    ) -> Vec<ReplyCandidate> {
        if candidates.len() <= cfg.min_ai_sample_count {
            return candidates;
        }

        let mut kept = Vec::new();
        let mut rest = Vec::new();
        for candidate in candidates {
            if candidate.mentioned {
                kept.push(candidate);
            } else {
                rest.push(candidate);
            }
        }

        let mut best_dropped: Option<ReplyCandidate> = None;
        for candidate in rest {
            let keep_probability = if candidate.score >= cfg.high_probability_threshold {
                cfg.high_probability_keep_rate
            } else if candidate.score >= cfg.mid_probability_threshold {
                candidate.score
            } else {
                cfg.low_probability_keep_rate
            };
            if rng.gen::<f64>() < keep_probability {
                kept.push(candidate);
            } else if best_dropped
                .as_ref()
                .map_or(true, |b| candidate.score > b.score)
            {
                best_dropped = Some(candidate);
            }
        }

        if kept.is_empty() {
            if let Some(best) = best_dropped {
                kept.push(best);
            }
        }
        kept
    }

    /// Apply the situation multiplier and the realism pass, select under
    /// the concurrency cap (mentioned AIs bypass it), and assign tiered
    /// delays.
    pub fn optimize<R: Rng>(
        mut candidates: Vec<ReplyCandidate>,
        situation: &Situation,
        members: &[GroupMember],
        cfg: &GroupStrategyConfig,
        now: DateTime<Utc>,
        rng: &mut R,
    ) -> Vec<ScheduledReply> {
        if candidates.is_empty() {
            return Vec::new();
        }

        for candidate in &mut candidates {
            candidate.score *= situation.probability_multiplier;
            if let Some(member) = members.iter().find(|m| m.member_id == candidate.member_id) {
                apply_realism(candidate, member, now);
            }
        }

        let mut mentioned: Vec<ReplyCandidate> = Vec::new();
        let mut normal: Vec<ReplyCandidate> = Vec::new();
        for candidate in candidates {
            if candidate.mentioned {
                mentioned.push(candidate);
            } else {
                normal.push(candidate);
            }
        }
        mentioned.sort_by(|a, b| b.score.total_cmp(&a.score));
        normal.sort_by(|a, b| b.score.total_cmp(&a.score));

        // Mentioned AIs all reply; the remaining slots go to the best of
        // the rest.
        let remaining = situation.max_concurrent.saturating_sub(mentioned.len());
        let mut selected = mentioned;
        selected.extend(normal.into_iter().take(remaining));

        let scheduled = Self::tier_delays(selected, situation.min_delay_gap, cfg, rng);
        info!(
            selected = scheduled.len(),
            max_concurrent = situation.max_concurrent,
            "reply schedule built"
        );
        scheduled
    }

    /// The first AI gets a base delay from its tier's range; each later AI
    /// fires `min_delay_gap` after the previous one so it can read what was
    /// said before it speaks.
    fn tier_delays<R: Rng>(
        selected: Vec<ReplyCandidate>,
        min_gap: f64,
        cfg: &GroupStrategyConfig,
        rng: &mut R,
    ) -> Vec<ScheduledReply> {
        let mut out: Vec<ScheduledReply> = Vec::with_capacity(selected.len());
        for (i, candidate) in selected.into_iter().enumerate() {
            let delay_seconds = if i == 0 {
                base_delay(&candidate, cfg, rng)
            } else {
                out[i - 1].delay_seconds + min_gap
            };
            out.push(ScheduledReply {
                member_id: candidate.member_id,
                ai_session_id: candidate.ai_session_id,
                score: candidate.score,
                mentioned: candidate.mentioned,
                tier: i + 1,
                delay_seconds,
            });
        }
        out
    }
}

fn base_delay<R: Rng>(candidate: &ReplyCandidate, cfg: &GroupStrategyConfig, rng: &mut R) -> f64 {
    let (min, max) = if candidate.mentioned {
        (cfg.mention_delay_min, cfg.mention_delay_max)
    } else if candidate.score >= 0.7 {
        (cfg.high_interest_delay_min, cfg.high_interest_delay_max)
    } else {
        (cfg.normal_delay_min, cfg.normal_delay_max)
    };
    if max <= min {
        min
    } else {
        rng.gen_range(min..max)
    }
}

#[derive(Debug, Clone, Copy)]
enum Personality {
    Active,
    Balanced,
    Cautious,
}

impl Personality {
    fn of(member_id: &str) -> Self {
        match stable_hash(member_id) % 100 {
            0..=29 => Personality::Active,
            30..=59 => Personality::Balanced,
            _ => Personality::Cautious,
        }
    }

    fn boost(self) -> f64 {
        match self {
            Personality::Active => 1.2,
            Personality::Balanced => 1.0,
            Personality::Cautious => 0.8,
        }
    }

    fn min_interval_secs(self) -> f64 {
        match self {
            Personality::Active => 1.0,
            Personality::Balanced => 2.0,
            Personality::Cautious => 3.0,
        }
    }
}

/// Each AI gets a stable personality bucket; replying again too quickly is
/// penalised so the cast doesn't machine-gun the group.
fn apply_realism(candidate: &mut ReplyCandidate, member: &GroupMember, now: DateTime<Utc>) {
    let personality = Personality::of(&candidate.member_id);
    candidate.score *= personality.boost();

    if let Some(last) = member.last_reply_at {
        let since = (now - last).num_milliseconds() as f64 / 1000.0;
        if since < personality.min_interval_secs() {
            candidate.score *= 0.5;
        }
    }
}

fn stable_hash(s: &str) -> u64 {
    let mut hash: u64 = 0xcbf29ce484222325;
    for b in s.bytes() {
        hash ^= b as u64;
        hash = hash.wrapping_mul(0x100000001b3);
    }
    hash
}
