//! Per-group rate/quorum state machine: consecutive-AI limits, round
//! quotas, token budget, cooldowns with bounded automatic recovery, and
//! manual stop/resume.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::types::{GroupStrategyConfig, MemberType};

/// Ring size for the recent-sender history.
const SENDER_HISTORY: usize = 10;
/// Cooldown applied when the round's token budget is exhausted.
const TOKEN_LIMIT_COOLDOWN_SECS: u64 = 300;

/// The slice of strategy the controller consumes.
#[derive(Debug, Clone)]
pub struct ControllerConfig {
    pub max_ai_consecutive_replies: u32,
    pub max_messages_per_round: u32,
    pub max_tokens_per_round: u64,
    pub cooldown_seconds: u64,
    pub max_cooldown_recoveries: u32,
    pub enable_ai_to_ai: bool,
}

impl From<&GroupStrategyConfig> for ControllerConfig {
    fn from(cfg: &GroupStrategyConfig) -> Self {
        Self {
            max_ai_consecutive_replies: cfg.max_ai_consecutive_replies,
            max_messages_per_round: cfg.max_messages_per_round,
            max_tokens_per_round: cfg.max_tokens_per_round,
            cooldown_seconds: cfg.cooldown_seconds,
            max_cooldown_recoveries: cfg.max_cooldown_recoveries,
            enable_ai_to_ai: cfg.enable_ai_to_ai,
        }
    }
}

/// Per-group conversation state.
#[derive(Debug)]
struct ConversationState {
    recent_senders: VecDeque<MemberType>,
    ai_consecutive_count: u32,
    round_message_count: u32,
    round_estimated_tokens: u64,
    in_cooldown: bool,
    cooldown_until: Option<Instant>,
    cooldown_recovery_count: u32,
    manually_stopped: bool,
}

impl ConversationState {
    fn new() -> Self {
        Self {
            recent_senders: VecDeque::with_capacity(SENDER_HISTORY),
            ai_consecutive_count: 0,
            round_message_count: 0,
            round_estimated_tokens: 0,
            in_cooldown: false,
            cooldown_until: None,
            cooldown_recovery_count: 0,
            manually_stopped: false,
        }
    }
}

/// Snapshot of a group's controller state for status endpoints.
#[derive(Debug, Clone, serde::Serialize)]
pub struct ControllerStatus {
    pub ai_consecutive_count: u32,
    pub round_message_count: u32,
    pub round_estimated_tokens: u64,
    pub in_cooldown: bool,
    pub cooldown_recovery_count: u32,
    pub manually_stopped: bool,
}

/// Why an AI trigger was refused; `Allowed` carries nothing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GateDecision {
    Allowed,
    ManuallyStopped,
    RecoveryBudgetExhausted,
    CoolingDown { remaining_secs: u64 },
    AiToAiDisabled,
}

impl GateDecision {
    pub fn allowed(&self) -> bool {
        *self == GateDecision::Allowed
    }
}

type RecoveryCallback = Arc<dyn Fn(String) + Send + Sync>;

/// The controller proper. The recovery callback is invoked (from a spawned
/// task) when a cooldown window elapses and the group may resume; it is
/// expected to trigger a fresh AI-decision cycle on the group's last
/// message.
pub struct ConversationController {
    states: Arc<Mutex<HashMap<String, ConversationState>>>,
    recovery_callback: Mutex<Option<RecoveryCallback>>,
}

impl Default for ConversationController {
    fn default() -> Self {
        Self::new()
    }
}

impl ConversationController {
    pub fn new() -> Self {
        Self {
            states: Arc::new(Mutex::new(HashMap::new())),
            recovery_callback: Mutex::new(None),
        }
    }

    pub fn set_recovery_callback(&self, callback: RecoveryCallback) {
        *self.recovery_callback.lock().unwrap() = Some(callback);
    }

    /// Record a message into the group's state. A human message resets the
    /// consecutive-AI count, round counters, cooldown, recovery budget, and
    /// any manual stop.
    pub fn track_message(&self, group_id: &str, sender_type: MemberType, estimated_tokens: u64) {
        let mut states = self.states.lock().unwrap();
        let state = states
            .entry(group_id.to_string())
            .or_insert_with(ConversationState::new);

        if state.recent_senders.len() >= SENDER_HISTORY {
            state.recent_senders.pop_front();
        }
        state.recent_senders.push_back(sender_type);
        state.round_estimated_tokens += estimated_tokens;

        match sender_type {
            MemberType::Ai => {
                state.ai_consecutive_count += 1;
                state.round_message_count += 1;
            }
            MemberType::Human => {
                if state.in_cooldown || state.round_message_count > 0 {
                    info!(group_id, "human message; round state reset");
                }
                state.ai_consecutive_count = 0;
                state.round_message_count = 1;
                state.round_estimated_tokens = estimated_tokens;
                state.in_cooldown = false;
                state.cooldown_until = None;
                state.cooldown_recovery_count = 0;
                state.manually_stopped = false;
            }
        }
        debug!(
            group_id,
            ai_consecutive = state.ai_consecutive_count,
            round_messages = state.round_message_count,
            "message tracked"
        );
    }

    /// Gate an AI-triggered decision cycle. Human messages always pass (the
    /// dispatcher calls this only for AI triggers).
    pub fn should_allow_ai_trigger(&self, group_id: &str, cfg: &ControllerConfig) -> GateDecision {
        if !cfg.enable_ai_to_ai {
            return GateDecision::AiToAiDisabled;
        }

        let mut states = self.states.lock().unwrap();
        let state = states
            .entry(group_id.to_string())
            .or_insert_with(ConversationState::new);

        if state.manually_stopped {
            return GateDecision::ManuallyStopped;
        }
        if state.cooldown_recovery_count >= cfg.max_cooldown_recoveries {
            warn!(
                group_id,
                recoveries = state.cooldown_recovery_count,
                "cooldown recovery budget exhausted; waiting for a human"
            );
            return GateDecision::RecoveryBudgetExhausted;
        }

        if state.in_cooldown {
            if let Some(until) = state.cooldown_until {
                let now = Instant::now();
                if now < until {
                    return GateDecision::CoolingDown {
                        remaining_secs: (until - now).as_secs(),
                    };
                }
                // Window elapsed: reset and allow.
                state.in_cooldown = false;
                state.cooldown_until = None;
                state.ai_consecutive_count = 0;
                info!(group_id, "cooldown window elapsed; state reset");
                return GateDecision::Allowed;
            }
        }

        if state.ai_consecutive_count >= cfg.max_ai_consecutive_replies {
            self.enter_cooldown(group_id, state, cfg, cfg.cooldown_seconds, "consecutive limit");
            return GateDecision::CoolingDown {
                remaining_secs: cfg.cooldown_seconds,
            };
        }
        if state.round_message_count >= cfg.max_messages_per_round {
            self.enter_cooldown(group_id, state, cfg, cfg.cooldown_seconds, "round message limit");
            return GateDecision::CoolingDown {
                remaining_secs: cfg.cooldown_seconds,
            };
        }
        if state.round_estimated_tokens >= cfg.max_tokens_per_round {
            self.enter_cooldown(
                group_id,
                state,
                cfg,
                TOKEN_LIMIT_COOLDOWN_SECS,
                "round token budget",
            );
            return GateDecision::CoolingDown {
                remaining_secs: TOKEN_LIMIT_COOLDOWN_SECS,
            };
        }

        GateDecision::Allowed
    }

    /// Block all AI triggers until `resume` or the next human message.
    pub fn manual_stop(&self, group_id: &str) {
        let mut states = self.states.lock().unwrap();
        let state = states
            .entry(group_id.to_string())
            .or_insert_with(ConversationState::new);
        state.manually_stopped = true;
        warn!(group_id, "conversation manually stopped");
    }

    pub fn resume(&self, group_id: &str) {
        let mut states = self.states.lock().unwrap();
        let state = states
            .entry(group_id.to_string())
            .or_insert_with(ConversationState::new);
        state.manually_stopped = false;
        state.in_cooldown = false;
        state.cooldown_until = None;
        info!(group_id, "conversation resumed");
    }

    pub fn status(&self, group_id: &str) -> ControllerStatus {
        let mut states = self.states.lock().unwrap();
        let state = states
            .entry(group_id.to_string())
            .or_insert_with(ConversationState::new);
        ControllerStatus {
            ai_consecutive_count: state.ai_consecutive_count,
            round_message_count: state.round_message_count,
            round_estimated_tokens: state.round_estimated_tokens,
            in_cooldown: state.in_cooldown,
            cooldown_recovery_count: state.cooldown_recovery_count,
            manually_stopped: state.manually_stopped,
        }
    }

    fn enter_cooldown(
        &self,
        group_id: &str,
        state: &mut ConversationState,
        cfg: &ControllerConfig,
        cooldown_secs: u64,
        reason: &str,
    ) {
        state.in_cooldown = true;
        state.cooldown_until = Some(Instant::now() + Duration::from_secs(cooldown_secs));
        state.cooldown_recovery_count += 1;
        warn!(
            group_id,
            reason,
            cooldown_secs,
            recovery = state.cooldown_recovery_count,
            max = cfg.max_cooldown_recoveries,
            "cooldown entered"
        );

        // Schedule automatic recovery only while the budget allows; past the
        // cap a human message is the only way back.
        if state.cooldown_recovery_count < cfg.max_cooldown_recoveries {
            let callback = self.recovery_callback.lock().unwrap().clone();
            if let Some(callback) = callback {
                self.spawn_recovery(group_id.to_string(), cooldown_secs, callback);
            }
        }
    }

    fn spawn_recovery(&self, group_id: String, cooldown_secs: u64, callback: RecoveryCallback) {
        let states = self.states.clone();
        tokio::spawn(async move {
            // One extra second so the deadline has definitely passed on fire.
            tokio::time::sleep(Duration::from_secs(cooldown_secs + 1)).await;
            let should_recover = {
                let mut states = states.lock().unwrap();
                let Some(state) = states.get_mut(&group_id) else {
                    return;
                };
                if state.in_cooldown {
                    match state.cooldown_until {
                        Some(until) if Instant::now() >= until => {
                            state.in_cooldown = false;
                            state.cooldown_until = None;
                            state.ai_consecutive_count = 0;
                            true
                        }
                        Some(_) => false,
                        // A human already reset the state.
                        None => false,
                    }
                } else {
                    false
                }
            };
            if should_recover {
                info!(group_id = %group_id, "cooldown elapsed; triggering recovery");
                callback(group_id);
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn cfg() -> ControllerConfig {
        ControllerConfig {
            max_ai_consecutive_replies: 3,
            max_messages_per_round: 20,
            max_tokens_per_round: 50_000,
            cooldown_seconds: 30,
            max_cooldown_recoveries: 3,
            enable_ai_to_ai: true,
        }
    }

    #[tokio::test]
    async fn consecutive_limit_forces_cooldown() {
        let controller = ConversationController::new();
        for _ in 0..3 {
            controller.track_message("g", MemberType::Ai, 100);
        }
        let decision = controller.should_allow_ai_trigger("g", &cfg());
        assert!(matches!(decision, GateDecision::CoolingDown { .. }));
        assert!(controller.status("g").in_cooldown);
    }

    #[tokio::test]
    async fn human_message_resets_everything() {
        let controller = ConversationController::new();
        for _ in 0..3 {
            controller.track_message("g", MemberType::Ai, 100);
        }
        controller.should_allow_ai_trigger("g", &cfg());
        controller.manual_stop("g");

        controller.track_message("g", MemberType::Human, 10);
        let status = controller.status("g");
        assert_eq!(status.ai_consecutive_count, 0);
        assert!(!status.in_cooldown);
        assert_eq!(status.cooldown_recovery_count, 0);
        assert!(!status.manually_stopped);
        assert!(controller.should_allow_ai_trigger("g", &cfg()).allowed());
    }

    #[tokio::test]
    async fn manual_stop_blocks_until_resume() {
        let controller = ConversationController::new();
        controller.manual_stop("g");
        assert_eq!(
            controller.should_allow_ai_trigger("g", &cfg()),
            GateDecision::ManuallyStopped
        );
        controller.resume("g");
        assert!(controller.should_allow_ai_trigger("g", &cfg()).allowed());
    }

    #[tokio::test(start_paused = true)]
    async fn recovery_fires_after_the_window_and_is_bounded() {
        let controller = Arc::new(ConversationController::new());
        let fired = Arc::new(AtomicUsize::new(0));
        {
            let fired = fired.clone();
            controller.set_recovery_callback(Arc::new(move |_group| {
                fired.fetch_add(1, Ordering::SeqCst);
            }));
        }
        let config = ControllerConfig {
            cooldown_seconds: 5,
            ..cfg()
        };

        // Recoveries 1 and 2 schedule callbacks; the third does not.
        for round in 0..3 {
            for _ in 0..3 {
                controller.track_message("g", MemberType::Ai, 10);
            }
            let decision = controller.should_allow_ai_trigger("g", &config);
            assert!(matches!(decision, GateDecision::CoolingDown { .. }), "round {round}");
            tokio::time::sleep(Duration::from_secs(7)).await;
        }
        assert_eq!(fired.load(Ordering::SeqCst), 2);

        // Budget exhausted: no further AI triggers.
        assert_eq!(
            controller.should_allow_ai_trigger("g", &config),
            GateDecision::RecoveryBudgetExhausted
        );
    }

    #[tokio::test]
    async fn token_budget_forces_long_cooldown() {
        let controller = ConversationController::new();
        controller.track_message("g", MemberType::Ai, 60_000);
        let decision = controller.should_allow_ai_trigger("g", &cfg());
        assert!(
            matches!(decision, GateDecision::CoolingDown { remaining_secs } if remaining_secs == 300)
        );
    }

    #[tokio::test]
    async fn ai_to_ai_disabled_blocks_cleanly() {
        let controller = ConversationController::new();
        let config = ControllerConfig {
            enable_ai_to_ai: false,
            ..cfg()
        };
        assert_eq!(
            controller.should_allow_ai_trigger("g", &config),
            GateDecision::AiToAiDisabled
        );
    }
}
