//! The group-chat pipeline: persist and broadcast an incoming message,
//! cancel superseded AI work, gate through the conversation controller,
//! pick repliers, and drive their delayed replies.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use rand::SeedableRng;
use tokio::sync::{mpsc, Semaphore};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

use reef_hub::{GroupEvent, Hubs};

use crate::controller::{ControllerConfig, ConversationController};
use crate::error::{GroupError, Result};
use crate::filters::FilterChain;
use crate::reply::ReplyController;
use crate::scheduler::{IntelligentScheduler, ScheduledReply};
use crate::similarity::SimilarityDetector;
use crate::store::{Group, GroupStore};
use crate::types::{GroupMember, GroupMessage, GroupStrategyConfig, MemberType};

/// Delay timers sleep in slices of at most this long, checking cancellation
/// between slices.
const DELAY_SLICE: Duration = Duration::from_millis(500);
/// Concurrent LLM generations allowed per group.
const MAX_CONCURRENT_LLM_PER_GROUP: usize = 2;
/// Recent-message window used for candidate decisions.
const DECISION_CONTEXT: usize = 20;

/// Produces one AI reply given the member's context window. Implemented
/// over the streaming orchestrator at the service boundary; tests use
/// scripted fakes.
#[async_trait]
pub trait ReplyGenerator: Send + Sync {
    async fn generate(
        &self,
        group: &Group,
        member: &GroupMember,
        context: &[GroupMessage],
        cancel: &CancellationToken,
    ) -> Result<String>;
}

struct PendingReply {
    member_id: String,
    token: CancellationToken,
}

/// Orchestrates group chats end to end. One instance per process.
pub struct GroupChatService {
    store: Arc<GroupStore>,
    controller: Arc<ConversationController>,
    similarity: Arc<SimilarityDetector>,
    reply_controller: Arc<ReplyController>,
    hubs: Arc<Hubs>,
    generator: Arc<dyn ReplyGenerator>,
    /// Pending delayed replies per group; cancelled wholesale on new human
    /// activity.
    pending: Mutex<HashMap<String, Vec<PendingReply>>>,
    /// At most one alive AI-to-AI trigger per group.
    ai_to_ai: Mutex<HashMap<String, CancellationToken>>,
    llm_semaphores: Mutex<HashMap<String, Arc<Semaphore>>>,
}

impl GroupChatService {
    pub fn new(
        store: Arc<GroupStore>,
        controller: Arc<ConversationController>,
        hubs: Arc<Hubs>,
        generator: Arc<dyn ReplyGenerator>,
    ) -> Arc<Self> {
        let service = Arc::new(Self {
            store,
            controller,
            similarity: Arc::new(SimilarityDetector::new()),
            reply_controller: Arc::new(ReplyController::new()),
            hubs,
            generator,
            pending: Mutex::new(HashMap::new()),
            ai_to_ai: Mutex::new(HashMap::new()),
            llm_semaphores: Mutex::new(HashMap::new()),
        });

        // Cooldown recovery re-runs the decision cycle on the group's last
        // message.
        let weak = Arc::downgrade(&service);
        service
            .controller
            .set_recovery_callback(Arc::new(move |group_id: String| {
                if let Some(service) = weak.upgrade() {
                    tokio::spawn(async move {
                        if let Err(e) = service.trigger_decision_on_last_message(&group_id).await {
                            warn!(group_id = %group_id, "recovery decision failed: {e}");
                        }
                    });
                }
            }));
        service
    }

    pub fn controller(&self) -> &ConversationController {
        &self.controller
    }

    /// Entry point for every new group message (human or AI-authored via
    /// external paths). Persists, broadcasts, cancels superseded AI work,
    /// then runs the decision cycle.
    #[instrument(skip_all, fields(group_id = %message.group_id, sender = %message.sender_id))]
    pub async fn handle_message(self: &Arc<Self>, message: GroupMessage) -> Result<()> {
        let group = self.store.get_group(&message.group_id)?;

        // 1. Persistence and fan-out.
        self.store.save_message(&message)?;
        self.hubs.groups.publish(
            &message.group_id,
            GroupEvent::Message {
                group_id: message.group_id.clone(),
                message: serde_json::to_value(&message)?,
            },
            Some(&message.sender_id),
        );
        self.store
            .reset_consecutive_except(&message.group_id, &message.sender_id)?;

        // A new message supersedes every pending delayed reply and the
        // pending AI-to-AI trigger.
        self.cancel_pending(&message.group_id);
        self.cancel_ai_to_ai(&message.group_id);

        self.controller.track_message(
            &message.group_id,
            message.sender_type,
            estimate_tokens(&message.content),
        );

        self.run_decision_cycle(&group, &message).await
    }

    /// Re-run the decision cycle on the group's newest message (cooldown
    /// recovery and AI-to-AI triggers).
    pub async fn trigger_decision_on_last_message(self: &Arc<Self>, group_id: &str) -> Result<()> {
        let group = self.store.get_group(group_id)?;
        let recent = self.store.recent_messages(group_id, 1)?;
        let Some(last) = recent.into_iter().next() else {
            return Ok(());
        };
        self.run_decision_cycle(&group, &last).await
    }

    pub fn manual_stop(&self, group_id: &str) {
        self.controller.manual_stop(group_id);
        self.cancel_pending(group_id);
        self.cancel_ai_to_ai(group_id);
    }

    pub fn resume(&self, group_id: &str) {
        self.controller.resume(group_id);
    }

    // --- decision cycle ----------------------------------------------------

    async fn run_decision_cycle(self: &Arc<Self>, group: &Group, trigger: &GroupMessage) -> Result<()> {
        let strategy = group.strategy.effective();

        // 2. Conversation gate. Human messages always trigger a decision.
        if trigger.sender_type == MemberType::Ai {
            let gate = self
                .controller
                .should_allow_ai_trigger(&group.group_id, &ControllerConfig::from(&strategy));
            if !gate.allowed() {
                debug!(group_id = %group.group_id, ?gate, "ai trigger gated");
                return Ok(());
            }
        }

        // 3-4. Candidates and probability.
        let members = self.store.members(&group.group_id)?;
        let ai_members: Vec<GroupMember> =
            members.iter().filter(|m| m.is_ai()).cloned().collect();
        if ai_members.is_empty() {
            return Ok(());
        }
        let recent = self
            .store
            .recent_messages(&group.group_id, DECISION_CONTEXT)?;
        let now = Utc::now();
        let candidates = FilterChain::evaluate(trigger, &ai_members, &recent, now);
        if candidates.is_empty() {
            return Ok(());
        }

        // 5. Sampling (bypassed in unrestricted mode by the raised limits).
        let mut rng = rand::rngs::StdRng::from_entropy();
        let sampled = IntelligentScheduler::sample(candidates, &strategy, &mut rng);

        // 6-7. Situation, selection, delay tiers.
        let ai_consecutive = self.controller.status(&group.group_id).ai_consecutive_count;
        let situation =
            IntelligentScheduler::analyze(trigger, &recent, ai_consecutive, &strategy, now);
        let scheduled = IntelligentScheduler::optimize(
            sampled,
            &situation,
            &ai_members,
            &strategy,
            now,
            &mut rng,
        );

        // 8. Spawn the delayed replies.
        for reply in scheduled {
            self.spawn_delayed_reply(group.clone(), trigger.clone(), reply, strategy.clone());
        }
        Ok(())
    }

    fn spawn_delayed_reply(
        self: &Arc<Self>,
        group: Group,
        trigger: GroupMessage,
        reply: ScheduledReply,
        strategy: GroupStrategyConfig,
    ) {
        let token = CancellationToken::new();
        self.pending
            .lock()
            .unwrap()
            .entry(group.group_id.clone())
            .or_default()
            .push(PendingReply {
                member_id: reply.member_id.clone(),
                token: token.clone(),
            });

        let service = self.clone();
        tokio::spawn(async move {
            info!(
                group_id = %group.group_id,
                member_id = %reply.member_id,
                tier = reply.tier,
                delay = reply.delay_seconds,
                "delayed reply scheduled"
            );
            if !sliced_sleep(Duration::from_secs_f64(reply.delay_seconds), &token).await {
                debug!(member_id = %reply.member_id, "delayed reply cancelled during wait");
                return;
            }
            if let Err(e) = service
                .fire_reply(&group, &trigger, &reply, &strategy, &token)
                .await
            {
                warn!(member_id = %reply.member_id, "delayed reply failed: {e}");
            }
            service.remove_pending(&group.group_id, &reply.member_id);
        });
    }

    async fn fire_reply(
        self: &Arc<Self>,
        group: &Group,
        trigger: &GroupMessage,
        reply: &ScheduledReply,
        strategy: &GroupStrategyConfig,
        token: &CancellationToken,
    ) -> Result<()> {
        // Presence may have changed while we slept.
        let members = self.store.members(&group.group_id)?;
        let Some(member) = members
            .iter()
            .find(|m| m.member_id == reply.member_id && m.is_online())
        else {
            debug!(member_id = %reply.member_id, "member gone offline; reply dropped");
            return Ok(());
        };

        let semaphore = self.llm_semaphore(&group.group_id);
        let _generation_slot = tokio::select! {
            _ = token.cancelled() => return Err(GroupError::Cancelled),
            permit = semaphore.acquire_owned() => permit.unwrap(),
        };
        if token.is_cancelled() {
            return Err(GroupError::Cancelled);
        }

        // Rebuild the context from the *current* window so this AI sees
        // replies that landed while it waited its tier delay.
        let window = member
            .behavior
            .as_ref()
            .map(|b| b.context_window_size)
            .unwrap_or(DECISION_CONTEXT);
        let context = self.store.recent_messages(&group.group_id, window)?;

        let content = self
            .generator
            .generate(group, member, &context, token)
            .await?;
        if content.trim().is_empty() {
            return Ok(());
        }

        // Similarity gate: suppressed when detection is disabled (which the
        // unrestricted adapter does).
        if strategy.enable_similarity_detection {
            if let Some(similar_to) = self.similarity.check(
                &group.group_id,
                &content,
                strategy.similarity_lookback,
                strategy.similarity_threshold,
            ) {
                info!(
                    member_id = %member.member_id,
                    similar_to = %similar_to,
                    "reply suppressed by similarity detector"
                );
                return Ok(());
            }
        }

        // Anti-stampede: bounded repliers per triggering message.
        if !self
            .reply_controller
            .try_claim(&trigger.message_id, strategy.max_concurrent_replies_per_message)
        {
            info!(member_id = %member.member_id, "reply slot denied; dropped");
            return Ok(());
        }

        let message = GroupMessage {
            message_id: Uuid::new_v4().to_string(),
            group_id: group.group_id.clone(),
            sender_id: member.member_id.clone(),
            sender_type: MemberType::Ai,
            sender_name: member.display_name.clone(),
            msg_type: "text".into(),
            content: content.clone(),
            images: vec![],
            mentions: vec![],
            reply_to: Some(trigger.message_id.clone()),
            read_by: vec![],
            ai_session_id: member.ai_session_id.clone(),
            references: vec![],
            timestamp: Utc::now(),
        };

        self.store.save_message(&message)?;
        self.hubs.groups.publish(
            &group.group_id,
            GroupEvent::Message {
                group_id: group.group_id.clone(),
                message: serde_json::to_value(&message)?,
            },
            None,
        );
        self.store.record_reply(&group.group_id, &member.member_id)?;
        self.controller.track_message(
            &group.group_id,
            MemberType::Ai,
            estimate_tokens(&content),
        );
        self.similarity
            .record(&group.group_id, &member.member_id, &content);

        info!(member_id = %member.member_id, "ai reply posted");

        // Let the cast keep talking: one pending AI-to-AI trigger per group.
        self.schedule_ai_to_ai_trigger(&group.group_id, strategy.ai_to_ai_delay_seconds);
        Ok(())
    }

    fn schedule_ai_to_ai_trigger(self: &Arc<Self>, group_id: &str, delay_secs: f64) {
        let token = CancellationToken::new();
        {
            let mut map = self.ai_to_ai.lock().unwrap();
            if let Some(old) = map.insert(group_id.to_string(), token.clone()) {
                old.cancel();
            }
        }
        let service = self.clone();
        let group_id = group_id.to_string();
        tokio::spawn(async move {
            if !sliced_sleep(Duration::from_secs_f64(delay_secs), &token).await {
                return;
            }
            {
                let mut map = service.ai_to_ai.lock().unwrap();
                if map.get(&group_id).is_some_and(|t| t.is_cancelled()) {
                    return;
                }
                map.remove(&group_id);
            }
            debug!(group_id = %group_id, "ai-to-ai trigger firing");
            if let Err(e) = service.trigger_decision_on_last_message(&group_id).await {
                warn!(group_id = %group_id, "ai-to-ai decision failed: {e}");
            }
        });
    }

    // --- bookkeeping -------------------------------------------------------

    fn cancel_pending(&self, group_id: &str) {
        let cancelled = {
            let mut pending = self.pending.lock().unwrap();
            pending.remove(group_id).unwrap_or_default()
        };
        for reply in &cancelled {
            reply.token.cancel();
        }
        if !cancelled.is_empty() {
            info!(group_id, count = cancelled.len(), "pending replies cancelled");
        }
    }

    fn cancel_ai_to_ai(&self, group_id: &str) {
        let token = self.ai_to_ai.lock().unwrap().remove(group_id);
        if let Some(token) = token {
            token.cancel();
            debug!(group_id, "ai-to-ai trigger cancelled");
        }
    }

    fn remove_pending(&self, group_id: &str, member_id: &str) {
        let mut pending = self.pending.lock().unwrap();
        if let Some(list) = pending.get_mut(group_id) {
            list.retain(|p| p.member_id != member_id);
            if list.is_empty() {
                pending.remove(group_id);
            }
        }
    }

    fn llm_semaphore(&self, group_id: &str) -> Arc<Semaphore> {
        self.llm_semaphores
            .lock()
            .unwrap()
            .entry(group_id.to_string())
            .or_insert_with(|| Arc::new(Semaphore::new(MAX_CONCURRENT_LLM_PER_GROUP)))
            .clone()
    }

    pub fn pending_count(&self, group_id: &str) -> usize {
        self.pending
            .lock()
            .unwrap()
            .get(group_id)
            .map(|p| p.len())
            .unwrap_or(0)
    }
}

/// Sleep in ≤0.5 s slices, checking the cancellation token between slices.
/// Returns false if cancelled before the full duration elapsed.
async fn sliced_sleep(total: Duration, token: &CancellationToken) -> bool {
    let mut remaining = total;
    while remaining > Duration::ZERO {
        if token.is_cancelled() {
            return false;
        }
        let slice = remaining.min(DELAY_SLICE);
        tokio::select! {
            _ = token.cancelled() => return false,
            _ = tokio::time::sleep(slice) => {}
        }
        remaining = remaining.saturating_sub(slice);
    }
    !token.is_cancelled()
}

/// Rough token estimate used for the round budget.
fn estimate_tokens(content: &str) -> u64 {
    (content.chars().count() as u64 / 4).max(1)
}

/// Channel-backed generator handle for tests and loopback tools.
pub struct ChannelReplyGenerator {
    pub tx: mpsc::UnboundedSender<(String, String)>,
    pub reply: String,
}

#[async_trait]
impl ReplyGenerator for ChannelReplyGenerator {
    async fn generate(
        &self,
        group: &Group,
        member: &GroupMember,
        _context: &[GroupMessage],
        _cancel: &CancellationToken,
    ) -> Result<String> {
        let _ = self.tx.send((group.group_id.clone(), member.member_id.clone()));
        Ok(self.reply.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::init_db;
    use crate::types::{AiBehaviorConfig, GroupRole, Presence};
    use rusqlite::Connection;

    fn service_with(
        reply: &str,
    ) -> (
        Arc<GroupChatService>,
        Arc<GroupStore>,
        mpsc::UnboundedReceiver<(String, String)>,
    ) {
        let conn = Connection::open_in_memory().unwrap();
        init_db(&conn).unwrap();
        let store = Arc::new(GroupStore::new(conn));
        let (tx, rx) = mpsc::unbounded_channel();
        let generator = Arc::new(ChannelReplyGenerator {
            tx,
            reply: reply.to_string(),
        });
        let service = GroupChatService::new(
            store.clone(),
            Arc::new(ConversationController::new()),
            Arc::new(Hubs::default()),
            generator,
        );
        (service, store, rx)
    }

    fn setup_group(store: &GroupStore, ai_count: usize, strategy: GroupStrategyConfig) -> Group {
        let group = store.create_group("owner", "g", None, strategy).unwrap();
        let human = GroupMember {
            member_id: "alice".into(),
            group_id: group.group_id.clone(),
            display_name: "Alice".into(),
            member_type: MemberType::Human,
            role: GroupRole::Owner,
            presence: Presence::Online,
            ai_session_id: None,
            behavior: None,
            consecutive_reply_count: 0,
            last_reply_at: None,
            joined_at: Utc::now(),
        };
        store.add_member(&human).unwrap();
        for i in 0..ai_count {
            let ai = GroupMember {
                member_id: format!("bot{}", i),
                group_id: group.group_id.clone(),
                display_name: format!("Bot {}", i),
                member_type: MemberType::Ai,
                role: GroupRole::Member,
                presence: Presence::Online,
                ai_session_id: Some(format!("session-{}", i)),
                behavior: Some(AiBehaviorConfig {
                    base_reply_probability: 1.0,
                    cooldown_after_reply: 0.0,
                    ..Default::default()
                }),
                consecutive_reply_count: 0,
                last_reply_at: None,
                joined_at: Utc::now(),
            };
            store.add_member(&ai).unwrap();
        }
        group
    }

    fn human_message(group_id: &str, content: &str) -> GroupMessage {
        GroupMessage {
            message_id: Uuid::new_v4().to_string(),
            group_id: group_id.to_string(),
            sender_id: "alice".into(),
            sender_type: MemberType::Human,
            sender_name: "Alice".into(),
            msg_type: "text".into(),
            content: content.to_string(),
            images: vec![],
            mentions: vec![],
            reply_to: None,
            read_by: vec![],
            ai_session_id: None,
            references: vec![],
            timestamp: Utc::now(),
        }
    }

    async fn settle() {
        // Paused-clock runtimes auto-advance through the delay slices.
        tokio::time::sleep(Duration::from_secs(30)).await;
    }

    #[tokio::test(start_paused = true)]
    async fn cold_group_single_human_message_gets_one_reply() {
        let (service, store, mut rx) = service_with("hello from the reef");
        // AI-to-AI chatter off so only the first wave fires.
        let strategy = GroupStrategyConfig {
            enable_ai_to_ai: false,
            ..Default::default()
        };
        let group = setup_group(&store, 5, strategy);

        service
            .handle_message(human_message(&group.group_id, "hello everyone"))
            .await
            .unwrap();
        settle().await;

        // Cold group: max one AI replies, and its reply is persisted.
        let mut fired = Vec::new();
        while let Ok(item) = rx.try_recv() {
            fired.push(item);
        }
        assert_eq!(fired.len(), 1);

        let messages = store.recent_messages(&group.group_id, 10).unwrap();
        assert_eq!(messages.len(), 2);
        assert_eq!(messages[1].sender_type, MemberType::Ai);
        assert_eq!(
            service.controller().status(&group.group_id).ai_consecutive_count,
            1
        );
    }

    #[tokio::test(start_paused = true)]
    async fn new_human_message_cancels_pending_replies() {
        let (service, store, mut rx) = service_with("reply");
        let mut strategy = GroupStrategyConfig {
            enable_ai_to_ai: false,
            ..Default::default()
        };
        // Long delays so the second message lands before any reply fires.
        strategy.normal_delay_min = 30.0;
        strategy.normal_delay_max = 40.0;
        strategy.mention_delay_min = 30.0;
        strategy.mention_delay_max = 40.0;
        strategy.high_interest_delay_min = 30.0;
        strategy.high_interest_delay_max = 40.0;
        let group = setup_group(&store, 3, strategy);

        service
            .handle_message(human_message(&group.group_id, "first"))
            .await
            .unwrap();
        assert!(service.pending_count(&group.group_id) >= 1);

        // The next human message pre-empts everything pending...
        service
            .handle_message(human_message(&group.group_id, "wait, changed my mind"))
            .await
            .unwrap();

        // ...so only replies to the *second* message ever fire.
        settle().await;
        settle().await;
        let messages = store.recent_messages(&group.group_id, 20).unwrap();
        let second_id = messages
            .iter()
            .find(|m| m.content == "wait, changed my mind")
            .unwrap()
            .message_id
            .clone();
        for m in messages.iter().filter(|m| m.sender_type == MemberType::Ai) {
            assert_eq!(m.reply_to.as_deref(), Some(second_id.as_str()));
        }
        let _ = rx.try_recv();
    }

    #[tokio::test(start_paused = true)]
    async fn similarity_detector_suppresses_duplicate_replies() {
        let (service, store, _rx) = service_with("identical answer every time");
        let mut strategy = GroupStrategyConfig {
            enable_ai_to_ai: false,
            ..Default::default()
        };
        // Allow both AIs into the first wave so the detector has work to do.
        strategy.cold_group_max_concurrent = 3;
        strategy.human_message_max_concurrent = 3;
        let group = setup_group(&store, 2, strategy);

        service
            .handle_message(human_message(&group.group_id, "say something unique"))
            .await
            .unwrap();
        settle().await;

        let ai_messages: Vec<_> = store
            .recent_messages(&group.group_id, 20)
            .unwrap()
            .into_iter()
            .filter(|m| m.sender_type == MemberType::Ai)
            .collect();
        // At most one copy of the identical answer survives.
        assert!(ai_messages.len() <= 1);
    }

    #[tokio::test(start_paused = true)]
    async fn unrestricted_mode_lets_duplicates_through() {
        let (service, store, _rx) = service_with("identical answer every time");
        let strategy = GroupStrategyConfig {
            unrestricted_mode: true,
            ..Default::default()
        };
        let group = setup_group(&store, 2, strategy);

        service
            .handle_message(human_message(&group.group_id, "go"))
            .await
            .unwrap();
        settle().await;

        let ai_messages: Vec<_> = store
            .recent_messages(&group.group_id, 20)
            .unwrap()
            .into_iter()
            .filter(|m| m.sender_type == MemberType::Ai)
            .collect();
        assert!(ai_messages.len() >= 2);
    }

    #[tokio::test]
    async fn manual_stop_cancels_and_blocks() {
        let (service, store, _rx) = service_with("r");
        let group = setup_group(&store, 1, GroupStrategyConfig::default());
        service.manual_stop(&group.group_id);
        assert!(service.controller().status(&group.group_id).manually_stopped);
        service.resume(&group.group_id);
        assert!(!service.controller().status(&group.group_id).manually_stopped);
    }
}
