pub mod controller;
pub mod db;
pub mod dispatcher;
pub mod error;
pub mod filters;
pub mod reply;
pub mod scheduler;
pub mod similarity;
pub mod store;
pub mod types;

pub use controller::{ConversationController, ControllerConfig};
pub use dispatcher::{GroupChatService, ReplyGenerator};
pub use error::{GroupError, Result};
pub use filters::{FilterChain, ReplyCandidate};
pub use reply::ReplyController;
pub use scheduler::{IntelligentScheduler, ScheduledReply};
pub use similarity::SimilarityDetector;
pub use store::GroupStore;
pub use types::{
    AiBehaviorConfig, GroupMember, GroupMessage, GroupStrategyConfig, MemberType, Presence,
};
