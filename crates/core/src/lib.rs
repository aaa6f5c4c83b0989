//! Core types for the callagent voice runtime
//!
//! This crate provides foundational types used across all other crates:
//! - Audio frame types
//! - Chat context and message types
//! - Job and participant model
//! - Turn records and metrics events
//! - Error types

pub mod audio;
pub mod chat;
pub mod conversation;
pub mod error;
pub mod job;
pub mod turn;

pub use audio::{AudioFrame, Channels, SampleRate};
pub use chat::{ChatContext, ChatError, ChatMessage, ChatRole, ToolCall};
pub use conversation::ConversationStage;
pub use error::{Error, Result};
pub use job::{Job, JobError, JobMetadata, Participant, ParticipantKind};
pub use turn::{EndReason, MetricsEvent, TurnRecord};
