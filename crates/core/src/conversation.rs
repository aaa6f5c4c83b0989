//! Conversation stages
//!
//! The stage shapes which tools are advertised to the LLM and how the
//! voice adaptation engine paces delivery.

use serde::{Deserialize, Serialize};

/// Coarse conversation stage
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConversationStage {
    /// Opening moments of the call
    Greeting,
    /// Ordinary back-and-forth
    Conversation,
    /// An application action (lookup, booking) is in play
    AppAction,
    /// Wrapping up the call
    EndCall,
}

impl ConversationStage {
    pub fn display_name(self) -> &'static str {
        match self {
            ConversationStage::Greeting => "greeting",
            ConversationStage::Conversation => "conversation",
            ConversationStage::AppAction => "app_action",
            ConversationStage::EndCall => "end_call",
        }
    }
}

impl Default for ConversationStage {
    fn default() -> Self {
        ConversationStage::Greeting
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display_names() {
        assert_eq!(ConversationStage::Greeting.display_name(), "greeting");
        assert_eq!(ConversationStage::AppAction.display_name(), "app_action");
    }
}
