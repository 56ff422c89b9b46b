//! Keyword safety gate for self-harm requests

use petpal_common::config::SafetyConfig;

/// Reply sent instead of calling the model when a message is blocked
pub const SUPPORTIVE_REPLY: &str = "I'm really sorry you're feeling this way. I can't help with \
self-harm instructions. If you're in immediate danger, contact local emergency services or \
someone you trust right now. If you want, tell me what's going on and I can offer supportive \
coping steps.";

#[derive(Debug, Clone)]
pub struct SafetyGate {
    enabled: bool,
    phrases: Vec<String>,
}

impl SafetyGate {
    pub fn new(config: &SafetyConfig) -> Self {
        Self {
            enabled: config.enabled,
            phrases: config
                .blocked_phrases
                .iter()
                .map(|p| p.trim().to_lowercase())
                .filter(|p| !p.is_empty())
                .collect(),
        }
    }

    /// Case-insensitive substring match against the blocked phrases
    pub fn is_blocked(&self, message: &str) -> bool {
        if !self.enabled {
            return false;
        }
        let message = message.to_lowercase();
        self.phrases.iter().any(|p| message.contains(p.as_str()))
    }
}
