/// Fast-store key scheme. The namespace is stable across deployments so
/// buffers written by one release are drained by the next.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeySpace {
    namespace: String,
}

impl KeySpace {
    pub fn new(namespace: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
        }
    }

    /// Ordered write-ahead list of buffered messages.
    pub fn messages(&self, chat_id: &str) -> String {
        format!("{}:chat:{}:msgs", self.namespace, chat_id)
    }

    pub fn channel(&self, chat_id: &str) -> String {
        format!("{}:chat:{}:pub", self.namespace, chat_id)
    }

    /// Hash holding `last_activity_ts`.
    pub fn meta(&self, chat_id: &str) -> String {
        format!("{}:chat:{}:meta", self.namespace, chat_id)
    }

    /// Cached serialized chat aggregate.
    pub fn chat(&self, chat_id: &str) -> String {
        format!("{}:chat:{}", self.namespace, chat_id)
    }

    pub fn flush_token(&self, chat_id: &str) -> String {
        format!("{}:chat:{}:flush_token", self.namespace, chat_id)
    }

    /// Sorted set of chat ids scored by last activity.
    pub fn active(&self) -> String {
        format!("{}:chat:active", self.namespace)
    }
}

impl Default for KeySpace {
    fn default() -> Self {
        Self::new(crate::constants::DEFAULT_NAMESPACE)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_key_layout() {
        let keys = KeySpace::default();
        assert_eq!(keys.messages("c1"), "spark:chat:c1:msgs");
        assert_eq!(keys.channel("c1"), "spark:chat:c1:pub");
        assert_eq!(keys.meta("c1"), "spark:chat:c1:meta");
        assert_eq!(keys.chat("c1"), "spark:chat:c1");
        assert_eq!(keys.flush_token("c1"), "spark:chat:c1:flush_token");
        assert_eq!(keys.active(), "spark:chat:active");
    }
}
