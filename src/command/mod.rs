//! # Command Module
//!
//! Remote commands arriving over the publish/subscribe channel.
//!
//! A logical message may arrive as several [`Fragment`]s. Only the first
//! carries the topic; the router remembers it and routes the continuation
//! fragments to the same handler. The handler table is fixed once
//! [`CommandRouterBuilder::build`] returns.

pub mod handlers;
pub mod mqtt;

use std::collections::HashMap;
use tracing::{debug, info};

/// One low-level delivery of a possibly larger message
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Fragment<'a> {
    /// Topic, empty on continuation fragments
    pub topic: &'a str,
    pub payload: &'a [u8],
    /// Position of `payload` within the whole message
    pub offset: usize,
    /// Length of the whole message
    pub total: usize,
}

impl<'a> Fragment<'a> {
    /// A message that fits in one fragment
    pub fn whole(topic: &'a str, payload: &'a [u8]) -> Self {
        Self {
            topic,
            payload,
            offset: 0,
            total: payload.len(),
        }
    }

    pub fn is_first(&self) -> bool {
        self.offset == 0
    }
}

/// Receiver of fragments for one topic
pub trait CommandHandler: Send {
    fn on_fragment(&mut self, fragment: &Fragment<'_>);
}

/// Collects subscriptions before the table is frozen
#[derive(Default)]
pub struct CommandRouterBuilder {
    routes: HashMap<String, Box<dyn CommandHandler>>,
}

impl CommandRouterBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `handler` for an exact topic; a later registration replaces it
    pub fn subscribe(mut self, topic: impl Into<String>, handler: Box<dyn CommandHandler>) -> Self {
        self.routes.insert(topic.into(), handler);
        self
    }

    pub fn build(self) -> CommandRouter {
        CommandRouter {
            routes: self.routes,
            current_topic: None,
        }
    }
}

/// Topic to handler dispatch
pub struct CommandRouter {
    routes: HashMap<String, Box<dyn CommandHandler>>,
    current_topic: Option<String>,
}

impl CommandRouter {
    pub fn builder() -> CommandRouterBuilder {
        CommandRouterBuilder::new()
    }

    /// Subscribed topics, sorted
    pub fn topics(&self) -> Vec<&str> {
        let mut topics: Vec<&str> = self.routes.keys().map(String::as_str).collect();
        topics.sort_unstable();
        topics
    }

    /// Topic continuation fragments are routed to
    pub fn current_topic(&self) -> Option<&str> {
        self.current_topic.as_deref()
    }

    /// Route one fragment; returns whether a handler received it
    pub fn dispatch(&mut self, fragment: &Fragment<'_>) -> bool {
        if fragment.is_first() && !fragment.topic.is_empty() {
            self.current_topic = Some(fragment.topic.to_string());
        }

        let topic = if !fragment.topic.is_empty() {
            fragment.topic
        } else if let Some(current) = &self.current_topic {
            current.as_str()
        } else {
            debug!("Dropping continuation fragment with no known topic");
            return false;
        };

        match self.routes.get_mut(topic) {
            Some(handler) => {
                handler.on_fragment(&Fragment { topic, ..*fragment });
                true
            }
            None => {
                info!("No handler for topic {}; message discarded", topic);
                false
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};

    type Seen = Arc<Mutex<Vec<(String, Vec<u8>, usize, usize)>>>;

    struct Recorder(Seen);

    impl CommandHandler for Recorder {
        fn on_fragment(&mut self, fragment: &Fragment<'_>) {
            self.0.lock().unwrap().push((
                fragment.topic.to_string(),
                fragment.payload.to_vec(),
                fragment.offset,
                fragment.total,
            ));
        }
    }

    fn router() -> (CommandRouter, Seen, Seen) {
        let a: Seen = Arc::default();
        let b: Seen = Arc::default();
        let router = CommandRouter::builder()
            .subscribe("/a", Box::new(Recorder(a.clone())))
            .subscribe("/b", Box::new(Recorder(b.clone())))
            .build();
        (router, a, b)
    }

    #[test]
    fn test_exact_topic_match() {
        let (mut router, a, b) = router();

        assert!(router.dispatch(&Fragment::whole("/b", b"hi")));
        assert!(a.lock().unwrap().is_empty());
        assert_eq!(b.lock().unwrap()[0], ("/b".to_string(), b"hi".to_vec(), 0, 2));
    }

    #[test]
    fn test_continuation_uses_remembered_topic() {
        let (mut router, a, _b) = router();

        router.dispatch(&Fragment { topic: "/a", payload: b"hel", offset: 0, total: 5 });
        router.dispatch(&Fragment { topic: "", payload: b"lo", offset: 3, total: 5 });

        let seen = a.lock().unwrap();
        assert_eq!(seen.len(), 2);
        assert_eq!(seen[1], ("/a".to_string(), b"lo".to_vec(), 3, 5));
        assert_eq!(router.current_topic(), Some("/a"));
    }

    #[test]
    fn test_unknown_topic_is_discarded() {
        let (mut router, a, b) = router();

        assert!(!router.dispatch(&Fragment::whole("/c", b"x")));
        // Continuations of an unknown message are discarded too
        assert!(!router.dispatch(&Fragment { topic: "", payload: b"y", offset: 1, total: 2 }));
        assert!(a.lock().unwrap().is_empty());
        assert!(b.lock().unwrap().is_empty());
    }

    #[test]
    fn test_continuation_before_any_topic() {
        let (mut router, _a, _b) = router();
        assert!(!router.dispatch(&Fragment { topic: "", payload: b"z", offset: 4, total: 8 }));
    }

    #[test]
    fn test_topics_sorted() {
        let (router, _a, _b) = router();
        assert_eq!(router.topics(), vec!["/a", "/b"]);
    }
}
