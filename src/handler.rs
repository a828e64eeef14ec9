//! Message Handler: the single seam the I/O layers and the
//! front-end both call through — sanitizer, protocol, router, and rate
//! limiter never get invoked from anywhere else.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};

use log::warn;

use crate::config::Config;
use crate::error::{BeaconError, MessageError};
use crate::message::Message;
use crate::router::FloodRouter;
use crate::sanitizer::Sanitizer;

/// Outcome of `Handler::receive`.
pub struct ReceiveOutcome {
    /// Present when the message should be surfaced locally.
    pub delivered: Option<Message>,
    /// Peers the (possibly TTL-decremented) message should be forwarded to.
    pub forward_to: Vec<String>,
}

struct ErrorCounts {
    parse: u64,
    validation: u64,
    size: u64,
    rate_limit: u64,
}

impl ErrorCounts {
    fn new() -> Self {
        Self { parse: 0, validation: 0, size: 0, rate_limit: 0 }
    }
}

/// Composition of Sanitizer + Protocol + Router + RateLimiter behind the
/// four operations the front-end and I/O layers call through.
pub struct MessageHandler {
    config: Arc<Config>,
    sanitizer: Arc<Sanitizer>,
    router: Arc<FloodRouter>,
    rate_limiter: Arc<crate::rate_limiter::RateLimiter>,
    recent: Mutex<VecDeque<Message>>,
    error_counts: Mutex<ErrorCounts>,
    on_sent: Mutex<Option<Box<dyn Fn(&Message) + Send + Sync>>>,
    on_received: Mutex<Option<Box<dyn Fn(&Message) + Send + Sync>>>,
    on_error: Mutex<Option<Box<dyn Fn(&BeaconError) + Send + Sync>>>,
}

impl MessageHandler {
    pub fn new(
        config: Arc<Config>,
        sanitizer: Arc<Sanitizer>,
        router: Arc<FloodRouter>,
        rate_limiter: Arc<crate::rate_limiter::RateLimiter>,
    ) -> Self {
        Self {
            config,
            sanitizer,
            router,
            rate_limiter,
            recent: Mutex::new(VecDeque::new()),
            error_counts: Mutex::new(ErrorCounts::new()),
            on_sent: Mutex::new(None),
            on_received: Mutex::new(None),
            on_error: Mutex::new(None),
        }
    }

    pub fn set_on_sent(&self, f: impl Fn(&Message) + Send + Sync + 'static) {
        *self.on_sent.lock().expect("on_sent mutex poisoned") = Some(Box::new(f));
    }

    pub fn set_on_received(&self, f: impl Fn(&Message) + Send + Sync + 'static) {
        *self.on_received.lock().expect("on_received mutex poisoned") = Some(Box::new(f));
    }

    pub fn set_on_error(&self, f: impl Fn(&BeaconError) + Send + Sync + 'static) {
        *self.on_error.lock().expect("on_error mutex poisoned") = Some(Box::new(f));
    }

    /// `create(content, sender_name?, connection_id?) -> Message | Error`
    ///
    /// Rate-limit check runs before protocol validation; a validation
    /// failure after a successful rate-limit check does not refund the
    /// consumed slot (intentional anti-abuse behavior).
    pub fn create(
        &self,
        content: &str,
        sender_id: &str,
        sender_name: Option<&str>,
        connection_id: Option<&str>,
    ) -> Result<Message, BeaconError> {
        if let Err(e) = self.rate_limiter.check_and_record(connection_id, sender_id) {
            self.error_counts.lock().expect("error counts mutex poisoned").rate_limit += 1;
            let err = BeaconError::RateLimit(e);
            self.emit_error(&err);
            return Err(err);
        }

        let msg = Message::create_broadcast(content, sender_id, sender_name, &self.config, &self.sanitizer)
            .map_err(|e| {
                self.count_message_error(&e);
                let err = BeaconError::Message(e);
                self.emit_error(&err);
                err
            })?;

        self.push_recent(msg.clone());
        if let Some(cb) = self.on_sent.lock().expect("on_sent mutex poisoned").as_ref() {
            cb(&msg);
        }
        Ok(msg)
    }

    /// `send(message, connected_peers) -> targets`
    pub fn send(&self, message: Message, connected_peers: &[String]) -> (Message, Vec<String>) {
        self.router.originate(message, connected_peers)
    }

    /// `receive(bytes, source_peer, connected_peers) -> (Option<Message>, targets)`
    ///
    /// Parse failures are discarded without touching the recent-ring or
    /// `on_received` (explicit failure policy).
    pub fn receive(&self, bytes: &[u8], source_peer: &str, connected_peers: &[String]) -> ReceiveOutcome {
        let msg = match Message::parse(bytes, &self.config, &self.sanitizer) {
            Ok(m) => m,
            Err(e) => {
                self.count_message_error(&e);
                warn!("dropping malformed datagram from {source_peer}: {e}");
                return ReceiveOutcome { delivered: None, forward_to: Vec::new() };
            }
        };

        let decision = self.router.route(msg, Some(source_peer), connected_peers);
        if decision.process_locally {
            self.push_recent(decision.message.clone());
            if let Some(cb) = self.on_received.lock().expect("on_received mutex poisoned").as_ref() {
                cb(&decision.message);
            }
            ReceiveOutcome { delivered: Some(decision.message), forward_to: decision.forward_to }
        } else {
            ReceiveOutcome { delivered: None, forward_to: Vec::new() }
        }
    }

    /// `prepare_forward(message) -> Option<bytes>`
    pub fn prepare_forward(&self, message: &Message) -> Option<Vec<u8>> {
        message.prepare_for_forwarding(self.router.local_id()).map(|m| m.encode())
    }

    /// Bounded replay buffer for a newly-connected front-end.
    pub fn recent_messages(&self) -> Vec<Message> {
        self.recent.lock().expect("recent mutex poisoned").iter().cloned().collect()
    }

    /// Per-kind error counts, surfaced for front-end diagnostics.
    pub fn error_counts(&self) -> HashMap<&'static str, u64> {
        let counts = self.error_counts.lock().expect("error counts mutex poisoned");
        HashMap::from([
            ("parse", counts.parse),
            ("validation", counts.validation),
            ("size", counts.size),
            ("rate_limit", counts.rate_limit),
        ])
    }

    fn push_recent(&self, msg: Message) {
        let mut recent = self.recent.lock().expect("recent mutex poisoned");
        recent.push_back(msg);
        while recent.len() > self.config.recent_messages_capacity {
            recent.pop_front();
        }
    }

    fn count_message_error(&self, e: &MessageError) {
        let mut counts = self.error_counts.lock().expect("error counts mutex poisoned");
        match e {
            MessageError::ParseError(_) => counts.parse += 1,
            MessageError::ValidationError(_) => counts.validation += 1,
            MessageError::SizeError { .. } => counts.size += 1,
        }
    }

    fn emit_error(&self, err: &BeaconError) {
        if let Some(cb) = self.on_error.lock().expect("on_error mutex poisoned").as_ref() {
            cb(err);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn handler() -> MessageHandler {
        let config = Arc::new(Config::default());
        let sanitizer = Arc::new(Sanitizer::new());
        let router = Arc::new(FloodRouter::new("local-node", config.message_cache_size, config.message_cache_ttl));
        let rate_limiter = Arc::new(crate::rate_limiter::RateLimiter::new(&config));
        MessageHandler::new(config, sanitizer, router, rate_limiter)
    }

    #[test]
    fn create_pushes_recent_and_notifies_sent() {
        let h = handler();
        let sent_count = Arc::new(AtomicUsize::new(0));
        let counter = sent_count.clone();
        h.set_on_sent(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        let msg = h.create("hello", "local-node", None, Some("conn-1")).unwrap();
        assert_eq!(msg.content, "hello");
        assert_eq!(sent_count.load(Ordering::SeqCst), 1);
        assert_eq!(h.recent_messages().len(), 1);
    }

    #[test]
    fn receive_rejects_malformed_without_touching_recent() {
        let h = handler();
        let outcome = h.receive(b"not json", "peer-a", &[]);
        assert!(outcome.delivered.is_none());
        assert!(outcome.forward_to.is_empty());
        assert!(h.recent_messages().is_empty());
        assert_eq!(h.error_counts()["parse"], 1);
    }

    #[test]
    fn receive_delivers_and_forwards_valid_message() {
        let sender = handler();
        let msg = sender.create("hi there", "peer-a", None, None).unwrap();
        let bytes = msg.encode();

        let receiver = handler();
        let peers = vec!["peer-a".to_string(), "peer-c".to_string()];
        let outcome = receiver.receive(&bytes, "peer-a", &peers);
        assert!(outcome.delivered.is_some());
        assert_eq!(outcome.forward_to, vec!["peer-c".to_string()]);
    }

    #[test]
    fn rate_limit_failure_does_not_push_recent() {
        let mut config = Config::default();
        config.rate_limit_global = 1;
        let config = Arc::new(config);
        let sanitizer = Arc::new(Sanitizer::new());
        let router = Arc::new(FloodRouter::new("local-node", config.message_cache_size, config.message_cache_ttl));
        let rate_limiter = Arc::new(crate::rate_limiter::RateLimiter::new(&config));
        let h = MessageHandler::new(config, sanitizer, router, rate_limiter);

        h.create("first", "local-node", None, None).unwrap();
        let err = h.create("second", "local-node", None, None).unwrap_err();
        assert!(matches!(err, BeaconError::RateLimit(_)));
        assert_eq!(h.recent_messages().len(), 1);
        assert_eq!(h.error_counts()["rate_limit"], 1);
    }

    #[test]
    fn prepare_forward_none_at_zero_ttl() {
        let h = handler();
        let mut msg = h.create("hi", "local-node", None, None).unwrap();
        msg.ttl = 0;
        assert!(h.prepare_forward(&msg).is_none());
    }
}
