//! EventBus contract (§1, §6): a process-wide publish/subscribe channel
//! for named topics (`stage-change`, `update-bridges`, `new-invite`, ...).

use std::cell::RefCell;
use std::collections::HashMap;
use std::rc::Rc;

pub type SubscriptionId = u64;

pub trait EventBus {
    /// Publish `payload` to every current subscriber of `topic`.
    fn emit(&self, topic: &str, payload: serde_json::Value);

    /// Subscribe to `topic`; returns an id usable with `unsubscribe`.
    fn subscribe(&self, topic: &str, callback: Box<dyn Fn(&serde_json::Value)>) -> SubscriptionId;

    fn unsubscribe(&self, topic: &str, id: SubscriptionId);
}

struct Subscriber {
    id: SubscriptionId,
    callback: Box<dyn Fn(&serde_json::Value)>,
}

/// Reference implementation: an `Rc<RefCell<...>>` registry of per-topic
/// subscriber lists, matching the single-threaded interior-mutability
/// idiom used throughout this workspace's WASM code (e.g. `CircuitCache`).
#[derive(Default)]
pub struct InMemoryEventBus {
    topics: RefCell<HashMap<String, Vec<Subscriber>>>,
    next_id: Rc<RefCell<SubscriptionId>>,
}

impl InMemoryEventBus {
    pub fn new() -> Self {
        Self::default()
    }
}

impl EventBus for InMemoryEventBus {
    fn emit(&self, topic: &str, payload: serde_json::Value) {
        if let Some(subs) = self.topics.borrow().get(topic) {
            for sub in subs {
                (sub.callback)(&payload);
            }
        }
    }

    fn subscribe(&self, topic: &str, callback: Box<dyn Fn(&serde_json::Value)>) -> SubscriptionId {
        let id = {
            let mut next = self.next_id.borrow_mut();
            *next += 1;
            *next
        };
        self.topics
            .borrow_mut()
            .entry(topic.to_string())
            .or_default()
            .push(Subscriber { id, callback });
        id
    }

    fn unsubscribe(&self, topic: &str, id: SubscriptionId) {
        if let Some(subs) = self.topics.borrow_mut().get_mut(topic) {
            subs.retain(|s| s.id != id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::Cell;

    #[test]
    fn test_emit_reaches_subscriber() {
        let bus = InMemoryEventBus::new();
        let count = Rc::new(Cell::new(0));
        let count2 = count.clone();
        bus.subscribe(
            "stage-change",
            Box::new(move |_payload| {
                count2.set(count2.get() + 1);
            }),
        );
        bus.emit("stage-change", serde_json::json!({"name": "Start"}));
        bus.emit("other-topic", serde_json::json!({}));
        assert_eq!(count.get(), 1);
    }

    #[test]
    fn test_unsubscribe_stops_delivery() {
        let bus = InMemoryEventBus::new();
        let count = Rc::new(Cell::new(0));
        let count2 = count.clone();
        let id = bus.subscribe(
            "new-invite",
            Box::new(move |_| {
                count2.set(count2.get() + 1);
            }),
        );
        bus.emit("new-invite", serde_json::json!("a"));
        bus.unsubscribe("new-invite", id);
        bus.emit("new-invite", serde_json::json!("b"));
        assert_eq!(count.get(), 1);
    }
}
