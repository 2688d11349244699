use std::collections::HashMap;

use uuid::Uuid;

use crate::message::{Message, MessageFilter, MessageHandler};

/// A single registration on a topic: the callback plus an ordered list
/// of predicates that must all pass before the callback runs.
#[derive(Clone)]
pub struct Subscription {
    pub id: Uuid,
    pub handler: MessageHandler,
    pub filters: Vec<MessageFilter>,
}

impl Subscription {
    /// Applies the filters in registration order, stopping at the first
    /// one that rejects.
    pub fn accepts(&self, message: &Message) -> bool {
        self.filters.iter().all(|f| f(message))
    }
}

/// In-process topic channel. The channel exists exactly as long as it has
/// subscribers; the broker opens it on the first subscribe and closes it
/// when the last subscription is removed.
#[derive(Default)]
pub struct TopicChannel {
    subscriptions: HashMap<Uuid, Subscription>,
}

impl TopicChannel {
    pub fn subscribe(&mut self, handler: MessageHandler, filters: Vec<MessageFilter>) -> Uuid {
        let id = Uuid::new_v4();
        self.subscriptions.insert(
            id,
            Subscription {
                id,
                handler,
                filters,
            },
        );
        id
    }

    pub fn unsubscribe(&mut self, id: &Uuid) -> bool {
        self.subscriptions.remove(id).is_some()
    }

    pub fn is_empty(&self) -> bool {
        self.subscriptions.is_empty()
    }

    pub fn len(&self) -> usize {
        self.subscriptions.len()
    }

    /// Snapshot the current subscriptions so dispatch never holds the
    /// registry lock across handler calls.
    pub fn snapshot(&self) -> Vec<Subscription> {
        self.subscriptions.values().cloned().collect()
    }
}
