// Events - synchronous publish/subscribe streams for change notifications

use std::fmt;
use std::sync::Arc;

use crate::core::data_value::DataValue;
use crate::core::entity_state::EntityAction;
use crate::core::strong_types::EntityId;
use crate::ent_framework::validators::ValidationError;

pub type SubscriptionId = u64;

type Handler<T> = Arc<dyn Fn(&T) + Send + Sync>;

/// A named notification stream. Handlers run synchronously, in
/// subscription order, on the publishing thread.
pub struct Event<T> {
    name: &'static str,
    handlers: Vec<(SubscriptionId, Handler<T>)>,
    next_id: SubscriptionId,
    enabled: bool,
}

impl<T> Event<T> {
    pub fn new(name: &'static str) -> Self {
        Self {
            name,
            handlers: Vec::new(),
            next_id: 1,
            enabled: true,
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn subscribe<F>(&mut self, handler: F) -> SubscriptionId
    where
        F: Fn(&T) + Send + Sync + 'static,
    {
        let id = self.next_id;
        self.next_id += 1;
        self.handlers.push((id, Arc::new(handler)));
        id
    }

    pub fn unsubscribe(&mut self, id: SubscriptionId) -> bool {
        let before = self.handlers.len();
        self.handlers.retain(|(sid, _)| *sid != id);
        self.handlers.len() != before
    }

    pub fn has_subscribers(&self) -> bool {
        !self.handlers.is_empty()
    }

    pub fn set_enabled(&mut self, enabled: bool) {
        self.enabled = enabled;
    }

    /// Returns false when nothing was notified.
    pub fn publish(&self, args: &T) -> bool {
        if !self.enabled || self.handlers.is_empty() {
            return false;
        }
        for (_, handler) in &self.handlers {
            handler(args);
        }
        true
    }

    pub fn clear(&mut self) {
        self.handlers.clear();
    }
}

impl<T> fmt::Debug for Event<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Event")
            .field("name", &self.name)
            .field("subscribers", &self.handlers.len())
            .finish()
    }
}

/// Value carried by a property change: data, a scalar navigation target or
/// a collection's members.
#[derive(Debug, Clone, PartialEq)]
pub enum PropertyValue {
    Data(DataValue),
    Entity(Option<EntityId>),
    Entities(Vec<EntityId>),
}

impl From<DataValue> for PropertyValue {
    fn from(value: DataValue) -> Self {
        PropertyValue::Data(value)
    }
}

impl From<Option<EntityId>> for PropertyValue {
    fn from(value: Option<EntityId>) -> Self {
        PropertyValue::Entity(value)
    }
}

impl From<EntityId> for PropertyValue {
    fn from(value: EntityId) -> Self {
        PropertyValue::Entity(Some(value))
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct PropertyChangedArgs {
    pub entity: EntityId,
    pub property_name: String,
    pub old_value: PropertyValue,
    pub new_value: PropertyValue,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ValidationErrorsChangedArgs {
    pub entity: EntityId,
    pub added: Vec<ValidationError>,
    pub removed: Vec<ValidationError>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ArrayChangedArgs {
    pub parent: EntityId,
    pub navigation_property: String,
    pub added: Vec<EntityId>,
    pub removed: Vec<EntityId>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct EntityChangedArgs {
    pub action: EntityAction,
    /// `None` for manager-wide actions such as `Clear`.
    pub entity: Option<EntityId>,
    pub property_name: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HasChangesChangedArgs {
    pub has_changes: bool,
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    #[test]
    fn test_subscribe_publish_unsubscribe() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let mut event: Event<HasChangesChangedArgs> = Event::new("hasChangesChanged");
        let sink = seen.clone();
        let id = event.subscribe(move |args| sink.lock().unwrap().push(args.has_changes));

        assert!(event.publish(&HasChangesChangedArgs { has_changes: true }));
        event.set_enabled(false);
        assert!(!event.publish(&HasChangesChangedArgs { has_changes: false }));
        event.set_enabled(true);
        assert!(event.unsubscribe(id));
        assert!(!event.publish(&HasChangesChangedArgs { has_changes: false }));

        assert_eq!(*seen.lock().unwrap(), vec![true]);
    }
}
