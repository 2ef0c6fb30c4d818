//! Presence Module
//!
//! Tracks which trusted contacts are currently sharing, from
//! `contact_started` / `contact_ended` / `contact_location` messages.

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::debug;

use crate::protocol::{InboundMessage, UserId};
use crate::registry::{ListenerRegistry, Subscription};

/// What we know about one sharing contact
#[derive(Debug, Clone, PartialEq)]
pub struct ContactPresence {
    pub user_id: UserId,
    pub since: DateTime<Utc>,
    /// Last relayed `(lat, lng)`, if the server forwarded one
    pub last_position: Option<(f64, f64)>,
}

type PresenceMap = Arc<Mutex<HashMap<UserId, ContactPresence>>>;

/// Local presence map fed by the listener registry
pub struct PresenceObserver {
    contacts: PresenceMap,
    subscription: Subscription,
}

impl PresenceObserver {
    pub fn attach(registry: &ListenerRegistry) -> Self {
        let contacts: PresenceMap = Arc::default();
        let map = Arc::clone(&contacts);

        let subscription = registry.subscribe(move |message| {
            apply(&mut map.lock(), message);
            Ok(())
        });

        Self { contacts, subscription }
    }

    pub fn is_sharing(&self, user_id: UserId) -> bool {
        self.contacts.lock().contains_key(&user_id)
    }

    pub fn get(&self, user_id: UserId) -> Option<ContactPresence> {
        self.contacts.lock().get(&user_id).cloned()
    }

    /// Ids of every contact currently sharing, ascending
    pub fn sharing_contacts(&self) -> Vec<UserId> {
        let mut ids: Vec<UserId> = self.contacts.lock().keys().copied().collect();
        ids.sort();
        ids
    }

    /// Stop observing. The map keeps its last contents.
    pub fn detach(&self) {
        self.subscription.unsubscribe();
    }

    pub fn is_attached(&self) -> bool {
        self.subscription.is_active()
    }
}

fn apply(contacts: &mut HashMap<UserId, ContactPresence>, message: &InboundMessage) {
    match message {
        InboundMessage::ContactStarted { user_id } => {
            debug!(%user_id, "Contact started sharing");
            contacts.entry(*user_id).or_insert_with(|| ContactPresence {
                user_id: *user_id,
                since: Utc::now(),
                last_position: None,
            });
        }
        InboundMessage::ContactEnded { user_id } => {
            debug!(%user_id, "Contact stopped sharing");
            contacts.remove(user_id);
        }
        InboundMessage::ContactLocation { user_id, lat, lng, .. } => {
            let entry = contacts.entry(*user_id).or_insert_with(|| ContactPresence {
                user_id: *user_id,
                since: Utc::now(),
                last_position: None,
            });
            entry.last_position = Some((*lat, *lng));
        }
        InboundMessage::SessionStarted { .. } | InboundMessage::Unknown => {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn two_observers_track_the_same_contact() {
        let registry = ListenerRegistry::new();
        let first = PresenceObserver::attach(&registry);
        let second = PresenceObserver::attach(&registry);

        registry.dispatch(&InboundMessage::ContactStarted { user_id: UserId(42) });
        assert!(first.is_sharing(UserId(42)));
        assert!(second.is_sharing(UserId(42)));

        registry.dispatch(&InboundMessage::ContactEnded { user_id: UserId(42) });
        assert!(!first.is_sharing(UserId(42)));
        assert!(!second.is_sharing(UserId(42)));
    }

    #[test]
    fn location_updates_position_and_marks_sharing() {
        let registry = ListenerRegistry::new();
        let observer = PresenceObserver::attach(&registry);

        registry.dispatch(&InboundMessage::ContactStarted { user_id: UserId(5) });
        let since = observer.get(UserId(5)).unwrap().since;
        registry.dispatch(&InboundMessage::ContactLocation {
            user_id: UserId(5),
            lat: 34.68,
            lng: -82.83,
            accuracy: None,
        });
        registry.dispatch(&InboundMessage::ContactLocation {
            user_id: UserId(9),
            lat: 1.0,
            lng: 2.0,
            accuracy: Some(3.0),
        });

        let five = observer.get(UserId(5)).unwrap();
        assert_eq!(five.last_position, Some((34.68, -82.83)));
        assert_eq!(five.since, since);
        assert_eq!(observer.sharing_contacts(), vec![UserId(5), UserId(9)]);
    }

    #[test]
    fn unrelated_messages_are_ignored() {
        let registry = ListenerRegistry::new();
        let observer = PresenceObserver::attach(&registry);

        registry.dispatch(&InboundMessage::Unknown);
        registry.dispatch(&InboundMessage::SessionStarted {
            session_id: crate::protocol::SessionId(1),
        });
        assert!(observer.sharing_contacts().is_empty());
    }

    #[test]
    fn detached_observer_stops_updating() {
        let registry = ListenerRegistry::new();
        let observer = PresenceObserver::attach(&registry);

        observer.detach();
        assert!(!observer.is_attached());
        registry.dispatch(&InboundMessage::ContactStarted { user_id: UserId(1) });
        assert!(!observer.is_sharing(UserId(1)));
    }
}
