use crate::RequestError;
use std::{
    any::{type_name, Any, TypeId},
    collections::HashMap,
    fmt,
    sync::Arc,
};
use util::post_inc;

/// Registry of session services keyed by capability type.
///
/// Several providers may register for the same capability; lookups return the one with
/// the highest priority, ties going to the earliest registration. Unregistering a provider
/// only removes it from the registry, callers that already hold its `Arc` keep using it.
#[derive(Default)]
pub struct ServicesTracker {
    services: HashMap<TypeId, Vec<Entry>>,
    next_id: u64,
}

struct Entry {
    id: u64,
    priority: i32,
    name: &'static str,
    service: Box<dyn Any + Send + Sync>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct ServiceRegistration {
    type_id: TypeId,
    id: u64,
}

impl ServicesTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register<T: ?Sized + Send + Sync + 'static>(
        &mut self,
        service: Arc<T>,
        priority: i32,
    ) -> ServiceRegistration {
        let type_id = TypeId::of::<Arc<T>>();
        let id = post_inc(&mut self.next_id);
        let entries = self.services.entry(type_id).or_default();
        let position = entries
            .iter()
            .position(|entry| entry.priority < priority)
            .unwrap_or(entries.len());
        entries.insert(
            position,
            Entry {
                id,
                priority,
                name: type_name::<T>(),
                service: Box::new(service),
            },
        );
        log::debug!("registered service {} with priority {priority}", type_name::<T>());
        ServiceRegistration { type_id, id }
    }

    pub fn unregister(&mut self, registration: ServiceRegistration) -> bool {
        let Some(entries) = self.services.get_mut(&registration.type_id) else {
            return false;
        };
        let Some(position) = entries.iter().position(|entry| entry.id == registration.id) else {
            return false;
        };
        let entry = entries.remove(position);
        log::debug!("unregistered service {}", entry.name);
        if entries.is_empty() {
            self.services.remove(&registration.type_id);
        }
        true
    }

    pub fn get<T: ?Sized + Send + Sync + 'static>(&self) -> Option<Arc<T>> {
        self.services
            .get(&TypeId::of::<Arc<T>>())?
            .iter()
            .find_map(|entry| entry.service.downcast_ref::<Arc<T>>().cloned())
    }

    pub fn get_all<T: ?Sized + Send + Sync + 'static>(&self) -> Vec<Arc<T>> {
        self.services
            .get(&TypeId::of::<Arc<T>>())
            .into_iter()
            .flatten()
            .filter_map(|entry| entry.service.downcast_ref::<Arc<T>>().cloned())
            .collect()
    }

    pub fn require<T: ?Sized + Send + Sync + 'static>(&self) -> Result<Arc<T>, RequestError> {
        self.get::<T>()
            .ok_or_else(|| RequestError::ServiceUnavailable(type_name::<T>().to_string()))
    }

    pub fn len(&self) -> usize {
        self.services.values().map(Vec::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.services.is_empty()
    }

    pub fn clear(&mut self) {
        for entry in self.services.drain().flat_map(|(_, entries)| entries) {
            log::debug!("unregistered service {}", entry.name);
        }
    }
}

impl fmt::Debug for ServicesTracker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list()
            .entries(self.services.values().flatten().map(|entry| entry.name))
            .finish()
    }
}
