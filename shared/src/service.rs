use std::collections::HashMap;

use log::warn;

use crate::{
    message::{DomainType, ServiceRef},
    types::ServiceId,
};

/// Directory request filter bits selecting which service description
/// categories the provider should include.
pub const DIRECTORY_FILTER_INFO: u32 = 0x01;
pub const DIRECTORY_FILTER_STATE: u32 = 0x02;
pub const DIRECTORY_FILTER_GROUP: u32 = 0x04;

/// Whether a service is currently able to serve data.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ServiceState {
    Up,
    Down,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum QosTimeliness {
    RealTime,
    Delayed,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum QosRate {
    TickByTick,
    JustInTimeConflated,
}

/// Quality of service a service advertises for its streams.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct Qos {
    pub timeliness: QosTimeliness,
    pub rate: QosRate,
}

impl Qos {
    pub fn realtime() -> Self {
        Self {
            timeliness: QosTimeliness::RealTime,
            rate: QosRate::TickByTick,
        }
    }
}

/// Description of one provider service as carried in the directory.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Service {
    pub id: ServiceId,
    pub name: String,
    pub state: ServiceState,
    pub capabilities: Vec<DomainType>,
    pub qos: Vec<Qos>,
}

impl Service {
    pub fn new(id: ServiceId, name: impl Into<String>, capabilities: Vec<DomainType>) -> Self {
        Self {
            id,
            name: name.into(),
            state: ServiceState::Up,
            capabilities,
            qos: vec![Qos::realtime()],
        }
    }

    pub fn supports(&self, domain: DomainType) -> bool {
        self.capabilities.contains(&domain)
    }
}

/// Partial change to an already-known service, keyed by identifier.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ServiceUpdate {
    pub id: ServiceId,
    pub state: Option<ServiceState>,
    pub capabilities: Option<Vec<DomainType>>,
    pub qos: Option<Vec<Qos>>,
}

impl ServiceUpdate {
    pub fn state(id: ServiceId, state: ServiceState) -> Self {
        Self {
            id,
            state: Some(state),
            capabilities: None,
            qos: None,
        }
    }
}

/// One action in a directory refresh or update payload.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ServiceAction {
    Add(Service),
    Update(ServiceUpdate),
    Delete(ServiceId),
}

/// Change surfaced by applying a directory action to the cache.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ServiceEvent {
    Added(ServiceId),
    StateChanged(ServiceId, ServiceState),
    Removed(ServiceId, String),
}

/// Cache of known services, addressable by identifier and by name.
///
/// Mutated only by directory refresh/update messages; request routing
/// consults it but never writes to it.
#[derive(Default)]
pub struct ServiceDirectory {
    by_id: HashMap<ServiceId, Service>,
    name_to_id: HashMap<String, ServiceId>,
}

impl ServiceDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn clear(&mut self) {
        self.by_id.clear();
        self.name_to_id.clear();
    }

    pub fn len(&self) -> usize {
        self.by_id.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_id.is_empty()
    }

    pub fn get(&self, id: ServiceId) -> Option<&Service> {
        self.by_id.get(&id)
    }

    pub fn get_by_name(&self, name: &str) -> Option<&Service> {
        self.name_to_id.get(name).and_then(|id| self.by_id.get(id))
    }

    pub fn resolve(&self, service: &ServiceRef) -> Option<&Service> {
        match service {
            ServiceRef::Id(id) => self.get(*id),
            ServiceRef::Name(name) => self.get_by_name(name),
        }
    }

    pub fn services(&self) -> impl Iterator<Item = &Service> {
        self.by_id.values()
    }

    /// Applies one directory action, returning the externally relevant
    /// change if there was one.
    pub fn apply(&mut self, action: ServiceAction) -> Option<ServiceEvent> {
        match action {
            ServiceAction::Add(service) => {
                let id = service.id;
                let state = service.state;
                match self.by_id.insert(id, service) {
                    None => {
                        let name = self.by_id[&id].name.clone();
                        self.name_to_id.insert(name, id);
                        Some(ServiceEvent::Added(id))
                    }
                    Some(previous) => {
                        let name = self.by_id[&id].name.clone();
                        if previous.name != name {
                            self.name_to_id.remove(&previous.name);
                            self.name_to_id.insert(name, id);
                        }
                        if previous.state != state {
                            Some(ServiceEvent::StateChanged(id, state))
                        } else {
                            None
                        }
                    }
                }
            }
            ServiceAction::Update(update) => {
                let Some(service) = self.by_id.get_mut(&update.id) else {
                    warn!(
                        "Directory update for unknown service {}; dropping",
                        update.id
                    );
                    return None;
                };
                if let Some(capabilities) = update.capabilities {
                    service.capabilities = capabilities;
                }
                if let Some(qos) = update.qos {
                    service.qos = qos;
                }
                if let Some(state) = update.state {
                    if service.state != state {
                        service.state = state;
                        return Some(ServiceEvent::StateChanged(update.id, state));
                    }
                }
                None
            }
            ServiceAction::Delete(id) => {
                let service = self.by_id.remove(&id)?;
                self.name_to_id.remove(&service.name);
                Some(ServiceEvent::Removed(id, service.name))
            }
        }
    }
}
