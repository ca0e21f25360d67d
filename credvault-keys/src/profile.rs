//! Enrolment profile lifecycle.
//!
//! A profile describes one credential requirement pushed from the
//! management server. Each profile moves through a small state machine:
//!
//! ```text
//! ImportDue -> ImportNow -> Imported -> Modified  -> ImportNow
//!     ^                         |    \-> RenewalDue -> ImportNow
//!     |                         |           |      \-> Imported (renewal)
//!     +--- expiry w/o renewal --|-----------+
//!                               v
//!                           Deleted (from any state)
//! ```
//!
//! State changes are announced to registered listeners from a single
//! delivery thread, so callbacks never run concurrently and always observe
//! events in order. Registration is per profile type; events that occurred
//! before a listener registered are collapsed to one callback per profile
//! carrying its current state only.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{mpsc, Arc, Mutex};
use std::thread::{self, JoinHandle};

use serde::{Deserialize, Serialize};

use credvault_common::{Component, Logger};

use crate::certificate::{unix_now, CertificateInfo};
use crate::error::{CredError, Result};
use crate::store::{CredentialStore, ProfileMapper};

/// Provider type of an enrolment profile.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ProfileType {
    Unknown,
    AppBased,
    DeviceKeystore,
    UserCertificate,
    AssistedScep,
    Entrust,
    PkiConnector,
}

/// Lifecycle state of a profile.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum ProfileState {
    /// A credential is required but none has been imported yet.
    ImportDue,
    /// Import has been requested and user interaction is expected now.
    ImportNow,
    /// A credential satisfying the profile is in the store.
    Imported,
    /// The profile changed on the server after its credential was imported.
    Modified,
    /// The imported credential is inside its renewal window.
    RenewalDue,
    /// The profile was removed on the server. Terminal.
    Deleted,
}

/// An enrolment profile as assigned to the end user.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CredentialsProfile {
    pub id: String,
    pub name: String,
    pub profile_type: ProfileType,
    pub state: ProfileState,
    /// Whether the container treats a missing credential as blocking.
    pub required: bool,
    /// Provider-specific settings from the server, uninterpreted except for
    /// the mapping criteria keys.
    pub settings: HashMap<String, String>,
}

/// A state change notification for one profile.
#[derive(Debug, Clone)]
pub struct ProfileEvent {
    pub profile_id: String,
    pub profile_type: ProfileType,
    pub state: ProfileState,
    /// `None` for collapsed backlog delivery at registration time.
    pub previous_state: Option<ProfileState>,
}

/// Receives profile state changes. Callbacks run on the delivery thread;
/// implementations must not block for long.
pub trait ProfileListener: Send + Sync {
    fn on_profile_event(&self, event: ProfileEvent);
}

/// Handle for unregistering a listener.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ListenerHandle(u64);

struct Registration {
    id: u64,
    types: Vec<ProfileType>,
    listener: Arc<dyn ProfileListener>,
}

enum DeliveryMessage {
    Broadcast(ProfileEvent),
    Directed {
        listener_id: u64,
        events: Vec<ProfileEvent>,
    },
    Shutdown,
}

type Listeners = Arc<Mutex<Vec<Registration>>>;

/// Owns assigned profiles, validates their state transitions and fans out
/// change events.
pub struct ProfileLifecycleManager {
    profiles: Mutex<HashMap<String, CredentialsProfile>>,
    listeners: Listeners,
    sender: mpsc::Sender<DeliveryMessage>,
    delivery: Mutex<Option<JoinHandle<()>>>,
    next_listener_id: AtomicU64,
    logger: Arc<Logger>,
}

impl ProfileLifecycleManager {
    pub fn new(logger: &Logger) -> Self {
        let logger = Arc::new(logger.with_component(Component::Profile));
        let listeners: Listeners = Arc::new(Mutex::new(Vec::new()));
        let (sender, receiver) = mpsc::channel::<DeliveryMessage>();

        let thread_listeners = Arc::clone(&listeners);
        let delivery = thread::spawn(move || {
            while let Ok(message) = receiver.recv() {
                match message {
                    DeliveryMessage::Broadcast(event) => {
                        let registrations =
                            thread_listeners.lock().unwrap_or_else(|e| e.into_inner());
                        for reg in registrations.iter() {
                            if reg.types.contains(&event.profile_type) {
                                reg.listener.on_profile_event(event.clone());
                            }
                        }
                    }
                    DeliveryMessage::Directed {
                        listener_id,
                        events,
                    } => {
                        let registrations =
                            thread_listeners.lock().unwrap_or_else(|e| e.into_inner());
                        if let Some(reg) =
                            registrations.iter().find(|r| r.id == listener_id)
                        {
                            for event in events {
                                reg.listener.on_profile_event(event);
                            }
                        }
                    }
                    DeliveryMessage::Shutdown => break,
                }
            }
        });

        Self {
            profiles: Mutex::new(HashMap::new()),
            listeners,
            sender,
            delivery: Mutex::new(Some(delivery)),
            next_listener_id: AtomicU64::new(1),
            logger,
        }
    }

    /// Register a listener for the given profile types. Registration is
    /// typed only; an empty type list is a caller error.
    ///
    /// Events from before registration are collapsed: the listener receives
    /// one immediate callback per matching profile with its current state,
    /// not the history that led there.
    pub fn register(
        &self,
        listener: Arc<dyn ProfileListener>,
        types: &[ProfileType],
    ) -> Result<ListenerHandle> {
        if types.is_empty() {
            return Err(CredError::InvalidArgument(
                "listener registration requires at least one profile type".to_string(),
            ));
        }
        let id = self.next_listener_id.fetch_add(1, Ordering::Relaxed);

        let backlog: Vec<ProfileEvent> = {
            let profiles = self.profiles.lock().unwrap_or_else(|e| e.into_inner());
            profiles
                .values()
                .filter(|p| types.contains(&p.profile_type))
                .map(|p| ProfileEvent {
                    profile_id: p.id.clone(),
                    profile_type: p.profile_type,
                    state: p.state,
                    previous_state: None,
                })
                .collect()
        };

        {
            let mut registrations = self.listeners.lock().unwrap_or_else(|e| e.into_inner());
            registrations.push(Registration {
                id,
                types: types.to_vec(),
                listener,
            });
        }
        if !backlog.is_empty() {
            let _ = self.sender.send(DeliveryMessage::Directed {
                listener_id: id,
                events: backlog,
            });
        }
        Ok(ListenerHandle(id))
    }

    /// Remove a listener. Events already queued for it may still arrive.
    pub fn unregister(&self, handle: ListenerHandle) {
        let mut registrations = self.listeners.lock().unwrap_or_else(|e| e.into_inner());
        registrations.retain(|r| r.id != handle.0);
    }

    /// Whether any current listener covers this profile type.
    pub fn is_type_registered(&self, profile_type: ProfileType) -> bool {
        let registrations = self.listeners.lock().unwrap_or_else(|e| e.into_inner());
        registrations.iter().any(|r| r.types.contains(&profile_type))
    }

    /// Add or update a profile from a server sync.
    ///
    /// A new profile starts in `ImportDue`. An update to a profile whose
    /// credential is already imported moves it to `Modified`; updates in
    /// other states keep the current state.
    pub fn upsert_profile(
        &self,
        id: impl Into<String>,
        name: impl Into<String>,
        profile_type: ProfileType,
        required: bool,
        settings: HashMap<String, String>,
    ) -> Result<()> {
        let id = id.into();
        let name = name.into();
        let mut profiles = self.profiles.lock().unwrap_or_else(|e| e.into_inner());
        match profiles.get_mut(&id) {
            Some(existing) => {
                if existing.profile_type != profile_type {
                    return Err(CredError::InvalidArgument(format!(
                        "profile '{id}' cannot change type from {:?} to {profile_type:?}",
                        existing.profile_type
                    )));
                }
                existing.name = name;
                existing.required = required;
                existing.settings = settings;
                if existing.state == ProfileState::Imported {
                    let previous = existing.state;
                    existing.state = ProfileState::Modified;
                    let event = event_for(existing, Some(previous));
                    drop(profiles);
                    self.emit(event);
                }
            }
            None => {
                let profile = CredentialsProfile {
                    id: id.clone(),
                    name,
                    profile_type,
                    state: ProfileState::ImportDue,
                    required,
                    settings,
                };
                self.logger
                    .info(format!("assigned profile '{id}' ({profile_type:?})"));
                let event = event_for(&profile, None);
                profiles.insert(id, profile);
                drop(profiles);
                self.emit(event);
            }
        }
        Ok(())
    }

    /// Mark a profile deleted on the server. The profile leaves the
    /// assigned set after the event is announced.
    pub fn delete_profile(&self, id: &str) -> Result<()> {
        let mut profiles = self.profiles.lock().unwrap_or_else(|e| e.into_inner());
        let mut profile = profiles.remove(id).ok_or_else(|| {
            CredError::InvalidArgument(format!("unknown profile '{id}'"))
        })?;
        let previous = profile.state;
        profile.state = ProfileState::Deleted;
        self.logger.info(format!("profile '{id}' deleted"));
        let event = event_for(&profile, Some(previous));
        drop(profiles);
        self.emit(event);
        Ok(())
    }

    /// Request immediate enrolment interaction for one profile.
    ///
    /// Ignored for profiles not in an enrolment-eligible state, including
    /// deleted or never-assigned ids; returns whether the profile actually
    /// moved to `ImportNow`.
    pub fn begin_enrolment(&self, id: &str) -> Result<bool> {
        Ok(self.transition_if_allowed(id, ProfileState::ImportNow))
    }

    /// Request immediate enrolment for every profile of a type. Profiles
    /// not in an enrolment-eligible state are skipped. Returns how many
    /// profiles were moved to `ImportNow`.
    pub fn begin_enrolment_type(&self, profile_type: ProfileType) -> usize {
        let ids: Vec<String> = {
            let profiles = self.profiles.lock().unwrap_or_else(|e| e.into_inner());
            profiles
                .values()
                .filter(|p| p.profile_type == profile_type)
                .map(|p| p.id.clone())
                .collect()
        };
        let mut moved = 0;
        for id in ids {
            if self.transition_if_allowed(&id, ProfileState::ImportNow) {
                moved += 1;
            }
        }
        moved
    }

    /// Record that a credential satisfying the profile was committed. A
    /// further credential landing on an already satisfied profile keeps it
    /// in `Imported`.
    pub fn mark_imported(&self, id: &str) -> Result<()> {
        if self.transition_if_allowed(id, ProfileState::Imported) {
            return Ok(());
        }
        match self.profile(id).map(|p| p.state) {
            Some(ProfileState::Imported) => Ok(()),
            Some(state) => Err(CredError::InvalidArgument(format!(
                "profile '{id}' cannot accept an import in state {state:?}"
            ))),
            None => Err(CredError::InvalidArgument(format!("unknown profile '{id}'"))),
        }
    }

    /// Sweep committed credentials: profiles whose credential has entered
    /// its renewal window move to `RenewalDue`, and profiles whose
    /// credentials have all expired without renewal fall back to
    /// `ImportDue`. Returns the ids of profiles that changed state.
    pub fn evaluate_renewals(&self, store: &CredentialStore) -> Vec<String> {
        self.evaluate_renewals_at(store, unix_now())
    }

    pub fn evaluate_renewals_at(&self, store: &CredentialStore, at: i64) -> Vec<String> {
        let (renewal_due, expired): (Vec<String>, Vec<String>) = {
            let profiles = self.profiles.lock().unwrap_or_else(|e| e.into_inner());
            let renewal_due = profiles
                .values()
                .filter(|p| p.state == ProfileState::Imported)
                .filter(|p| {
                    store
                        .list_for_profile(&p.id)
                        .iter()
                        .any(|c| c.leaf.days_until_renewal_due_at(at) <= 0)
                })
                .map(|p| p.id.clone())
                .collect();
            let expired = profiles
                .values()
                .filter(|p| p.state == ProfileState::RenewalDue)
                .filter(|p| {
                    let credentials = store.list_for_profile(&p.id);
                    !credentials.is_empty()
                        && credentials.iter().all(|c| !c.leaf.is_valid_at(at))
                })
                .map(|p| p.id.clone())
                .collect();
            (renewal_due, expired)
        };
        let mut moved = Vec::new();
        for id in &renewal_due {
            if self.transition_if_allowed(id, ProfileState::RenewalDue) {
                moved.push(id.clone());
            }
        }
        for id in &expired {
            if self.transition_if_allowed(id, ProfileState::ImportDue) {
                moved.push(id.clone());
            }
        }
        moved
    }

    /// Whether a reset of this profile type would do anything: true iff
    /// at least one credential is currently managed for a profile of the
    /// type.
    pub fn can_reset_type(&self, profile_type: ProfileType, store: &CredentialStore) -> bool {
        let profiles = self.profiles.lock().unwrap_or_else(|e| e.into_inner());
        profiles
            .values()
            .filter(|p| p.profile_type == profile_type)
            .any(|p| !store.list_for_profile(&p.id).is_empty())
    }

    /// Destructive reset of a profile family: every managed credential of
    /// the type leaves the store and each profile returns to `ImportDue`,
    /// regardless of current state. One event per affected profile.
    /// Refused when [`can_reset_type`](Self::can_reset_type) is false.
    pub fn reset_type(&self, profile_type: ProfileType, store: &CredentialStore) -> Result<usize> {
        if !self.can_reset_type(profile_type, store) {
            return Err(CredError::NotAllowed(format!(
                "no managed credentials of type {profile_type:?} to reset"
            )));
        }
        let mut events = Vec::new();
        {
            let mut profiles = self.profiles.lock().unwrap_or_else(|e| e.into_inner());
            for profile in profiles.values_mut() {
                if profile.profile_type != profile_type {
                    continue;
                }
                store.remove_for_profile(&profile.id)?;
                if profile.state != ProfileState::ImportDue {
                    let previous = profile.state;
                    profile.state = ProfileState::ImportDue;
                    events.push(event_for(profile, Some(previous)));
                }
            }
        }
        let count = events.len();
        self.logger.info(format!(
            "reset {count} profile(s) of type {profile_type:?}"
        ));
        for event in events {
            self.emit(event);
        }
        Ok(count)
    }

    /// Days until the soonest expiry among a profile's managed
    /// credentials. `None` when the profile manages no credentials.
    pub fn days_until_expiry(&self, id: &str, store: &CredentialStore) -> Option<i64> {
        store
            .list_for_profile(id)
            .iter()
            .map(|c| c.leaf.days_until_expiry())
            .min()
    }

    /// Days until the soonest renewal-due instant among a profile's
    /// managed credentials. Negative once any credential is inside its
    /// renewal window.
    pub fn days_until_renewal_due(&self, id: &str, store: &CredentialStore) -> Option<i64> {
        store
            .list_for_profile(id)
            .iter()
            .map(|c| c.leaf.days_until_renewal_due())
            .min()
    }

    /// Snapshot of one profile.
    pub fn profile(&self, id: &str) -> Option<CredentialsProfile> {
        let profiles = self.profiles.lock().unwrap_or_else(|e| e.into_inner());
        profiles.get(id).cloned()
    }

    /// Snapshot of all assigned profiles.
    pub fn profiles(&self) -> Vec<CredentialsProfile> {
        let profiles = self.profiles.lock().unwrap_or_else(|e| e.into_inner());
        profiles.values().cloned().collect()
    }

    /// `false` when the profile is unknown or the transition is not valid
    /// from its current state; the profile is left untouched.
    fn transition_if_allowed(&self, id: &str, to: ProfileState) -> bool {
        let event = {
            let mut profiles = self.profiles.lock().unwrap_or_else(|e| e.into_inner());
            let profile = match profiles.get_mut(id) {
                Some(profile) => profile,
                None => return false,
            };
            if !transition_allowed(profile.state, to) {
                return false;
            }
            let previous = profile.state;
            profile.state = to;
            self.logger
                .debug(format!("profile '{id}': {previous:?} -> {to:?}"));
            event_for(profile, Some(previous))
        };
        self.emit(event);
        true
    }

    fn emit(&self, event: ProfileEvent) {
        let _ = self.sender.send(DeliveryMessage::Broadcast(event));
    }
}

impl ProfileMapper for ProfileLifecycleManager {
    /// Match a leaf certificate against the mapping criteria of assigned
    /// profiles. A profile with an `issuer` setting matches when that value
    /// occurs in the leaf's issuer DN; app-based profiles without criteria
    /// accept any credential. Deleted profiles never match.
    fn map_credential(&self, leaf: &CertificateInfo) -> Option<String> {
        let profiles = self.profiles.lock().unwrap_or_else(|e| e.into_inner());
        let mut fallback = None;
        for profile in profiles.values() {
            if profile.state == ProfileState::Deleted {
                continue;
            }
            match profile.settings.get("issuer") {
                Some(criterion) if leaf.issuer().contains(criterion.as_str()) => {
                    return Some(profile.id.clone());
                }
                Some(_) => {}
                None if profile.profile_type == ProfileType::AppBased => {
                    fallback.get_or_insert_with(|| profile.id.clone());
                }
                None => {}
            }
        }
        fallback
    }

    fn is_assigned(&self, profile_id: &str) -> bool {
        let profiles = self.profiles.lock().unwrap_or_else(|e| e.into_inner());
        profiles
            .get(profile_id)
            .map(|p| p.state != ProfileState::Deleted)
            .unwrap_or(false)
    }
}

impl Drop for ProfileLifecycleManager {
    fn drop(&mut self) {
        let _ = self.sender.send(DeliveryMessage::Shutdown);
        let handle = {
            let mut guard = self.delivery.lock().unwrap_or_else(|e| e.into_inner());
            guard.take()
        };
        if let Some(handle) = handle {
            let _ = handle.join();
        }
    }
}

fn event_for(profile: &CredentialsProfile, previous: Option<ProfileState>) -> ProfileEvent {
    ProfileEvent {
        profile_id: profile.id.clone(),
        profile_type: profile.profile_type,
        state: profile.state,
        previous_state: previous,
    }
}

/// The transition table. `Deleted` is reachable from anywhere but handled
/// by removal, and `Modified` is entered only via a server update.
fn transition_allowed(from: ProfileState, to: ProfileState) -> bool {
    use ProfileState::*;
    matches!(
        (from, to),
        (ImportDue, ImportNow)
            | (ImportNow, Imported)
            | (ImportDue, Imported)
            | (Modified, ImportNow)
            | (Modified, Imported)
            | (RenewalDue, ImportNow)
            // A renewal can be imported without user interaction.
            | (RenewalDue, Imported)
            // Expiry without renewal reopens the requirement.
            | (RenewalDue, ImportDue)
            | (Imported, RenewalDue)
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transition_table_rejects_backwards_moves() {
        use ProfileState::*;
        assert!(transition_allowed(ImportDue, ImportNow));
        assert!(transition_allowed(RenewalDue, Imported));
        assert!(!transition_allowed(Imported, ImportDue));
        assert!(!transition_allowed(Imported, ImportNow));
        assert!(!transition_allowed(ImportNow, RenewalDue));
    }

    #[test]
    fn typed_registration_requires_types() {
        struct Nop;
        impl ProfileListener for Nop {
            fn on_profile_event(&self, _event: ProfileEvent) {}
        }
        let manager =
            ProfileLifecycleManager::new(&Logger::new_root(Component::Service, "test"));
        let err = manager.register(Arc::new(Nop), &[]).unwrap_err();
        assert_eq!(err.code(), crate::error::ErrorCode::InvalidArgument);
    }

    #[test]
    fn profile_type_cannot_change_across_updates() {
        let manager =
            ProfileLifecycleManager::new(&Logger::new_root(Component::Service, "test"));
        manager
            .upsert_profile("p1", "VPN", ProfileType::AppBased, true, HashMap::new())
            .unwrap();
        let err = manager
            .upsert_profile("p1", "VPN", ProfileType::Entrust, true, HashMap::new())
            .unwrap_err();
        assert_eq!(err.code(), crate::error::ErrorCode::InvalidArgument);
    }
}
