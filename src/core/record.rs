//! Instance record - One deployment identity and what is attached to it

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, OnceLock, PoisonError, RwLock, TryLockError};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};
use uuid::Uuid;

use super::identity::DeploymentId;
use super::state::LaunchState;
use crate::bundle::BundleRef;
use crate::error::{error_chain, TeardownError};
use crate::isolation::statics::StaticStateCoordinator;
use crate::isolation::IsolationContext;
use crate::runner::{ApplicationRunner, Properties};

/// Externally visible status object, assigned once the record is registered
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatusHandle {
    pub deployment_id: DeploymentId,
    /// Stable across relaunches of the same record
    pub instance_id: Uuid,
    pub deployment_properties: Properties,
}

impl StatusHandle {
    pub fn new(deployment_id: DeploymentId, deployment_properties: Properties) -> Self {
        Self {
            deployment_id,
            instance_id: Uuid::new_v4(),
            deployment_properties,
        }
    }
}

/// Bookkeeping that changes with each launch
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RecordDetails {
    pub launched_at: Option<DateTime<Utc>>,
    pub terminated_at: Option<DateTime<Utc>>,
    pub launch_count: u32,
    pub last_error: Option<String>,
}

/// Context and runner of the current launch, both absent between launches
#[derive(Default)]
pub(crate) struct Attachment {
    pub(crate) context: Option<IsolationContext>,
    pub(crate) runner: Option<Box<dyn ApplicationRunner>>,
}

impl Attachment {
    pub(crate) fn is_attached(&self) -> bool {
        self.context.is_some() || self.runner.is_some()
    }

    /// Close the runner, release the context and purge what it left in
    /// process-wide statics
    ///
    /// Both halves are detached whatever fails; the first close or release
    /// error is returned. Purge failures are logged only.
    pub(crate) fn tear_down(
        &mut self,
        label: &str,
        coordinator: &StaticStateCoordinator,
    ) -> Result<(), TeardownError> {
        let mut failure = None;

        if let Some(mut runner) = self.runner.take() {
            if let Err(e) = runner.close() {
                failure = Some(e);
            }
        }

        if let Some(context) = self.context.take() {
            let context_id = context.id();
            if let Err(e) = context.release() {
                failure.get_or_insert(e);
            }
            match coordinator.purge(context_id) {
                Ok(report) => debug!(
                    "Purged {} registration(s) and {} slot(s) for {}",
                    report.deregistered,
                    report.cleared_slots,
                    label
                ),
                Err(e) => warn!("Static state purge for {} failed: {}", label, e),
            }
        }

        match failure {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}

impl Drop for Attachment {
    fn drop(&mut self) {
        if !self.is_attached() {
            return;
        }
        warn!("Instance record dropped while still attached, tearing it down");
        match self.context.as_ref().map(|c| Arc::clone(c.handle().globals())) {
            Some(globals) => {
                let coordinator = StaticStateCoordinator::new(globals, Vec::new());
                if let Err(e) = self.tear_down("dropped record", &coordinator) {
                    warn!("Teardown of dropped record failed: {}", error_chain(&e));
                }
            }
            None => {
                if let Some(Err(e)) = self.runner.take().map(|mut r| r.close()) {
                    warn!("Teardown of dropped record failed: {}", error_chain(&e));
                }
            }
        }
    }
}

/// Point-in-time copy of a record, for callers and logs
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RecordSnapshot {
    pub id: DeploymentId,
    pub bundle: BundleRef,
    pub name: String,
    pub profiles: Vec<String>,
    pub state: LaunchState,
    pub created_at: DateTime<Utc>,
    #[serde(flatten)]
    pub details: RecordDetails,
}

/// A deployment, owned by the registry and mutated in place by the engine
pub struct InstanceRecord {
    id: DeploymentId,
    bundle: BundleRef,
    name: String,
    profiles: Vec<String>,
    created_at: DateTime<Utc>,
    state: RwLock<LaunchState>,
    details: RwLock<RecordDetails>,
    status: OnceLock<StatusHandle>,
    attachment: Mutex<Attachment>,
    /// Set under the attachment lock once the record has left the registry
    retired: AtomicBool,
}

impl InstanceRecord {
    pub fn new(
        id: DeploymentId,
        bundle: BundleRef,
        name: impl Into<String>,
        profiles: Vec<String>,
    ) -> Self {
        Self {
            id,
            bundle,
            name: name.into(),
            profiles,
            created_at: Utc::now(),
            state: RwLock::new(LaunchState::Idle),
            details: RwLock::new(RecordDetails::default()),
            status: OnceLock::new(),
            attachment: Mutex::new(Attachment::default()),
            retired: AtomicBool::new(false),
        }
    }

    pub fn id(&self) -> &DeploymentId {
        &self.id
    }

    pub fn bundle(&self) -> &BundleRef {
        &self.bundle
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn profiles(&self) -> &[String] {
        &self.profiles
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    /// Last recorded state, without reaping
    pub fn current_state(&self) -> LaunchState {
        *self.state.read().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn details(&self) -> RecordDetails {
        self.details
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn last_error(&self) -> Option<String> {
        self.details().last_error
    }

    /// Assign the status object. Only the first assignment takes effect.
    pub fn assign_status(&self, status: StatusHandle) -> bool {
        self.status.set(status).is_ok()
    }

    pub fn status(&self) -> Option<&StatusHandle> {
        self.status.get()
    }

    /// Time since the current launch started, while it is active
    pub fn uptime(&self) -> Option<chrono::Duration> {
        if !self.current_state().is_active() {
            return None;
        }
        self.details().launched_at.map(|started| Utc::now() - started)
    }

    /// Uptime as `1d 2h`, `3h 4m`, `5m 6s` or `7s`, or `-` when stopped
    pub fn uptime_string(&self) -> String {
        let Some(uptime) = self.uptime() else {
            return "-".to_string();
        };
        let total = uptime.num_seconds().max(0);
        let (days, hours) = (total / 86_400, total / 3_600 % 24);
        let (minutes, seconds) = (total / 60 % 60, total % 60);
        match (days, hours, minutes) {
            (0, 0, 0) => format!("{seconds}s"),
            (0, 0, _) => format!("{minutes}m {seconds}s"),
            (0, _, _) => format!("{hours}h {minutes}m"),
            _ => format!("{days}d {hours}h"),
        }
    }

    /// Whether the record has been removed from its registry for good
    pub fn is_retired(&self) -> bool {
        self.retired.load(Ordering::SeqCst)
    }

    pub fn snapshot(&self) -> RecordSnapshot {
        RecordSnapshot {
            id: self.id.clone(),
            bundle: self.bundle.clone(),
            name: self.name.clone(),
            profiles: self.profiles.clone(),
            state: self.current_state(),
            created_at: self.created_at,
            details: self.details(),
        }
    }

    fn set_state(&self, state: LaunchState) {
        *self.state.write().unwrap_or_else(PoisonError::into_inner) = state;
    }

    fn update_details(&self, f: impl FnOnce(&mut RecordDetails)) {
        f(&mut self.details.write().unwrap_or_else(PoisonError::into_inner));
    }

    /// Mark the record as launching
    pub(crate) fn mark_launching(&self) {
        self.update_details(|d| {
            d.launched_at = Some(Utc::now());
            d.terminated_at = None;
            d.last_error = None;
            d.launch_count += 1;
        });
        self.set_state(LaunchState::Launching);
    }

    /// Mark the record as running
    pub(crate) fn mark_running(&self) {
        self.set_state(LaunchState::Running);
    }

    /// Mark the record as stopped in `state`, keeping `error` if given
    pub(crate) fn mark_terminated(&self, state: LaunchState, error: Option<String>) {
        self.update_details(|d| {
            d.terminated_at = Some(Utc::now());
            if error.is_some() {
                d.last_error = error;
            }
        });
        self.set_state(state);
    }

    /// Refuse further launches. Call with the attachment lock held.
    pub(crate) fn retire(&self) {
        self.retired.store(true, Ordering::SeqCst);
    }

    pub(crate) fn attachment(&self) -> MutexGuard<'_, Attachment> {
        self.attachment
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    /// The attachment, unless another thread is launching or tearing down
    pub(crate) fn try_attachment(&self) -> Option<MutexGuard<'_, Attachment>> {
        match self.attachment.try_lock() {
            Ok(guard) => Some(guard),
            Err(TryLockError::Poisoned(e)) => Some(e.into_inner()),
            Err(TryLockError::WouldBlock) => None,
        }
    }
}

impl std::fmt::Debug for InstanceRecord {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InstanceRecord")
            .field("id", &self.id)
            .field("bundle", &self.bundle)
            .field("state", &self.current_state())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record() -> InstanceRecord {
        InstanceRecord::new(
            DeploymentId::from_hex("abc123"),
            BundleRef::new("/srv/app"),
            "thin",
            vec!["prod".into()],
        )
    }

    #[test]
    fn new_record_is_idle_and_detached() {
        let record = record();
        assert_eq!(record.current_state(), LaunchState::Idle);
        assert!(!record.attachment().is_attached());
        assert_eq!(record.details().launch_count, 0);
        assert_eq!(record.uptime_string(), "-");
    }

    #[test]
    fn launch_bookkeeping() {
        let record = record();
        record.mark_launching();
        record.mark_terminated(LaunchState::Failed, Some("no entry point".into()));
        record.mark_launching();

        let details = record.details();
        assert_eq!(details.launch_count, 2);
        assert!(details.last_error.is_none());
        assert!(details.terminated_at.is_none());

        record.mark_running();
        assert!(record.uptime().is_some());
        assert_eq!(record.uptime_string(), "0s");
        record.mark_terminated(LaunchState::Cancelled, None);
        assert!(record.uptime().is_none());
    }

    #[test]
    fn status_is_assigned_once() {
        let record = record();
        let first = StatusHandle::new(record.id().clone(), Properties::new());
        let instance_id = first.instance_id;
        assert!(record.assign_status(first));
        assert!(!record.assign_status(StatusHandle::new(record.id().clone(), Properties::new())));
        assert_eq!(record.status().unwrap().instance_id, instance_id);
    }

    #[test]
    fn try_attachment_reports_contention() {
        let record = record();
        let held = record.attachment();
        assert!(record.try_attachment().is_none());
        drop(held);
        assert!(record.try_attachment().is_some());
    }

    #[test]
    fn snapshot_serializes_flat() {
        let record = record();
        record.mark_launching();
        let json = serde_json::to_value(record.snapshot()).unwrap();
        assert_eq!(json["state"], "launching");
        assert_eq!(json["launch_count"], 1);
        assert_eq!(json["name"], "thin");
    }
}
