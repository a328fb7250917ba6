//! Lifecycle engine - Launching, cancelling and reaping instance records

use std::sync::Arc;

use tracing::{debug, error, info, warn};

use super::record::{Attachment, InstanceRecord};
use super::state::LaunchState;
use crate::bundle::{BundleResolver, ResourceLocation};
use crate::error::{error_chain, LaunchError, TeardownError};
use crate::isolation::ambient::AmbientScope;
use crate::isolation::statics::StaticStateCoordinator;
use crate::isolation::{HostBoundary, IsolationContext};
use crate::platform;
use crate::runner::Properties;

/// Drives instance records through their lifecycle
pub struct LifecycleEngine {
    resolver: Arc<dyn BundleResolver>,
    host: Arc<HostBoundary>,
    coordinator: StaticStateCoordinator,
    leak_warning_threshold: usize,
    request_reclamation: bool,
}

impl LifecycleEngine {
    pub fn new(
        resolver: Arc<dyn BundleResolver>,
        host: Arc<HostBoundary>,
        reset_slots: Vec<String>,
    ) -> Self {
        let coordinator = StaticStateCoordinator::new(Arc::clone(host.globals()), reset_slots);
        Self {
            resolver,
            host,
            coordinator,
            leak_warning_threshold: 32,
            request_reclamation: true,
        }
    }

    /// Warn once more than this many released contexts stay reachable
    pub fn with_leak_warning_threshold(mut self, threshold: usize) -> Self {
        self.leak_warning_threshold = threshold;
        self
    }

    pub fn with_reclamation(mut self, enabled: bool) -> Self {
        self.request_reclamation = enabled;
        self
    }

    pub fn host(&self) -> &Arc<HostBoundary> {
        &self.host
    }

    pub fn coordinator(&self) -> &StaticStateCoordinator {
        &self.coordinator
    }

    /// Launch the record's bundle, blocking until it has started or failed
    ///
    /// Does nothing while a runner or context is still attached. Never fails:
    /// the outcome is the state the record settles in. A retired record is
    /// never launched again and answers `Unknown`.
    pub fn launch(
        &self,
        record: &InstanceRecord,
        properties: &Properties,
        args: &[String],
    ) -> LaunchState {
        let mut attachment = record.attachment();
        if record.is_retired() {
            debug!(
                "Deployment {} was removed, launch refused",
                record.id().short()
            );
            return LaunchState::Unknown;
        }
        if attachment.is_attached() {
            debug!(
                "Deployment {} is already attached, launch ignored",
                record.id().short()
            );
            return record.current_state();
        }

        info!("Launching {} as {}", record.bundle(), record.id().short());
        record.mark_launching();

        if let Err(e) = self.start(record, &mut attachment, properties, args) {
            let message = error_chain(&e);
            error!("Cannot deploy {}: {}", record.bundle(), message);
            if let Err(teardown) = self.teardown(record, &mut attachment) {
                error!(
                    "Cannot clean up failed launch of {}: {}",
                    record.bundle(),
                    error_chain(&teardown)
                );
            }
            record.mark_terminated(LaunchState::Failed, Some(message));
            return record.current_state();
        }

        let running = attachment.runner.as_ref().is_some_and(|r| r.is_running());
        if running {
            record.mark_running();
            info!("Deployment {} is running", record.id().short());
        } else {
            self.settle(record, &mut attachment);
        }
        record.current_state()
    }

    fn start(
        &self,
        record: &InstanceRecord,
        attachment: &mut Attachment,
        properties: &Properties,
        args: &[String],
    ) -> Result<(), LaunchError> {
        let bundle = record.bundle();
        let entry_point = self.resolver.find_main_entry_point(bundle)?;
        let dependencies =
            self.resolver
                .resolve_dependencies(bundle, record.name(), record.profiles())?;

        let mut resources = Vec::with_capacity(dependencies.len() + 1);
        if let Some(root) = bundle.absolute_path() {
            resources.push(ResourceLocation::new(root));
        }
        resources.extend(dependencies);

        let epoch = self.coordinator.begin_launch();
        if epoch.reset_count() > 0 {
            debug!(
                "Reset {} process-wide slot(s) before launching {}",
                epoch.reset_count(),
                record.id().short()
            );
        }

        let context = attachment
            .context
            .insert(IsolationContext::create(resources, Arc::clone(&self.host)));
        let _scope = AmbientScope::enter(context.handle());
        let runner = attachment.runner.insert(context.instantiate_runner()?);
        runner.run(&entry_point, properties, args);
        Ok(())
    }

    /// Cancel a running record, or reap one that has stopped on its own
    pub fn cancel(&self, record: &InstanceRecord) -> LaunchState {
        let mut attachment = record.attachment();
        self.stop(record, &mut attachment);
        record.current_state()
    }

    /// Cancel a record and refuse any later launch on it
    ///
    /// Used once the record has left the registry. A launch that already
    /// holds the record is either torn down here or sees the retirement and
    /// does nothing.
    pub fn retire(&self, record: &InstanceRecord) -> LaunchState {
        let mut attachment = record.attachment();
        record.retire();
        self.stop(record, &mut attachment);
        record.current_state()
    }

    fn stop(&self, record: &InstanceRecord, attachment: &mut Attachment) {
        let running = attachment.runner.as_ref().is_some_and(|r| r.is_running());

        if running {
            info!(
                "Cancelling deployment {} after {}",
                record.id().short(),
                record.uptime_string()
            );
            record.mark_terminated(LaunchState::Cancelled, None);
            if let Err(e) = self.teardown(record, attachment) {
                let message = error_chain(&e);
                error!("Cannot undeploy {}: {}", record.bundle(), message);
                record.mark_terminated(LaunchState::Error, Some(message));
            }
        } else if attachment.is_attached() {
            self.settle(record, attachment);
        } else {
            debug!(
                "Deployment {} has nothing to cancel ({})",
                record.id().short(),
                record.current_state()
            );
        }
    }

    /// Current state, reaping an application that stopped on its own
    ///
    /// While another thread is launching or cancelling the record, the last
    /// recorded state is returned without waiting.
    pub fn state(&self, record: &InstanceRecord) -> LaunchState {
        if let Some(mut attachment) = record.try_attachment() {
            let stopped = record.current_state() == LaunchState::Running
                && attachment.runner.as_ref().is_some_and(|r| !r.is_running());
            if stopped {
                info!(
                    "Deployment {} stopped on its own",
                    record.id().short()
                );
                self.settle(record, &mut attachment);
            }
        }
        record.current_state()
    }

    /// Tear down a stopped runner and record how it ended
    fn settle(&self, record: &InstanceRecord, attachment: &mut Attachment) {
        let failure = attachment.runner.as_ref().and_then(|r| r.error());
        let outcome = if failure.is_some() {
            LaunchState::Failed
        } else {
            LaunchState::Complete
        };

        match self.teardown(record, attachment) {
            Ok(()) => record.mark_terminated(outcome, failure),
            Err(e) => {
                let message = error_chain(&e);
                error!("Cannot clean up {}: {}", record.bundle(), message);
                if outcome == LaunchState::Failed {
                    record.mark_terminated(outcome, failure);
                } else {
                    record.mark_terminated(LaunchState::Error, Some(message));
                }
            }
        }
        info!(
            "Deployment {} settled as {}",
            record.id().short(),
            record.current_state()
        );
    }

    /// Close, release and purge, clearing the attachment whatever fails
    fn teardown(
        &self,
        record: &InstanceRecord,
        attachment: &mut Attachment,
    ) -> Result<(), TeardownError> {
        let result = attachment.tear_down(record.id().short(), &self.coordinator);

        if self.request_reclamation {
            platform::request_reclamation();
        }
        self.check_for_leaks();
        result
    }

    /// Warn when too many released contexts stay reachable
    fn check_for_leaks(&self) -> usize {
        let leaked = self.host.leaked_contexts();
        if leaked > self.leak_warning_threshold {
            warn!(
                "{} released isolation contexts are still reachable (threshold {}), they may be leaking",
                leaked, self.leak_warning_threshold
            );
        }
        leaked
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bundle::{BundleRef, EntryPoint};
    use crate::core::DeploymentId;
    use crate::error::ResolveError;
    use crate::isolation::ambient;
    use crate::isolation::statics::GlobalStatics;
    use crate::isolation::ApplicationCatalog;
    use crate::runner::Application;
    use std::sync::atomic::{AtomicBool, Ordering};
    use tracing_test::traced_test;

    struct FixedResolver {
        entry_point: Option<&'static str>,
    }

    impl BundleResolver for FixedResolver {
        fn resolve_dependencies(
            &self,
            _bundle: &BundleRef,
            _name: &str,
            _profiles: &[String],
        ) -> Result<Vec<ResourceLocation>, ResolveError> {
            Ok(vec![ResourceLocation::new("/lib/common")])
        }

        fn find_main_entry_point(&self, bundle: &BundleRef) -> Result<EntryPoint, ResolveError> {
            self.entry_point
                .map(EntryPoint::new)
                .ok_or_else(|| ResolveError::NoEntryPoint {
                    bundle: bundle.path().to_path_buf(),
                })
        }
    }

    struct Switch {
        running: Arc<AtomicBool>,
        fail_close: bool,
    }

    impl Application for Switch {
        fn is_running(&self) -> bool {
            self.running.load(Ordering::SeqCst)
        }

        fn close(&mut self) -> anyhow::Result<()> {
            self.running.store(false, Ordering::SeqCst);
            if self.fail_close {
                anyhow::bail!("connector refused to stop");
            }
            Ok(())
        }
    }

    struct Fixture {
        engine: LifecycleEngine,
        record: InstanceRecord,
        running: Arc<AtomicBool>,
    }

    fn fixture(entry_point: Option<&'static str>) -> Fixture {
        let running = Arc::new(AtomicBool::new(true));
        let switch = Arc::clone(&running);
        let mut catalog = ApplicationCatalog::new();
        catalog
            .register("demo.Web", move |_| {
                switch.store(true, Ordering::SeqCst);
                Ok(Box::new(Switch {
                    running: Arc::clone(&switch),
                    fail_close: false,
                }))
            })
            .register("demo.Task", |_| {
                Ok(Box::new(Switch {
                    running: Arc::new(AtomicBool::new(false)),
                    fail_close: false,
                }))
            })
            .register("demo.Stuck", |_| {
                Ok(Box::new(Switch {
                    running: Arc::new(AtomicBool::new(true)),
                    fail_close: true,
                }))
            })
            .register("demo.Broken", |_| anyhow::bail!("bean creation failed"));

        let host = Arc::new(HostBoundary::new(
            vec![],
            catalog,
            Arc::new(GlobalStatics::new()),
        ));
        let engine = LifecycleEngine::new(
            Arc::new(FixedResolver { entry_point }),
            host,
            vec![],
        )
        .with_reclamation(false);
        let record = InstanceRecord::new(
            DeploymentId::from_hex("feed"),
            BundleRef::new("/srv/bundles/demo"),
            "thin",
            vec![],
        );
        Fixture {
            engine,
            record,
            running,
        }
    }

    fn launch(f: &Fixture) -> LaunchState {
        f.engine.launch(&f.record, &Properties::new(), &[])
    }

    #[test]
    fn running_launch_then_cancel() {
        let f = fixture(Some("demo.Web"));
        assert_eq!(launch(&f), LaunchState::Running);
        assert_eq!(f.engine.host().live_contexts(), 1);
        assert!(ambient::current().is_none());

        assert_eq!(f.engine.cancel(&f.record), LaunchState::Cancelled);
        assert!(!f.running.load(Ordering::SeqCst));
        assert_eq!(f.engine.host().live_contexts(), 0);
        assert!(!f.record.attachment().is_attached());
    }

    #[test]
    fn second_launch_while_attached_is_ignored() {
        let f = fixture(Some("demo.Web"));
        launch(&f);
        launch(&f);
        assert_eq!(f.record.details().launch_count, 1);
        assert_eq!(f.engine.host().live_contexts(), 1);
    }

    #[test]
    fn resolution_failure_is_failed_without_a_context() {
        let f = fixture(None);
        assert_eq!(launch(&f), LaunchState::Failed);
        assert!(f.record.last_error().unwrap().contains("no entry point"));
        assert_eq!(f.engine.host().live_contexts(), 0);
    }

    #[test]
    fn startup_failure_releases_the_context() {
        let f = fixture(Some("demo.Broken"));
        assert_eq!(launch(&f), LaunchState::Failed);
        assert!(f.record.last_error().unwrap().contains("bean creation failed"));
        assert!(!f.record.attachment().is_attached());
        assert_eq!(f.engine.host().live_contexts(), 0);
    }

    #[test]
    fn unknown_entry_point_fails() {
        let f = fixture(Some("demo.Missing"));
        assert_eq!(launch(&f), LaunchState::Failed);
        assert_eq!(f.engine.host().live_contexts(), 0);
    }

    #[test]
    fn finished_task_completes_at_once() {
        let f = fixture(Some("demo.Task"));
        assert_eq!(launch(&f), LaunchState::Complete);
        assert!(f.record.last_error().is_none());
        assert!(!f.record.attachment().is_attached());
    }

    #[test]
    fn lazy_reap_happens_on_the_next_state_call() {
        let f = fixture(Some("demo.Web"));
        launch(&f);
        f.running.store(false, Ordering::SeqCst);

        assert_eq!(f.record.current_state(), LaunchState::Running);
        assert!(f.record.attachment().is_attached());
        assert_eq!(f.engine.state(&f.record), LaunchState::Complete);
        assert!(!f.record.attachment().is_attached());
        assert_eq!(f.engine.host().live_contexts(), 0);
    }

    #[test]
    fn state_does_not_wait_for_a_busy_record() {
        let f = fixture(Some("demo.Web"));
        launch(&f);
        f.running.store(false, Ordering::SeqCst);

        let held = f.record.attachment();
        assert_eq!(f.engine.state(&f.record), LaunchState::Running);
        drop(held);
        assert_eq!(f.engine.state(&f.record), LaunchState::Complete);
    }

    #[test]
    fn close_failure_is_error_and_still_detaches() {
        let f = fixture(Some("demo.Stuck"));
        assert_eq!(launch(&f), LaunchState::Running);
        assert_eq!(f.engine.cancel(&f.record), LaunchState::Error);
        assert!(f.record.last_error().unwrap().contains("connector refused to stop"));
        assert!(!f.record.attachment().is_attached());
        assert_eq!(f.engine.host().live_contexts(), 0);
    }

    #[test]
    fn relaunch_after_cancel_builds_a_new_context() {
        let f = fixture(Some("demo.Web"));
        launch(&f);
        let first = f.engine.host().live_context_ids();
        f.engine.cancel(&f.record);

        assert_eq!(launch(&f), LaunchState::Running);
        let second = f.engine.host().live_context_ids();
        assert_eq!(second.len(), 1);
        assert_ne!(first, second);
        assert_eq!(f.record.details().launch_count, 2);
    }

    #[test]
    fn cancel_without_attachment_is_a_no_op() {
        let f = fixture(Some("demo.Web"));
        assert_eq!(f.engine.cancel(&f.record), LaunchState::Idle);
    }

    #[test]
    fn retired_record_is_torn_down_and_never_relaunched() {
        let f = fixture(Some("demo.Web"));
        launch(&f);

        assert_eq!(f.engine.retire(&f.record), LaunchState::Cancelled);
        assert!(f.record.is_retired());
        assert_eq!(f.engine.host().live_contexts(), 0);

        assert_eq!(launch(&f), LaunchState::Unknown);
        assert_eq!(f.record.details().launch_count, 1);
        assert!(!f.record.attachment().is_attached());
    }

    #[test]
    fn dropping_an_attached_record_tears_it_down() {
        let f = fixture(Some("demo.Web"));
        let record = InstanceRecord::new(
            DeploymentId::from_hex("dropped"),
            BundleRef::new("/srv/bundles/dropped"),
            "thin",
            vec![],
        );
        f.engine.launch(&record, &Properties::new(), &[]);
        assert_eq!(f.engine.host().live_contexts(), 1);

        drop(record);
        assert!(!f.running.load(Ordering::SeqCst));
        assert_eq!(f.engine.host().live_contexts(), 0);
    }

    #[test]
    #[traced_test]
    fn running_contexts_are_not_reported_as_leaks() {
        let mut f = fixture(Some("demo.Web"));
        f.engine = f.engine.with_leak_warning_threshold(2);
        let records: Vec<_> = (0..4)
            .map(|i| {
                InstanceRecord::new(
                    DeploymentId::from_hex(format!("run{i}")),
                    BundleRef::new(format!("/srv/bundles/run{i}")),
                    "thin",
                    vec![],
                )
            })
            .collect();
        for record in &records {
            assert_eq!(
                f.engine.launch(record, &Properties::new(), &[]),
                LaunchState::Running
            );
        }

        launch(&f);
        f.engine.cancel(&f.record);

        assert_eq!(f.engine.host().live_contexts(), 4);
        assert_eq!(f.engine.host().leaked_contexts(), 0);
        assert_eq!(f.engine.check_for_leaks(), 0);
        assert!(!logs_contain("may be leaking"));
    }

    #[test]
    #[traced_test]
    fn pinned_released_contexts_are_reported() {
        let mut f = fixture(Some("demo.Web"));
        f.engine = f.engine.with_leak_warning_threshold(0);
        launch(&f);
        let pinned = f.record.attachment().context.as_ref().unwrap().handle().clone();

        f.engine.cancel(&f.record);
        assert!(pinned.is_released());
        assert_eq!(f.engine.host().leaked_contexts(), 1);
        assert!(logs_contain("may be leaking"));

        drop(pinned);
        assert_eq!(f.engine.host().leaked_contexts(), 0);
    }
}
