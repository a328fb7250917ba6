//! Application runner - Starts an application from inside its isolation context
//!
//! The host never touches an application's concrete type. It only sees the
//! narrow [`ApplicationRunner`] capability, and the runner in turn only sees
//! the [`Application`] an entry point's factory hands back.

use std::collections::BTreeMap;
use std::thread;

use tracing::{debug, info, warn};

use crate::bundle::EntryPoint;
use crate::error::{error_chain, StartupError, TeardownError};
use crate::isolation::ambient::AmbientScope;
use crate::isolation::ContextHandle;

/// Configuration key/value overrides handed to an application
pub type Properties = BTreeMap<String, String>;

/// A started application, as returned by an entry point's factory
pub trait Application: Send {
    /// Whether the application is still doing work
    fn is_running(&self) -> bool;

    /// Stop the application and release what it holds, such as listeners
    fn close(&mut self) -> anyhow::Result<()>;

    /// Why the application stopped, if it stopped abnormally
    fn failure(&self) -> Option<String> {
        None
    }
}

/// Everything an entry point sees when it is started
pub struct Startup<'a> {
    pub context: &'a ContextHandle,
    pub entry_point: &'a EntryPoint,
    pub properties: &'a Properties,
    pub args: &'a [String],
}

impl Startup<'_> {
    /// Look up a setting, letting `--key=value` arguments override properties
    pub fn setting(&self, key: &str) -> Option<&str> {
        let from_args = self.args.iter().rev().find_map(|arg| {
            let (k, v) = arg.strip_prefix("--")?.split_once('=')?;
            (k == key).then_some(v)
        });
        from_args.or_else(|| self.properties.get(key).map(String::as_str))
    }

    /// Whether a bare `--flag` argument was passed
    pub fn has_flag(&self, flag: &str) -> bool {
        self.args
            .iter()
            .any(|arg| arg.strip_prefix("--") == Some(flag))
    }
}

/// Capability the lifecycle engine drives an application through
pub trait ApplicationRunner: Send {
    /// Start the application, blocking until it is up or has failed to come up
    fn run(&mut self, entry_point: &EntryPoint, properties: &Properties, args: &[String]);

    fn is_running(&self) -> bool;

    /// The startup failure or the application's own failure, if any
    fn error(&self) -> Option<String>;

    /// Stop the application. Calling it again does nothing.
    fn close(&mut self) -> Result<(), TeardownError>;
}

/// Runner that starts the application on a worker thread inside its context
pub struct ContextRunner {
    context: ContextHandle,
    thread_name: String,
    app: Option<Box<dyn Application>>,
    error: Option<StartupError>,
}

impl ContextRunner {
    pub fn new(context: ContextHandle, thread_name: impl Into<String>) -> Self {
        Self {
            context,
            thread_name: thread_name.into(),
            app: None,
            error: None,
        }
    }

    fn start(
        &self,
        entry_point: &EntryPoint,
        properties: &Properties,
        args: &[String],
    ) -> Result<Box<dyn Application>, StartupError> {
        let context = self.context.clone();
        let entry_point = entry_point.clone();
        let properties = properties.clone();
        let args = args.to_vec();

        let worker = thread::Builder::new()
            .name(self.thread_name.clone())
            .spawn(move || -> Result<Box<dyn Application>, StartupError> {
                let _scope = AmbientScope::enter(&context);
                let factory = context.load(&entry_point)?;
                let startup = Startup {
                    context: &context,
                    entry_point: &entry_point,
                    properties: &properties,
                    args: &args,
                };
                factory(&startup).map_err(StartupError::Failed)
            })
            .map_err(StartupError::WorkerSpawn)?;

        worker
            .join()
            .map_err(|payload| StartupError::Panicked(panic_message(payload.as_ref())))?
    }
}

impl ApplicationRunner for ContextRunner {
    fn run(&mut self, entry_point: &EntryPoint, properties: &Properties, args: &[String]) {
        debug!(
            "Starting '{}' on worker '{}' in context {}",
            entry_point,
            self.thread_name,
            self.context.id()
        );
        match self.start(entry_point, properties, args) {
            Ok(app) => {
                self.app = Some(app);
                self.error = None;
            }
            Err(e) => {
                warn!("Startup of '{}' failed: {}", entry_point, error_chain(&e));
                self.app = None;
                self.error = Some(e);
            }
        }
    }

    fn is_running(&self) -> bool {
        self.app.as_ref().is_some_and(|app| app.is_running())
    }

    fn error(&self) -> Option<String> {
        if let Some(e) = &self.error {
            return Some(error_chain(e));
        }
        self.app.as_ref().and_then(|app| app.failure())
    }

    fn close(&mut self) -> Result<(), TeardownError> {
        let Some(mut app) = self.app.take() else {
            return Ok(());
        };
        let _scope = AmbientScope::enter(&self.context);
        app.close().map_err(TeardownError::Close)?;
        info!("Closed application in context {}", self.context.id());
        Ok(())
    }
}

/// Best-effort text of a panic payload
pub(crate) fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}
