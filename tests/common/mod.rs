//! Common test utilities: demo applications and bundle directories

#![allow(dead_code)]

use std::net::TcpListener;
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Condvar, Mutex};

use thinhost::isolation::statics::{GlobalStatics, DRIVER_REGISTRY, STREAM_HANDLER_FACTORY};
use thinhost::{Application, ApplicationCatalog, DeployerSettings, LaunchSupport, Startup};
use tracing_subscriber::EnvFilter;

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::new("thinhost=debug"))
        .with_test_writer()
        .try_init();
}

/// Web-style application: listens on `server.port`, registers a driver that
/// points back into its context, and installs the stream handler factory
struct WebApp {
    listener: Option<TcpListener>,
}

impl Application for WebApp {
    fn is_running(&self) -> bool {
        self.listener.is_some()
    }

    fn close(&mut self) -> anyhow::Result<()> {
        self.listener = None;
        Ok(())
    }
}

fn start_web(startup: &Startup<'_>) -> anyhow::Result<Box<dyn Application>> {
    if startup.has_flag("fail") {
        anyhow::bail!("refusing to start: --fail was passed");
    }
    let port: u16 = startup.setting("server.port").unwrap_or("0").parse()?;
    let listener = TcpListener::bind(("127.0.0.1", port))?;

    let context = startup.context;
    let globals = context.globals();
    globals
        .registry(DRIVER_REGISTRY)
        .register(context.id(), "demo.Driver", context.clone())?;
    globals
        .slot(STREAM_HANDLER_FACTORY)
        .install(context.id(), context.clone())?;
    context
        .statics()
        .get_or_init(|| AtomicUsize::new(0))
        .fetch_add(1, Ordering::SeqCst);

    Ok(Box::new(WebApp {
        listener: Some(listener),
    }))
}

/// Task-style application that finishes during startup
struct FinishedTask;

impl Application for FinishedTask {
    fn is_running(&self) -> bool {
        false
    }

    fn close(&mut self) -> anyhow::Result<()> {
        Ok(())
    }
}

/// Long-running application whose end the test controls
pub struct Remote {
    pub running: AtomicBool,
    pub failure: Mutex<Option<String>>,
}

impl Remote {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            running: AtomicBool::new(false),
            failure: Mutex::new(None),
        })
    }

    /// Make the application stop on its own
    pub fn stop(&self, failure: Option<&str>) {
        *self.failure.lock().unwrap() = failure.map(str::to_string);
        self.running.store(false, Ordering::SeqCst);
    }
}

struct Controlled(Arc<Remote>);

impl Application for Controlled {
    fn is_running(&self) -> bool {
        self.0.running.load(Ordering::SeqCst)
    }

    fn close(&mut self) -> anyhow::Result<()> {
        self.0.running.store(false, Ordering::SeqCst);
        Ok(())
    }

    fn failure(&self) -> Option<String> {
        self.0.failure.lock().unwrap().clone()
    }
}

/// Holds `close()` of gated applications until the test opens it
#[derive(Default)]
pub struct Gate {
    shut: Mutex<bool>,
    opened: Condvar,
    pub waiting: AtomicUsize,
    pub closes: AtomicUsize,
}

impl Gate {
    pub fn shut(&self) {
        *self.shut.lock().unwrap() = true;
    }

    pub fn open(&self) {
        *self.shut.lock().unwrap() = false;
        self.opened.notify_all();
    }

    fn pass(&self) {
        self.waiting.fetch_add(1, Ordering::SeqCst);
        let mut shut = self.shut.lock().unwrap();
        while *shut {
            shut = self.opened.wait(shut).unwrap();
        }
        self.waiting.fetch_sub(1, Ordering::SeqCst);
        self.closes.fetch_add(1, Ordering::SeqCst);
    }
}

struct Gated {
    gate: Arc<Gate>,
    running: bool,
}

impl Application for Gated {
    fn is_running(&self) -> bool {
        self.running
    }

    fn close(&mut self) -> anyhow::Result<()> {
        self.gate.pass();
        self.running = false;
        Ok(())
    }
}

/// What the demo applications observed, shared with the test
#[derive(Default)]
pub struct Observed {
    pub starts: AtomicUsize,
    pub ports: Mutex<Vec<String>>,
}

pub struct Harness {
    pub support: Arc<LaunchSupport>,
    pub globals: Arc<GlobalStatics>,
    pub remote: Arc<Remote>,
    pub observed: Arc<Observed>,
    pub gate: Arc<Gate>,
}

pub fn harness() -> Harness {
    init_tracing();
    let globals = Arc::new(GlobalStatics::new());
    let remote = Remote::new();
    let observed = Arc::new(Observed::default());
    let gate = Arc::new(Gate::default());

    let mut catalog = ApplicationCatalog::new();
    let seen = Arc::clone(&observed);
    catalog.register("demo.Web", move |startup| {
        seen.starts.fetch_add(1, Ordering::SeqCst);
        start_web(startup)
    });
    catalog.register("demo.Task", |_| Ok(Box::new(FinishedTask)));
    let seen = Arc::clone(&observed);
    catalog.register("demo.Probe", move |startup| {
        seen.starts.fetch_add(1, Ordering::SeqCst);
        if let Some(port) = startup.properties.get("server.port") {
            seen.ports.lock().unwrap().push(port.clone());
        }
        Ok(Box::new(FinishedTask))
    });
    let control = Arc::clone(&remote);
    catalog.register("demo.Remote", move |_| {
        control.running.store(true, Ordering::SeqCst);
        *control.failure.lock().unwrap() = None;
        Ok(Box::new(Controlled(Arc::clone(&control))))
    });
    let gated = Arc::clone(&gate);
    catalog.register("demo.Gated", move |startup| {
        let context = startup.context;
        context
            .globals()
            .registry(DRIVER_REGISTRY)
            .register(context.id(), "demo.GatedDriver", context.clone())?;
        Ok(Box::new(Gated {
            gate: Arc::clone(&gated),
            running: true,
        }))
    });

    let settings = DeployerSettings {
        host_resources: Some(vec!["/opt/thinhost".into()]),
        request_reclamation: false,
        ..Default::default()
    };
    let support = LaunchSupport::builder(catalog)
        .with_settings(settings)
        .with_globals(Arc::clone(&globals))
        .build()
        .unwrap();

    Harness {
        support: Arc::new(support),
        globals,
        remote,
        observed,
        gate,
    }
}

/// Lay out an exploded bundle declaring `entry_point`
pub fn bundle(root: &Path, name: &str, entry_point: &str) -> std::path::PathBuf {
    let dir = root.join(name);
    std::fs::create_dir_all(dir.join("lib")).unwrap();
    std::fs::write(
        dir.join("bundle.toml"),
        format!("entry-point = \"{entry_point}\"\n"),
    )
    .unwrap();
    std::fs::write(dir.join("thin.toml"), "dependencies = [\"lib\"]\n").unwrap();
    dir
}
