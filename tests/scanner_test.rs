//! Integration tests for scan execution: point order, pause/resume, stop,
//! error handling and the recorded dataset.

use lab_sweep::config::{DeviceConfig, ScannerSettings};
use lab_sweep::data::dataset::{CONFIG_FILE, DATA_FILE};
use lab_sweep::device::DeviceRegistry;
use lab_sweep::element::{Descriptor, DriverModelProvider, Element, Value, ValueType, Variable};
use lab_sweep::experiment::{
    ConfigManager, RecipeKind, ScanControl, ScanEvent, ScanRange, ScanState, Scanner, StepKind,
};
use lab_sweep::LabError;
use parking_lot::{Mutex, RwLock};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tempfile::TempDir;

// =============================================================================
// Rig driver
// =============================================================================

type ReadHook = Arc<dyn Fn(usize) -> anyhow::Result<()> + Send + Sync>;

/// Two writable axes and a detector reading `10 * x + y`.
#[derive(Default)]
struct Rig {
    x: Mutex<f64>,
    y: Mutex<f64>,
    writes: Mutex<Vec<(&'static str, f64)>>,
    reads: AtomicUsize,
    hook: Mutex<Option<ReadHook>>,
}

impl Rig {
    /// Runs `hook` with the 1-based count of every `signal` read.
    fn on_read(&self, hook: impl Fn(usize) -> anyhow::Result<()> + Send + Sync + 'static) {
        *self.hook.lock() = Some(Arc::new(hook));
    }

    fn writes(&self) -> Vec<(&'static str, f64)> {
        self.writes.lock().clone()
    }
}

fn x_axis(rig: &Rig) -> &Mutex<f64> {
    &rig.x
}

fn y_axis(rig: &Rig) -> &Mutex<f64> {
    &rig.y
}

impl DriverModelProvider for Rig {
    fn driver_model(self: Arc<Self>) -> Vec<Descriptor> {
        let axis = |name: &'static str, pick: fn(&Rig) -> &Mutex<f64>| {
            let reader = self.clone();
            let writer = self.clone();
            Descriptor::variable(name)
                .value_type(ValueType::Float)
                .read(move || Ok(Value::Float(*pick(&reader).lock())))
                .write(move |value| {
                    let value = value.as_f64().unwrap_or_default();
                    *pick(&writer).lock() = value;
                    writer.writes.lock().push((name, value));
                    Ok(())
                })
        };
        let rig = self.clone();

        vec![
            axis("x", x_axis),
            axis("y", y_axis),
            Descriptor::variable("signal")
                .value_type(ValueType::Float)
                .read(move || {
                    let count = rig.reads.fetch_add(1, Ordering::SeqCst) + 1;
                    let hook = rig.hook.lock().clone();
                    if let Some(hook) = hook {
                        hook(count)?;
                    }
                    Ok(Value::Float(*rig.x.lock() * 10.0 + *rig.y.lock()))
                }),
        ]
    }
}

// =============================================================================
// Fixture
// =============================================================================

struct Bench {
    registry: DeviceRegistry,
    rig: Arc<Rig>,
    config: Arc<RwLock<ConfigManager>>,
    control: Arc<ScanControl>,
    scanner: Scanner,
    _dir: TempDir,
}

impl Bench {
    fn new() -> Self {
        let rig = Arc::new(Rig::default());
        let registry = DeviceRegistry::new();
        let driver = rig.clone();
        registry.register_driver("rig", move |_: &DeviceConfig| {
            Ok(driver.clone() as Arc<dyn DriverModelProvider>)
        });
        registry.add_config(DeviceConfig::new("rig", "rig")).unwrap();
        registry.open("rig").unwrap();

        let dir = tempfile::tempdir().unwrap();
        let control = ScanControl::new();
        let config = Arc::new(RwLock::new(ConfigManager::new(control.clone())));
        let settings = ScannerSettings {
            data_dir: dir.path().to_path_buf(),
            ..ScannerSettings::default()
        };
        let scanner = Scanner::new(config.clone(), settings);

        Self {
            registry,
            rig,
            config,
            control,
            scanner,
            _dir: dir,
        }
    }

    fn variable(&self, address: &str) -> Arc<Variable> {
        self.registry
            .resolve(address)
            .unwrap()
            .as_variable()
            .unwrap()
            .clone()
    }

    fn element(&self, address: &str) -> Element {
        self.registry.resolve(address).unwrap()
    }

    fn sweep(&self, address: &str, range: ScanRange) {
        let mut config = self.config.write();
        let name = config.add_parameter(self.variable(address), None).unwrap();
        config.set_range(&name, range).unwrap();
    }

    fn measure(&self, recipe: RecipeKind, address: &str, name: &str) {
        self.config
            .write()
            .add_step(recipe, StepKind::Measure, Some(self.element(address)), Some(name), None)
            .unwrap();
    }
}

fn drain(rx: &mut tokio::sync::broadcast::Receiver<ScanEvent>) -> Vec<ScanEvent> {
    let mut events = Vec::new();
    while let Ok(event) = rx.try_recv() {
        events.push(event);
    }
    events
}

// =============================================================================
// Point order
// =============================================================================

#[test]
fn test_last_parameter_varies_fastest() {
    let bench = Bench::new();
    bench.sweep("rig.x", ScanRange::linear(0.0, 2.0, 3));
    bench.sweep("rig.y", ScanRange::linear(10.0, 40.0, 4));
    bench.measure(RecipeKind::Main, "rig.signal", "signal");

    let dataset = bench.scanner.start().unwrap();
    let summary = bench.scanner.wait().unwrap();
    assert_eq!(summary.rows, 12);
    assert!(!summary.stopped);

    let dataset = dataset.read();
    assert_eq!(dataset.ids(), (1..=12).collect::<Vec<u64>>());

    let mut expected = Vec::new();
    for x in [0.0, 1.0, 2.0] {
        for y in [10.0, 20.0, 30.0, 40.0] {
            expected.push((x, y));
        }
    }
    for (id, (x, y)) in (1..).zip(expected) {
        assert_eq!(dataset.value("x", id), Some(&Value::Float(x)));
        assert_eq!(dataset.value("y", id), Some(&Value::Float(y)));
        assert_eq!(dataset.value("signal", id), Some(&Value::Float(10.0 * x + y)));
    }
}

#[test]
fn test_only_changed_parameters_are_written() {
    let bench = Bench::new();
    bench.sweep("rig.x", ScanRange::linear(0.0, 1.0, 2));
    bench.sweep("rig.y", ScanRange::linear(1.0, 3.0, 3));
    bench.measure(RecipeKind::Main, "rig.signal", "signal");

    bench.scanner.start().unwrap();
    bench.scanner.wait().unwrap();

    assert_eq!(
        bench.rig.writes(),
        vec![
            ("x", 0.0),
            ("y", 1.0),
            ("y", 2.0),
            ("y", 3.0),
            ("x", 1.0),
            ("y", 1.0),
            ("y", 2.0),
            ("y", 3.0),
        ]
    );
}

#[test]
fn test_recipe_without_parameter_runs_once() {
    let bench = Bench::new();
    bench.measure(RecipeKind::Main, "rig.signal", "signal");

    bench.scanner.start().unwrap();
    let summary = bench.scanner.wait().unwrap();
    assert_eq!(summary.rows, 1);
    let dataset = bench.scanner.last_dataset().unwrap();
    assert_eq!(dataset.read().ids(), vec![1]);
}

#[test]
fn test_init_and_end_rows() {
    let bench = Bench::new();
    bench.sweep("rig.x", ScanRange::linear(1.0, 3.0, 3));
    bench.measure(RecipeKind::Init, "rig.x", "x_before");
    bench.measure(RecipeKind::Main, "rig.signal", "signal");
    bench.measure(RecipeKind::End, "rig.x", "x_after");

    let dataset = bench.scanner.start().unwrap();
    let summary = bench.scanner.wait().unwrap();
    assert_eq!(summary.rows, 5);

    let dataset = dataset.read();
    assert_eq!(dataset.ids(), vec![0, 1, 2, 3, 4]);
    assert_eq!(dataset.value("x_before", 0), Some(&Value::Float(0.0)));
    assert_eq!(dataset.value("x_after", 4), Some(&Value::Float(3.0)));
    assert_eq!(dataset.value("signal", 0), None);

    let table = std::fs::read_to_string(summary.folder.join(DATA_FILE)).unwrap();
    assert_eq!(table.lines().next(), Some("id,x_before,x,signal,x_after"));
    assert_eq!(table.lines().count(), 6);
    assert!(summary.folder.join(CONFIG_FILE).exists());
}

// =============================================================================
// Pause, resume and stop
// =============================================================================

#[test]
fn test_pause_and_resume() {
    let bench = Bench::new();
    bench.sweep("rig.x", ScanRange::linear(0.0, 9.0, 10));
    bench.measure(RecipeKind::Main, "rig.signal", "signal");

    let control = bench.control.clone();
    bench.rig.on_read(move |count| {
        if count == 3 {
            let _ = control.request_pause();
        }
        Ok(())
    });

    let mut events = bench.scanner.subscribe();
    let dataset = bench.scanner.start().unwrap();
    assert!(bench.control.wait_for(ScanState::Paused, Duration::from_secs(5)));
    std::thread::sleep(Duration::from_millis(50));
    assert_eq!(dataset.read().len(), 3);
    assert_eq!(bench.scanner.state(), ScanState::Paused);

    let err = bench
        .config
        .write()
        .add_recipe_step(StepKind::Wait, None, None, Some(Value::Float(0.1)))
        .unwrap_err();
    assert!(matches!(err, LabError::ScanRunning));

    bench.scanner.resume().unwrap();
    let summary = bench.scanner.wait().unwrap();
    assert_eq!(summary.rows, 10);
    assert_eq!(dataset.read().ids(), (1..=10).collect::<Vec<u64>>());
    assert_eq!(bench.scanner.state(), ScanState::Idle);

    let events = drain(&mut events);
    assert!(matches!(events.first(), Some(ScanEvent::Started { points: 10, .. })));
    assert!(events.contains(&ScanEvent::Paused));
    assert!(events.contains(&ScanEvent::Resumed));
    assert_eq!(
        events.last(),
        Some(&ScanEvent::Finished {
            rows: 10,
            stopped: false
        })
    );
}

#[test]
fn test_stop_discards_row_in_progress() {
    let bench = Bench::new();
    bench.sweep("rig.x", ScanRange::linear(0.0, 9.0, 10));
    bench.measure(RecipeKind::Init, "rig.y", "y_before");
    bench.measure(RecipeKind::Main, "rig.signal", "signal");
    bench.measure(RecipeKind::End, "rig.y", "y_after");

    let control = bench.control.clone();
    bench.rig.on_read(move |count| {
        if count == 5 {
            let _ = control.request_stop();
        }
        Ok(())
    });

    let dataset = bench.scanner.start().unwrap();
    let summary = bench.scanner.wait().unwrap();
    assert!(summary.stopped);
    assert_eq!(dataset.read().ids(), vec![0, 1, 2, 3, 4]);
    assert_eq!(dataset.read().value("y_after", 11), None);
}

#[test]
fn test_stop_cuts_wait_short() {
    let bench = Bench::new();
    bench
        .config
        .write()
        .add_recipe_step(StepKind::Wait, None, None, Some(Value::Float(30.0)))
        .unwrap();

    let started = Instant::now();
    let dataset = bench.scanner.start().unwrap();
    assert!(bench.control.wait_for(ScanState::Running, Duration::from_secs(5)));
    std::thread::sleep(Duration::from_millis(20));
    bench.scanner.stop().unwrap();

    let summary = bench.scanner.wait().unwrap();
    assert!(summary.stopped);
    assert!(dataset.read().is_empty());
    assert!(started.elapsed() < Duration::from_secs(10));
}

// =============================================================================
// Errors
// =============================================================================

#[test]
fn test_step_error_aborts_scan() {
    let bench = Bench::new();
    bench.sweep("rig.x", ScanRange::linear(0.0, 4.0, 5));
    bench.measure(RecipeKind::Main, "rig.signal", "signal");
    bench.measure(RecipeKind::End, "rig.x", "x_after");

    bench.rig.on_read(|count| {
        if count == 3 {
            anyhow::bail!("rig overload");
        }
        Ok(())
    });

    let mut events = bench.scanner.subscribe();
    let dataset = bench.scanner.start().unwrap();
    let err = bench.scanner.wait().unwrap_err();
    assert!(matches!(err, LabError::Communication { .. }));
    assert_eq!(err.address(), Some("rig.signal"));

    assert_eq!(dataset.read().ids(), vec![1, 2]);
    assert_eq!(bench.scanner.state(), ScanState::Idle);
    assert!(drain(&mut events)
        .iter()
        .any(|event| matches!(event, ScanEvent::Error { message } if message.contains("rig.signal"))));

    // the scanner accepts a new run afterwards
    bench.rig.on_read(|_| Ok(()));
    bench.scanner.start().unwrap();
    assert_eq!(bench.scanner.wait().unwrap().rows, 6);
}

#[test]
fn test_start_refused_while_running() {
    let bench = Bench::new();
    bench
        .config
        .write()
        .add_recipe_step(StepKind::Wait, None, None, Some(Value::Float(30.0)))
        .unwrap();

    bench.scanner.start().unwrap();
    assert!(matches!(bench.scanner.start(), Err(LabError::ScanRunning)));
    bench.scanner.stop().unwrap();
    bench.scanner.wait().unwrap();
}

// =============================================================================
// Continuous mode
// =============================================================================

#[test]
fn test_continuous_scan_starts_over_until_stopped() {
    let bench = Bench::new();
    bench.sweep("rig.x", ScanRange::linear(0.0, 1.0, 2));
    bench.measure(RecipeKind::Main, "rig.signal", "signal");
    bench
        .config
        .write()
        .add_recipe_step(StepKind::Wait, None, None, Some(Value::Float(0.01)))
        .unwrap();
    bench.scanner.set_continuous(true);
    let mut rx = bench.scanner.subscribe();

    bench.scanner.start().unwrap();
    let deadline = Instant::now() + Duration::from_secs(10);
    while bench.scanner.datasets().len() < 3 && Instant::now() < deadline {
        std::thread::sleep(Duration::from_millis(5));
    }
    assert!(bench.scanner.datasets().len() >= 3);
    assert!(bench.scanner.is_running());

    bench.scanner.stop().unwrap();
    bench.scanner.wait().unwrap();
    assert!(!bench.scanner.is_continuous());
    assert_eq!(bench.scanner.state(), ScanState::Idle);

    let datasets = bench.scanner.datasets().all();
    let first = datasets[0].read();
    let second = datasets[1].read();
    assert_ne!(first.folder(), second.folder());
    assert_eq!(first.ids(), vec![1, 2]);
    assert_eq!(second.ids(), vec![1, 2]);

    let events = drain(&mut rx);
    let started = events
        .iter()
        .filter(|event| matches!(event, ScanEvent::Started { .. }))
        .count();
    assert_eq!(started, datasets.len());
}

#[test]
fn test_continuous_scan_ends_on_error() {
    let bench = Bench::new();
    bench.sweep("rig.x", ScanRange::linear(0.0, 1.0, 2));
    bench.measure(RecipeKind::Main, "rig.signal", "signal");
    bench.rig.on_read(|count| {
        if count == 3 {
            anyhow::bail!("detector saturated");
        }
        Ok(())
    });
    bench.scanner.set_continuous(true);

    bench.scanner.start().unwrap();
    assert!(bench.scanner.wait().is_err());
    assert!(!bench.scanner.is_continuous());
    assert_eq!(bench.scanner.datasets().len(), 2);
    assert_eq!(bench.scanner.datasets().all()[1].read().ids(), Vec::<u64>::new());
}

// =============================================================================
// Configuration snapshot
// =============================================================================

#[test]
fn test_started_scan_runs_the_current_configuration() {
    let bench = Bench::new();
    bench.measure(RecipeKind::Main, "rig.signal", "signal");
    bench
        .config
        .write()
        .add_recipe_step(StepKind::Wait, None, Some("settle"), Some(Value::Float(0.1)))
        .unwrap();

    let done = Arc::new(std::sync::atomic::AtomicBool::new(false));
    let editor = {
        let (config, done) = (bench.config.clone(), done.clone());
        std::thread::spawn(move || {
            let mut i = 0;
            while !done.load(Ordering::SeqCst) {
                let delay = Value::Float(if i % 2 == 0 { 0.1 } else { 0.15 });
                let _ = config.write().set_recipe_step_value("settle", delay);
                i += 1;
                std::thread::yield_now();
            }
        })
    };

    for _ in 0..10 {
        bench.scanner.start().unwrap();
        // the scan is still waiting, nothing can change the configuration
        let current = bench.config.read().to_config_string().unwrap();
        let summary = bench.scanner.wait().unwrap();
        let saved = std::fs::read_to_string(summary.folder.join(CONFIG_FILE)).unwrap();
        let recipe = |text: &str| text.split("[recipe]").nth(1).map(str::to_string);
        assert_eq!(recipe(&saved), recipe(&current));
    }
    done.store(true, Ordering::SeqCst);
    editor.join().unwrap();
}
