//! Integration tests for element trees built from driver models and for the
//! devices holding them.

use lab_sweep::config::DeviceConfig;
use lab_sweep::device::DeviceRegistry;
use lab_sweep::element::{
    Descriptor, DriverModelProvider, ElementEvent, ElementKind, Value, ValueType,
};
use lab_sweep::hardware::mock::MockInstrument;
use lab_sweep::LabError;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

/// Driver whose model is given by a closure.
struct Model(Box<dyn Fn() -> Vec<Descriptor> + Send + Sync>);

impl DriverModelProvider for Model {
    fn driver_model(self: Arc<Self>) -> Vec<Descriptor> {
        (self.0)()
    }
}

fn registry_with(model: impl Fn() -> Vec<Descriptor> + Send + Sync + 'static) -> DeviceRegistry {
    let model = Arc::new(Model(Box::new(model)));
    let registry = DeviceRegistry::new();
    registry.register_driver("model", move |_: &DeviceConfig| {
        Ok(model.clone() as Arc<dyn DriverModelProvider>)
    });
    registry.add_config(DeviceConfig::new("dev", "model")).unwrap();
    registry
}

// =============================================================================
// Construction
// =============================================================================

#[test]
fn test_mock_instrument_tree() {
    let registry = DeviceRegistry::with_builtin_drivers();
    registry.add_config(DeviceConfig::new("laser", "mock_instrument")).unwrap();
    let laser = registry.open("laser").unwrap();

    let structure = laser.root().structure();
    assert_eq!(structure[0], ("laser.channel".to_string(), ElementKind::Module));
    assert!(structure.contains(&("laser.channel.offset".to_string(), ElementKind::Variable)));
    assert!(structure.contains(&("laser.trigger".to_string(), ElementKind::Action)));

    let hierarchy = laser.root().hierarchy();
    assert_eq!(hierarchy[0], ("laser".to_string(), ElementKind::Module, 0));
    assert!(hierarchy.contains(&("offset".to_string(), ElementKind::Variable, 2)));

    let offset = registry.resolve("laser.channel.offset").unwrap();
    assert_eq!(offset.kind(), ElementKind::Variable);
    assert_eq!(registry.resolve("laser").unwrap().kind(), ElementKind::Module);
    assert!(matches!(
        registry.resolve("laser.channel.nope"),
        Err(LabError::NotFound { address }) if address == "laser.channel.nope"
    ));
}

#[test]
fn test_duplicate_names_abort_the_device() {
    let registry = registry_with(|| {
        vec![
            Descriptor::variable("level")
                .value_type(ValueType::Float)
                .read(|| Ok(Value::Float(1.0))),
            Descriptor::action("level").do_fn(|_| Ok(())),
        ]
    });

    let err = registry.open("dev").unwrap_err();
    assert!(matches!(err, LabError::Configuration { .. }));
    assert_eq!(err.address(), Some("dev.level"));
    assert!(!registry.is_open("dev"));
}

#[test]
fn test_malformed_descriptors() {
    type ModelFn = fn() -> Vec<Descriptor>;
    let cases: Vec<(ModelFn, &str)> = vec![
        (
            (|| vec![Descriptor::variable("v").read(|| Ok(Value::Int(1)))]) as ModelFn,
            "dev.v",
        ),
        (
            (|| {
                vec![Descriptor::variable("v")
                    .type_name("complex")
                    .read(|| Ok(Value::Int(1)))]
            }) as ModelFn,
            "dev.v",
        ),
        (
            (|| vec![Descriptor::variable("v").value_type(ValueType::Int)]) as ModelFn,
            "dev.v",
        ),
        ((|| vec![Descriptor::action("go")]) as ModelFn, "dev.go"),
        ((|| vec![Descriptor::new("m", "module")]) as ModelFn, "dev.m"),
        ((|| vec![Descriptor::new("x", "widget")]) as ModelFn, "dev.x"),
        ((|| vec![Descriptor::action("*.:").do_fn(|_| Ok(()))]) as ModelFn, "dev"),
    ];

    for (model, address) in cases {
        let registry = registry_with(model);
        let err = registry.open("dev").unwrap_err();
        assert!(
            matches!(err, LabError::Configuration { .. }),
            "{address}: unexpected {err}"
        );
        assert_eq!(err.address(), Some(address));
    }
}

#[test]
fn test_reserved_characters_are_stripped() {
    let registry = registry_with(|| {
        vec![Descriptor::variable("wave length [nm]")
            .value_type(ValueType::Float)
            .read(|| Ok(Value::Float(800.0)))]
    });
    registry.open("dev").unwrap();
    let variable = registry.resolve("dev.wavelengthnm").unwrap();
    assert_eq!(variable.name(), "wavelengthnm");
}

#[test]
fn test_read_on_load_failures_are_kept() {
    let registry = registry_with(|| {
        vec![
            Descriptor::variable("broken")
                .value_type(ValueType::Float)
                .read(|| anyhow::bail!("no response"))
                .read_init(true),
            Descriptor::variable("fine")
                .value_type(ValueType::Float)
                .read(|| Ok(Value::Float(2.0)))
                .read_init(true),
        ]
    });

    let device = registry.open("dev").unwrap();
    assert_eq!(device.init_failures().len(), 1);
    assert_eq!(device.init_failures()[0].address, "dev.broken");
    assert!(device.init_failures()[0].message.contains("no response"));
}

// =============================================================================
// Runtime
// =============================================================================

#[test]
fn test_calls_publish_events() {
    let registry = DeviceRegistry::with_builtin_drivers();
    registry.add_config(DeviceConfig::new("laser", "mock_instrument")).unwrap();
    let laser = registry.open("laser").unwrap();
    let mut events = laser.subscribe();

    let amplitude = registry.resolve("laser.amplitude").unwrap();
    let amplitude = amplitude.as_variable().unwrap();
    amplitude.call(Some(Value::Int(2))).unwrap();
    amplitude.call(None).unwrap();
    registry
        .resolve("laser.set_gain")
        .unwrap()
        .as_action()
        .unwrap()
        .call(Some(Value::from("1.5")))
        .unwrap();

    assert_eq!(
        events.try_recv().unwrap(),
        ElementEvent::Written {
            address: "laser.amplitude".into(),
            value: Value::Float(2.0)
        }
    );
    assert_eq!(
        events.try_recv().unwrap(),
        ElementEvent::Read {
            address: "laser.amplitude".into(),
            value: Value::Float(2.0)
        }
    );
    assert_eq!(
        events.try_recv().unwrap(),
        ElementEvent::Executed {
            address: "laser.set_gain".into(),
            value: Some(Value::Float(1.5))
        }
    );
}

#[test]
fn test_calls_on_one_device_are_serialized() {
    let busy = Arc::new(AtomicUsize::new(0));
    let overlap = Arc::new(AtomicUsize::new(0));
    let (b, o) = (busy.clone(), overlap.clone());
    let registry = registry_with(move || {
        let (b, o) = (b.clone(), o.clone());
        vec![Descriptor::variable("slow")
            .value_type(ValueType::Int)
            .read(move || {
                if b.fetch_add(1, Ordering::SeqCst) > 0 {
                    o.fetch_add(1, Ordering::SeqCst);
                }
                thread::sleep(Duration::from_millis(5));
                b.fetch_sub(1, Ordering::SeqCst);
                Ok(Value::Int(1))
            })]
    });
    registry.open("dev").unwrap();
    let slow = registry.resolve("dev.slow").unwrap().as_variable().unwrap().clone();

    let workers: Vec<_> = (0..4)
        .map(|_| {
            let slow = slow.clone();
            thread::spawn(move || {
                for _ in 0..5 {
                    slow.read().unwrap();
                }
            })
        })
        .collect();
    for worker in workers {
        worker.join().unwrap();
    }
    assert_eq!(overlap.load(Ordering::SeqCst), 0);
}

#[test]
fn test_close_releases_driver() {
    let instrument = Arc::new(MockInstrument::new());
    let driver = instrument.clone();
    let registry = DeviceRegistry::new();
    registry.register_driver("kept", move |_: &DeviceConfig| {
        Ok(driver.clone() as Arc<dyn DriverModelProvider>)
    });
    registry.add_config(DeviceConfig::new("laser", "kept")).unwrap();

    let first = registry.open("laser").unwrap();
    let again = registry.open("laser").unwrap();
    assert!(Arc::ptr_eq(&first, &again));
    assert_eq!(registry.list_open(), vec!["laser".to_string()]);

    assert!(registry.close("laser").unwrap());
    assert!(instrument.is_closed());
    assert!(!registry.close("laser").unwrap());
    assert!(registry.resolve("laser.power").is_err());
}
