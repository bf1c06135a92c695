//! Multi-step upgrade scenarios against an in-memory store.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use serde_json::{Value, json};
use warpgrid_state::{KvStore, StateError, StateStore, VERSION_KEY};
use warpgrid_upgrade::{
    UpgradeError, VersionCheck, VersionRegistry, add_cloudlet_alert_threshold, check_version,
    default_registry, read_version, upgrade_to_latest,
};

/// Versions 1, 2 and 3; 2 writes `A/x`, 3 writes `B/x` and can be made to
/// fail after its write.
struct Scenario {
    registry: VersionRegistry,
    fail_b: Arc<AtomicBool>,
    /// Names of the upgrade functions in the order they ran.
    calls: Arc<Mutex<Vec<&'static str>>>,
}

fn scenario() -> Scenario {
    let fail_b = Arc::new(AtomicBool::new(false));
    let calls = Arc::new(Mutex::new(Vec::new()));
    let fail = fail_b.clone();
    let calls_a = calls.clone();
    let calls_b = calls.clone();
    let registry = VersionRegistry::builder()
        .version("1")
        .upgrade("2", "fnA", move |_, stm| {
            calls_a.lock().unwrap().push("fnA");
            stm.put("A/x", b"from fnA")?;
            Ok(())
        })
        .upgrade("3", "fnB", move |_, stm| {
            calls_b.lock().unwrap().push("fnB");
            stm.put("B/x", b"from fnB")?;
            if fail.load(Ordering::SeqCst) {
                return Err(StateError::Aborted("fnB refused".to_string()).into());
            }
            Ok(())
        })
        .build()
        .unwrap();
    Scenario {
        registry,
        fail_b,
        calls,
    }
}

fn marker(store: &StateStore) -> String {
    read_version(store).unwrap().unwrap()
}

#[test]
fn upgrade_walks_every_step_in_order() {
    let s = scenario();
    let store = StateStore::open_in_memory().unwrap();
    store.put(VERSION_KEY, b"1").unwrap();

    let to = upgrade_to_latest(&store, &s.registry, "1").unwrap();

    assert_eq!(to, "3");
    assert_eq!(marker(&store), "3");
    assert_eq!(*s.calls.lock().unwrap(), vec!["fnA", "fnB"]);
    assert_eq!(store.get("A/x").unwrap().value, b"from fnA");
    assert_eq!(store.get("B/x").unwrap().value, b"from fnB");
    assert_eq!(check_version(&store, &s.registry).unwrap(), VersionCheck::Current);
}

#[test]
fn failing_step_leaves_marker_at_last_completed_version() {
    let s = scenario();
    s.fail_b.store(true, Ordering::SeqCst);
    let store = StateStore::open_in_memory().unwrap();
    store.put(VERSION_KEY, b"1").unwrap();

    let err = upgrade_to_latest(&store, &s.registry, "1").unwrap_err();

    match &err {
        UpgradeError::StepFailed { name, .. } => assert_eq!(name, "fnB"),
        other => panic!("unexpected error: {other}"),
    }
    assert!(err.to_string().contains("fnB"));
    assert_eq!(marker(&store), "2");
    assert_eq!(store.get("A/x").unwrap().value, b"from fnA");
    assert!(matches!(store.get("B/x"), Err(StateError::NotFound(_))));

    // A restart resumes from the recorded version without re-running fnA.
    s.fail_b.store(false, Ordering::SeqCst);
    assert_eq!(
        check_version(&store, &s.registry).unwrap(),
        VersionCheck::UpgradeRequired("2".to_string())
    );
    upgrade_to_latest(&store, &s.registry, &marker(&store)).unwrap();
    assert_eq!(marker(&store), "3");
    assert_eq!(*s.calls.lock().unwrap(), vec!["fnA", "fnB", "fnB"]);
}

#[test]
fn unknown_start_version_writes_nothing() {
    let s = scenario();
    let store = StateStore::open_in_memory().unwrap();
    store.put(VERSION_KEY, b"0").unwrap();
    let rev = store.revision().unwrap();

    let err = upgrade_to_latest(&store, &s.registry, "0").unwrap_err();

    assert!(matches!(err, UpgradeError::UnknownVersion(_)));
    assert_eq!(store.revision().unwrap(), rev);
    assert_eq!(marker(&store), "0");
}

#[test]
fn additive_upgrade_is_idempotent() {
    let store = StateStore::open_in_memory().unwrap();
    for name in ["hamburg", "berlin"] {
        let key = format!(r#"Cloudlet/{{"organization":"op","name":"{name}"}}"#);
        let value = json!({"key": {"organization": "op", "name": name}});
        store.put(&key, &serde_json::to_vec(&value).unwrap()).unwrap();
    }
    let registry = VersionRegistry::builder()
        .version("1")
        .upgrade("2", "threshold", add_cloudlet_alert_threshold)
        .build()
        .unwrap();
    let step = registry.latest().upgrade.clone().unwrap();

    warpgrid_upgrade::run_single_upgrade(&store, &step).unwrap();
    let snapshot = dump(&store);
    let rev = store.revision().unwrap();

    warpgrid_upgrade::run_single_upgrade(&store, &step).unwrap();
    assert_eq!(dump(&store), snapshot);
    assert_eq!(store.revision().unwrap(), rev);
    assert!(
        snapshot
            .iter()
            .all(|(_, v)| v["default_resource_alert_threshold"] == json!(80))
    );
}

#[test]
fn default_registry_upgrades_from_first_version() {
    let registry = default_registry().unwrap();
    let store = StateStore::open_in_memory().unwrap();
    let first = registry.versions()[0].hash.clone();
    store.put(VERSION_KEY, first.as_bytes()).unwrap();

    let old_key = r#"AppInst/{"app_key":{"organization":"dev","name":"face","version":"1"},"cloudlet_key":{"organization":"op","name":"hamburg"}}"#;
    let old_value = json!({
        "key": {
            "app_key": {"organization": "dev", "name": "face", "version": "1"},
            "cloudlet_key": {"organization": "op", "name": "hamburg"}
        },
        "cluster_inst_key": {"cluster_key": {"name": "c1"}, "organization": "dev"}
    });
    store.put(old_key, &serde_json::to_vec(&old_value).unwrap()).unwrap();
    store
        .put(
            r#"Cloudlet/{"organization":"op","name":"hamburg"}"#,
            br#"{"key":{"organization":"op","name":"hamburg"}}"#,
        )
        .unwrap();

    assert_eq!(
        check_version(&store, &registry).unwrap(),
        VersionCheck::UpgradeRequired(first.clone())
    );
    let to = upgrade_to_latest(&store, &registry, &first).unwrap();

    assert_eq!(to, registry.latest().hash);
    assert_eq!(marker(&store), registry.latest().hash);
    assert!(store.get(old_key).is_err());
    let app_insts = dump(&store)
        .into_iter()
        .filter(|(k, _)| k.starts_with("AppInst/"))
        .count();
    assert_eq!(app_insts, 1);
}

fn dump(store: &StateStore) -> Vec<(String, Value)> {
    let mut out = Vec::new();
    store
        .list("", &mut |key, value, _| {
            if key != VERSION_KEY {
                out.push((key.to_string(), serde_json::from_slice(value).unwrap()));
            }
            Ok(())
        })
        .unwrap();
    out
}
