//! Runtime driver tests against the in-memory engine

mod common;

use chrono::Utc;
use common::{container, test_config, FakeEngine};
use craftgate::definition::{ContainerDefinition, DefinitionContext, DefinitionGenerator};
use craftgate::engine::RuntimeError;
use craftgate::runtime::{DriverSettings, RuntimeDriver, DIGEST_LABEL};
use craftgate::workload::{ResourceLimits, RuntimeSelector, Workload, MINECRAFT_PORT};
use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

fn workload(id: &str) -> Workload {
    Workload {
        id: id.to_string(),
        name: "Survival".to_string(),
        subdomain: "survival".to_string(),
        runtime: RuntimeSelector::default(),
        resources: ResourceLimits::default(),
        port: MINECRAFT_PORT,
        services: BTreeMap::new(),
        modpack: None,
        created_at: Utc::now(),
    }
}

struct Fixture {
    _dir: tempfile::TempDir,
    engine: Arc<FakeEngine>,
    driver: RuntimeDriver<FakeEngine>,
    generator: DefinitionGenerator,
}

fn fixture() -> Fixture {
    let dir = tempfile::tempdir().unwrap();
    let config = test_config(&dir);
    let engine = FakeEngine::new();
    Fixture {
        driver: RuntimeDriver::new(engine.clone(), DriverSettings::from_config(&config)),
        generator: DefinitionGenerator::new(DefinitionContext::from_config(&config)),
        engine,
        _dir: dir,
    }
}

impl Fixture {
    fn definition(&self, w: &Workload) -> ContainerDefinition {
        self.generator.generate(w).unwrap()
    }

    async fn running(&self, id: &str) {
        let def = self.definition(&workload(id));
        self.driver.ensure_definition_applied(&def).await.unwrap();
        self.driver.start(id).await.unwrap();
    }
}

async fn wait_until(mut check: impl FnMut() -> bool) {
    for _ in 0..200 {
        if check() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("condition not reached");
}

fn collector() -> (Arc<Mutex<Vec<String>>>, impl Fn(String) + Send + 'static) {
    let lines = Arc::new(Mutex::new(Vec::new()));
    let sink = lines.clone();
    (lines, move |line| sink.lock().push(line))
}

#[tokio::test]
async fn test_new_tail_replaces_old_without_cross_talk() {
    let f = fixture();
    f.running("w1").await;
    f.engine.emit_log(&container("w1"), "before");

    let (first_lines, first_sink) = collector();
    let first = f.driver.tail_logs("w1", first_sink).await;
    wait_until(|| first_lines.lock().contains(&"before".to_string())).await;
    assert!(first.is_active());

    let (second_lines, second_sink) = collector();
    let second = f.driver.tail_logs("w1", second_sink).await;
    assert!(!first.is_active());
    assert!(second.is_active());
    assert_eq!(f.engine.follower_count(&container("w1")), 1);

    f.engine.emit_log(&container("w1"), "after");
    wait_until(|| second_lines.lock().contains(&"after".to_string())).await;
    assert!(!first_lines.lock().contains(&"after".to_string()));

    // Cancelling the superseded handle leaves the live tail alone
    first.cancel().await;
    assert!(f.driver.has_active_tail("w1"));

    second.cancel().await;
    assert!(!f.driver.has_active_tail("w1"));
    assert_eq!(f.engine.follower_count(&container("w1")), 0);
}

#[tokio::test]
async fn test_tails_of_different_workloads_are_independent() {
    let f = fixture();
    f.running("a").await;
    f.running("b").await;

    let (a_lines, a_sink) = collector();
    let (b_lines, b_sink) = collector();
    let _a = f.driver.tail_logs("a", a_sink).await;
    let _b = f.driver.tail_logs("b", b_sink).await;

    f.engine.emit_log(&container("a"), "from a");
    f.engine.emit_log(&container("b"), "from b");
    wait_until(|| a_lines.lock().len() == 1 && b_lines.lock().len() == 1).await;

    assert_eq!(*a_lines.lock(), vec!["from a".to_string()]);
    assert_eq!(*b_lines.lock(), vec!["from b".to_string()]);

    f.driver.cancel_tail("a").await;
    assert!(!f.driver.has_active_tail("a"));
    assert!(f.driver.has_active_tail("b"));
}

#[tokio::test]
async fn test_tail_ends_when_container_is_destroyed() {
    let f = fixture();
    f.running("w1").await;

    let (_lines, sink) = collector();
    let handle = f.driver.tail_logs("w1", sink).await;
    assert!(handle.is_active());

    f.driver.destroy("w1").await.unwrap();
    assert!(!handle.is_active());
    assert!(f.engine.container(&container("w1")).is_none());
}

#[tokio::test]
async fn test_ensure_definition_applied_recreates_on_drift() {
    let f = fixture();
    let mut w = workload("w1");
    let original = f.definition(&w);

    f.driver.ensure_definition_applied(&original).await.unwrap();
    f.driver.ensure_definition_applied(&original).await.unwrap();
    assert_eq!(f.engine.count_calls("create"), 1);
    assert!(!f.engine.is_running(&container("w1")));

    f.driver.start("w1").await.unwrap();
    w.resources.max_ram = 8192;
    let changed = f.definition(&w);
    assert_ne!(changed.digest(), original.digest());

    // Running containers are never replaced underneath the player
    f.driver.ensure_definition_applied(&changed).await.unwrap();
    assert_eq!(f.engine.count_calls("create"), 1);

    f.engine.exit(&container("w1"));
    f.driver.ensure_definition_applied(&changed).await.unwrap();
    assert_eq!(f.engine.count_calls("remove"), 1);
    assert_eq!(f.engine.count_calls("create"), 2);

    let recreated = f.engine.container(&container("w1")).unwrap();
    assert_eq!(recreated.labels[DIGEST_LABEL], changed.digest());
    assert_eq!(
        recreated.definition.unwrap().env["MEMORY"],
        "8192M"
    );
}

#[tokio::test]
async fn test_missing_container_is_tolerated() {
    let f = fixture();

    f.driver.stop("ghost").await.unwrap();
    f.driver.kill("ghost").await.unwrap();
    f.driver.destroy("ghost").await.unwrap();
    assert!(!f.driver.is_running("ghost").await);
    assert!(f.driver.fetch_logs("ghost", 100).await.is_empty());

    let err = f.driver.start("ghost").await.unwrap_err();
    assert!(matches!(err, RuntimeError::NotFound(_)));
}

#[tokio::test]
async fn test_unreachable_engine_reads_as_stopped() {
    let f = fixture();
    f.running("w1").await;

    f.engine.fail("inspect", RuntimeError::Unavailable("daemon down".into()));
    assert!(!f.driver.is_running("w1").await);

    let err = f.driver.send_command("w1", "list").await.unwrap_err();
    assert!(matches!(err, RuntimeError::CommandDelivery(_)));
}

#[tokio::test]
async fn test_send_command_runs_console_helper() {
    let f = fixture();
    f.running("w1").await;

    f.driver.send_command("w1", "whitelist add Steve").await.unwrap();
    let execs = f.engine.execs();
    assert_eq!(execs.len(), 1);
    assert_eq!(execs[0].0, container("w1"));
    assert_eq!(
        execs[0].2,
        vec!["mc-send-to-console".to_string(), "whitelist add Steve".to_string()]
    );

    f.engine.exit(&container("w1"));
    let err = f.driver.send_command("w1", "list").await.unwrap_err();
    assert!(matches!(err, RuntimeError::CommandDelivery(_)));
}

#[tokio::test]
async fn test_fetch_logs_returns_most_recent_lines() {
    let f = fixture();
    f.running("w1").await;
    for i in 0..10 {
        f.engine.emit_log(&container("w1"), &format!("line {}", i));
    }

    let lines = f.driver.fetch_logs("w1", 3).await;
    assert_eq!(lines, vec!["line 7", "line 8", "line 9"]);
}
