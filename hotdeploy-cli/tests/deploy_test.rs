//! Deploy orchestration against a scripted host

use async_trait::async_trait;
use hotdeploy::{CallError, Caller};
use hotdeploy_api::{codes, MANIFEST_FILE};
use hotdeploy_cli::{
    Activation, DeployError, DeployTarget, Deployer, SecondarySet, TransferStrategy,
};
use serde_json::{json, Value};
use std::collections::HashSet;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tempfile::TempDir;

/// Records every call and answers like a directory-backed host
#[derive(Default)]
struct ScriptedHost {
    calls: Mutex<Vec<(String, Vec<Value>)>>,
    registered: Mutex<HashSet<String>>,
    fail_registration: bool,
    delay: Duration,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
}

impl ScriptedHost {
    fn methods(&self) -> Vec<String> {
        self.calls
            .lock()
            .unwrap()
            .iter()
            .map(|(method, _)| method.clone())
            .collect()
    }

    fn params_of(&self, method: &str) -> Vec<Vec<Value>> {
        self.calls
            .lock()
            .unwrap()
            .iter()
            .filter(|(m, _)| m == method)
            .map(|(_, params)| params.clone())
            .collect()
    }
}

#[async_trait]
impl Caller for ScriptedHost {
    async fn call(
        &self,
        method: &str,
        params: Vec<Value>,
        _timeout: Duration,
    ) -> Result<Value, CallError> {
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(now, Ordering::SeqCst);
        self.calls
            .lock()
            .unwrap()
            .push((method.to_string(), params.clone()));
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }

        let id = params
            .first()
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string();
        let result = match method {
            "removeDir" | "setUnitStatus" | "loadUnitById" => Ok(json!(true)),
            "writeFiles" => Ok(json!(params[0].as_array().map(Vec::len).unwrap_or(0))),
            "reloadUnit" => Ok(json!(self.registered.lock().unwrap().contains(&id))),
            "loadDirectoryUnit" if self.fail_registration => Err(CallError::Remote {
                method: method.to_string(),
                code: codes::UNIT_ERROR,
                message: "manifest rejected".to_string(),
            }),
            "loadDirectoryUnit" => {
                self.registered.lock().unwrap().insert(id.clone());
                Ok(json!({
                    "id": id,
                    "fileId": id,
                    "name": id,
                    "enabled": true,
                    "loaded": true,
                    "runtimeStatus": "loaded"
                }))
            }
            other => Err(CallError::Remote {
                method: other.to_string(),
                code: codes::METHOD_NOT_FOUND,
                message: "Method not found".to_string(),
            }),
        };

        self.in_flight.fetch_sub(1, Ordering::SeqCst);
        result
    }
}

fn build_output(parent: &Path, name: &str) -> PathBuf {
    let dir = parent.join("build");
    fs::create_dir_all(dir.join("js")).unwrap();
    fs::write(
        dir.join(MANIFEST_FILE),
        json!({ "name": name, "version": "1.0.0" }).to_string(),
    )
    .unwrap();
    fs::write(dir.join("js").join("main.js"), "export default 1;").unwrap();
    dir
}

fn remote() -> DeployTarget {
    DeployTarget {
        strategy: TransferStrategy::Remote,
        managed_root: None,
    }
}

#[tokio::test]
async fn test_missing_manifest_makes_no_calls() {
    let temp = TempDir::new().unwrap();
    let host = ScriptedHost::default();

    let result = Deployer::default()
        .deploy(&host, &remote(), temp.path())
        .await;

    assert!(matches!(result, Err(DeployError::Precondition { .. })));
    assert!(host.methods().is_empty());
}

#[tokio::test]
async fn test_first_deploy_registers_then_reloads() {
    let temp = TempDir::new().unwrap();
    let source = build_output(temp.path(), "sample");
    let host = ScriptedHost::default();
    let deployer = Deployer::default();

    let first = deployer.deploy(&host, &remote(), &source).await.unwrap();
    assert_eq!(first.identity, "sample");
    assert_eq!(first.activation, Activation::Registered);
    assert!(first.activated);
    assert_eq!(first.files, 2);
    assert_eq!(
        host.methods(),
        [
            "removeDir",
            "writeFiles",
            "reloadUnit",
            "loadDirectoryUnit",
            "setUnitStatus",
            "loadUnitById"
        ]
    );
    assert_eq!(host.params_of("removeDir"), [vec![json!("sample")]]);

    let written = &host.params_of("writeFiles")[0][0];
    let mut paths: Vec<&str> = written
        .as_array()
        .unwrap()
        .iter()
        .map(|f| f["path"].as_str().unwrap())
        .collect();
    paths.sort();
    assert_eq!(paths, ["sample/js/main.js", "sample/manifest.json"]);

    host.calls.lock().unwrap().clear();
    let second = deployer.deploy(&host, &remote(), &source).await.unwrap();
    assert_eq!(second.activation, Activation::Reloaded);
    assert_eq!(host.methods(), ["removeDir", "writeFiles", "reloadUnit"]);
}

#[tokio::test]
async fn test_local_copy_into_managed_root() {
    let temp = TempDir::new().unwrap();
    let source = build_output(temp.path(), "sample");
    let root = temp.path().join("managed");
    fs::create_dir_all(root.join("sample")).unwrap();
    fs::write(root.join("sample").join("stale.js"), "old").unwrap();
    let host = ScriptedHost::default();

    let target = DeployTarget {
        strategy: TransferStrategy::Local,
        managed_root: Some(root.clone()),
    };
    let outcome = Deployer::default()
        .deploy(&host, &target, &source)
        .await
        .unwrap();

    assert_eq!(outcome.strategy, TransferStrategy::Local);
    assert!(root.join("sample").join(MANIFEST_FILE).exists());
    assert!(root.join("sample").join("js").join("main.js").exists());
    assert!(!root.join("sample").join("stale.js").exists());
    assert_eq!(
        host.methods(),
        ["reloadUnit", "loadDirectoryUnit", "setUnitStatus", "loadUnitById"]
    );
}

#[tokio::test]
async fn test_local_strategy_without_root_fails_before_calls() {
    let temp = TempDir::new().unwrap();
    let source = build_output(temp.path(), "sample");
    let host = ScriptedHost::default();

    let target = DeployTarget {
        strategy: TransferStrategy::Local,
        managed_root: None,
    };
    let result = Deployer::default().deploy(&host, &target, &source).await;

    assert!(matches!(result, Err(DeployError::Precondition { .. })));
    assert!(host.methods().is_empty());
}

#[tokio::test]
async fn test_build_output_inside_its_destination_is_refused() {
    let temp = TempDir::new().unwrap();
    let root = temp.path().join("managed");
    fs::create_dir_all(&root).unwrap();
    // Build output already sits where the deploy would put it
    let source = build_output(&root, "build");
    let in_place = root.join("sample");
    fs::rename(&source, &in_place).unwrap();
    fs::write(
        in_place.join(MANIFEST_FILE),
        json!({ "name": "sample" }).to_string(),
    )
    .unwrap();

    for strategy in [TransferStrategy::Local, TransferStrategy::Remote] {
        let host = ScriptedHost::default();
        let target = DeployTarget {
            strategy,
            managed_root: Some(root.clone()),
        };
        let result = Deployer::default().deploy(&host, &target, &in_place).await;

        assert!(
            matches!(result, Err(DeployError::Precondition { .. })),
            "{:?}",
            result
        );
        assert!(host.methods().is_empty());
    }
    assert!(in_place.join(MANIFEST_FILE).exists());
    assert!(in_place.join("js").join("main.js").exists());

    // Another unit's build output kept under the managed root is fine
    let host = ScriptedHost::default();
    let target = DeployTarget {
        strategy: TransferStrategy::Local,
        managed_root: Some(root.clone()),
    };
    let elsewhere = build_output(&root.join("sources"), "other");
    let outcome = Deployer::default()
        .deploy(&host, &target, &elsewhere)
        .await
        .unwrap();
    assert_eq!(outcome.identity, "other");
    assert!(root.join("other").join("js").join("main.js").exists());
}

#[tokio::test]
async fn test_activation_failure_keeps_transferred_files() {
    let temp = TempDir::new().unwrap();
    let source = build_output(temp.path(), "sample");
    let root = temp.path().join("managed");
    let host = ScriptedHost {
        fail_registration: true,
        ..ScriptedHost::default()
    };

    let target = DeployTarget {
        strategy: TransferStrategy::Local,
        managed_root: Some(root.clone()),
    };
    let result = Deployer::default().deploy(&host, &target, &source).await;

    match result {
        Err(DeployError::Activation { identity, source }) => {
            assert_eq!(identity, "sample");
            assert!(matches!(source, CallError::Remote { code, .. } if code == codes::UNIT_ERROR));
        }
        other => panic!("Expected activation failure, got {:?}", other),
    }
    assert!(root.join("sample").join(MANIFEST_FILE).exists());
    // No enable/load after a failed registration
    assert_eq!(host.methods(), ["reloadUnit", "loadDirectoryUnit"]);
}

#[tokio::test]
async fn test_secondary_sets_ship_under_the_unit() {
    let temp = TempDir::new().unwrap();
    let source = build_output(temp.path(), "sample");
    let webui = temp.path().join("webui");
    fs::create_dir_all(&webui).unwrap();
    fs::write(webui.join("index.html"), "<html></html>").unwrap();

    let deployer = Deployer::new(vec![
        SecondarySet {
            name: "webui".to_string(),
            source: webui,
            command: None,
            subdir: "webui".to_string(),
            workdir: None,
        },
        SecondarySet {
            name: "docs".to_string(),
            source: temp.path().join("missing"),
            command: None,
            subdir: "docs".to_string(),
            workdir: None,
        },
    ]);
    let host = ScriptedHost::default();

    let outcome = deployer.deploy(&host, &remote(), &source).await.unwrap();

    assert!(outcome.activated);
    assert_eq!(outcome.secondary.len(), 2);
    assert_eq!(outcome.secondary[0].result.as_ref().unwrap(), &1);
    assert!(outcome.secondary[1].result.is_err());
    assert_eq!(
        host.params_of("removeDir"),
        [vec![json!("sample")], vec![json!("sample/webui")]]
    );
    let webui_write = &host.params_of("writeFiles")[1][0];
    assert_eq!(webui_write[0]["path"], "sample/webui/index.html");
}

#[tokio::test]
async fn test_same_identity_deploys_do_not_overlap() {
    let temp = TempDir::new().unwrap();
    let source = build_output(temp.path(), "sample");
    let host = Arc::new(ScriptedHost {
        delay: Duration::from_millis(10),
        ..ScriptedHost::default()
    });
    let deployer = Deployer::default();
    let target = remote();

    let (first, second) = tokio::join!(
        deployer.deploy(&*host, &target, &source),
        deployer.deploy(&*host, &target, &source)
    );

    let mut activations = vec![first.unwrap().activation, second.unwrap().activation];
    activations.sort_by_key(|a| *a == Activation::Reloaded);
    assert_eq!(activations, [Activation::Registered, Activation::Reloaded]);
    assert_eq!(host.max_in_flight.load(Ordering::SeqCst), 1);
    assert_eq!(host.params_of("loadDirectoryUnit").len(), 1);
}
