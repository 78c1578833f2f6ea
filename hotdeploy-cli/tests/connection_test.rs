//! Client against a real host service

use hotdeploy_api::{RuntimeStatus, MANIFEST_FILE, UNIT_CHANGED_EVENT};
use hotdeploy_cli::shell::{ReplCommand, Reply, Shell, ShellError};
use hotdeploy_cli::{
    deploy, Activation, AuthState, ConnectionError, ConnectionManager, ConnectionState, Deployer,
    HostApi, TransferMode, TransferStrategy,
};
use hotdeploy_host::{DirectoryUnitManager, HostConfig, HostServer};
use serde_json::json;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;

async fn start_host(root: &Path, config: HostConfig) -> SocketAddr {
    let manager = DirectoryUnitManager::new(root).expect("Failed to create manager");
    let server = HostServer::bind(
        HostConfig {
            port: 0,
            ..config
        },
        Arc::new(manager),
    )
    .await
    .expect("Failed to bind");
    let addr = server.local_addr().unwrap();
    tokio::spawn(server.run());
    addr
}

fn auth_config(token: &str) -> HostConfig {
    HostConfig {
        enable_auth: true,
        token: token.to_string(),
        ..HostConfig::default()
    }
}

fn build_output(parent: &Path, name: &str) -> PathBuf {
    let dir = parent.join(format!("{}-build", name));
    std::fs::create_dir_all(&dir).unwrap();
    std::fs::write(
        dir.join(MANIFEST_FILE),
        json!({ "name": name, "version": "1.0.0" }).to_string(),
    )
    .unwrap();
    std::fs::write(dir.join("index.js"), "export const answer = 42;").unwrap();
    dir
}

#[tokio::test]
async fn test_connect_reaches_ready_with_capabilities() {
    let temp = TempDir::new().unwrap();
    let addr = start_host(temp.path(), auth_config("s3cret")).await;

    let (connection, _events) =
        ConnectionManager::new(&addr.to_string(), Some("s3cret".to_string()));
    assert_eq!(connection.state(), ConnectionState::Disconnected);

    connection.connect().await.unwrap();

    let status = connection.status();
    assert_eq!(status.state, ConnectionState::Ready);
    assert_eq!(status.auth, AuthState::Authenticated);
    assert!(status.capabilities.remote_transfer);
    assert_eq!(status.greeting.unwrap().self_id, "hotdeploy");
    let info = status.host_info.unwrap();
    assert_eq!(info.total_units, 0);
    assert_eq!(
        PathBuf::from(info.managed_root_path),
        temp.path().to_path_buf()
    );
}

#[tokio::test]
async fn test_wrong_token_is_final() {
    let temp = TempDir::new().unwrap();
    let addr = start_host(temp.path(), auth_config("s3cret")).await;

    let (connection, _events) =
        ConnectionManager::new(&addr.to_string(), Some("wrong".to_string()));

    let err = connection.connect().await.unwrap_err();
    assert!(matches!(err, ConnectionError::AuthRejected));
    assert!(!err.is_retryable());
    assert_eq!(connection.auth_state(), AuthState::Rejected);
    assert_eq!(connection.state(), ConnectionState::Disconnected);

    // No further attempt is made
    assert!(matches!(
        connection.ensure_ready().await,
        Err(ConnectionError::AuthRejected)
    ));
}

#[tokio::test]
async fn test_unreachable_host_is_retryable() {
    let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = listener.local_addr().unwrap();
    drop(listener);

    let (connection, _events) = ConnectionManager::new(&addr.to_string(), None);
    let connection = connection.with_connect_timeout(Duration::from_secs(2));

    let err = connection.connect().await.unwrap_err();
    assert!(err.is_retryable());
    assert_eq!(connection.state(), ConnectionState::Disconnected);
    assert_eq!(connection.auth_state(), AuthState::Unauthenticated);
}

#[tokio::test]
async fn test_ensure_ready_reconnects_after_close() {
    let temp = TempDir::new().unwrap();
    let addr = start_host(temp.path(), HostConfig::default()).await;

    let (connection, _events) = ConnectionManager::new(&addr.to_string(), None);
    connection.connect().await.unwrap();
    connection.close();
    assert_eq!(connection.state(), ConnectionState::Disconnected);
    assert!(connection.endpoint().is_none());

    let endpoint = connection.ensure_ready().await.unwrap();
    assert_eq!(connection.state(), ConnectionState::Ready);
    assert_eq!(HostApi::new(&*endpoint).ping().await.unwrap(), "pong");
}

#[tokio::test]
async fn test_deploy_end_to_end() {
    let temp = TempDir::new().unwrap();
    let root = temp.path().join("managed");
    let addr = start_host(&root, HostConfig::default()).await;
    let source = build_output(temp.path(), "sample");

    let (connection, mut events) = ConnectionManager::new(&addr.to_string(), None);
    let deployer = Deployer::default();

    let first = deploy::deploy_connected(&connection, &deployer, TransferMode::Auto, &source)
        .await
        .unwrap();
    assert_eq!(first.strategy, TransferStrategy::Remote);
    assert_eq!(first.activation, Activation::Registered);
    assert!(first.activated);
    assert_eq!(
        std::fs::read_to_string(root.join("sample").join("index.js")).unwrap(),
        "export const answer = 42;"
    );

    let endpoint = connection.ensure_ready().await.unwrap();
    let unit = HostApi::new(&*endpoint)
        .unit_info("sample")
        .await
        .unwrap()
        .unwrap();
    assert!(unit.loaded);
    assert_eq!(unit.runtime_status, RuntimeStatus::Loaded);

    let second = deploy::deploy_connected(&connection, &deployer, TransferMode::Local, &source)
        .await
        .unwrap();
    assert_eq!(second.strategy, TransferStrategy::Local);
    assert_eq!(second.activation, Activation::Reloaded);

    let event = tokio::time::timeout(Duration::from_secs(5), events.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(event.method, UNIT_CHANGED_EVENT);
    assert_eq!(event.params["id"], "sample");
}

#[tokio::test]
async fn test_shell_commands_against_host() {
    let temp = TempDir::new().unwrap();
    let root = temp.path().join("managed");
    let addr = start_host(&root, HostConfig::default()).await;
    let source = build_output(temp.path(), "sample");

    let (connection, _events) = ConnectionManager::new(&addr.to_string(), None);
    let mut shell = Shell::new(Arc::new(connection), Deployer::default(), TransferMode::Auto);

    let text = |reply: Reply| match reply {
        Reply::Text(text) => text,
        Reply::Quit => panic!("Unexpected quit"),
    };

    assert_eq!(text(shell.execute(ReplCommand::Ping).await.unwrap()), "pong");
    assert_eq!(text(shell.execute(ReplCommand::List).await.unwrap()), "No units");

    let deployed = text(shell.execute(ReplCommand::Deploy(source)).await.unwrap());
    assert!(deployed.starts_with("Deployed sample"), "{}", deployed);

    let listed = text(shell.execute(ReplCommand::List).await.unwrap());
    assert!(listed.starts_with("sample"), "{}", listed);

    let disabled = text(
        shell
            .execute(ReplCommand::Disable("sample".to_string()))
            .await
            .unwrap(),
    );
    assert_eq!(disabled, "Disabled sample");

    // Destructive commands against the host itself are refused
    assert!(shell
        .execute(ReplCommand::Unload("hotdeploy".to_string()))
        .await
        .is_err());

    let status = text(shell.execute(ReplCommand::Status).await.unwrap());
    assert!(status.contains("Ready"), "{}", status);

    assert_eq!(shell.execute(ReplCommand::Quit).await.unwrap(), Reply::Quit);
}

#[tokio::test]
async fn test_watch_refuses_managed_root() {
    let temp = TempDir::new().unwrap();
    let root = temp.path().join("managed");
    let addr = start_host(&root, HostConfig::default()).await;
    std::fs::create_dir_all(root.join("sample")).unwrap();
    let sources = temp.path().join("sources");
    std::fs::create_dir_all(&sources).unwrap();

    let (connection, _events) = ConnectionManager::new(&addr.to_string(), None);
    connection.connect().await.unwrap();
    let mut shell = Shell::new(Arc::new(connection), Deployer::default(), TransferMode::Auto);

    for path in [root.clone(), root.join("sample"), temp.path().to_path_buf()] {
        let result = shell
            .execute(ReplCommand::Watch {
                path: path.clone(),
                all: true,
            })
            .await;
        assert!(
            matches!(result, Err(ShellError::WatchOverlap { .. })),
            "{}: {:?}",
            path.display(),
            result
        );
    }
    assert!(!shell.is_watching());

    let reply = shell
        .execute(ReplCommand::Watch {
            path: sources,
            all: true,
        })
        .await
        .unwrap();
    assert!(matches!(reply, Reply::Text(text) if text.starts_with("Watching")));
    assert!(shell.is_watching());
    shell.unwatch().await;
}
