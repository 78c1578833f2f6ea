//! Interactive command shell
//!
//! Reads commands from stdin, prints host notifications as they arrive and
//! deploys units when the change watcher reports them.

use crate::api::HostApi;
use crate::connection::{ConnectionError, ConnectionManager};
use crate::deploy::{self, Activation, DeployError, DeployOutcome, Deployer};
use crate::transfer::{self, TransferMode};
use crate::watcher::{ChangeWatcher, WatchMode, WatchSignal, WatcherError};
use hotdeploy::CallError;
use hotdeploy_api::{Notification, UnitSummary, DEBOUNCE, UNIT_CHANGED_EVENT};
use std::io::Write;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::mpsc;

#[derive(Debug, Error)]
pub enum ShellError {
    #[error("{0}")]
    Usage(String),

    #[error(transparent)]
    Connection(#[from] ConnectionError),

    #[error(transparent)]
    Call(#[from] CallError),

    #[error(transparent)]
    Deploy(#[from] DeployError),

    #[error(transparent)]
    Watch(#[from] WatcherError),

    #[error("Refusing to watch {}: it overlaps the host's managed root {}", watch.display(), root.display())]
    WatchOverlap { watch: PathBuf, root: PathBuf },
}

impl ShellError {
    /// Errors after which the shell cannot continue
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            ShellError::Connection(ConnectionError::AuthRejected)
                | ShellError::Deploy(DeployError::Connection(ConnectionError::AuthRejected))
        )
    }
}

/// One parsed shell command
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReplCommand {
    List,
    Reload(String),
    Load(String),
    Unload(String),
    Info(String),
    Enable(String),
    Disable(String),
    Deploy(PathBuf),
    Watch { path: PathBuf, all: bool },
    Unwatch,
    Status,
    Ping,
    Help,
    Quit,
}

impl ReplCommand {
    /// Parse a line; blank lines yield `None`
    pub fn parse(line: &str) -> Result<Option<Self>, ShellError> {
        let mut words = line.split_whitespace();
        let Some(name) = words.next() else {
            return Ok(None);
        };
        let args: Vec<&str> = words.collect();

        let one = |usage: &str| -> Result<String, ShellError> {
            match args.as_slice() {
                [arg] => Ok(arg.to_string()),
                _ => Err(ShellError::Usage(format!("usage: {}", usage))),
            }
        };

        let command = match name {
            "list" | "ls" => ReplCommand::List,
            "reload" => ReplCommand::Reload(one("reload <id>")?),
            "load" => ReplCommand::Load(one("load <dir>")?),
            "unload" => ReplCommand::Unload(one("unload <id>")?),
            "info" => ReplCommand::Info(one("info <id>")?),
            "enable" => ReplCommand::Enable(one("enable <id>")?),
            "disable" => ReplCommand::Disable(one("disable <id>")?),
            "deploy" => ReplCommand::Deploy(PathBuf::from(one("deploy <dir>")?)),
            "watch" => match args.as_slice() {
                [path] => ReplCommand::Watch {
                    path: PathBuf::from(path),
                    all: false,
                },
                [path, "--all"] | ["--all", path] => ReplCommand::Watch {
                    path: PathBuf::from(path),
                    all: true,
                },
                _ => return Err(ShellError::Usage("usage: watch <dir> [--all]".to_string())),
            },
            "unwatch" => ReplCommand::Unwatch,
            "status" => ReplCommand::Status,
            "ping" => ReplCommand::Ping,
            "help" | "?" => ReplCommand::Help,
            "quit" | "exit" | "q" => ReplCommand::Quit,
            other => {
                return Err(ShellError::Usage(format!(
                    "Unknown command '{}'; type 'help' for a list",
                    other
                )))
            }
        };
        Ok(Some(command))
    }
}

/// Result of executing a command
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Reply {
    Text(String),
    Quit,
}

pub const HELP: &str = "\
Commands:
  list                   List units on the host
  info <id>              Show one unit
  reload <id>            Reload a unit
  load <dir>             Load a unit from a directory under the managed root
  unload <id>            Unregister a unit
  enable <id>            Enable a unit
  disable <id>           Disable a unit
  deploy <dir>           Copy a build output to the host and activate it
  watch <dir> [--all]    Deploy on change (--all: one unit per subdirectory)
  unwatch                Stop watching
  status                 Show connection state
  ping                   Check the host is answering
  help                   Show this help
  quit                   Exit";

/// Interactive session state
pub struct Shell {
    connection: Arc<ConnectionManager>,
    deployer: Deployer,
    transfer: TransferMode,
    debounce: Duration,
    watcher: Option<ChangeWatcher>,
    signals: Option<mpsc::Receiver<WatchSignal>>,
}

impl Shell {
    pub fn new(connection: Arc<ConnectionManager>, deployer: Deployer, transfer: TransferMode) -> Self {
        Self {
            connection,
            deployer,
            transfer,
            debounce: DEBOUNCE,
            watcher: None,
            signals: None,
        }
    }

    pub fn with_debounce(mut self, debounce: Duration) -> Self {
        self.debounce = debounce;
        self
    }

    pub fn is_watching(&self) -> bool {
        self.watcher.is_some()
    }

    /// Replace the current watch with one on `path`
    ///
    /// A root inside (or around) the host's managed root is refused: deploys
    /// would write into the watched tree and trigger themselves.
    pub async fn watch(&mut self, path: PathBuf, mode: WatchMode) -> Result<String, ShellError> {
        if let Some(info) = self.connection.host_info() {
            let root = PathBuf::from(info.managed_root_path);
            if transfer::paths_overlap(&path, &root) {
                return Err(ShellError::WatchOverlap { watch: path, root });
            }
        }
        self.unwatch().await;
        let (watcher, signals) = ChangeWatcher::start(&path, mode, self.debounce)?;
        let message = format!("Watching {} ({:?})", watcher.root().display(), mode);
        self.watcher = Some(watcher);
        self.signals = Some(signals);
        Ok(message)
    }

    pub async fn unwatch(&mut self) -> bool {
        self.signals = None;
        match self.watcher.take() {
            Some(watcher) => {
                watcher.shutdown().await;
                true
            }
            None => false,
        }
    }

    /// Execute one command
    pub async fn execute(&mut self, command: ReplCommand) -> Result<Reply, ShellError> {
        let text = match command {
            ReplCommand::Quit => return Ok(Reply::Quit),
            ReplCommand::Help => HELP.to_string(),
            ReplCommand::Status => self.status_text(),
            ReplCommand::Watch { path, all } => {
                let mode = if all { WatchMode::Multi } else { WatchMode::Single };
                self.watch(path, mode).await?
            }
            ReplCommand::Unwatch => {
                if self.unwatch().await {
                    "Stopped watching".to_string()
                } else {
                    "Not watching".to_string()
                }
            }
            ReplCommand::Deploy(dir) => {
                let outcome =
                    deploy::deploy_connected(&self.connection, &self.deployer, self.transfer, &dir)
                        .await?;
                format_outcome(&outcome)
            }
            command => {
                let endpoint = self.connection.ensure_ready().await?;
                let api = HostApi::new(&*endpoint);
                remote_command(&api, command).await?
            }
        };
        Ok(Reply::Text(text))
    }

    /// Deploy the unit a watch signal names
    pub async fn on_signal(&self, signal: WatchSignal) -> Result<String, ShellError> {
        tracing::debug!(unit = %signal.identity, path = %signal.path.display(), "Change detected");
        let outcome = deploy::deploy_connected(
            &self.connection,
            &self.deployer,
            self.transfer,
            &signal.root,
        )
        .await?;
        Ok(format_outcome(&outcome))
    }

    fn status_text(&self) -> String {
        let status = self.connection.status();
        let mut lines = vec![
            format!("Host:      {}", status.url),
            format!("State:     {:?}", status.state),
            format!("Auth:      {:?}", status.auth),
            format!(
                "Transfer:  {} (remote {})",
                self.transfer_label(),
                if status.capabilities.remote_transfer {
                    "supported"
                } else {
                    "unsupported"
                }
            ),
        ];
        if let Some(info) = &status.host_info {
            lines.push(format!(
                "Managed:   {} ({} units, {} loaded, up {}s, host {})",
                info.managed_root_path,
                info.total_units,
                info.loaded_units,
                info.uptime_seconds,
                info.version
            ));
        }
        if let Some(watcher) = &self.watcher {
            lines.push(format!(
                "Watching:  {} ({:?})",
                watcher.root().display(),
                watcher.mode()
            ));
        }
        if let Some(reason) = &status.last_close {
            lines.push(format!("Last close: {:?}", reason));
        }
        lines.join("\n")
    }

    fn transfer_label(&self) -> &'static str {
        match self.transfer {
            TransferMode::Auto => "auto",
            TransferMode::Local => "local",
            TransferMode::Remote => "remote",
        }
    }

    /// Read commands until quit, end of input (when not watching) or Ctrl-C
    pub async fn run(
        mut self,
        mut events: mpsc::UnboundedReceiver<Notification>,
    ) -> Result<(), ShellError> {
        let mut lines = BufReader::new(tokio::io::stdin()).lines();
        let mut stdin_open = true;
        prompt();

        loop {
            tokio::select! {
                line = lines.next_line(), if stdin_open => {
                    match line {
                        Ok(Some(line)) => {
                            let result = match ReplCommand::parse(&line) {
                                Ok(Some(command)) => self.execute(command).await,
                                Ok(None) => Ok(Reply::Text(String::new())),
                                Err(e) => Err(e),
                            };
                            match result {
                                Ok(Reply::Quit) => break,
                                Ok(Reply::Text(text)) => {
                                    if !text.is_empty() {
                                        println!("{}", text);
                                    }
                                }
                                Err(e) if e.is_fatal() => return Err(e),
                                Err(e) => eprintln!("Error: {}", e),
                            }
                            prompt();
                        }
                        Ok(None) | Err(_) => {
                            stdin_open = false;
                            if !self.is_watching() {
                                break;
                            }
                        }
                    }
                }

                Some(event) = events.recv() => {
                    println!("{}", format_event(&event));
                }

                signal = next_signal(&mut self.signals) => {
                    let unit = signal.identity.clone();
                    match self.on_signal(signal).await {
                        Ok(text) => println!("{}", text),
                        Err(e) if e.is_fatal() => return Err(e),
                        Err(e) => eprintln!("Deploy of {} failed: {}", unit, e),
                    }
                }

                _ = tokio::signal::ctrl_c() => break,
            }
        }

        self.unwatch().await;
        self.connection.close();
        Ok(())
    }
}

async fn next_signal(signals: &mut Option<mpsc::Receiver<WatchSignal>>) -> WatchSignal {
    if let Some(rx) = signals {
        if let Some(signal) = rx.recv().await {
            return signal;
        }
    }
    std::future::pending().await
}

fn prompt() {
    print!("hotdeploy> ");
    let _ = std::io::stdout().flush();
}

async fn remote_command(api: &HostApi<'_>, command: ReplCommand) -> Result<String, ShellError> {
    let text = match command {
        ReplCommand::Ping => api.ping().await?,
        ReplCommand::List => format_units(&api.all_units().await?),
        ReplCommand::Info(id) => match api.unit_info(&id).await? {
            Some(unit) => format_unit_detail(&unit),
            None => format!("Unit {} not found", id),
        },
        ReplCommand::Reload(id) => {
            if api.reload_unit(&id).await? {
                format!("Reloaded {}", id)
            } else {
                format!("Unit {} is not registered", id)
            }
        }
        ReplCommand::Load(name) => {
            api.load_directory_unit(&name).await?;
            format!("Loaded {}", name)
        }
        ReplCommand::Unload(id) => {
            if api.unregister_unit(&id).await? {
                format!("Unregistered {}", id)
            } else {
                format!("Unit {} is not registered", id)
            }
        }
        ReplCommand::Enable(id) => {
            api.set_unit_status(&id, true).await?;
            format!("Enabled {}", id)
        }
        ReplCommand::Disable(id) => {
            api.set_unit_status(&id, false).await?;
            format!("Disabled {}", id)
        }
        other => {
            return Err(ShellError::Usage(format!(
                "{:?} is not a host command",
                other
            )))
        }
    };
    Ok(text)
}

pub fn format_units(units: &[UnitSummary]) -> String {
    if units.is_empty() {
        return "No units".to_string();
    }
    units
        .iter()
        .map(|u| {
            format!(
                "{:<24} {:<10} {:<8} {}",
                u.id,
                u.version.as_deref().unwrap_or("-"),
                if u.enabled { "enabled" } else { "disabled" },
                serde_json::to_value(u.runtime_status)
                    .ok()
                    .and_then(|v| v.as_str().map(str::to_string))
                    .unwrap_or_default()
            )
        })
        .collect::<Vec<_>>()
        .join("\n")
}

fn format_unit_detail(unit: &UnitSummary) -> String {
    format!(
        "id:       {}\nname:     {}\ndir:      {}\nversion:  {}\nenabled:  {}\nloaded:   {}\nstatus:   {:?}",
        unit.id,
        unit.name,
        unit.file_id,
        unit.version.as_deref().unwrap_or("-"),
        unit.enabled,
        unit.loaded,
        unit.runtime_status
    )
}

pub fn format_outcome(outcome: &DeployOutcome) -> String {
    let how = match outcome.activation {
        Activation::Reloaded => "reloaded",
        Activation::Registered => "registered",
    };
    let mut text = format!(
        "Deployed {} ({} files, {} transfer, {}{})",
        outcome.identity,
        outcome.files,
        outcome.strategy,
        how,
        if outcome.activated { "" } else { ", not loaded" }
    );
    for report in &outcome.secondary {
        match &report.result {
            Ok(files) => text.push_str(&format!("\n  {}: {} files", report.name, files)),
            Err(e) => text.push_str(&format!("\n  {}: failed: {}", report.name, e)),
        }
    }
    text
}

pub fn format_event(event: &Notification) -> String {
    if event.method == UNIT_CHANGED_EVENT {
        let id = event.params["id"].as_str().unwrap_or("?");
        let action = event.params["action"].as_str().unwrap_or("changed");
        return format!("[host] {} {}", id, action);
    }
    format!("[host] {} {}", event.method, event.params)
}

impl std::fmt::Debug for Shell {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Shell")
            .field("connection", &self.connection)
            .field("watcher", &self.watcher)
            .finish()
    }
}
