#![allow(dead_code)]

use std::path::Path;
use std::process::{Child, Command, ExitStatus, Stdio};
use std::thread;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use reqwest::blocking::{Client, Response};

pub struct ServerGuard {
    pub public_url: String,
    pub private_url: String,
    child: Child,
    _data_dir: Option<tempfile::TempDir>,
}

impl Drop for ServerGuard {
    fn drop(&mut self) {
        let _ = self.child.kill();
        let _ = self.child.wait();
    }
}

impl ServerGuard {
    /// Wait for the server process to exit on its own (e.g. after a `stop`
    /// action).
    pub fn wait_exit(&mut self, timeout: Duration) -> Option<ExitStatus> {
        let start = Instant::now();
        while start.elapsed() < timeout {
            if let Ok(Some(status)) = self.child.try_wait() {
                return Some(status);
            }
            thread::sleep(Duration::from_millis(20));
        }
        None
    }
}

pub fn spawn_server() -> Result<ServerGuard> {
    spawn_with(&[], |_| Ok(()))
}

/// Spawn `cirrus-server` against a fresh tempdir, after running `setup` on
/// the cloud directory (e.g. to drop in process scripts).
pub fn spawn_with(
    extra_args: &[&str],
    setup: impl FnOnce(&Path) -> Result<()>,
) -> Result<ServerGuard> {
    let data_dir = tempfile::tempdir().context("create server tempdir")?;
    setup(data_dir.path())?;
    let mut guard = spawn_in(data_dir.path(), extra_args)?;
    guard._data_dir = Some(data_dir);
    Ok(guard)
}

/// Spawn against an existing cloud directory (restart scenarios).
pub fn spawn_in(cloud_dir: &Path, extra_args: &[&str]) -> Result<ServerGuard> {
    let addr_file = cloud_dir.join("addr.txt");
    let _ = std::fs::remove_file(&addr_file);

    let mut args = vec![
        "--cloud-dir".to_string(),
        cloud_dir.to_string_lossy().into_owned(),
        "--public-port".to_string(),
        "0".to_string(),
        "--private-port".to_string(),
        "0".to_string(),
        "--addr-file".to_string(),
        addr_file.to_string_lossy().into_owned(),
    ];
    if !extra_args.contains(&"--rate-limit") {
        args.push("--rate-limit".to_string());
        args.push("0".to_string());
    }
    args.extend(extra_args.iter().map(|arg| arg.to_string()));

    let child = Command::new(env!("CARGO_BIN_EXE_cirrus-server"))
        .args(&args)
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .spawn()
        .context("spawn cirrus-server")?;

    let (public_url, private_url) = read_addr_file(&addr_file)?;
    wait_for_healthz(&public_url)?;
    wait_for_healthz(&private_url)?;

    Ok(ServerGuard {
        public_url,
        private_url,
        child,
        _data_dir: None,
    })
}

fn read_addr_file(addr_file: &Path) -> Result<(String, String)> {
    let start = Instant::now();
    loop {
        if start.elapsed() > Duration::from_secs(10) {
            anyhow::bail!("addr file not written at {}", addr_file.display());
        }
        if let Ok(text) = std::fs::read_to_string(addr_file) {
            let public = text
                .lines()
                .find_map(|line| line.strip_prefix("public="))
                .map(str::to_string);
            let private = text
                .lines()
                .find_map(|line| line.strip_prefix("private="))
                .map(str::to_string);
            if let (Some(public), Some(private)) = (public, private) {
                return Ok((format!("http://{public}"), format!("http://{private}")));
            }
        }
        thread::sleep(Duration::from_millis(10));
    }
}

fn wait_for_healthz(base_url: &str) -> Result<()> {
    let client = Client::new();
    let start = Instant::now();
    loop {
        if start.elapsed() > Duration::from_secs(10) {
            anyhow::bail!("server did not become healthy at {base_url}/healthz");
        }
        match client.get(format!("{base_url}/healthz")).send() {
            Ok(response) if response.status().is_success() => return Ok(()),
            _ => thread::sleep(Duration::from_millis(20)),
        }
    }
}

/// Issue one action request. `params` are the query parameters (`executor`,
/// `resource-name`, `resource-id`); `body` is the raw action payload.
pub fn act(
    client: &Client,
    base_url: &str,
    action: &str,
    params: &[(&str, &str)],
    body: Vec<u8>,
) -> Result<Response> {
    client
        .post(format!("{base_url}/action/{action}"))
        .query(params)
        .body(body)
        .send()
        .with_context(|| format!("send action {action}"))
}

pub fn error_kind(response: &Response) -> Option<String> {
    response
        .headers()
        .get("x-cirrus-error")
        .and_then(|value| value.to_str().ok())
        .map(str::to_string)
}
