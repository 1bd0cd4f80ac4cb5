use std::collections::HashMap;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::{Arc, Mutex, RwLock};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tracing::{debug, error, info};
use uuid::Uuid;

use crate::model::access::{
    AccessMasks, AccessOwner, AccessQuery, AccessRights, MODE_EXECUTE, authorize_user_access,
};
use crate::model::error::{ErrorKind, ServiceError, ServiceResult};
use crate::model::identity::{ROOT_GROUP, ROOT_USER, UserInfo};
use crate::model::process::{ProcessInfo, ProcessRequest, ProcessResult};
use crate::persist::write_atomic;
use crate::services::stats::ServiceStatistics;

/// Placeholder in catalog executables resolved to the processes directory.
const PROCESSES_PLACEHOLDER: &str = "<processes>";

#[derive(Debug, Default, Serialize, Deserialize)]
struct CatalogDocument {
    #[serde(default)]
    processes: Vec<ProcessInfo>,
}

/// Posted to the dispatcher when a child finishes (or fails to start).
#[derive(Debug)]
pub struct ProcessCompletion {
    pub request_id: Uuid,
    pub result: ProcessResult,
}

#[derive(Clone, Debug)]
pub struct ProcessSettings {
    pub processes_dir: PathBuf,
    pub working_dir: PathBuf,
    pub log_dir: PathBuf,
    pub ca_dir: PathBuf,
}

/// Named external programs with access rights, plus the lifecycle of their
/// spawned children. Finished results are retained until the dispatcher
/// finalizes them.
pub struct ProcessService {
    file_path: PathBuf,
    settings: ProcessSettings,
    processes: RwLock<Vec<ProcessInfo>>,
    finished: Arc<Mutex<HashMap<Uuid, ProcessResult>>>,
    statistics: Arc<Mutex<ServiceStatistics>>,
    completions: tokio::sync::mpsc::UnboundedSender<ProcessCompletion>,
}

impl ProcessService {
    pub fn load(
        file_path: PathBuf,
        settings: ProcessSettings,
        completions: tokio::sync::mpsc::UnboundedSender<ProcessCompletion>,
    ) -> Result<Self> {
        let processes = if file_path.exists() {
            info!("reading processes file {}", file_path.display());
            let bytes = std::fs::read(&file_path)
                .with_context(|| format!("read {}", file_path.display()))?;
            let document: CatalogDocument = serde_json::from_slice(&bytes)
                .with_context(|| format!("parse {}", file_path.display()))?;
            document.processes
        } else {
            default_processes()
        };

        let service = Self {
            file_path,
            settings,
            processes: RwLock::new(processes),
            finished: Arc::new(Mutex::new(HashMap::new())),
            statistics: Arc::new(Mutex::new(ServiceStatistics::new("processes"))),
            completions,
        };
        service.write_file()?;
        Ok(service)
    }

    pub fn contains_process(&self, name: &str) -> bool {
        self.processes.read().unwrap().iter().any(|p| p.name == name)
    }

    pub fn find_process(&self, name: &str) -> Option<ProcessInfo> {
        self.processes
            .read()
            .unwrap()
            .iter()
            .find(|p| p.name == name)
            .cloned()
    }

    pub fn processes(&self) -> Vec<ProcessInfo> {
        self.processes.read().unwrap().clone()
    }

    pub fn authorize_user(&self, user: &UserInfo, name: &str) -> bool {
        match self.find_process(name) {
            Some(process) => {
                authorize_user_access(user, &process.access_rights, AccessQuery::Execute)
            }
            None => false,
        }
    }

    pub fn update_access_rights(
        &self,
        name: &str,
        access_rights: AccessRights,
    ) -> ServiceResult<ProcessInfo> {
        if !access_rights.is_valid() {
            return Err(ServiceError::invalid_input("Invalid access rights."));
        }
        let mut processes = self.processes.write().unwrap();
        let Some(process) = processes.iter_mut().find(|p| p.name == name) else {
            return Err(ServiceError::invalid_input(format!(
                "Process \"{name}\" does not exist."
            )));
        };
        info!("updating process \"{}\" access rights", name);
        process.access_rights = access_rights;
        let updated = process.clone();
        drop(processes);
        if let Err(err) = self.write_file() {
            error!("failed to write processes file: {err:#}");
        }
        Ok(updated)
    }

    /// Spawn the named process for `request`. The returned request id keys
    /// the completion the dispatcher will receive once the child exits.
    pub fn submit(&self, request: ProcessRequest) -> ServiceResult<Uuid> {
        let Some(info) = self.find_process(&request.name) else {
            return Err(ServiceError::invalid_input(format!(
                "Invalid process. Process \"{}\" is not valid.",
                request.name
            )));
        };

        let executable = info.executable.replace(
            PROCESSES_PLACEHOLDER,
            &self.settings.processes_dir.to_string_lossy(),
        );
        let arguments = render_arguments(&info.arguments, &request.argument_values);

        let work_dir = self.settings.working_dir.join(&info.name);
        std::fs::create_dir_all(&work_dir).map_err(|err| {
            error!("failed to create directory {}: {err}", work_dir.display());
            ServiceError::new(ErrorKind::Application, "Internal application error")
        })?;

        let log_file = self.settings.log_dir.join(format!(
            "{}-{}.log",
            request.name, request.executor.name
        ));

        let id = Uuid::new_v4();
        debug!(
            "starting process id=\"{}\" command=\"{} {}\"",
            id,
            executable,
            arguments.join(" ")
        );

        let mut command = tokio::process::Command::new(&executable);
        command
            .args(&arguments)
            .current_dir(&work_dir)
            .env("CLOUD_PROCESS_WORK_DIR", &work_dir)
            .env("CLOUD_PROCESS_RANGE_CA_DIR", &self.settings.ca_dir)
            .env(
                "CLOUD_PROCESS_EXECUTOR",
                format!(
                    "{}:{}",
                    request.executor.name,
                    request.executor.group_names.join(",")
                ),
            )
            .env(
                "CLOUD_PROCESS_OWNER",
                format!(
                    "{}:{}",
                    info.access_rights.owner.user, info.access_rights.owner.group
                ),
            )
            .env("CLOUD_PROCESS_LOG_FILE", &log_file)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());

        self.statistics
            .lock()
            .unwrap()
            .record_counter(&format!("{}Started", info.name), 1);

        let finished = self.finished.clone();
        let statistics = self.statistics.clone();
        let completions = self.completions.clone();
        let name = info.name.clone();

        match command.spawn() {
            Ok(child) => {
                tokio::spawn(async move {
                    let result = match child.wait_with_output().await {
                        Ok(output) => {
                            let success = output.status.success();
                            statistics.lock().unwrap().record_counter(
                                &format!("{}{}", name, if success { "Finished" } else { "Crashed" }),
                                1,
                            );
                            info!(
                                "process id=\"{}\" finished with status {}",
                                id, output.status
                            );
                            let mut errors =
                                String::from_utf8_lossy(&output.stderr).into_owned();
                            if !success && errors.is_empty() {
                                errors = "Child process failed.".to_string();
                            }
                            ProcessResult {
                                request,
                                output: String::from_utf8_lossy(&output.stdout).into_owned(),
                                errors,
                                error: if success {
                                    ErrorKind::None
                                } else {
                                    ErrorKind::ChildProcess
                                },
                            }
                        }
                        Err(err) => {
                            statistics
                                .lock()
                                .unwrap()
                                .record_counter(&format!("{}Errored", name), 1);
                            error!("process id=\"{}\" failed: {err}", id);
                            ProcessResult {
                                request,
                                output: String::new(),
                                errors: format!("Child process failed. {err}"),
                                error: ErrorKind::ChildProcess,
                            }
                        }
                    };
                    finished.lock().unwrap().insert(id, result.clone());
                    let _ = completions.send(ProcessCompletion {
                        request_id: id,
                        result,
                    });
                });
            }
            Err(err) => {
                // A child that never started still completes through the
                // normal channel so the dispatcher sees one resolution path.
                statistics
                    .lock()
                    .unwrap()
                    .record_counter(&format!("{}Errored", name), 1);
                error!("failed to start process \"{}\": {err}", executable);
                let result = ProcessResult {
                    request,
                    output: String::new(),
                    errors: format!("Child process failed. {err}"),
                    error: ErrorKind::ChildProcess,
                };
                finished.lock().unwrap().insert(id, result.clone());
                let _ = completions.send(ProcessCompletion {
                    request_id: id,
                    result,
                });
            }
        }

        Ok(id)
    }

    /// Drop a finished process once the dispatcher has consumed its result.
    pub fn finalize_process(&self, id: Uuid) {
        debug!("finalize process id=\"{}\"", id);
        self.finished.lock().unwrap().remove(&id);
    }

    pub fn write_file(&self) -> Result<()> {
        let document = CatalogDocument {
            processes: self.processes.read().unwrap().clone(),
        };
        let bytes = serde_json::to_vec_pretty(&document).context("serialize processes")?;
        write_atomic(&self.file_path, &bytes)
    }

    pub fn statistics_json(&self) -> serde_json::Value {
        let mut json = self.statistics.lock().unwrap().to_json();
        json["size"] = serde_json::json!(self.processes.read().unwrap().len());
        json
    }
}

/// Fill `<key>` placeholders from the request's argument values.
fn render_arguments(
    template: &[String],
    values: &std::collections::BTreeMap<String, String>,
) -> Vec<String> {
    template
        .iter()
        .map(|argument| {
            let mut argument = argument.clone();
            for (key, value) in values {
                argument = argument.replace(&format!("<{key}>"), value);
            }
            argument
        })
        .collect()
}

fn default_processes() -> Vec<ProcessInfo> {
    let access_rights = AccessRights::new(
        AccessOwner::new(ROOT_USER, ROOT_GROUP),
        AccessMasks::new(MODE_EXECUTE, MODE_EXECUTE, 0),
    );
    vec![
        ProcessInfo {
            name: "hello-world".into(),
            executable: format!("{PROCESSES_PLACEHOLDER}/hello_world.sh"),
            arguments: vec![
                "--parameter1=<value1>".into(),
                "--parameter2=<value2>".into(),
                "--switch".into(),
            ],
            access_rights: access_rights.clone(),
        },
        ProcessInfo {
            name: "process-csr".into(),
            executable: format!("{PROCESSES_PLACEHOLDER}/process_csr.sh"),
            arguments: vec!["--csr-base64=<csr-content-base64>".into()],
            access_rights: access_rights.clone(),
        },
        ProcessInfo {
            name: "process-report".into(),
            executable: format!("{PROCESSES_PLACEHOLDER}/process_report.sh"),
            arguments: vec!["--report-base64=<report-content-base64>".into()],
            access_rights,
        },
    ]
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    fn settings(dir: &std::path::Path) -> ProcessSettings {
        ProcessSettings {
            processes_dir: dir.join("processes"),
            working_dir: dir.join("var"),
            log_dir: dir.join("log"),
            ca_dir: dir.join("ca"),
        }
    }

    #[test]
    fn first_boot_writes_default_catalog() {
        let dir = tempfile::tempdir().unwrap();
        let (tx, _rx) = tokio::sync::mpsc::unbounded_channel();
        let service =
            ProcessService::load(dir.path().join("processes.json"), settings(dir.path()), tx)
                .unwrap();
        for name in ["hello-world", "process-csr", "process-report"] {
            assert!(service.contains_process(name), "missing {name}");
        }
        // Rewritten to disk.
        assert!(dir.path().join("processes.json").exists());
    }

    #[test]
    fn argument_templates_substitute_supplied_keys_only() {
        let template = vec![
            "--parameter1=<value1>".to_string(),
            "--parameter2=<value2>".to_string(),
            "--switch".to_string(),
        ];
        let mut values = BTreeMap::new();
        values.insert("value1".to_string(), "alpha".to_string());
        assert_eq!(
            render_arguments(&template, &values),
            vec![
                "--parameter1=alpha".to_string(),
                "--parameter2=<value2>".to_string(),
                "--switch".to_string(),
            ]
        );
    }

    #[test]
    fn execute_authorization_follows_rights() {
        let dir = tempfile::tempdir().unwrap();
        let (tx, _rx) = tokio::sync::mpsc::unbounded_channel();
        let service =
            ProcessService::load(dir.path().join("processes.json"), settings(dir.path()), tx)
                .unwrap();
        let admin = UserInfo::new("ops", vec!["root".to_string()]);
        let member = UserInfo::new("alice", vec!["users".to_string()]);
        assert!(service.authorize_user(&admin, "hello-world"));
        assert!(!service.authorize_user(&member, "hello-world"));
        assert!(!service.authorize_user(&admin, "missing"));
    }

    #[tokio::test]
    async fn submitted_process_completes_with_captured_output() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("processes.json");
        let document = serde_json::json!({
            "processes": [{
                "name": "echo",
                "executable": "/bin/echo",
                "arguments": ["hello", "<word>"],
                "accessRights": {
                    "owner": {"user": "root", "group": "root"},
                    "mode": {"user": 4, "group": 4, "other": 0}
                }
            }]
        });
        std::fs::write(&file, serde_json::to_vec(&document).unwrap()).unwrap();

        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
        let service = ProcessService::load(file, settings(dir.path()), tx).unwrap();

        let mut values = BTreeMap::new();
        values.insert("word".to_string(), "world".to_string());
        let request = ProcessRequest {
            name: "echo".into(),
            argument_values: values,
            executor: UserInfo::new("root", vec!["root".to_string()]),
        };
        let id = service.submit(request).unwrap();

        let completion = rx.recv().await.unwrap();
        assert_eq!(completion.request_id, id);
        assert_eq!(completion.result.error, ErrorKind::None);
        assert_eq!(completion.result.output, "hello world\n");
        service.finalize_process(id);
    }

    #[tokio::test]
    async fn missing_executable_yields_child_process_error() {
        let dir = tempfile::tempdir().unwrap();
        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
        let service =
            ProcessService::load(dir.path().join("processes.json"), settings(dir.path()), tx)
                .unwrap();

        let request = ProcessRequest {
            name: "hello-world".into(),
            argument_values: BTreeMap::new(),
            executor: UserInfo::new("root", vec!["root".to_string()]),
        };
        // The default hello_world.sh script does not exist in the tempdir.
        service.submit(request).unwrap();
        let completion = rx.recv().await.unwrap();
        assert_eq!(completion.result.error, ErrorKind::ChildProcess);
        assert!(!completion.result.errors.is_empty());
    }
}
