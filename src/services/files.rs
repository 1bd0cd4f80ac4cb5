use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, Mutex, mpsc};
use std::thread::JoinHandle;

use anyhow::{Context, Result};
use time::OffsetDateTime;
use tracing::{debug, error, info};
use uuid::Uuid;

use crate::model::access::{AccessQuery, authorize_user_access};
use crate::model::error::{ErrorKind, ServiceError, ServiceResult};
use crate::model::file::{self, FileInfo, FileObject, MAX_TAGS};
use crate::model::identity::UserInfo;
use crate::persist::write_atomic;
use crate::services::directory::Directory;
use crate::services::stats::{ServiceStatistics, summarize};

const INDEX_FILE: &str = "index.txt";

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FileTaskKind {
    List,
    Info,
    Store,
    Update,
    UpdateAccessOwner,
    UpdateAccessMode,
    UpdateVersion,
    UpdateTags,
    Retrieve,
    Remove,
}

impl FileTaskKind {
    fn as_str(self) -> &'static str {
        match self {
            FileTaskKind::List => "list-files",
            FileTaskKind::Info => "file-info",
            FileTaskKind::Store => "store-file",
            FileTaskKind::Update => "update-file",
            FileTaskKind::UpdateAccessOwner => "update-file-access-owner",
            FileTaskKind::UpdateAccessMode => "update-file-access-mode",
            FileTaskKind::UpdateVersion => "update-file-version",
            FileTaskKind::UpdateTags => "update-file-tags",
            FileTaskKind::Retrieve => "retrieve-file",
            FileTaskKind::Remove => "remove-file",
        }
    }

    /// Mutating tasks rewrite the on-disk index after they run.
    fn mutates(self) -> bool {
        !matches!(
            self,
            FileTaskKind::List | FileTaskKind::Info | FileTaskKind::Retrieve
        )
    }
}

/// One unit of work for the store worker.
pub struct FileTask {
    pub id: Uuid,
    pub executor: UserInfo,
    pub kind: FileTaskKind,
    pub object: FileObject,
}

/// Posted back to the dispatcher when a task finishes.
#[derive(Debug)]
pub struct FileCompletion {
    pub request_id: Uuid,
    pub payload: Vec<u8>,
    pub error: ErrorKind,
}

enum WorkerMessage {
    Task(FileTask),
    Stop,
}

#[derive(Default)]
struct StoreState {
    index: HashMap<Uuid, FileInfo>,
    total_size: i64,
    statistics: ServiceStatistics,
}

/// The file store: one worker thread owns all mutation of the index and the
/// blob directory; producers enqueue tasks and receive completions through
/// the dispatcher channel.
pub struct FileService {
    sender: mpsc::Sender<WorkerMessage>,
    state: Arc<Mutex<StoreState>>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl FileService {
    pub fn start(
        store_dir: PathBuf,
        max_store_size: i64,
        max_file_size: i64,
        directory: Arc<Directory>,
        completions: tokio::sync::mpsc::UnboundedSender<FileCompletion>,
    ) -> Result<Self> {
        std::fs::create_dir_all(&store_dir)
            .with_context(|| format!("create store dir {}", store_dir.display()))?;

        let index_file = store_dir.join(INDEX_FILE);
        let index = load_index(&index_file)?;
        let total_size = index.values().map(|info| info.size).sum();
        info!(
            "file store {} loaded: {} files, {} bytes",
            store_dir.display(),
            index.len(),
            total_size
        );

        let state = Arc::new(Mutex::new(StoreState {
            index,
            total_size,
            statistics: ServiceStatistics::new("files"),
        }));

        let (sender, receiver) = mpsc::channel();
        let worker = Worker {
            store_dir,
            index_file,
            max_store_size,
            max_file_size,
            directory,
            state: state.clone(),
            completions,
        };
        let handle = std::thread::Builder::new()
            .name("file-service".into())
            .spawn(move || worker.run(receiver))
            .context("spawn file-service worker")?;

        Ok(Self {
            sender,
            state,
            worker: Mutex::new(Some(handle)),
        })
    }

    /// Enqueue a task; the returned request id keys the eventual completion.
    pub fn request(
        &self,
        kind: FileTaskKind,
        executor: UserInfo,
        object: FileObject,
    ) -> ServiceResult<Uuid> {
        let id = Uuid::new_v4();
        debug!(
            "file request id=\"{}\" action=\"{}\" executor=\"{}\" object-id=\"{}\"",
            id,
            kind.as_str(),
            executor.name,
            object.info.id
        );
        let task = FileTask {
            id,
            executor,
            kind,
            object,
        };
        self.sender
            .send(WorkerMessage::Task(task))
            .map_err(|_| ServiceError::new(ErrorKind::Application, "File service is stopped."))?;
        Ok(id)
    }

    /// Signal the worker to drain and wait for it to exit.
    pub fn stop(&self) {
        info!("signalling file service to stop");
        let _ = self.sender.send(WorkerMessage::Stop);
        if let Some(handle) = self.worker.lock().unwrap().take() {
            let _ = handle.join();
        }
        info!("file service has been stopped");
    }

    pub fn statistics_json(&self) -> serde_json::Value {
        let state = self.state.lock().unwrap();
        let sizes: Vec<f64> = state.index.values().map(|info| info.size as f64).collect();
        let mut json = state.statistics.to_json();
        json["index"] = serde_json::json!({
            "files": summarize(&sizes),
            "bytes": state.total_size,
            "size": state.index.len(),
        });
        json
    }

    #[cfg(test)]
    fn totals(&self) -> (usize, i64) {
        let state = self.state.lock().unwrap();
        (state.index.len(), state.total_size)
    }
}

struct Worker {
    store_dir: PathBuf,
    index_file: PathBuf,
    max_store_size: i64,
    max_file_size: i64,
    directory: Arc<Directory>,
    state: Arc<Mutex<StoreState>>,
    completions: tokio::sync::mpsc::UnboundedSender<FileCompletion>,
}

impl Worker {
    fn run(self, receiver: mpsc::Receiver<WorkerMessage>) {
        while let Ok(WorkerMessage::Task(task)) = receiver.recv() {
            let request_id = task.id;
            let kind = task.kind;
            let (payload, error) = {
                let mut state = self.state.lock().unwrap();
                match self.perform(&mut state, task) {
                    Ok(payload) => (payload, ErrorKind::None),
                    Err(err) => {
                        error!("{} failed: {}", kind.as_str(), err.message);
                        (err.message.into_bytes(), err.kind)
                    }
                }
            };

            if kind.mutates() {
                self.write_index();
            }

            if self
                .completions
                .send(FileCompletion {
                    request_id,
                    payload,
                    error,
                })
                .is_err()
            {
                debug!("dispatcher is gone, dropping completion {}", request_id);
            }
        }
        info!("file service worker exiting");
    }

    fn perform(&self, state: &mut StoreState, task: FileTask) -> ServiceResult<Vec<u8>> {
        let executor = &task.executor;
        match task.kind {
            FileTaskKind::List => self.list_files(state, executor),
            FileTaskKind::Info => self.file_info(state, executor, task.object.info.id),
            FileTaskKind::Store => self.store_file(state, executor, task.object),
            FileTaskKind::Update => self.update_file(state, executor, task.object),
            FileTaskKind::UpdateAccessOwner => self.update_access_owner(state, task.object),
            FileTaskKind::UpdateAccessMode => self.update_access_mode(state, executor, task.object),
            FileTaskKind::UpdateVersion => self.update_version(state, executor, task.object),
            FileTaskKind::UpdateTags => self.update_tags(state, executor, task.object),
            FileTaskKind::Retrieve => self.retrieve_file(state, executor, task.object.info.id),
            FileTaskKind::Remove => self.remove_file(state, executor, task.object.info.id),
        }
    }

    fn blob_path(&self, id: Uuid) -> PathBuf {
        self.store_dir.join(id.to_string())
    }

    fn list_files(&self, state: &StoreState, executor: &UserInfo) -> ServiceResult<Vec<u8>> {
        let files: Vec<&FileInfo> = state
            .index
            .values()
            .filter(|info| {
                authorize_user_access(executor, &info.access_rights, AccessQuery::Read)
            })
            .collect();
        let json = serde_json::json!({ "files": files });
        Ok(serde_json::to_vec(&json).unwrap_or_default())
    }

    fn file_info(&self, state: &StoreState, executor: &UserInfo, id: Uuid) -> ServiceResult<Vec<u8>> {
        let info = lookup(state, id)?;
        if !authorize_user_access(executor, &info.access_rights, AccessQuery::Read) {
            return Err(not_authorized(executor, "retrieve", id));
        }
        Ok(info_json(&info))
    }

    fn store_file(
        &self,
        state: &mut StoreState,
        executor: &UserInfo,
        object: FileObject,
    ) -> ServiceResult<Vec<u8>> {
        let mut info = object.info;
        if !authorize_user_access(executor, &info.access_rights, AccessQuery::Write) {
            return Err(not_authorized(executor, "store", info.id));
        }
        if self.max_file_size > 0 && object.content.len() as i64 > self.max_file_size {
            return Err(ServiceError::invalid_input(format!(
                "Invalid file size \"{} bytes\" (max: \"{} bytes\")",
                object.content.len(),
                self.max_file_size
            )));
        }
        if self.max_store_size > 0
            && object.content.len() as i64 + state.total_size > self.max_store_size
        {
            return Err(ServiceError::invalid_input(format!(
                "Invalid file size \"{} bytes\". File store is full.",
                object.content.len()
            )));
        }
        if !file::is_path_valid(&info.path) {
            return Err(ServiceError::invalid_input(format!(
                "Invalid path \"{}\"",
                info.path
            )));
        }

        self.write_blob(info.id, &object.content)?;
        let (size, checksum) = self.read_back(info.id)?;
        info.size = size;
        info.md5_checksum = checksum;
        let now = OffsetDateTime::now_utc().unix_timestamp();
        info.created_at = now;
        info.updated_at = now;

        state.total_size += info.size;
        state
            .statistics
            .record_value("fileSizeStore", info.size as f64);
        let payload = info_json(&info);
        state.index.insert(info.id, info);
        Ok(payload)
    }

    fn update_file(
        &self,
        state: &mut StoreState,
        executor: &UserInfo,
        object: FileObject,
    ) -> ServiceResult<Vec<u8>> {
        let mut info = lookup(state, object.info.id)?;
        if !authorize_user_access(executor, &info.access_rights, AccessQuery::Write) {
            return Err(not_authorized(executor, "update", info.id));
        }
        if !file::is_path_valid(&object.info.path) {
            return Err(ServiceError::invalid_input(format!(
                "Invalid path \"{}\"",
                object.info.path
            )));
        }

        info.path = object.info.path;
        info.updated_at = OffsetDateTime::now_utc().unix_timestamp();

        self.write_blob(info.id, &object.content)?;
        let old_size = info.size;
        let (size, checksum) = self.read_back(info.id)?;
        info.size = size;
        info.md5_checksum = checksum;

        state.total_size += info.size - old_size;
        state
            .statistics
            .record_value("fileSizeUpdate", info.size as f64);
        let payload = info_json(&info);
        state.index.insert(info.id, info);
        Ok(payload)
    }

    /// Replaces the owner only; the mode is preserved. The catalog already
    /// restricts this action to the root group, so the file's own rights are
    /// not consulted here.
    fn update_access_owner(
        &self,
        state: &mut StoreState,
        object: FileObject,
    ) -> ServiceResult<Vec<u8>> {
        let mut info = lookup(state, object.info.id)?;
        let owner = object.info.access_rights.owner;
        if !owner.is_valid() {
            return Err(ServiceError::invalid_input("Invalid access owner"));
        }
        if !self.directory.contains_user(&owner.user) {
            return Err(ServiceError::invalid_input(format!(
                "Invalid access owner user \"{}\"",
                owner.user
            )));
        }
        if !self.directory.contains_group(&owner.group) {
            return Err(ServiceError::invalid_input(format!(
                "Invalid access owner group \"{}\"",
                owner.group
            )));
        }
        info.access_rights.owner = owner;
        let payload = info_json(&info);
        state.index.insert(info.id, info);
        Ok(payload)
    }

    fn update_access_mode(
        &self,
        state: &mut StoreState,
        executor: &UserInfo,
        object: FileObject,
    ) -> ServiceResult<Vec<u8>> {
        let mut info = lookup(state, object.info.id)?;
        if !authorize_user_access(executor, &info.access_rights, AccessQuery::Ownership) {
            return Err(ServiceError::unauthorized(format!(
                "User \"{}\" is not authorized to change access mode of file id=\"{}\"",
                executor.name, info.id
            )));
        }
        let mode = object.info.access_rights.mode;
        if !mode.is_valid() {
            return Err(ServiceError::invalid_input("Invalid access mode"));
        }
        info.access_rights.mode = mode;
        let payload = info_json(&info);
        state.index.insert(info.id, info);
        Ok(payload)
    }

    fn update_version(
        &self,
        state: &mut StoreState,
        executor: &UserInfo,
        object: FileObject,
    ) -> ServiceResult<Vec<u8>> {
        let mut info = lookup(state, object.info.id)?;
        if !authorize_user_access(executor, &info.access_rights, AccessQuery::Write) {
            return Err(not_authorized(executor, "change version of", info.id));
        }
        info.version = object.info.version;
        let payload = info_json(&info);
        state.index.insert(info.id, info);
        Ok(payload)
    }

    fn update_tags(
        &self,
        state: &mut StoreState,
        executor: &UserInfo,
        object: FileObject,
    ) -> ServiceResult<Vec<u8>> {
        let mut info = lookup(state, object.info.id)?;
        if !authorize_user_access(executor, &info.access_rights, AccessQuery::Write) {
            return Err(not_authorized(executor, "change tags of", info.id));
        }
        let tags = object.info.tags;
        if tags.len() > MAX_TAGS {
            return Err(ServiceError::invalid_input(format!(
                "Invalid number of tags \"{}\" (max=\"{}\")",
                tags.len(),
                MAX_TAGS
            )));
        }
        for tag in &tags {
            if !file::is_tag_valid(tag) {
                return Err(ServiceError::invalid_input(format!("Invalid tag \"{tag}\"")));
            }
        }
        info.tags = tags;
        let payload = info_json(&info);
        state.index.insert(info.id, info);
        Ok(payload)
    }

    fn retrieve_file(
        &self,
        state: &mut StoreState,
        executor: &UserInfo,
        id: Uuid,
    ) -> ServiceResult<Vec<u8>> {
        let info = lookup(state, id)?;
        if !authorize_user_access(executor, &info.access_rights, AccessQuery::Read) {
            return Err(not_authorized(executor, "retrieve", id));
        }
        let bytes = std::fs::read(self.blob_path(id)).map_err(|_| {
            ServiceError::new(
                ErrorKind::ReadFile,
                format!("Failed to read file id=\"{id}\""),
            )
        })?;
        state
            .statistics
            .record_value("fileSizeRetrieve", info.size as f64);
        Ok(bytes)
    }

    /// Authorization happens before the index entry is touched, so a denied
    /// remove leaves the store unchanged.
    fn remove_file(
        &self,
        state: &mut StoreState,
        executor: &UserInfo,
        id: Uuid,
    ) -> ServiceResult<Vec<u8>> {
        let info = lookup(state, id)?;
        if !authorize_user_access(executor, &info.access_rights, AccessQuery::Write) {
            return Err(not_authorized(executor, "remove", id));
        }
        std::fs::remove_file(self.blob_path(id)).map_err(|_| {
            ServiceError::new(
                ErrorKind::WriteFile,
                format!("Failed to remove file id=\"{id}\""),
            )
        })?;
        state.index.remove(&id);
        state.total_size -= info.size;
        state
            .statistics
            .record_value("fileSizeRemove", info.size as f64);
        Ok(info_json(&info))
    }

    fn write_blob(&self, id: Uuid, content: &[u8]) -> ServiceResult<()> {
        std::fs::write(self.blob_path(id), content).map_err(|_| {
            ServiceError::new(
                ErrorKind::WriteFile,
                format!("Failed to write file id=\"{id}\""),
            )
        })
    }

    /// Size and checksum come from what actually landed on disk.
    fn read_back(&self, id: Uuid) -> ServiceResult<(i64, String)> {
        let bytes = std::fs::read(self.blob_path(id)).map_err(|_| {
            ServiceError::new(
                ErrorKind::ReadFile,
                format!("Failed to read file id=\"{id}\""),
            )
        })?;
        Ok((bytes.len() as i64, format!("{:x}", md5::compute(&bytes))))
    }

    fn write_index(&self) {
        let state = self.state.lock().unwrap();
        let mut lines = String::new();
        for info in state.index.values() {
            match serde_json::to_string(info) {
                Ok(line) => {
                    lines.push_str(&line);
                    lines.push('\n');
                }
                Err(err) => {
                    error!("failed to serialize index entry {}: {err}", info.id);
                    return;
                }
            }
        }
        debug!("writing index file {}", self.index_file.display());
        if let Err(err) = write_atomic(&self.index_file, lines.as_bytes()) {
            error!(
                "failed to write index file {}: {err:#}",
                self.index_file.display()
            );
        }
    }
}

fn lookup(state: &StoreState, id: Uuid) -> ServiceResult<FileInfo> {
    state
        .index
        .get(&id)
        .cloned()
        .ok_or_else(|| ServiceError::invalid_input(format!("File object \"{id}\" does not exist")))
}

fn not_authorized(executor: &UserInfo, verb: &str, id: Uuid) -> ServiceError {
    ServiceError::unauthorized(format!(
        "User \"{}\" is not authorized to {} file id=\"{}\"",
        executor.name, verb, id
    ))
}

fn info_json(info: &FileInfo) -> Vec<u8> {
    serde_json::to_vec(info).unwrap_or_default()
}

fn load_index(index_file: &PathBuf) -> Result<HashMap<Uuid, FileInfo>> {
    let mut index = HashMap::new();
    if !index_file.exists() {
        return Ok(index);
    }
    let text = std::fs::read_to_string(index_file)
        .with_context(|| format!("read {}", index_file.display()))?;
    for line in text.lines().filter(|line| !line.trim().is_empty()) {
        let info: FileInfo = serde_json::from_str(line)
            .with_context(|| format!("parse index line in {}", index_file.display()))?;
        index.insert(info.id, info);
    }
    Ok(index)
}
