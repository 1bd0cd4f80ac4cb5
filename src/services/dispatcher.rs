use std::collections::HashMap;
use std::sync::Arc;

use serde_json::json;
use time::OffsetDateTime;
use time::format_description::well_known::Rfc3339;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::model::access::{AccessMasks, AccessOwner, AccessRights};
use crate::model::action::{CloudAction, names};
use crate::model::error::ErrorKind;
use crate::model::file::{FileInfo, FileObject};
use crate::model::identity::{GUEST_USER, GroupInfo, ROOT_GROUP, ROOT_USER, USER_GROUP, UserInfo};
use crate::model::process::{ProcessRequest, ProcessResponse};
use crate::model::report::ReportRecord;
use crate::model::{AuthToken, ServiceError};
use crate::services::catalog::ActionCatalog;
use crate::services::directory::Directory;
use crate::services::files::{FileCompletion, FileService, FileTaskKind};
use crate::services::mailer::Mailer;
use crate::services::processes::{ProcessCompletion, ProcessService};
use crate::services::reports::ReportArchive;

/// An inbound action together with its origin (`owner@peer`) and the oneshot
/// the listener is awaiting the resolved reply on.
pub struct ActionEnvelope {
    pub action: CloudAction,
    pub from: String,
    pub reply: oneshot::Sender<CloudAction>,
}

/// What an action resolves to: an immediate reply, or a pending request
/// against one of the asynchronous services.
enum Step {
    Reply(ErrorKind, Vec<u8>),
    AwaitFile(FileTaskKind, FileObject),
    AwaitProcess(ProcessRequest),
}

impl Step {
    fn from_error(err: ServiceError) -> Step {
        Step::Reply(err.kind, err.message.into_bytes())
    }
}

/// The central router: authenticates the executor, authorizes the action,
/// dispatches to the owning service, and guarantees exactly one reply per
/// action id.
pub struct Dispatcher {
    directory: Arc<Directory>,
    actions: Arc<ActionCatalog>,
    files: Arc<FileService>,
    processes: Arc<ProcessService>,
    reports: Arc<ReportArchive>,
    mailer: Arc<Mailer>,
    shutdown: mpsc::Sender<()>,
    started_at: OffsetDateTime,

    /// request-id -> action-id for in-flight file service tasks.
    file_requests: HashMap<Uuid, Uuid>,
    /// request-id -> action-id for in-flight process runs.
    process_requests: HashMap<Uuid, Uuid>,
    /// action-id -> reply channel, removed exactly once on resolution.
    pending: HashMap<Uuid, oneshot::Sender<CloudAction>>,
}

impl Dispatcher {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        directory: Arc<Directory>,
        actions: Arc<ActionCatalog>,
        files: Arc<FileService>,
        processes: Arc<ProcessService>,
        reports: Arc<ReportArchive>,
        mailer: Arc<Mailer>,
        shutdown: mpsc::Sender<()>,
    ) -> Self {
        Self {
            directory,
            actions,
            files,
            processes,
            reports,
            mailer,
            shutdown,
            started_at: OffsetDateTime::now_utc(),
            file_requests: HashMap::new(),
            process_requests: HashMap::new(),
            pending: HashMap::new(),
        }
    }

    pub async fn run(
        mut self,
        mut actions_rx: mpsc::UnboundedReceiver<ActionEnvelope>,
        mut files_rx: mpsc::UnboundedReceiver<FileCompletion>,
        mut processes_rx: mpsc::UnboundedReceiver<ProcessCompletion>,
    ) {
        loop {
            tokio::select! {
                envelope = actions_rx.recv() => match envelope {
                    Some(envelope) => self.resolve_action(envelope),
                    None => break,
                },
                Some(completion) = files_rx.recv() => self.on_file_completed(completion),
                Some(completion) = processes_rx.recv() => self.on_process_completed(completion),
            }
        }
        info!("dispatcher exiting");
    }

    fn resolve_action(&mut self, envelope: ActionEnvelope) {
        let ActionEnvelope {
            action,
            from,
            reply,
        } = envelope;
        debug!("resolving action \"{}\" id=\"{}\"", action.action, action.id);

        if !names_contains(&action.action) {
            error!("unknown action \"{}\"", action.action);
            let message = format!("Unknown action \"{}\".", action.action);
            respond(reply, &action, ErrorKind::InvalidInput, message.into_bytes());
            return;
        }

        let executor = if action.executor.is_empty() {
            GUEST_USER
        } else {
            &action.executor
        };
        let Some(executor_info) = self.directory.find_user(executor) else {
            let message = format!("Invalid user. User \"{executor}\" is not valid.");
            warn!("{message}");
            respond(reply, &action, ErrorKind::InvalidInput, message.into_bytes());
            return;
        };

        if !self.actions.authorize_user(&executor_info, &action.action) {
            let message = format!(
                "Unauthorized access. User \"{}\" is not allowed to execute action \"{}\".",
                executor_info.name, action.action
            );
            warn!("{message}");
            respond(reply, &action, ErrorKind::Unauthorized, message.into_bytes());
            return;
        }

        match self.plan(&action, &executor_info, &from) {
            Step::Reply(error, data) => respond(reply, &action, error, data),
            Step::AwaitFile(kind, object) => match self.files.request(kind, executor_info, object) {
                Ok(request_id) => {
                    self.file_requests.insert(request_id, action.id);
                    self.pending.insert(action.id, reply);
                }
                Err(err) => respond(reply, &action, err.kind, err.message.into_bytes()),
            },
            Step::AwaitProcess(request) => {
                let snapshot = request.clone();
                match self.processes.submit(request) {
                    Ok(request_id) => {
                        self.process_requests.insert(request_id, action.id);
                        self.pending.insert(action.id, reply);
                    }
                    Err(err) => {
                        let payload = process_response(&snapshot, &err.message);
                        respond(reply, &action, err.kind, payload);
                    }
                }
            }
        }
    }

    /// Per-action routing. Synchronous actions produce their reply here;
    /// file and process actions produce the task to await.
    fn plan(&self, action: &CloudAction, executor: &UserInfo, from: &str) -> Step {
        match action.action.as_str() {
            names::TEST => Step::Reply(ErrorKind::None, action.data.clone()),

            names::FILE_LIST => Step::AwaitFile(FileTaskKind::List, FileObject::default()),
            names::FILE_INFO => Step::AwaitFile(FileTaskKind::Info, object_for(action.resource_id)),
            names::FILE_UPLOAD => {
                let object = FileObject {
                    info: FileInfo {
                        id: Uuid::new_v4(),
                        path: action.resource_name.clone(),
                        access_rights: AccessRights::new(
                            AccessOwner::new(&executor.name, USER_GROUP),
                            AccessMasks::new(3, 1, 0),
                        ),
                        ..Default::default()
                    },
                    content: action.data.clone(),
                };
                Step::AwaitFile(FileTaskKind::Store, object)
            }
            names::FILE_UPDATE => {
                let object = FileObject {
                    info: FileInfo {
                        id: action.resource_id,
                        path: action.resource_name.clone(),
                        ..Default::default()
                    },
                    content: action.data.clone(),
                };
                Step::AwaitFile(FileTaskKind::Update, object)
            }
            names::FILE_UPDATE_ACCESS_OWNER => {
                let Ok(owner) = serde_json::from_slice::<AccessOwner>(&action.data) else {
                    return Step::Reply(
                        ErrorKind::InvalidInput,
                        b"Invalid access owner".to_vec(),
                    );
                };
                let mut object = object_for(action.resource_id);
                object.info.access_rights.owner = owner;
                Step::AwaitFile(FileTaskKind::UpdateAccessOwner, object)
            }
            names::FILE_UPDATE_ACCESS_MODE => {
                let Ok(mode) = serde_json::from_slice::<AccessMasks>(&action.data) else {
                    return Step::Reply(ErrorKind::InvalidInput, b"Invalid access mode".to_vec());
                };
                let mut object = object_for(action.resource_id);
                object.info.access_rights.mode = mode;
                Step::AwaitFile(FileTaskKind::UpdateAccessMode, object)
            }
            names::FILE_UPDATE_VERSION => {
                let mut object = object_for(action.resource_id);
                object.info.version = String::from_utf8_lossy(&action.data).into_owned();
                Step::AwaitFile(FileTaskKind::UpdateVersion, object)
            }
            names::FILE_UPDATE_TAGS => {
                let mut object = object_for(action.resource_id);
                object.info.tags = String::from_utf8_lossy(&action.data)
                    .split(',')
                    .map(|tag| tag.to_string())
                    .collect();
                Step::AwaitFile(FileTaskKind::UpdateTags, object)
            }
            names::FILE_DOWNLOAD => {
                Step::AwaitFile(FileTaskKind::Retrieve, object_for(action.resource_id))
            }
            names::FILE_REMOVE => {
                Step::AwaitFile(FileTaskKind::Remove, object_for(action.resource_id))
            }

            names::PROCESS => {
                let Ok(mut request) = serde_json::from_slice::<ProcessRequest>(&action.data)
                else {
                    return Step::Reply(
                        ErrorKind::InvalidInput,
                        b"Invalid process request".to_vec(),
                    );
                };
                request.executor = executor.clone();
                if !self.processes.contains_process(&request.name) {
                    let message =
                        format!("Invalid process. Process \"{}\" is not valid.", request.name);
                    return Step::Reply(
                        ErrorKind::InvalidInput,
                        process_response(&request, &message),
                    );
                }
                if !self.processes.authorize_user(executor, &request.name) {
                    let message = format!(
                        "Unauthorized access. User \"{}\" is not allowed to execute process \"{}\".",
                        executor.name, request.name
                    );
                    return Step::Reply(
                        ErrorKind::Unauthorized,
                        process_response(&request, &message),
                    );
                }
                Step::AwaitProcess(request)
            }

            names::STOP => {
                let _ = self.shutdown.try_send(());
                Step::Reply(ErrorKind::None, b"Stop server triggered".to_vec())
            }
            names::STATISTICS => self.statistics(),

            names::USER_LIST => {
                Step::Reply(ErrorKind::None, to_bytes(&json!({"users": self.directory.users()})))
            }
            names::USER_INFO => match self.directory.find_user(&action.resource_name) {
                Some(user) => Step::Reply(ErrorKind::None, to_bytes(&json!(user))),
                None => Step::Reply(
                    ErrorKind::NotFound,
                    ErrorKind::NotFound.message().as_bytes().to_vec(),
                ),
            },
            names::USER_ADD | names::USER_REGISTER => {
                let user = Directory::create_user(&action.resource_name);
                match self.directory.add_user(user.clone()) {
                    Ok(()) => Step::Reply(ErrorKind::None, to_bytes(&json!(user))),
                    Err(err) => Step::from_error(err),
                }
            }
            names::USER_UPDATE => {
                let Ok(user) = serde_json::from_slice::<UserInfo>(&action.data) else {
                    return Step::Reply(ErrorKind::InvalidInput, b"Invalid user record".to_vec());
                };
                match self.directory.set_user(&action.resource_name, user.clone()) {
                    Ok(()) => Step::Reply(ErrorKind::None, to_bytes(&json!(user))),
                    Err(err) => Step::from_error(err),
                }
            }
            names::USER_REMOVE => match self.directory.remove_user(&action.resource_name) {
                Ok(()) => Step::Reply(ErrorKind::None, action.resource_name.clone().into_bytes()),
                Err(err) => Step::from_error(err),
            },

            names::USER_TOKENS_LIST => match self.check_token_access(executor, action) {
                Err(step) => step,
                Ok(()) => {
                    let tokens: Vec<AuthToken> = self
                        .directory
                        .tokens()
                        .into_iter()
                        .filter(|token| token.resource_name == action.resource_name)
                        .collect();
                    Step::Reply(ErrorKind::None, to_bytes(&json!({"tokens": tokens})))
                }
            },
            names::USER_TOKEN_GENERATE => match self.check_token_access(executor, action) {
                Err(step) => step,
                Ok(()) => self.generate_token(&action.resource_name),
            },
            names::USER_TOKEN_REMOVE => match self.check_token_access(executor, action) {
                Err(step) => step,
                Ok(()) => match self.directory.remove_token(action.resource_id) {
                    Ok(()) => Step::Reply(
                        ErrorKind::None,
                        action.resource_id.to_string().into_bytes(),
                    ),
                    Err(err) => Step::from_error(err),
                },
            },

            names::GROUP_LIST => Step::Reply(
                ErrorKind::None,
                to_bytes(&json!({"groups": self.directory.groups()})),
            ),
            names::GROUP_INFO => match self.directory.find_group(&action.resource_name) {
                Some(group) => Step::Reply(ErrorKind::None, to_bytes(&json!(group))),
                None => Step::Reply(
                    ErrorKind::NotFound,
                    ErrorKind::NotFound.message().as_bytes().to_vec(),
                ),
            },
            names::GROUP_ADD => {
                let group = GroupInfo::new(&action.resource_name);
                match self.directory.add_group(group.clone()) {
                    Ok(()) => Step::Reply(ErrorKind::None, to_bytes(&json!(group))),
                    Err(err) => Step::from_error(err),
                }
            }
            names::GROUP_REMOVE => match self.directory.remove_group(&action.resource_name) {
                Ok(()) => Step::Reply(ErrorKind::None, action.resource_name.clone().into_bytes()),
                Err(err) => Step::from_error(err),
            },

            names::ACTION_LIST => Step::Reply(
                ErrorKind::None,
                to_bytes(&json!({"actions": self.actions.actions()})),
            ),
            names::ACTION_UPDATE_ACCESS_OWNER | names::ACTION_UPDATE_ACCESS_MODE => {
                let Some(entry) = self.actions.find_action(&action.resource_name) else {
                    return Step::Reply(
                        ErrorKind::InvalidInput,
                        format!("Action \"{}\" does not exist.", action.resource_name)
                            .into_bytes(),
                    );
                };
                let rights = match patch_rights(entry.access_rights, action) {
                    Ok(rights) => rights,
                    Err(step) => return step,
                };
                match self.actions.update_access_rights(&action.resource_name, rights) {
                    Ok(updated) => Step::Reply(ErrorKind::None, to_bytes(&json!(updated))),
                    Err(err) => Step::from_error(err),
                }
            }

            names::PROCESS_LIST => Step::Reply(
                ErrorKind::None,
                to_bytes(&json!({"processes": self.processes.processes()})),
            ),
            names::PROCESS_UPDATE_ACCESS_OWNER | names::PROCESS_UPDATE_ACCESS_MODE => {
                let Some(entry) = self.processes.find_process(&action.resource_name) else {
                    return Step::Reply(
                        ErrorKind::InvalidInput,
                        format!("Process \"{}\" does not exist.", action.resource_name)
                            .into_bytes(),
                    );
                };
                let rights = match patch_rights(entry.access_rights, action) {
                    Ok(rights) => rights,
                    Err(step) => return step,
                };
                match self
                    .processes
                    .update_access_rights(&action.resource_name, rights)
                {
                    Ok(updated) => Step::Reply(ErrorKind::None, to_bytes(&json!(updated))),
                    Err(err) => Step::from_error(err),
                }
            }

            names::REPORT_SUBMIT => {
                let Ok(record) = serde_json::from_slice::<ReportRecord>(&action.data) else {
                    return Step::Reply(ErrorKind::InvalidInput, b"Invalid report record".to_vec());
                };
                match self.reports.submit_report(from, &record) {
                    Ok(id) => Step::Reply(
                        ErrorKind::None,
                        format!("Report (id={id}) has been stored.").into_bytes(),
                    ),
                    Err(err) => Step::from_error(err),
                }
            }

            unknown => {
                error!("unknown action \"{unknown}\"");
                Step::Reply(
                    ErrorKind::InvalidInput,
                    format!("Unknown action \"{unknown}\".").into_bytes(),
                )
            }
        }
    }

    /// Token operations are self-service: only the target user, `root`, or a
    /// `root`-group member may touch tokens for a resource name.
    fn check_token_access(&self, executor: &UserInfo, action: &CloudAction) -> Result<(), Step> {
        if executor.name == action.resource_name
            || executor.name == ROOT_USER
            || executor.has_group(ROOT_GROUP)
        {
            return Ok(());
        }
        let message = format!(
            "{}. User \"{}\" is not allowed to manage authentication tokens with resource name \"{}\".",
            ErrorKind::Unauthorized.message(),
            executor.name,
            action.resource_name
        );
        warn!("{message}");
        Err(Step::Reply(ErrorKind::Unauthorized, message.into_bytes()))
    }

    fn generate_token(&self, resource_name: &str) -> Step {
        let token = match AuthToken::generate(resource_name) {
            Ok(token) => token,
            Err(err) => {
                error!("failed to generate token: {err:#}");
                return Step::Reply(
                    ErrorKind::Application,
                    ErrorKind::Application.message().as_bytes().to_vec(),
                );
            }
        };
        if let Err(err) = self.directory.add_token(token.clone()) {
            return Step::from_error(err);
        }

        let validity = OffsetDateTime::from_unix_timestamp(token.validity_date)
            .ok()
            .and_then(|date| date.format(&Rfc3339).ok())
            .unwrap_or_else(|| token.validity_date.to_string());
        self.mailer.submit(
            resource_name,
            "Authentication token created",
            format!(
                "New authentication token has been created.\n\nResource: {}\nToken: {}\nValidity: {}",
                token.resource_name, token.content, validity
            ),
        );
        Step::Reply(ErrorKind::None, to_bytes(&json!(token)))
    }

    fn statistics(&self) -> Step {
        let now = OffsetDateTime::now_utc();
        let elapsed = (now - self.started_at).whole_seconds().max(0);
        let (days, rest) = (elapsed / 86_400, elapsed % 86_400);
        let up_time = format!(
            "{} days, {:02}:{:02}:{:02}",
            days,
            rest / 3600,
            rest % 3600 / 60,
            rest % 60
        );

        let body = json!({
            "general": {
                "version": env!("CARGO_PKG_VERSION"),
            },
            "dateTime": {
                "start": self.started_at.format(&Rfc3339).unwrap_or_default(),
                "current": now.format(&Rfc3339).unwrap_or_default(),
                "upTime": up_time,
            },
            "services": [
                self.files.statistics_json(),
                self.actions.statistics_json(),
                self.processes.statistics_json(),
                self.reports.statistics_json(),
                self.directory.statistics_json(),
                self.mailer.statistics_json(),
            ],
        });
        Step::Reply(ErrorKind::None, to_bytes(&body))
    }

    fn on_file_completed(&mut self, completion: FileCompletion) {
        debug!(
            "file request \"{}\" completed with error \"{}\"",
            completion.request_id,
            completion.error.as_str()
        );
        let Some(action_id) = self.file_requests.remove(&completion.request_id) else {
            info!(
                "file request \"{}\" not found among registered requests",
                completion.request_id
            );
            return;
        };
        self.finish(action_id, completion.error, completion.payload);
    }

    fn on_process_completed(&mut self, completion: ProcessCompletion) {
        debug!(
            "process request \"{}\" completed with error \"{}\"",
            completion.request_id,
            completion.result.error.as_str()
        );
        let Some(action_id) = self.process_requests.remove(&completion.request_id) else {
            info!(
                "process request \"{}\" not found among registered requests",
                completion.request_id
            );
            return;
        };
        let payload = process_response(
            &completion.result.request,
            completion.result.response_message(),
        );
        self.processes.finalize_process(completion.request_id);
        self.finish(action_id, completion.result.error, payload);
    }

    fn finish(&mut self, action_id: Uuid, error: ErrorKind, data: Vec<u8>) {
        let Some(reply) = self.pending.remove(&action_id) else {
            error!("no pending reply for action id \"{action_id}\"");
            return;
        };
        let resolved = CloudAction {
            id: action_id,
            executor: String::new(),
            action: String::new(),
            resource_name: String::new(),
            resource_id: Uuid::nil(),
            data,
            error,
        };
        if reply.send(resolved).is_err() {
            warn!("listener dropped reply for action id \"{action_id}\"");
        }
    }
}

fn names_contains(name: &str) -> bool {
    crate::model::action::ALL_ACTIONS.contains(&name)
}

fn respond(
    reply: oneshot::Sender<CloudAction>,
    action: &CloudAction,
    error: ErrorKind,
    data: Vec<u8>,
) {
    if reply.send(action.reply(error, data)).is_err() {
        warn!("listener dropped reply for action id \"{}\"", action.id);
    }
}

fn object_for(id: Uuid) -> FileObject {
    FileObject {
        info: FileInfo {
            id,
            ..Default::default()
        },
        ..Default::default()
    }
}

/// Apply the owner or mode carried in an update-access action to the
/// existing rights of a catalog entry.
fn patch_rights(mut rights: AccessRights, action: &CloudAction) -> Result<AccessRights, Step> {
    if action.action.ends_with("update-access-owner") {
        match serde_json::from_slice::<AccessOwner>(&action.data) {
            Ok(owner) => rights.owner = owner,
            Err(_) => {
                return Err(Step::Reply(
                    ErrorKind::InvalidInput,
                    b"Invalid access owner".to_vec(),
                ));
            }
        }
    } else {
        match serde_json::from_slice::<AccessMasks>(&action.data) {
            Ok(mode) => rights.mode = mode,
            Err(_) => {
                return Err(Step::Reply(
                    ErrorKind::InvalidInput,
                    b"Invalid access mode".to_vec(),
                ));
            }
        }
    }
    Ok(rights)
}

fn process_response(request: &ProcessRequest, message: &str) -> Vec<u8> {
    let response = ProcessResponse {
        request: request.clone(),
        message: message.to_string(),
    };
    serde_json::to_vec(&response).unwrap_or_default()
}

fn to_bytes(value: &serde_json::Value) -> Vec<u8> {
    serde_json::to_vec(value).unwrap_or_default()
}
