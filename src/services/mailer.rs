use std::process::Stdio;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::io::AsyncWriteExt;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::services::stats::ServiceStatistics;

const QUEUE_CAPACITY: usize = 64;

#[derive(Clone, Debug)]
pub struct Mail {
    pub to: String,
    pub subject: String,
    pub body: String,
}

#[derive(Clone, Debug)]
pub struct MailerSettings {
    pub from_address: String,
    pub send_timeout: Duration,
    /// The mail submission program; `sendmail` outside of tests.
    pub program: String,
}

impl Default for MailerSettings {
    fn default() -> Self {
        Self {
            from_address: String::new(),
            send_timeout: Duration::from_secs(30),
            program: "sendmail".into(),
        }
    }
}

/// Fire-and-forget outbound mail: a bounded queue drained by one worker that
/// pipes each message to the local mail transport. No retries.
pub struct Mailer {
    sender: Mutex<Option<mpsc::Sender<Mail>>>,
    statistics: Arc<Mutex<ServiceStatistics>>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl Mailer {
    pub fn start(settings: MailerSettings) -> Self {
        let (sender, mut receiver) = mpsc::channel::<Mail>(QUEUE_CAPACITY);
        let statistics = Arc::new(Mutex::new(ServiceStatistics::new("mailer")));

        let worker_statistics = statistics.clone();
        let worker = tokio::spawn(async move {
            while let Some(mail) = receiver.recv().await {
                if send_mail(&settings, &mail).await {
                    worker_statistics.lock().unwrap().record_counter("sent", 1);
                    info!(
                        "email to \"{}\" with subject \"{}\" has been sent",
                        mail.to, mail.subject
                    );
                } else {
                    worker_statistics.lock().unwrap().record_counter("failed", 1);
                    warn!(
                        "sending email to \"{}\" with subject \"{}\" failed",
                        mail.to, mail.subject
                    );
                }
            }
        });

        Self {
            sender: Mutex::new(Some(sender)),
            statistics,
            worker: Mutex::new(Some(worker)),
        }
    }

    /// Enqueue a message; dropped with a warning when the queue is full.
    pub fn submit(&self, to: impl Into<String>, subject: impl Into<String>, body: impl Into<String>) {
        let mail = Mail {
            to: to.into(),
            subject: subject.into(),
            body: body.into(),
        };
        let sender = self.sender.lock().unwrap();
        let Some(sender) = sender.as_ref() else {
            warn!("mailer is stopped, dropping email to \"{}\"", mail.to);
            return;
        };
        match sender.try_send(mail) {
            Ok(()) => {}
            Err(mpsc::error::TrySendError::Full(mail)) => {
                warn!("mail queue is full, dropping email to \"{}\"", mail.to);
                self.statistics.lock().unwrap().record_counter("dropped", 1);
            }
            Err(mpsc::error::TrySendError::Closed(mail)) => {
                warn!("mailer is stopped, dropping email to \"{}\"", mail.to);
            }
        }
    }

    /// Close the queue and wait for the worker to drain it.
    pub async fn stop(&self) {
        info!("signalling mailer to stop");
        self.sender.lock().unwrap().take();
        let worker = self.worker.lock().unwrap().take();
        if let Some(worker) = worker {
            let _ = worker.await;
        }
        info!("mailer has been stopped");
    }

    pub fn statistics_json(&self) -> serde_json::Value {
        self.statistics.lock().unwrap().to_json()
    }
}

/// Success means the transport accepted the message and exited within the
/// send timeout.
async fn send_mail(settings: &MailerSettings, mail: &Mail) -> bool {
    let mut command = tokio::process::Command::new(&settings.program);
    command
        .arg("-t")
        .arg(&mail.to)
        .stdin(Stdio::piped())
        .stdout(Stdio::null())
        .stderr(Stdio::null());

    let mut child = match command.spawn() {
        Ok(child) => child,
        Err(err) => {
            warn!("failed to start {}: {err}", settings.program);
            return false;
        }
    };

    let mut message = String::new();
    if !settings.from_address.is_empty() {
        message.push_str(&format!("From: {}\n", settings.from_address));
    }
    message.push_str(&format!("Subject: {}\n\n{}\n", mail.subject, mail.body));

    if let Some(mut stdin) = child.stdin.take() {
        // A transport that exits without reading stdin is not an error here.
        let _ = stdin.write_all(message.as_bytes()).await;
    }

    match tokio::time::timeout(settings.send_timeout, child.wait()).await {
        Ok(Ok(_status)) => true,
        Ok(Err(_)) => false,
        Err(_) => {
            let _ = child.kill().await;
            false
        }
    }
}
