//! The worker loop.
//!
//! One message at a time: lease it, heartbeat the lease through the
//! long-running handler, ack on success, leave it for redelivery on
//! failure. Horizontal scale is more worker processes; the queue
//! distributes the work.

use nexus_core::project::{ErrorInfo, ProjectStatus};
use nexus_core::task::{TaskMessage, TaskStatus};
use nexus_db::{ProjectRepo, ProjectUpdate, QueueMessage, TaskRepo, WorkQueue};
use nexus_config::Settings;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tracing::{debug, error, info, warn};

use crate::handler::WorkflowHandler;

/// Long-poll worker over the build queue.
pub struct Worker {
    settings: Settings,
    queue: Arc<dyn WorkQueue>,
    tasks: Arc<dyn TaskRepo>,
    projects: Arc<dyn ProjectRepo>,
    handler: Arc<WorkflowHandler>,
    shutdown: Arc<AtomicBool>,
}

impl Worker {
    pub fn new(
        settings: Settings,
        queue: Arc<dyn WorkQueue>,
        tasks: Arc<dyn TaskRepo>,
        projects: Arc<dyn ProjectRepo>,
        handler: Arc<WorkflowHandler>,
    ) -> Self {
        Self {
            settings,
            queue,
            tasks,
            projects,
            handler,
            shutdown: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn shutdown_flag(&self) -> Arc<AtomicBool> {
        self.shutdown.clone()
    }

    /// First signal: stop polling and let the in-flight handler run
    /// to its next stage boundary. Second signal: force exit; unacked
    /// messages redeliver.
    pub fn install_signal_handlers(&self) {
        let shutdown = self.shutdown.clone();
        tokio::spawn(async move {
            let mut sigint =
                tokio::signal::unix::signal(tokio::signal::unix::SignalKind::interrupt())
                    .expect("sigint handler");
            let mut sigterm =
                tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
                    .expect("sigterm handler");
            tokio::select! {
                _ = sigint.recv() => {}
                _ = sigterm.recv() => {}
            }
            info!("shutdown requested, finishing in-flight work (signal again to force)");
            shutdown.store(true, Ordering::SeqCst);

            tokio::select! {
                _ = sigint.recv() => {}
                _ = sigterm.recv() => {}
            }
            warn!("second signal, forcing exit");
            std::process::exit(1);
        });
    }

    /// Run the poll loop until shutdown (or after one message with
    /// `once`).
    pub async fn run(&self, once: bool) {
        info!(worker_id = %self.settings.worker_id,
              queue = %self.settings.build_queue,
              poll_interval = ?self.settings.poll_interval,
              visibility = ?self.settings.visibility_timeout,
              "worker starting");

        while !self.shutdown.load(Ordering::SeqCst) {
            let received = self
                .queue
                .receive(
                    &self.settings.build_queue,
                    &self.settings.worker_id,
                    self.settings.poll_interval,
                    self.settings.visibility_timeout,
                )
                .await;

            let message = match received {
                Ok(Some(message)) => message,
                Ok(None) => {
                    debug!("no messages, continuing to poll");
                    continue;
                }
                Err(e) => {
                    warn!(error = %e, "failed to poll queue");
                    tokio::time::sleep(std::time::Duration::from_secs(5)).await;
                    continue;
                }
            };

            self.process_message(message).await;
            if once {
                info!("--once set, exiting after first message");
                break;
            }
        }

        info!(worker_id = %self.settings.worker_id, "worker stopped");
    }

    async fn process_message(&self, message: QueueMessage) {
        let task_message: TaskMessage = match serde_json::from_value(message.body.clone()) {
            Ok(task_message) => task_message,
            Err(e) => {
                // A body no worker will ever parse would otherwise
                // redeliver forever.
                error!(message_id = %message.id, error = %e,
                       "dropping malformed queue message");
                let _ = self
                    .queue
                    .delete(message.id, &self.settings.worker_id)
                    .await;
                return;
            }
        };

        if message.receive_count > 1 {
            match self.check_retry_budget(&task_message).await {
                Ok(true) => {}
                Ok(false) => {
                    let _ = self
                        .queue
                        .delete(message.id, &self.settings.worker_id)
                        .await;
                    return;
                }
                Err(e) => warn!(task_id = %task_message.task_id, error = %e,
                                "failed to account redelivery"),
            }
        }

        let heartbeat = self.spawn_heartbeat(message.id);
        let success = self.handler.handle(&task_message).await;
        heartbeat.abort();

        if success {
            if let Err(e) = self
                .queue
                .delete(message.id, &self.settings.worker_id)
                .await
            {
                warn!(message_id = %message.id, error = %e, "failed to ack message");
            }
        } else {
            // The task row carries the failure; the message becomes
            // visible again after the lease expires.
            warn!(message_id = %message.id, "handler failed, message will redeliver");
        }
    }

    /// Bump the redelivery counter; `false` means the budget is
    /// exhausted and the message must be dropped.
    async fn check_retry_budget(&self, message: &TaskMessage) -> nexus_db::DbResult<bool> {
        let retry_count = self.tasks.increment_retry(message.task_id).await?;
        if retry_count < self.settings.max_retry_count {
            info!(task_id = %message.task_id, retry_count, "redelivered task");
            return Ok(true);
        }

        error!(task_id = %message.task_id, retry_count, "retry budget exhausted");
        self.tasks
            .finish(
                message.task_id,
                TaskStatus::Failed,
                None,
                Some("retry budget exhausted".to_string()),
            )
            .await?;
        self.projects
            .update(
                message.project_id,
                ProjectUpdate {
                    status: Some(ProjectStatus::Failed),
                    error_info: Some(Some(ErrorInfo {
                        message: format!(
                            "task {} failed after {} redeliveries",
                            message.task_id, retry_count
                        ),
                        kind: Some("retry_exhausted".to_string()),
                        ..Default::default()
                    })),
                    ..Default::default()
                },
            )
            .await?;
        Ok(false)
    }

    /// Extend the message lease until the handler returns. Stops on
    /// abort or on the first failed extension (the lease is gone and
    /// the message will redeliver anyway).
    fn spawn_heartbeat(&self, message_id: uuid::Uuid) -> tokio::task::JoinHandle<()> {
        let queue = self.queue.clone();
        let worker_id = self.settings.worker_id.clone();
        let interval = self.settings.heartbeat_interval;
        let visibility = self.settings.visibility_timeout;
        tokio::spawn(async move {
            loop {
                tokio::time::sleep(interval).await;
                match queue.extend_lease(message_id, &worker_id, visibility).await {
                    Ok(()) => debug!(message_id = %message_id, "extended message lease"),
                    Err(e) => {
                        warn!(message_id = %message_id, error = %e, "heartbeat failed");
                        break;
                    }
                }
            }
        })
    }
}
