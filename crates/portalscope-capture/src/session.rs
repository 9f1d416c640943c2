//! Capture session driver.
//!
//! Couples a [`CaptureController`] with a [`CommandDispatcher`]: every
//! command the controller hands back is dispatched and its reply fed back
//! into the controller, so callers only deal with high-level verbs.

use std::future::Future;
use std::time::Duration;

use crate::command::{CaptureCommand, CommandDispatcher, CommandResult, RESULT_CANCELED};
use crate::controller::{CaptureController, CaptureState};
use crate::error::CaptureError;

/// A controller wired to a dispatcher.
pub struct CaptureSession<D: CommandDispatcher> {
    controller: CaptureController,
    dispatcher: D,
}

impl<D: CommandDispatcher> CaptureSession<D> {
    /// Creates a session.
    pub fn new(controller: CaptureController, dispatcher: D) -> Self {
        Self {
            controller,
            dispatcher,
        }
    }

    /// Returns the controller.
    pub fn controller(&self) -> &CaptureController {
        &self.controller
    }

    /// Returns the controller mutably, e.g. for file-pick events.
    pub fn controller_mut(&mut self) -> &mut CaptureController {
        &mut self.controller
    }

    /// Returns the dispatcher.
    pub fn dispatcher(&self) -> &D {
        &self.dispatcher
    }

    /// Requests a start and applies the reply.
    pub async fn start(&mut self) -> CaptureState {
        if let Some(command) = self.controller.request_start() {
            self.issue(command).await;
        }
        self.controller.state()
    }

    /// Requests a stop and applies the reply.
    pub async fn stop(&mut self) -> CaptureState {
        if let Some(command) = self.controller.request_stop() {
            self.issue(command).await;
        }
        self.controller.state()
    }

    /// Queries the capture status and reconciles local state.
    pub async fn refresh_status(&mut self) -> CaptureState {
        let command = self.controller.request_status();
        self.issue(command).await;
        self.controller.state()
    }

    /// Starts, reconciles every `poll_interval` until `until` completes or
    /// the capture leaves `Running`, then stops and shuts the listener down.
    pub async fn run_until<F>(&mut self, poll_interval: Duration, until: F) -> CaptureState
    where
        F: Future<Output = ()>,
    {
        if self.start().await != CaptureState::Running {
            return self.controller.state();
        }

        tokio::pin!(until);
        let mut ticker = tokio::time::interval(poll_interval);
        ticker.tick().await;

        loop {
            tokio::select! {
                _ = &mut until => {
                    tracing::info!("Capture session ending");
                    break;
                }
                _ = ticker.tick() => {
                    if self.refresh_status().await != CaptureState::Running {
                        tracing::warn!(
                            "Capture no longer running: {}",
                            self.controller.status_message()
                        );
                        break;
                    }
                }
            }
        }

        self.stop().await;
        self.controller.shutdown().await;
        self.controller.state()
    }

    /// Releases the listener.
    pub async fn shutdown(&mut self) {
        self.controller.shutdown().await;
    }

    async fn issue(&mut self, command: CaptureCommand) {
        tracing::debug!(
            "Dispatching {} #{} to {}",
            command.verb(),
            command.ticket.seq,
            command.target_package
        );

        match self.dispatcher.dispatch(&command).await {
            Ok(result) => {
                self.controller
                    .on_command_result(command.ticket, result)
                    .await;
            }
            Err(CaptureError::TargetNotFound(target)) => {
                tracing::error!("Dispatch target not found: {}", target);
                self.controller.on_target_process_not_found().await;
            }
            Err(e) => {
                tracing::error!("Dispatch of {} failed: {}", command.verb(), e);
                self.controller
                    .on_command_result(command.ticket, CommandResult::failed(RESULT_CANCELED))
                    .await;
            }
        }
    }
}
