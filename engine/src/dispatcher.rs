//! Command dispatcher
//!
//! Looks a command's handler up in the registry, sends the first ACK from
//! the handler's estimate, runs it and turns the result into exactly one
//! DONE. A panic inside a handler becomes a failed DONE instead of taking
//! the connection task down.

use crate::command::{Command, Done, Message};
use crate::context::ExecutionContext;
use crate::error::{CommandError, UNKNOWN_COMMAND_ERROR_CODE};
use crate::registry::{Registry, Services};
use crate::status::SharedStatus;
use futures::FutureExt;
use std::panic::AssertUnwindSafe;
use tokio::sync::mpsc;
use tracing::Instrument;

pub struct Dispatcher {
    registry: Registry,
    services: Services,
}

impl Dispatcher {
    pub fn new(registry: Registry, services: Services) -> Self {
        Self { registry, services }
    }

    pub fn status(&self) -> &SharedStatus {
        &self.services.status
    }

    /// Run one command to completion. Every ACK and the final DONE are sent on
    /// `messages`; the DONE is also returned.
    pub async fn dispatch(&self, command: Command, messages: mpsc::UnboundedSender<Message>) -> Done {
        let span = tracing::info_span!("command", id = %command.id, name = %command.command_type());
        self.dispatch_inner(command, messages).instrument(span).await
    }

    async fn dispatch_inner(&self, command: Command, messages: mpsc::UnboundedSender<Message>) -> Done {
        let command_type = command.command_type();
        let status = &self.services.status;

        let Some(handler) = self.registry.create(command_type, &self.services) else {
            tracing::error!("No handler registered for {}", command_type);
            let done = Done::failure(
                &command.id,
                UNKNOWN_COMMAND_ERROR_CODE,
                format!("Unsupported command {}", command_type),
            );
            send_done(&messages, &done);
            return done;
        };

        let task_id = if command_type.is_control() {
            None
        } else {
            if let Some(current) = status.current_command() {
                tracing::warn!(
                    "{} {} started while {} {} is still running",
                    command_type,
                    command.id,
                    current.name,
                    current.id
                );
            }
            Some(status.begin_command(&command.id, command_type.name()))
        };

        tracing::info!("Starting {}", command_type);
        let ctx = ExecutionContext::new(command.id.clone(), status.clone(), messages.clone());
        ctx.acknowledge(handler.estimate_acknowledge_time(&command));

        let result = match AssertUnwindSafe(handler.execute(&command, &ctx))
            .catch_unwind()
            .await
        {
            Ok(result) => result,
            Err(payload) => {
                let message = panic_message(payload.as_ref());
                tracing::error!("Handler for {} panicked: {}", command_type, message);
                Err(CommandError::Panicked(message))
            }
        };

        let done = match result {
            Ok(output) => {
                tracing::info!("{} completed", command_type);
                Done::success(&command.id, output)
            }
            Err(e) => {
                if e.is_abort() {
                    tracing::info!("{} aborted", command_type);
                } else {
                    tracing::error!("{} failed with code {}: {}", command_type, e.code(), e);
                }
                Done::failure(&command.id, e.code(), e.to_string())
            }
        };

        if let Some(task_id) = task_id {
            status.end_command(task_id);
        }
        send_done(&messages, &done);
        done
    }
}

fn send_done(messages: &mpsc::UnboundedSender<Message>, done: &Done) {
    if messages.send(Message::Done(done.clone())).is_err() {
        tracing::debug!("DONE dropped for {}: caller disconnected", done.id);
    }
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic payload".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::command::{CommandHandler, CommandKind, CommandOutput, CommandType};
    use crate::error::{CommandResult, ABORT_ERROR_CODE, PANIC_ERROR_CODE};
    use crate::testing::{self, MockInstrument};
    use async_trait::async_trait;
    use std::sync::Arc;
    use std::time::Duration;

    struct PanickingHandler;

    #[async_trait]
    impl CommandHandler for PanickingHandler {
        fn estimate_acknowledge_time(&self, _command: &Command) -> Duration {
            Duration::from_secs(1)
        }

        async fn execute(&self, _command: &Command, _ctx: &ExecutionContext) -> CommandResult<CommandOutput> {
            panic!("detector driver exploded");
        }
    }

    fn collect(mut rx: mpsc::UnboundedReceiver<Message>) -> Vec<Message> {
        let mut messages = Vec::new();
        while let Ok(message) = rx.try_recv() {
            messages.push(message);
        }
        messages
    }

    #[tokio::test]
    async fn test_one_done_after_acks() {
        let mock = MockInstrument::new();
        let dispatcher = Dispatcher::new(Registry::standard(), testing::services(&mock, testing::fast_config()));
        let (tx, rx) = mpsc::unbounded_channel();

        let done = dispatcher
            .dispatch(
                Command::new("7", CommandKind::Multrun { exposure_ms: 10, count: 2 }),
                tx,
            )
            .await;

        assert!(done.successful);
        let messages = collect(rx);
        assert!(matches!(messages.first(), Some(Message::Ack(_))));
        assert_eq!(messages.iter().filter(|m| m.is_done()).count(), 1);
        assert!(messages.last().is_some_and(Message::is_done));
        assert!(messages.iter().all(|m| m.id() == "7"));
        assert!(dispatcher.status().current_command().is_none());
    }

    #[tokio::test]
    async fn test_failure_is_reported_with_site_code() {
        let mock = MockInstrument::new();
        mock.fail_next_multrun(21, "CCD warm");
        let dispatcher = Dispatcher::new(Registry::standard(), testing::services(&mock, testing::fast_config()));
        let (tx, rx) = mpsc::unbounded_channel();

        let done = dispatcher
            .dispatch(
                Command::new("8", CommandKind::Multrun { exposure_ms: 10, count: 1 }),
                tx,
            )
            .await;

        assert!(!done.successful);
        assert_eq!(done.error_code, crate::commands::multrun::ERR_EXPOSE);
        assert!(done.error_message.unwrap().contains("CCD warm"));
        assert_eq!(collect(rx).iter().filter(|m| m.is_done()).count(), 1);
    }

    #[tokio::test]
    async fn test_panic_becomes_failed_done() {
        let mock = MockInstrument::new();
        let registry = Registry::empty().with(CommandType::Multrun, |_| Box::new(PanickingHandler));
        let dispatcher = Dispatcher::new(registry, testing::services(&mock, testing::fast_config()));
        let (tx, rx) = mpsc::unbounded_channel();

        let done = dispatcher
            .dispatch(
                Command::new("9", CommandKind::Multrun { exposure_ms: 10, count: 1 }),
                tx,
            )
            .await;

        assert_eq!(done.error_code, PANIC_ERROR_CODE);
        assert!(done.error_message.unwrap().contains("detector driver exploded"));
        assert_eq!(collect(rx).iter().filter(|m| m.is_done()).count(), 1);
        assert!(dispatcher.status().current_command().is_none());
    }

    #[tokio::test]
    async fn test_unregistered_command_fails() {
        let mock = MockInstrument::new();
        let dispatcher = Dispatcher::new(Registry::empty(), testing::services(&mock, testing::fast_config()));
        let (tx, _rx) = mpsc::unbounded_channel();

        let done = dispatcher.dispatch(Command::new("10", CommandKind::Abort), tx).await;
        assert_eq!(done.error_code, UNKNOWN_COMMAND_ERROR_CODE);
    }

    #[tokio::test]
    async fn test_abort_runs_alongside_arc_warmup() {
        let mock = MockInstrument::new();
        let mut config = testing::fast_config();
        config.lamps.default_warmup_ms = 30_000;
        let dispatcher = Arc::new(Dispatcher::new(Registry::standard(), testing::services(&mock, config)));

        let (arc_tx, arc_rx) = mpsc::unbounded_channel();
        let running = {
            let dispatcher = dispatcher.clone();
            tokio::spawn(async move {
                dispatcher
                    .dispatch(
                        Command::new("arc", CommandKind::Arc { exposure_ms: 10, lamp: None }),
                        arc_tx,
                    )
                    .await
            })
        };

        // Wait until the lamp is on and the warm-up has started
        for _ in 0..200 {
            if mock.lamp_is_on("Xe") {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert!(mock.lamp_is_on("Xe"));

        let (abort_tx, _abort_rx) = mpsc::unbounded_channel();
        let abort_done = dispatcher.dispatch(Command::new("stop", CommandKind::Abort), abort_tx).await;
        assert!(abort_done.successful);

        let arc_done = tokio::time::timeout(Duration::from_secs(5), running)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(arc_done.error_code, ABORT_ERROR_CODE);
        assert_eq!(mock.lamp_off_count("Xe"), 1);
        assert!(mock.multruns().is_empty());
        assert_eq!(collect(arc_rx).iter().filter(|m| m.is_done()).count(), 1);
    }

    #[tokio::test]
    async fn test_abort_for_running_command_survives_next_command() {
        let mock = MockInstrument::new();
        let dispatcher = Dispatcher::new(Registry::standard(), testing::services(&mock, testing::fast_config()));
        let running = dispatcher.status().begin_command("arc", "ARC");
        dispatcher.status().request_abort();
        let (tx, _rx) = mpsc::unbounded_channel();

        let done = dispatcher
            .dispatch(
                Command::new("12", CommandKind::Multrun { exposure_ms: 10, count: 1 }),
                tx,
            )
            .await;

        assert_eq!(done.error_code, ABORT_ERROR_CODE);
        assert!(dispatcher.status().is_abort_requested());
        dispatcher.status().end_command(running);
    }

    #[tokio::test]
    async fn test_next_command_clears_abort() {
        let mock = MockInstrument::new();
        let dispatcher = Dispatcher::new(Registry::standard(), testing::services(&mock, testing::fast_config()));
        dispatcher.status().request_abort();
        let (tx, _rx) = mpsc::unbounded_channel();

        let done = dispatcher
            .dispatch(
                Command::new("11", CommandKind::Multrun { exposure_ms: 10, count: 1 }),
                tx,
            )
            .await;
        assert!(done.successful);
    }
}
