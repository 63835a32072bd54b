//! Per-invocation execution context
//!
//! Every handler receives one of these. It carries the command id, the
//! shared instrument status (abort flag, counters) and the channel on which
//! ACKs are relayed to the caller in the order they are generated.

use crate::command::{Ack, Message};
use crate::error::{CommandError, CommandResult};
use crate::status::{InstrumentStatus, SharedStatus};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::sleep;

const ABORT_POLL_INTERVAL: Duration = Duration::from_millis(100);

pub struct ExecutionContext {
    command_id: String,
    status: SharedStatus,
    messages: mpsc::UnboundedSender<Message>,
}

impl ExecutionContext {
    pub fn new(
        command_id: impl Into<String>,
        status: SharedStatus,
        messages: mpsc::UnboundedSender<Message>,
    ) -> Self {
        Self {
            command_id: command_id.into(),
            status,
            messages,
        }
    }

    pub fn command_id(&self) -> &str {
        &self.command_id
    }

    pub fn status(&self) -> &InstrumentStatus {
        &self.status
    }

    /// Abort checkpoint
    pub fn check_abort(&self) -> CommandResult<()> {
        if self.status.is_abort_requested() {
            tracing::info!("Abort observed by command {}", self.command_id);
            return Err(CommandError::Aborted);
        }
        Ok(())
    }

    /// Tell the caller the next message will arrive within `duration`
    pub fn acknowledge(&self, duration: Duration) {
        self.send_ack(duration, None);
    }

    /// ACK that also reports a frame just written
    pub fn acknowledge_with_filename(&self, duration: Duration, filename: &str) {
        self.send_ack(duration, Some(filename.to_string()));
    }

    fn send_ack(&self, duration: Duration, filename: Option<String>) {
        let ack = Ack {
            id: self.command_id.clone(),
            time_to_complete_ms: duration.as_millis() as u64,
            filename,
        };
        tracing::debug!(
            "ACK {} +{}ms{}",
            ack.id,
            ack.time_to_complete_ms,
            ack.filename.as_deref().map(|f| format!(" ({})", f)).unwrap_or_default()
        );
        if self.messages.send(Message::Ack(ack)).is_err() {
            // Caller went away; the command still runs to completion so
            // hardware is left in a known state.
            tracing::debug!("ACK dropped for {}: caller disconnected", self.command_id);
        }
    }

    /// Sleep that ends early with [`CommandError::Aborted`] if ABORT arrives
    pub async fn sleep(&self, duration: Duration) -> CommandResult<()> {
        self.check_abort()?;
        tokio::select! {
            _ = sleep(duration) => Ok(()),
            _ = wait_for_abort(&self.status) => Err(CommandError::Aborted),
        }
    }
}

async fn wait_for_abort(status: &InstrumentStatus) {
    loop {
        if status.is_abort_requested() {
            return;
        }
        sleep(ABORT_POLL_INTERVAL).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn test_acks_are_relayed_in_order() {
        let status = Arc::new(InstrumentStatus::new());
        let (tx, mut rx) = mpsc::unbounded_channel();
        let ctx = ExecutionContext::new("17", status, tx);

        ctx.acknowledge(Duration::from_secs(10));
        ctx.acknowledge_with_filename(Duration::from_secs(5), "r_20240101_1_1.fits");

        match rx.try_recv().unwrap() {
            Message::Ack(ack) => {
                assert_eq!(ack.id, "17");
                assert_eq!(ack.time_to_complete_ms, 10_000);
                assert!(ack.filename.is_none());
            }
            other => panic!("unexpected {:?}", other),
        }
        match rx.try_recv().unwrap() {
            Message::Ack(ack) => assert_eq!(ack.filename.as_deref(), Some("r_20240101_1_1.fits")),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_check_abort() {
        let status = Arc::new(InstrumentStatus::new());
        let (tx, _rx) = mpsc::unbounded_channel();
        let ctx = ExecutionContext::new("1", status.clone(), tx);

        assert!(ctx.check_abort().is_ok());
        status.request_abort();
        assert!(ctx.check_abort().unwrap_err().is_abort());
    }

    #[tokio::test]
    async fn test_sleep_is_interrupted_by_abort() {
        let status = Arc::new(InstrumentStatus::new());
        let (tx, _rx) = mpsc::unbounded_channel();
        let ctx = ExecutionContext::new("1", status.clone(), tx);

        let aborter = {
            let status = status.clone();
            tokio::spawn(async move {
                sleep(Duration::from_millis(50)).await;
                status.request_abort();
            })
        };

        let started = std::time::Instant::now();
        let result = ctx.sleep(Duration::from_secs(30)).await;
        aborter.await.unwrap();

        assert!(result.unwrap_err().is_abort());
        assert!(started.elapsed() < Duration::from_secs(5));
    }

    #[test]
    fn test_ack_after_disconnect_does_not_panic() {
        let status = Arc::new(InstrumentStatus::new());
        let (tx, rx) = mpsc::unbounded_channel();
        drop(rx);
        let ctx = ExecutionContext::new("1", status, tx);
        ctx.acknowledge(Duration::from_secs(1));
    }
}
