//! One command per connection
//!
//! The command runs on its own task. If the client hangs up it still runs to
//! completion and its remaining messages are dropped.

use crate::protocol::{decode_command, write_message};
use spectrograph_engine::{Dispatcher, Message};
use std::io;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tracing::Instrument;

/// Accept connections until the listener fails
pub async fn serve(listener: TcpListener, dispatcher: Arc<Dispatcher>) -> io::Result<()> {
    loop {
        let (stream, peer) = listener.accept().await?;
        let dispatcher = dispatcher.clone();
        let span = tracing::info_span!("connection", %peer);
        tokio::spawn(
            async move {
                tracing::debug!("Accepted");
                if let Err(e) = handle_connection(stream, dispatcher).await {
                    tracing::warn!("Connection closed with error: {}", e);
                }
            }
            .instrument(span),
        );
    }
}

/// Read one command line, stream its ACKs and DONE back, then close
pub async fn handle_connection<S>(stream: S, dispatcher: Arc<Dispatcher>) -> io::Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let (reader, mut writer) = tokio::io::split(stream);
    let mut lines = BufReader::new(reader).lines();

    let line = loop {
        match lines.next_line().await? {
            Some(line) if line.trim().is_empty() => continue,
            Some(line) => break line,
            None => {
                tracing::debug!("Client closed without sending a command");
                return Ok(());
            }
        }
    };

    let command = match decode_command(&line) {
        Ok(command) => command,
        Err(done) => {
            tracing::warn!("Rejected inbound line: {}", done.error_message.as_deref().unwrap_or_default());
            write_message(&mut writer, &Message::Done(done)).await?;
            return writer.shutdown().await;
        }
    };

    let (tx, mut rx) = mpsc::unbounded_channel();
    let running = tokio::spawn(async move { dispatcher.dispatch(command, tx).await });

    while let Some(message) = rx.recv().await {
        write_message(&mut writer, &message).await?;
    }
    if let Err(e) = running.await {
        tracing::error!("Command task failed: {}", e);
    }
    writer.shutdown().await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bootstrap;
    use spectrograph_engine::config::InstrumentConfig;
    use spectrograph_engine::{CommandOutput, UNKNOWN_COMMAND_ERROR_CODE};
    use tokio::io::{AsyncReadExt, DuplexStream};

    fn dispatcher() -> Arc<Dispatcher> {
        let mut config = InstrumentConfig::default();
        config.simulation.time_scale = 0.001;
        config.mechanisms.poll_interval_ms = 1;
        Arc::new(bootstrap::simulated_dispatcher(config))
    }

    async fn exchange(dispatcher: Arc<Dispatcher>, request: &str) -> Vec<Message> {
        let (mut client, server): (DuplexStream, DuplexStream) = tokio::io::duplex(64 * 1024);
        let serving = tokio::spawn(handle_connection(server, dispatcher));

        client.write_all(request.as_bytes()).await.unwrap();
        let mut reply = String::new();
        client.read_to_string(&mut reply).await.unwrap();
        serving.await.unwrap().unwrap();

        reply
            .lines()
            .map(|line| serde_json::from_str(line).unwrap())
            .collect()
    }

    #[tokio::test]
    async fn test_status_request_gets_ack_then_done() {
        let messages = exchange(dispatcher(), "{\"id\":\"s1\",\"command\":\"GET_STATUS\"}\n").await;

        assert!(matches!(messages.first(), Some(Message::Ack(_))));
        let Some(Message::Done(done)) = messages.last() else {
            panic!("expected a DONE last");
        };
        assert!(done.successful);
        assert!(matches!(done.output, CommandOutput::Status(_)));
        assert_eq!(messages.iter().filter(|m| m.is_done()).count(), 1);
    }

    #[tokio::test]
    async fn test_multrun_streams_filename_acks() {
        let messages = exchange(
            dispatcher(),
            "\n{\"id\":\"m1\",\"command\":\"MULTRUN\",\"exposure_ms\":100,\"count\":2}\n",
        )
        .await;

        let filenames = messages
            .iter()
            .filter_map(|m| match m {
                Message::Ack(ack) => ack.filename.clone(),
                Message::Done(_) => None,
            })
            .count();
        assert_eq!(filenames, 2);
        assert!(messages.iter().all(|m| m.id() == "m1"));
        let Some(Message::Done(done)) = messages.last() else {
            panic!("expected a DONE last");
        };
        assert!(done.successful, "{:?}", done.error_message);
    }

    #[tokio::test]
    async fn test_malformed_line_gets_failed_done() {
        let messages = exchange(dispatcher(), "not json\n").await;

        assert_eq!(messages.len(), 1);
        let Message::Done(done) = &messages[0] else {
            panic!("expected a DONE");
        };
        assert_eq!(done.id, "unknown");
        assert_eq!(done.error_code, UNKNOWN_COMMAND_ERROR_CODE);
    }

    #[tokio::test]
    async fn test_silent_client_is_dropped() {
        let (client, server) = tokio::io::duplex(1024);
        drop(client);
        handle_connection(server, dispatcher()).await.unwrap();
    }
}
