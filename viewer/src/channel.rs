//! Serialized command/reply channel over the viewer's stdio.
//!
//! One reader task owns the output stream. An exchange arms it (the reader
//! drains stale output and acknowledges), writes the command, and takes the
//! next complete frame. Frames that arrive with no exchange armed are
//! unsolicited and go to the [`EventForwarder`].

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::{Mutex, MutexGuard, mpsc, oneshot};
use tokio::task::JoinHandle;

use crate::codec::{FrameError, FrameReader, LineWriter};
use crate::error::{Result, ViewerError};
use crate::events::EventForwarder;

type BoxedWriter = Box<dyn AsyncWrite + Send + Unpin>;

const READER_CHANNEL_CAPACITY: usize = 4;

enum ReaderCommand {
    /// Drain buffered output, then route the next frame to `reply`.
    Expect {
        reply: oneshot::Sender<String>,
        armed: oneshot::Sender<()>,
    },
}

pub(crate) struct CommandChannel {
    /// Held for the whole of a send or exchange.
    writer: Mutex<LineWriter<BoxedWriter>>,
    reader_tx: mpsc::Sender<ReaderCommand>,
    closed: Arc<AtomicBool>,
    exchange_timeout: Option<Duration>,
    reader_handle: JoinHandle<()>,
}

impl CommandChannel {
    pub fn new<R, W>(
        reader: R,
        writer: W,
        sentinel: char,
        events: Arc<EventForwarder>,
        exchange_timeout: Option<Duration>,
    ) -> Self
    where
        R: AsyncRead + Send + Unpin + 'static,
        W: AsyncWrite + Send + Unpin + 'static,
    {
        let closed = Arc::new(AtomicBool::new(false));
        let (reader_tx, reader_rx) = mpsc::channel(READER_CHANNEL_CAPACITY);
        let reader_handle = tokio::spawn(run_reader(
            FrameReader::new(reader, sentinel),
            reader_rx,
            events,
            Arc::clone(&closed),
        ));

        let writer: BoxedWriter = Box::new(writer);
        Self {
            writer: Mutex::new(LineWriter::new(writer)),
            reader_tx,
            closed,
            exchange_timeout,
            reader_handle,
        }
    }

    /// Whether the output stream ended or the channel was shut down.
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Write one command without waiting for output.
    pub async fn send(&self, command: &str) -> Result<()> {
        let mut writer = self.lock_writer().await?;
        writer.write_line(command).await?;
        Ok(())
    }

    /// Write several commands back to back with no other write in between.
    pub async fn send_all(&self, commands: &[String]) -> Result<()> {
        let mut writer = self.lock_writer().await?;
        for command in commands {
            writer.write_line(command).await?;
        }
        Ok(())
    }

    /// Write `command` and return the payload of the next frame.
    pub async fn exchange(&self, command: &str) -> Result<String> {
        let mut writer = self.lock_writer().await?;
        self.exchange_locked(&mut writer, command).await
    }

    /// Write `prelude` lines, then exchange `command`, all under one
    /// acquisition so no other command can land in between.
    pub async fn exchange_after(&self, prelude: &[String], command: &str) -> Result<String> {
        let mut writer = self.lock_writer().await?;
        for line in prelude {
            writer.write_line(line).await?;
        }
        self.exchange_locked(&mut writer, command).await
    }

    /// Stop the reader task and close the viewer's input stream.
    pub async fn shutdown(&self) {
        self.closed.store(true, Ordering::SeqCst);
        self.reader_handle.abort();
        if let Err(e) = self.writer.lock().await.shutdown().await {
            tracing::trace!("Closing viewer input: {e}");
        }
    }

    async fn lock_writer(&self) -> Result<MutexGuard<'_, LineWriter<BoxedWriter>>> {
        let writer = self.writer.lock().await;
        if self.is_closed() {
            return Err(ViewerError::NotRunning);
        }
        Ok(writer)
    }

    async fn exchange_locked(
        &self,
        writer: &mut LineWriter<BoxedWriter>,
        command: &str,
    ) -> Result<String> {
        let (reply_tx, reply_rx) = oneshot::channel();
        let (armed_tx, armed_rx) = oneshot::channel();
        self.reader_tx
            .send(ReaderCommand::Expect {
                reply: reply_tx,
                armed: armed_tx,
            })
            .await
            .map_err(|_| ViewerError::NotRunning)?;
        armed_rx.await.map_err(|_| ViewerError::NotRunning)?;

        writer.write_line(command).await?;

        let reply = match self.exchange_timeout {
            Some(limit) => tokio::time::timeout(limit, reply_rx)
                .await
                .map_err(|_| ViewerError::Timeout(limit))?,
            None => reply_rx.await,
        };
        reply.map_err(|_| ViewerError::ChannelClosed)
    }
}

impl Drop for CommandChannel {
    fn drop(&mut self) {
        self.reader_handle.abort();
    }
}

async fn run_reader<R: AsyncRead + Unpin>(
    mut reader: FrameReader<R>,
    mut commands: mpsc::Receiver<ReaderCommand>,
    events: Arc<EventForwarder>,
    closed: Arc<AtomicBool>,
) {
    let mut pending: Option<oneshot::Sender<String>> = None;
    loop {
        tokio::select! {
            biased;
            command = commands.recv() => match command {
                Some(ReaderCommand::Expect { reply, armed }) => {
                    let dropped = reader.drain();
                    if dropped > 0 {
                        tracing::trace!(bytes = dropped, "Discarded stale viewer output");
                    }
                    pending = Some(reply);
                    let _ = armed.send(());
                }
                None => break,
            },
            frame = reader.read_frame() => match frame {
                Ok(Some(payload)) => route_frame(payload, &mut pending, &events),
                Ok(None) => {
                    tracing::debug!("Viewer closed its output stream");
                    break;
                }
                Err(FrameError::Oversized { max }) => {
                    tracing::warn!(max, "Discarded unterminated viewer output");
                }
                Err(FrameError::Io(e)) => {
                    tracing::warn!("Viewer read error: {e}");
                    break;
                }
            },
        }
    }
    // Mark closed before the pending reply sender drops with `pending`.
    closed.store(true, Ordering::SeqCst);
    drop(pending);
}

fn route_frame(
    payload: String,
    pending: &mut Option<oneshot::Sender<String>>,
    events: &EventForwarder,
) {
    match pending.take() {
        Some(reply) if !reply.is_closed() => {
            let _ = reply.send(payload);
        }
        // Nobody waiting, or the exchange gave up (timed out): unsolicited.
        _ => {
            events.try_dispatch(&payload);
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicUsize;

    use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, DuplexStream, Lines};

    use super::*;

    struct MockViewer {
        commands: Lines<BufReader<DuplexStream>>,
        output: DuplexStream,
    }

    impl MockViewer {
        async fn next_command(&mut self) -> String {
            self.commands.next_line().await.unwrap().unwrap()
        }

        async fn reply(&mut self, frame: &str) {
            self.output
                .write_all(format!("{frame}§").as_bytes())
                .await
                .unwrap();
        }
    }

    fn connect(
        events: Arc<EventForwarder>,
        exchange_timeout: Option<Duration>,
    ) -> (CommandChannel, MockViewer) {
        let (to_viewer, viewer_in) = tokio::io::duplex(1024);
        let (viewer_out, from_viewer) = tokio::io::duplex(1024);
        let channel = CommandChannel::new(from_viewer, to_viewer, '§', events, exchange_timeout);
        let viewer = MockViewer {
            commands: BufReader::new(viewer_in).lines(),
            output: viewer_out,
        };
        (channel, viewer)
    }

    #[tokio::test]
    async fn test_exchange_returns_next_frame() {
        let (channel, mut viewer) = connect(Arc::new(EventForwarder::new(false)), None);
        let companion = async {
            assert_eq!(viewer.next_command().await, "tell_time_updated");
            viewer.reply("10 ns").await;
        };
        let (reply, ()) = tokio::join!(channel.exchange("tell_time_updated"), companion);
        assert_eq!(reply.unwrap(), "10 ns");
    }

    #[tokio::test]
    async fn test_send_writes_lines_in_order() {
        let (channel, mut viewer) = connect(Arc::new(EventForwarder::new(false)), None);
        channel.send("gtkwave::reLoadFile").await.unwrap();
        channel
            .send_all(&["set a [list]".to_string(), "lappend a {x}".to_string()])
            .await
            .unwrap();
        assert_eq!(viewer.next_command().await, "gtkwave::reLoadFile");
        assert_eq!(viewer.next_command().await, "set a [list]");
        assert_eq!(viewer.next_command().await, "lappend a {x}");
    }

    #[tokio::test]
    async fn test_unsolicited_frame_goes_to_event_handler() {
        let events = Arc::new(EventForwarder::new(false));
        let (seen_tx, mut seen_rx) = mpsc::unbounded_channel();
        events.register("select", move |args: &[serde_json::Value]| {
            let _ = seen_tx.send(args.to_vec());
        });
        let (_channel, mut viewer) = connect(events, None);

        viewer
            .reply(r#"{"name":"select","args":["top.dut.clk"]}"#)
            .await;
        let args = seen_rx.recv().await.unwrap();
        assert_eq!(args, vec![serde_json::json!("top.dut.clk")]);

        // Exactly once.
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(seen_rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_event_shaped_reply_belongs_to_the_exchange() {
        let events = Arc::new(EventForwarder::new(false));
        let hits = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&hits);
        events.register("select", move |_: &[serde_json::Value]| {
            counter.fetch_add(1, Ordering::SeqCst);
        });
        let (channel, mut viewer) = connect(events, None);

        let event = r#"{"name":"select","args":[]}"#;
        let companion = async {
            assert_eq!(viewer.next_command().await, "tell_selected");
            viewer.reply(event).await;
        };
        let (reply, ()) = tokio::join!(channel.exchange("tell_selected"), companion);
        assert_eq!(reply.unwrap(), event);

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(hits.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_stale_output_is_drained_before_exchange() {
        let (channel, mut viewer) = connect(Arc::new(EventForwarder::new(false)), None);
        viewer.output.write_all(b"% stale prompt ").await.unwrap();
        // Let the reader buffer the partial output.
        tokio::time::sleep(Duration::from_millis(20)).await;

        let companion = async {
            viewer.next_command().await;
            viewer.reply("fresh").await;
        };
        let (reply, ()) = tokio::join!(channel.exchange("tell_selected"), companion);
        assert_eq!(reply.unwrap(), "fresh");
    }

    #[tokio::test]
    async fn test_exchanges_are_mutually_exclusive() {
        let (channel, mut viewer) = connect(Arc::new(EventForwarder::new(false)), None);
        let companion = async {
            for _ in 0..2 {
                let command = viewer.next_command().await;
                // No second command may arrive until this one is answered.
                let early =
                    tokio::time::timeout(Duration::from_millis(30), viewer.commands.next_line())
                        .await;
                assert!(early.is_err(), "command written during an exchange");
                viewer.reply(&format!("reply-{command}")).await;
            }
        };
        let (a, b, ()) = tokio::join!(channel.exchange("a"), channel.exchange("b"), companion);
        assert_eq!(a.unwrap(), "reply-a");
        assert_eq!(b.unwrap(), "reply-b");
    }

    #[tokio::test]
    async fn test_sends_never_land_inside_an_exchange() {
        let (channel, mut viewer) = connect(Arc::new(EventForwarder::new(false)), None);
        let batch = [
            "set signal_to_add [list]".to_string(),
            "lappend signal_to_add {top.clk}".to_string(),
            "gtkwave::addSignalsFromList $signal_to_add".to_string(),
        ];
        let companion = async {
            let mut seen = Vec::new();
            while seen.len() < batch.len() + 2 {
                let command = viewer.next_command().await;
                if command == "tell_time_updated" {
                    let early =
                        tokio::time::timeout(Duration::from_millis(30), viewer.commands.next_line())
                            .await;
                    assert!(early.is_err(), "command written during an exchange");
                    viewer.reply("10 ns").await;
                }
                seen.push(command);
            }
            seen
        };
        let (sent, reloaded, reply, seen) = tokio::join!(
            channel.send_all(&batch),
            channel.send("gtkwave::reLoadFile"),
            channel.exchange("tell_time_updated"),
            companion
        );
        sent.unwrap();
        reloaded.unwrap();
        assert_eq!(reply.unwrap(), "10 ns");

        // The batch arrives contiguous, whatever order the callers won the lock in.
        let start = seen.iter().position(|c| *c == batch[0]).unwrap();
        assert_eq!(seen[start..start + batch.len()], batch);
    }

    #[tokio::test]
    async fn test_exchange_after_writes_prelude_first() {
        let (channel, mut viewer) = connect(Arc::new(EventForwarder::new(false)), None);
        let companion = async {
            assert_eq!(
                viewer.next_command().await,
                "set signals_to_get { top.clk }"
            );
            assert_eq!(
                viewer.next_command().await,
                "get_signals_values $signals_to_get"
            );
            viewer.reply(r#"[{"sig":"top.clk","val":"1"}]"#).await;
        };
        let prelude = ["set signals_to_get { top.clk }".to_string()];
        let (reply, ()) = tokio::join!(
            channel.exchange_after(&prelude, "get_signals_values $signals_to_get"),
            companion
        );
        assert_eq!(reply.unwrap(), r#"[{"sig":"top.clk","val":"1"}]"#);
    }

    #[tokio::test]
    async fn test_output_closed_mid_exchange() {
        let (channel, viewer) = connect(Arc::new(EventForwarder::new(false)), None);
        let MockViewer {
            mut commands,
            output,
        } = viewer;
        let companion = async move {
            commands.next_line().await.unwrap();
            drop(output);
            commands
        };
        let (reply, _commands) = tokio::join!(channel.exchange("tell_selected"), companion);
        assert!(matches!(reply, Err(ViewerError::ChannelClosed)));
        assert!(channel.is_closed());
        assert!(matches!(
            channel.send("tell_selected").await,
            Err(ViewerError::NotRunning)
        ));
    }

    #[tokio::test]
    async fn test_timed_out_exchange_does_not_poison_the_next() {
        let limit = Duration::from_millis(50);
        let (channel, mut viewer) = connect(Arc::new(EventForwarder::new(false)), Some(limit));

        let reply = channel.exchange("slow").await;
        assert!(matches!(reply, Err(ViewerError::Timeout(d)) if d == limit));
        assert_eq!(viewer.next_command().await, "slow");

        // The late reply is unmatched output.
        viewer.reply("late").await;
        tokio::time::sleep(Duration::from_millis(20)).await;

        let companion = async {
            assert_eq!(viewer.next_command().await, "fast");
            viewer.reply("on time").await;
        };
        let (reply, ()) = tokio::join!(channel.exchange("fast"), companion);
        assert_eq!(reply.unwrap(), "on time");
    }

    #[tokio::test]
    async fn test_shutdown_closes_channel() {
        let (channel, mut viewer) = connect(Arc::new(EventForwarder::new(false)), None);
        channel.shutdown().await;
        assert!(channel.is_closed());
        assert!(matches!(
            channel.exchange("tell_selected").await,
            Err(ViewerError::NotRunning)
        ));
        // The viewer sees end of input.
        assert!(viewer.commands.next_line().await.unwrap().is_none());
    }
}
