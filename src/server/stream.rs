use std::collections::VecDeque;
use std::convert::Infallible;
use std::io::ErrorKind;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use axum::extract::State;
use axum::response::sse::{Event, KeepAlive, Sse};
use futures::stream::{self, Stream, StreamExt};
use tokio::fs::File;
use tokio::io::AsyncReadExt;
use tracing::warn;

use crate::server::AppState;
use crate::session::AuthSession;
use crate::training::JobCoordinator;

pub const POLL_INTERVAL: Duration = Duration::from_millis(100);

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StreamChunk {
    Data(String),
    Close,
}

/// Live view of the session's training log as a server-sent-event stream.
/// Every sequence ends with exactly one `close` event; a reconnecting
/// client gets a fresh reader that starts over at the top of the file.
pub async fn stream(
    State(state): State<AppState>,
    auth: AuthSession,
) -> Sse<impl Stream<Item = Result<Event, Infallible>>> {
    let coordinator = state.inner.coordinator.clone();
    let chunks = match auth.session.log_file {
        Some(path) => tail_chunks(path, coordinator).boxed(),
        None => stream::iter([
            StreamChunk::Data("No training log for this session".to_string()),
            StreamChunk::Close,
        ])
        .boxed(),
    };

    let events = chunks.map(|chunk| {
        Ok(match chunk {
            StreamChunk::Data(line) => Event::default().data(line),
            StreamChunk::Close => Event::default().event("close").data("close"),
        })
    });

    Sse::new(events).keep_alive(KeepAlive::default())
}

/// Follows a growing log file, one chunk per complete line. Polls on a
/// fixed interval; closes once the file stops growing and no submitted run
/// is pending or executing. The runner flushes every line before it
/// releases the slot, so an idle coordinator means the file is complete.
pub fn tail_chunks(
    path: PathBuf,
    coordinator: Arc<JobCoordinator>,
) -> impl Stream<Item = StreamChunk> {
    let tail = Tail {
        path,
        coordinator,
        file: None,
        carry: Vec::new(),
        pending: VecDeque::new(),
        closed: false,
    };
    stream::unfold(tail, |mut tail| async move {
        let chunk = tail.next_chunk().await?;
        Some((chunk, tail))
    })
}

struct Tail {
    path: PathBuf,
    coordinator: Arc<JobCoordinator>,
    file: Option<File>,
    carry: Vec<u8>,
    pending: VecDeque<String>,
    closed: bool,
}

impl Tail {
    async fn next_chunk(&mut self) -> Option<StreamChunk> {
        if self.closed {
            return None;
        }
        loop {
            if let Some(line) = self.pending.pop_front() {
                return Some(StreamChunk::Data(line));
            }

            // Sample busy before reading: if the coordinator was already
            // idle, the writer had flushed everything this read can see.
            let busy = self.coordinator.has_active();
            match self.read_new_bytes().await {
                Ok(0) => {
                    if busy {
                        tokio::time::sleep(POLL_INTERVAL).await;
                    } else {
                        self.closed = true;
                        return Some(StreamChunk::Close);
                    }
                }
                Ok(_) => self.split_lines(),
                Err(err) => {
                    warn!(log = %self.path.display(), error = %err, "failed to read training log");
                    self.closed = true;
                    return Some(StreamChunk::Close);
                }
            }
        }
    }

    async fn read_new_bytes(&mut self) -> std::io::Result<usize> {
        if self.file.is_none() {
            match File::open(&self.path).await {
                Ok(file) => self.file = Some(file),
                Err(e) if e.kind() == ErrorKind::NotFound => return Ok(0),
                Err(e) => return Err(e),
            }
        }
        let Some(file) = self.file.as_mut() else {
            return Ok(0);
        };
        file.read_to_end(&mut self.carry).await
    }

    fn split_lines(&mut self) {
        while let Some(newline) = self.carry.iter().position(|b| *b == b'\n') {
            let mut line: Vec<u8> = self.carry.drain(..=newline).collect();
            line.pop();
            if line.last() == Some(&b'\r') {
                line.pop();
            }
            self.pending
                .push_back(String::from_utf8_lossy(&line).into_owned());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::training::runner::append_line;
    use crate::training::TrainingStatus;
    use std::path::Path;
    use tokio::time::timeout;

    fn test_log() -> PathBuf {
        let timestamp = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .unwrap()
            .as_nanos();
        let dir = std::env::temp_dir().join(format!(
            "tesstrain-web-tail-{}-{timestamp}",
            std::process::id()
        ));
        std::fs::create_dir_all(&dir).unwrap();
        let log = dir.join("run.log");
        std::fs::write(&log, b"").unwrap();
        log
    }

    async fn raw_append(path: &Path, bytes: &[u8]) {
        use tokio::io::AsyncWriteExt;
        let mut file = tokio::fs::OpenOptions::new()
            .append(true)
            .open(path)
            .await
            .unwrap();
        file.write_all(bytes).await.unwrap();
        file.flush().await.unwrap();
    }

    #[tokio::test]
    async fn lines_arrive_in_order_exactly_once_then_a_single_close() {
        let log = test_log();
        let coordinator = Arc::new(JobCoordinator::default());
        coordinator.submit(&log);
        let ticket = coordinator.try_begin(&log).unwrap();

        let mut chunks = Box::pin(tail_chunks(log.clone(), coordinator.clone()));

        append_line(&log, "line one").await.unwrap();
        assert_eq!(
            chunks.next().await,
            Some(StreamChunk::Data("line one".into()))
        );

        append_line(&log, "line two").await.unwrap();
        append_line(&log, "line three").await.unwrap();
        assert_eq!(
            chunks.next().await,
            Some(StreamChunk::Data("line two".into()))
        );
        assert_eq!(
            chunks.next().await,
            Some(StreamChunk::Data("line three".into()))
        );

        ticket.finish(TrainingStatus::Completed);
        assert_eq!(chunks.next().await, Some(StreamChunk::Close));
        assert_eq!(chunks.next().await, None);
    }

    #[tokio::test]
    async fn stays_open_while_a_run_is_live_but_quiet() {
        let log = test_log();
        let coordinator = Arc::new(JobCoordinator::default());
        coordinator.submit(&log);
        let ticket = coordinator.try_begin(&log).unwrap();

        let mut chunks = Box::pin(tail_chunks(log.clone(), coordinator.clone()));
        let pending = timeout(Duration::from_millis(300), chunks.next()).await;
        assert!(pending.is_err(), "stream must keep polling while the run is live");

        drop(ticket);
        assert_eq!(chunks.next().await, Some(StreamChunk::Close));
    }

    #[tokio::test]
    async fn partial_lines_are_held_back_until_the_newline() {
        let log = test_log();
        let coordinator = Arc::new(JobCoordinator::default());
        coordinator.submit(&log);
        let ticket = coordinator.try_begin(&log).unwrap();

        let mut chunks = Box::pin(tail_chunks(log.clone(), coordinator.clone()));

        raw_append(&log, b"par").await;
        let pending = timeout(Duration::from_millis(300), chunks.next()).await;
        assert!(pending.is_err(), "incomplete line must not be emitted");

        raw_append(&log, b"tial\r\n").await;
        assert_eq!(
            chunks.next().await,
            Some(StreamChunk::Data("partial".into()))
        );
        drop(ticket);
    }

    #[tokio::test]
    async fn idle_coordinator_and_finished_file_close_after_a_full_replay() {
        let log = test_log();
        let coordinator = Arc::new(JobCoordinator::default());
        append_line(&log, "old line").await.unwrap();

        // a late or reconnecting client re-reads from the top
        let chunks: Vec<StreamChunk> =
            tail_chunks(log.clone(), coordinator.clone()).collect().await;
        assert_eq!(
            chunks,
            vec![
                StreamChunk::Data("old line".into()),
                StreamChunk::Close,
            ]
        );
    }

    #[tokio::test]
    async fn missing_file_with_idle_coordinator_closes_immediately() {
        let coordinator = Arc::new(JobCoordinator::default());
        let chunks: Vec<StreamChunk> =
            tail_chunks(PathBuf::from("/nonexistent/run.log"), coordinator)
                .collect()
                .await;
        assert_eq!(chunks, vec![StreamChunk::Close]);
    }
}
