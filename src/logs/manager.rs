use crate::logs::{LogSink, StreamKind, WriteOutcome};
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncReadExt, BufReader};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Longest record written; a longer line is split into several records
pub const MAX_RECORD_BYTES: usize = 64 * 1024;

/// Log-health notices sent to the controller
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LogNotice {
    /// First failed write on a stream; later records are dropped best-effort
    Degraded { stream: StreamKind, error: String },
    /// The stream's file accepted a write again
    Recovered { stream: StreamKind },
}

struct Drain {
    generation: u64,
    stream: StreamKind,
    task: JoinHandle<()>,
}

/// Drains process pipes into the shared [`LogSink`]
pub struct LogStreamManager {
    sink: LogSink,
    drains: Vec<Drain>,
    detach_tx: watch::Sender<bool>,
}

impl LogStreamManager {
    pub fn new(sink: LogSink) -> Self {
        let (detach_tx, _) = watch::channel(false);
        Self {
            sink,
            drains: Vec::new(),
            detach_tx,
        }
    }

    /// Start draining both pipes of one process generation.
    ///
    /// Missing pipes are skipped. Each drain runs until end-of-stream or
    /// [`detach`](Self::detach).
    pub fn attach<O, R, E>(
        &mut self,
        generation: u64,
        stdout: Option<O>,
        stderr: Option<R>,
        events: mpsc::Sender<E>,
    ) where
        O: AsyncRead + Unpin + Send + 'static,
        R: AsyncRead + Unpin + Send + 'static,
        E: From<LogNotice> + Send + 'static,
    {
        self.drains.retain(|d| !d.task.is_finished());

        if let Some(pipe) = stdout {
            self.spawn_drain(generation, StreamKind::Stdout, pipe, events.clone());
        }
        if let Some(pipe) = stderr {
            self.spawn_drain(generation, StreamKind::Stderr, pipe, events);
        }
    }

    fn spawn_drain<P, E>(&mut self, generation: u64, stream: StreamKind, pipe: P, events: mpsc::Sender<E>)
    where
        P: AsyncRead + Unpin + Send + 'static,
        E: From<LogNotice> + Send + 'static,
    {
        let sink = self.sink.clone();
        let detach = self.detach_tx.subscribe();
        let task = tokio::spawn(drain_pipe(sink, stream, pipe, detach, events));

        debug!(generation, %stream, "log drain attached");
        self.drains.push(Drain {
            generation,
            stream,
            task,
        });
    }

    /// Number of drains still reading
    pub fn active_drains(&self) -> usize {
        self.drains.iter().filter(|d| !d.task.is_finished()).count()
    }

    /// Wait for every drain to reach end-of-stream
    pub async fn join(&mut self) {
        while let Some(drain) = self.drains.last_mut() {
            if let Err(e) = (&mut drain.task).await {
                warn!(generation = drain.generation, stream = %drain.stream, "log drain failed: {}", e);
            }
            self.drains.pop();
        }
    }

    /// Stop all drains; any buffered partial line is written first
    pub async fn detach(&mut self) {
        let _ = self.detach_tx.send(true);
        self.join().await;
        self.detach_tx.send_replace(false);

        if let Err(e) = self.sink.flush().await {
            warn!("failed to flush logs on detach: {}", e);
        }
    }
}

async fn drain_pipe<P, E>(
    sink: LogSink,
    stream: StreamKind,
    pipe: P,
    mut detach: watch::Receiver<bool>,
    events: mpsc::Sender<E>,
) where
    P: AsyncRead + Unpin + Send + 'static,
    E: From<LogNotice> + Send + 'static,
{
    let mut reader = BufReader::new(pipe);
    let mut line = Vec::new();

    loop {
        let budget = (MAX_RECORD_BYTES - line.len()) as u64;
        let mut limited = (&mut reader).take(budget);

        // read_until is cancel safe: bytes read before a detach stay in `line`
        let read = tokio::select! {
            read = limited.read_until(b'\n', &mut line) => read,
            _ = detach.wait_for(|detached| *detached) => break,
        };

        match read {
            Ok(0) => break,
            Ok(_) => {
                // A partial line under the cap waits for more input or EOF
                if line.last() == Some(&b'\n') || line.len() >= MAX_RECORD_BYTES {
                    write_record(&sink, stream, &line, &events).await;
                    line.clear();
                }
            }
            Err(e) => {
                warn!(%stream, "pipe read failed: {}", e);
                break;
            }
        }
    }

    if !line.is_empty() {
        write_record(&sink, stream, &line, &events).await;
    }

    debug!(%stream, "log drain finished");
}

async fn write_record<E>(sink: &LogSink, stream: StreamKind, line: &[u8], events: &mpsc::Sender<E>)
where
    E: From<LogNotice> + Send + 'static,
{
    match sink.write_line(stream, line).await {
        WriteOutcome::Written | WriteOutcome::Dropped => {}
        WriteOutcome::Degraded(error) => {
            warn!(%stream, "log writes degraded, dropping records: {}", error);
            notify(events, stream, LogNotice::Degraded { stream, error });
        }
        WriteOutcome::Recovered => {
            info!(%stream, "log writes recovered");
            notify(events, stream, LogNotice::Recovered { stream });
        }
    }
}

/// Never waits on the controller queue, which may itself be waiting on this drain
fn notify<E>(events: &mpsc::Sender<E>, stream: StreamKind, notice: LogNotice)
where
    E: From<LogNotice> + Send + 'static,
{
    if events.try_send(E::from(notice)).is_err() {
        warn!(%stream, "log health notice not delivered, controller queue full or closed");
    }
}
