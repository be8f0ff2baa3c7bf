use super::messages::WorkerMessage;
use super::StopError;
use crate::events::{Output, ProcessStatus};

use futures::future::FutureExt;
use std::io;
use std::os::unix::process::ExitStatusExt;
use tokio::{
    io::{AsyncBufReadExt, AsyncRead, BufReader},
    process::Child,
    select,
    sync::{mpsc, oneshot},
};

type ExitResult = io::Result<ProcessStatus>;

pub struct Actor {
    inbox: mpsc::UnboundedReceiver<WorkerMessage>,
    kill_tx: Option<oneshot::Sender<()>>,
    process_status: ProcessStatus,
    exit_error: Option<io::Error>,
    waiters: Vec<oneshot::Sender<ExitResult>>,
}

impl Actor {
    pub fn spawn(
        inbox: mpsc::UnboundedReceiver<WorkerMessage>,
        output_tx: mpsc::UnboundedSender<Output>,
        child: Child,
    ) {
        let (kill_tx, kill_rx) = oneshot::channel();
        tokio::spawn(async move {
            let actor = Self {
                inbox,
                kill_tx: Some(kill_tx),
                process_status: ProcessStatus::Running,
                exit_error: None,
                waiters: Vec::new(),
            };
            actor.run(output_tx, kill_rx, child).await;
        });
    }

    async fn run(
        mut self,
        output_tx: mpsc::UnboundedSender<Output>,
        kill_rx: oneshot::Receiver<()>,
        mut child: Child,
    ) {
        let (child_exit_tx, child_exit_rx) = oneshot::channel();
        let maybe_stdout = child.stdout.take();
        let maybe_stderr = child.stderr.take();
        let mut kill_rx = kill_rx.fuse();

        // reap the child, killing it first if asked to
        tokio::spawn(async move {
            loop {
                select! {
                    _ = &mut kill_rx => {
                        if let Err(err) = child.start_kill() {
                            tracing::warn!(error = %err, "failed to kill tool process");
                        }
                    }
                    exit_status = child.wait() => {
                        let exit = exit_status.map(|exit_status| {
                            match (exit_status.code(), exit_status.signal()) {
                                (Some(code), _) => ProcessStatus::Exited { code },
                                (None, Some(signal)) => ProcessStatus::Killed { signal },
                                (None, None) => ProcessStatus::Exited { code: -1 },
                            }
                        });
                        let _ = child_exit_tx.send(exit);
                        break;
                    }
                }
            }
        });

        // both streams feed one channel, so stderr is merged into stdout in arrival order
        if let Some(stdout) = maybe_stdout {
            tokio::spawn(pump_lines(stdout, output_tx.clone(), Output::Stdout));
        }
        if let Some(stderr) = maybe_stderr {
            tokio::spawn(pump_lines(stderr, output_tx, Output::Stderr));
        }

        self.handle_messages(child_exit_rx).await;
    }

    async fn handle_messages(&mut self, child_exit_rx: oneshot::Receiver<ExitResult>) {
        use WorkerMessage::*;
        let mut child_exit_rx = child_exit_rx.fuse();
        loop {
            select! {
                maybe_msg = self.inbox.recv() => {
                    match maybe_msg {
                        Some(Wait { response }) => {
                            if self.process_status == ProcessStatus::Running && self.exit_error.is_none() {
                                self.waiters.push(response);
                            } else {
                                let _ = response.send(self.exit_result());
                            }
                        }
                        Some(Stop { response }) => {
                            match (self.process_status, self.kill_tx.take()) {
                                (ProcessStatus::Running, Some(kill_tx)) => {
                                    let _ = kill_tx.send(());
                                    let _ = response.send(Ok(()));
                                }
                                _ => {
                                    let _ = response.send(Err(StopError::AlreadyStopped));
                                }
                            }
                        }
                        None => {
                            // every handle dropped, make sure the child does not outlive us
                            if let Some(kill_tx) = self.kill_tx.take() {
                                let _ = kill_tx.send(());
                            }
                            return;
                        }
                    }
                }
                exit = &mut child_exit_rx => {
                    match exit {
                        Ok(Ok(status)) => self.process_status = status,
                        Ok(Err(err)) => self.exit_error = Some(err),
                        Err(_) => {
                            self.exit_error = Some(io::Error::new(io::ErrorKind::Other, "reaper task vanished"))
                        }
                    }
                    for waiter in self.waiters.drain(..).collect::<Vec<_>>() {
                        let _ = waiter.send(self.exit_result());
                    }
                }
            }
        }
    }

    fn exit_result(&self) -> ExitResult {
        match &self.exit_error {
            Some(err) => Err(io::Error::new(err.kind(), err.to_string())),
            None => Ok(self.process_status),
        }
    }
}

/// Forward each line of `stream` until EOF.
async fn pump_lines<R>(stream: R, output_tx: mpsc::UnboundedSender<Output>, wrap: fn(String) -> Output)
where
    R: AsyncRead + Unpin,
{
    let mut lines = BufReader::new(stream).lines();
    loop {
        match lines.next_line().await {
            Ok(Some(line)) => {
                let _ = output_tx.send(wrap(line));
            }
            Ok(None) => break,
            Err(err) => {
                tracing::debug!(error = %err, "tool output stream closed");
                break;
            }
        }
    }
}
