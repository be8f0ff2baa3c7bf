mod actor;
mod messages;

use crate::command::CommandSpec;
use crate::events::{Output, ProcessStatus};
use actor::Actor;
use messages::WorkerMessage;
use std::{io, process::Stdio};
use tokio::{
    process,
    sync::{mpsc, oneshot},
};

#[derive(thiserror::Error, Debug, PartialEq, Eq)]
pub enum StopError {
    #[error("process already exited")]
    AlreadyStopped,
}

/// Handle to one running external process.
///
/// The actor behind it owns the child: it pumps stdout and stderr line by line into
/// the output channel, reaps the child, and kills it on request or once every handle
/// is dropped.
#[derive(Clone)]
pub struct WorkerHandle {
    sender: mpsc::UnboundedSender<WorkerMessage>,
}

impl WorkerHandle {
    pub fn spawn(output_tx: mpsc::UnboundedSender<Output>, spec: &CommandSpec) -> io::Result<Self> {
        let mut command = process::Command::new(&spec.program);
        let child = command
            .args(&spec.args)
            .current_dir(&spec.current_dir)
            .envs(spec.envs.iter().map(|(k, v)| (k, v)))
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()?;
        let (sender, inbox) = mpsc::unbounded_channel();
        Actor::spawn(inbox, output_tx, child);
        Ok(Self { sender })
    }

    /// Wait for the process to exit.
    pub async fn wait(&self) -> io::Result<ProcessStatus> {
        let (tx, rx) = oneshot::channel();
        let _ = self.sender.send(WorkerMessage::Wait { response: tx });
        rx.await
            .unwrap_or_else(|_| Err(io::Error::new(io::ErrorKind::Other, "worker exited")))
    }

    /// Kill the process.
    pub async fn stop(&self) -> Result<(), StopError> {
        let (tx, rx) = oneshot::channel();
        let _ = self.sender.send(WorkerMessage::Stop { response: tx });
        rx.await.unwrap_or(Err(StopError::AlreadyStopped))
    }
}
