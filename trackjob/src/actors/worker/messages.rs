use super::StopError;
use crate::events::ProcessStatus;
use std::io;
use tokio::sync::oneshot;

pub enum WorkerMessage {
    /// Resolve once the child has exited.
    Wait {
        response: oneshot::Sender<io::Result<ProcessStatus>>,
    },
    Stop {
        response: oneshot::Sender<Result<(), StopError>>,
    },
}
