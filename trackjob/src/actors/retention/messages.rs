use crate::error;
use std::{path::PathBuf, time::Duration};
use tokio::sync::oneshot;

#[derive(Debug)]
pub enum RetentionMessage {
    RecordRetrieval {
        result_set: PathBuf,
        response: oneshot::Sender<error::Result<bool>>,
    },
    Release {
        result_set: PathBuf,
        response: oneshot::Sender<bool>,
    },
    Sweep {
        max_age: Duration,
        response: oneshot::Sender<Vec<PathBuf>>,
    },
    Tracked {
        response: oneshot::Sender<Vec<PathBuf>>,
    },
}
