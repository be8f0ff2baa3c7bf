use std::collections::BTreeMap;
use uuid::Uuid;

pub type Program = String;
pub type Args = Vec<String>;
pub type Envs = Vec<(String, String)>;
pub type JobId = Uuid;
pub type OutputLine = String;
/// Role name -> blob key, as recorded on a job.
pub type ArtifactKeys = BTreeMap<String, String>;
