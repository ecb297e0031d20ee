use std::collections::{BTreeMap, HashMap};
use std::sync::LazyLock;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{HyperError, Result};

/// Exit status recorded when a task is cancelled by an operator.
pub const EXIT_STATUS_CANCELLED: i32 = -1;
/// Exit status recorded when template expansion fails for a task.
pub const EXIT_STATUS_TEMPLATE_ERROR: i32 = -2;
/// Exit status recorded when a task process survived SIGKILL.
pub const EXIT_STATUS_UNKILLABLE: i32 = -3;

/// Unique identifier of this process instance (submit/server/client id).
pub static INSTANCE: LazyLock<Uuid> = LazyLock::new(Uuid::new_v4);

/// Local hostname, resolved once.
pub static HOSTNAME: LazyLock<String> = LazyLock::new(|| {
    nix::unistd::gethostname()
        .map(|h| h.to_string_lossy().into_owned())
        .unwrap_or_else(|_| "localhost".to_string())
});

/// One shell command-line submitted for execution.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Task {
    pub id: Uuid,
    pub args: String,

    pub submit_id: Uuid,
    pub submit_host: String,
    pub submit_time: DateTime<Utc>,

    pub server_id: Option<Uuid>,
    pub server_host: Option<String>,
    pub schedule_time: Option<DateTime<Utc>>,

    pub client_id: Option<Uuid>,
    pub client_host: Option<String>,

    pub command: Option<String>,
    pub start_time: Option<DateTime<Utc>>,
    pub completion_time: Option<DateTime<Utc>>,
    pub exit_status: Option<i32>,

    pub outpath: Option<String>,
    pub errpath: Option<String>,

    pub attempt: i32,
    pub retried: bool,

    pub waited: Option<i64>,
    pub duration: Option<i64>,

    pub previous_id: Option<Uuid>,

    pub tags: BTreeMap<String, String>,
}

/// A group of tasks transmitted as a unit between server and client.
pub type Bundle = Vec<Task>;

impl Task {
    /// Create a new task from a submitted command-line. An inline tag comment
    /// (`# HYPERSHELL: key=value ...`) is split off the args and merged with
    /// the given `tags`.
    pub fn new(argline: &str, tags: &BTreeMap<String, String>) -> Result<Self> {
        let (args, inline_tags) = split_argline(argline)?;
        let mut merged = tags.clone();
        merged.extend(inline_tags);
        for (key, value) in &merged {
            validate_tag(key, value)?;
        }
        Ok(Self {
            id: Uuid::new_v4(),
            args,
            submit_id: *INSTANCE,
            submit_host: HOSTNAME.clone(),
            submit_time: Utc::now(),
            server_id: None,
            server_host: None,
            schedule_time: None,
            client_id: None,
            client_host: None,
            command: None,
            start_time: None,
            completion_time: None,
            exit_status: None,
            outpath: None,
            errpath: None,
            attempt: 1,
            retried: false,
            waited: None,
            duration: None,
            previous_id: None,
            tags: merged,
        })
    }

    /// A task is schedulable until a server stamps its schedule time.
    pub fn is_schedulable(&self) -> bool {
        self.schedule_time.is_none()
    }

    /// A task is complete once an exit status is recorded.
    pub fn is_complete(&self) -> bool {
        self.exit_status.is_some()
    }

    pub fn is_failed(&self) -> bool {
        matches!(self.exit_status, Some(status) if status != 0)
    }

    /// New attempt superseding this (failed) task. Tags are inherited.
    pub fn retry(&self) -> Self {
        Self {
            id: Uuid::new_v4(),
            args: self.args.clone(),
            submit_id: *INSTANCE,
            submit_host: HOSTNAME.clone(),
            submit_time: Utc::now(),
            server_id: None,
            server_host: None,
            schedule_time: None,
            client_id: None,
            client_host: None,
            command: None,
            start_time: None,
            completion_time: None,
            exit_status: None,
            outpath: None,
            errpath: None,
            attempt: self.attempt + 1,
            retried: false,
            waited: None,
            duration: None,
            previous_id: Some(self.id),
            tags: self.tags.clone(),
        }
    }

    /// Environment exposed to the running task process. Optional values map
    /// to empty strings so the variable set is stable across tasks.
    pub fn env(&self, cwd: &str) -> HashMap<String, String> {
        fn fmt_time(value: &Option<DateTime<Utc>>) -> String {
            value.map(|t| t.to_rfc3339()).unwrap_or_default()
        }
        fn fmt_id(value: &Option<Uuid>) -> String {
            value.map(|id| id.to_string()).unwrap_or_default()
        }
        let mut env = HashMap::from([
            ("TASK_ID".to_string(), self.id.to_string()),
            ("TASK_ARGS".to_string(), self.args.clone()),
            (
                "TASK_COMMAND".to_string(),
                self.command.clone().unwrap_or_default(),
            ),
            ("TASK_SUBMIT_ID".to_string(), self.submit_id.to_string()),
            ("TASK_SUBMIT_HOST".to_string(), self.submit_host.clone()),
            (
                "TASK_SUBMIT_TIME".to_string(),
                self.submit_time.to_rfc3339(),
            ),
            ("TASK_SERVER_ID".to_string(), fmt_id(&self.server_id)),
            (
                "TASK_SERVER_HOST".to_string(),
                self.server_host.clone().unwrap_or_default(),
            ),
            (
                "TASK_SCHEDULE_TIME".to_string(),
                fmt_time(&self.schedule_time),
            ),
            ("TASK_CLIENT_ID".to_string(), fmt_id(&self.client_id)),
            (
                "TASK_CLIENT_HOST".to_string(),
                self.client_host.clone().unwrap_or_default(),
            ),
            ("TASK_ATTEMPT".to_string(), self.attempt.to_string()),
            ("TASK_PREVIOUS_ID".to_string(), fmt_id(&self.previous_id)),
            ("TASK_CWD".to_string(), cwd.to_string()),
            ("TASK_START_TIME".to_string(), fmt_time(&self.start_time)),
            (
                "TASK_WAITED".to_string(),
                self.waited.map(|w| w.to_string()).unwrap_or_default(),
            ),
            (
                "TASK_OUTPATH".to_string(),
                self.outpath.clone().unwrap_or_default(),
            ),
            (
                "TASK_ERRPATH".to_string(),
                self.errpath.clone().unwrap_or_default(),
            ),
        ]);
        for (key, value) in &self.tags {
            env.insert(format!("TASK_TAG_{}", key.to_uppercase()), value.clone());
        }
        env
    }
}

/// Separate input args from a possible inline tag comment.
pub fn split_argline(argline: &str) -> Result<(String, BTreeMap<String, String>)> {
    static MARKER: LazyLock<regex::Regex> =
        LazyLock::new(|| regex::Regex::new(r"#\s*HYPERSHELL:?").unwrap());
    if let Some(found) = MARKER.find(argline) {
        let mut tags = BTreeMap::new();
        for token in argline[found.end()..].split_whitespace() {
            let (key, value) = match token.split_once('=') {
                Some((key, value)) => (key.to_string(), value.to_string()),
                None => (token.to_string(), String::new()),
            };
            validate_tag(&key, &value)?;
            tags.insert(key, value);
        }
        Ok((argline[..found.start()].trim().to_string(), tags))
    } else {
        Ok((argline.trim().to_string(), BTreeMap::new()))
    }
}

/// Check a tag key/value pair, empty value meaning a naked tag.
pub fn validate_tag(key: &str, value: &str) -> Result<()> {
    static NAME: LazyLock<regex::Regex> =
        LazyLock::new(|| regex::Regex::new(r"^[A-Za-z0-9_.+-]+$").unwrap());
    if key.is_empty() || key.len() > 120 || !NAME.is_match(key) {
        return Err(HyperError::Config(format!(
            "invalid tag key \"{key}\" (alphanumerics and [+._-] only, max 120 chars)"
        )));
    }
    if !value.is_empty() && (value.len() > 120 || !NAME.is_match(value)) {
        return Err(HyperError::Config(format!(
            "invalid tag value \"{value}\" for key \"{key}\""
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn new_task_is_schedulable() {
        let task = Task::new("echo hello", &BTreeMap::new()).unwrap();
        assert!(task.is_schedulable());
        assert!(!task.is_complete());
        assert_eq!(task.args, "echo hello");
        assert_eq!(task.attempt, 1);
    }

    #[test]
    fn retry_links_previous_attempt() {
        let mut task = Task::new("false", &BTreeMap::new()).unwrap();
        task.exit_status = Some(1);
        let retry = task.retry();
        assert_eq!(retry.attempt, 2);
        assert_eq!(retry.previous_id, Some(task.id));
        assert_eq!(retry.args, task.args);
        assert!(retry.is_schedulable());
    }

    #[test]
    fn inline_tags_split_from_args() {
        let (args, tags) = split_argline("./run.sh input.h5  # HYPERSHELL: site=aa group").unwrap();
        assert_eq!(args, "./run.sh input.h5");
        assert_eq!(tags.get("site").map(String::as_str), Some("aa"));
        assert_eq!(tags.get("group").map(String::as_str), Some(""));
    }

    #[test]
    fn invalid_tag_key_rejected() {
        assert!(split_argline("true # HYPERSHELL: bad key!=x").is_err());
    }

    #[test]
    fn task_env_names() {
        let task = Task::new("echo 1", &BTreeMap::from([("site".into(), "aa".into())])).unwrap();
        let env = task.env("/tmp");
        assert_eq!(env.get("TASK_ARGS").map(String::as_str), Some("echo 1"));
        assert_eq!(env.get("TASK_CWD").map(String::as_str), Some("/tmp"));
        assert_eq!(env.get("TASK_TAG_SITE").map(String::as_str), Some("aa"));
        assert!(env.contains_key("TASK_PREVIOUS_ID"));
    }

    #[test]
    fn bundle_round_trip() {
        let bundle: Bundle = vec![
            Task::new("echo a", &BTreeMap::new()).unwrap(),
            Task::new("echo b", &BTreeMap::new()).unwrap(),
        ];
        let data = serde_json::to_vec(&bundle).unwrap();
        let back: Bundle = serde_json::from_slice(&data).unwrap();
        assert_eq!(back, bundle);
    }
}
