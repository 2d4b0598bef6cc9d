use serde_json::Value;
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::ops::ControlFlow;
use std::process::Stdio;
use std::time::Duration;
use thiserror::Error;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::{Child, Command};
use tokio::time::Instant;

/// How long a decoder that closed stdout gets to exit before it is killed.
const EXIT_GRACE: Duration = Duration::from_millis(500);

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DecoderCommand {
    pub program: String,
    pub args: Vec<String>,
}

impl DecoderCommand {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
        }
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }
}

impl fmt::Display for DecoderCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.program)?;
        for arg in &self.args {
            write!(f, " {arg}")?;
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamOutcome {
    /// The completion condition was met; the process was killed.
    Completed,
    /// Stdout closed before the completion condition was met.
    Exhausted,
    /// The deadline passed first; the process was killed.
    TimedOut,
}

#[derive(Debug, Error)]
pub enum DecoderError {
    #[error("failed to spawn decoder `{program}`: {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },
    #[error("failed reading decoder output: {0}")]
    Read(#[from] std::io::Error),
}

#[derive(Debug, Clone)]
pub struct DecoderRead {
    pub messages: HashMap<String, Value>,
    pub outcome: StreamOutcome,
}

impl DecoderRead {
    pub fn is_complete(&self) -> bool {
        self.outcome == StreamOutcome::Completed
    }
}

/// Runs `command` and feeds every JSON line on its stdout to `on_message`
/// until it returns `Break`, stdout closes, or `deadline` passes.
///
/// Blank and malformed lines are skipped. The child is killed unless it
/// closed stdout on its own, and is reaped before returning.
pub async fn stream_messages<F>(
    command: &DecoderCommand,
    deadline: Instant,
    mut on_message: F,
) -> Result<StreamOutcome, DecoderError>
where
    F: FnMut(Value) -> ControlFlow<()>,
{
    tracing::debug!(command = %command, "spawning decoder");
    let mut child = Command::new(&command.program)
        .args(&command.args)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::null())
        .kill_on_drop(true)
        .spawn()
        .map_err(|source| DecoderError::Spawn {
            program: command.program.clone(),
            source,
        })?;

    let Some(stdout) = child.stdout.take() else {
        reap(&mut child, true).await;
        return Err(DecoderError::Spawn {
            program: command.program.clone(),
            source: std::io::Error::other("stdout was not captured"),
        });
    };
    let mut lines = BufReader::new(stdout).lines();

    let pump = async {
        while let Some(line) = lines.next_line().await? {
            let trimmed = line.trim();
            if trimmed.is_empty() {
                continue;
            }
            let message: Value = match serde_json::from_str(trimmed) {
                Ok(message) => message,
                Err(err) => {
                    tracing::debug!(error = %err, line = trimmed, "skipping malformed decoder line");
                    continue;
                }
            };
            if on_message(message).is_break() {
                return Ok(StreamOutcome::Completed);
            }
        }
        Ok::<_, std::io::Error>(StreamOutcome::Exhausted)
    };

    let result = match tokio::time::timeout_at(deadline, pump).await {
        Ok(Ok(outcome)) => Ok(outcome),
        Ok(Err(err)) => Err(DecoderError::Read(err)),
        Err(_) => {
            tracing::warn!(command = %command, "decoder read deadline passed; killing decoder");
            Ok(StreamOutcome::TimedOut)
        }
    };
    drop(lines);

    let force = !matches!(result, Ok(StreamOutcome::Exhausted));
    reap(&mut child, force).await;
    result
}

/// Reads until every identifier in `required` has been matched once.
///
/// `matcher` maps a decoded message to the identifier it belongs to. The first
/// message seen for each required identifier is kept; later ones and messages
/// for identifiers outside `required` are ignored. A short result (anything
/// but [`StreamOutcome::Completed`]) is still returned, never an error.
pub async fn read_matching<M>(
    command: &DecoderCommand,
    required: &HashSet<String>,
    deadline: Instant,
    matcher: M,
) -> Result<DecoderRead, DecoderError>
where
    M: Fn(&Value) -> Option<String>,
{
    let mut messages: HashMap<String, Value> = HashMap::new();
    if required.is_empty() {
        return Ok(DecoderRead {
            messages,
            outcome: StreamOutcome::Completed,
        });
    }

    let outcome = stream_messages(command, deadline, |message| {
        if let Some(id) = matcher(&message) {
            if required.contains(&id) {
                messages.entry(id).or_insert(message);
            }
        }
        if messages.len() == required.len() {
            ControlFlow::Break(())
        } else {
            ControlFlow::Continue(())
        }
    })
    .await?;

    if outcome != StreamOutcome::Completed {
        tracing::info!(
            command = %command,
            found = messages.len(),
            required = required.len(),
            outcome = ?outcome,
            "decoder stopped before all identifiers were seen"
        );
    }

    Ok(DecoderRead { messages, outcome })
}

async fn reap(child: &mut Child, force: bool) {
    if !force {
        match tokio::time::timeout(EXIT_GRACE, child.wait()).await {
            Ok(Ok(status)) => {
                tracing::trace!(status = %status, "decoder exited");
                return;
            }
            Ok(Err(err)) => {
                tracing::debug!(error = %err, "failed waiting on decoder");
                return;
            }
            // Closed stdout but kept running.
            Err(_) => {}
        }
    }
    if let Err(err) = child.kill().await {
        tracing::debug!(error = %err, "failed to kill decoder");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn fixture(lines: &[&str]) -> tempfile::NamedTempFile {
        let mut file = tempfile::NamedTempFile::new().expect("tempfile");
        for line in lines {
            writeln!(file, "{line}").expect("write fixture");
        }
        file.flush().expect("flush fixture");
        file
    }

    fn cat(file: &tempfile::NamedTempFile) -> DecoderCommand {
        DecoderCommand::new("cat").arg(file.path().display().to_string())
    }

    fn id_matcher(message: &Value) -> Option<String> {
        message.get("ID").and_then(Value::as_str).map(str::to_string)
    }

    fn ids(values: &[&str]) -> HashSet<String> {
        values.iter().map(|v| v.to_string()).collect()
    }

    fn soon(secs: u64) -> Instant {
        Instant::now() + Duration::from_secs(secs)
    }

    #[test]
    fn command_display_joins_args() {
        let cmd = DecoderCommand::new("rtlamr").args(["-format", "json"]);
        assert_eq!(cmd.to_string(), "rtlamr -format json");
    }

    #[tokio::test]
    async fn malformed_line_is_skipped() {
        let file = fixture(&["not json", r#"{"ID":"123","Consumption":"4500"}"#]);
        let read = read_matching(&cat(&file), &ids(&["123"]), soon(10), id_matcher)
            .await
            .expect("read");
        assert!(read.is_complete());
        assert_eq!(read.messages.len(), 1);
        assert_eq!(read.messages["123"]["Consumption"], "4500");
    }

    #[tokio::test]
    async fn exhausted_stream_returns_partial_result() {
        let file = fixture(&[
            r#"{"ID":"111","Consumption":1}"#,
            "",
            r#"{"ID":"999","Consumption":2}"#,
        ]);
        let read = read_matching(&cat(&file), &ids(&["111", "222"]), soon(10), id_matcher)
            .await
            .expect("read");
        assert_eq!(read.outcome, StreamOutcome::Exhausted);
        assert_eq!(read.messages.len(), 1);
        assert!(read.messages.contains_key("111"));
    }

    #[tokio::test]
    async fn first_message_per_identifier_wins() {
        let file = fixture(&[
            r#"{"ID":"111","Consumption":1}"#,
            r#"{"ID":"111","Consumption":5}"#,
            r#"{"ID":"222","Consumption":7}"#,
        ]);
        let read = read_matching(&cat(&file), &ids(&["111", "222"]), soon(10), id_matcher)
            .await
            .expect("read");
        assert!(read.is_complete());
        assert_eq!(read.messages["111"]["Consumption"], 1);
        assert_eq!(read.messages["222"]["Consumption"], 7);
    }

    #[tokio::test]
    async fn completion_kills_a_still_running_decoder() {
        let cmd = DecoderCommand::new("sh")
            .arg("-c")
            .arg(r#"echo '{"ID":"42"}'; exec sleep 30"#);
        let started = std::time::Instant::now();
        let read = read_matching(&cmd, &ids(&["42"]), soon(20), id_matcher)
            .await
            .expect("read");
        assert!(read.is_complete());
        assert!(started.elapsed() < Duration::from_secs(10));
    }

    #[tokio::test]
    async fn decoder_lingering_after_closing_stdout_is_killed() {
        let cmd = DecoderCommand::new("sh")
            .arg("-c")
            .arg(r#"echo '{"ID":"1"}'; exec >&-; exec sleep 30"#);
        let started = std::time::Instant::now();
        let read = read_matching(&cmd, &ids(&["1", "2"]), soon(20), id_matcher)
            .await
            .expect("read");
        assert_eq!(read.outcome, StreamOutcome::Exhausted);
        assert_eq!(read.messages.len(), 1);
        assert!(started.elapsed() < Duration::from_secs(5));
    }

    #[tokio::test]
    async fn silent_decoder_times_out() {
        let cmd = DecoderCommand::new("sleep").arg("30");
        let started = std::time::Instant::now();
        let read = read_matching(
            &cmd,
            &ids(&["42"]),
            Instant::now() + Duration::from_millis(200),
            id_matcher,
        )
        .await
        .expect("read");
        assert_eq!(read.outcome, StreamOutcome::TimedOut);
        assert!(read.messages.is_empty());
        assert!(started.elapsed() < Duration::from_secs(10));
    }

    #[tokio::test]
    async fn empty_required_set_never_spawns() {
        let cmd = DecoderCommand::new("/nonexistent/decoder");
        let read = read_matching(&cmd, &HashSet::new(), soon(1), id_matcher)
            .await
            .expect("read");
        assert!(read.is_complete());
        assert!(read.messages.is_empty());
    }

    #[tokio::test]
    async fn spawn_failure_is_an_error() {
        let cmd = DecoderCommand::new("/nonexistent/decoder");
        let err = read_matching(&cmd, &ids(&["1"]), soon(1), id_matcher)
            .await
            .expect_err("spawn should fail");
        assert!(matches!(err, DecoderError::Spawn { .. }));
    }
}
