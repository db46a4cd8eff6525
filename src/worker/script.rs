use std::time::Duration;

use crate::sandbox::CommandOutput;
use crate::worker::handler::{BuildContext, HandlerError, HandlerFuture, HandlerOutput, JobHandler};

/// Shown to students when the grading script itself misbehaves.
pub const INTERNALS_FAILURE_MESSAGE: &str =
    "There was a failure in the internals of the autograder. Notify your TA, and maybe I will get fixed.";

/// Commit passed to the script when the build names none.
const DEFAULT_COMMIT: &str = "HEAD";

/// Grades an assignment by running its configured command in a fresh container.
///
/// The command is invoked as `command... <source> <commit>`. A non-zero exit is
/// a student-facing failure carrying the output. Otherwise the last non-empty
/// line is the score, either `score: <float>` or a bare float, and everything
/// before it is the log.
#[derive(Debug, Clone, Default)]
pub struct ScriptHandler;

impl ScriptHandler {
    pub fn new() -> Self {
        Self
    }

    async fn run(&self, ctx: &BuildContext) -> Result<HandlerOutput, HandlerError> {
        let grader = ctx.assignment.grader.as_ref().ok_or_else(|| {
            HandlerError::Internal(format!(
                "assignment {} has no grader configured",
                ctx.assignment.name
            ))
        })?;
        let timeout = grader
            .timeout_secs
            .map(Duration::from_secs)
            .unwrap_or_else(|| ctx.sandbox.default_timeout());

        let mut argv = grader.command.clone();
        argv.push(ctx.source.clone());
        argv.push(ctx.commit.clone().unwrap_or_else(|| DEFAULT_COMMIT.to_string()));

        let container = ctx.sandbox.start(grader.image.as_deref(), Vec::new()).await?;
        let result = container.run_command(&argv, timeout, &ctx.cancel).await;
        // stop() logs its own failure; the build outcome does not depend on it.
        let _ = container.stop().await;
        let output = result?;

        if !output.success() {
            return Err(HandlerError::failed(output.combined()));
        }
        parse_output(&output).ok_or_else(|| {
            tracing::error!(
                build = %ctx.build_name,
                stdout = %output.stdout,
                "Grading script printed no score"
            );
            HandlerError::critical(INTERNALS_FAILURE_MESSAGE)
        })
    }
}

impl JobHandler for ScriptHandler {
    fn grade<'a>(&'a self, ctx: &'a BuildContext) -> HandlerFuture<'a> {
        Box::pin(self.run(ctx))
    }
}

fn parse_output(output: &CommandOutput) -> Option<HandlerOutput> {
    let stdout = output.stdout.trim_end();
    let (log, last) = match stdout.rfind('\n') {
        Some(pos) => (&stdout[..pos], &stdout[pos + 1..]),
        None => ("", stdout),
    };
    let score = parse_score(last)?;
    let mut log = log.trim_end().to_string();
    if !output.stderr.is_empty() {
        if !log.is_empty() {
            log.push('\n');
        }
        log.push_str(output.stderr.trim_end());
    }
    Some(HandlerOutput { score, log })
}

fn parse_score(line: &str) -> Option<f64> {
    let line = line.trim();
    let raw = match line.split_once(':') {
        Some((key, value)) if key.trim().eq_ignore_ascii_case("score") => value.trim(),
        Some(_) => return None,
        None => line,
    };
    raw.parse::<f64>().ok().filter(|s| s.is_finite())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn stdout(text: &str) -> CommandOutput {
        CommandOutput {
            exit_code: Some(0),
            stdout: text.to_string(),
            stderr: String::new(),
        }
    }

    #[test]
    fn score_line_forms() {
        assert_eq!(parse_score("score: 9.5"), Some(9.5));
        assert_eq!(parse_score("Score:10"), Some(10.0));
        assert_eq!(parse_score("  7 "), Some(7.0));
        assert_eq!(parse_score("total: 7"), None);
        assert_eq!(parse_score("NaN"), None);
        assert_eq!(parse_score("all tests passed"), None);
    }

    #[test]
    fn last_line_is_score_and_rest_is_log() {
        let parsed = parse_output(&stdout("test 1 ok\ntest 2 ok\nscore: 8\n\n")).unwrap();
        assert_eq!(parsed.score, 8.0);
        assert_eq!(parsed.log, "test 1 ok\ntest 2 ok");
    }

    #[test]
    fn bare_score_without_log() {
        let parsed = parse_output(&stdout("4.25")).unwrap();
        assert_eq!(parsed.score, 4.25);
        assert_eq!(parsed.log, "");
    }

    #[test]
    fn missing_score() {
        assert!(parse_output(&stdout("compiled\nran\n")).is_none());
        assert!(parse_output(&stdout("")).is_none());
    }
}
