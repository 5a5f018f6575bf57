//! Validator adapter: runs an external syntax checker against policy text.
//!
//! [`CliValidator`] writes the candidate to a scoped temp file, invokes the
//! configured program with the file path as its last argument, and maps the
//! exit status to a [`Validation`]. A failed check is data, not an error;
//! only a validator that cannot run at all yields
//! [`Error::ValidatorUnavailable`].

use std::future::Future;
use std::io::Write;
use std::path::PathBuf;
use std::pin::Pin;
use std::process::Stdio;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::{Error, Result};

/// Default validator program.
pub const DEFAULT_PROGRAM: &str = "oso-cloud";

/// Default validator timeout.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);

/// Boxed future returned by [`Validator::validate`].
pub type ValidatorFuture<'a> = Pin<Box<dyn Future<Output = Result<Validation>> + Send + 'a>>;

/// Outcome of validating one candidate policy.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum Validation {
    Pass,
    Fail { message: String },
}

impl Validation {
    pub fn is_pass(&self) -> bool {
        matches!(self, Validation::Pass)
    }

    /// The validator's error text, if the check failed.
    pub fn message(&self) -> Option<&str> {
        match self {
            Validation::Pass => None,
            Validation::Fail { message } => Some(message),
        }
    }
}

/// Something that can check policy text.
pub trait Validator: Send + Sync {
    fn validate<'a>(&'a self, policy: &'a str) -> ValidatorFuture<'a>;
}

// ── CliValidator ───────────────────────────────────────────────────

/// Validator backed by an external command (`oso-cloud validate <path>` by
/// default).
#[derive(Debug, Clone)]
pub struct CliValidator {
    program: String,
    args: Vec<String>,
    timeout: Duration,
    temp_dir: Option<PathBuf>,
}

impl Default for CliValidator {
    fn default() -> Self {
        Self::new(DEFAULT_PROGRAM).with_args(["validate"])
    }
}

impl CliValidator {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            timeout: DEFAULT_TIMEOUT,
            temp_dir: None,
        }
    }

    /// Arguments placed before the policy file path.
    pub fn with_args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args = args.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Directory for the temporary policy file (system temp dir otherwise).
    pub fn with_temp_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.temp_dir = Some(dir.into());
        self
    }

    pub fn program(&self) -> &str {
        &self.program
    }

    fn unavailable(&self, reason: impl Into<String>) -> Error {
        Error::ValidatorUnavailable {
            program: self.program.clone(),
            reason: reason.into(),
        }
    }

    async fn run(&self, policy: &str) -> Result<Validation> {
        let mut builder = tempfile::Builder::new();
        builder.prefix("policy-").suffix(".polar");
        let mut file = match &self.temp_dir {
            Some(dir) => builder.tempfile_in(dir),
            None => builder.tempfile(),
        }
        .map_err(|e| self.unavailable(format!("failed to create temp file: {e}")))?;
        file.write_all(policy.as_bytes())
            .and_then(|()| file.flush())
            .map_err(|e| self.unavailable(format!("failed to write temp file: {e}")))?;

        let start = Instant::now();
        let output = tokio::process::Command::new(&self.program)
            .args(&self.args)
            .arg(file.path())
            .stdin(Stdio::null())
            .kill_on_drop(true)
            .output();

        // `file` outlives the child; dropping it removes the temp file.
        let output = match tokio::time::timeout(self.timeout, output).await {
            Ok(Ok(output)) => output,
            Ok(Err(e)) => return Err(self.unavailable(e.to_string())),
            Err(_) => {
                return Err(self.unavailable(format!(
                    "timed out after {:.1}s",
                    self.timeout.as_secs_f64()
                )));
            }
        };

        debug!(
            "Validator {} exited with {} in {:.2}s",
            self.program,
            output.status,
            start.elapsed().as_secs_f64()
        );

        if output.status.success() {
            return Ok(Validation::Pass);
        }

        let stdout = String::from_utf8_lossy(&output.stdout);
        let stderr = String::from_utf8_lossy(&output.stderr);
        let mut message = combine_output(stdout.trim(), stderr.trim());
        if message.is_empty() {
            message = format!("validator exited with {}", output.status);
        }
        Ok(Validation::Fail { message })
    }
}

impl Validator for CliValidator {
    fn validate<'a>(&'a self, policy: &'a str) -> ValidatorFuture<'a> {
        Box::pin(self.run(policy))
    }
}

fn combine_output(stdout: &str, stderr: &str) -> String {
    match (stdout.is_empty(), stderr.is_empty()) {
        (false, false) => format!("{stdout}\n{stderr}"),
        (false, true) => stdout.to_string(),
        (true, false) => stderr.to_string(),
        (true, true) => String::new(),
    }
}
