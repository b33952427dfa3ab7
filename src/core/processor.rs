use crate::io::raster_io::{commit, partial_path};
use crate::types::{SarError, SarResult};
use serde::{Deserialize, Serialize};
use std::io::{Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use std::time::{Duration, Instant};

/// An external step with a file-in/file-out contract
///
/// On success `output` exists and is complete; on failure it does not exist.
pub trait Processor: Send + Sync {
    fn name(&self) -> &str;

    fn run(&self, input: &Path, output: &Path, timeout: Duration) -> SarResult<()>;

    /// Re-running on the same input produces the same output
    fn idempotent(&self) -> bool {
        true
    }
}

/// Command-line tool invoked once per input
///
/// `{input}` and `{output}` in the arguments are replaced by the paths. The
/// tool writes to a partial path that is renamed into place on success.
#[derive(Debug, Clone)]
pub struct ExternalProcessor {
    name: String,
    program: PathBuf,
    args: Vec<String>,
    idempotent: bool,
    poll_interval: Duration,
}

impl ExternalProcessor {
    pub fn new<P: Into<PathBuf>>(program: P, args: Vec<String>) -> Self {
        let program = program.into();
        let name = program
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| program.to_string_lossy().into_owned());
        Self {
            name,
            program,
            args,
            idempotent: true,
            poll_interval: Duration::from_millis(100),
        }
    }

    pub fn with_idempotent(mut self, idempotent: bool) -> Self {
        self.idempotent = idempotent;
        self
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    fn expand_args(&self, input: &Path, output: &Path) -> Vec<String> {
        let input = input.to_string_lossy();
        let output = output.to_string_lossy();
        self.args
            .iter()
            .map(|a| a.replace("{input}", &input).replace("{output}", &output))
            .collect()
    }

    fn tool_error(&self, message: impl Into<String>) -> SarError {
        SarError::ExternalTool {
            tool: self.name.clone(),
            message: message.into(),
        }
    }
}

fn read_tail(mut file: std::fs::File, limit: usize) -> String {
    let mut text = String::new();
    if file.seek(SeekFrom::Start(0)).is_err() || file.read_to_string(&mut text).is_err() {
        return String::new();
    }
    let text = text.trim();
    let start = text
        .char_indices()
        .rev()
        .nth(limit.saturating_sub(1))
        .map(|(i, _)| i)
        .unwrap_or(0);
    text[start..].to_string()
}

impl Processor for ExternalProcessor {
    fn name(&self) -> &str {
        &self.name
    }

    fn idempotent(&self) -> bool {
        self.idempotent
    }

    fn run(&self, input: &Path, output: &Path, timeout: Duration) -> SarResult<()> {
        if let Some(parent) = output.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let partial = partial_path(output);
        let _ = std::fs::remove_file(&partial);

        // stderr goes to a scratch file so a chatty tool cannot block on a full pipe
        let stderr = tempfile::tempfile()?;
        let mut command = Command::new(&self.program);
        command
            .args(self.expand_args(input, &partial))
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::from(stderr.try_clone()?));
        log::debug!("Running {:?}", command);

        let mut child = command
            .spawn()
            .map_err(|e| self.tool_error(format!("cannot start {}: {}", self.program.display(), e)))?;

        let started = Instant::now();
        let status = loop {
            if let Some(status) = child.try_wait()? {
                break status;
            }
            if started.elapsed() >= timeout {
                let _ = child.kill();
                let _ = child.wait();
                let _ = std::fs::remove_file(&partial);
                log::warn!("⏱️ {} timed out on {}", self.name, input.display());
                return Err(SarError::Timeout {
                    tool: self.name.clone(),
                    seconds: timeout.as_secs_f64(),
                });
            }
            std::thread::sleep(self.poll_interval.min(timeout.saturating_sub(started.elapsed())));
        };

        if !status.success() {
            let _ = std::fs::remove_file(&partial);
            return Err(self.tool_error(format!("{} ({})", status, read_tail(stderr, 500))));
        }
        if !partial.exists() {
            return Err(self.tool_error(format!("exited successfully but wrote no {}", output.display())));
        }

        commit(&partial, output)?;
        log::debug!("{} finished in {:.1}s", self.name, started.elapsed().as_secs_f64());
        Ok(())
    }
}

/// Retry schedule for failed external steps
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Total attempts including the first
    pub max_attempts: u32,
    pub initial_backoff_secs: f64,
    pub multiplier: f64,
    pub max_backoff_secs: f64,
    /// Per-attempt time limit
    pub timeout_secs: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_backoff_secs: 2.0,
            multiplier: 2.0,
            max_backoff_secs: 60.0,
            timeout_secs: 3600.0,
        }
    }
}

/// Seconds as a duration; NaN and negatives are zero, overflow saturates
fn saturating_secs(secs: f64) -> Duration {
    if secs.is_nan() || secs <= 0.0 {
        return Duration::ZERO;
    }
    Duration::try_from_secs_f64(secs).unwrap_or(Duration::MAX)
}

impl RetryPolicy {
    /// Single attempt, no waiting
    pub fn none() -> Self {
        Self {
            max_attempts: 1,
            ..Default::default()
        }
    }

    pub fn timeout(&self) -> Duration {
        saturating_secs(self.timeout_secs)
    }

    /// Wait before attempt `attempt + 1`, where `attempt` starts at 1
    pub fn backoff(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1) as i32;
        let secs = self.initial_backoff_secs * self.multiplier.powi(exponent);
        saturating_secs(secs.min(self.max_backoff_secs))
    }

    pub fn validate(&self) -> SarResult<()> {
        if self.max_attempts == 0 {
            return Err(SarError::Config("retry max_attempts must be at least 1".to_string()));
        }
        if !(self.multiplier.is_finite() && self.multiplier >= 0.0) {
            return Err(SarError::Config(format!(
                "retry multiplier must be finite and non-negative, got {}",
                self.multiplier
            )));
        }
        let durations = [
            ("initial_backoff_secs", self.initial_backoff_secs),
            ("max_backoff_secs", self.max_backoff_secs),
            ("timeout_secs", self.timeout_secs),
        ];
        for (name, secs) in durations {
            Duration::try_from_secs_f64(secs)
                .map_err(|e| SarError::Config(format!("retry {} = {}: {}", name, secs, e)))?;
        }
        if self.timeout_secs == 0.0 {
            return Err(SarError::Config("retry timeout_secs must be positive".to_string()));
        }
        Ok(())
    }

    /// Run `processor`, retrying tool failures and timeouts when it is idempotent
    ///
    /// Returns the number of attempts used.
    pub fn run(&self, processor: &dyn Processor, input: &Path, output: &Path) -> SarResult<u32> {
        let attempts = if processor.idempotent() { self.max_attempts.max(1) } else { 1 };
        let mut attempt = 1;
        loop {
            match processor.run(input, output, self.timeout()) {
                Ok(()) => return Ok(attempt),
                Err(e) => {
                    let retryable = matches!(e, SarError::ExternalTool { .. } | SarError::Timeout { .. });
                    if !retryable || attempt >= attempts {
                        return Err(e);
                    }
                    let wait = self.backoff(attempt);
                    log::warn!(
                        "{} attempt {}/{} failed ({}), retrying in {:.1}s",
                        processor.name(),
                        attempt,
                        attempts,
                        e,
                        wait.as_secs_f64()
                    );
                    std::thread::sleep(wait);
                    attempt += 1;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use tempfile::TempDir;

    /// Fails a fixed number of times, then copies input to output
    struct FlakyProcessor {
        failures: u32,
        calls: AtomicU32,
        idempotent: bool,
    }

    impl Processor for FlakyProcessor {
        fn name(&self) -> &str {
            "flaky"
        }

        fn idempotent(&self) -> bool {
            self.idempotent
        }

        fn run(&self, input: &Path, output: &Path, _timeout: Duration) -> SarResult<()> {
            let call = self.calls.fetch_add(1, Ordering::SeqCst);
            if call < self.failures {
                return Err(SarError::ExternalTool {
                    tool: "flaky".to_string(),
                    message: format!("failure {}", call + 1),
                });
            }
            std::fs::copy(input, output)?;
            Ok(())
        }
    }

    fn quick_retry(max_attempts: u32) -> RetryPolicy {
        RetryPolicy {
            max_attempts,
            initial_backoff_secs: 0.0,
            ..Default::default()
        }
    }

    fn scratch() -> (TempDir, PathBuf, PathBuf) {
        let dir = TempDir::new().unwrap();
        let input = dir.path().join("in.tif");
        std::fs::write(&input, b"scene").unwrap();
        let output = dir.path().join("out").join("in_VH.tif");
        (dir, input, output)
    }

    #[test]
    fn test_backoff_grows_and_caps() {
        let policy = RetryPolicy {
            initial_backoff_secs: 1.0,
            multiplier: 3.0,
            max_backoff_secs: 5.0,
            ..Default::default()
        };
        assert_eq!(policy.backoff(1), Duration::from_secs(1));
        assert_eq!(policy.backoff(2), Duration::from_secs(3));
        assert_eq!(policy.backoff(3), Duration::from_secs(5));
        assert!(RetryPolicy { max_attempts: 0, ..Default::default() }.validate().is_err());
        assert!(RetryPolicy::default().validate().is_ok());
    }

    #[test]
    fn test_out_of_range_durations_are_config_errors() {
        for timeout_secs in [1e30, f64::INFINITY, f64::NAN, -1.0, 0.0] {
            let policy = RetryPolicy { timeout_secs, ..Default::default() };
            assert!(matches!(policy.validate(), Err(SarError::Config(_))), "timeout {}", timeout_secs);
        }
        let huge_backoff = RetryPolicy { max_backoff_secs: 1e300, ..Default::default() };
        assert!(matches!(huge_backoff.validate(), Err(SarError::Config(_))));

        // Accessors saturate instead of panicking on unvalidated values
        let unchecked = RetryPolicy {
            initial_backoff_secs: 1e300,
            multiplier: 1e10,
            max_backoff_secs: f64::INFINITY,
            timeout_secs: 1e30,
            ..Default::default()
        };
        assert_eq!(unchecked.timeout(), Duration::MAX);
        assert_eq!(unchecked.backoff(4), Duration::MAX);
        assert_eq!(RetryPolicy { timeout_secs: f64::NAN, ..Default::default() }.timeout(), Duration::ZERO);
    }

    #[test]
    fn test_retries_idempotent_failures() {
        let (_dir, input, output) = scratch();
        std::fs::create_dir_all(output.parent().unwrap()).unwrap();
        let flaky = FlakyProcessor { failures: 2, calls: AtomicU32::new(0), idempotent: true };
        assert_eq!(quick_retry(3).run(&flaky, &input, &output).unwrap(), 3);
        assert!(output.exists());

        let flaky = FlakyProcessor { failures: 3, calls: AtomicU32::new(0), idempotent: true };
        assert!(quick_retry(3).run(&flaky, &input, &output).is_err());
        assert_eq!(flaky.calls.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn test_non_idempotent_runs_once() {
        let (_dir, input, output) = scratch();
        let flaky = FlakyProcessor { failures: 1, calls: AtomicU32::new(0), idempotent: false };
        let err = quick_retry(5).run(&flaky, &input, &output).unwrap_err();
        assert!(matches!(err, SarError::ExternalTool { .. }));
        assert_eq!(flaky.calls.load(Ordering::SeqCst), 1);
    }

    #[cfg(unix)]
    #[test]
    fn test_external_command_success_and_failure() {
        let (_dir, input, output) = scratch();
        let copy = ExternalProcessor::new("sh", vec!["-c".into(), "cp \"$0\" \"$1\"".into(), "{input}".into(), "{output}".into()]);
        copy.run(&input, &output, Duration::from_secs(10)).unwrap();
        assert_eq!(std::fs::read(&output).unwrap(), b"scene");
        assert!(!partial_path(&output).exists());

        let failing = ExternalProcessor::new("sh", vec!["-c".into(), "echo bad orbit >&2; exit 3".into()]);
        let other = output.with_file_name("other_VH.tif");
        match failing.run(&input, &other, Duration::from_secs(10)).unwrap_err() {
            SarError::ExternalTool { tool, message } => {
                assert_eq!(tool, "sh");
                assert!(message.contains("bad orbit"));
            }
            e => panic!("unexpected error {:?}", e),
        }
        assert!(!other.exists());
    }

    #[cfg(unix)]
    #[test]
    fn test_external_command_timeout() {
        let (_dir, input, output) = scratch();
        let slow = ExternalProcessor::new("sleep", vec!["5".into()])
            .with_poll_interval(Duration::from_millis(10));
        let started = Instant::now();
        let err = slow.run(&input, &output, Duration::from_millis(200)).unwrap_err();
        assert!(matches!(err, SarError::Timeout { .. }));
        assert!(started.elapsed() < Duration::from_secs(4));
        assert!(!output.exists());
    }
}
