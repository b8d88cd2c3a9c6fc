use crate::compile::Artifact;
use crate::config::{CampaignConfig, ConfigError};
use crate::process::{
    ARTIFACT_PLACEHOLDER, CommandTemplate, ProcessOutput, ProcessRequest, ProcessRunner, RunError,
};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::Path;
use std::time::Duration;
use tracing::debug;

/// Outcome of one campaign iteration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Verdict {
    /// The program cannot serve as an oracle input (generator or reference-side failure).
    SkipInvalid,
    /// A reference build ran out of time.
    SkipTimeout,
    /// The target failed to compile a program the reference accepted.
    BugCompileFail,
    /// Target output differs from the agreed reference output.
    BugMismatch,
    /// The target crashed or timed out where the reference did not.
    BugCrash,
    Pass,
}

impl Verdict {
    pub const ALL: [Verdict; 6] = [
        Verdict::SkipInvalid,
        Verdict::SkipTimeout,
        Verdict::BugCompileFail,
        Verdict::BugMismatch,
        Verdict::BugCrash,
        Verdict::Pass,
    ];

    pub fn is_bug(self) -> bool {
        matches!(
            self,
            Verdict::BugCompileFail | Verdict::BugMismatch | Verdict::BugCrash
        )
    }

    pub fn is_skip(self) -> bool {
        matches!(self, Verdict::SkipInvalid | Verdict::SkipTimeout)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Verdict::SkipInvalid => "SKIP_INVALID",
            Verdict::SkipTimeout => "SKIP_TIMEOUT",
            Verdict::BugCompileFail => "BUG_COMPILE_FAIL",
            Verdict::BugMismatch => "BUG_MISMATCH",
            Verdict::BugCrash => "BUG_CRASH",
            Verdict::Pass => "PASS",
        }
    }
}

impl fmt::Display for Verdict {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A verdict plus a one-line explanation for logs and reproducers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OracleReport {
    pub verdict: Verdict,
    pub detail: String,
}

impl OracleReport {
    pub fn new(verdict: Verdict, detail: impl Into<String>) -> Self {
        Self {
            verdict,
            detail: detail.into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecutionResult {
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
    /// Timed out, killed by a signal, or exited non-zero.
    pub crashed: bool,
    pub timed_out: bool,
    pub duration: Duration,
    pub exit: String,
}

impl From<ProcessOutput> for ExecutionResult {
    fn from(output: ProcessOutput) -> Self {
        Self {
            crashed: !output.success(),
            timed_out: output.timed_out,
            duration: output.duration,
            exit: output.describe_exit(),
            stdout: output.stdout,
            stderr: output.stderr,
        }
    }
}

/// Strips allow-listed trailing lines that execution engines append.
///
/// Only lines that start with a configured prefix are removed, and at most
/// `max_lines` of them, so a genuine difference is never masked.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct OutputFilter {
    prefixes: Vec<String>,
    max_lines: usize,
}

impl OutputFilter {
    pub fn new(prefixes: Vec<String>, max_lines: usize) -> Self {
        Self {
            prefixes,
            max_lines,
        }
    }

    pub fn strip<'a>(&self, output: &'a [u8]) -> &'a [u8] {
        let mut kept = output;
        for _ in 0..self.max_lines {
            let body = kept.strip_suffix(b"\n").unwrap_or(kept);
            let start = body.iter().rposition(|&b| b == b'\n').map_or(0, |i| i + 1);
            let last_line = &body[start..];
            let is_noise = self
                .prefixes
                .iter()
                .any(|p| !p.is_empty() && last_line.starts_with(p.as_bytes()));
            if !is_noise {
                break;
            }
            kept = &kept[..start];
        }
        kept
    }
}

/// Runs reference and target artifacts and compares what they print.
#[derive(Debug, Clone)]
pub struct DifferentialOracle {
    reference_run: CommandTemplate,
    target_run: CommandTemplate,
    reference_timeout: Duration,
    target_timeout: Duration,
    min_output_bytes: usize,
    crash_markers: Vec<String>,
    filter: OutputFilter,
}

impl DifferentialOracle {
    pub fn new(reference_run: CommandTemplate, target_run: CommandTemplate) -> Self {
        Self {
            reference_run,
            target_run,
            reference_timeout: Duration::from_secs(3),
            target_timeout: Duration::from_secs(15 * 60),
            min_output_bytes: 10,
            crash_markers: vec!["Segmentation fault".to_string()],
            filter: OutputFilter::default(),
        }
    }

    pub fn with_timeouts(mut self, reference: Duration, target: Duration) -> Self {
        self.reference_timeout = reference;
        self.target_timeout = target;
        self
    }

    pub fn with_min_output_bytes(mut self, bytes: usize) -> Self {
        self.min_output_bytes = bytes;
        self
    }

    pub fn with_crash_markers(mut self, markers: Vec<String>) -> Self {
        self.crash_markers = markers;
        self
    }

    pub fn with_filter(mut self, filter: OutputFilter) -> Self {
        self.filter = filter;
        self
    }

    pub fn from_config(config: &CampaignConfig) -> Result<Self, ConfigError> {
        let engine = config.engine_command()?.to_vec();
        Ok(Self::new(
            CommandTemplate::new(config.reference.run.clone()),
            CommandTemplate::new(engine),
        )
        .with_timeouts(
            config.timeouts.reference_execution(),
            config.timeouts.target_execution(),
        )
        .with_min_output_bytes(config.oracle.min_output_bytes)
        .with_crash_markers(config.oracle.crash_markers.clone())
        .with_filter(OutputFilter::new(
            config.oracle.noise_prefixes.clone(),
            config.oracle.max_noise_lines,
        )))
    }

    pub fn reference_run(&self) -> &CommandTemplate {
        &self.reference_run
    }

    pub fn target_run(&self) -> &CommandTemplate {
        &self.target_run
    }

    pub fn execute<P: ProcessRunner + ?Sized>(
        &self,
        runner: &mut P,
        template: &CommandTemplate,
        artifact: &Path,
        timeout: Duration,
    ) -> Result<ExecutionResult, RunError> {
        let artifact = artifact.to_string_lossy();
        let argv = template.render(&[(ARTIFACT_PLACEHOLDER, artifact.as_ref())], &[]);
        let request = ProcessRequest::from_argv(argv, timeout);
        debug!(command = %request.command_line(), "Executing");
        Ok(runner.run(&request)?.into())
    }

    /// Decides the verdict for one program.
    ///
    /// References are validated first: any reference-side doubt (failed or
    /// slow build, crash, suspiciously short output, disagreement between
    /// builds) resolves to a skip and the target is never blamed.
    pub fn evaluate<P: ProcessRunner + ?Sized>(
        &self,
        runner: &mut P,
        references: &[Artifact],
        target: &Artifact,
    ) -> Result<OracleReport, RunError> {
        if references.is_empty() {
            return Ok(OracleReport::new(
                Verdict::SkipInvalid,
                "no reference build to compare against",
            ));
        }
        if let Some(report) = Self::reference_build_failure(references) {
            return Ok(report);
        }

        let mut agreed: Option<(Vec<u8>, &Artifact)> = None;
        for reference in references {
            let run = self.execute(
                runner,
                &self.reference_run,
                &reference.path,
                self.reference_timeout,
            )?;
            if let Some(reason) = self.reference_rejection(&run) {
                return Ok(OracleReport::new(
                    Verdict::SkipInvalid,
                    format!(
                        "{} ({}) {reason}",
                        reference.toolchain, reference.config.opt_level
                    ),
                ));
            }
            let stdout = self.filter.strip(&run.stdout).to_vec();
            if let Some((expected, first)) = &agreed {
                if *expected != stdout {
                    return Ok(OracleReport::new(
                        Verdict::SkipInvalid,
                        format!(
                            "reference builds disagree: {} ({}) vs {} ({})",
                            first.toolchain,
                            first.config.opt_level,
                            reference.toolchain,
                            reference.config.opt_level
                        ),
                    ));
                }
                continue;
            }
            agreed = Some((stdout, reference));
        }
        let Some((expected, _)) = agreed else {
            return Ok(OracleReport::new(Verdict::SkipInvalid, "no reference output"));
        };

        if !target.succeeded {
            return Ok(OracleReport::new(
                Verdict::BugCompileFail,
                format!("target build failed: {}", target.diagnostics),
            ));
        }

        let run = self.execute(runner, &self.target_run, &target.path, self.target_timeout)?;
        if run.crashed {
            return Ok(OracleReport::new(
                Verdict::BugCrash,
                format!("target execution failed: {}", run.exit),
            ));
        }
        let actual = self.filter.strip(&run.stdout);
        if actual != expected.as_slice() {
            return Ok(OracleReport::new(
                Verdict::BugMismatch,
                describe_mismatch(&expected, actual),
            ));
        }
        Ok(OracleReport::new(Verdict::Pass, "outputs match"))
    }

    /// The skip verdict owed to a failed reference build, if any.
    pub fn reference_build_failure(references: &[Artifact]) -> Option<OracleReport> {
        let failed = references.iter().find(|r| !r.succeeded)?;
        let verdict = if failed.timed_out {
            Verdict::SkipTimeout
        } else {
            Verdict::SkipInvalid
        };
        Some(OracleReport::new(
            verdict,
            format!("{} build failed: {}", failed.toolchain, failed.diagnostics),
        ))
    }

    fn reference_rejection(&self, run: &ExecutionResult) -> Option<String> {
        if run.timed_out {
            return Some(format!("timed out after {:.2?}", run.duration));
        }
        if run.crashed {
            return Some(format!("crashed: {}", run.exit));
        }
        let marker = self.crash_markers.iter().find(|m| {
            let m = m.as_bytes();
            !m.is_empty() && (contains(&run.stdout, m) || contains(&run.stderr, m))
        });
        if let Some(marker) = marker {
            return Some(format!("printed crash marker '{marker}'"));
        }
        if run.stdout.len() < self.min_output_bytes {
            return Some(format!(
                "printed only {} bytes (minimum {})",
                run.stdout.len(),
                self.min_output_bytes
            ));
        }
        None
    }
}

fn contains(haystack: &[u8], needle: &[u8]) -> bool {
    haystack.windows(needle.len()).any(|w| w == needle)
}

fn describe_mismatch(expected: &[u8], actual: &[u8]) -> String {
    let first_difference = expected
        .iter()
        .zip(actual)
        .position(|(a, b)| a != b)
        .unwrap_or(expected.len().min(actual.len()));
    format!(
        "output mismatch: expected {} bytes, got {} bytes, first difference at byte {}",
        expected.len(),
        actual.len(),
        first_difference
    )
}
