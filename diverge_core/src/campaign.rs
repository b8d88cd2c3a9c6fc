use crate::archive::{ArchiveError, ArchiveId, FailureArchive, Reproducer};
use crate::compile::{Artifact, CompilationAdapter, CompileConfig, ToolchainId};
use crate::config::{CampaignConfig, ConfigError};
use crate::generator::{ProgramGenerator, SourceUnit};
use crate::oracle::{DifferentialOracle, OracleReport, Verdict};
use crate::process::{ProcessRunner, RunError};
use crate::sampler::{FlagTable, OptLevel, OptLevelTable};
use rand_chacha::ChaCha8Rng;
use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use tempfile::TempDir;
use thiserror::Error;
use tracing::{debug, error, info, warn};

/// Phase of the iteration currently in flight.
///
/// An iteration walks `Generating` through `Recording` in order. A skip
/// verdict returns to `Idle` from whichever phase produced it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CampaignState {
    Idle,
    Generating,
    CompilingReference,
    CompilingTarget,
    Executing,
    Recording,
}

impl CampaignState {
    pub fn successor(self) -> Self {
        match self {
            CampaignState::Idle => CampaignState::Generating,
            CampaignState::Generating => CampaignState::CompilingReference,
            CampaignState::CompilingReference => CampaignState::CompilingTarget,
            CampaignState::CompilingTarget => CampaignState::Executing,
            CampaignState::Executing => CampaignState::Recording,
            CampaignState::Recording => CampaignState::Idle,
        }
    }

    pub fn can_transition_to(self, next: CampaignState) -> bool {
        next == self.successor() || (next == CampaignState::Idle && self != CampaignState::Idle)
    }
}

/// Counters for one campaign, owned by the controller.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CampaignStats {
    iterations: u64,
    verdicts: BTreeMap<Verdict, u64>,
    archived: u64,
    archive_failures: u64,
}

impl CampaignStats {
    pub fn record(&mut self, verdict: Verdict) {
        self.iterations += 1;
        *self.verdicts.entry(verdict).or_default() += 1;
    }

    pub fn count(&self, verdict: Verdict) -> u64 {
        self.verdicts.get(&verdict).copied().unwrap_or(0)
    }

    pub fn iterations(&self) -> u64 {
        self.iterations
    }

    pub fn bugs(&self) -> u64 {
        Verdict::ALL
            .iter()
            .filter(|v| v.is_bug())
            .map(|&v| self.count(v))
            .sum()
    }

    pub fn archived(&self) -> u64 {
        self.archived
    }

    pub fn archive_failures(&self) -> u64 {
        self.archive_failures
    }
}

impl fmt::Display for CampaignStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "iterations={}", self.iterations)?;
        for verdict in Verdict::ALL {
            write!(f, " {}={}", verdict.as_str().to_lowercase(), self.count(verdict))?;
        }
        write!(f, " archived={}", self.archived)?;
        if self.archive_failures > 0 {
            write!(f, " archive_failures={}", self.archive_failures)?;
        }
        Ok(())
    }
}

/// Conditions that stop a campaign; everything else becomes a verdict.
#[derive(Error, Debug)]
pub enum CampaignError {
    #[error("Invalid campaign configuration: {0}")]
    Config(#[from] ConfigError),
    #[error("Required tool '{program}' is not available")]
    ToolingUnavailable { program: String },
    #[error("Failure archive can no longer store reproducers: {0}")]
    ArchiveExhausted(#[source] ArchiveError),
    #[error(transparent)]
    Archive(#[from] ArchiveError),
    #[error(transparent)]
    Run(#[from] RunError),
    #[error("Failed to prepare scratch directory under {path:?}: {source}")]
    Scratch {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IterationReport {
    pub iteration: u64,
    pub verdict: Verdict,
    pub detail: String,
    /// Target configuration, once one was drawn.
    pub config: Option<CompileConfig>,
    pub archive_id: Option<ArchiveId>,
}

pub struct Campaign<P: ProcessRunner> {
    runner: P,
    rng: ChaCha8Rng,
    generator: ProgramGenerator,
    compiler: CompilationAdapter,
    oracle: DifferentialOracle,
    archive: FailureArchive,
    opt_levels: OptLevelTable,
    target_flags: FlagTable,
    stability_level: Option<OptLevel>,
    source_extension: String,
    artifact_extension: String,
    work_dir: PathBuf,
    max_iterations: Option<u64>,
    reference_run_program: Option<String>,
    state: CampaignState,
    stats: CampaignStats,
    iteration: u64,
}

impl<P: ProcessRunner> Campaign<P> {
    pub fn new(
        config: &CampaignConfig,
        runner: P,
        rng: ChaCha8Rng,
    ) -> Result<Self, CampaignError> {
        config.validate()?;
        let reference_run_program = config
            .reference
            .run
            .first()
            .filter(|program| !program.contains('{'))
            .cloned();
        Ok(Self {
            runner,
            rng,
            generator: ProgramGenerator::from_config(config)?,
            compiler: CompilationAdapter::from_config(config),
            oracle: DifferentialOracle::from_config(config)?,
            archive: FailureArchive::from_config(config),
            opt_levels: config.opt_level_table()?,
            target_flags: config.target_flag_table()?,
            stability_level: config
                .reference
                .stability_check
                .then_some(config.reference.stability_opt_level),
            source_extension: config.generator.source_extension.clone(),
            artifact_extension: config.target.artifact_extension.clone(),
            work_dir: config.campaign.work_dir.clone(),
            max_iterations: config.campaign.max_iterations,
            reference_run_program,
            state: CampaignState::Idle,
            stats: CampaignStats::default(),
            iteration: 0,
        })
    }

    pub fn state(&self) -> CampaignState {
        self.state
    }

    pub fn stats(&self) -> &CampaignStats {
        &self.stats
    }

    pub fn archive(&self) -> &FailureArchive {
        &self.archive
    }

    pub fn runner(&self) -> &P {
        &self.runner
    }

    /// External programs the campaign will launch, in pipeline order.
    pub fn required_programs(&self) -> Vec<String> {
        let mut programs: Vec<String> = Vec::new();
        let candidates = [
            self.generator.program(),
            self.compiler.template(ToolchainId::Reference(0)).program(),
            self.reference_run_program.as_deref(),
            self.compiler.template(ToolchainId::Target).program(),
            self.oracle.target_run().program(),
        ];
        for program in candidates.into_iter().flatten() {
            if !programs.iter().any(|p| p == program) {
                programs.push(program.to_string());
            }
        }
        programs
    }

    /// Checks that every tool can be launched and the output directories exist.
    pub fn preflight(&self) -> Result<(), CampaignError> {
        for program in self.required_programs() {
            if !self.runner.is_available(&program) {
                return Err(CampaignError::ToolingUnavailable { program });
            }
            debug!(%program, "Tool available");
        }
        std::fs::create_dir_all(&self.work_dir).map_err(|source| CampaignError::Scratch {
            path: self.work_dir.clone(),
            source,
        })?;
        self.archive.ensure_dir().map_err(|e| {
            if e.is_fatal() {
                CampaignError::ArchiveExhausted(e)
            } else {
                CampaignError::Archive(e)
            }
        })?;
        Ok(())
    }

    /// Runs iterations until `cancel` is observed or the iteration limit is hit.
    ///
    /// Cancellation is only checked between iterations.
    pub fn run(&mut self, cancel: &AtomicBool) -> Result<CampaignStats, CampaignError> {
        loop {
            if cancel.load(Ordering::SeqCst) {
                info!(iterations = self.iteration, "Campaign cancelled");
                break;
            }
            if self.max_iterations.is_some_and(|max| self.iteration >= max) {
                info!(iterations = self.iteration, "Iteration limit reached");
                break;
            }
            self.step()?;
        }
        Ok(self.stats.clone())
    }

    /// One full generate, compile, execute and compare cycle.
    pub fn step(&mut self) -> Result<IterationReport, CampaignError> {
        self.iteration += 1;
        let scratch = self.scratch_dir()?;
        let mut report = IterationReport {
            iteration: self.iteration,
            verdict: Verdict::SkipInvalid,
            detail: String::new(),
            config: None,
            archive_id: None,
        };

        self.enter(CampaignState::Generating);
        let source_path = scratch
            .path()
            .join(format!("fuzz{}", self.source_extension));
        let outcome = match self
            .generator
            .generate(&mut self.runner, &mut self.rng, &source_path)
        {
            Ok(source) => {
                let config =
                    CompileConfig::sample(&self.opt_levels, &self.target_flags, &mut self.rng);
                debug!(
                    iteration = self.iteration,
                    %config,
                    bytes = source.len(),
                    "Drawn target configuration"
                );
                report.config = Some(config.clone());
                let judged = self.judge(scratch.path(), &source.path, &config);
                Some((source, config, judged))
            }
            Err(e) => {
                debug!(error = %e, "Generation failed");
                report.detail = e.to_string();
                None
            }
        };

        let mut fatal = None;
        if let Some((source, config, judged)) = outcome {
            let oracle_report = judged.unwrap_or_else(|e| {
                warn!(error = %e, "Tooling failed mid-iteration, skipping program");
                OracleReport::new(Verdict::SkipInvalid, format!("tooling error: {e}"))
            });
            report.verdict = oracle_report.verdict;
            report.detail = oracle_report.detail;
            if !report.verdict.is_skip() {
                self.enter(CampaignState::Recording);
            }
            if report.verdict.is_bug() {
                match self.archive_finding(&source, &config, &report) {
                    Ok(id) => report.archive_id = id,
                    Err(e) => fatal = Some(e),
                }
            }
        }

        self.stats.record(report.verdict);
        self.enter(CampaignState::Idle);
        if let Err(e) = scratch.close() {
            debug!(error = %e, "Failed to remove scratch directory");
        }
        if let Some(e) = fatal {
            return Err(CampaignError::ArchiveExhausted(e));
        }
        info!(
            iteration = report.iteration,
            verdict = %report.verdict,
            "{}",
            self.stats
        );
        Ok(report)
    }

    /// Re-runs the compile and oracle pipeline on an archived reproducer.
    ///
    /// Statistics are left untouched and nothing is archived.
    pub fn replay(&mut self, reproducer: &Reproducer) -> Result<OracleReport, CampaignError> {
        let scratch = self.scratch_dir()?;
        info!(
            id = %reproducer.metadata.id,
            config = %reproducer.metadata.config,
            "Replaying reproducer"
        );
        self.enter(CampaignState::Generating);
        let judged = self.judge(
            scratch.path(),
            &reproducer.source_path,
            &reproducer.metadata.config,
        );
        self.enter(CampaignState::Idle);
        if let Err(e) = scratch.close() {
            debug!(error = %e, "Failed to remove scratch directory");
        }
        Ok(judged?)
    }

    fn judge(
        &mut self,
        dir: &Path,
        source: &Path,
        config: &CompileConfig,
    ) -> Result<OracleReport, RunError> {
        self.enter(CampaignState::CompilingReference);
        let mut reference_configs = vec![CompileConfig::new(config.opt_level)];
        if let Some(level) = self.stability_level {
            reference_configs.push(CompileConfig::new(level));
        }
        let mut references: Vec<Artifact> = Vec::with_capacity(reference_configs.len());
        for (index, reference_config) in reference_configs.iter().enumerate() {
            let artifact = self.compiler.compile(
                &mut self.runner,
                ToolchainId::Reference(index),
                source,
                reference_config,
                &dir.join(format!("reference{index}")),
            )?;
            let failed = !artifact.succeeded;
            references.push(artifact);
            if failed {
                break;
            }
        }
        if let Some(report) = DifferentialOracle::reference_build_failure(&references) {
            return Ok(report);
        }

        self.enter(CampaignState::CompilingTarget);
        let target = self.compiler.compile(
            &mut self.runner,
            ToolchainId::Target,
            source,
            config,
            &dir.join(format!("target{}", self.artifact_extension)),
        )?;

        self.enter(CampaignState::Executing);
        self.oracle.evaluate(&mut self.runner, &references, &target)
    }

    /// Archives a finding. Only storage exhaustion is returned as an error;
    /// any other archive failure is logged and the reproducer is lost.
    fn archive_finding(
        &mut self,
        source: &SourceUnit,
        config: &CompileConfig,
        report: &IterationReport,
    ) -> Result<Option<ArchiveId>, ArchiveError> {
        match self
            .archive
            .record(source, config, report.verdict, &report.detail)
        {
            Ok(id) => {
                self.stats.archived += 1;
                warn!(
                    verdict = %report.verdict,
                    config = %config,
                    id = %id,
                    detail = %report.detail,
                    "Found a bug"
                );
                Ok(Some(id))
            }
            Err(e) if e.is_fatal() => {
                error!(error = %e, "Archive storage exhausted");
                Err(e)
            }
            Err(e) => {
                self.stats.archive_failures += 1;
                error!(
                    verdict = %report.verdict,
                    config = %config,
                    error = %e,
                    "Failed to archive reproducer, continuing"
                );
                Ok(None)
            }
        }
    }

    fn scratch_dir(&self) -> Result<TempDir, CampaignError> {
        let scratch_err = |source| CampaignError::Scratch {
            path: self.work_dir.clone(),
            source,
        };
        std::fs::create_dir_all(&self.work_dir).map_err(scratch_err)?;
        tempfile::Builder::new()
            .prefix(&format!("diverge-{}-{}-", std::process::id(), self.iteration))
            .tempdir_in(&self.work_dir)
            .map_err(scratch_err)
    }

    fn enter(&mut self, next: CampaignState) {
        debug_assert!(
            self.state.can_transition_to(next),
            "invalid transition {:?} -> {:?}",
            self.state,
            next
        );
        debug!(from = ?self.state, to = ?next, "Campaign state");
        self.state = next;
    }
}
