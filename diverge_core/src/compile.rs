use crate::config::CampaignConfig;
use crate::process::{
    CommandTemplate, OPT_PLACEHOLDER, OUTPUT_PLACEHOLDER, ProcessRequest, ProcessRunner,
    RunError, SOURCE_PLACEHOLDER,
};
use crate::sampler::{FlagTable, OptLevel, OptLevelTable, SelectedFlag, flag_args};
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::debug;

/// Longest compiler diagnostic kept on an [`Artifact`].
const MAX_DIAGNOSTIC_BYTES: usize = 4096;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ToolchainId {
    /// The n-th reference build of an iteration.
    Reference(usize),
    Target,
}

impl ToolchainId {
    pub fn is_reference(self) -> bool {
        matches!(self, ToolchainId::Reference(_))
    }
}

impl fmt::Display for ToolchainId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ToolchainId::Reference(index) => write!(f, "reference#{index}"),
            ToolchainId::Target => f.write_str("target"),
        }
    }
}

/// Optimization level plus the backend flags drawn for one build.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CompileConfig {
    pub opt_level: OptLevel,
    #[serde(default)]
    pub flags: Vec<SelectedFlag>,
}

impl CompileConfig {
    pub fn new(opt_level: OptLevel) -> Self {
        Self {
            opt_level,
            flags: Vec::new(),
        }
    }

    pub fn sample<R: Rng + ?Sized>(
        opt_levels: &OptLevelTable,
        flags: &FlagTable,
        rng: &mut R,
    ) -> Self {
        let opt_level = opt_levels.sample(rng);
        Self {
            opt_level,
            flags: flags.sample(rng),
        }
    }

    pub fn extra_args(&self) -> Vec<String> {
        flag_args(&self.flags)
    }

    pub fn flag_names(&self) -> Vec<&str> {
        self.flags.iter().map(|f| f.name.as_str()).collect()
    }
}

impl fmt::Display for CompileConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.opt_level)?;
        for arg in self.extra_args() {
            write!(f, " {arg}")?;
        }
        Ok(())
    }
}

/// Result of one compile; owned by the iteration that produced it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Artifact {
    pub toolchain: ToolchainId,
    pub path: PathBuf,
    pub config: CompileConfig,
    pub succeeded: bool,
    pub timed_out: bool,
    /// Exit description plus the head of the compiler's stderr.
    pub diagnostics: String,
}

/// Maps reference and target toolchains to their compile command templates.
#[derive(Debug, Clone)]
pub struct CompilationAdapter {
    reference: CommandTemplate,
    target: CommandTemplate,
    timeout: Duration,
}

impl CompilationAdapter {
    pub fn new(reference: CommandTemplate, target: CommandTemplate, timeout: Duration) -> Self {
        Self {
            reference,
            target,
            timeout,
        }
    }

    pub fn from_config(config: &CampaignConfig) -> Self {
        Self::new(
            config.reference_compile_template(),
            config.target_compile_template(),
            config.timeouts.compilation(),
        )
    }

    pub fn template(&self, toolchain: ToolchainId) -> &CommandTemplate {
        match toolchain {
            ToolchainId::Reference(_) => &self.reference,
            ToolchainId::Target => &self.target,
        }
    }

    /// Full argument vector for compiling `source` into `output`.
    ///
    /// `{opt}` and `{flags}` are appended when the template omits them.
    pub fn render(
        &self,
        toolchain: ToolchainId,
        source: &Path,
        config: &CompileConfig,
        output: &Path,
    ) -> Vec<String> {
        let template = self.template(toolchain);
        let mut flags = Vec::new();
        if !template.contains(OPT_PLACEHOLDER) {
            flags.push(config.opt_level.as_flag().to_string());
        }
        flags.extend(config.extra_args());
        let source = source.to_string_lossy();
        let output = output.to_string_lossy();
        template.render(
            &[
                (SOURCE_PLACEHOLDER, source.as_ref()),
                (OUTPUT_PLACEHOLDER, output.as_ref()),
                (OPT_PLACEHOLDER, config.opt_level.as_flag()),
            ],
            &flags,
        )
    }

    /// Compiles `source` with `toolchain`.
    ///
    /// A compiler that runs but fails or times out yields an artifact with
    /// `succeeded = false`; only a compiler that cannot be run is an `Err`.
    pub fn compile<P: ProcessRunner + ?Sized>(
        &self,
        runner: &mut P,
        toolchain: ToolchainId,
        source: &Path,
        config: &CompileConfig,
        output: &Path,
    ) -> Result<Artifact, RunError> {
        let _ = std::fs::remove_file(output);
        let argv = self.render(toolchain, source, config, output);
        let request = ProcessRequest::from_argv(argv, self.timeout);
        debug!(%toolchain, command = %request.command_line(), "Compiling");

        let result = runner.run(&request)?;
        let produced = output.exists();
        let succeeded = result.success() && produced;
        let mut diagnostics = result.describe_exit();
        if result.success() && !produced {
            diagnostics = format!("{diagnostics} but produced no output at {output:?}");
        }
        if !result.stderr.is_empty() {
            let head = &result.stderr[..result.stderr.len().min(MAX_DIAGNOSTIC_BYTES)];
            diagnostics.push_str(": ");
            diagnostics.push_str(String::from_utf8_lossy(head).trim_end());
        }
        debug!(%toolchain, succeeded, "Compile finished");

        Ok(Artifact {
            toolchain,
            path: output.to_path_buf(),
            config: config.clone(),
            succeeded,
            timed_out: result.timed_out,
            diagnostics,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::process::test_utils::{ScriptedRunner, exited, timed_out, write_output_arg};
    use crate::process::ProcessOutput;
    use crate::sampler::{FlagSpec, default_opt_level_weights};
    use rand_chacha::ChaCha8Rng;
    use rand_core::SeedableRng;

    fn adapter() -> CompilationAdapter {
        let t = |args: &[&str]| CommandTemplate::new(args.iter().map(|s| s.to_string()).collect());
        CompilationAdapter::new(
            t(&["clang", "-m32", "{opt}", "{source}", "-o", "{output}"]),
            t(&["emcc", "{source}", "-o", "{output}"]),
            Duration::from_secs(60),
        )
    }

    fn growth_config(level: OptLevel) -> CompileConfig {
        CompileConfig {
            opt_level: level,
            flags: vec![SelectedFlag {
                name: "memory-growth".to_string(),
                args: vec!["-s".to_string(), "ALLOW_MEMORY_GROWTH=1".to_string()],
            }],
        }
    }

    #[test]
    fn render_places_opt_and_appends_missing_flags() {
        let adapter = adapter();
        let config = growth_config(OptLevel::O2);
        assert_eq!(
            adapter.render(
                ToolchainId::Reference(0),
                Path::new("a.c"),
                &CompileConfig::new(OptLevel::O1),
                Path::new("ref0"),
            ),
            ["clang", "-m32", "-O1", "a.c", "-o", "ref0"]
        );
        assert_eq!(
            adapter.render(ToolchainId::Target, Path::new("a.c"), &config, Path::new("t.js")),
            ["emcc", "a.c", "-o", "t.js", "-O2", "-s", "ALLOW_MEMORY_GROWTH=1"]
        );
    }

    #[test]
    fn successful_compile_yields_artifact() {
        let dir = tempfile::tempdir().unwrap();
        let mut runner = ScriptedRunner::new(|request| {
            write_output_arg(request);
            Ok(exited(0, b""))
        });
        let output = dir.path().join("target.js");
        let artifact = adapter()
            .compile(
                &mut runner,
                ToolchainId::Target,
                Path::new("a.c"),
                &growth_config(OptLevel::Os),
                &output,
            )
            .unwrap();
        assert!(artifact.succeeded);
        assert!(!artifact.timed_out);
        assert_eq!(artifact.path, output);
        assert_eq!(artifact.config.opt_level, OptLevel::Os);
        assert_eq!(runner.calls[0].timeout, Duration::from_secs(60));
    }

    #[test]
    fn nonzero_exit_is_a_failed_artifact_not_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let mut runner = ScriptedRunner::new(|_| {
            Ok(ProcessOutput {
                stderr: b"LLVM ERROR: can't convert calls with illegal types\n".to_vec(),
                ..exited(1, b"")
            })
        });
        let artifact = adapter()
            .compile(
                &mut runner,
                ToolchainId::Target,
                Path::new("a.c"),
                &growth_config(OptLevel::O0),
                &dir.path().join("t.js"),
            )
            .unwrap();
        assert!(!artifact.succeeded);
        assert!(artifact.diagnostics.contains("code 1"));
        assert!(artifact.diagnostics.contains("illegal types"));
    }

    #[test]
    fn zero_exit_without_output_file_is_a_failure() {
        let dir = tempfile::tempdir().unwrap();
        let mut runner = ScriptedRunner::new(|_| Ok(exited(0, b"")));
        let artifact = adapter()
            .compile(
                &mut runner,
                ToolchainId::Reference(0),
                Path::new("a.c"),
                &CompileConfig::new(OptLevel::O0),
                &dir.path().join("ref0"),
            )
            .unwrap();
        assert!(!artifact.succeeded);
        assert!(artifact.diagnostics.contains("no output"));
    }

    #[test]
    fn stale_output_is_removed_before_compiling() {
        let dir = tempfile::tempdir().unwrap();
        let output = dir.path().join("ref0");
        std::fs::write(&output, b"stale").unwrap();
        let mut runner = ScriptedRunner::new(|_| Ok(exited(0, b"")));
        let artifact = adapter()
            .compile(
                &mut runner,
                ToolchainId::Reference(0),
                Path::new("a.c"),
                &CompileConfig::new(OptLevel::O0),
                &output,
            )
            .unwrap();
        assert!(!artifact.succeeded);
        assert!(!output.exists());
    }

    #[test]
    fn timeout_marks_artifact() {
        let dir = tempfile::tempdir().unwrap();
        let mut runner = ScriptedRunner::new(|_| Ok(timed_out()));
        let artifact = adapter()
            .compile(
                &mut runner,
                ToolchainId::Reference(1),
                Path::new("a.c"),
                &CompileConfig::new(OptLevel::O3),
                &dir.path().join("ref1"),
            )
            .unwrap();
        assert!(!artifact.succeeded);
        assert!(artifact.timed_out);
    }

    #[test]
    fn missing_compiler_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let mut runner = ScriptedRunner::new(|_| Ok(exited(0, b""))).without("emcc");
        let result = adapter().compile(
            &mut runner,
            ToolchainId::Target,
            Path::new("a.c"),
            &CompileConfig::new(OptLevel::O0),
            &dir.path().join("t.js"),
        );
        assert!(matches!(result, Err(RunError::ToolingUnavailable { .. })));
    }

    #[test]
    fn sampled_configs_respect_exclusions() {
        let table = FlagTable::new(vec![
            FlagSpec::switch("memory-growth", &["-s", "ALLOW_MEMORY_GROWTH=1"], 0.5),
            FlagSpec::switch("main-module", &["-s", "MAIN_MODULE=1"], 0.5)
                .excluding(&["memory-growth"]),
        ])
        .unwrap();
        let levels = OptLevelTable::new(&default_opt_level_weights()).unwrap();
        let mut rng = ChaCha8Rng::seed_from_u64(2024);
        for _ in 0..1000 {
            let config = CompileConfig::sample(&levels, &table, &mut rng);
            let names = config.flag_names();
            assert!(!(names.contains(&"memory-growth") && names.contains(&"main-module")));
        }
    }

    #[test]
    fn display_lists_opt_level_then_flags() {
        assert_eq!(
            growth_config(OptLevel::O2).to_string(),
            "-O2 -s ALLOW_MEMORY_GROWTH=1"
        );
        assert_eq!(ToolchainId::Reference(1).to_string(), "reference#1");
        assert!(ToolchainId::Reference(0).is_reference());
        assert!(!ToolchainId::Target.is_reference());
    }
}
