use crate::process::{
    ARTIFACT_PLACEHOLDER, CommandTemplate, OUTPUT_PLACEHOLDER, SOURCE_PLACEHOLDER,
};
use crate::sampler::{
    FlagSpec, FlagTable, FlagValue, OptLevel, OptLevelTable, OptLevelWeight,
    default_opt_level_weights,
};
use serde::Deserialize;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

#[derive(Error, Debug, PartialEq)]
pub enum ConfigError {
    #[error("[{section}] command must not be empty")]
    EmptyCommand { section: &'static str },
    #[error("[{section}] command is missing the {placeholder} placeholder")]
    MissingPlaceholder {
        section: &'static str,
        placeholder: &'static str,
    },
    #[error("Unknown target engine '{0}'")]
    UnknownEngine(String),
    #[error("Duplicate flag '{0}' in flag table")]
    DuplicateFlag(String),
    #[error("Flag '{flag}' has probability {probability} outside [0, 1]")]
    InvalidProbability { flag: String, probability: f64 },
    #[error("Flag '{flag}' excludes unknown flag '{excluded}'")]
    UnknownExclusion { flag: String, excluded: String },
    #[error("Flag '{0}' has an invalid value (empty range, empty choices, or no {{value}} argument)")]
    InvalidValue(String),
    #[error("Optimization level weights need at least one non-zero weight")]
    InvalidWeights,
}

#[derive(Deserialize, Debug, Clone, PartialEq, Eq, Default)]
#[serde(rename_all = "kebab-case")]
pub enum GeneratorOutput {
    /// Generator prints the program; stdout is stored as the source file.
    #[default]
    Stdout,
    /// Generator writes the program to `{output}` itself.
    File,
}

#[derive(Deserialize, Debug, Clone, PartialEq)]
#[serde(rename_all = "kebab-case")]
#[serde(deny_unknown_fields)]
pub struct CampaignSettings {
    /// Seed for every random draw; absent means draw one and log it.
    #[serde(default)]
    pub seed: Option<u64>,
    /// Absent means run until cancelled.
    #[serde(default)]
    pub max_iterations: Option<u64>,
    #[serde(default = "default_work_dir")]
    pub work_dir: PathBuf,
    #[serde(default = "default_archive_dir")]
    pub archive_dir: PathBuf,
}

pub fn default_work_dir() -> PathBuf {
    std::env::temp_dir().join("diverge")
}

pub fn default_archive_dir() -> PathBuf {
    PathBuf::from("./diverge_failures")
}

impl Default for CampaignSettings {
    fn default() -> Self {
        Self {
            seed: None,
            max_iterations: None,
            work_dir: default_work_dir(),
            archive_dir: default_archive_dir(),
        }
    }
}

#[derive(Deserialize, Debug, Clone, PartialEq)]
#[serde(rename_all = "kebab-case")]
#[serde(deny_unknown_fields)]
pub struct GeneratorSettings {
    pub command: Vec<String>,
    #[serde(default)]
    pub output: GeneratorOutput,
    #[serde(default = "default_source_extension")]
    pub source_extension: String,
    #[serde(default)]
    pub flags: Vec<FlagSpec>,
}

fn default_source_extension() -> String {
    ".c".to_string()
}

#[derive(Deserialize, Debug, Clone, PartialEq)]
#[serde(rename_all = "kebab-case")]
#[serde(deny_unknown_fields)]
pub struct ReferenceSettings {
    pub command: Vec<String>,
    #[serde(default = "default_reference_run")]
    pub run: Vec<String>,
    #[serde(default = "default_stability_check")]
    pub stability_check: bool,
    #[serde(default = "default_stability_opt_level")]
    pub stability_opt_level: OptLevel,
}

fn default_reference_run() -> Vec<String> {
    vec![ARTIFACT_PLACEHOLDER.to_string()]
}

fn default_stability_check() -> bool {
    true
}

fn default_stability_opt_level() -> OptLevel {
    OptLevel::O0
}

#[derive(Deserialize, Debug, Clone, PartialEq)]
#[serde(rename_all = "kebab-case")]
#[serde(deny_unknown_fields)]
pub struct TargetSettings {
    pub command: Vec<String>,
    pub engine: String,
    #[serde(default = "default_artifact_extension")]
    pub artifact_extension: String,
    #[serde(default)]
    pub flags: Vec<FlagSpec>,
}

fn default_artifact_extension() -> String {
    ".js".to_string()
}

#[derive(Deserialize, Debug, Clone, PartialEq)]
#[serde(rename_all = "kebab-case")]
#[serde(deny_unknown_fields)]
pub struct OracleSettings {
    #[serde(default = "default_min_output_bytes")]
    pub min_output_bytes: usize,
    #[serde(default = "default_crash_markers")]
    pub crash_markers: Vec<String>,
    /// Trailing output lines starting with one of these are engine noise.
    #[serde(default)]
    pub noise_prefixes: Vec<String>,
    #[serde(default = "default_max_noise_lines")]
    pub max_noise_lines: usize,
}

fn default_min_output_bytes() -> usize {
    10
}

fn default_crash_markers() -> Vec<String> {
    vec!["Segmentation fault".to_string()]
}

fn default_max_noise_lines() -> usize {
    1
}

impl Default for OracleSettings {
    fn default() -> Self {
        Self {
            min_output_bytes: default_min_output_bytes(),
            crash_markers: default_crash_markers(),
            noise_prefixes: Vec::new(),
            max_noise_lines: default_max_noise_lines(),
        }
    }
}

#[derive(Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
#[serde(deny_unknown_fields)]
pub struct TimeoutSettings {
    #[serde(default = "default_generation_ms")]
    pub generation_ms: u64,
    #[serde(default = "default_compilation_ms")]
    pub compilation_ms: u64,
    #[serde(default = "default_reference_execution_ms")]
    pub reference_execution_ms: u64,
    #[serde(default = "default_target_execution_ms")]
    pub target_execution_ms: u64,
}

fn default_generation_ms() -> u64 {
    5_000
}
fn default_compilation_ms() -> u64 {
    120_000
}
fn default_reference_execution_ms() -> u64 {
    3_000
}
fn default_target_execution_ms() -> u64 {
    15 * 60 * 1_000
}

impl TimeoutSettings {
    pub fn generation(&self) -> Duration {
        Duration::from_millis(self.generation_ms)
    }
    pub fn compilation(&self) -> Duration {
        Duration::from_millis(self.compilation_ms)
    }
    pub fn reference_execution(&self) -> Duration {
        Duration::from_millis(self.reference_execution_ms)
    }
    pub fn target_execution(&self) -> Duration {
        Duration::from_millis(self.target_execution_ms)
    }
}

impl Default for TimeoutSettings {
    fn default() -> Self {
        Self {
            generation_ms: default_generation_ms(),
            compilation_ms: default_compilation_ms(),
            reference_execution_ms: default_reference_execution_ms(),
            target_execution_ms: default_target_execution_ms(),
        }
    }
}

#[derive(Deserialize, Debug, Clone, PartialEq)]
#[serde(rename_all = "kebab-case")]
#[serde(deny_unknown_fields)]
pub struct CampaignConfig {
    #[serde(default)]
    pub campaign: CampaignSettings,
    pub generator: GeneratorSettings,
    pub reference: ReferenceSettings,
    pub target: TargetSettings,
    /// Engine identifier to run template; `target.engine` picks one.
    #[serde(default = "default_engines")]
    pub engines: BTreeMap<String, Vec<String>>,
    #[serde(default = "default_opt_level_weights")]
    pub opt_levels: Vec<OptLevelWeight>,
    #[serde(default)]
    pub oracle: OracleSettings,
    #[serde(default)]
    pub timeouts: TimeoutSettings,
}

fn default_engines() -> BTreeMap<String, Vec<String>> {
    let mut engines = BTreeMap::new();
    engines.insert(
        "node".to_string(),
        vec!["node".to_string(), ARTIFACT_PLACEHOLDER.to_string()],
    );
    engines
}

fn strings(items: &[&str]) -> Vec<String> {
    items.iter().map(|s| s.to_string()).collect()
}

pub fn default_generator_flags() -> Vec<FlagSpec> {
    vec![
        FlagSpec::switch("no-math64", &["--no-math64"], 0.5),
        FlagSpec::switch("max-funcs", &["--max-funcs", "{value}"], 0.5)
            .with_value(FlagValue::Int { min: 10, max: 30 }),
    ]
}

pub fn default_target_flags() -> Vec<FlagSpec> {
    let extra_passes = strings(&[
        "code-pushing",
        "duplicate-function-elimination",
        "dce",
        "remove-unused-brs",
        "remove-unused-names",
        "local-cse",
        "optimize-instructions",
        "post-emscripten",
        "precompute",
        "simplify-locals",
        "simplify-locals-nostructure",
        "vacuum",
        "coalesce-locals",
        "reorder-locals",
        "merge-blocks",
        "remove-unused-module-elements",
        "memory-packing",
    ]);
    vec![
        FlagSpec::switch("debug-info", &["-g"], 0.5),
        FlagSpec::switch(
            "extra-passes",
            &["-s", "BINARYEN_EXTRA_PASSES={value}"],
            0.5,
        )
        .with_value(FlagValue::Sequence {
            choices: extra_passes,
            stop_probability: 0.1,
            separator: ",".to_string(),
        }),
        FlagSpec::switch("memory-growth", &["-s", "ALLOW_MEMORY_GROWTH=1"], 0.5),
        FlagSpec::switch("main-module", &["-s", "MAIN_MODULE=1"], 0.5)
            .excluding(&["memory-growth"]),
        FlagSpec::switch("inlining-limit", &["-s", "INLINING_LIMIT=1"], 0.25),
        FlagSpec::switch("assertions", &["-s", "ASSERTIONS=1"], 0.5),
    ]
}

impl CampaignConfig {
    pub fn load_from_file(path: &Path) -> Result<Self, anyhow::Error> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| anyhow::anyhow!("Failed to read config file at {:?}: {}", path, e))?;
        let config = Self::from_toml(&content).map_err(|e| {
            anyhow::anyhow!("Failed to parse TOML from config file {:?}: {}", path, e)
        })?;
        config
            .validate()
            .map_err(|e| anyhow::anyhow!("Invalid config file {:?}: {}", path, e))?;
        Ok(config)
    }

    pub fn from_toml(content: &str) -> Result<Self, toml::de::Error> {
        toml::from_str(content)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        check_command("generator", &self.generator.command, &[])?;
        if self.generator.output == GeneratorOutput::File {
            check_command("generator", &self.generator.command, &[OUTPUT_PLACEHOLDER])?;
        }
        let compile_placeholders = [SOURCE_PLACEHOLDER, OUTPUT_PLACEHOLDER];
        check_command("reference", &self.reference.command, &compile_placeholders)?;
        check_command("reference", &self.reference.run, &[ARTIFACT_PLACEHOLDER])?;
        check_command("target", &self.target.command, &compile_placeholders)?;
        check_command("engines", self.engine_command()?, &[ARTIFACT_PLACEHOLDER])?;
        self.generator_flag_table()?;
        self.target_flag_table()?;
        self.opt_level_table()?;
        Ok(())
    }

    pub fn engine_command(&self) -> Result<&[String], ConfigError> {
        self.engines
            .get(&self.target.engine)
            .map(Vec::as_slice)
            .ok_or_else(|| ConfigError::UnknownEngine(self.target.engine.clone()))
    }

    pub fn generator_flag_table(&self) -> Result<FlagTable, ConfigError> {
        FlagTable::new(self.generator.flags.clone())
    }

    pub fn target_flag_table(&self) -> Result<FlagTable, ConfigError> {
        FlagTable::new(self.target.flags.clone())
    }

    pub fn opt_level_table(&self) -> Result<OptLevelTable, ConfigError> {
        OptLevelTable::new(&self.opt_levels)
    }

    pub fn reference_compile_template(&self) -> CommandTemplate {
        CommandTemplate::new(self.reference.command.clone())
    }

    pub fn target_compile_template(&self) -> CommandTemplate {
        CommandTemplate::new(self.target.command.clone())
    }
}

fn check_command(
    section: &'static str,
    command: &[String],
    placeholders: &[&'static str],
) -> Result<(), ConfigError> {
    if command.is_empty() || command[0].is_empty() {
        return Err(ConfigError::EmptyCommand { section });
    }
    for &placeholder in placeholders {
        if !command.iter().any(|arg| arg.contains(placeholder)) {
            return Err(ConfigError::MissingPlaceholder {
                section,
                placeholder,
            });
        }
    }
    Ok(())
}

impl Default for CampaignConfig {
    fn default() -> Self {
        Self {
            campaign: CampaignSettings::default(),
            generator: GeneratorSettings {
                command: strings(&[
                    "csmith",
                    "--no-volatiles",
                    "--no-packed-struct",
                    "--no-bitfields",
                ]),
                output: GeneratorOutput::Stdout,
                source_extension: default_source_extension(),
                flags: default_generator_flags(),
            },
            reference: ReferenceSettings {
                command: strings(&[
                    "clang",
                    "-m32",
                    "{opt}",
                    "{source}",
                    "-o",
                    "{output}",
                    "-I",
                    "/usr/include/csmith",
                    "-w",
                ]),
                run: default_reference_run(),
                stability_check: default_stability_check(),
                stability_opt_level: default_stability_opt_level(),
            },
            target: TargetSettings {
                command: strings(&[
                    "emcc",
                    "{source}",
                    "-o",
                    "{output}",
                    "{opt}",
                    "-I",
                    "/usr/include/csmith",
                    "{flags}",
                    "-w",
                ]),
                engine: "node".to_string(),
                artifact_extension: default_artifact_extension(),
                flags: default_target_flags(),
            },
            engines: default_engines(),
            opt_levels: default_opt_level_weights(),
            oracle: OracleSettings::default(),
            timeouts: TimeoutSettings::default(),
        }
    }
}
