pub mod archive;
pub mod campaign;
pub mod compile;
pub mod config;
pub mod generator;
pub mod oracle;
pub mod process;
pub mod sampler;

pub use archive::{ArchiveError, ArchiveId, FailureArchive, Reproducer, ReproducerMetadata};
pub use campaign::{Campaign, CampaignError, CampaignState, CampaignStats, IterationReport};
pub use compile::{Artifact, CompilationAdapter, CompileConfig, ToolchainId};
pub use config::{CampaignConfig, ConfigError};
pub use generator::{GenerationFailure, ProgramGenerator, SourceUnit};
pub use oracle::{DifferentialOracle, ExecutionResult, OracleReport, OutputFilter, Verdict};
pub use process::{
    CommandTemplate, ProcessOutput, ProcessRequest, ProcessRunner, RunError, SystemRunner,
};
pub use sampler::{FlagSpec, FlagTable, FlagValue, OptLevel, OptLevelTable, SelectedFlag};
