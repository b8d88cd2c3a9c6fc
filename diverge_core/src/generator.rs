use crate::config::{CampaignConfig, ConfigError, GeneratorOutput};
use crate::process::{CommandTemplate, OUTPUT_PLACEHOLDER, ProcessRequest, ProcessRunner, RunError};
use crate::sampler::{FlagTable, flag_args};
use rand::Rng;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;
use tracing::debug;

/// One generated program.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SourceUnit {
    /// Where the program was written for this iteration.
    pub path: PathBuf,
    /// Program bytes exactly as the generator produced them.
    pub text: Vec<u8>,
    /// Generator arguments drawn for this program.
    pub generator_flags: Vec<String>,
    pub exit_code: Option<i32>,
}

impl SourceUnit {
    pub fn len(&self) -> usize {
        self.text.len()
    }

    pub fn is_empty(&self) -> bool {
        self.text.is_empty()
    }
}

/// The generator is not under test, so none of these ever count as a bug.
#[derive(Error, Debug)]
pub enum GenerationFailure {
    #[error("Generator timed out after {0:?}")]
    TimedOut(Duration),
    #[error("Generator failed: {0}")]
    Exited(String),
    #[error("Generator produced an empty program")]
    Empty,
    #[error(transparent)]
    Run(#[from] RunError),
    #[error("Failed to store generated program at {path:?}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

#[derive(Debug, Clone)]
pub struct ProgramGenerator {
    command: CommandTemplate,
    output: GeneratorOutput,
    flags: FlagTable,
    timeout: Duration,
}

impl ProgramGenerator {
    pub fn new(
        command: CommandTemplate,
        output: GeneratorOutput,
        flags: FlagTable,
        timeout: Duration,
    ) -> Self {
        Self {
            command,
            output,
            flags,
            timeout,
        }
    }

    pub fn from_config(config: &CampaignConfig) -> Result<Self, ConfigError> {
        Ok(Self::new(
            CommandTemplate::new(config.generator.command.clone()),
            config.generator.output.clone(),
            config.generator_flag_table()?,
            config.timeouts.generation(),
        ))
    }

    pub fn program(&self) -> Option<&str> {
        self.command.program()
    }

    /// Draws a generator flag set and writes one program to `source_path`,
    /// which must be unique to the calling iteration.
    pub fn generate<P, R>(
        &self,
        runner: &mut P,
        rng: &mut R,
        source_path: &Path,
    ) -> Result<SourceUnit, GenerationFailure>
    where
        P: ProcessRunner + ?Sized,
        R: Rng + ?Sized,
    {
        let generator_flags = flag_args(&self.flags.sample(rng));
        let io_err = |source| GenerationFailure::Io {
            path: source_path.to_path_buf(),
            source,
        };
        let source_path = std::path::absolute(source_path).map_err(io_err)?;
        let path_str = source_path.to_string_lossy();
        let argv = self
            .command
            .render(&[(OUTPUT_PLACEHOLDER, path_str.as_ref())], &generator_flags);
        let mut request = ProcessRequest::from_argv(argv, self.timeout);
        // Generators may leave side files (csmith writes platform.info) in
        // their working directory, so they run next to the program.
        if let Some(dir) = source_path.parent() {
            request = request.with_working_dir(dir);
        }
        debug!(command = %request.command_line(), "Generating program");

        let output = runner.run(&request)?;
        if output.timed_out {
            return Err(GenerationFailure::TimedOut(self.timeout));
        }
        if !output.success() {
            return Err(GenerationFailure::Exited(output.describe_exit()));
        }

        let text = match self.output {
            GeneratorOutput::Stdout => {
                std::fs::write(&source_path, &output.stdout).map_err(io_err)?;
                output.stdout
            }
            GeneratorOutput::File => std::fs::read(&source_path).map_err(io_err)?,
        };
        if text.trim_ascii().is_empty() {
            return Err(GenerationFailure::Empty);
        }
        debug!(bytes = text.len(), "Generated program");

        Ok(SourceUnit {
            path: source_path,
            text,
            generator_flags,
            exit_code: output.exit_code,
        })
    }
}
