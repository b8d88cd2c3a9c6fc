use crate::compile::{CompilationAdapter, CompileConfig, ToolchainId};
use crate::config::CampaignConfig;
use crate::generator::SourceUnit;
use crate::oracle::Verdict;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::fs::{File, OpenOptions};
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::{debug, warn};

const FILE_PREFIX: &str = "newfail";

/// Name of an archived reproducer, unique within its archive directory.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ArchiveId(String);

impl ArchiveId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ArchiveId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for ArchiveId {
    fn from(id: &str) -> Self {
        Self::new(id)
    }
}

#[derive(Error, Debug)]
pub enum ArchiveError {
    #[error("Archive storage exhausted while writing {path:?}: {source}")]
    StorageExhausted {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("Archive I/O error at {path:?}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("Failed to (de)serialize reproducer metadata: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl ArchiveError {
    /// Whether the campaign can no longer preserve findings at all.
    pub fn is_fatal(&self) -> bool {
        matches!(self, ArchiveError::StorageExhausted { .. })
    }

    fn from_io(path: &Path, source: std::io::Error) -> Self {
        let path = path.to_path_buf();
        if is_storage_exhausted(&source) {
            ArchiveError::StorageExhausted { path, source }
        } else {
            ArchiveError::Io { path, source }
        }
    }
}

fn is_storage_exhausted(err: &std::io::Error) -> bool {
    err.kind() == ErrorKind::StorageFull || err.raw_os_error() == Some(libc::ENOSPC)
}

/// Everything needed to replay a finding, stored next to its source.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub struct ReproducerMetadata {
    pub id: ArchiveId,
    pub source_file: String,
    pub verdict: Verdict,
    pub config: CompileConfig,
    pub generator_flags: Vec<String>,
    pub detail: String,
    pub source_md5: String,
    pub target_command: Vec<String>,
    pub pid: u32,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Reproducer {
    pub source_path: PathBuf,
    /// Archived source bytes, including the trailing comment block.
    pub source: Vec<u8>,
    pub metadata: ReproducerMetadata,
}

/// Write-once store for reproducers.
///
/// Files are named `newfail_<pid>_<n>` and opened with `create_new`, so an
/// existing reproducer is never overwritten, even by another campaign
/// sharing the directory.
#[derive(Debug, Clone)]
pub struct FailureArchive {
    dir: PathBuf,
    source_extension: String,
    artifact_extension: String,
    compiler: CompilationAdapter,
    pid: u32,
    next: u64,
}

impl FailureArchive {
    pub fn new(
        dir: impl Into<PathBuf>,
        source_extension: impl Into<String>,
        artifact_extension: impl Into<String>,
        compiler: CompilationAdapter,
    ) -> Self {
        Self {
            dir: dir.into(),
            source_extension: source_extension.into(),
            artifact_extension: artifact_extension.into(),
            compiler,
            pid: std::process::id(),
            next: 0,
        }
    }

    pub fn from_config(config: &CampaignConfig) -> Self {
        Self::new(
            config.campaign.archive_dir.clone(),
            config.generator.source_extension.clone(),
            config.target.artifact_extension.clone(),
            CompilationAdapter::from_config(config),
        )
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn ensure_dir(&self) -> Result<(), ArchiveError> {
        std::fs::create_dir_all(&self.dir).map_err(|e| ArchiveError::from_io(&self.dir, e))
    }

    pub fn record(
        &mut self,
        source: &SourceUnit,
        config: &CompileConfig,
        verdict: Verdict,
        detail: &str,
    ) -> Result<ArchiveId, ArchiveError> {
        self.ensure_dir()?;
        let (id, path, file) = loop {
            let id = ArchiveId(format!("{FILE_PREFIX}_{}_{}", self.pid, self.next));
            self.next += 1;
            let path = self.dir.join(format!("{id}{}", self.source_extension));
            match OpenOptions::new().write(true).create_new(true).open(&path) {
                Ok(file) => break (id, path, file),
                Err(e) if e.kind() == ErrorKind::AlreadyExists => continue,
                Err(e) => return Err(ArchiveError::from_io(&path, e)),
            }
        };

        // A source without its sidecar cannot be replayed, so a half-written
        // entry is removed rather than left behind.
        let written = self
            .render_entry(&id, source, config, verdict, detail)
            .and_then(|(contents, json)| self.write_entry(file, &id, &path, &contents, &json));
        if let Err(err) = written {
            if let Err(cleanup) = std::fs::remove_file(&path) {
                warn!(path = ?path, error = %cleanup, "Failed to remove partial reproducer");
            }
            return Err(err);
        }
        debug!(%id, path = ?path, "Archived reproducer");
        Ok(id)
    }

    /// Returns the archived source bytes and the serialized sidecar.
    fn render_entry(
        &self,
        id: &ArchiveId,
        source: &SourceUnit,
        config: &CompileConfig,
        verdict: Verdict,
        detail: &str,
    ) -> Result<(Vec<u8>, Vec<u8>), ArchiveError> {
        let source_file = format!("{id}{}", self.source_extension);
        let artifact_file = format!("{id}{}", self.artifact_extension);
        let target_command = self.compiler.render(
            ToolchainId::Target,
            Path::new(&source_file),
            config,
            Path::new(&artifact_file),
        );

        let mut contents = source.text.clone();
        if !contents.ends_with(b"\n") {
            contents.push(b'\n');
        }
        contents.extend_from_slice(
            comment_block(
                id,
                verdict,
                config,
                &source.generator_flags,
                detail,
                &target_command,
            )
            .as_bytes(),
        );

        let metadata = ReproducerMetadata {
            id: id.clone(),
            source_file,
            verdict,
            config: config.clone(),
            generator_flags: source.generator_flags.clone(),
            detail: detail.to_string(),
            source_md5: format!("{:x}", md5::compute(&source.text)),
            target_command,
            pid: self.pid,
        };
        Ok((contents, serde_json::to_vec_pretty(&metadata)?))
    }

    fn write_entry(
        &self,
        mut file: File,
        id: &ArchiveId,
        path: &Path,
        contents: &[u8],
        json: &[u8],
    ) -> Result<(), ArchiveError> {
        file.write_all(contents)
            .and_then(|()| file.flush())
            .map_err(|e| ArchiveError::from_io(path, e))?;

        let sidecar = self.metadata_path(id);
        let mut sidecar_file = OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&sidecar)
            .map_err(|e| ArchiveError::from_io(&sidecar, e))?;
        if let Err(e) = sidecar_file.write_all(json).and_then(|()| sidecar_file.flush()) {
            drop(sidecar_file);
            if let Err(cleanup) = std::fs::remove_file(&sidecar) {
                warn!(path = ?sidecar, error = %cleanup, "Failed to remove partial metadata");
            }
            return Err(ArchiveError::from_io(&sidecar, e));
        }
        Ok(())
    }

    pub fn load(&self, id: &ArchiveId) -> Result<Reproducer, ArchiveError> {
        let sidecar = self.metadata_path(id);
        let json = std::fs::read(&sidecar).map_err(|e| ArchiveError::from_io(&sidecar, e))?;
        let metadata: ReproducerMetadata = serde_json::from_slice(&json)?;
        let source_path = self.dir.join(&metadata.source_file);
        let source = std::fs::read(&source_path)
            .map_err(|e| ArchiveError::from_io(&source_path, e))?;
        Ok(Reproducer {
            source_path,
            source,
            metadata,
        })
    }

    fn metadata_path(&self, id: &ArchiveId) -> PathBuf {
        self.dir.join(format!("{id}.json"))
    }
}

fn comment_block(
    id: &ArchiveId,
    verdict: Verdict,
    config: &CompileConfig,
    generator_flags: &[String],
    detail: &str,
    target_command: &[String],
) -> String {
    let single_line = |s: &str| s.replace(['\r', '\n'], " ");
    let command = target_command
        .iter()
        .map(|arg| shell_quote(arg))
        .collect::<Vec<_>>()
        .join(" ");
    format!(
        "\n// reproducer: {id}\n\
         // verdict: {verdict}\n\
         // detail: {}\n\
         // target config: {config}\n\
         // generator flags: {}\n\
         // {command}\n",
        single_line(detail),
        single_line(&generator_flags.join(" ")),
    )
}

fn shell_quote(arg: &str) -> String {
    let plain = !arg.is_empty()
        && arg
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || "-_./=,:+@%".contains(c));
    if plain {
        arg.to_string()
    } else {
        format!("'{}'", arg.replace('\'', r"'\''"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::process::CommandTemplate;
    use crate::sampler::{OptLevel, SelectedFlag};
    use std::time::Duration;

    fn adapter() -> CompilationAdapter {
        let t = |args: &[&str]| CommandTemplate::new(args.iter().map(|s| s.to_string()).collect());
        CompilationAdapter::new(
            t(&["clang", "{source}", "-o", "{output}"]),
            t(&["emcc", "{source}", "-o", "{output}", "{opt}", "{flags}", "-w"]),
            Duration::from_secs(60),
        )
    }

    fn archive(dir: &Path) -> FailureArchive {
        FailureArchive::new(dir, ".c", ".js", adapter())
    }

    fn source() -> SourceUnit {
        SourceUnit {
            path: PathBuf::from("/scratch/fuzz.c"),
            text: b"int main(void) { return 0; }".to_vec(),
            generator_flags: vec!["--max-funcs".to_string(), "12".to_string()],
            exit_code: Some(0),
        }
    }

    fn config() -> CompileConfig {
        CompileConfig {
            opt_level: OptLevel::Oz,
            flags: vec![SelectedFlag {
                name: "extra-passes".to_string(),
                args: vec![
                    "-s".to_string(),
                    "BINARYEN_EXTRA_PASSES=\"dce,vacuum\"".to_string(),
                ],
            }],
        }
    }

    #[test]
    fn records_source_verbatim_with_reproduction_comment() {
        let dir = tempfile::tempdir().unwrap();
        let mut archive = archive(dir.path());
        let id = archive
            .record(&source(), &config(), Verdict::BugMismatch, "output mismatch\nat byte 3")
            .unwrap();
        assert!(id.as_str().starts_with(&format!("newfail_{}_", std::process::id())));

        let written = std::fs::read_to_string(dir.path().join(format!("{id}.c"))).unwrap();
        assert!(written.starts_with("int main(void) { return 0; }\n"));
        assert!(written.contains("// verdict: BUG_MISMATCH"));
        assert!(written.contains("// detail: output mismatch at byte 3"));
        assert!(written.contains("// generator flags: --max-funcs 12"));
        assert!(written.contains(&format!(
            "// emcc {id}.c -o {id}.js -Oz -s 'BINARYEN_EXTRA_PASSES=\"dce,vacuum\"' -w"
        )));
    }

    #[test]
    fn consecutive_records_never_collide() {
        let dir = tempfile::tempdir().unwrap();
        let mut first = archive(dir.path());
        let mut second = archive(dir.path());
        let a = first.record(&source(), &config(), Verdict::BugCrash, "").unwrap();
        let b = first.record(&source(), &config(), Verdict::BugCrash, "").unwrap();
        let c = second.record(&source(), &config(), Verdict::BugCrash, "").unwrap();
        assert_ne!(a, b);
        assert_ne!(a, c);
        assert_ne!(b, c);
        let sources = std::fs::read_dir(dir.path())
            .unwrap()
            .filter(|e| {
                e.as_ref()
                    .unwrap()
                    .path()
                    .extension()
                    .is_some_and(|ext| ext == "c")
            })
            .count();
        assert_eq!(sources, 3);
    }

    #[test]
    fn load_reads_back_metadata() {
        let dir = tempfile::tempdir().unwrap();
        let mut archive = archive(&dir.path().join("nested"));
        let id = archive
            .record(&source(), &config(), Verdict::BugCompileFail, "Exited with code 1")
            .unwrap();

        let reproducer = archive.load(&id).unwrap();
        assert_eq!(reproducer.metadata.id, id);
        assert_eq!(reproducer.metadata.verdict, Verdict::BugCompileFail);
        assert_eq!(reproducer.metadata.config, config());
        assert_eq!(reproducer.metadata.generator_flags, ["--max-funcs", "12"]);
        assert_eq!(
            reproducer.metadata.source_md5,
            format!("{:x}", md5::compute(source().text))
        );
        assert_eq!(reproducer.metadata.target_command[0], "emcc");
        assert_eq!(reproducer.source_path, archive.dir().join(format!("{id}.c")));
        assert!(
            String::from_utf8_lossy(&reproducer.source).contains(&format!("// reproducer: {id}"))
        );
    }

    #[test]
    fn non_utf8_source_is_archived_byte_for_byte() {
        let dir = tempfile::tempdir().unwrap();
        let mut archive = archive(dir.path());
        let mut unit = source();
        unit.text = b"/* \xff\xfe */ int main(void) { return 0; }\n".to_vec();
        let id = archive
            .record(&unit, &config(), Verdict::BugCompileFail, "Exited with code 1")
            .unwrap();

        let reproducer = archive.load(&id).unwrap();
        assert!(reproducer.source.starts_with(&unit.text));
        assert_eq!(reproducer.source[..unit.text.len()], unit.text[..]);
        assert_eq!(
            reproducer.metadata.source_md5,
            format!("{:x}", md5::compute(&unit.text))
        );
    }

    #[test]
    fn failed_sidecar_write_leaves_no_partial_entry() {
        let dir = tempfile::tempdir().unwrap();
        let mut archive = archive(dir.path());
        let blocked = format!("newfail_{}_0", std::process::id());
        std::fs::create_dir(dir.path().join(format!("{blocked}.json"))).unwrap();

        let err = archive
            .record(&source(), &config(), Verdict::BugCrash, "")
            .unwrap_err();
        assert!(!err.is_fatal(), "{err}");
        assert!(!dir.path().join(format!("{blocked}.c")).exists());
        assert!(dir.path().join(format!("{blocked}.json")).is_dir());

        let id = archive
            .record(&source(), &config(), Verdict::BugCrash, "")
            .unwrap();
        assert_ne!(id.as_str(), blocked);
        assert!(archive.load(&id).is_ok());
    }

    #[test]
    fn missing_reproducer_is_a_recoverable_error() {
        let dir = tempfile::tempdir().unwrap();
        let err = archive(dir.path()).load(&ArchiveId::from("newfail_1_1")).unwrap_err();
        assert!(matches!(err, ArchiveError::Io { .. }));
        assert!(!err.is_fatal());
    }

    #[test]
    fn unusable_archive_dir_is_not_fatal() {
        let dir = tempfile::tempdir().unwrap();
        let blocker = dir.path().join("file");
        std::fs::write(&blocker, b"").unwrap();
        let err = archive(&blocker)
            .record(&source(), &config(), Verdict::BugCrash, "")
            .unwrap_err();
        assert!(!err.is_fatal(), "{err}");
    }

    #[test]
    fn storage_exhaustion_is_fatal() {
        let full = ArchiveError::from_io(
            Path::new("newfail_1_0.c"),
            std::io::Error::from_raw_os_error(libc::ENOSPC),
        );
        assert!(full.is_fatal());
        let denied = ArchiveError::from_io(
            Path::new("newfail_1_0.c"),
            std::io::Error::from(ErrorKind::PermissionDenied),
        );
        assert!(!denied.is_fatal());
    }

    #[test]
    fn quoting_leaves_plain_arguments_alone() {
        assert_eq!(shell_quote("-O2"), "-O2");
        assert_eq!(shell_quote("ALLOW_MEMORY_GROWTH=1"), "ALLOW_MEMORY_GROWTH=1");
        assert_eq!(shell_quote("a b"), "'a b'");
        assert_eq!(shell_quote("it's"), r"'it'\''s'");
        assert_eq!(shell_quote(""), "''");
    }
}
