//! Integrity checks on a staged artifact
//!
//! A staged file is trusted only if its length matches what the release
//! declared, it starts with the executable header for this platform, and (when
//! one was published) its SHA-256 matches. On any failure the staged file is
//! deleted; the live executable is never touched here.

use sha2::{Digest, Sha256};
use std::io::{self, Read};
use std::path::Path;

use super::{ReleaseDescriptor, StagedArtifact, UpdateError};

const PE_MAGIC: &[&[u8]] = &[b"MZ"];
const ELF_MAGIC: &[&[u8]] = &[b"\x7FELF"];
const MACHO_MAGIC: &[&[u8]] = &[
    &[0xFE, 0xED, 0xFA, 0xCE],
    &[0xCE, 0xFA, 0xED, 0xFE],
    &[0xFE, 0xED, 0xFA, 0xCF],
    &[0xCF, 0xFA, 0xED, 0xFE],
    &[0xCA, 0xFE, 0xBA, 0xBE],
];

/// Executable container format expected for the running platform
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecutableFormat {
    /// Windows PE (`MZ`)
    Pe,
    /// Linux ELF
    Elf,
    /// macOS Mach-O, thin or universal
    MachO,
}

impl ExecutableFormat {
    pub fn current() -> Self {
        if cfg!(target_os = "windows") {
            ExecutableFormat::Pe
        } else if cfg!(target_os = "macos") {
            ExecutableFormat::MachO
        } else {
            ExecutableFormat::Elf
        }
    }

    fn magics(self) -> &'static [&'static [u8]] {
        match self {
            ExecutableFormat::Pe => PE_MAGIC,
            ExecutableFormat::Elf => ELF_MAGIC,
            ExecutableFormat::MachO => MACHO_MAGIC,
        }
    }

    /// Whether `header` starts with one of this format's magic numbers
    pub fn matches(self, header: &[u8]) -> bool {
        self.magics().iter().any(|magic| header.starts_with(magic))
    }
}

/// Validates staged artifacts before they may replace the live binary
#[derive(Debug, Clone)]
pub struct IntegrityVerifier {
    format: ExecutableFormat,
}

impl Default for IntegrityVerifier {
    fn default() -> Self {
        Self::new(ExecutableFormat::current())
    }
}

impl IntegrityVerifier {
    pub fn new(format: ExecutableFormat) -> Self {
        Self { format }
    }

    /// Verify `artifact` against `descriptor`, deleting the staged file on failure
    pub fn verify(
        &self,
        artifact: &StagedArtifact,
        descriptor: &ReleaseDescriptor,
        expected_sha256: Option<&str>,
    ) -> Result<(), UpdateError> {
        let result = self.check(artifact, descriptor, expected_sha256);

        if let Err(e) = &result {
            tracing::warn!(path = %artifact.path.display(), "rejecting staged update: {}", e);
            if let Err(rm) = std::fs::remove_file(&artifact.path) {
                if rm.kind() != io::ErrorKind::NotFound {
                    tracing::warn!(
                        path = %artifact.path.display(),
                        "could not delete rejected artifact: {}",
                        rm
                    );
                }
            }
        }

        result
    }

    fn check(
        &self,
        artifact: &StagedArtifact,
        descriptor: &ReleaseDescriptor,
        expected_sha256: Option<&str>,
    ) -> Result<(), UpdateError> {
        let actual_size = std::fs::metadata(&artifact.path)
            .map_err(|e| UpdateError::Integrity(format!("staged file unreadable: {}", e)))?
            .len();

        if actual_size != artifact.bytes_written {
            return Err(UpdateError::Integrity(format!(
                "staged file is {} bytes but {} were downloaded",
                actual_size, artifact.bytes_written
            )));
        }

        for (source, declared) in [
            ("release", descriptor.asset_size),
            ("server", artifact.declared_size),
        ] {
            if let Some(declared) = declared {
                if declared != actual_size {
                    return Err(UpdateError::Integrity(format!(
                        "size mismatch: {} declared {} bytes, got {}",
                        source, declared, actual_size
                    )));
                }
            }
        }

        if actual_size == 0 {
            return Err(UpdateError::Integrity("staged file is empty".to_string()));
        }

        let header = read_header(&artifact.path)
            .map_err(|e| UpdateError::Integrity(format!("cannot read header: {}", e)))?;
        if !self.format.matches(&header) {
            return Err(UpdateError::Integrity(format!(
                "not a {:?} executable (header {:02x?})",
                self.format, header
            )));
        }

        match expected_sha256 {
            Some(expected) => {
                let actual = sha256_hex(&artifact.path)
                    .map_err(|e| UpdateError::Integrity(format!("cannot hash file: {}", e)))?;
                if !actual.eq_ignore_ascii_case(expected) {
                    return Err(UpdateError::Integrity(format!(
                        "checksum mismatch: expected {}, got {}",
                        expected, actual
                    )));
                }
                tracing::info!(sha256 = %actual, "staged update checksum ok");
            }
            None => tracing::info!("no checksum published, verified size and header only"),
        }

        Ok(())
    }
}

fn read_header(path: &Path) -> io::Result<Vec<u8>> {
    let mut header = Vec::with_capacity(4);
    std::fs::File::open(path)?.take(4).read_to_end(&mut header)?;
    Ok(header)
}

/// SHA-256 of a file, read in 64 KiB chunks
pub fn sha256_hex(path: &Path) -> io::Result<String> {
    let mut file = std::fs::File::open(path)?;
    let mut hasher = Sha256::new();
    let mut buf = vec![0u8; 65_536];
    loop {
        let n = file.read(&mut buf)?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    Ok(format!("{:x}", hasher.finalize()))
}
