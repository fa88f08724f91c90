//! Getting source code into a container without a shell.
//!
//! The program text is packed into a one-file tar archive that the runtime
//! extracts into [`PAYLOAD_DIR`]; the interpreter is then invoked by
//! argument vector. Source bytes are never spliced into a command string,
//! so quotes and shell metacharacters in user code have no effect.

use crate::error::ExecutionError;

/// Directory inside the container that receives the source file.
pub const PAYLOAD_DIR: &str = "/tmp";

/// How a language family is compiled or interpreted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Toolchain {
    Python,
    Go,
    /// Unknown family: the language name is used as the interpreter.
    Generic(String),
}

impl Toolchain {
    /// Detect the toolchain from a language name (`py*` / `go*` prefixes).
    pub fn detect(language: &str) -> Self {
        let lower = language.to_lowercase();
        if lower.starts_with("py") {
            Self::Python
        } else if lower.starts_with("go") {
            Self::Go
        } else {
            Self::Generic(language.to_string())
        }
    }

    pub fn file_name(&self) -> &'static str {
        match self {
            Self::Python => "main.py",
            Self::Go => "main.go",
            Self::Generic(_) => "main.txt",
        }
    }

    /// Absolute path of the source file inside the container.
    pub fn source_path(&self) -> String {
        format!("{}/{}", PAYLOAD_DIR, self.file_name())
    }

    /// Argument vector that runs the source file.
    pub fn command(&self) -> Vec<String> {
        let path = self.source_path();
        match self {
            Self::Python => vec!["python".to_string(), path],
            Self::Go => vec!["go".to_string(), "run".to_string(), path],
            Self::Generic(interpreter) => vec![interpreter.clone(), path],
        }
    }
}

/// Build an uncompressed tar archive holding `source` as `file_name`.
pub fn build_archive(file_name: &str, source: &str) -> Result<Vec<u8>, ExecutionError> {
    let bytes = source.as_bytes();
    let mut buf = Vec::with_capacity(bytes.len() + 1024);
    {
        let mut builder = tar::Builder::new(&mut buf);
        builder.mode(tar::HeaderMode::Deterministic);

        let mut header = tar::Header::new_gnu();
        header.set_entry_type(tar::EntryType::Regular);
        header.set_size(bytes.len() as u64);
        header.set_mode(0o644);
        header.set_mtime(0);
        header.set_uid(0);
        header.set_gid(0);
        header.set_cksum();

        builder
            .append_data(&mut header, file_name, bytes)
            .map_err(|e| ExecutionError::PayloadFailed(format!("append {file_name}: {e}")))?;
        builder
            .finish()
            .map_err(|e| ExecutionError::PayloadFailed(format!("finish archive: {e}")))?;
    }
    Ok(buf)
}
