//! Script state for the RUN command.
//!
//! A script is executed line by line by a worker task; at most `quantum`
//! lines run per wake-up before the task yields so that other work
//! interleaves. Per-line results are appended to an output file next to
//! the script.

use std::io::Write;
use std::path::{Path, PathBuf};

use stratakv_core::error::{ResultExt, SystemError, TypedResult};

#[derive(Debug, Default)]
pub struct Script {
    pub path: PathBuf,
    pub output_path: PathBuf,
    lines: Vec<String>,
    pos: usize,
}

impl Script {
    pub fn load(path: &Path) -> TypedResult<Self> {
        let raw = std::fs::read_to_string(path)
            .map_err(|e| stratakv_core::typed_err!(Generic, "script '{}' is not readable: {e}", path.display()))?;
        let lines = raw.lines().map(str::to_owned).collect();

        let mut output_path = path.as_os_str().to_owned();
        output_path.push(".out");
        Ok(Self {
            path: path.to_owned(),
            output_path: PathBuf::from(output_path),
            lines,
            pos: 0,
        })
    }

    /// 1-based number of the line `next` would return.
    pub fn line_number(&self) -> usize {
        self.pos + 1
    }

    pub fn is_finished(&self) -> bool {
        self.pos >= self.lines.len()
    }

    /// Returns the current line without consuming it.
    pub fn peek(&self) -> Option<&str> {
        self.lines.get(self.pos).map(String::as_str)
    }

    pub fn advance(&mut self) {
        self.pos += 1;
    }

    /// Stops the script (EXIT inside a script, or a failure).
    pub fn finish(&mut self) {
        self.pos = self.lines.len();
    }

    /// Appends one per-line result to the output file.
    pub fn append_output(&self, line_number: usize, text: &str) -> TypedResult<()> {
        let mut file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.output_path)
            .typ(SystemError::Generic)?;
        writeln!(file, "{line_number}: {text}").typ(SystemError::Generic)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write as _;

    #[test]
    fn loads_lines_and_tracks_position() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "INSERT T 1 \"a\"\nSELECT T 1").unwrap();

        let mut script = Script::load(file.path()).unwrap();
        assert_eq!(script.line_number(), 1);
        assert_eq!(script.peek(), Some("INSERT T 1 \"a\""));
        script.advance();
        assert_eq!(script.peek(), Some("SELECT T 1"));
        script.advance();
        assert!(script.is_finished());
        assert!(script.peek().is_none());
    }

    #[test]
    fn output_lands_next_to_the_script() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("demo.lql");
        std::fs::write(&path, "SELECT T 1\n").unwrap();

        let script = Script::load(&path).unwrap();
        script.append_output(1, "ok").unwrap();
        script.append_output(2, "Key 1 does not exist").unwrap();

        let out = std::fs::read_to_string(dir.path().join("demo.lql.out")).unwrap();
        assert_eq!(out, "1: ok\n2: Key 1 does not exist\n");
    }

    #[test]
    fn missing_scripts_fail_to_load() {
        assert!(Script::load(Path::new("/nonexistent.lql")).is_err());
    }
}
