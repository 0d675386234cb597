//! Robot program templates and synthesized URScript snippets
//!
//! The sorting program lives in a text file carrying a cycle-limit placeholder.
//! Digital outputs are driven by tiny secondary programs so that a running main
//! program is never replaced.

use crate::config::ProgramConfig;
use crate::{CellError, Result};
use std::path::{Path, PathBuf};
use tracing::debug;

/// Cycle limit meaning "run until stopped"
pub const UNBOUNDED_CYCLES: u32 = 0;

/// A single standard digital output write
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DigitalOutputCommand {
    pub index: u8,
    pub level: bool,
}

impl DigitalOutputCommand {
    pub fn new(index: u8, level: bool) -> Self {
        Self { index, level }
    }

    /// Encode as a secondary program, which runs alongside the main program
    pub fn to_urscript(&self) -> String {
        let level = if self.level { "True" } else { "False" };
        format!(
            "sec io_set():\n  set_standard_digital_out({}, {})\nend\n",
            self.index, level
        )
    }
}

/// Loaded program template
#[derive(Debug, Clone)]
pub struct ProgramTemplate {
    path: PathBuf,
    source: String,
    placeholder: String,
}

impl ProgramTemplate {
    pub fn new(path: PathBuf, source: String, placeholder: &str) -> Self {
        Self {
            path,
            source,
            placeholder: placeholder.to_string(),
        }
    }

    /// Locate and read the template named by the configuration
    pub fn load(config: &ProgramConfig) -> Result<Self> {
        let path = resolve_template_path(config, &candidate_dirs())?;
        let source = std::fs::read_to_string(&path).map_err(|e| {
            CellError::Validation(format!("Failed to read {}: {}", path.display(), e))
        })?;
        debug!("Loaded program template from {}", path.display());
        Ok(Self::new(path, source, &config.placeholder))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Substitute the cycle limit into the template
    pub fn render(&self, max_cycles: u32) -> String {
        self.source.replace(&self.placeholder, &max_cycles.to_string())
    }
}

/// Directories searched for the template, in priority order:
/// executable directory, working directory, then the source tree relative to
/// a `target/<profile>/` build output
fn candidate_dirs() -> Vec<PathBuf> {
    let mut dirs = Vec::new();
    let exe_dir = std::env::current_exe()
        .ok()
        .and_then(|exe| exe.parent().map(Path::to_path_buf));

    if let Some(dir) = &exe_dir {
        dirs.push(dir.clone());
    }
    if let Ok(cwd) = std::env::current_dir() {
        dirs.push(cwd);
    }
    if let Some(dir) = &exe_dir {
        dirs.push(dir.join("..").join("..").join(".."));
    }
    dirs
}

/// Pick the template file; an explicit path wins, otherwise the first
/// candidate directory containing the file
pub fn resolve_template_path(config: &ProgramConfig, dirs: &[PathBuf]) -> Result<PathBuf> {
    if let Some(explicit) = &config.template_path {
        if explicit.is_file() {
            return Ok(explicit.clone());
        }
        return Err(CellError::Validation(format!(
            "Program template not found at {}",
            explicit.display()
        )));
    }

    dirs.iter()
        .map(|dir| dir.join(&config.template_name))
        .find(|candidate| candidate.is_file())
        .ok_or_else(|| {
            CellError::Validation(format!(
                "Could not find {} in any of: {}",
                config.template_name,
                dirs.iter()
                    .map(|d| d.display().to_string())
                    .collect::<Vec<_>>()
                    .join(", ")
            ))
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_render_replaces_placeholder() {
        let template = ProgramTemplate::new(
            PathBuf::from("robot.script"),
            "def sort():\n  max_cycles = {{MAX_CYCLES}}\n  # limit {{MAX_CYCLES}}\nend\n".to_string(),
            "{{MAX_CYCLES}}",
        );
        let program = template.render(5);
        assert!(program.contains("max_cycles = 5"));
        assert!(program.contains("# limit 5"));
        assert!(!program.contains("{{MAX_CYCLES}}"));
    }

    #[test]
    fn test_manual_mode_renders_zero() {
        let template = ProgramTemplate::new(PathBuf::new(), "n={{MAX_CYCLES}}".to_string(), "{{MAX_CYCLES}}");
        assert_eq!(template.render(UNBOUNDED_CYCLES), "n=0");
    }

    #[test]
    fn test_digital_output_program() {
        assert_eq!(
            DigitalOutputCommand::new(6, true).to_urscript(),
            "sec io_set():\n  set_standard_digital_out(6, True)\nend\n"
        );
        assert!(DigitalOutputCommand::new(7, false)
            .to_urscript()
            .contains("set_standard_digital_out(7, False)"));
    }

    #[test]
    fn test_resolution_prefers_first_directory() {
        let first = TempDir::new().unwrap();
        let second = TempDir::new().unwrap();
        std::fs::write(second.path().join("robot.script"), "second").unwrap();

        let config = ProgramConfig::default();
        let dirs = vec![first.path().to_path_buf(), second.path().to_path_buf()];
        let path = resolve_template_path(&config, &dirs).unwrap();
        assert_eq!(path, second.path().join("robot.script"));

        std::fs::write(first.path().join("robot.script"), "first").unwrap();
        let path = resolve_template_path(&config, &dirs).unwrap();
        assert_eq!(path, first.path().join("robot.script"));
    }

    #[test]
    fn test_missing_template_is_validation_error() {
        let empty = TempDir::new().unwrap();
        let config = ProgramConfig::default();
        let result = resolve_template_path(&config, &[empty.path().to_path_buf()]);
        assert!(matches!(result, Err(CellError::Validation(_))));
    }

    #[test]
    fn test_explicit_path_wins() {
        let dir = TempDir::new().unwrap();
        let explicit = dir.path().join("custom.script");
        std::fs::write(&explicit, "def p():\nend\n").unwrap();

        let config = ProgramConfig {
            template_path: Some(explicit.clone()),
            ..ProgramConfig::default()
        };
        let template = ProgramTemplate::load(&config).unwrap();
        assert_eq!(template.path(), explicit.as_path());
    }
}
