use crate::config::types::LanguageId;
use std::ffi::OsString;
use std::path::Path;

/// Placeholder expanded to the pipeline's source file name.
pub const SOURCE_PLACEHOLDER: &str = "{source}";
/// Placeholder expanded to the pipeline's compiled artifact name.
pub const ARTIFACT_PLACEHOLDER: &str = "{artifact}";

/// A program plus argument template, expanded against a workspace at spawn time.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct CommandTemplate {
    /// Program name resolved through `PATH`, or a `./`-relative path resolved
    /// against the workspace.
    pub program: &'static str,
    pub args: &'static [&'static str],
}

impl CommandTemplate {
    pub const fn new(program: &'static str, args: &'static [&'static str]) -> Self {
        Self { program, args }
    }

    /// Whether the program lives inside the workspace rather than on `PATH`
    pub fn is_workspace_relative(&self) -> bool {
        self.program.starts_with("./")
    }

    /// Expand placeholders into concrete argv, resolving workspace-relative
    /// programs against `workdir`.
    pub fn expand(&self, pipeline: &LanguagePipeline, workdir: &Path) -> Vec<OsString> {
        let mut argv = Vec::with_capacity(self.args.len() + 1);
        if self.is_workspace_relative() {
            argv.push(workdir.join(&self.program[2..]).into_os_string());
        } else {
            argv.push(OsString::from(self.program));
        }
        for arg in self.args {
            let expanded = arg
                .replace(SOURCE_PLACEHOLDER, pipeline.file_name)
                .replace(ARTIFACT_PLACEHOLDER, pipeline.artifact.unwrap_or(""));
            argv.push(OsString::from(expanded));
        }
        argv
    }

    /// Human-readable form used in logs
    pub fn display(&self, pipeline: &LanguagePipeline) -> String {
        let mut parts = vec![self.program.to_string()];
        parts.extend(self.args.iter().map(|arg| {
            arg.replace(SOURCE_PLACEHOLDER, pipeline.file_name)
                .replace(ARTIFACT_PLACEHOLDER, pipeline.artifact.unwrap_or(""))
        }));
        parts.join(" ")
    }
}

/// Steps that turn source text into output for one language.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct LanguagePipeline {
    pub id: LanguageId,
    /// File the source is written to inside the workspace
    pub file_name: &'static str,
    /// File the compile step must produce, when there is one
    pub artifact: Option<&'static str>,
    pub compile: Option<CommandTemplate>,
    pub run: CommandTemplate,
    /// Extra environment for both stages
    pub environment: &'static [(&'static str, &'static str)],
}

impl LanguagePipeline {
    pub fn is_compiled(&self) -> bool {
        self.compile.is_some()
    }

    /// Host binaries this pipeline needs on `PATH`
    pub fn required_binaries(&self) -> Vec<&'static str> {
        let mut binaries = Vec::new();
        if let Some(compile) = &self.compile {
            binaries.push(compile.program);
        }
        if !self.run.is_workspace_relative() {
            binaries.push(self.run.program);
        }
        binaries
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::judge::languages::{c, python};
    use std::path::PathBuf;

    #[test]
    fn expand_substitutes_placeholders() {
        let pipeline = c::PIPELINE;
        let compile = pipeline.compile.unwrap();
        let argv = compile.expand(&pipeline, Path::new("/tmp/ws"));
        let argv: Vec<String> = argv
            .into_iter()
            .map(|a| a.to_string_lossy().to_string())
            .collect();
        assert_eq!(argv, vec!["gcc", "main.c", "-O2", "-std=c11", "-o", "main"]);
    }

    #[test]
    fn workspace_relative_program_resolves_against_workdir() {
        let pipeline = c::PIPELINE;
        let argv = pipeline.run.expand(&pipeline, Path::new("/tmp/ws"));
        assert_eq!(PathBuf::from(&argv[0]), PathBuf::from("/tmp/ws/main"));
    }

    #[test]
    fn required_binaries_skip_workspace_artifacts() {
        assert_eq!(c::PIPELINE.required_binaries(), vec!["gcc"]);
        assert_eq!(python::PIPELINE.required_binaries(), vec!["python3"]);
    }
}
