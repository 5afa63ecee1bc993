use crate::config::types::{LanguageId, Result};
use crate::judge::adapter::LanguagePipeline;
use crate::judge::languages::{c, cpp, java, javascript, python};

/// Read-only table of every server-side pipeline, in `LanguageId::ALL` order.
static PIPELINES: [LanguagePipeline; 5] = [
    c::PIPELINE,
    cpp::PIPELINE,
    java::PIPELINE,
    python::PIPELINE,
    javascript::PIPELINE,
];

/// Look up the pipeline for a language. Never performs I/O.
pub fn resolve(language: LanguageId) -> &'static LanguagePipeline {
    // Table order mirrors the enum declaration order.
    &PIPELINES[language as usize]
}

/// Parse a wire language name and resolve it.
pub fn resolve_name(language: &str) -> Result<&'static LanguagePipeline> {
    let id: LanguageId = language.parse()?;
    Ok(resolve(id))
}

/// All pipelines, for dependency checks and listings.
pub fn supported() -> &'static [LanguagePipeline] {
    &PIPELINES
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::types::CodeboxError;

    #[test]
    fn every_language_has_a_pipeline() {
        for id in LanguageId::ALL {
            assert_eq!(resolve(id).id, id);
        }
        assert_eq!(supported().len(), LanguageId::ALL.len());
    }

    #[test]
    fn compiled_languages_declare_artifacts() {
        for pipeline in supported() {
            assert_eq!(pipeline.is_compiled(), pipeline.artifact.is_some(), "{}", pipeline.id);
        }
        assert!(resolve(LanguageId::C).is_compiled());
        assert!(resolve(LanguageId::Cpp).is_compiled());
        assert!(resolve(LanguageId::Java).is_compiled());
        assert!(!resolve(LanguageId::Python).is_compiled());
        assert!(!resolve(LanguageId::Javascript).is_compiled());
    }

    #[test]
    fn unknown_name_is_rejected() {
        assert!(matches!(
            resolve_name("brainfuck"),
            Err(CodeboxError::UnsupportedLanguage(_))
        ));
        assert_eq!(resolve_name("c++").unwrap().file_name, "main.cpp");
    }

    #[test]
    fn java_runs_fixed_entry_class() {
        let java = resolve(LanguageId::Java);
        assert_eq!(java.file_name, "Main.java");
        assert_eq!(java.run.args.last(), Some(&"Main"));
    }
}
