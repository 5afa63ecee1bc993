use crate::config::types::LanguageId;
use crate::judge::adapter::{CommandTemplate, LanguagePipeline};

pub const PIPELINE: LanguagePipeline = LanguagePipeline {
    id: LanguageId::Javascript,
    file_name: "script.js",
    artifact: None,
    compile: None,
    run: CommandTemplate::new("node", &["{source}"]),
    environment: &[],
};
