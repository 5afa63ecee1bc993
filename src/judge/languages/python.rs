use crate::config::types::LanguageId;
use crate::judge::adapter::{CommandTemplate, LanguagePipeline};

pub const PIPELINE: LanguagePipeline = LanguagePipeline {
    id: LanguageId::Python,
    file_name: "script.py",
    artifact: None,
    compile: None,
    // -B keeps the workspace free of __pycache__.
    run: CommandTemplate::new("python3", &["-B", "{source}"]),
    environment: &[("PYTHONIOENCODING", "utf-8")],
};
