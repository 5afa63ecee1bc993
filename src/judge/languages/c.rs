use crate::config::types::LanguageId;
use crate::judge::adapter::{CommandTemplate, LanguagePipeline};

pub const PIPELINE: LanguagePipeline = LanguagePipeline {
    id: LanguageId::C,
    file_name: "main.c",
    artifact: Some("main"),
    compile: Some(CommandTemplate::new(
        "gcc",
        &["{source}", "-O2", "-std=c11", "-o", "{artifact}"],
    )),
    run: CommandTemplate::new("./main", &[]),
    environment: &[],
};
