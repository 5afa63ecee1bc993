use crate::config::types::LanguageId;
use crate::judge::adapter::{CommandTemplate, LanguagePipeline};

pub const PIPELINE: LanguagePipeline = LanguagePipeline {
    id: LanguageId::Cpp,
    file_name: "main.cpp",
    artifact: Some("main"),
    // The toolchain fans out into cc1plus/as/ld; the compile deadline covers all of them.
    compile: Some(CommandTemplate::new(
        "g++",
        &["{source}", "-O2", "-std=c++17", "-o", "{artifact}"],
    )),
    run: CommandTemplate::new("./main", &[]),
    environment: &[],
};
