use crate::config::types::LanguageId;
use crate::judge::adapter::{CommandTemplate, LanguagePipeline};

/// Public class the submitted source must declare. Any other public class
/// name is rejected by `javac` and surfaces as a compile error.
pub const ENTRY_CLASS: &str = "Main";

pub const PIPELINE: LanguagePipeline = LanguagePipeline {
    id: LanguageId::Java,
    file_name: "Main.java",
    artifact: Some("Main.class"),
    compile: Some(CommandTemplate::new("javac", &["-encoding", "UTF-8", "{source}"])),
    run: CommandTemplate::new("java", &["-cp", ".", ENTRY_CLASS]),
    environment: &[("JAVA_TOOL_OPTIONS", "-Dfile.encoding=UTF-8")],
};

/// Best-effort check that the source declares `public class Main`.
/// Used only to enrich compile diagnostics.
pub fn declares_entry_class(source: &str) -> bool {
    source.lines().any(|line| {
        let mut words = line.split_whitespace();
        while let Some(word) = words.next() {
            if word == "class" {
                return words
                    .next()
                    .map(|name| name.trim_end_matches('{') == ENTRY_CLASS)
                    .unwrap_or(false);
            }
        }
        false
    })
}
