/// JavaScript host document
///
/// User code never becomes part of the document's source text: it is
/// embedded as a JSON string literal and evaluated with an indirect `eval`
/// inside an error trap. The console hooks write one JSON object per line to
/// stdout, which the host turns back into events.
use crate::config::types::{EventKind, OutputEvent};
use serde::Deserialize;

/// Name of the document inside the session directory
pub const DOCUMENT_NAME: &str = "main.js";

const PRELUDE: &str = r#"(function () {
  var write = typeof print === "function" ? print : console.log.bind(console);
  function text(args) {
    return Array.prototype.map.call(args, function (v) {
      return v === undefined || v === null ? "" : String(v);
    }).join(" ");
  }
  function emit(kind, args) {
    write(JSON.stringify({ kind: kind, text: text(args) }));
  }
  var hooks = {
    log: function () { emit("log", arguments); },
    info: function () { emit("log", arguments); },
    debug: function () { emit("log", arguments); },
    warn: function () { emit("error", arguments); },
    error: function () { emit("error", arguments); }
  };
  globalThis.console = hooks;
})();
"#;

/// Build the host document for `code`
pub fn host_document(code: &str) -> String {
    // serde_json output is a valid JS string literal, including U+2028/2029.
    let literal = serde_json::to_string(code).unwrap_or_else(|_| "\"\"".to_string());
    let mut doc = String::with_capacity(PRELUDE.len() + literal.len() + 128);
    doc.push_str(PRELUDE);
    doc.push_str("try {\n  (0, eval)(");
    doc.push_str(&literal);
    doc.push_str(");\n} catch (e) {\n  console.error(String((e && e.message) || e));\n}\n");
    doc
}

#[derive(Deserialize)]
struct HookLine {
    kind: EventKind,
    text: String,
}

/// Turn one stdout line of the guest into an event. Lines that did not come
/// from a console hook are treated as plain log output.
pub fn parse_stdout_line(line: &str) -> OutputEvent {
    match serde_json::from_str::<HookLine>(line) {
        Ok(hook) => OutputEvent {
            kind: hook.kind,
            text: hook.text,
        },
        Err(_) => OutputEvent::log(line),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn code_is_embedded_as_literal() {
        let code = "console.log(\"</script>\"); // \u{2028} `${x}`";
        let doc = host_document(code);
        let literal = serde_json::to_string(code).unwrap();
        assert!(doc.contains(&format!("(0, eval)({literal});")));
        assert!(!doc.contains(code));
    }

    #[test]
    fn hook_lines_become_events() {
        assert_eq!(
            parse_stdout_line(r#"{"kind":"log","text":"hi 2"}"#),
            OutputEvent::log("hi 2")
        );
        assert_eq!(
            parse_stdout_line(r#"{"kind":"error","text":"boom"}"#),
            OutputEvent::error("boom")
        );
    }

    #[test]
    fn stray_lines_are_logs() {
        assert_eq!(parse_stdout_line("plain"), OutputEvent::log("plain"));
        assert_eq!(
            parse_stdout_line(r#"{"kind":"shout","text":"x"}"#),
            OutputEvent::log(r#"{"kind":"shout","text":"x"}"#)
        );
    }
}
