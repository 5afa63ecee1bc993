/// Python wrapper document
///
/// The code runs under `exec` with stdout and stderr pointed at one
/// `io.StringIO`. The buffer goes to the real stdout in one piece; an
/// uncaught exception's traceback goes to the real stderr.
use crate::config::types::OutputEvent;

/// Name of the wrapper inside the session directory
pub const DOCUMENT_NAME: &str = "main.py";

const TEMPLATE: &str = r#"import io as __cb_io
import sys as __cb_sys
import traceback as __cb_tb

__cb_src = __CODEBOX_SOURCE__
__cb_buf = __cb_io.StringIO()
__cb_out, __cb_err = __cb_sys.stdout, __cb_sys.stderr
__cb_sys.stdout = __cb_sys.stderr = __cb_buf
__cb_failure = None
try:
    exec(compile(__cb_src, "<main>", "exec"), {"__name__": "__main__"})
except SystemExit as e:
    if e.code not in (None, 0):
        __cb_failure = "SystemExit: %s\n" % (e.code,)
except BaseException:
    __cb_failure = __cb_tb.format_exc()
finally:
    __cb_sys.stdout, __cb_sys.stderr = __cb_out, __cb_err
__cb_out.write(__cb_buf.getvalue())
__cb_out.flush()
if __cb_failure is not None:
    __cb_err.write(__cb_failure)
    __cb_err.flush()
"#;

const SOURCE_SLOT: &str = "__CODEBOX_SOURCE__";

/// Build the wrapper for `code`
pub fn wrapper_document(code: &str) -> String {
    // A JSON string literal is also a valid Python string literal.
    let literal = serde_json::to_string(code).unwrap_or_else(|_| "\"\"".to_string());
    TEMPLATE.replacen(SOURCE_SLOT, &literal, 1)
}

/// Events for a finished run: the whole buffer as one log event, then the
/// traceback, if any, as one error event.
pub fn events_from_output(stdout: &[u8], stderr: &[u8]) -> Vec<OutputEvent> {
    let mut events = vec![OutputEvent::log(String::from_utf8_lossy(stdout))];
    if !stderr.is_empty() {
        events.push(OutputEvent::error(String::from_utf8_lossy(stderr)));
    }
    events
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn source_slot_is_filled_once() {
        let doc = wrapper_document("print('__CODEBOX_SOURCE__')");
        assert!(doc.contains(r#"__cb_src = "print('__CODEBOX_SOURCE__')""#));
        assert_eq!(doc.matches("exec(compile(").count(), 1);
    }

    #[test]
    fn clean_run_is_single_log_event() {
        let events = events_from_output(b"1\n2\n", b"");
        assert_eq!(events, vec![OutputEvent::log("1\n2\n")]);
    }

    #[test]
    fn empty_output_still_reports_a_log_event() {
        assert_eq!(events_from_output(b"", b""), vec![OutputEvent::log("")]);
    }

    #[test]
    fn traceback_becomes_error_event() {
        let events = events_from_output(b"partial\n", b"Traceback...\nZeroDivisionError\n");
        assert_eq!(events.len(), 2);
        assert_eq!(events[1], OutputEvent::error("Traceback...\nZeroDivisionError\n"));
    }
}
