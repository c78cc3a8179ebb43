//! First message of every conversation: explains the command protocol to the
//! model.

use std::fmt::Write as _;
use std::path::Path;

use crate::budget::{result_trailer, RESULT_HEADER, SYSTEM_MESSAGE_PREFIX};
use crate::fence::FenceSyntax;

#[derive(Debug, Clone)]
pub struct PromptContext<'a> {
    pub syntax: &'a FenceSyntax,
    pub workdir: &'a Path,
    pub result_budget: usize,
    pub hints: Option<&'a str>,
}

pub fn bootstrap_prompt(context: &PromptContext<'_>) -> String {
    let start = context.syntax.start_marker();
    let end = context.syntax.end_marker();
    let system_header = SYSTEM_MESSAGE_PREFIX.trim_end();

    let mut prompt = String::new();
    let _ = write!(
        prompt,
        "A Linux shell is now part of this conversation.\n\
         \n\
         To run a command, put it in your message between these two lines, each on a line of its own:\n\
         {start}\n\
         <command>\n\
         {end}\n\
         \n\
         Every command is shown to me before it runs and I may decline it. \
         Approved commands run with `bash -lc` in \"{workdir}\", in the order they appear in your message.\n\
         When your message ends, you receive a message starting with \"{system_header}\" that holds \
         each result framed like this:\n\
         {header}<output>{trailer}\
         Output beyond {budget} characters per message is cut.\n\
         \n\
         Example:\n\
         > Me: What time is it?\n\
         > You:\n\
         > {start}\n\
         > date +'%r %Z'\n\
         > {end}\n\
         > Me: {system_header}\n\
         > {header_line}\n\
         > 12:00:20 PM UTC\n\
         > {trailer_line}\n\
         > You: It is 12:00:20 PM UTC.\n",
        workdir = context.workdir.display(),
        header = RESULT_HEADER,
        trailer = result_trailer(0),
        budget = context.result_budget,
        header_line = RESULT_HEADER.trim_end(),
        trailer_line = result_trailer(0).trim(),
    );

    if let Some(hints) = context.hints.map(str::trim).filter(|hints| !hints.is_empty()) {
        let _ = write!(prompt, "\nHints about this machine:\n{hints}\n");
    }

    prompt.push_str(
        "\nKeep your answers short. When I mention files, processes or the network, \
         I mean the ones on this machine; use commands to find out.\n",
    );
    prompt
}

/// Read the hints file. A missing or unreadable file means no hints.
pub fn load_hints(path: &Path) -> Option<String> {
    match std::fs::read_to_string(path) {
        Ok(hints) => Some(hints),
        Err(error) => {
            tracing::debug!(path = %path.display(), %error, "no hints file");
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use std::path::Path;

    use super::{bootstrap_prompt, load_hints, PromptContext};
    use crate::fence::{scan_fence, FenceSyntax};

    fn context<'a>(syntax: &'a FenceSyntax, hints: Option<&'a str>) -> PromptContext<'a> {
        PromptContext {
            syntax,
            workdir: Path::new("/srv/work"),
            result_budget: 1000,
            hints,
        }
    }

    #[test]
    fn prompt_example_uses_the_session_markers() {
        let syntax = FenceSyntax::with_token("k3y");
        let prompt = bootstrap_prompt(&context(&syntax, None));
        assert!(prompt.contains("=== COMMAND START k3y ==="));
        assert!(prompt.contains("/srv/work"));
        assert!(prompt.contains("1000 characters"));
        assert!(!prompt.contains("Hints"));
    }

    #[test]
    fn prompt_fence_layout_matches_the_scanner() {
        let syntax = FenceSyntax::default();
        let prompt = bootstrap_prompt(&context(&syntax, None));
        let found = scan_fence(&syntax, &prompt).expect("layout fence");
        assert_eq!(found.command, "<command>");
        assert_eq!(scan_fence(&syntax, &found.remainder), None);
    }

    #[test]
    fn hints_are_appended_when_present() {
        let syntax = FenceSyntax::default();
        let prompt = bootstrap_prompt(&context(&syntax, Some("  use doas, not sudo \n")));
        assert!(prompt.contains("Hints about this machine:\nuse doas, not sudo\n"));
    }

    #[test]
    fn missing_hints_file_is_none() {
        let dir = tempfile::tempdir().expect("tempdir");
        assert_eq!(load_hints(&dir.path().join("absent.txt")), None);
    }
}
