//! Result framing and the per-message output budget.

/// Characters of command output relayed back per model message.
pub const DEFAULT_RESULT_BUDGET: usize = 1000;

pub const RESULT_HEADER: &str = "=== COMMAND RESULT START ===\n";

/// Prefix of the automatic follow-up turn carrying command results.
pub const SYSTEM_MESSAGE_PREFIX: &str = "*** LINUX SYSTEM MESSAGE ***\n";

pub fn result_trailer(status: i32) -> String {
    format!("\n=== COMMAND RESULT END (status: {status}) ===\n")
}

/// Running character budget shared by every command of one model message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResultBudget {
    limit: usize,
    used: usize,
}

impl ResultBudget {
    pub fn new(limit: usize) -> Self {
        Self { limit, used: 0 }
    }

    pub fn used(&self) -> usize {
        self.used
    }

    pub fn remaining(&self) -> usize {
        self.limit.saturating_sub(self.used)
    }

    /// Split `text` into the part that still fits and the excess, charging the
    /// fitting part to the budget.
    pub fn split(&mut self, text: &str) -> (String, String) {
        let (inside, excess) = split_chars(text, self.remaining());
        self.used += inside.chars().count();
        (inside.to_string(), excess.to_string())
    }
}

/// Output of one executed command as it will be relayed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandRecord {
    pub output: String,
    pub status: i32,
}

impl CommandRecord {
    pub fn new(output: impl Into<String>, status: i32) -> Self {
        Self {
            output: output.into(),
            status,
        }
    }

    fn framed(&self, body: &str) -> String {
        format!("{RESULT_HEADER}{body}{}", result_trailer(self.status))
    }

    fn framing_len(&self) -> usize {
        RESULT_HEADER.chars().count() + result_trailer(self.status).chars().count()
    }
}

/// Every record framed, in execution order.
pub fn compose_results(records: &[CommandRecord]) -> String {
    records
        .iter()
        .map(|record| record.framed(&record.output))
        .collect()
}

/// Compose at most `limit` characters of framed results.
///
/// Earlier commands keep priority. A command whose framing no longer fits is
/// dropped together with every later one; a body that only partly fits is cut
/// and ends the composition.
pub fn truncate_results(records: &[CommandRecord], limit: usize) -> String {
    let mut out = String::new();
    let mut remaining = limit;
    for record in records {
        let framing = record.framing_len();
        if framing > remaining {
            break;
        }
        remaining -= framing;

        let (body, cut) = split_chars(&record.output, remaining);
        remaining -= body.chars().count();
        out.push_str(&record.framed(body));
        if !cut.is_empty() {
            break;
        }
    }
    out
}

/// The follow-up turn body for a set of composed results.
pub fn system_message(results: &str) -> String {
    format!("{SYSTEM_MESSAGE_PREFIX}{results}")
}

fn split_chars(text: &str, max_chars: usize) -> (&str, &str) {
    match text.char_indices().nth(max_chars) {
        Some((index, _)) => text.split_at(index),
        None => (text, ""),
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::{
        compose_results, result_trailer, truncate_results, CommandRecord, ResultBudget,
        RESULT_HEADER,
    };

    #[test]
    fn budget_is_shared_across_splits() {
        let mut budget = ResultBudget::new(5);
        assert_eq!(budget.split("abc"), ("abc".to_owned(), String::new()));
        assert_eq!(budget.split("defg"), ("de".to_owned(), "fg".to_owned()));
        assert_eq!(budget.split("h"), (String::new(), "h".to_owned()));
        assert_eq!(budget.used(), 5);
    }

    #[test]
    fn budget_counts_characters_not_bytes() {
        let mut budget = ResultBudget::new(2);
        assert_eq!(budget.split("éàü"), ("éà".to_owned(), "ü".to_owned()));
    }

    #[test]
    fn compose_frames_each_record() {
        let records = vec![CommandRecord::new("a", 0), CommandRecord::new("b", 2)];
        assert_eq!(
            compose_results(&records),
            format!(
                "{RESULT_HEADER}a{}{RESULT_HEADER}b{}",
                result_trailer(0),
                result_trailer(2)
            )
        );
    }

    #[test]
    fn truncation_prefers_earlier_commands() {
        let records = vec![
            CommandRecord::new("x".repeat(30), 0),
            CommandRecord::new("y".repeat(30), 0),
        ];
        let framing = RESULT_HEADER.len() + result_trailer(0).len();
        let limit = framing + 10;

        let truncated = truncate_results(&records, limit);
        assert_eq!(
            truncated,
            format!("{RESULT_HEADER}{}{}", "x".repeat(10), result_trailer(0))
        );
        assert!(truncated.chars().count() <= limit);
    }

    #[test]
    fn truncation_keeps_whole_records_that_fit() {
        let records = vec![CommandRecord::new("ok", 0), CommandRecord::new("zz", 1)];
        let full = compose_results(&records);
        assert_eq!(truncate_results(&records, full.len()), full);
        assert_eq!(truncate_results(&records, 0), "");
    }

    #[test]
    fn truncation_is_pure() {
        let records = vec![CommandRecord::new("a".repeat(100), 0)];
        assert_eq!(
            truncate_results(&records, 60),
            truncate_results(&records, 60)
        );
    }
}
