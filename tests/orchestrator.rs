mod support;

use std::time::{Duration, Instant};

use chat_provider::{ChatBackend, ConversationError, Role};
use chat_provider_mock::{MockBackend, MockFailure, MockReply};
use pretty_assertions::assert_eq;
use shellmate::budget::{
    result_trailer, truncate_results, CommandRecord, RESULT_HEADER, SYSTEM_MESSAGE_PREFIX,
};
use shellmate::orchestrator::{AgentError, ExchangeOutcome, Orchestrator, ResponseEvent};
use support::{fenced, ScriptedCaller};
use tempfile::tempdir;

fn chunk(text: &str) -> ResponseEvent {
    ResponseEvent::MessageChunk(text.to_owned())
}

fn result(text: &str) -> ResponseEvent {
    ResponseEvent::CommandResult {
        text: text.to_owned(),
        ignored: false,
    }
}

fn run_exchange(
    orchestrator: &Orchestrator,
    backend: &MockBackend,
    caller: &mut ScriptedCaller,
) -> Result<ExchangeOutcome, AgentError> {
    let mut conversation = backend.new_conversation().expect("conversation");
    orchestrator.exchange(conversation.as_mut(), "hello", Role::User, caller)
}

#[test]
fn reply_without_commands_completes_after_one_message() {
    let workdir = tempdir().expect("tempdir");
    let backend = MockBackend::new(vec![MockReply::parts(["Hi ", "there."])]);
    let mut caller = ScriptedCaller::default();

    let outcome = run_exchange(&Orchestrator::new(workdir.path()), &backend, &mut caller)
        .expect("exchange");

    assert_eq!(outcome, ExchangeOutcome::Completed);
    assert_eq!(
        caller.events,
        vec![
            ResponseEvent::NewMessage,
            chunk("Hi "),
            chunk("there."),
            chunk("\n"),
        ]
    );
    assert_eq!(backend.sent_messages().len(), 1);
}

#[test]
fn approved_command_result_is_sent_back_as_system_turn() {
    let workdir = tempdir().expect("tempdir");
    let backend = MockBackend::new(vec![
        MockReply::parts([
            "Let me check.\n=== COMMAND ST".to_owned(),
            "ART ===\nprintf hello\n=== COMMAND END ===\nDone.".to_owned(),
        ]),
        MockReply::parts(["It says hello."]),
    ]);
    let mut caller = ScriptedCaller::approving(1);

    let outcome = run_exchange(&Orchestrator::new(workdir.path()), &backend, &mut caller)
        .expect("exchange");

    assert_eq!(outcome, ExchangeOutcome::Completed);
    assert_eq!(
        caller.events,
        vec![
            ResponseEvent::NewMessage,
            chunk("Let me check.\n"),
            ResponseEvent::ConfirmRunCommand {
                command: "printf hello".to_owned(),
            },
            result(RESULT_HEADER),
            result("hello"),
            result(&result_trailer(0)),
            chunk("\nDone."),
            chunk("\n"),
            ResponseEvent::NewMessage,
            chunk("It says hello."),
            chunk("\n"),
        ]
    );

    let sent = backend.sent_messages();
    assert_eq!(sent.len(), 2);
    assert_eq!(sent[1].role, Role::System);
    assert_eq!(
        sent[1].text,
        format!(
            "{SYSTEM_MESSAGE_PREFIX}{RESULT_HEADER}hello{}",
            result_trailer(0)
        )
    );
}

#[test]
fn declined_command_runs_nothing_and_keeps_following_text() {
    let workdir = tempdir().expect("tempdir");
    let backend = MockBackend::new(vec![MockReply::parts([format!(
        "Creating a file.\n{}\nDone.",
        fenced("touch marker")
    )])]);
    let mut caller = ScriptedCaller::with_confirmations(vec![false]);

    let outcome = run_exchange(&Orchestrator::new(workdir.path()), &backend, &mut caller)
        .expect("exchange");

    assert_eq!(outcome, ExchangeOutcome::Completed);
    assert!(!caller.has_command_results());
    assert!(!workdir.path().join("marker").exists());
    assert_eq!(caller.chunks(), "Creating a file.\n\nDone.\n");
    assert_eq!(backend.sent_messages().len(), 1);
}

#[test]
fn output_beyond_budget_is_shown_but_not_sent() {
    let workdir = tempdir().expect("tempdir");
    let backend = MockBackend::new(vec![
        MockReply::parts([fenced("head -c 1200 /dev/zero | tr '\\0' x")]),
        MockReply::parts(["Got it."]),
    ]);
    let mut caller = ScriptedCaller::approving(1);

    let outcome = run_exchange(&Orchestrator::new(workdir.path()), &backend, &mut caller)
        .expect("exchange");
    assert_eq!(outcome, ExchangeOutcome::Completed);

    let relayed = caller.result_text(false);
    let output = relayed
        .strip_prefix(RESULT_HEADER)
        .and_then(|rest| rest.strip_suffix(&result_trailer(0)))
        .expect("framed output");
    assert_eq!(output, "x".repeat(1000));
    assert_eq!(caller.result_text(true), "x".repeat(200));

    let record = CommandRecord::new("x".repeat(1000), 0);
    let framing = RESULT_HEADER.len() + result_trailer(0).len();
    assert!(caller.events.contains(&ResponseEvent::CommandsOverflow {
        default_value: 1000,
        actual_length: 1000 + framing,
    }));

    let sent = backend.sent_messages();
    assert_eq!(
        sent[1].text,
        format!(
            "{SYSTEM_MESSAGE_PREFIX}{}",
            truncate_results(&[record], 1000)
        )
    );
    assert!(sent[1].text.matches('x').count() <= 1000);
}

#[test]
fn overflow_answer_limits_the_follow_up() {
    let workdir = tempdir().expect("tempdir");
    let backend = MockBackend::new(vec![
        MockReply::parts([fenced("head -c 1200 /dev/zero | tr '\\0' x")]),
        MockReply::parts(["Nothing to see."]),
    ]);
    let mut caller = ScriptedCaller::approving(1).answer_overflow(0);

    run_exchange(&Orchestrator::new(workdir.path()), &backend, &mut caller).expect("exchange");

    assert_eq!(backend.sent_messages()[1].text, SYSTEM_MESSAGE_PREFIX);
}

#[test]
fn commands_of_one_message_share_the_budget() {
    let workdir = tempdir().expect("tempdir");
    let backend = MockBackend::new(vec![
        MockReply::parts([format!(
            "{}\n{}",
            fenced("printf 12345678"),
            fenced("printf abcdefgh")
        )]),
        MockReply::parts(["ok"]),
    ]);
    let mut caller = ScriptedCaller::approving(2).answer_overflow(usize::MAX);
    let orchestrator = Orchestrator::new(workdir.path()).with_result_budget(10);

    run_exchange(&orchestrator, &backend, &mut caller).expect("exchange");

    assert_eq!(caller.result_text(true), "cdefgh");
    let expected = [
        CommandRecord::new("12345678", 0),
        CommandRecord::new("ab", 0),
    ];
    assert_eq!(
        backend.sent_messages()[1].text,
        format!(
            "{SYSTEM_MESSAGE_PREFIX}{}",
            truncate_results(&expected, usize::MAX)
        )
    );
}

#[test]
fn spawn_failure_is_reported_as_a_result() {
    let workdir = tempdir().expect("tempdir");
    let missing = workdir.path().join("missing");
    let backend = MockBackend::new(vec![
        MockReply::parts([fenced("ls")]),
        MockReply::parts(["That failed."]),
    ]);
    let mut caller = ScriptedCaller::approving(1);

    run_exchange(&Orchestrator::new(&missing), &backend, &mut caller).expect("exchange");

    let relayed = caller.result_text(false);
    assert!(relayed.contains("Failed to execute the command:"), "{relayed}");
    assert!(relayed.ends_with(&result_trailer(-1)), "{relayed}");

    let sent = backend.sent_messages();
    assert_eq!(sent.len(), 2);
    assert!(sent[1].text.contains("Failed to execute the command:"));
}

#[test]
fn cancel_during_command_kills_it_and_drops_results() {
    let workdir = tempdir().expect("tempdir");
    let backend = MockBackend::new(vec![MockReply::parts([fenced(
        "printf started; sleep 30",
    )])]);
    let mut caller = ScriptedCaller::approving(1).cancel_on(|event| {
        matches!(event, ResponseEvent::CommandResult { text, .. } if text == "started")
    });

    let started = Instant::now();
    let outcome = run_exchange(&Orchestrator::new(workdir.path()), &backend, &mut caller)
        .expect("exchange");

    assert_eq!(outcome, ExchangeOutcome::Cancelled);
    assert!(started.elapsed() < Duration::from_secs(20));
    assert_eq!(caller.events.last(), Some(&result("started")));
    assert_eq!(backend.sent_messages().len(), 1);
}

#[test]
fn cancel_between_chunks_stops_the_message() {
    let workdir = tempdir().expect("tempdir");
    let backend = MockBackend::new(vec![MockReply::parts(["one ", "two ", "three"])]);
    let mut caller = ScriptedCaller::default()
        .cancel_on(|event| matches!(event, ResponseEvent::MessageChunk(text) if text == "one "));

    let outcome = run_exchange(&Orchestrator::new(workdir.path()), &backend, &mut caller)
        .expect("exchange");

    assert_eq!(outcome, ExchangeOutcome::Cancelled);
    assert_eq!(caller.events, vec![ResponseEvent::NewMessage, chunk("one ")]);
}

#[test]
fn stream_failure_is_fatal() {
    let workdir = tempdir().expect("tempdir");
    let backend = MockBackend::new(vec![
        MockReply::parts(["partial"]).then_fail(MockFailure::StreamDecode)
    ]);
    let mut caller = ScriptedCaller::default();

    let error = run_exchange(&Orchestrator::new(workdir.path()), &backend, &mut caller)
        .expect_err("decode failure");

    assert!(matches!(
        error,
        AgentError::Conversation(ConversationError::StreamDecode(_))
    ));
    assert_eq!(caller.chunks(), "partial");
}

#[test]
fn transport_failure_is_fatal_before_any_event() {
    let workdir = tempdir().expect("tempdir");
    let backend = MockBackend::new(vec![MockReply::failing(MockFailure::Transport)]);
    let mut caller = ScriptedCaller::default();

    let error = run_exchange(&Orchestrator::new(workdir.path()), &backend, &mut caller)
        .expect_err("transport failure");

    assert!(matches!(
        error,
        AgentError::Conversation(ConversationError::Transport(_))
    ));
    assert!(caller.events.is_empty());
}

#[test]
fn demo_script_offers_plain_and_indented_commands() {
    let workdir = tempdir().expect("tempdir");
    let backend = MockBackend::default();
    let orchestrator = Orchestrator::new(workdir.path());
    let mut conversation = backend.new_conversation().expect("conversation");

    let mut greeting = ScriptedCaller::default();
    orchestrator
        .exchange(conversation.as_mut(), "bootstrap", Role::User, &mut greeting)
        .expect("greeting");

    let mut caller = ScriptedCaller::with_confirmations(vec![false, false]);
    orchestrator
        .exchange(conversation.as_mut(), "look around", Role::User, &mut caller)
        .expect("exchange");

    let offered: Vec<_> = caller
        .events
        .iter()
        .filter_map(|event| match event {
            ResponseEvent::ConfirmRunCommand { command } => Some(command.as_str()),
            _ => None,
        })
        .collect();
    assert_eq!(offered, vec!["uname -a", "df -h ."]);
    assert!(!caller.chunks().contains("COMMAND"));
}

#[test]
fn command_timeout_reports_killed_status() {
    let workdir = tempdir().expect("tempdir");
    let backend = MockBackend::new(vec![
        MockReply::parts([fenced("sleep 30")]),
        MockReply::parts(["Too slow."]),
    ]);
    let mut caller = ScriptedCaller::approving(1);
    let orchestrator =
        Orchestrator::new(workdir.path()).with_command_timeout(Some(Duration::from_millis(300)));

    run_exchange(&orchestrator, &backend, &mut caller).expect("exchange");

    assert!(caller.events.contains(&result(&result_trailer(137))));
}
