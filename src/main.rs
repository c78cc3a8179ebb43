use std::io;
use std::process::ExitCode;

use anyhow::{Context, Result};
use shellmate::backends::{backend_from_config, startup_notice};
use shellmate::cli::Cli;
use shellmate::config::AgentConfig;
use shellmate::fence::FenceSyntax;
use shellmate::logging::init_tracing;
use shellmate::orchestrator::Orchestrator;
use shellmate::prompt::{bootstrap_prompt, load_hints, PromptContext};
use shellmate::session::Session;
use shellmate::signals::install_interrupt_handler;

fn main() -> ExitCode {
    init_tracing();
    match run() {
        Ok(()) => ExitCode::SUCCESS,
        Err(error) => {
            eprintln!("shellmate: {error:#}");
            ExitCode::FAILURE
        }
    }
}

fn run() -> Result<()> {
    let config = AgentConfig::from_env().context("invalid configuration")?;
    let backend = backend_from_config(&config).context("failed to start the chat backend")?;
    if let Some(notice) = startup_notice(&config) {
        eprintln!("shellmate: {notice}");
    }

    let syntax = config
        .command_token
        .as_deref()
        .map(FenceSyntax::with_token)
        .unwrap_or_default();
    let hints = config.hints_path.as_deref().and_then(load_hints);
    let prompt = bootstrap_prompt(&PromptContext {
        syntax: &syntax,
        workdir: &config.workdir,
        result_budget: config.result_budget,
        hints: hints.as_deref(),
    });

    let orchestrator = Orchestrator::new(config.workdir.clone())
        .with_fence_syntax(syntax)
        .with_command_timeout(config.command_timeout)
        .with_result_budget(config.result_budget);

    let session = Session::new(backend, orchestrator, prompt)
        .spawn()
        .context("failed to start the session worker")?;
    let _interrupts =
        install_interrupt_handler(session.canceller()).context("failed to install Ctrl-C handler")?;

    let stdin = io::stdin();
    let mut cli = Cli::new(stdin.lock(), io::stdout());
    let outcome = cli.run(&session);
    session.shutdown();
    outcome
}
