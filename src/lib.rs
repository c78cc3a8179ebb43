//! Interactive shell agent.
//!
//! A session streams a chat model's replies, pulls fenced commands out of the
//! text as it arrives, asks before running each one, and sends the framed
//! output back to the model as the next turn.
//!
//! # Layout
//! - [`fence`]: command fence detection over streamed text.
//! - [`exec`]: `bash -lc` execution with incremental output and a timeout.
//! - [`budget`]: result framing and the per-message output budget.
//! - [`orchestrator`]: one exchange, from outgoing turn to the last follow-up.
//! - [`session`]: worker thread and channels around the orchestrator.
//! - [`cli`]: the terminal front end used by the `shellmate` binary.

pub mod backends;
pub mod budget;
pub mod cli;
pub mod commands;
pub mod config;
pub mod exec;
pub mod fence;
pub mod logging;
pub mod orchestrator;
pub mod prompt;
pub mod session;
pub mod signals;

pub use crate::budget::{compose_results, truncate_results, CommandRecord, ResultBudget};
pub use crate::exec::{execute, CommandExecution, ExecError, ExecOutput};
pub use crate::fence::{scan_fence, CommandExtractor, CommandMatch, Extracted, FenceSyntax};
pub use crate::orchestrator::{AgentError, Caller, ExchangeOutcome, Orchestrator, ResponseEvent};
pub use crate::session::{Canceller, Session, SessionEvent, SessionHandle, SessionInput};
