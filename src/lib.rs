//! buddy-core: execution core of an agentic chat assistant.
//!
//! Three cooperating parts share one data model and event bus:
//! the permission engine decides whether a tool may run, the session store
//! keeps messages and parts, and the step processor drives the bounded agent
//! loop that turns a model stream into stored parts and tool executions.
//!
//! # Quick Start
//!
//! ```no_run
//! use std::sync::Arc;
//! use buddy_core::prelude::*;
//!
//! # async fn example(model: Arc<dyn ModelStream>) -> buddy_core::error::Result<()> {
//! let runtime = Runtime::new(RuntimeOptions::builder().model(model).build());
//! let project = ProjectId::global();
//! let session = runtime
//!     .sessions()
//!     .create_session(&project, CreateSession::default())?;
//! let outcome = runtime
//!     .prompt(
//!         &project,
//!         PromptInput::builder().session_id(session.id).text("Hello!").build(),
//!     )
//!     .await?;
//! if let Some(turn) = outcome.turn {
//!     let message = turn.wait().await?;
//!     println!("{:?}", message.finish);
//! }
//! # Ok(())
//! # }
//! ```

pub mod agent;
pub mod bus;
pub mod compaction;
pub mod config;
pub mod error;
pub mod llm;
pub mod permission;
pub mod prelude;
pub mod processor;
pub mod project;
pub mod runtime;
pub mod session;
pub mod store;
pub mod tools;
pub mod types;

pub use error::{BuddyError, Result};
pub use runtime::{PromptInput, PromptOutcome, Runtime, RuntimeOptions, TurnHandle};
