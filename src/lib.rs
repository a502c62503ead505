//! swarmkit: a multi-agent orchestration kernel.
//!
//! Agents talk to a hosted model service over per-pair conversation
//! threads. Tools come from external tool servers reached over a child
//! process, an event stream or streamable HTTP. Citations attached to
//! answers are recorded in history and can be recovered from it.
//!
//! # Quick Start
//!
//! ```no_run
//! use std::sync::Arc;
//! use swarmkit::prelude::*;
//!
//! # async fn example(model: Arc<dyn ModelService>) -> swarmkit::error::Result<()> {
//! let config = SwarmConfig::from_env()?;
//! let registry = Arc::new(ToolServerRegistry::from_config(&config, CollisionPolicy::default())?);
//! registry.start().await;
//!
//! let agent = Agent::builder()
//!     .name("DocAgent")
//!     .instructions("Answer from the attached files.")
//!     .tools(registry)
//!     .build();
//!
//! let orchestrator = Orchestrator::new(Arc::new(ThreadStore::new()), model)
//!     .with_agent(agent)?
//!     .with_model_timeout(config.timeouts.model);
//! let answer = orchestrator.route("What does the report say?", "DocAgent").await?;
//! println!("{answer}");
//! # Ok(())
//! # }
//! ```

pub mod agent;
pub mod citation;
pub mod config;
pub mod error;
pub mod mcp;
pub mod orchestrator;
pub mod prelude;
pub mod thread;
pub mod types;
pub mod util;

#[cfg(feature = "cli")]
pub mod cli;
