//! pytest-bridge: runs pytest and reports its results as a nested test
//! lifecycle.
//!
//! A companion pytest plugin writes a framed message stream to pytest's
//! stdout. This crate decodes that stream and reconciles it into properly
//! nested `started`/`finished` events over a run → group → case hierarchy,
//! which any [`ExecutionListener`] can consume.
//!
//! # Architecture
//!
//! The main components are:
//!
//! - **Protocol**: Decode the plugin's framed messages ([`protocol`])
//! - **Outcome**: Map pytest result categories to outcomes ([`outcome`], [`trace`])
//! - **Tracker**: Reconcile messages into lifecycle events ([`tracker`], [`scope`])
//! - **Runner**: Spawn pytest and pump its output ([`runner`], [`discovery`])
//! - **Report**: Console summary and JUnit XML ([`report`])
//!
//! # Example
//!
//! ```no_run
//! use pytest_bridge::config::load_config;
//! use pytest_bridge::discovery::PytestDiscoverer;
//! use pytest_bridge::listener::RecordingListener;
//! use pytest_bridge::runner::PytestRunner;
//! use pytest_bridge::tracker::ExecutionTracker;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = load_config(std::path::Path::new("pytest-bridge.toml"))?;
//!     let tree = PytestDiscoverer::new(config.pytest.clone()).discover().await?;
//!
//!     let runner = PytestRunner::new(config.pytest.clone());
//!     if let Some(command) = runner.command_line(&tree)? {
//!         let settings = (&config.bridge).into();
//!         let mut tracker = ExecutionTracker::new(tree, RecordingListener::new(), settings);
//!         runner.run(&command, &mut tracker).await?;
//!     }
//!     Ok(())
//! }
//! ```

pub mod artifacts;
pub mod config;
pub mod discovery;
pub mod listener;
pub mod outcome;
pub mod output;
pub mod protocol;
pub mod report;
pub mod runner;
pub mod scope;
pub mod trace;
pub mod tracker;

// Re-export commonly used types
pub use config::{Config, load_config};
pub use listener::ExecutionListener;
pub use outcome::Outcome;
pub use protocol::{BridgeError, BridgeResult, FrameReader, Message};
pub use scope::{Scope, ScopeId, ScopeTree};
pub use tracker::{ExecutionTracker, TrackerSettings};
