//! # runcell-core
//!
//! Execution sandbox layer for code evaluation harnesses.
//!
//! Stage a set of files into a working directory, run one shell command
//! against them under a timeout, capture its output, and collect the
//! resulting files. The same contract is served by two backends: plain host
//! processes and a long-lived Docker container.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────┐
//! │                   runcell-core (host)                    │
//! ├──────────────────────────────────────────────────────────┤
//! │                                                          │
//! │            ┌──────────────────────────────┐              │
//! │            │     trait ExecutionEnv       │              │
//! │            │  - run()                     │              │
//! │            │  - upload() / download()     │              │
//! │            └──────────────────────────────┘              │
//! │                 ▲                    ▲                   │
//! │  ┌─────────────────────┐   ┌──────────────────────────┐  │
//! │  │ SimpleExecutionEnv  │   │  DockerExecutionEnv      │  │
//! │  │  sh -c <cmd>        │   │  docker exec <id> sh -c  │  │
//! │  └─────────────────────┘   └──────────────────────────┘  │
//! │            │                    │ bind mount             │
//! │            ▼                    ▼                        │
//! │  ┌──────────────────────────────────────────────────┐   │
//! │  │ FileStore (working dir) ──▶ TempDirRegistry      │   │
//! │  └──────────────────────────────────────────────────┘   │
//! │                                                          │
//! └──────────────────────────────────────────────────────────┘
//!                           │ docker CLI
//!                           ▼
//! ┌──────────────────────────────────────────────────────────┐
//! │        container: sleep infinity, /workspace mounted     │
//! └──────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Quick Start
//!
//! ```ignore
//! use runcell_core::{DockerExecutionEnv, EnvConfig, ExecutionEnv, FileContent, Files};
//! use std::time::Duration;
//!
//! # async fn example() -> runcell_core::Result<()> {
//! let config = EnvConfig::builder()
//!     .image("runcell-sandbox:latest")
//!     .timeout(Duration::from_secs(10))
//!     .build()?;
//! let env = DockerExecutionEnv::new(None, config).await?;
//!
//! let mut files = Files::new();
//! files.insert("main.py".into(), FileContent::from("open('out.txt', 'w').write('hi')"));
//! env.upload(&files).await?;
//!
//! let result = env.run("python main.py", true).await?;
//! if result.timed_out {
//!     println!("timed out after {} ms", result.duration_ms);
//! }
//!
//! let produced = env.download().await?;
//! assert!(produced.contains_key("out.txt"));
//!
//! env.cleanup().await;
//! # Ok(())
//! # }
//! ```
//!
//! ## Features
//!
//! - **Two Backends**: Host processes for trusted code, Docker for untrusted code
//! - **Hard Timeouts**: The whole process tree is killed; partial output is kept
//! - **Binary-safe Files**: Non-UTF-8 files travel as base64
//! - **Path Safety**: Uploads cannot escape the working directory
//! - **Leak Protection**: Temp directories are tracked and swept at shutdown

mod config;
mod docker;
mod env;
mod error;
mod exec;
mod files;
mod local;
mod registry;
mod store;

pub use config::{EnvConfig, EnvConfigBuilder, DEFAULT_STOP_TIMEOUT, DEFAULT_TIMEOUT};
pub use docker::{ContainerState, DockerExecutionEnv};
pub use env::ExecutionEnv;
pub use error::{EnvError, Result};
pub use exec::{ExecResult, TIMEOUT_EXIT_CODE};
pub use files::{resolve_within, FileContent, Files};
pub use local::SimpleExecutionEnv;
pub use registry::{SweepGuard, TempDirRegistry};
pub use store::FileStore;
