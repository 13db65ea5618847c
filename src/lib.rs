//! # remotedoc
//!
//! Always-current documentation mirrors from Git repositories for AI tools.
//!
//! remotedoc maintains local read-only mirrors of a configured set of
//! remote repositories, keeps them current by interval polling or verified
//! push webhooks, and resolves `remotedoc://owner/repo/branch/path`
//! addresses to file content with relative markdown links rewritten into
//! the same scheme, so a document fetched in isolation stays navigable.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────┐  ┌───────────┐   ┌──────────────┐   ┌─────────────┐
//! │  Poller  │  │  Webhook  │──▶│     Sync     │──▶│   Mirror    │
//! │ (jitter) │  │ (HMAC)    │   │ Orchestrator │   │   Store     │
//! └────┬─────┘  └───────────┘   └──────┬───────┘   └──────┬──────┘
//!      └────────────────────────────────┘                 │ publish/swap
//!                                                         ▼
//!                              ┌───────────┐       ┌─────────────┐
//!                              │ Discovery │       │  Resolver   │
//!                              │  (list)   │       │ (read+link  │
//!                              └───────────┘       │  rewrite)   │
//!                                                  └─────────────┘
//! ```
//!
//! Reads pin one published generation for their whole lifetime; publishing
//! swaps a pointer and retires the previous generation once its last
//! reader drops. Reads never block on sync and sync never blocks on reads.
//!
//! ## Modules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`config`] | TOML configuration parsing |
//! | [`error`] | Typed error taxonomy |
//! | [`address`] | `remotedoc://` parsing and path containment |
//! | [`rewrite`] | Relative markdown link rewriting |
//! | [`registry`] | Configured repository set |
//! | [`store`] | Mirror generations with atomic publish |
//! | [`fetcher`] | Upstream access (git + provider API) |
//! | [`sync`] | Sync orchestration: polling and webhook modes |
//! | [`webhook`] | Push notification verification |
//! | [`resolver`] | Document read path |
//! | [`discovery`] | Repository listing |
//! | [`server`] | HTTP transport |

pub mod address;
pub mod config;
pub mod discovery;
pub mod error;
pub mod fetcher;
pub mod registry;
pub mod resolver;
pub mod rewrite;
pub mod server;
pub mod store;
pub mod sync;
pub mod webhook;
