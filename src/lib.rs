//! labsql — Text-to-SQL safety guard and bounded execution for the
//! formulation lab database.
//!
//! A natural-language question is turned into candidate SQL by an untrusted
//! generator, validated by a pure policy guard, and executed read-only with
//! a row cap, a caller scope filter, and a timeout. Validator and executor
//! failures are fed back to the generator for a bounded number of retries.
//!
//! ```text
//! question + scope + top_k
//!     → TextToSqlService → grounding text → SqlGenerator → candidate SQL
//!     → SqlSafetyGuard → validated SQL
//!     → SqlReadonlyExecutor (scope + limit + timeout) → QueryResponse
//! ```

pub mod agentic;
pub mod config;
pub mod error;
pub mod executor;
pub mod format;
pub mod grounding;
pub mod guard;
pub mod policy;
pub mod service;

pub use agentic::{
    create_llm_client, ChatModelClient, GenerationContext, LlmClient, LlmSqlGenerator,
    ProviderKind, SqlGenerator,
};
pub use config::{DatabaseConfig, SqlAgentConfig};
pub use error::{AgentSqlError, ExecutionFailureKind};
pub use executor::{ExecutionResult, QueryExecutor, SqlReadonlyExecutor};
pub use format::format_result_table;
pub use grounding::{
    build_snapshot, render_snapshot, SampleProvider, SampleRow, SchemaSnapshot,
    DEFAULT_ALLOWLIST_TABLES,
};
pub use guard::SqlSafetyGuard;
pub use policy::AllowlistPolicy;
pub use service::{QueryRequest, QueryResponse, TextToSqlService};
