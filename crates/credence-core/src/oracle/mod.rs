//! Oracle module - the model boundary
//!
//! Everything that talks to an embedding or chat model goes through the
//! [`OracleGateway`]; the providers behind it are pluggable drivers.

mod gateway;
mod judge;

#[cfg(feature = "remote-oracle")]
mod remote;

pub use gateway::{
    ChatProvider, EmbeddingProvider, OracleGateway, EMBED_DEADLINE, JUDGE_DEADLINE,
};
pub use judge::{
    build_completeness_prompt, build_judge_prompt, extract_json_object, parse_verdict,
    parse_warnings, JudgeKind, JudgeVerdict, COMPLETENESS_SYSTEM_PROMPT, JUDGE_SYSTEM_PROMPT,
};

#[cfg(feature = "remote-oracle")]
pub use remote::{RemoteChatProvider, RemoteEmbeddingProvider, RemoteOracleConfig};
