//! Permission engine: pattern rules plus the asynchronous ask/reply lifecycle.

pub mod engine;
pub mod rule;

pub use engine::{
    AskInput, PermissionEngine, PermissionReply, PermissionRequest, PermissionTicket, ToolRef,
    APPROVED_KEY,
};
pub use rule::{
    disabled, evaluate, from_config, merge, wildcard_match, PermissionAction, PermissionRule,
    Ruleset,
};
