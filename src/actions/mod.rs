//! 动作层：注册表、强类型动作与内置动作

pub mod builtin;
pub mod registry;
pub mod schema;

pub use builtin::{EchoAction, SaveRecordAction};
pub use registry::{
    check_against_schema, Action, ActionDescriptor, ActionError, ActionOutput, ActionRegistry,
};
pub use schema::FnAction;
