pub mod context;
pub mod error;
pub mod message;
pub mod schema;
pub mod types;

pub use context::{SqlPattern, TypecastHint, WorkspaceContext};
pub use error::{Error, Result};
pub use message::{Confidence, Message, MessagePayload, MessageRole};
pub use schema::{
    ColumnSchema, MetadataKind, MetadataParams, MetadataPayload, MetadataRequest,
    MetadataSnapshot, Relationship, RelationshipKey, RequestKey,
};
pub use types::{ConversationId, DatastoreId, MessageId, WorkspaceId};
