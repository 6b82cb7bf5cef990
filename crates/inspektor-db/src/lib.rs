pub mod context_store;
pub mod metadata_cache;
pub mod migrations;
pub mod session_store;

pub use context_store::{StoredWorkspaceContext, WorkspaceContextStore};
pub use metadata_cache::{DEFAULT_TTL_HOURS, MetadataCache};
pub use migrations::latest_version as schema_version;
pub use session_store::{Conversation, SessionStore};
