pub mod id;
pub mod session;
pub mod state;

pub use id::ClientId;
pub use session::{Role, Session};
pub use state::{MasterState, SyncSnapshot, ViewerEntry};
