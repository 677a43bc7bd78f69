pub mod capability;
pub mod db;
pub mod error;
pub mod kb;
pub mod sessions;
pub mod types;

pub use capability::CapabilityStore;
pub use error::{Result, StoreError};
pub use kb::KbStore;
pub use sessions::SessionStore;
