// Authentication module
// Token storage, refresh and single-flight coordination

mod refresh;
mod store;
mod types;

pub use refresh::{refresh_and_commit, refresh_tokens, RefreshCoordinator};
pub use store::{TokenStore, ACCESS_TOKEN_KEY, REFRESH_TOKEN_KEY};
pub use types::{RefreshRequest, TokenPair, TokenResponse};

pub(crate) use types::token_preview;
