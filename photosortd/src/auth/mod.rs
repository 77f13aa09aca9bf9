mod pipeline;
mod state;
mod token_store;

pub use pipeline::{
    AuthPipeline, LogoutOnUnauthorized, RetryOnUnauthorized, TokenAttach, auth_pipeline,
};
pub use state::{AuthState, AuthStateCell, Credentials, LoginProgress};
pub use token_store::{AccessToken, AuthError, AuthTokenStore, OAuthTokenStore};
