pub mod consumer;
pub mod error;
pub mod keys;
pub mod metrics;
pub mod session;
pub mod signin;

pub use consumer::{
    ConsumerRegistry, DelegationRequest, GroupLifecycleListener, Principal, RegenRequest,
    MAX_REQUESTED_DAYS,
};
pub use error::ServiceError;
pub use keys::IssuerKeys;
pub use session::{SessionClaims, SessionManager};
pub use signin::{SigninClaims, SigninTokenIssuer};
