//! Retry policy and the retry middleware built on it

pub mod config;
pub mod middleware;
pub mod policy;

pub use config::RetryPolicyConfig;
pub use middleware::{
    handler_fn, DeliveryOutcome, HandlerContext, HandlerFn, MessageHandler, MessageRetryMiddleware,
    RetryMiddlewareFactory,
};
pub use policy::{PolicySelfCheck, RetryPolicy};
