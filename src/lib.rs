//! Onboarding service: email registration with verification codes and
//! step-gated signed credentials.

pub mod config;
pub mod credential;
pub mod error;
pub mod notify;
pub mod onboarding;
pub mod ratelimit;
pub mod store;
