//! The registration state machine.
//!
//! A new user registers an email, proves ownership with a one-time code,
//! sets their name, then accepts the terms. Each step is gated by the step
//! embedded in the credential the caller presents, and every transition is a
//! conditional write on the persisted step.

pub mod manager;
pub mod model;
pub mod routes;
pub mod state;

pub use manager::OnboardingManager;
pub use model::{StepPatch, User, VerificationCode};
pub use routes::{ApiError, OnboardingRouteState, ServiceApp, onboarding_routes, service_router};
pub use state::OnboardingStep;
