//! Gatehouse route handlers.
//!
//! Handlers run behind `gate::enforce`, so the route's rate limit, access
//! level and CSRF requirement have already been checked when they execute.

pub mod csrf;
pub mod health;
pub mod session;

#[cfg(test)]
pub(crate) mod test_support;
