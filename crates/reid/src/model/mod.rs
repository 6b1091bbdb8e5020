//! Burn-side pieces: the tensor bridge used by the loss terms and a small
//! synthetic network for end-to-end runs.

pub mod bridge;
pub mod synthetic;
