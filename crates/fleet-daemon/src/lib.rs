//! Sweeps that keep the fleet moving.
//!
//! Each sweep reads a [`fleet_core::store::StoreSnapshot`], plans a list of
//! [`fleet_core::lifecycle::Mutation`]s as a pure function of that snapshot
//! and the clock, then applies them one transaction at a time. The
//! [`cycle::SweepCycle`] runs them in order: health, assign, spawn, review,
//! notification flush.

pub mod assign;
pub mod cycle;
pub mod daemon;
pub mod health;
pub mod notify;
pub mod rate_limiter;
pub mod review;
pub mod spawn;
