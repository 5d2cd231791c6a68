//! Domain logic for the Kaleidescape integration.
//!
//! Pure business rules with no infrastructure dependencies: nothing in here
//! opens a socket, spawns a task or reads a clock.  Every timestamp the
//! normalizer looks at arrives inside the event it is given, so the same event
//! sequence always produces the same state.

/// Reconnect delay policy.
pub mod backoff;

/// Abstract remote commands and their translation into device commands.
pub mod command;

/// Folding raw device events into the canonical state.
pub mod normalizer;

/// Canonical device state, raw events and state deltas.
pub mod state;
