//! Service-level scenarios against the simulated BitTorrent backend.
//!
//! Each test builds its own `TestService` in a temporary profile, so the
//! modules run in parallel without sharing state.

#[path = "integration/fixtures.rs"]
mod fixtures;

#[path = "integration/buffering.rs"]
mod buffering;
#[path = "integration/selection.rs"]
mod selection;
#[path = "integration/prioritization.rs"]
mod prioritization;
#[path = "integration/wait_for_piece.rs"]
mod wait_for_piece;

#[path = "integration/completed_move.rs"]
mod completed_move;
#[path = "integration/listen_interfaces.rs"]
mod listen_interfaces;

#[path = "integration/properties.rs"]
mod properties;
