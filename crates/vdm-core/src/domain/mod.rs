//! Domain entities for the remote session.
//!
//! This module contains pure display rules with no infrastructure
//! dependencies: how a requested viewport becomes a virtual display geometry,
//! which kind of display is being streamed, and how a host-side rotation is
//! expressed to the client.
//!
//! # Why a separate domain layer? (for beginners)
//!
//! The host's display session code talks to codecs, sockets and platform
//! display APIs.  The *rules* it applies (round geometry down to a multiple of
//! ten, turn a 90° host rotation into a -90° client rotation, only report a
//! rotation when it changed) do not need any of those.  Keeping the rules here
//! means they compile and test on any machine without a runtime or mocks.

/// Display geometry, type and rotation rules.
pub mod display;
