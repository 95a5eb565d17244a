// Copyright (c) 2025 Steven Rosenthal smr@dt3.org
// See LICENSE file in root directory for license terms.

use async_trait::async_trait;
use canonical_error::CanonicalError;

use crate::sky_position::{Epoch, SkyPosition};

// Boundary to a telescope mount backend. Implementations expose the mount's
// native coordinate epoch; epoch conversion for callers happens a layer up,
// in the telescope session.
//
// Error codes:
//   Unavailable: the backend cannot be reached.
//   Aborted: a command was refused by the mount.
#[async_trait]
pub trait MountTrait {
    async fn connect(&mut self) -> Result<(), CanonicalError>;
    async fn disconnect(&mut self);
    fn is_connected(&self) -> bool;

    // The epoch of positions reported and accepted by this backend.
    fn native_epoch(&self) -> Epoch;

    // Current pointing, in the native epoch.
    async fn position(&mut self) -> Result<SkyPosition, CanonicalError>;

    // Starts a slew; returns once the command is accepted, not when the
    // mount stops moving.
    async fn slew(&mut self, target: &SkyPosition)
                  -> Result<(), CanonicalError>;

    // Tells the mount it is currently pointed at `position`, without moving.
    async fn sync(&mut self, position: &SkyPosition)
                  -> Result<(), CanonicalError>;

    async fn is_slewing(&mut self) -> Result<bool, CanonicalError>;
}
