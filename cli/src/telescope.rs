// Copyright (c) 2025 Steven Rosenthal smr@dt3.org
// See LICENSE file in root directory for license terms.

use std::time::{Duration, Instant, SystemTime};

use canonical_error::{
    aborted_error, deadline_exceeded_error, failed_precondition_error,
    CanonicalError,
};
use log::{info, warn};

use platesync_elements::mount_trait::MountTrait;
use platesync_elements::sky_position::{Epoch, SkyPosition};

/// Stateful wrapper around a mount backend. Owns the connected/disconnected
/// lifecycle, converts between the caller's epoch and the mount's native
/// epoch, and refuses commands that make no sense in the current state.
///
/// Commands issued while disconnected or (for slew/sync) while a slew is in
/// progress come back as Aborted, leaving the mount untouched.
pub struct TelescopeSession {
    mount: Box<dyn MountTrait + Send>,
    connected: bool,
    // Sync offsets larger than this are presumed to be mistakes (wrong
    // target, bad solve) and are refused.
    max_sync_separation_deg: f64,
}

impl TelescopeSession {
    pub fn new(mount: Box<dyn MountTrait + Send>,
               max_sync_separation_deg: f64) -> Self {
        TelescopeSession {
            mount,
            connected: false,
            max_sync_separation_deg,
        }
    }

    pub fn is_connected(&self) -> bool {
        self.connected
    }

    pub async fn connect(&mut self) -> Result<(), CanonicalError> {
        if self.connected {
            return Ok(());
        }
        self.mount.connect().await?;
        self.connected = true;
        Ok(())
    }

    pub async fn disconnect(&mut self) {
        if self.connected {
            self.mount.disconnect().await;
            self.connected = false;
        }
    }

    fn check_connected(&self, operation: &str) -> Result<(), CanonicalError> {
        if !self.connected {
            return Err(aborted_error(
                format!("{}: not connected to mount", operation).as_str()));
        }
        Ok(())
    }

    async fn check_not_slewing(&mut self, operation: &str)
                               -> Result<(), CanonicalError> {
        if self.mount.is_slewing().await? {
            return Err(aborted_error(
                format!("{}: slew in progress", operation).as_str()));
        }
        Ok(())
    }

    /// Current pointing, expressed in `epoch`.
    pub async fn get_position(&mut self, epoch: Epoch)
                              -> Result<SkyPosition, CanonicalError> {
        self.check_connected("get_position")?;
        let position = self.mount.position().await?;
        Ok(position.to_epoch(epoch, &SystemTime::now()))
    }

    /// Starts a slew to `target` (any epoch; converted to the mount's native
    /// epoch at the current instant). Returns once the mount accepts the
    /// command; use wait_until_idle() to block until pointing settles.
    pub async fn slew_to(&mut self, target: &SkyPosition)
                         -> Result<(), CanonicalError> {
        self.check_connected("slew_to")?;
        self.check_not_slewing("slew_to").await?;
        let native = target.to_epoch(self.mount.native_epoch(),
                                     &SystemTime::now());
        info!("slewing to {}", native);
        self.mount.slew(&native).await
    }

    /// Tells the mount where it is actually pointing. Refused while slewing,
    /// and refused when the correction exceeds the plausibility limit.
    pub async fn sync_to(&mut self, position: &SkyPosition)
                         -> Result<(), CanonicalError> {
        self.check_connected("sync_to")?;
        self.check_not_slewing("sync_to").await?;
        let native = position.to_epoch(self.mount.native_epoch(),
                                       &SystemTime::now());
        let current = self.mount.position().await?;
        let separation_deg = current.separation_from(&native)?;
        if separation_deg > self.max_sync_separation_deg {
            return Err(failed_precondition_error(
                format!("sync offset {:.2} deg exceeds limit of {:.2} deg; \
                         refusing", separation_deg,
                        self.max_sync_separation_deg).as_str()));
        }
        info!("syncing mount position to {}", native);
        self.mount.sync(&native).await
    }

    /// Polls until the mount stops slewing, with backoff from 100ms up to 1s
    /// between polls. DeadlineExceeded if still moving after `timeout`.
    pub async fn wait_until_idle(&mut self, timeout: Duration)
                                 -> Result<(), CanonicalError> {
        self.check_connected("wait_until_idle")?;
        let deadline = Instant::now() + timeout;
        let mut poll_interval = Duration::from_millis(100);
        loop {
            if !self.mount.is_slewing().await? {
                return Ok(());
            }
            if Instant::now() >= deadline {
                warn!("mount still slewing after {:.0?}", timeout);
                return Err(deadline_exceeded_error(
                    format!("mount did not settle within {:.0?}",
                            timeout).as_str()));
            }
            tokio::time::sleep(poll_interval).await;
            poll_interval = std::cmp::min(
                poll_interval * 2, Duration::from_secs(1));
        }
    }
}
