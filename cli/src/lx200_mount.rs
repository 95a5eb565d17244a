// Copyright (c) 2025 Steven Rosenthal smr@dt3.org
// See LICENSE file in root directory for license terms.

use async_trait::async_trait;
use canonical_error::{
    aborted_error, unavailable_error, CanonicalError,
};
use log::{debug, info};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;

use platesync_elements::mount_trait::MountTrait;
use platesync_elements::sky_position::{
    parse_dec_dms, parse_ra_hms, Epoch, SkyPosition,
};

/// Mount backend speaking the Meade LX200 serial protocol over TCP, as
/// exposed by INDI/EQMod bridges and most goto controllers. The protocol's
/// native epoch is JNOW (the controller aligns on the sky it sees).
pub struct Lx200Mount {
    addr: String,
    stream: Option<TcpStream>,
}

// Longest legitimate reply is an object description from :CM#.
const MAX_REPLY_LEN: usize = 256;

impl Lx200Mount {
    pub fn new(addr: impl Into<String>) -> Self {
        Lx200Mount { addr: addr.into(), stream: None }
    }

    fn stream(&mut self) -> Result<&mut TcpStream, CanonicalError> {
        self.stream.as_mut().ok_or_else(|| unavailable_error(
            "not connected to mount"))
    }

    async fn send(&mut self, command: &str) -> Result<(), CanonicalError> {
        debug!("lx200 send: {}", command);
        let stream = self.stream()?;
        stream.write_all(command.as_bytes()).await.map_err(
            |e| unavailable_error(
                format!("error writing to mount: {}", e).as_str()))
    }

    // Reads a '#' terminated reply, returning it without the terminator.
    async fn read_reply(&mut self) -> Result<String, CanonicalError> {
        let stream = self.stream()?;
        let mut reply = Vec::new();
        loop {
            let byte = stream.read_u8().await.map_err(|e| unavailable_error(
                format!("error reading from mount: {}", e).as_str()))?;
            if byte == b'#' {
                break;
            }
            reply.push(byte);
            if reply.len() > MAX_REPLY_LEN {
                return Err(unavailable_error(
                    "unterminated reply from mount"));
            }
        }
        let reply = String::from_utf8_lossy(&reply).into_owned();
        debug!("lx200 reply: {}#", reply);
        Ok(reply)
    }

    // Reads a single byte acknowledgement (the :Sr/:Sd/:MS replies are not
    // '#' terminated).
    async fn read_ack(&mut self) -> Result<u8, CanonicalError> {
        let stream = self.stream()?;
        let ack = stream.read_u8().await.map_err(|e| unavailable_error(
            format!("error reading from mount: {}", e).as_str()))?;
        debug!("lx200 ack: {}", ack as char);
        Ok(ack)
    }

    async fn transact_string(&mut self, command: &str)
                             -> Result<String, CanonicalError> {
        self.send(command).await?;
        self.read_reply().await
    }

    // Loads `target` into the mount's target registers, for a subsequent
    // :MS# or :CM#.
    async fn set_target(&mut self, target: &SkyPosition)
                        -> Result<(), CanonicalError> {
        self.send(&format!(":Sr{}#", format_lx200_ra(target.ra_hours)))
            .await?;
        if self.read_ack().await? != b'1' {
            return Err(aborted_error(
                format!("mount rejected target RA {}",
                        target.format_ra_hms()).as_str()));
        }
        self.send(&format!(":Sd{}#", format_lx200_dec(target.dec_deg)))
            .await?;
        if self.read_ack().await? != b'1' {
            return Err(aborted_error(
                format!("mount rejected target declination {}",
                        target.format_dec_dms()).as_str()));
        }
        Ok(())
    }
}

#[async_trait]
impl MountTrait for Lx200Mount {
    async fn connect(&mut self) -> Result<(), CanonicalError> {
        if self.stream.is_some() {
            return Ok(());
        }
        info!("connecting to mount at {}", self.addr);
        let stream = TcpStream::connect(&self.addr).await.map_err(
            |e| unavailable_error(
                format!("cannot connect to mount at {}: {}",
                        self.addr, e).as_str()))?;
        stream.set_nodelay(true).map_err(|e| unavailable_error(
            format!("cannot configure mount connection: {}", e).as_str()))?;
        self.stream = Some(stream);
        // Probe with a position query to verify something LX200-ish is on
        // the other end.
        let reply = self.transact_string(":GR#").await?;
        parse_ra_hms(&reply)?;
        Ok(())
    }

    async fn disconnect(&mut self) {
        self.stream = None;
    }

    fn is_connected(&self) -> bool {
        self.stream.is_some()
    }

    fn native_epoch(&self) -> Epoch {
        Epoch::Jnow
    }

    async fn position(&mut self) -> Result<SkyPosition, CanonicalError> {
        let ra_reply = self.transact_string(":GR#").await?;
        let dec_reply = self.transact_string(":GD#").await?;
        Ok(SkyPosition::new(parse_ra_hms(&ra_reply)?,
                            parse_dec_dms(&dec_reply)?,
                            Epoch::Jnow))
    }

    async fn slew(&mut self, target: &SkyPosition)
                  -> Result<(), CanonicalError> {
        self.set_target(target).await?;
        self.send(":MS#").await?;
        let ack = self.read_ack().await?;
        if ack != b'0' {
            // A non-zero ack is followed by a '#' terminated explanation,
            // e.g. "Object Below Horizon".
            let reason = self.read_reply().await.unwrap_or_default();
            return Err(aborted_error(
                format!("mount refused slew: {}", reason).as_str()));
        }
        Ok(())
    }

    async fn sync(&mut self, position: &SkyPosition)
                  -> Result<(), CanonicalError> {
        self.set_target(position).await?;
        let reply = self.transact_string(":CM#").await?;
        debug!("sync acknowledged: {}", reply);
        Ok(())
    }

    async fn is_slewing(&mut self) -> Result<bool, CanonicalError> {
        // :D# returns a progress bar while slewing, empty when idle.
        let reply = self.transact_string(":D#").await?;
        Ok(!reply.trim_matches(' ').is_empty())
    }
}

/// Formats hours as the LX200 high precision "HH:MM:SS" target format.
pub fn format_lx200_ra(ra_hours: f64) -> String {
    let total_sec =
        ((ra_hours * 3600.0).round() as i64).rem_euclid(24 * 3600);
    format!("{:02}:{:02}:{:02}",
            total_sec / 3600, total_sec / 60 % 60, total_sec % 60)
}

/// Formats degrees as the LX200 high precision "sDD*MM:SS" target format.
pub fn format_lx200_dec(dec_deg: f64) -> String {
    let sign = if dec_deg < 0.0 { '-' } else { '+' };
    let total_sec = (dec_deg.abs() * 3600.0).round() as i64;
    format!("{}{:02}*{:02}:{:02}",
            sign, total_sec / 3600, total_sec / 60 % 60, total_sec % 60)
}
