// Copyright (c) 2025 Steven Rosenthal smr@dt3.org
// See LICENSE file in root directory for license terms.

use std::collections::HashMap;
use std::fs::File;
use std::io::Read;
use std::path::Path;

use canonical_error::{invalid_argument_error, CanonicalError};
use log::debug;

use platesync_elements::sky_position::{
    parse_dec_dms, parse_ra_hms, Epoch, SkyPosition,
};
use platesync_elements::solver_trait::SolveRequest;

const BLOCK_SIZE: usize = 2880;
const CARD_SIZE: usize = 80;

// Cap on header blocks we are willing to scan before giving up on END.
const MAX_HEADER_BLOCKS: usize = 64;

/// The primary header of a FITS file, parsed just far enough to pull out the
/// cards that seed a plate solve: approximate pointing and image geometry.
pub struct FitsHeader {
    cards: HashMap<String, String>,
}

impl FitsHeader {
    /// Reads the primary header from `path`. Only the header blocks are read,
    /// never the data unit.
    pub fn read_from(path: &Path) -> Result<FitsHeader, CanonicalError> {
        let mut file = File::open(path).map_err(|e| invalid_argument_error(
            format!("cannot open {:?}: {}", path, e).as_str()))?;
        let mut data = Vec::new();
        let mut block = [0u8; BLOCK_SIZE];
        for _ in 0..MAX_HEADER_BLOCKS {
            file.read_exact(&mut block).map_err(|e| invalid_argument_error(
                format!("cannot read FITS header from {:?}: {}",
                        path, e).as_str()))?;
            data.extend_from_slice(&block);
            if block_has_end_card(&block) {
                return Self::parse(&data);
            }
        }
        Err(invalid_argument_error(
            format!("no END card found in {:?}", path).as_str()))
    }

    /// Parses header bytes (a whole number of 2880 byte blocks, or at least
    /// everything up to and including the END card).
    pub fn parse(data: &[u8]) -> Result<FitsHeader, CanonicalError> {
        if data.len() < CARD_SIZE || !data.starts_with(b"SIMPLE") {
            return Err(invalid_argument_error("not a FITS file"));
        }
        let mut cards = HashMap::new();
        for card in data.chunks(CARD_SIZE) {
            let card = String::from_utf8_lossy(card);
            let keyword = card.get(..8).unwrap_or("").trim().to_string();
            if keyword == "END" {
                break;
            }
            if keyword.is_empty() || card.get(8..10) != Some("= ") {
                continue; // COMMENT, HISTORY, blank, or valueless card.
            }
            let value = parse_card_value(card.get(10..).unwrap_or(""));
            cards.insert(keyword, value);
        }
        Ok(FitsHeader { cards })
    }

    pub fn string(&self, keyword: &str) -> Option<&str> {
        self.cards.get(keyword).map(String::as_str)
    }

    pub fn float(&self, keyword: &str) -> Option<f64> {
        self.string(keyword).and_then(|v| v.parse().ok())
    }

    pub fn int(&self, keyword: &str) -> Option<u32> {
        self.string(keyword).and_then(|v| v.parse().ok())
    }

    /// The approximate pointing recorded by the capture software, if any.
    /// OBJCTRA/OBJCTDEC are conventionally J2000.
    pub fn hint_position(&self) -> Option<SkyPosition> {
        let ra = parse_ra_hms(self.string("OBJCTRA")?).ok()?;
        let dec = parse_dec_dms(self.string("OBJCTDEC")?).ok()?;
        Some(SkyPosition::new(ra, dec, Epoch::J2000))
    }

    /// Image width and height in binned pixels (NAXIS1/NAXIS2 already reflect
    /// binning; binning factors matter only for unbinned pixel scales).
    pub fn binned_dimensions(&self) -> Option<(u32, u32)> {
        Some((self.int("NAXIS1")?, self.int("NAXIS2")?))
    }

    pub fn binning(&self) -> (u32, u32) {
        (self.int("XBINNING").unwrap_or(1),
         self.int("YBINNING").unwrap_or(1))
    }
}

fn block_has_end_card(block: &[u8]) -> bool {
    block.chunks(CARD_SIZE).any(
        |card| card.starts_with(b"END ") || card == b"END")
}

// Takes the text after "= ": strips the trailing comment, and quotes from
// string values. A '/' inside a quoted string is not a comment.
fn parse_card_value(text: &str) -> String {
    let trimmed = text.trim_start();
    if let Some(rest) = trimmed.strip_prefix('\'') {
        let end = rest.find('\'').unwrap_or(rest.len());
        return rest[..end].trim().to_string();
    }
    let value = match trimmed.find('/') {
        Some(at) => &trimmed[..at],
        None => trimmed,
    };
    value.trim().to_string()
}

/// Fills in missing SolveRequest hints from the image's own FITS header:
/// pointing from OBJCTRA/OBJCTDEC, field of view from the image geometry and
/// pixel scale. Non-FITS images and absent cards are skipped silently; the
/// solve proceeds unhinted.
pub fn apply_header_hints(request: &mut SolveRequest) {
    let header = match FitsHeader::read_from(&request.image) {
        Ok(header) => header,
        Err(e) => {
            debug!("no usable FITS header: {}", e.message);
            return;
        }
    };
    if request.hint.is_none() {
        request.hint = header.hint_position();
        if let Some(hint) = &request.hint {
            debug!("header pointing hint: {}", hint);
        }
    }
    if request.fov_estimate.is_none() {
        if let (Some(pixel_scale), Some((width, height))) =
            (request.pixel_scale, header.binned_dimensions())
        {
            let (bin_x, bin_y) = header.binning();
            // pixel_scale is for unbinned pixels; scale up by the binning.
            let fov_x =
                pixel_scale * (bin_x * width) as f64 / 3600.0;
            let fov_y =
                pixel_scale * (bin_y * height) as f64 / 3600.0;
            request.fov_estimate = Some((fov_x, fov_y));
        }
    }
}

#[cfg(test)]
mod tests {
    extern crate approx;
    use approx::assert_abs_diff_eq;

    use super::*;

    fn make_header(cards: &[&str]) -> Vec<u8> {
        let mut data = Vec::new();
        for card in cards {
            let mut bytes = card.as_bytes().to_vec();
            bytes.resize(CARD_SIZE, b' ');
            data.extend_from_slice(&bytes);
        }
        let mut end = b"END".to_vec();
        end.resize(CARD_SIZE, b' ');
        data.extend_from_slice(&end);
        data.resize(data.len().div_ceil(BLOCK_SIZE) * BLOCK_SIZE, b' ');
        data
    }

    #[test]
    fn test_parse_header() {
        let data = make_header(&[
            "SIMPLE  =                    T / conforms to FITS standard",
            "BITPIX  =                   16",
            "NAXIS   =                    2",
            "NAXIS1  =                 2328",
            "NAXIS2  =                 1760",
            "XBINNING=                    2",
            "YBINNING=                    2",
            "OBJCTRA = '10 22 33.5'         / nominal center",
            "OBJCTDEC= '-05 30 00'          / nominal center",
            "INSTRUME= 'ASI/1600'           / slash inside string",
        ]);
        let header = FitsHeader::parse(&data).unwrap();
        assert_eq!(header.binned_dimensions(), Some((2328, 1760)));
        assert_eq!(header.binning(), (2, 2));
        assert_eq!(header.string("INSTRUME"), Some("ASI/1600"));

        let hint = header.hint_position().unwrap();
        assert_abs_diff_eq!(
            hint.ra_hours, 10.0 + 22.0 / 60.0 + 33.5 / 3600.0,
            epsilon = 1e-9);
        assert_abs_diff_eq!(hint.dec_deg, -5.5, epsilon = 1e-9);
        assert_eq!(hint.epoch, Epoch::J2000);
    }

    #[test]
    fn test_parse_header_without_pointing() {
        let data = make_header(&[
            "SIMPLE  =                    T",
            "NAXIS1  =                  100",
        ]);
        let header = FitsHeader::parse(&data).unwrap();
        assert!(header.hint_position().is_none());
        assert!(header.binned_dimensions().is_none()); // No NAXIS2.
    }

    #[test]
    fn test_parse_not_fits() {
        assert!(FitsHeader::parse(b"JFIF....").is_err());
    }

    #[test]
    fn test_apply_header_hints() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("capture.fits");
        std::fs::write(&path, make_header(&[
            "SIMPLE  =                    T",
            "NAXIS1  =                 1800",
            "NAXIS2  =                 1200",
            "OBJCTRA = '12 30 00'",
            "OBJCTDEC= '+45 00 00'",
        ])).unwrap();

        let mut request = SolveRequest {
            image: path,
            pixel_scale: Some(2.0),
            ..Default::default()
        };
        apply_header_hints(&mut request);
        let hint = request.hint.unwrap();
        assert_abs_diff_eq!(hint.ra_hours, 12.5, epsilon = 1e-9);
        assert_abs_diff_eq!(hint.dec_deg, 45.0, epsilon = 1e-9);
        let (fov_x, fov_y) = request.fov_estimate.unwrap();
        assert_abs_diff_eq!(fov_x, 1.0, epsilon = 1e-9);
        assert_abs_diff_eq!(fov_y, 2.0 * 1200.0 / 3600.0, epsilon = 1e-9);
    }
}
