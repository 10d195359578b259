//! Margin pair table and geometric margin predicates
//!
//! The exact spherical geometry of pixel boundaries is delegated to a
//! precomputed pair table: for every source pixel it lists the candidate
//! neighbor pixels at the margin order together with each neighbor's
//! center coordinates. The predicates here treat a pixel as an equal-area
//! disc around that center:
//!
//! - fine:   separation(row, center) <= circumradius(order) + threshold
//! - coarse: separation(row, center) <= 2 * circumradius(order) + threshold
//!
//! Fine membership implies coarse membership for every threshold, which is
//! the containment the reducer relies on when fine filtering is deferred.

use crate::error::{MarginError, MarginResult};
use crate::pixel::HealpixPixel;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap};
use std::path::{Path, PathBuf};
use tracing::info;

const RAD_TO_ARCSEC: f64 = 3600.0 * 180.0 / std::f64::consts::PI;

/// Slack factor applied to the pixel radius for coarse bucketing
const COARSE_RADIUS_FACTOR: f64 = 2.0;

/// One candidate margin target for a source pixel
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct MarginCandidate {
    pub pixel: HealpixPixel,
    /// Center right ascension, degrees
    pub center_ra: f64,
    /// Center declination, degrees
    pub center_dec: f64,
}

/// CSV row of the pair table file
#[derive(Debug, Deserialize)]
struct MarginPairRecord {
    norder: u8,
    npix: u64,
    margin_order: u8,
    margin_npix: u64,
    margin_ra: f64,
    margin_dec: f64,
}

/// Precomputed source pixel -> candidate neighbor mapping, loaded once
/// and read-only for the whole run
#[derive(Debug, Clone)]
pub struct MarginPairTable {
    path: PathBuf,
    margin_order: u8,
    by_source: HashMap<HealpixPixel, Vec<MarginCandidate>>,
}

impl MarginPairTable {
    /// Load the pair table from its CSV file
    ///
    /// Expected header: `norder,npix,margin_order,margin_npix,margin_ra,margin_dec`.
    /// Every record must carry the same margin order.
    pub fn load(path: &Path) -> MarginResult<Self> {
        let mut reader = csv::Reader::from_path(path).map_err(|source| MarginError::Csv {
            path: path.to_path_buf(),
            source,
        })?;

        let mut margin_order: Option<u8> = None;
        let mut by_source: HashMap<HealpixPixel, Vec<MarginCandidate>> = HashMap::new();
        let mut records = 0usize;

        for result in reader.deserialize::<MarginPairRecord>() {
            let record = result.map_err(|source| MarginError::Csv {
                path: path.to_path_buf(),
                source,
            })?;

            match margin_order {
                None => margin_order = Some(record.margin_order),
                Some(order) if order != record.margin_order => {
                    return Err(MarginError::MarginPairTable {
                        path: path.to_path_buf(),
                        details: format!(
                            "mixed margin orders {} and {}",
                            order, record.margin_order
                        ),
                    });
                }
                Some(_) => {}
            }

            if !record.margin_ra.is_finite() || !record.margin_dec.is_finite() {
                return Err(MarginError::MarginPairTable {
                    path: path.to_path_buf(),
                    details: format!(
                        "non-finite center for margin pixel {}",
                        record.margin_npix
                    ),
                });
            }

            let source = HealpixPixel::new(record.norder, record.npix);
            by_source.entry(source).or_default().push(MarginCandidate {
                pixel: HealpixPixel::new(record.margin_order, record.margin_npix),
                center_ra: record.margin_ra,
                center_dec: record.margin_dec,
            });
            records += 1;
        }

        let margin_order = margin_order.ok_or_else(|| MarginError::MarginPairTable {
            path: path.to_path_buf(),
            details: "table is empty".to_string(),
        })?;

        // Deterministic candidate order regardless of file row order
        for candidates in by_source.values_mut() {
            candidates.sort_by_key(|c| c.pixel);
        }

        info!(
            "Loaded margin pair table from {} ({} pairs, {} source pixels, margin order {})",
            path.display(),
            records,
            by_source.len(),
            margin_order
        );

        Ok(Self {
            path: path.to_path_buf(),
            margin_order,
            by_source,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn margin_order(&self) -> u8 {
        self.margin_order
    }

    /// Candidate neighbors whose margin might contain rows of `source`
    pub fn candidates(&self, source: &HealpixPixel) -> &[MarginCandidate] {
        self.by_source
            .get(source)
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    /// Every distinct margin target pixel, in deterministic order
    pub fn target_pixels(&self) -> BTreeSet<HealpixPixel> {
        self.by_source
            .values()
            .flatten()
            .map(|c| c.pixel)
            .collect()
    }

    /// Center coordinates for each distinct margin target
    pub fn target_centers(&self) -> HashMap<HealpixPixel, (f64, f64)> {
        let mut centers = HashMap::new();
        for candidate in self.by_source.values().flatten() {
            centers
                .entry(candidate.pixel)
                .or_insert((candidate.center_ra, candidate.center_dec));
        }
        centers
    }
}

/// Great-circle separation between two sky positions, in arcseconds
///
/// Haversine form, stable for the small angles margin thresholds live at.
pub fn great_circle_separation_arcsec(ra1: f64, dec1: f64, ra2: f64, dec2: f64) -> f64 {
    let ra1 = ra1.to_radians();
    let dec1 = dec1.to_radians();
    let ra2 = ra2.to_radians();
    let dec2 = dec2.to_radians();

    let sin_ddec = ((dec2 - dec1) / 2.0).sin();
    let sin_dra = ((ra2 - ra1) / 2.0).sin();
    let h = sin_ddec * sin_ddec + dec1.cos() * dec2.cos() * sin_dra * sin_dra;
    2.0 * h.sqrt().min(1.0).asin() * RAD_TO_ARCSEC
}

/// Circumradius of the equal-area disc approximating a pixel at `order`,
/// in arcseconds
pub fn pixel_circumradius_arcsec(order: u8) -> f64 {
    RAD_TO_ARCSEC / (3.0f64.sqrt() * (1u64 << order) as f64)
}

/// Exact-threshold margin membership against one candidate neighbor
pub fn in_fine_margin(ra: f64, dec: f64, candidate: &MarginCandidate, threshold_arcsec: f64) -> bool {
    let sep = great_circle_separation_arcsec(ra, dec, candidate.center_ra, candidate.center_dec);
    sep <= pixel_circumradius_arcsec(candidate.pixel.order) + threshold_arcsec
}

/// Coarse pixel-resolution bucket membership; a superset of the fine
/// margin that trades precision for cheap row rejection
pub fn in_coarse_margin(
    ra: f64,
    dec: f64,
    candidate: &MarginCandidate,
    threshold_arcsec: f64,
) -> bool {
    let sep = great_circle_separation_arcsec(ra, dec, candidate.center_ra, candidate.center_dec);
    sep <= COARSE_RADIUS_FACTOR * pixel_circumradius_arcsec(candidate.pixel.order) + threshold_arcsec
}
