//! HEALPix pixel identity and on-disk partition layout
//!
//! A pixel is identified by `(order, pixel)`; higher order means finer
//! partitions. Partition files live under the hierarchical
//! `Norder=<order>/Dir=<dir>/Npix=<pixel>.parquet` layout, where `Dir`
//! buckets pixels in groups of 10,000 to keep directory fan-out bounded.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;

/// Number of pixel ids grouped under one `Dir=` directory
const DIR_BUCKET: u64 = 10_000;

/// One node of the spatial hierarchy, identified by `(order, pixel)`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct HealpixPixel {
    pub order: u8,
    pub pixel: u64,
}

impl HealpixPixel {
    pub fn new(order: u8, pixel: u64) -> Self {
        Self { order, pixel }
    }

    /// Directory bucket this pixel's partition file lives under
    pub fn dir(&self) -> u64 {
        (self.pixel / DIR_BUCKET) * DIR_BUCKET
    }

    /// Relative path of this pixel's partition file inside a catalog root
    pub fn partition_path(&self) -> PathBuf {
        PathBuf::from(format!(
            "Norder={}/Dir={}/Npix={}.parquet",
            self.order,
            self.dir(),
            self.pixel
        ))
    }

    /// Number of pixels tiling the sphere at this pixel's order
    pub fn pixels_at_order(&self) -> u64 {
        12 * (1u64 << (2 * self.order as u32))
    }
}

impl fmt::Display for HealpixPixel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Order: {}, Pixel: {}", self.order, self.pixel)
    }
}

/// Identifier of one map-phase work item, 1:1 with a source partition
pub fn mapping_key(pixel: &HealpixPixel) -> String {
    format!("map_{}_{}", pixel.order, pixel.pixel)
}

/// Identifier of one reduce-phase work item, 1:1 with an output pixel
pub fn reducing_key(pixel: &HealpixPixel) -> String {
    format!("reduce_{}_{}", pixel.order, pixel.pixel)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dir_buckets_by_ten_thousand() {
        assert_eq!(HealpixPixel::new(5, 0).dir(), 0);
        assert_eq!(HealpixPixel::new(5, 9_999).dir(), 0);
        assert_eq!(HealpixPixel::new(5, 10_000).dir(), 10_000);
        assert_eq!(HealpixPixel::new(8, 123_456).dir(), 120_000);
    }

    #[test]
    fn partition_path_layout() {
        let pixel = HealpixPixel::new(2, 7);
        assert_eq!(
            pixel.partition_path(),
            PathBuf::from("Norder=2/Dir=0/Npix=7.parquet")
        );
    }

    #[test]
    fn keys_are_derived_from_order_and_pixel() {
        let pixel = HealpixPixel::new(3, 44);
        assert_eq!(mapping_key(&pixel), "map_3_44");
        assert_eq!(reducing_key(&pixel), "reduce_3_44");
    }

    #[test]
    fn pixel_counts_per_order() {
        assert_eq!(HealpixPixel::new(0, 0).pixels_at_order(), 12);
        assert_eq!(HealpixPixel::new(2, 0).pixels_at_order(), 192);
    }

    #[test]
    fn equality_and_hash_are_by_order_and_pixel() {
        use std::collections::HashSet;
        let mut set = HashSet::new();
        set.insert(HealpixPixel::new(2, 5));
        set.insert(HealpixPixel::new(2, 5));
        set.insert(HealpixPixel::new(3, 5));
        assert_eq!(set.len(), 2);
    }

    #[test]
    fn serde_round_trip() {
        let pixel = HealpixPixel::new(4, 191);
        let json = serde_json::to_string(&pixel).unwrap();
        let back: HealpixPixel = serde_json::from_str(&json).unwrap();
        assert_eq!(pixel, back);
    }
}
