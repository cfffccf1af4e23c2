//! Coordinate conversion.

mod twd97;

pub use self::twd97::{twd97_to_wgs84, Twd97, Wgs84};
