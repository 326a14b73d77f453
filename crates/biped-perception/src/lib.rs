//! `biped-perception` – state estimation for the biped.
//!
//! # Modules
//!
//! - [`fusion`] – [`OrientationFilter`][fusion::OrientationFilter]:
//!   complementary filter that integrates the gyroscope and corrects roll and
//!   pitch drift against the accelerometer's gravity vector.

pub mod fusion;

pub use fusion::OrientationFilter;
