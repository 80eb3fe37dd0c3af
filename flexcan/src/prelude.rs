//! Traits needed to use the driver through its `embedded-can` interface
pub use embedded_can::nb::Can as _;
pub use embedded_can::Frame as _;
