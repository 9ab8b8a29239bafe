//! fitview-hw — Camera capture for the measurement pipeline.
//!
//! Provides a V4L2-based [`Camera`] that delivers RGB frames and implements
//! [`fitview_core::FrameSource`].

pub mod camera;
pub mod frame;

pub use camera::{Camera, CameraError, DeviceInfo, PixelFormat};
pub use frame::FrameError;
