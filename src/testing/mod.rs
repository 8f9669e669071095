//! Testing utilities
//!
//! In-process stand-ins for the capture layer and for peer transports, so whole
//! sessions can run without devices or network.

pub mod capture;
pub mod loopback;

pub use capture::SyntheticCapture;
pub use loopback::{LoopbackConnector, LoopbackNetwork, LoopbackPeer, OfferGate};
