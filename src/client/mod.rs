//! Client side of a call: the per-user controller and the media negotiation seam

pub mod controller;
pub mod negotiation;

pub use controller::{
    ClientSessionController, ControllerCommand, ControllerEvent, ControllerHandle,
    ControllerSettings, ControllerState,
};
pub use negotiation::{
    LocalDescription, MediaNegotiator, MockNegotiator, NegotiationBuffer, NegotiationLog,
};
