//! Session bookkeeping shared by both channel kinds

mod ice_buffer;
mod negotiation;
mod state;

pub use ice_buffer::IceCandidateBuffer;
pub use negotiation::{NegotiationAction, NegotiationCoordinator, NegotiationState};
pub use state::{
    InvalidTransition, SessionEvent, SessionState, SessionStateMachine, SessionVariant,
};
