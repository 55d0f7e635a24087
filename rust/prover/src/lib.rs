//! Client side of the Zylith proving service.

mod circuit;
mod error;
mod http;
mod inputs;
mod response;

pub use crate::circuit::{
    Circuit, LP_PUBLIC_INPUTS, MIN_PROOF_ELEMENTS, SWAP_PUBLIC_INPUTS, WITHDRAW_PUBLIC_INPUTS,
};
pub use crate::error::ProverError;
pub use crate::http::{prover_timeout, HttpProver, ProverService};
pub use crate::inputs::{felt_to_decimal, InputValue, ProofInputs, ProofRequest};
pub use crate::response::ProofResponse;
