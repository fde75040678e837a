//! Script generation client.
//!
//! Sends a natural-language prompt to the generation endpoint and returns the shell script it produces.

mod generation;

pub use generation::{
    GenerationClient, GenerationError, GenerationRequest, GenerationResponse, ScriptGenerator,
};
