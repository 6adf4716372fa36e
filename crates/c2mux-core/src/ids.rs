//! Unpredictable identifiers for correlation and tasking.
//!
//! Correlation IDs must not be guessable by another operator or agent, so
//! they come from the system CSPRNG rather than a counter.

use crate::error::{MuxError, MuxResult};
use ring::rand::{SecureRandom, SystemRandom};

/// Number of random bytes in a generated ID (128 bits).
pub const ID_BYTES: usize = 16;

/// Generate a random hex ID (16 bytes = 32 hex chars).
pub fn generate_id() -> MuxResult<String> {
    let rng = SystemRandom::new();
    let mut bytes = [0u8; ID_BYTES];
    rng.fill(&mut bytes)
        .map_err(|_| MuxError::Other("system RNG failure".into()))?;
    Ok(hex::encode(bytes))
}

/// Generate a fresh correlation ID for an outbound request.
pub fn correlation_id() -> MuxResult<String> {
    generate_id()
}

/// Generate a beacon task ID.
pub fn task_id() -> MuxResult<String> {
    generate_id()
}
