//! Status code handling for native calls
//!
//! Every DYAD call returns a `dyad_rc_t`. `0` means success; anything else is
//! an opaque failure code owned by the service. This module turns codes into
//! typed errors without assigning meaning to specific values.

use super::abi::{DYAD_RC_OK, dyad_rc_t};
use crate::error::{Operation, StageError, StageResult};

/// Whether a status code signals failure
#[inline]
pub fn is_error(rc: dyad_rc_t) -> bool {
    rc != DYAD_RC_OK
}

/// Convert the status of `op` into a `Result`
///
/// Failures are logged at `warn` with the operation name and raw code.
pub fn check_status(op: Operation, rc: dyad_rc_t) -> StageResult<()> {
    if is_error(rc) {
        tracing::warn!("transfer-service {} returned status {}", op, rc);
        return Err(StageError::OperationFailed { op, status: rc });
    }
    Ok(())
}

/// Convert the status of an init call
pub fn check_init_status(rc: dyad_rc_t) -> StageResult<()> {
    if is_error(rc) {
        tracing::error!("transfer-service init returned status {}", rc);
        return Err(StageError::InitFailed { status: rc });
    }
    Ok(())
}
