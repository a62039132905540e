//! Metadata records of staged files
//!
//! The transfer service keeps, for every produced file, a record naming the
//! rank that owns it. [`MetadataHandle`] wraps such a record and releases it
//! exactly once, either through [`MetadataHandle::release`] or on drop.
//! [`RawMetadata`] is the unmanaged form, released only by handing it back to
//! [`crate::Context::free_metadata`].

use std::fmt;
use std::path::PathBuf;
use std::sync::{Arc, Weak};

use crate::context::Shared;
use crate::error::{Operation, StageResult, UsageError};
use crate::ffi::{MetadataRecord, ServiceApi, check_status};

/// Owned metadata record, released automatically
pub struct MetadataHandle {
    record: Option<MetadataRecord>,
    owner: Weak<Shared>,
    // Records stay valid after their context is finalized, so release goes
    // straight to the service (with a warning).
    service: Arc<dyn ServiceApi>,
}

impl fmt::Debug for MetadataHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MetadataHandle")
            .field("record", &self.record.as_ref().map(MetadataRecord::as_ptr))
            .field("released", &self.is_released())
            .finish()
    }
}

impl MetadataHandle {
    pub(crate) fn new(
        record: MetadataRecord,
        owner: Weak<Shared>,
        service: Arc<dyn ServiceApi>,
    ) -> Self {
        Self {
            record: Some(record),
            owner,
            service,
        }
    }

    pub(crate) fn is_owned_by(&self, shared: &Arc<Shared>) -> bool {
        std::ptr::eq(self.owner.as_ptr(), Arc::as_ptr(shared))
    }

    pub(crate) fn record(&self) -> Option<&MetadataRecord> {
        self.record.as_ref()
    }

    fn live_record(&self) -> Result<&MetadataRecord, UsageError> {
        self.record.as_ref().ok_or(UsageError::MetadataReleased)
    }

    /// Rank of the process that produced the file
    pub fn owner_rank(&self) -> StageResult<u32> {
        let record = self.live_record()?;
        // SAFETY: the record is held, so it has not been freed
        Ok(unsafe { record.owner_rank() })
    }

    /// Path the record describes, as stored by the service
    pub fn file_path(&self) -> StageResult<Option<PathBuf>> {
        let record = self.live_record()?;
        // SAFETY: the record is held, so it has not been freed
        Ok(unsafe { record.file_path() })
    }

    pub fn is_released(&self) -> bool {
        self.record.is_none()
    }

    /// Return the record to the service
    ///
    /// Releasing an already released handle does nothing.
    pub fn release(&mut self) -> StageResult<()> {
        let Some(record) = self.record.take() else {
            return Ok(());
        };

        let ptr = record.as_ptr();
        tracing::debug!("dyad_free_metadata {:p}", ptr);
        let rc = match self.owner.upgrade() {
            Some(shared) => {
                let state = shared.lock();
                if !state.is_connected() {
                    tracing::warn!(
                        "Releasing metadata record {:p} after its context was finalized",
                        ptr
                    );
                }
                self.service.free_metadata(record)
            }
            None => {
                tracing::warn!(
                    "Releasing metadata record {:p} after its context was dropped",
                    ptr
                );
                self.service.free_metadata(record)
            }
        };
        check_status(Operation::FreeMetadata, rc)
    }
}

impl Drop for MetadataHandle {
    fn drop(&mut self) {
        if let Err(e) = self.release() {
            tracing::error!("Failed to release metadata record on drop: {}", e);
        }
    }
}

/// Unmanaged metadata record
///
/// Dropping it does not release the record; pass it to
/// [`crate::Context::free_metadata`] instead.
#[derive(Debug)]
pub struct RawMetadata {
    record: MetadataRecord,
    owner: Weak<Shared>,
}

impl RawMetadata {
    pub(crate) fn new(record: MetadataRecord, owner: Weak<Shared>) -> Self {
        Self { record, owner }
    }

    pub(crate) fn is_owned_by(&self, shared: &Arc<Shared>) -> bool {
        std::ptr::eq(self.owner.as_ptr(), Arc::as_ptr(shared))
    }

    pub(crate) fn into_record(self) -> MetadataRecord {
        self.record
    }

    /// Underlying `dyad_metadata_t*`
    pub fn as_ptr(&self) -> *mut crate::ffi::abi::dyad_metadata_t {
        self.record.as_ptr()
    }

    /// # Safety
    ///
    /// The record must not have been freed by other means.
    pub unsafe fn owner_rank(&self) -> u32 {
        unsafe { self.record.owner_rank() }
    }

    /// # Safety
    ///
    /// The record must not have been freed by other means.
    pub unsafe fn file_path(&self) -> Option<PathBuf> {
        unsafe { self.record.file_path() }
    }
}
