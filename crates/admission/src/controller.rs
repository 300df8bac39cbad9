use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};

use crate::gate::Gate;
use crate::{AdmissionError, AdmissionLimits, OperationClass};

/// Concurrency gate shared by all calls of a server.
pub struct AdmissionController {
    upload: Gate,
    download: Gate,
    list: Gate,
}

impl AdmissionController {
    /// Creates a controller. Capacities of 0 are raised to 1.
    pub fn new(limits: AdmissionLimits) -> Arc<Self> {
        for class in OperationClass::ALL {
            if limits.capacity(class) == 0 {
                warn!(%class, "admission capacity of 0 is invalid, using 1");
            }
        }
        Arc::new(Self {
            upload: Gate::new(limits.upload),
            download: Gate::new(limits.download),
            list: Gate::new(limits.list),
        })
    }

    fn gate(&self, class: OperationClass) -> &Gate {
        match class {
            OperationClass::Upload => &self.upload,
            OperationClass::Download => &self.download,
            OperationClass::List => &self.list,
        }
    }

    /// Effective capacity of `class`.
    pub fn capacity(&self, class: OperationClass) -> usize {
        self.gate(class).capacity()
    }

    /// Number of currently admitted operations of `class`.
    pub fn in_flight(&self, class: OperationClass) -> usize {
        self.gate(class).in_flight()
    }

    /// Waits until `class` has a free slot or `cancel` fires.
    ///
    /// On cancellation returns [`AdmissionError::Exhausted`] and leaves the
    /// count unchanged.
    pub async fn acquire(
        self: &Arc<Self>,
        class: OperationClass,
        cancel: &CancellationToken,
    ) -> Result<AdmissionPermit, AdmissionError> {
        if !self.gate(class).admit(cancel).await {
            debug!(%class, "admission wait cancelled");
            return Err(AdmissionError::Exhausted(class));
        }
        debug!(%class, in_flight = self.in_flight(class), "operation admitted");
        Ok(AdmissionPermit {
            controller: Arc::clone(self),
            class,
            armed: true,
        })
    }

    /// Takes a slot without waiting.
    pub fn try_acquire(
        self: &Arc<Self>,
        class: OperationClass,
    ) -> Result<AdmissionPermit, AdmissionError> {
        if !self.gate(class).try_admit() {
            return Err(AdmissionError::Exhausted(class));
        }
        Ok(AdmissionPermit {
            controller: Arc::clone(self),
            class,
            armed: true,
        })
    }

    /// Returns one slot of `class`.
    ///
    /// Permits call this on drop; calling it directly is only needed for
    /// slots whose permit was [forgotten](AdmissionPermit::forget). A
    /// release with no matching acquire is refused and reported instead of
    /// driving the count below zero.
    pub fn release(&self, class: OperationClass) -> Result<(), AdmissionError> {
        if self.gate(class).release() {
            Ok(())
        } else {
            Err(AdmissionError::UnbalancedRelease(class))
        }
    }
}

/// A held admission slot. Dropping it returns the slot.
#[must_use = "the slot is released as soon as the permit is dropped"]
pub struct AdmissionPermit {
    controller: Arc<AdmissionController>,
    class: OperationClass,
    armed: bool,
}

impl AdmissionPermit {
    pub fn class(&self) -> OperationClass {
        self.class
    }

    /// Detaches the slot from this permit. The caller becomes responsible
    /// for a matching [`AdmissionController::release`].
    pub fn forget(mut self) {
        self.armed = false;
    }
}

impl std::fmt::Debug for AdmissionPermit {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AdmissionPermit")
            .field("class", &self.class)
            .finish()
    }
}

impl Drop for AdmissionPermit {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        if let Err(e) = self.controller.release(self.class) {
            error!(class = %self.class, "admission invariant violated: {e}");
        }
    }
}
