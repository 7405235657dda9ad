use std::time::Duration;

pub trait Power: Send + Sync {
    /// Reboots the device. Does not return on hardware.
    fn restart(&self);

    /// Enters deep sleep with a timer wakeup. Does not return on hardware.
    fn deep_sleep(&self, duration: Duration);
}

/// The inactive boot slot.
pub trait ImageSlot: Send {
    /// Prepares the inactive slot for a new image of roughly `size_hint` bytes.
    fn begin(&mut self, size_hint: Option<u64>) -> anyhow::Result<Box<dyn ImageWriter + '_>>;

    /// Whether the running image is a freshly activated update still waiting
    /// for confirmation. `false` once the bootloader has rolled back.
    fn running_pending_verify(&mut self) -> anyhow::Result<bool>;

    /// Cancels bootloader rollback for the image that is running now.
    fn mark_running_valid(&mut self) -> anyhow::Result<()>;
}

/// An image being written into the inactive slot.
///
/// Dropping a writer that was never activated discards the partial image and
/// leaves the boot pointer where it was.
pub trait ImageWriter {
    fn write(&mut self, chunk: &[u8]) -> anyhow::Result<()>;

    /// Closes the image and lets the platform validate it.
    fn finalize(&mut self) -> anyhow::Result<()>;

    /// Points the bootloader at the finalized image.
    fn activate(self: Box<Self>) -> anyhow::Result<()>;
}
