//! Command queues.

use std::{
    fmt,
    sync::{
        Arc,
        atomic::{AtomicUsize, Ordering},
    },
};

use tracing::debug;

use crate::{
    command_buffer::CommandBuffer,
    device::Device,
    error::{InvariantViolation, Result},
};

/// Produces command buffers for one device.
///
/// Command buffers committed from one thread execute in commit order. The
/// queue is `Sync`, so several threads may make and commit buffers through a
/// shared reference.
pub struct CommandQueue {
    device: Device,
    label: Option<String>,
    outstanding: Arc<AtomicUsize>,
}

impl fmt::Debug for CommandQueue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CommandQueue")
            .field("label", &self.label)
            .field("outstanding", &self.outstanding())
            .finish()
    }
}

impl CommandQueue {
    /// Makes a new command buffer in the `Recording` state.
    pub fn make_command_buffer(&self) -> CommandBuffer {
        self.outstanding.fetch_add(1, Ordering::AcqRel);
        CommandBuffer::new(self.device.clone(), self.label.clone(), self.outstanding.clone())
    }

    /// Command buffers from this queue that are recording or in flight.
    pub fn outstanding(&self) -> usize {
        self.outstanding.load(Ordering::Acquire)
    }

    /// Debug label.
    pub fn label(&self) -> Option<&str> {
        self.label.as_deref()
    }

    /// Owning device.
    pub fn device(&self) -> &Device {
        &self.device
    }

    /// Releases the queue. Fails while any of its command buffers is still
    /// recording or in flight.
    pub fn release(self) -> Result<()> {
        let pending = self.outstanding();
        if pending > 0 {
            return Err(InvariantViolation::QueueHasPendingWork { pending }.into());
        }
        debug!(label = ?self.label, "command queue released");
        Ok(())
    }
}

impl Device {
    /// Makes a command queue.
    pub fn make_command_queue(&self) -> CommandQueue {
        CommandQueue {
            device: self.clone(),
            label: None,
            outstanding: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Makes a command queue whose command buffers carry `label`.
    pub fn make_command_queue_with_label(&self, label: impl Into<String>) -> CommandQueue {
        CommandQueue {
            label: Some(label.into()),
            ..self.make_command_queue()
        }
    }
}

#[cfg(test)]
mod tests {
    use crate::{Error, InvariantViolation};

    #[test]
    fn release_waits_for_outstanding_buffers() {
        let Some(device) = crate::test_util::device_or_skip() else {
            return;
        };
        let queue = device.make_command_queue_with_label("work");
        assert_eq!(queue.label(), Some("work"));

        let mut first = queue.make_command_buffer();
        let second = queue.make_command_buffer();
        assert_eq!(first.label(), Some("work"));
        assert_eq!(queue.outstanding(), 2);

        second.discard().unwrap();
        first.commit().unwrap();
        first.wait_until_completed().unwrap();
        assert_eq!(queue.outstanding(), 0);
        first.release().unwrap();
        queue.release().unwrap();
    }

    #[test]
    fn release_with_pending_work_fails() {
        let Some(device) = crate::test_util::device_or_skip() else {
            return;
        };
        let queue = device.make_command_queue();
        let _recording = queue.make_command_buffer();
        assert_eq!(
            queue.release().unwrap_err(),
            Error::Invariant(InvariantViolation::QueueHasPendingWork { pending: 1 })
        );
    }
}
