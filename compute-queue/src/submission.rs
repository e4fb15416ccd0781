//! The per-device completion worker.
//!
//! Commits hand a [`Retirement`] to the worker over a channel, in submission
//! order. The worker blocks on each native submission in turn, copies kernel
//! writes back into host-visible buffers, drops the in-flight marks and the
//! queue's outstanding count, and finally resolves the command buffer's
//! completion signal. Handlers registered on the signal run on this thread.

use std::{
    io,
    sync::{
        Arc, mpsc,
        atomic::{AtomicUsize, Ordering},
    },
    thread,
};

use parking_lot::Mutex;
use tracing::{debug, trace, warn};

use crate::{
    buffer::BufferShared,
    command_buffer::TouchedBuffer,
    completion::{CompletionSignal, CompletionStatus},
    error::ExecutionError,
};

/// A staging copy of a host-visible buffer the kernel wrote.
pub(crate) struct Readback {
    pub(crate) staging: wgpu::Buffer,
    pub(crate) target: Arc<BufferShared>,
}

/// Everything needed to finish one committed command buffer.
pub(crate) struct Retirement {
    /// `None` when nothing reached the device.
    pub(crate) submission: Option<wgpu::SubmissionIndex>,
    pub(crate) readbacks: Vec<Readback>,
    pub(crate) touched: Vec<TouchedBuffer>,
    /// Failure detected before the device ran the work.
    pub(crate) failure: Option<ExecutionError>,
    pub(crate) signal: CompletionSignal,
    pub(crate) outstanding: Arc<AtomicUsize>,
}

enum Message {
    Retire(Box<Retirement>),
}

pub(crate) struct CompletionWorker {
    sender: mpsc::Sender<Message>,
    device: Arc<wgpu::Device>,
    lost: Arc<Mutex<Option<String>>>,
}

impl CompletionWorker {
    pub(crate) fn spawn(
        device_id: u64,
        device: Arc<wgpu::Device>,
        lost: Arc<Mutex<Option<String>>>,
    ) -> io::Result<Self> {
        let (sender, receiver) = mpsc::channel::<Message>();
        {
            let device = device.clone();
            let lost = lost.clone();
            thread::Builder::new()
                .name(format!("compute-queue-completion-{device_id}"))
                .spawn(move || worker_loop(&device, &lost, receiver))?;
        }
        Ok(Self {
            sender,
            device,
            lost,
        })
    }

    /// Queues a retirement. If the worker is gone, retires on the caller.
    pub(crate) fn send(&self, retirement: Retirement) {
        if let Err(mpsc::SendError(Message::Retire(retirement))) =
            self.sender.send(Message::Retire(Box::new(retirement)))
        {
            warn!("completion worker stopped; retiring on the committing thread");
            retire(&self.device, &self.lost, *retirement);
        }
    }
}

fn worker_loop(
    device: &wgpu::Device,
    lost: &Mutex<Option<String>>,
    receiver: mpsc::Receiver<Message>,
) {
    for msg in receiver {
        match msg {
            Message::Retire(retirement) => retire(device, lost, *retirement),
        }
    }
    debug!("completion worker exiting");
}

fn retire(device: &wgpu::Device, lost: &Mutex<Option<String>>, retirement: Retirement) {
    let Retirement {
        submission,
        readbacks,
        touched,
        failure,
        signal,
        outstanding,
    } = retirement;

    let mut status: CompletionStatus = failure.map_or(Ok(()), Err);
    if let Some(submission) = submission
        && let Err(err) = device.poll(wgpu::PollType::Wait {
            submission_index: Some(submission),
            timeout: None,
        })
        && status.is_ok()
    {
        status = Err(ExecutionError::Rejected {
            message: err.to_string(),
        });
    }
    if status.is_ok() {
        status = read_back(device, &readbacks);
    }
    if status.is_ok()
        && let Some(message) = lost.lock().clone()
    {
        status = Err(ExecutionError::DeviceLost { message });
    }

    for (buffer, writes) in &touched {
        buffer.retire(*writes);
    }
    outstanding.fetch_sub(1, Ordering::AcqRel);

    match &status {
        Ok(()) => trace!(readbacks = readbacks.len(), "command buffer completed"),
        Err(err) => warn!("command buffer failed: {err}"),
    }
    signal.complete(status);
}

fn read_back(device: &wgpu::Device, readbacks: &[Readback]) -> CompletionStatus {
    if readbacks.is_empty() {
        return Ok(());
    }
    let readback_error = |message: String| ExecutionError::Readback { message };

    let (sender, receiver) = mpsc::channel();
    for (index, readback) in readbacks.iter().enumerate() {
        let sender = sender.clone();
        readback
            .staging
            .slice(..)
            .map_async(wgpu::MapMode::Read, move |result| {
                let _ = sender.send((index, result));
            });
    }
    drop(sender);

    device
        .poll(wgpu::PollType::Wait {
            submission_index: None,
            timeout: None,
        })
        .map_err(|e| readback_error(e.to_string()))?;

    let mut mapped = vec![false; readbacks.len()];
    for (index, result) in receiver.try_iter() {
        result.map_err(|e| readback_error(e.to_string()))?;
        mapped[index] = true;
    }
    if let Some(index) = mapped.iter().position(|done| !done) {
        return Err(readback_error(format!(
            "staging buffer {index} was not mapped after the device went idle"
        )));
    }

    for readback in readbacks {
        let slice = readback.staging.slice(..);
        let view = slice.get_mapped_range();
        readback.target.store_readback(&view);
        drop(view);
        readback.staging.unmap();
    }
    Ok(())
}
