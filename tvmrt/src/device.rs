//! Device validation and per-device completion queues.
//!
//! CPU work runs inline on the caller. Each `ExtDev` device gets one worker
//! thread that drains submitted jobs in FIFO order; `synchronize` blocks until
//! that worker has finished everything submitted so far. Workers live for the
//! rest of the process, so `ExtDev` ids are limited to `0..MAX_EXT_DEVICES`.

use std::collections::HashMap;
use std::panic::{self, AssertUnwindSafe};
use std::sync::mpsc::{self, Sender};
use std::sync::{Arc, Condvar, Mutex};
use std::thread;

use once_cell::sync::Lazy;

use crate::abi::{DLDevice, DeviceType};
use crate::error::{RuntimeError, RuntimeResult};

pub(crate) type Job = Box<dyn FnOnce() + Send + 'static>;

/// Count of outstanding operations with a wake-up when it drops to zero.
#[derive(Debug, Default)]
pub(crate) struct Pending {
    count: Mutex<usize>,
    idle: Condvar,
}

impl Pending {
    pub(crate) fn begin(&self) -> RuntimeResult<()> {
        let mut count = self
            .count
            .lock()
            .map_err(|_| RuntimeError::native("pending counter poisoned"))?;
        *count += 1;
        Ok(())
    }

    pub(crate) fn finish(&self) {
        if let Ok(mut count) = self.count.lock() {
            *count = count.saturating_sub(1);
            if *count == 0 {
                self.idle.notify_all();
            }
        }
    }

    pub(crate) fn wait(&self) -> RuntimeResult<()> {
        let count = self
            .count
            .lock()
            .map_err(|_| RuntimeError::native("pending counter poisoned"))?;
        let _idle = self
            .idle
            .wait_while(count, |count| *count > 0)
            .map_err(|_| RuntimeError::native("pending counter poisoned"))?;
        Ok(())
    }
}

struct DeviceQueue {
    sender: Mutex<Sender<Job>>,
    pending: Arc<Pending>,
}

/// Upper bound (exclusive) on `ExtDev` device ids, and so on worker threads.
pub const MAX_EXT_DEVICES: i32 = 64;

static QUEUES: Lazy<Mutex<HashMap<DLDevice, Arc<DeviceQueue>>>> =
    Lazy::new(|| Mutex::new(HashMap::new()));

pub(crate) fn validate(device: DLDevice) -> RuntimeResult<()> {
    if device.device_id < 0 {
        return Err(RuntimeError::invalid(format!(
            "device id must be non-negative, got {}",
            device.device_id
        )));
    }
    match device.device_type {
        t if t == DeviceType::Cpu as i32 => Ok(()),
        t if t == DeviceType::ExtDev as i32 => {
            if device.device_id >= MAX_EXT_DEVICES {
                return Err(RuntimeError::invalid(format!(
                    "device id {} out of range for ExtDev (max {})",
                    device.device_id,
                    MAX_EXT_DEVICES - 1
                )));
            }
            Ok(())
        }
        other => Err(RuntimeError::invalid(format!(
            "unsupported device type {}",
            other
        ))),
    }
}

pub(crate) fn is_async(device: DLDevice) -> bool {
    device.device_type == DeviceType::ExtDev as i32
}

fn spawn_queue(device: DLDevice) -> RuntimeResult<DeviceQueue> {
    let (sender, receiver) = mpsc::channel::<Job>();
    let pending = Arc::new(Pending::default());
    let worker_pending = pending.clone();
    thread::Builder::new()
        .name(format!(
            "tvmrt-dev{}-{}",
            device.device_type, device.device_id
        ))
        .spawn(move || {
            for job in receiver {
                if panic::catch_unwind(AssertUnwindSafe(job)).is_err() {
                    tracing::error!(?device, "device job panicked");
                }
                worker_pending.finish();
            }
        })
        .map_err(|err| RuntimeError::native(format!("failed to start device worker: {}", err)))?;
    tracing::debug!(?device, "device queue started");
    Ok(DeviceQueue {
        sender: Mutex::new(sender),
        pending,
    })
}

fn queue(device: DLDevice) -> RuntimeResult<Arc<DeviceQueue>> {
    let mut queues = QUEUES
        .lock()
        .map_err(|_| RuntimeError::native("device queues poisoned"))?;
    if let Some(queue) = queues.get(&device) {
        return Ok(queue.clone());
    }
    let queue = Arc::new(spawn_queue(device)?);
    queues.insert(device, queue.clone());
    Ok(queue)
}

/// Runs `job` on `device`. An `Err` means the job was dropped without running.
pub(crate) fn submit(device: DLDevice, job: Job) -> RuntimeResult<()> {
    validate(device)?;
    if !is_async(device) {
        job();
        return Ok(());
    }
    let queue = queue(device)?;
    queue.pending.begin()?;
    let sent = match queue.sender.lock() {
        Ok(sender) => sender.send(job).is_ok(),
        Err(_) => false,
    };
    if !sent {
        queue.pending.finish();
        return Err(RuntimeError::native("device worker is not running"));
    }
    Ok(())
}

pub(crate) fn synchronize(device: DLDevice) -> RuntimeResult<()> {
    validate(device)?;
    if !is_async(device) {
        return Ok(());
    }
    let queue = QUEUES
        .lock()
        .map_err(|_| RuntimeError::native("device queues poisoned"))?
        .get(&device)
        .cloned();
    match queue {
        Some(queue) => queue.pending.wait(),
        None => Ok(()),
    }
}
