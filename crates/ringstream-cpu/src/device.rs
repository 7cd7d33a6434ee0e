//! CPU-simulated device.
//!
//! Every queue gets an engine thread that executes submitted operations in
//! strict FIFO order. Host callbacks reaching the head of a queue are posted
//! to the inbox of the listener subscribed to that queue; in blocking mode
//! the engine waits until the listener has run the callback before moving
//! on, which matches how accelerator runtimes deliver stream callbacks.

use std::cell::RefCell;
use std::collections::{HashMap, HashSet, VecDeque};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle, ThreadId};
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex, RwLock};
use tracing::{debug, error, info, warn};

use ringstream_core::device::{
    CallbackMode, ChannelId, DeviceBackend, DeviceContext, DeviceId, HostCallback, LaunchPolicy,
    ListenerId, QueueHandle,
};
use ringstream_core::error::{Result, StreamError};

use crate::config::SimDeviceConfig;

static NEXT_DEVICE_INSTANCE: AtomicU64 = AtomicU64::new(1);
static NEXT_QUEUE: AtomicU64 = AtomicU64::new(1);

thread_local! {
    /// Context bound on this thread, per simulated device instance.
    static BOUND_CONTEXT: RefCell<HashMap<u64, DeviceContext>> = RefCell::new(HashMap::new());
}

/// Switches for injecting device failures in tests.
#[derive(Debug, Default)]
pub struct SimFaults {
    set_device: AtomicBool,
    create_queue: AtomicBool,
    subscribe: AtomicBool,
    synchronize: AtomicBool,
    launch: AtomicBool,
}

impl SimFaults {
    /// Make `set_device` fail on every thread.
    pub fn fail_set_device(&self, fail: bool) {
        self.set_device.store(fail, Ordering::SeqCst);
    }

    /// Make `create_queue` fail.
    pub fn fail_create_queue(&self, fail: bool) {
        self.create_queue.store(fail, Ordering::SeqCst);
    }

    /// Make `subscribe` fail.
    pub fn fail_subscribe(&self, fail: bool) {
        self.subscribe.store(fail, Ordering::SeqCst);
    }

    /// Make `synchronize_queue` fail.
    pub fn fail_synchronize(&self, fail: bool) {
        self.synchronize.store(fail, Ordering::SeqCst);
    }

    /// Make `submit` and `launch_callback` fail.
    pub fn fail_launch(&self, fail: bool) {
        self.launch.store(fail, Ordering::SeqCst);
    }

    /// Clear every injected failure.
    pub fn reset(&self) {
        for flag in [
            &self.set_device,
            &self.create_queue,
            &self.subscribe,
            &self.synchronize,
            &self.launch,
        ] {
            flag.store(false, Ordering::SeqCst);
        }
    }

    fn check(flag: &AtomicBool, what: &str) -> Result<()> {
        if flag.load(Ordering::SeqCst) {
            Err(StreamError::Device(format!("injected {} failure", what)))
        } else {
            Ok(())
        }
    }
}

/// Counters describing simulated device activity.
#[derive(Debug, Clone, Default)]
pub struct SimDeviceStats {
    /// Live queues.
    pub queues: usize,
    /// Work items executed by queue engines.
    pub work_executed: u64,
    /// Callbacks run by listeners.
    pub callbacks_run: u64,
    /// Callbacks dropped because no listener was subscribed.
    pub callbacks_dropped: u64,
}

struct Completion {
    done: Mutex<bool>,
    cond: Condvar,
}

impl Completion {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            done: Mutex::new(false),
            cond: Condvar::new(),
        })
    }

    fn signal(&self) {
        *self.done.lock() = true;
        self.cond.notify_all();
    }
}

struct Delivery {
    callback: HostCallback,
    done: Arc<Completion>,
}

/// Callbacks waiting for one listener thread.
struct ListenerInbox {
    pending: Mutex<VecDeque<Delivery>>,
    ready: Condvar,
    subscriptions: AtomicUsize,
}

impl ListenerInbox {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            pending: Mutex::new(VecDeque::new()),
            ready: Condvar::new(),
            subscriptions: AtomicUsize::new(0),
        })
    }

    fn post(&self, delivery: Delivery) {
        self.pending.lock().push_back(delivery);
        self.ready.notify_one();
    }

    fn is_subscribed(&self) -> bool {
        self.subscriptions.load(Ordering::SeqCst) > 0
    }
}

enum QueueOp {
    Work(HostCallback),
    Callback(HostCallback, CallbackMode),
}

#[derive(Default)]
struct QueueState {
    ops: VecDeque<QueueOp>,
    submitted: u64,
    completed: u64,
    subscriber: Option<(ListenerId, Arc<ListenerInbox>)>,
    shutdown: bool,
}

struct SimQueue {
    handle: QueueHandle,
    device_id: DeviceId,
    policy: LaunchPolicy,
    state: Mutex<QueueState>,
    progress: Condvar,
    engine: Mutex<Option<JoinHandle<()>>>,
    engine_thread: Mutex<Option<ThreadId>>,
}

impl SimQueue {
    fn push(&self, op: QueueOp) -> Result<()> {
        let mut state = self.state.lock();
        if state.shutdown {
            return Err(StreamError::Device(format!(
                "queue {} is being destroyed",
                self.handle
            )));
        }
        state.ops.push_back(op);
        state.submitted += 1;
        self.progress.notify_all();
        Ok(())
    }
}

/// Shared state between the device handle and queue engines.
struct Shared {
    config: SimDeviceConfig,
    work_executed: AtomicU64,
    callbacks_run: AtomicU64,
    callbacks_dropped: AtomicU64,
}

/// In-process device that executes queues on host threads.
pub struct SimDevice {
    instance: u64,
    shared: Arc<Shared>,
    queues: RwLock<HashMap<QueueHandle, Arc<SimQueue>>>,
    inboxes: Mutex<HashMap<ListenerId, Arc<ListenerInbox>>>,
    channels: Mutex<HashSet<ChannelId>>,
    next_channel: AtomicU32,
    faults: SimFaults,
}

impl SimDevice {
    /// Create a simulated device with the given configuration.
    pub fn new(config: SimDeviceConfig) -> Self {
        info!(
            devices = config.device_count,
            channels = config.supports_channels,
            "Initializing simulated device"
        );
        Self {
            instance: NEXT_DEVICE_INSTANCE.fetch_add(1, Ordering::Relaxed),
            shared: Arc::new(Shared {
                config,
                work_executed: AtomicU64::new(0),
                callbacks_run: AtomicU64::new(0),
                callbacks_dropped: AtomicU64::new(0),
            }),
            queues: RwLock::new(HashMap::new()),
            inboxes: Mutex::new(HashMap::new()),
            channels: Mutex::new(HashSet::new()),
            next_channel: AtomicU32::new(0),
            faults: SimFaults::default(),
        }
    }

    /// Create a simulated device with default configuration.
    pub fn with_defaults() -> Self {
        Self::new(SimDeviceConfig::default())
    }

    /// Failure injection switches.
    pub fn faults(&self) -> &SimFaults {
        &self.faults
    }

    /// Configuration in use.
    pub fn config(&self) -> &SimDeviceConfig {
        &self.shared.config
    }

    /// Activity counters.
    pub fn stats(&self) -> SimDeviceStats {
        SimDeviceStats {
            queues: self.queues.read().len(),
            work_executed: self.shared.work_executed.load(Ordering::Relaxed),
            callbacks_run: self.shared.callbacks_run.load(Ordering::Relaxed),
            callbacks_dropped: self.shared.callbacks_dropped.load(Ordering::Relaxed),
        }
    }

    /// Whether `queue` is live.
    pub fn has_queue(&self, queue: QueueHandle) -> bool {
        self.queues.read().contains_key(&queue)
    }

    /// Launch policy `queue` was created with.
    pub fn queue_policy(&self, queue: QueueHandle) -> Option<LaunchPolicy> {
        self.queues.read().get(&queue).map(|q| q.policy)
    }

    /// Device `queue` was created on.
    pub fn queue_device(&self, queue: QueueHandle) -> Option<DeviceId> {
        self.queues.read().get(&queue).map(|q| q.device_id)
    }

    /// Number of live secondary channels.
    pub fn channel_count(&self) -> usize {
        self.channels.lock().len()
    }

    fn queue(&self, queue: QueueHandle) -> Result<Arc<SimQueue>> {
        self.queues
            .read()
            .get(&queue)
            .cloned()
            .ok_or_else(|| StreamError::Device(format!("unknown queue {}", queue)))
    }

    fn inbox(&self, listener: ListenerId) -> Arc<ListenerInbox> {
        Arc::clone(
            self.inboxes
                .lock()
                .entry(listener)
                .or_insert_with(ListenerInbox::new),
        )
    }

    fn shutdown_queue(queue: &SimQueue) {
        let discarded = {
            let mut state = queue.state.lock();
            state.shutdown = true;
            let discarded = state.ops.len();
            state.ops.clear();
            state.completed = state.submitted;
            queue.progress.notify_all();
            discarded
        };
        if discarded > 0 {
            warn!(queue = %queue.handle, discarded, "discarding pending operations");
        }

        let on_engine = *queue.engine_thread.lock() == Some(thread::current().id());
        if let Some(handle) = queue.engine.lock().take() {
            if on_engine {
                return;
            }
            if handle.join().is_err() {
                error!(queue = %queue.handle, "queue engine panicked");
            }
        }
    }
}

/// Engine loop: pop operations in order and execute them.
fn run_engine(queue: Arc<SimQueue>, shared: Arc<Shared>) {
    loop {
        let (op, subscriber) = {
            let mut state = queue.state.lock();
            loop {
                if state.shutdown {
                    return;
                }
                if let Some(op) = state.ops.pop_front() {
                    break (op, state.subscriber.clone());
                }
                queue.progress.wait(&mut state);
            }
        };

        if let Some(delay) = shared.config.execution_delay {
            thread::sleep(delay);
        }

        match op {
            QueueOp::Work(work) => {
                if catch_unwind(AssertUnwindSafe(work)).is_err() {
                    error!(queue = %queue.handle, "queued work panicked");
                }
                shared.work_executed.fetch_add(1, Ordering::Relaxed);
            }
            QueueOp::Callback(callback, mode) => match subscriber {
                Some((listener, inbox)) => {
                    let done = Completion::new();
                    inbox.post(Delivery {
                        callback,
                        done: Arc::clone(&done),
                    });
                    if mode == CallbackMode::Blocking {
                        wait_delivered(&queue, listener, &inbox, &done);
                    }
                }
                None => {
                    warn!(queue = %queue.handle, "no listener subscribed, callback dropped");
                    shared.callbacks_dropped.fetch_add(1, Ordering::Relaxed);
                    drop(callback);
                }
            },
        }

        let mut state = queue.state.lock();
        state.completed += 1;
        queue.progress.notify_all();
    }
}

fn wait_delivered(
    queue: &SimQueue,
    listener: ListenerId,
    inbox: &ListenerInbox,
    done: &Completion,
) {
    let mut finished = done.done.lock();
    while !*finished {
        if !inbox.is_subscribed() || queue.state.lock().shutdown {
            warn!(queue = %queue.handle, %listener, "listener went away before running callback");
            return;
        }
        done.cond.wait_for(&mut finished, Duration::from_millis(5));
    }
}

impl DeviceBackend for SimDevice {
    fn name(&self) -> &str {
        "sim"
    }

    fn device_count(&self) -> u32 {
        self.shared.config.device_count
    }

    fn set_device(&self, ctx: DeviceContext) -> Result<()> {
        SimFaults::check(&self.faults.set_device, "set_device")?;
        self.check_device_id(ctx.device_id)?;
        BOUND_CONTEXT.with(|b| b.borrow_mut().insert(self.instance, ctx));
        Ok(())
    }

    fn current_device(&self) -> Result<DeviceContext> {
        BOUND_CONTEXT
            .with(|b| b.borrow().get(&self.instance).copied())
            .ok_or_else(|| StreamError::Device("no device context bound to this thread".into()))
    }

    fn create_queue(&self, policy: LaunchPolicy) -> Result<QueueHandle> {
        SimFaults::check(&self.faults.create_queue, "create_queue")?;
        let ctx = self.current_device()?;
        let handle = QueueHandle::from_raw(NEXT_QUEUE.fetch_add(1, Ordering::Relaxed));

        let queue = Arc::new(SimQueue {
            handle,
            device_id: ctx.device_id,
            policy,
            state: Mutex::new(QueueState::default()),
            progress: Condvar::new(),
            engine: Mutex::new(None),
            engine_thread: Mutex::new(None),
        });

        let engine = {
            let queue = Arc::clone(&queue);
            let shared = Arc::clone(&self.shared);
            thread::Builder::new()
                .name(format!("sim-queue-{}", handle.as_raw()))
                .spawn(move || run_engine(queue, shared))
                .map_err(|e| StreamError::Device(format!("failed to start queue engine: {}", e)))?
        };
        *queue.engine_thread.lock() = Some(engine.thread().id());
        *queue.engine.lock() = Some(engine);

        self.queues.write().insert(handle, queue);
        debug!(%handle, device_id = ctx.device_id, ?policy, "created queue");
        Ok(handle)
    }

    fn destroy_queue(&self, queue: QueueHandle) -> Result<()> {
        let removed = self.queues.write().remove(&queue);
        let queue = removed.ok_or_else(|| StreamError::Device(format!("unknown queue {}", queue)))?;
        Self::shutdown_queue(&queue);
        debug!(queue = %queue.handle, "destroyed queue");
        Ok(())
    }

    fn synchronize_queue(&self, queue: QueueHandle) -> Result<()> {
        SimFaults::check(&self.faults.synchronize, "synchronize")?;
        let queue = self.queue(queue)?;
        let mut state = queue.state.lock();
        let target = state.submitted;
        while state.completed < target && !state.shutdown {
            queue.progress.wait(&mut state);
        }
        Ok(())
    }

    fn submit(&self, queue: QueueHandle, work: HostCallback) -> Result<()> {
        SimFaults::check(&self.faults.launch, "submit")?;
        self.queue(queue)?.push(QueueOp::Work(work))
    }

    fn launch_callback(
        &self,
        queue: QueueHandle,
        callback: HostCallback,
        mode: CallbackMode,
    ) -> Result<()> {
        SimFaults::check(&self.faults.launch, "launch_callback")?;
        let queue = self.queue(queue)?;
        if queue.state.lock().subscriber.is_none() {
            return Err(StreamError::Device(format!(
                "no listener subscribed to queue {}",
                queue.handle
            )));
        }
        queue.push(QueueOp::Callback(callback, mode))
    }

    fn subscribe(&self, listener: ListenerId, queue: QueueHandle) -> Result<()> {
        SimFaults::check(&self.faults.subscribe, "subscribe")?;
        let queue = self.queue(queue)?;
        let inbox = self.inbox(listener);
        let mut state = queue.state.lock();
        if let Some((current, _)) = &state.subscriber {
            return Err(StreamError::Device(format!(
                "queue {} is already subscribed by {}",
                queue.handle, current
            )));
        }
        inbox.subscriptions.fetch_add(1, Ordering::SeqCst);
        state.subscriber = Some((listener, inbox));
        debug!(queue = %queue.handle, %listener, "subscribed listener");
        Ok(())
    }

    fn unsubscribe(&self, listener: ListenerId, queue: QueueHandle) -> Result<()> {
        let queue = self.queue(queue)?;
        let mut state = queue.state.lock();
        match state.subscriber.take() {
            Some((current, inbox)) if current == listener => {
                if inbox.subscriptions.fetch_sub(1, Ordering::SeqCst) == 1 {
                    self.inboxes.lock().remove(&listener);
                }
                debug!(queue = %queue.handle, %listener, "unsubscribed listener");
                Ok(())
            }
            other => {
                state.subscriber = other;
                Err(StreamError::Device(format!(
                    "{} is not subscribed to queue {}",
                    listener, queue.handle
                )))
            }
        }
    }

    fn process_pending(&self, listener: ListenerId, timeout: Duration) -> Result<usize> {
        let inbox = self.inbox(listener);
        let deadline = Instant::now() + timeout;

        let batch: Vec<Delivery> = {
            let mut pending = inbox.pending.lock();
            while pending.is_empty() {
                if inbox.ready.wait_until(&mut pending, deadline).timed_out() {
                    break;
                }
            }
            pending.drain(..).collect()
        };

        let count = batch.len();
        for delivery in batch {
            if catch_unwind(AssertUnwindSafe(delivery.callback)).is_err() {
                error!(%listener, "host callback panicked");
            }
            self.shared.callbacks_run.fetch_add(1, Ordering::Relaxed);
            delivery.done.signal();
        }
        Ok(count)
    }

    fn supports_channels(&self) -> bool {
        self.shared.config.supports_channels
    }

    fn create_channel(&self, device: DeviceId) -> Result<ChannelId> {
        if !self.supports_channels() {
            return Err(StreamError::Device(format!(
                "channels are not supported on device {}",
                device
            )));
        }
        self.check_device_id(device)?;
        let channel = ChannelId(self.next_channel.fetch_add(1, Ordering::Relaxed));
        self.channels.lock().insert(channel);
        debug!(device_id = device, channel = channel.0, "created channel");
        Ok(channel)
    }

    fn destroy_channel(&self, channel: ChannelId) -> Result<()> {
        if self.channels.lock().remove(&channel) {
            Ok(())
        } else {
            Err(StreamError::Device(format!("unknown channel {}", channel.0)))
        }
    }
}

impl Drop for SimDevice {
    fn drop(&mut self) {
        let queues: Vec<_> = self.queues.get_mut().drain().map(|(_, q)| q).collect();
        for queue in queues {
            Self::shutdown_queue(&queue);
        }
    }
}
