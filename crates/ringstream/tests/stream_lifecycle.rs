//! Integration tests for stream creation, async mode and teardown.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{mpsc, Arc};
use std::thread;
use std::time::Duration;

use parking_lot::Mutex;
use ringstream::prelude::*;
use ringstream::SimDeviceConfigBuilder;
use tracing_subscriber::EnvFilter;

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

fn runtime_with(device: Arc<SimDevice>) -> StreamRuntime {
    init_tracing();
    StreamRuntime::builder()
        .with_device(device)
        .with_config(RuntimeConfig::for_testing())
        .build()
}

fn runtime() -> (Arc<SimDevice>, StreamRuntime) {
    let device = Arc::new(SimDevice::with_defaults());
    (Arc::clone(&device), runtime_with(device))
}

/// Creating and destroying a stream leaves no listener running.
#[test]
fn test_create_destroy_leaves_no_listener() {
    let (device, runtime) = runtime();
    let stream = runtime
        .create_stream(0, LaunchPolicy::LaunchSync)
        .expect("Failed to create stream");
    assert_eq!(runtime.active_listeners(), 0);

    stream.start_async_mode().expect("Failed to start async mode");
    assert_eq!(stream.state(), StreamState::Listening);
    assert_eq!(runtime.active_listeners(), 1);

    let queue = stream.queue().expect("queue should be allocated");
    stream.destroy().expect("Failed to destroy stream");
    assert_eq!(stream.state(), StreamState::TornDown);
    assert_eq!(runtime.active_listeners(), 0);
    assert!(!device.has_queue(queue));
    assert_eq!(runtime.context().registry().status(queue), EntryStatus::Retired);
}

/// Starting async mode twice is rejected and keeps exactly one listener.
#[test]
fn test_double_start_is_repeat_init() {
    let (_device, runtime) = runtime();
    let stream = runtime
        .create_stream(0, LaunchPolicy::Default)
        .expect("Failed to create stream");

    stream.start_async_mode().expect("Failed to start async mode");
    let err = stream.start_async_mode().unwrap_err();
    assert!(matches!(err, StreamError::RepeatInit { .. }));
    assert_eq!(err.code(), ErrorCode::RepeatInit);
    assert_eq!(runtime.active_listeners(), 1);

    stream.destroy().expect("Failed to destroy stream");
}

/// Launching before async mode or after destroy fails immediately.
#[test]
fn test_launch_outside_async_mode_fails() {
    let (_device, runtime) = runtime();
    let stream = runtime
        .create_stream(0, LaunchPolicy::Default)
        .expect("Failed to create stream");

    assert!(stream.launch_callback(|| {}).is_err());

    stream.start_async_mode().expect("Failed to start async mode");
    stream.launch_callback(|| {}).expect("Failed to launch");
    stream.destroy().expect("Failed to destroy stream");

    assert!(matches!(
        stream.launch_callback(|| {}),
        Err(StreamError::InvalidPointer(_))
    ));
    assert!(matches!(
        stream.enqueue(|| {}),
        Err(StreamError::InvalidPointer(_))
    ));
    assert!(matches!(
        stream.start_async_mode(),
        Err(StreamError::InvalidPointer(_))
    ));
    stream.destroy().expect("Repeated destroy should succeed");
}

/// Callbacks run in launch order on the listener thread.
#[test]
fn test_callbacks_run_in_order_on_listener() {
    let (_device, runtime) = runtime();
    let stream = runtime
        .create_stream(0, LaunchPolicy::Default)
        .expect("Failed to create stream");
    stream.start_async_mode().expect("Failed to start async mode");

    let seen = Arc::new(Mutex::new(Vec::new()));
    let threads = Arc::new(Mutex::new(Vec::new()));
    for i in 0..10 {
        let seen = Arc::clone(&seen);
        let threads = Arc::clone(&threads);
        stream
            .launch_callback(move || {
                seen.lock().push(i);
                threads
                    .lock()
                    .push(thread::current().name().map(str::to_owned));
            })
            .expect("Failed to launch callback");
    }
    stream.synchronize().expect("Failed to synchronize");

    assert_eq!(*seen.lock(), (0..10).collect::<Vec<_>>());
    let name = runtime.config().listener_thread_name.clone();
    assert!(threads.lock().iter().all(|t| t.as_deref() == Some(name.as_str())));
}

/// Work and callbacks share one ordering.
#[test]
fn test_enqueue_and_callbacks_interleave() {
    let (_device, runtime) = runtime();
    let stream = runtime
        .create_stream(0, LaunchPolicy::Default)
        .expect("Failed to create stream");
    stream.start_async_mode().expect("Failed to start async mode");

    let log = Arc::new(Mutex::new(Vec::new()));
    for i in 0..3 {
        let work_log = Arc::clone(&log);
        stream
            .enqueue(move || work_log.lock().push(format!("work-{}", i)))
            .expect("Failed to enqueue");
        let cb_log = Arc::clone(&log);
        stream
            .launch_callback(move || cb_log.lock().push(format!("callback-{}", i)))
            .expect("Failed to launch callback");
    }
    stream.synchronize().expect("Failed to synchronize");

    assert_eq!(
        *log.lock(),
        vec!["work-0", "callback-0", "work-1", "callback-1", "work-2", "callback-2"]
    );
}

/// Callbacks launched from many threads all run.
#[test]
fn test_concurrent_launches() {
    let (_device, runtime) = runtime();
    let stream = Arc::new(
        runtime
            .create_stream(0, LaunchPolicy::Default)
            .expect("Failed to create stream"),
    );
    stream.start_async_mode().expect("Failed to start async mode");

    let counter = Arc::new(AtomicUsize::new(0));
    let handles: Vec<_> = (0..4)
        .map(|_| {
            let stream = Arc::clone(&stream);
            let counter = Arc::clone(&counter);
            thread::spawn(move || {
                for _ in 0..25 {
                    let counter = Arc::clone(&counter);
                    stream
                        .launch_callback(move || {
                            counter.fetch_add(1, Ordering::SeqCst);
                        })
                        .expect("Failed to launch callback");
                }
            })
        })
        .collect();
    for handle in handles {
        handle.join().expect("launcher thread panicked");
    }

    stream.synchronize().expect("Failed to synchronize");
    assert_eq!(counter.load(Ordering::SeqCst), 100);
    stream.destroy().expect("Failed to destroy stream");
    assert_eq!(runtime.active_listeners(), 0);
}

/// A listener that cannot bind its device context times out and is reclaimed.
#[test]
fn test_attach_timeout_reclaims_listener() {
    let device = Arc::new(SimDevice::with_defaults());
    let runtime = runtime_with(Arc::clone(&device));
    let stream = runtime
        .create_stream(0, LaunchPolicy::Default)
        .expect("Failed to create stream");

    device.faults().fail_set_device(true);
    let err = stream.start_async_mode().unwrap_err();
    assert!(matches!(err, StreamError::Timeout(_)));
    assert!(!stream.has_listener());
    assert_eq!(runtime.active_listeners(), 0);
    stream.set_error_code(err.code());
    assert_eq!(stream.error_codes().first, Some(ErrorCode::Timeout));

    device.faults().reset();
    stream
        .start_async_mode()
        .expect("Async mode should start once the device recovers");
    stream.launch_callback(|| {}).expect("Failed to launch");
    stream.destroy().expect("Failed to destroy stream");
}

/// A failed subscription leaves the stream without a listener.
#[test]
fn test_subscribe_failure() {
    let device = Arc::new(SimDevice::with_defaults());
    let runtime = runtime_with(Arc::clone(&device));
    let stream = runtime
        .create_stream(0, LaunchPolicy::Default)
        .expect("Failed to create stream");

    device.faults().fail_subscribe(true);
    assert!(matches!(
        stream.start_async_mode(),
        Err(StreamError::Device(_))
    ));
    assert_eq!(stream.state(), StreamState::Ready);
    assert_eq!(runtime.active_listeners(), 0);
}

/// Synchronization failures surface as `SyncFailed`.
#[test]
fn test_synchronize_failure() {
    let device = Arc::new(SimDevice::with_defaults());
    let runtime = runtime_with(Arc::clone(&device));
    let stream = runtime
        .create_stream(0, LaunchPolicy::Default)
        .expect("Failed to create stream");

    device.faults().fail_synchronize(true);
    let err = stream.synchronize().unwrap_err();
    assert!(matches!(err, StreamError::SyncFailed(_)));
    assert_eq!(err.code(), ErrorCode::SyncFailed);

    device.faults().reset();
    stream.synchronize().expect("Failed to synchronize");
}

/// Streams on different devices are independent.
#[test]
fn test_streams_on_multiple_devices() {
    let device = Arc::new(SimDevice::new(
        SimDeviceConfigBuilder::new().with_device_count(2).build(),
    ));
    let runtime = runtime_with(Arc::clone(&device));

    let a = runtime
        .create_stream(0, LaunchPolicy::FastLaunch)
        .expect("Failed to create stream on device 0");
    let b = runtime
        .create_stream(1, LaunchPolicy::FastSync)
        .expect("Failed to create stream on device 1");
    assert_ne!(a.queue(), b.queue());
    assert_eq!(b.device_id(), 1);

    assert!(matches!(
        runtime.create_stream(2, LaunchPolicy::Default),
        Err(StreamError::InitFailed(_))
    ));

    a.start_async_mode().expect("Failed to start async mode");
    b.start_async_mode().expect("Failed to start async mode");
    assert_eq!(runtime.active_listeners(), 2);
    a.destroy().expect("Failed to destroy stream");
    assert_eq!(runtime.active_listeners(), 1);
    assert!(b.launch_callback(|| {}).is_ok());
}

/// Secondary channels follow device support.
#[test]
fn test_channel_support() {
    let (device, runtime) = runtime();
    let stream = runtime
        .create_stream(0, LaunchPolicy::Default)
        .expect("Failed to create stream");
    let channel = stream.create_channel().expect("Failed to create channel");
    assert_eq!(stream.channel(), Some(channel));
    stream.destroy().expect("Failed to destroy stream");
    assert_eq!(device.channel_count(), 0);

    let no_channels = Arc::new(SimDevice::new(SimDeviceConfig {
        supports_channels: false,
        ..Default::default()
    }));
    let runtime = runtime_with(no_channels);
    let stream = runtime
        .create_stream(0, LaunchPolicy::Default)
        .expect("Failed to create stream");
    assert!(matches!(
        stream.create_channel(),
        Err(StreamError::InitFailed(_))
    ));
}

/// Raw launch entry point validates the function.
#[test]
fn test_launch_host_fn() {
    fn bump(counter: Arc<AtomicUsize>) {
        counter.fetch_add(1, Ordering::SeqCst);
    }

    let (_device, runtime) = runtime();
    let stream = runtime
        .create_stream(0, LaunchPolicy::Default)
        .expect("Failed to create stream");
    stream.start_async_mode().expect("Failed to start async mode");

    let counter = Arc::new(AtomicUsize::new(0));
    let func: Option<fn(Arc<AtomicUsize>)> = Some(bump);
    stream
        .launch_host_fn(func, Arc::clone(&counter))
        .expect("Failed to launch host fn");
    let err = stream
        .launch_host_fn(None, Arc::clone(&counter))
        .unwrap_err();
    assert_eq!(err.code(), ErrorCode::InvalidPointer);

    stream.synchronize().expect("Failed to synchronize");
    assert_eq!(counter.load(Ordering::SeqCst), 1);
}

/// Run `destroy` on a helper thread and report whether it returned in time.
fn destroy_within(stream: Arc<Stream>, limit: Duration) -> bool {
    let (tx, rx) = mpsc::channel();
    thread::spawn(move || {
        let result = stream.destroy();
        let _ = tx.send(result);
    });
    matches!(rx.recv_timeout(limit), Ok(Ok(())))
}

/// Work queued while another thread synchronizes still drains before teardown.
#[test]
fn test_destroy_after_concurrent_synchronize() {
    let (_device, runtime) = runtime();
    let stream = Arc::new(
        runtime
            .create_stream(0, LaunchPolicy::Default)
            .expect("Failed to create stream"),
    );
    stream.start_async_mode().expect("Failed to start async mode");

    let (first_tx, first_rx) = mpsc::channel::<()>();
    stream
        .enqueue(move || {
            let _ = first_rx.recv();
        })
        .expect("Failed to enqueue first gate");

    let syncer = {
        let stream = Arc::clone(&stream);
        thread::spawn(move || stream.synchronize())
    };
    thread::sleep(Duration::from_millis(50));

    let (second_tx, second_rx) = mpsc::channel::<()>();
    stream
        .enqueue(move || {
            let _ = second_rx.recv();
        })
        .expect("Failed to enqueue second gate");
    let ran = Arc::new(AtomicBool::new(false));
    {
        let ran = Arc::clone(&ran);
        stream
            .launch_callback(move || ran.store(true, Ordering::SeqCst))
            .expect("Failed to launch callback");
    }

    first_tx.send(()).expect("first gate dropped");
    syncer
        .join()
        .expect("synchronize thread panicked")
        .expect("Failed to synchronize");

    thread::spawn(move || {
        thread::sleep(Duration::from_millis(100));
        let _ = second_tx.send(());
    });

    assert!(destroy_within(Arc::clone(&stream), Duration::from_secs(5)));
    assert!(ran.load(Ordering::SeqCst));
    assert_eq!(runtime.active_listeners(), 0);
}

/// Launches racing a destroy either land before teardown or are rejected.
#[test]
fn test_launch_racing_destroy() {
    let (_device, runtime) = runtime();
    let stream = Arc::new(
        runtime
            .create_stream(0, LaunchPolicy::Default)
            .expect("Failed to create stream"),
    );
    stream.start_async_mode().expect("Failed to start async mode");

    let launched = Arc::new(AtomicUsize::new(0));
    let ran = Arc::new(AtomicUsize::new(0));
    let launcher = {
        let stream = Arc::clone(&stream);
        let launched = Arc::clone(&launched);
        let ran = Arc::clone(&ran);
        thread::spawn(move || loop {
            let ran = Arc::clone(&ran);
            match stream.launch_callback(move || {
                ran.fetch_add(1, Ordering::SeqCst);
            }) {
                Ok(()) => {
                    launched.fetch_add(1, Ordering::SeqCst);
                }
                Err(e) => return e,
            }
        })
    };
    thread::sleep(Duration::from_millis(20));

    assert!(destroy_within(Arc::clone(&stream), Duration::from_secs(5)));
    let err = launcher.join().expect("launcher thread panicked");
    assert!(matches!(err, StreamError::InvalidPointer(_)));
    assert_eq!(ran.load(Ordering::SeqCst), launched.load(Ordering::SeqCst));
    assert_eq!(runtime.active_listeners(), 0);
}

/// Starting async mode does not block readers of the stream.
#[test]
fn test_accessors_during_attach() {
    let device = Arc::new(SimDevice::with_defaults());
    let runtime = runtime_with(Arc::clone(&device));
    let stream = Arc::new(
        runtime
            .create_stream(0, LaunchPolicy::Default)
            .expect("Failed to create stream"),
    );

    device.faults().fail_set_device(true);
    let starter = {
        let stream = Arc::clone(&stream);
        thread::spawn(move || stream.start_async_mode())
    };
    for _ in 0..50 {
        assert!(stream.is_alive());
        assert!(stream.queue().is_some());
    }
    let result = starter.join().expect("starter thread panicked");
    assert!(matches!(result, Err(StreamError::Timeout(_))));
    device.faults().reset();
}

/// Every valid device and launch policy supports create, async mode and destroy.
#[test]
fn test_create_destroy_all_devices_and_policies() {
    let device = Arc::new(SimDevice::new(
        SimDeviceConfigBuilder::new().with_device_count(3).build(),
    ));
    let runtime = runtime_with(Arc::clone(&device));

    for device_id in 0..3 {
        for policy in LaunchPolicy::ALL {
            let stream = runtime
                .create_stream(device_id, policy)
                .expect("Failed to create stream");
            assert_eq!(stream.policy(), policy);
            stream.start_async_mode().expect("Failed to start async mode");
            stream.launch_callback(|| {}).expect("Failed to launch");
            stream.destroy().expect("Failed to destroy stream");
            assert_eq!(runtime.active_listeners(), 0);
        }
    }
    assert_eq!(device.stats().queues, 0);
}
