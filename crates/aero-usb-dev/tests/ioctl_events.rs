mod util;

use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use aero_usb_dev::{
    AccessMode, EventFilter, EventStatus, ReEnumState, UsbDevError, FIOASYNC, FIODTYPE, FIONBIO,
    TIOCSPGRP,
};
use util::{
    as_ctx, CountingWatcher, Rig, TestProc, BULK_EP, BUS, DEV, TEST_IOCTL_POST, TEST_IOCTL_PRE,
};

fn int(v: i32) -> [u8; 4] {
    v.to_ne_bytes()
}

#[test]
fn file_layer_ioctls() {
    let rig = Rig::new();
    let file = rig.open(BULK_EP, AccessMode::READ).unwrap();

    let mut data = int(7);
    file.ioctl(FIODTYPE, &mut data, &rig.ctx).unwrap();
    assert_eq!(data, int(0));

    file.ioctl(FIONBIO, &mut int(1), &rig.ctx).unwrap();
}

#[test]
fn async_target_receives_sigio() {
    let rig = Rig::new();
    let file = rig.open(BULK_EP, AccessMode::READ).unwrap();
    let rx = rig.rx_of(&file);

    file.ioctl(FIOASYNC, &mut int(1), &rig.ctx).unwrap();
    rx.put_data_linear(b"x", false);
    assert_eq!(rig.proc.sigio_count(), 1);

    let other = as_ctx(&TestProc::new(200, 200));
    assert_eq!(
        file.ioctl(FIOASYNC, &mut int(1), &other),
        Err(UsbDevError::Busy)
    );

    file.ioctl(TIOCSPGRP, &mut int(100), &rig.ctx).unwrap();
    assert_eq!(
        file.ioctl(TIOCSPGRP, &mut int(200), &rig.ctx),
        Err(UsbDevError::PermissionDenied)
    );

    file.ioctl(FIOASYNC, &mut int(0), &rig.ctx).unwrap();
    assert_eq!(
        file.ioctl(TIOCSPGRP, &mut int(100), &rig.ctx),
        Err(UsbDevError::InvalidArgument)
    );
    rx.put_data_linear(b"y", false);
    assert_eq!(rig.proc.sigio_count(), 1);
}

#[test]
fn close_notifies_the_async_target() {
    let rig = Rig::new();
    let file = rig.open(BULK_EP, AccessMode::READ).unwrap();
    file.ioctl(FIOASYNC, &mut int(1), &rig.ctx).unwrap();
    drop(file);
    assert_eq!(rig.proc.sigio_count(), 1);
}

#[test]
fn driver_hooks_see_unhandled_commands() {
    let rig = Rig::new();
    let file = rig.open(BULK_EP, AccessMode::READ).unwrap();

    let mut data = [0u8; 4];
    file.ioctl(TEST_IOCTL_PRE, &mut data, &rig.ctx).unwrap();
    assert_eq!(data[0], 1);

    file.ioctl(TEST_IOCTL_POST, &mut data, &rig.ctx).unwrap();
    assert_eq!(rig.driver.post_calls.load(Ordering::SeqCst), 1);

    assert_eq!(
        file.ioctl(0xdead, &mut data, &rig.ctx),
        Err(UsbDevError::NotSupported)
    );
    assert_eq!(rig.registry.device_refcount(BUS, DEV), Some(1));
}

#[test]
fn post_hook_waits_for_re_enumeration() {
    let rig = Arc::new(Rig::new());
    rig.driver.reenumerate_on_post.store(true, Ordering::SeqCst);
    let file = rig.open(BULK_EP, AccessMode::READ).unwrap();

    let finisher = {
        let rig = Arc::clone(&rig);
        thread::spawn(move || {
            while rig.device.re_enumerate_state() == ReEnumState::Done {
                thread::yield_now();
            }
            thread::sleep(Duration::from_millis(30));
            rig.device.set_re_enumerate_state(ReEnumState::Done);
        })
    };

    let start = Instant::now();
    file.ioctl(TEST_IOCTL_POST, &mut [0u8; 4], &rig.ctx).unwrap();
    assert!(start.elapsed() >= Duration::from_millis(30));
    finisher.join().unwrap();
    assert_eq!(rig.registry.device_refcount(BUS, DEV), Some(1));
}

#[test]
fn read_events_follow_the_used_queue() {
    let rig = Rig::new();
    let file = rig.open(BULK_EP, AccessMode::READ).unwrap();
    let rx = rig.rx_of(&file);
    let watcher = Arc::new(CountingWatcher::default());

    let reg = file.register_event(EventFilter::Read, watcher.clone()).unwrap();
    assert_eq!(reg.poll(), EventStatus::default());
    assert!(rig.driver.read_starts.load(Ordering::SeqCst) >= 1);

    rx.put_data_linear(b"ping", false);
    assert_eq!(watcher.hits(), 1);
    assert_eq!(
        reg.poll(),
        EventStatus {
            ready: true,
            error: false
        }
    );

    rx.put_data_error();
    assert_eq!(
        reg.poll(),
        EventStatus {
            ready: true,
            error: true
        }
    );
}

#[test]
fn write_events_follow_the_free_queue() {
    let rig = Rig::new();
    let file = rig.open(BULK_EP, AccessMode::WRITE).unwrap();
    let reg = file
        .register_event(EventFilter::Write, Arc::new(CountingWatcher::default()))
        .unwrap();
    assert!(reg.poll().ready);
}

#[test]
fn events_need_the_matching_access() {
    let rig = Rig::new();
    let file = rig.open(BULK_EP, AccessMode::READ).unwrap();
    assert_eq!(
        file.register_event(EventFilter::Write, Arc::new(CountingWatcher::default()))
            .unwrap_err(),
        UsbDevError::NotSupported
    );
}

#[test]
fn detached_registration_stops_notifying() {
    let rig = Rig::new();
    let file = rig.open(BULK_EP, AccessMode::READ).unwrap();
    let rx = rig.rx_of(&file);
    let watcher = Arc::new(CountingWatcher::default());

    let reg = file.register_event(EventFilter::Read, watcher.clone()).unwrap();
    reg.detach();
    rx.put_data_linear(b"ping", false);
    assert_eq!(watcher.hits(), 0);
}

#[test]
fn registration_outliving_its_handle_reports_an_error() {
    let rig = Rig::new();
    let file = rig.open(BULK_EP, AccessMode::READ).unwrap();
    let watcher = Arc::new(CountingWatcher::default());
    let reg = file.register_event(EventFilter::Read, watcher.clone()).unwrap();

    drop(file);
    // Closing wakes armed watchers once.
    assert_eq!(watcher.hits(), 1);
    assert!(reg.poll().error);
}
